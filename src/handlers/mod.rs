//! Business handlers mounted behind the request pipeline.
//!
//! Each handler takes the shared [`AppState`](crate::state::AppState) and the
//! [`HandlerContext`](crate::pipeline::HandlerContext) built by the pipeline,
//! and returns a serializable value or an [`AppError`](crate::error::AppError).

mod analysis;
mod health;
mod insights;
mod internal;

pub use analysis::analyze;
pub use health::health_check;
pub use insights::insights;
pub use internal::stats;
