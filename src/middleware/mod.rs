//! Building blocks used by the request pipeline.
//!
//! - **Rate Limiting**: fixed-window counters per key, swept periodically
//! - **Authentication**: bearer identity resolution and constant-time
//!   internal-secret checks with brute-force throttling
//! - **Client IP**: forwarding-header extraction with trusted proxy validation
//!
//! The stages themselves are sequenced by [`crate::pipeline`].
//!
//! # Security Considerations
//!
//! - Internal secret comparison uses constant-time equality to prevent timing attacks
//! - Repeated internal-secret failures from one IP are blocked
//! - Trusted proxy configuration mitigates IP spoofing attacks

pub mod auth;
pub mod ip;
pub mod rate_limit;

pub use auth::{
    AuthMode, Authenticator, BoxFuture, INTERNAL_USER_ID, IdentityResolver, StaticTokenResolver,
    parse_bearer,
};
pub use ip::{CidrRange, TrustedProxyConfig, UNKNOWN_IP, extract_client_ip};
pub use rate_limit::{RateLimitDecision, RateLimitEntry, RateLimiter};
