//! Business services called by handlers.

mod analyzer;

pub use analyzer::{TextAnalyzer, analyze_text};
