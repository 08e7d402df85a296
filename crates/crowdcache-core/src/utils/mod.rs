//! Utility functions for display formatting.

pub mod format;

// Re-export commonly used functions at module level
pub use format::{age_display, format_percent, format_population_range, truncate_string};
