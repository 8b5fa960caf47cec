//! Terminal output and logging setup.

pub mod formatter;
pub mod logger;
