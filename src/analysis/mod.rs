//! Result aggregation and statistics.

pub mod aggregator;

pub use aggregator::*;
