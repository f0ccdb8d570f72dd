pub mod aggregator;
pub mod models;
pub mod rollup;
