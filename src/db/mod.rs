pub mod store;

pub use store::{ApiCostRecord, ComparisonSummary, SqliteCache, Store};
