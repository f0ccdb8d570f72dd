//! LIFE SCORE consensus engine.
//!
//! Compares legal and lived freedom between two cities across a catalog of
//! 100 metrics. Several LLM providers estimate each metric independently;
//! their scores are aggregated into a per-metric consensus, rolled up through
//! category weights into a city total, and handed to a judge synthesis step
//! for a narrative verdict. The numeric winner is always computed
//! deterministically; the narrative never overrides it.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod consensus;
pub mod db;
pub mod engine;
pub mod export;
pub mod judge;
pub mod monitoring;
pub mod provider;
