pub mod cache;
pub mod config;
pub mod embedding;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod rerank;
pub mod search;
pub mod store;
