pub mod client;
pub mod config;
pub mod ingest;
pub mod migrate;
pub mod reconcile;
pub mod runtime;
pub mod store;
