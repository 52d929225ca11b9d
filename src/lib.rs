//! Cirrus: horizontally partitioned k-NN vector database over object storage.

pub mod changes;
pub mod config;
pub mod error;
pub mod index;
pub mod infrastructure;
pub mod metrics;
pub mod orchestrator;
pub mod partition;
pub mod server;
pub mod snapshot;
pub mod startup;
pub mod storage;
pub mod types;
pub mod worker;
