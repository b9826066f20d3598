pub mod config;
pub mod coordinator;
pub mod error;
pub mod ingest;
pub mod partition;
pub mod remote;
pub mod report;
pub mod shutdown;
