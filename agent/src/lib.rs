pub mod config;
pub mod error;
pub mod exporter;
pub mod metadata;
pub mod poller;
