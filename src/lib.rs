pub mod aggregate;
pub mod api;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod page_store;
pub mod retry;
pub mod scoring;
pub mod server;
pub mod source;
pub mod worker;
