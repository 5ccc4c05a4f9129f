pub mod app;
pub mod backoff;
pub mod broker;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod monitor;
pub mod registry;
pub mod router;
pub mod routes;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod worker_pool;
pub mod worker_processing;
pub mod worker_scheduler;

pub use error::{DispatchError, Result};
