pub mod database;
pub mod worker_client;

pub use database::*;
pub use worker_client::HttpWorkerClient;
