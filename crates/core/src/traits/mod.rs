pub mod repository;
pub mod trigger;
pub mod worker_client;

pub use repository::{ExecLogStore, MetadataStore};
pub use trigger::TriggerResolver;
pub use worker_client::WorkerClient;
