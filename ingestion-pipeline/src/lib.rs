#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod handler;
pub mod pipeline;

pub use handler::IngestionJobHandler;
pub use pipeline::{IngestionConfig, IngestionPipeline, IngestionStats};
