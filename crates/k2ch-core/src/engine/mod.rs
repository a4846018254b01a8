//! Pipeline orchestration.

mod ingestion;

pub use ingestion::{IngestionEngine, RunSummary};
