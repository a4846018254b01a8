//! CLI subcommands.

pub mod ingest;
pub mod status;
