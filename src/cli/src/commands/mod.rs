//! CLI subcommands.

pub mod cancel;
pub mod enqueue;
pub mod migrate;
pub mod report;
