pub mod banner;
pub mod cleanup;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod supervisor;
pub mod tasks;
