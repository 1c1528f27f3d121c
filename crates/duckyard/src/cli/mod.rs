//! CLI command implementations

pub mod analysis;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod file;
pub mod folder;
pub mod output;
pub mod query;
pub mod source;
