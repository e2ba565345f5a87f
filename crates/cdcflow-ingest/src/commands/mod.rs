//! CLI command implementations

pub mod run;
pub mod show_config;
