pub mod config;
pub mod connectors;
pub mod core;
pub mod errors;
pub mod indicators;
pub mod strategies;
pub mod types;
pub mod utils;
