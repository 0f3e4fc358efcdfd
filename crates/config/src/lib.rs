//! Configuration for the UHD downscaler
//!
//! Handles loading configuration from TOML files, environment variable overrides and validation.

pub mod config;

pub use config::*;
