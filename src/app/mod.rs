//! Application layer - environment-sourced configuration for the hub.

mod config;

pub use config::{Credentials, HubSettings, LogLevel};
