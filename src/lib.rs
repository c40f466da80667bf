//! # labctl
//!
//! Command-line control of laboratory instruments. Devices are declared in
//! a hardware TOML file (see `config/hardware.example.toml`) and driven
//! through the feats and actions each driver exposes.
//!
//! - **`cli`**: argument parsing and command execution
//! - **`config`**: application settings loaded with figment
//! - **`logging`**: tracing subscriber setup

pub mod cli;
pub mod config;
pub mod logging;

pub use cli::{run, Cli, Command};
pub use config::AppConfig;
