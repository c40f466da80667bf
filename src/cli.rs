//! Command-line interface.
//!
//! ```bash
//! labctl drivers
//! labctl --config bench.toml devices
//! labctl feats lockin
//! labctl get lockin sensitivity
//! labctl set laser power_setpoint "25 mW"
//! labctl set dg645 delay '{"reference": "T0", "seconds": 1e-6}' --key A
//! labctl call scope waveform '{"channel": 1}'
//! labctl read power_meter
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lab_core::{FeatInfo, FeatKind, Instrument};
use lab_hardware::{DeviceRegistry, HardwareConfig};
use serde::Serialize;
use serde_json::Value;

use crate::config::{AppConfig, DEFAULT_APP_CONFIG};
use crate::logging::{self, LogFormat};

/// Top-level arguments.
#[derive(Debug, Parser)]
#[command(name = "labctl", version)]
#[command(about = "Control laboratory instruments from the command line", long_about = None)]
pub struct Cli {
    /// Hardware config file (overrides the app config)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Application config file
    #[arg(long, global = true, default_value = DEFAULT_APP_CONFIG)]
    pub app_config: PathBuf,

    /// trace, debug, info, warn or error (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log format
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Shorthand for `--log-format json`
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// List available driver types
    Drivers,

    /// List devices in the hardware config
    Devices,

    /// Describe a device's feats and actions
    Feats {
        /// Device id
        device: String,
    },

    /// Read a feat
    Get {
        /// Device id
        device: String,
        /// Feat name
        feat: String,
        /// Key for a keyed feat
        #[arg(long)]
        key: Option<String>,
    },

    /// Write a feat
    Set {
        /// Device id
        device: String,
        /// Feat name
        feat: String,
        /// JSON value, or a bare string such as `ON` or `25 mW`
        value: String,
        /// Key for a keyed feat
        #[arg(long)]
        key: Option<String>,
    },

    /// Invoke an action
    Call {
        /// Device id
        device: String,
        /// Action name
        action: String,
        /// JSON arguments
        args: Option<String>,
    },

    /// Take a reading from a Readable device
    Read {
        /// Device id
        device: String,
    },

    /// Read every readable scalar feat
    Snapshot {
        /// Device id
        device: String,
    },
}

/// Interpret a command-line value: JSON if it parses, otherwise a string.
pub fn parse_value(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

impl Cli {
    fn app_config(&self) -> Result<AppConfig> {
        let mut config = AppConfig::load_from(&self.app_config)
            .with_context(|| format!("Failed to load {}", self.app_config.display()))?;
        if let Some(path) = &self.config {
            config.hardware_config = path.clone();
        }
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
        if let Some(format) = self.log_format {
            config.log.format = format;
        }
        if self.json_logs {
            config.log.format = LogFormat::Json;
        }
        Ok(config)
    }
}

/// Run a parsed command line.
pub async fn run(cli: Cli) -> Result<()> {
    let config = cli.app_config()?;
    logging::init(config.logging()?)?;
    tracing::debug!(?config, "Configuration loaded");

    let out = Output { json: cli.json };
    match &cli.command {
        Command::Drivers => {
            let registry = DeviceRegistry::with_default_factories();
            let drivers = registry.drivers();
            out.print(&drivers, || {
                drivers
                    .iter()
                    .map(|d| {
                        let caps: Vec<_> = d.capabilities.iter().map(|c| c.name()).collect();
                        format!("{:<18} {:<44} {}", d.driver_type, d.name, caps.join(", "))
                    })
                    .collect()
            })
        }
        Command::Devices => {
            let hardware = load_hardware(&config)?;
            out.print(&hardware.devices, || {
                hardware
                    .devices
                    .iter()
                    .map(|d| {
                        let state = if d.enabled { "" } else { " (disabled)" };
                        format!("{:<18} {:<16} {}{state}", d.id, d.driver, d.display_name())
                    })
                    .collect()
            })
        }
        command => {
            let hardware = load_hardware(&config)?;
            let id = device_id(command);
            let mut session = Session::open(&hardware, id).await?;
            let outcome = session.execute(command, &out).await;
            let closed = session.registry.shutdown().await;
            outcome.and(closed)
        }
    }
}

fn load_hardware(config: &AppConfig) -> Result<HardwareConfig> {
    HardwareConfig::load(&config.hardware_config).with_context(|| {
        format!(
            "Failed to load hardware config {}",
            config.hardware_config.display()
        )
    })
}

fn device_id(command: &Command) -> &str {
    match command {
        Command::Feats { device }
        | Command::Get { device, .. }
        | Command::Set { device, .. }
        | Command::Call { device, .. }
        | Command::Read { device }
        | Command::Snapshot { device } => device,
        Command::Drivers | Command::Devices => "",
    }
}

/// One device brought up for the duration of a command.
struct Session {
    registry: DeviceRegistry,
    id: String,
    instrument: Arc<dyn Instrument>,
}

impl Session {
    async fn open(hardware: &HardwareConfig, id: &str) -> Result<Self> {
        let device = hardware
            .devices
            .iter()
            .find(|d| d.id == id)
            .with_context(|| format!("No device '{id}' in hardware config"))?;
        let mut registry = DeviceRegistry::with_default_factories();
        registry
            .register(device.clone())
            .await
            .with_context(|| format!("Failed to open device '{id}'"))?;
        let instrument = registry
            .get_instrument(id)
            .with_context(|| format!("Device '{id}' has no instrument"))?;
        Ok(Self {
            registry,
            id: id.to_string(),
            instrument,
        })
    }

    async fn execute(&self, command: &Command, out: &Output) -> Result<()> {
        let feats = self.instrument.feats();
        match command {
            Command::Feats { .. } => {
                let info = feats.describe();
                out.print(&info, || info.iter().map(describe_line).collect())
            }
            Command::Get { feat, key, .. } => {
                let value = feats.get_json(feat, key.as_deref()).await?;
                out.value(&value)
            }
            Command::Set {
                feat, key, value, ..
            } => {
                feats.set_json(feat, key.as_deref(), parse_value(value)).await?;
                tracing::info!(device = %self.id, feat = %feat, "Set");
                Ok(())
            }
            Command::Call { action, args, .. } => {
                let args = args.as_deref().map(parse_value).unwrap_or(Value::Null);
                let reply = feats.call(action, args).await?;
                if reply.is_null() {
                    Ok(())
                } else {
                    out.value(&reply)
                }
            }
            Command::Read { .. } => {
                let readable = self
                    .registry
                    .get_readable(&self.id)
                    .with_context(|| format!("Device '{}' is not Readable", self.id))?;
                let value = readable.read().await?;
                let unit = readable.unit().unwrap_or("");
                out.print(
                    &serde_json::json!({ "value": value, "unit": unit }),
                    || vec![format!("{value} {unit}").trim_end().to_string()],
                )
            }
            Command::Snapshot { .. } => {
                let snapshot = feats.snapshot().await;
                out.print(&snapshot, || {
                    snapshot
                        .iter()
                        .map(|(name, value)| format!("{name:<24} {value}"))
                        .collect()
                })
            }
            Command::Drivers | Command::Devices => Ok(()),
        }
    }
}

fn describe_line(info: &FeatInfo) -> String {
    let spec = &info.spec;
    let kind = match info.kind {
        FeatKind::Feat => "feat",
        FeatKind::DictFeat => "dict",
        FeatKind::Action => "action",
    };
    let access = match (spec.readable, spec.writable) {
        (true, true) => "rw",
        (true, false) => "r",
        (false, true) => "w",
        (false, false) => "",
    };
    let mut detail = Vec::new();
    if let Some(unit) = &spec.unit {
        detail.push(format!("[{unit}]"));
    }
    if let Some(limits) = &spec.limits {
        detail.push(format!("{}..{}", limits.min, limits.max));
    }
    if !spec.choices.is_empty() {
        detail.push(format!("{{{}}}", spec.choices.join("|")));
    }
    if let Some(keys) = &info.keys {
        detail.push(format!("keys: {}", keys.join(",")));
    }
    if let Some(description) = &spec.description {
        detail.push(description.clone());
    }
    format!("{kind:<6} {:<24} {access:<2} {}", spec.name, detail.join("  "))
}

struct Output {
    json: bool,
}

impl Output {
    fn print<T: Serialize>(&self, data: &T, lines: impl FnOnce() -> Vec<String>) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(data)?);
        } else {
            for line in lines() {
                println!("{line}");
            }
        }
        Ok(())
    }

    fn value(&self, value: &Value) -> Result<()> {
        match value {
            Value::String(s) if !self.json => println!("{s}"),
            _ if self.json => println!("{}", serde_json::to_string_pretty(value)?),
            _ => println!("{value}"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("1.5"), serde_json::json!(1.5));
        assert_eq!(parse_value("true"), Value::Bool(true));
        assert_eq!(parse_value("{\"channel\": 2}"), serde_json::json!({"channel": 2}));
        assert_eq!(parse_value("25 mW"), Value::String("25 mW".into()));
        assert_eq!(parse_value("sine"), Value::String("sine".into()));
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "labctl", "--config", "bench.toml", "set", "dg645", "delay", "1e-6", "--key", "A",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("bench.toml")));
        match cli.command {
            Command::Set {
                device, feat, value, key,
            } => {
                assert_eq!(device, "dg645");
                assert_eq!(feat, "delay");
                assert_eq!(value, "1e-6");
                assert_eq!(key.as_deref(), Some("A"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_flags_override_app_config() {
        let cli = Cli::try_parse_from([
            "labctl",
            "--app-config",
            "/nonexistent/labctl.toml",
            "--log-level",
            "debug",
            "--json-logs",
            "drivers",
        ])
        .unwrap();
        let config = cli.app_config().unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_describe_line() {
        let spec = lab_core::FeatSpec {
            readable: true,
            writable: true,
            choices: vec!["sine".into(), "square".into()],
            ..lab_core::FeatSpec::new("function")
        };
        let line = describe_line(&FeatInfo {
            kind: FeatKind::Feat,
            spec,
            keys: None,
        });
        assert!(line.starts_with("feat   function"));
        assert!(line.contains("{sine|square}"));
    }
}
