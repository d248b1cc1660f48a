// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operator-supplied configuration (§6.3): a `Config` struct tree with
//! `serde`-derived defaults, overlaid by an optional config file, then by
//! explicit CLI flags (defaults < file < CLI).

use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::error::{ArgusError, Result};
use crate::tuner::MAX_MANUAL_GAIN_DB;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TunerConfig {
    pub device_index: Option<usize>,
    pub device_serial: Option<String>,
    pub center_frequency_hz: u64,
    pub sample_rate_hz: u32,
    pub gain: GainConfig,
    pub bias_tee: bool,
}

impl Default for TunerConfig {
    fn default() -> Self {
        TunerConfig {
            device_index: Some(0),
            device_serial: None,
            center_frequency_hz: 100_000_000,
            sample_rate_hz: 2_048_000,
            gain: GainConfig::Auto,
            bias_tee: false,
        }
    }
}

/// A gain policy as written in a config file or parsed from `--gain`
/// (`"auto"` or `"manual:DB"`, §6.4).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GainConfig {
    Auto,
    Manual(f32),
}

impl Default for GainConfig {
    fn default() -> Self {
        GainConfig::Auto
    }
}

impl std::str::FromStr for GainConfig {
    type Err = ArgusError;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(GainConfig::Auto);
        }
        let db_str = s
            .strip_prefix("manual:")
            .ok_or_else(|| ArgusError::UnknownGainMode(format!("{:?}: expected auto|manual:DB", s)))?;
        let db: f32 = db_str
            .parse()
            .map_err(|_| ArgusError::UnknownGainMode(format!("{:?}: not a number", s)))?;
        if !(0.0..=MAX_MANUAL_GAIN_DB).contains(&db) {
            return Err(ArgusError::UnknownGainMode(format!(
                "{} dB out of range [0, {}]",
                db, MAX_MANUAL_GAIN_DB
            )));
        }
        Ok(GainConfig::Manual(db))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PositionMode {
    Nmea,
    Daemon,
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PositionConfig {
    pub mode: PositionMode,
    pub serial_port: String,
    pub serial_baud: u32,
    pub daemon_host: String,
    pub daemon_port: u16,
    pub fix_timeout_secs: u64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: f64,
}

impl Default for PositionConfig {
    fn default() -> Self {
        PositionConfig {
            mode: PositionMode::Nmea,
            serial_port: "/dev/ttyUSB0".to_string(),
            serial_baud: 4800,
            daemon_host: "localhost".to_string(),
            daemon_port: 2947,
            fix_timeout_secs: 30,
            lat: None,
            lon: None,
            alt: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StartMode {
    Immediate,
    Synced,
    At(i64),
}

impl Default for StartMode {
    fn default() -> Self {
        StartMode::Immediate
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    pub duration_secs: u64,
    pub output_dir: PathBuf,
    pub file_prefix: String,
    pub collection_id: Option<String>,
    pub start: StartMode,
    pub pipeline_capacity: usize,
    pub chunk_len: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            duration_secs: 60,
            output_dir: PathBuf::from("./captures"),
            file_prefix: "capture".to_string(),
            collection_id: None,
            start: StartMode::Immediate,
            pipeline_capacity: 8,
            chunk_len: crate::tuner::DEFAULT_CHUNK_LEN,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

/// Full resolved configuration tree (§6.3).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub tuner: TunerConfig,
    pub position: PositionConfig,
    pub capture: CaptureConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads a config file (JSON), overlaying onto built-in defaults for
    /// any field the file omits (`#[serde(default)]` on every nested
    /// struct makes a partial file valid).
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(ArgusError::Io)?;
        serde_json::from_str(&text).map_err(ArgusError::Json)
    }
}

#[derive(Debug, Parser)]
#[command(name = "argus-node", about = "GPS-disciplined SDR capture node")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs one capture (§6.4).
    Run(Box<RunArgs>),
    /// Lists attached SDR devices and exits (§4.7's introspection path).
    Devices,
}

/// CLI flags for `run`. Every field is `Option` so "not passed on the
/// command line" is distinguishable from "passed the default value",
/// which the precedence resolver in [`resolve`] relies on.
#[derive(Debug, Parser, Default)]
pub struct RunArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub device_index: Option<usize>,
    #[arg(long)]
    pub device_serial: Option<String>,
    #[arg(long = "center-frequency")]
    pub center_frequency: Option<u64>,
    #[arg(long = "sample-rate")]
    pub sample_rate: Option<u32>,
    #[arg(long)]
    pub gain: Option<GainConfig>,
    #[arg(long)]
    pub bias_tee: bool,

    #[arg(long)]
    pub duration: Option<u64>,
    #[arg(long = "output-dir")]
    pub output_dir: Option<PathBuf>,
    #[arg(long = "collection-id")]
    pub collection_id: Option<String>,
    #[arg(long = "file-prefix")]
    pub file_prefix: Option<String>,
    #[arg(long = "synced-start")]
    pub synced_start: bool,
    #[arg(long = "start-at")]
    pub start_at: Option<i64>,

    #[arg(long)]
    pub position: Option<PositionMode>,
    #[arg(long = "serial-port")]
    pub serial_port: Option<String>,
    #[arg(long = "serial-baud")]
    pub serial_baud: Option<u32>,
    #[arg(long = "daemon-host")]
    pub daemon_host: Option<String>,
    #[arg(long = "daemon-port")]
    pub daemon_port: Option<u16>,
    #[arg(long = "fix-timeout")]
    pub fix_timeout: Option<u64>,
    #[arg(long)]
    pub lat: Option<f64>,
    #[arg(long)]
    pub lon: Option<f64>,
    #[arg(long)]
    pub alt: Option<f64>,

    #[arg(long = "log-level")]
    pub log_level: Option<String>,
}

impl clap::ValueEnum for PositionMode {
    fn value_variants<'a>() -> &'a [Self] {
        &[PositionMode::Nmea, PositionMode::Daemon, PositionMode::Fixed]
    }
    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(match self {
            PositionMode::Nmea => clap::builder::PossibleValue::new("nmea"),
            PositionMode::Daemon => clap::builder::PossibleValue::new("daemon"),
            PositionMode::Fixed => clap::builder::PossibleValue::new("fixed"),
        })
    }
}

/// Applies the defaults < file < CLI precedence chain (§6.3) and produces
/// a fully resolved [`Config`].
pub fn resolve(args: &RunArgs) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(v) = args.device_index {
        config.tuner.device_index = Some(v);
    }
    if let Some(v) = &args.device_serial {
        config.tuner.device_serial = Some(v.clone());
    }
    if let Some(v) = args.center_frequency {
        config.tuner.center_frequency_hz = v;
    }
    if let Some(v) = args.sample_rate {
        config.tuner.sample_rate_hz = v;
    }
    if let Some(v) = args.gain {
        config.tuner.gain = v;
    }
    if args.bias_tee {
        config.tuner.bias_tee = true;
    }

    if let Some(v) = args.duration {
        config.capture.duration_secs = v;
    }
    if let Some(v) = &args.output_dir {
        config.capture.output_dir = v.clone();
    }
    if let Some(v) = &args.collection_id {
        config.capture.collection_id = Some(v.clone());
    }
    if let Some(v) = &args.file_prefix {
        config.capture.file_prefix = v.clone();
    }
    if let Some(unix_secs) = args.start_at {
        config.capture.start = StartMode::At(unix_secs);
    } else if args.synced_start {
        config.capture.start = StartMode::Synced;
    }

    if let Some(v) = args.position {
        config.position.mode = v;
    }
    if let Some(v) = &args.serial_port {
        config.position.serial_port = v.clone();
    }
    if let Some(v) = args.serial_baud {
        config.position.serial_baud = v;
    }
    if let Some(v) = &args.daemon_host {
        config.position.daemon_host = v.clone();
    }
    if let Some(v) = args.daemon_port {
        config.position.daemon_port = v;
    }
    if let Some(v) = args.fix_timeout {
        config.position.fix_timeout_secs = v;
    }
    if let Some(v) = args.lat {
        config.position.lat = Some(v);
    }
    if let Some(v) = args.lon {
        config.position.lon = Some(v);
    }
    if let Some(v) = args.alt {
        config.position.alt = v;
    }

    if let Some(v) = &args.log_level {
        config.logging.level = v.clone();
    }

    validate(&config)?;
    Ok(config)
}

/// Fast-fails on configuration errors before any device/position resource
/// is opened (§8 property 10).
fn validate(config: &Config) -> Result<()> {
    if config.capture.duration_secs == 0 {
        return Err(ArgusError::InvalidDeadline(
            "duration must be greater than zero".to_string(),
        ));
    }
    if config.position.mode == PositionMode::Fixed
        && (config.position.lat.is_none() || config.position.lon.is_none())
    {
        return Err(ArgusError::MissingPositionSource(
            "fixed position mode requires --lat and --lon".to_string(),
        ));
    }
    if config.tuner.device_index.is_none() && config.tuner.device_serial.is_none() {
        return Err(ArgusError::MissingPositionSource(
            "one of device_index or device_serial must be set".to_string(),
        ));
    }
    Ok(())
}

impl Default for PositionMode {
    fn default() -> Self {
        PositionMode::Nmea
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn partial_file_only_overrides_named_fields() {
        let partial = r#"{"capture":{"duration_secs":120}}"#;
        let config: Config = serde_json::from_str(partial).unwrap();
        assert_eq!(config.capture.duration_secs, 120);
        assert_eq!(config.tuner.center_frequency_hz, 100_000_000);
    }

    #[test]
    fn cli_flags_override_file_defaults() {
        let mut args = RunArgs::default();
        args.duration = Some(30);
        args.center_frequency = Some(915_000_000);
        let config = resolve(&args).unwrap();
        assert_eq!(config.capture.duration_secs, 30);
        assert_eq!(config.tuner.center_frequency_hz, 915_000_000);
    }

    #[test]
    fn zero_duration_is_rejected() {
        let mut args = RunArgs::default();
        args.duration = Some(0);
        let result = resolve(&args);
        assert!(matches!(result, Err(ArgusError::InvalidDeadline(_))));
    }

    #[test]
    fn fixed_position_without_coordinates_is_rejected() {
        let mut args = RunArgs::default();
        args.position = Some(PositionMode::Fixed);
        let result = resolve(&args);
        assert!(matches!(result, Err(ArgusError::MissingPositionSource(_))));
    }

    #[test]
    fn gain_config_parses_manual_with_db() {
        let g: GainConfig = "manual:20.5".parse().unwrap();
        assert_eq!(g, GainConfig::Manual(20.5));
    }

    #[test]
    fn gain_config_rejects_out_of_range() {
        let res: std::result::Result<GainConfig, _> = "manual:60".parse();
        assert!(res.is_err());
    }
}
