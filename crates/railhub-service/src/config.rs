//! Service configuration.
//!
//! Durations are integer milliseconds so the file stays plain TOML.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use railhub_core::{
    BackoffPolicy, ClassifierConfig, ConnectionConfig, EngineConfig, FleetConfig, MonitorConfig,
    ScanOptions, SelfDriveConfig, SupervisorConfig, SwitchConfig, TrainConfig,
};
use railhub_types::{Color, HubRole};

/// Service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scanner: ScannerConfig,
    pub connection: ConnectionSection,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
    pub commands: CommandsConfig,
    pub self_drive: SelfDriveSection,
    pub monitor: MonitorSection,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from the default path, or defaults if there is no file.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration, creating parent directories as needed.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Check every section and report all problems at once.
    ///
    /// ```
    /// use railhub_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("default config is valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.scanner.validate());
        errors.extend(self.connection.validate());
        errors.extend(self.backoff.validate());
        errors.extend(self.commands.validate());
        errors.extend(self.self_drive.validate());
        errors.extend(self.monitor.validate());
        errors.extend(self.logging.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Platform config dir, e.g. `~/.config/railhub/railhub.toml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("railhub")
            .join("railhub.toml")
    }

    /// Settings for the core components.
    pub fn fleet_config(&self) -> FleetConfig {
        FleetConfig {
            scan: self.scanner.scan_options(),
            supervisor: self.supervisor_config(),
            engine: EngineConfig::new().backoff(self.commands.retry_backoff()),
            switch: self.commands.switch_config(),
            train: self.commands.train_config(self.self_drive.self_drive_config()),
            monitor: self.monitor.monitor_config(),
        }
    }

    /// Settings for BLE sessions.
    pub fn connection_config(&self) -> ConnectionConfig {
        self.connection.connection_config()
    }

    fn supervisor_config(&self) -> SupervisorConfig {
        let mut config = SupervisorConfig::default()
            .backoff(self.backoff.policy())
            .connect_timeout(ms(self.connection.session_timeout_ms))
            .notification_timeout(
                (self.connection.notification_timeout_ms > 0)
                    .then(|| ms(self.connection.notification_timeout_ms)),
            )
            .max_connections(HubRole::Train, self.scanner.max_train_connections)
            .max_connections(HubRole::Switch, self.scanner.max_switch_connections);
        config.notification_capacity = self.connection.notification_capacity;
        config
    }
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

fn check(errors: &mut Vec<ValidationError>, ok: bool, field: &str, message: impl Into<String>) {
    if !ok {
        errors.push(ValidationError {
            field: field.to_string(),
            message: message.into(),
        });
    }
}

/// Discovery and registration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Reinitialize the adapter before the first scan.
    pub reset_adapter_on_startup: bool,
    /// Case-insensitive name fragments that mark a train hub.
    pub train_patterns: Vec<String>,
    /// Case-insensitive name fragments that mark a switch hub.
    pub switch_patterns: Vec<String>,
    pub require_lego_identity: bool,
    /// Failed recoveries in a row before the scanner reports itself degraded.
    pub degraded_after: u32,
    pub recovery_delay_ms: u64,
    pub max_train_connections: usize,
    pub max_switch_connections: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        let scan = ScanOptions::default();
        let supervisor = SupervisorConfig::default();
        Self {
            reset_adapter_on_startup: scan.reset_adapter_on_start,
            train_patterns: scan.classifier.train_patterns,
            switch_patterns: scan.classifier.switch_patterns,
            require_lego_identity: scan.classifier.require_lego_identity,
            degraded_after: scan.degraded_after,
            recovery_delay_ms: scan.recovery_backoff.initial_delay.as_millis() as u64,
            max_train_connections: supervisor.max_train_connections,
            max_switch_connections: supervisor.max_switch_connections,
        }
    }
}

impl ScannerConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        for (field, patterns) in [
            ("scanner.train_patterns", &self.train_patterns),
            ("scanner.switch_patterns", &self.switch_patterns),
        ] {
            check(&mut errors, !patterns.is_empty(), field, "at least one pattern is required");
            check(
                &mut errors,
                patterns.iter().all(|p| !p.trim().is_empty()),
                field,
                "patterns cannot be blank",
            );
        }
        let trains: HashSet<String> = self.train_patterns.iter().map(|p| p.to_lowercase()).collect();
        if let Some(shared) = self
            .switch_patterns
            .iter()
            .find(|p| trains.contains(&p.to_lowercase()))
        {
            errors.push(ValidationError {
                field: "scanner.switch_patterns".to_string(),
                message: format!("'{shared}' is also a train pattern"),
            });
        }
        check(&mut errors, self.degraded_after >= 1, "scanner.degraded_after", "must be at least 1");
        check(
            &mut errors,
            self.recovery_delay_ms > 0,
            "scanner.recovery_delay_ms",
            "must be greater than 0",
        );
        check(
            &mut errors,
            self.max_train_connections >= 1,
            "scanner.max_train_connections",
            "must be at least 1",
        );
        check(
            &mut errors,
            self.max_switch_connections >= 1,
            "scanner.max_switch_connections",
            "must be at least 1",
        );
        errors
    }

    fn scan_options(&self) -> ScanOptions {
        let defaults = ScanOptions::default();
        let backoff = defaults
            .recovery_backoff
            .clone()
            .initial_delay(ms(self.recovery_delay_ms))
            .max_delay(defaults.recovery_backoff.max_delay.max(ms(self.recovery_delay_ms)));
        defaults
            .classifier(ClassifierConfig {
                train_patterns: self.train_patterns.clone(),
                switch_patterns: self.switch_patterns.clone(),
                require_lego_identity: self.require_lego_identity,
            })
            .recovery_backoff(backoff)
            .degraded_after(self.degraded_after)
            .reset_adapter_on_start(self.reset_adapter_on_startup)
    }
}

/// Session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    /// Link establishment, after the hub has been found.
    pub connect_timeout_ms: u64,
    /// Looking up the hub and its characteristic before connecting.
    pub discovery_timeout_ms: u64,
    /// Upper bound for a whole session setup.
    pub session_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub write_with_response: bool,
    /// Declare the link lost after this much silence. 0 disables the check.
    pub notification_timeout_ms: u64,
    /// Notifications buffered per hub for slow consumers.
    pub notification_capacity: usize,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        let connection = ConnectionConfig::default();
        let supervisor = SupervisorConfig::default();
        Self {
            connect_timeout_ms: connection.connection_timeout.as_millis() as u64,
            discovery_timeout_ms: connection.discovery_timeout.as_millis() as u64,
            session_timeout_ms: supervisor.connect_timeout.as_millis() as u64,
            write_timeout_ms: connection.write_timeout.as_millis() as u64,
            write_with_response: connection.write_with_response,
            notification_timeout_ms: supervisor
                .notification_timeout
                .map_or(0, |t| t.as_millis() as u64),
            notification_capacity: supervisor.notification_capacity,
        }
    }
}

impl ConnectionSection {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        for (field, value) in [
            ("connection.connect_timeout_ms", self.connect_timeout_ms),
            ("connection.discovery_timeout_ms", self.discovery_timeout_ms),
            ("connection.session_timeout_ms", self.session_timeout_ms),
            ("connection.write_timeout_ms", self.write_timeout_ms),
        ] {
            check(&mut errors, value > 0, field, "must be greater than 0");
        }
        check(
            &mut errors,
            self.session_timeout_ms >= self.connect_timeout_ms,
            "connection.session_timeout_ms",
            "cannot be shorter than connect_timeout_ms",
        );
        check(
            &mut errors,
            self.notification_capacity >= 1,
            "connection.notification_capacity",
            "must be at least 1",
        );
        errors
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::default()
            .connection_timeout(ms(self.connect_timeout_ms))
            .discovery_timeout(ms(self.discovery_timeout_ms))
            .write_timeout(ms(self.write_timeout_ms))
            .write_with_response(self.write_with_response)
    }
}

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    /// Fraction of each delay randomized, 0.0 to 1.0.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::from_policy(&BackoffPolicy::for_reconnect())
    }
}

impl BackoffConfig {
    fn from_policy(policy: &BackoffPolicy) -> Self {
        Self {
            initial_ms: policy.initial_delay.as_millis() as u64,
            max_ms: policy.max_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            jitter: policy.jitter,
        }
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        self.validate_as("backoff")
    }

    fn validate_as(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        check(
            &mut errors,
            self.initial_ms > 0,
            &format!("{prefix}.initial_ms"),
            "must be greater than 0",
        );
        check(
            &mut errors,
            self.max_ms >= self.initial_ms,
            &format!("{prefix}.max_ms"),
            "cannot be less than initial_ms",
        );
        check(
            &mut errors,
            self.multiplier.is_finite() && self.multiplier >= 1.0,
            &format!("{prefix}.multiplier"),
            "must be at least 1.0",
        );
        check(
            &mut errors,
            (0.0..=1.0).contains(&self.jitter),
            &format!("{prefix}.jitter"),
            "must be between 0.0 and 1.0",
        );
        errors
    }

    fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::for_reconnect()
            .initial_delay(ms(self.initial_ms))
            .max_delay(ms(self.max_ms))
            .multiplier(self.multiplier)
            .jitter(self.jitter)
    }
}

/// Command delivery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Attempts per command, the first one included.
    pub max_attempts: u32,
    /// How long a switch attempt waits for the position report.
    pub verify_timeout_ms: u64,
    /// How long a train attempt waits for the write to be accepted.
    pub write_timeout_ms: u64,
    pub probe_attempts: u32,
    pub probe_timeout_ms: u64,
    pub min_power: i8,
    pub max_power: i8,
    /// Delay between attempts.
    pub retry: BackoffConfig,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        let switch = SwitchConfig::default();
        let train = TrainConfig::default();
        Self {
            max_attempts: switch.max_attempts,
            verify_timeout_ms: switch.verify_timeout.as_millis() as u64,
            write_timeout_ms: train.write_timeout.as_millis() as u64,
            probe_attempts: switch.probe_attempts,
            probe_timeout_ms: switch.probe_timeout.as_millis() as u64,
            min_power: train.min_power,
            max_power: train.max_power,
            retry: BackoffConfig::from_policy(&BackoffPolicy::for_commands()),
        }
    }
}

impl CommandsConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        check(&mut errors, self.max_attempts >= 1, "commands.max_attempts", "must be at least 1");
        check(
            &mut errors,
            self.probe_attempts >= 1,
            "commands.probe_attempts",
            "must be at least 1",
        );
        for (field, value) in [
            ("commands.verify_timeout_ms", self.verify_timeout_ms),
            ("commands.write_timeout_ms", self.write_timeout_ms),
            ("commands.probe_timeout_ms", self.probe_timeout_ms),
        ] {
            check(&mut errors, value > 0, field, "must be greater than 0");
        }
        check(
            &mut errors,
            (-100..=0).contains(&self.min_power),
            "commands.min_power",
            "must be between -100 and 0",
        );
        check(
            &mut errors,
            (0..=100).contains(&self.max_power),
            "commands.max_power",
            "must be between 0 and 100",
        );
        errors.extend(self.retry.validate_as("commands.retry"));
        errors
    }

    fn retry_backoff(&self) -> BackoffPolicy {
        self.retry.policy()
    }

    fn switch_config(&self) -> SwitchConfig {
        let mut config = SwitchConfig::default()
            .max_attempts(self.max_attempts)
            .verify_timeout(ms(self.verify_timeout_ms));
        config.probe_attempts = self.probe_attempts;
        config.probe_timeout = ms(self.probe_timeout_ms);
        config
    }

    fn train_config(&self, self_drive: SelfDriveConfig) -> TrainConfig {
        let mut config = TrainConfig::default()
            .max_attempts(self.max_attempts)
            .self_drive(self_drive);
        config.write_timeout = ms(self.write_timeout_ms);
        config.min_power = self.min_power;
        config.max_power = self.max_power;
        config
    }
}

/// Color marker settings for self-driving trains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfDriveSection {
    /// Consecutive identical samples before a color counts.
    pub debounce_window: u32,
    pub stop_colors: Vec<Color>,
    pub reverse_colors: Vec<Color>,
}

impl Default for SelfDriveSection {
    fn default() -> Self {
        let config = SelfDriveConfig::default();
        Self {
            debounce_window: config.debounce_window,
            stop_colors: config.stop_colors,
            reverse_colors: config.reverse_colors,
        }
    }
}

impl SelfDriveSection {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        check(
            &mut errors,
            self.debounce_window >= 1,
            "self_drive.debounce_window",
            "must be at least 1",
        );
        for (field, colors) in [
            ("self_drive.stop_colors", &self.stop_colors),
            ("self_drive.reverse_colors", &self.reverse_colors),
        ] {
            if let Some(color) = colors.iter().find(|c| !c.is_marker()) {
                errors.push(ValidationError {
                    field: field.to_string(),
                    message: format!("{color} cannot be used as a marker"),
                });
            }
        }
        if let Some(color) = self.stop_colors.iter().find(|c| self.reverse_colors.contains(c)) {
            errors.push(ValidationError {
                field: "self_drive.reverse_colors".to_string(),
                message: format!("{color} is already a stop color"),
            });
        }
        errors
    }

    fn self_drive_config(&self) -> SelfDriveConfig {
        SelfDriveConfig::default()
            .debounce_window(self.debounce_window)
            .stop_colors(self.stop_colors.clone())
            .reverse_colors(self.reverse_colors.clone())
    }
}

/// Status sampling and reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub interval_ms: u64,
    /// A connected hub silent for this long is reported inactive.
    pub inactive_after_ms: u64,
    pub refresh_signal: bool,
    /// How often the service logs a fleet snapshot. 0 disables it.
    pub report_interval_ms: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        let config = MonitorConfig::default();
        Self {
            interval_ms: config.interval.as_millis() as u64,
            inactive_after_ms: config.inactive_after.as_millis() as u64,
            refresh_signal: config.refresh_signal,
            report_interval_ms: 10_000,
        }
    }
}

impl MonitorSection {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        check(&mut errors, self.interval_ms > 0, "monitor.interval_ms", "must be greater than 0");
        check(
            &mut errors,
            self.inactive_after_ms > self.interval_ms,
            "monitor.inactive_after_ms",
            "must be longer than interval_ms",
        );
        if self.report_interval_ms > 0 && self.report_interval_ms < self.interval_ms {
            errors.push(ValidationError {
                field: "monitor.report_interval_ms".to_string(),
                message: "cannot be shorter than interval_ms".to_string(),
            });
        }
        errors
    }

    fn monitor_config(&self) -> MonitorConfig {
        let mut config = MonitorConfig::default()
            .interval(ms(self.interval_ms))
            .inactive_after(ms(self.inactive_after_ms));
        config.refresh_signal = self.refresh_signal;
        config
    }

    pub fn report_interval(&self) -> Option<Duration> {
        (self.report_interval_ms > 0).then(|| ms(self.report_interval_ms))
    }
}

/// Log output settings. `RUST_LOG` takes precedence over `level`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl LoggingConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        check(
            &mut errors,
            LEVELS.contains(&self.level.to_lowercase().as_str()),
            "logging.level",
            format!("unknown level '{}', expected one of {}", self.level, LEVELS.join(", ")),
        );
        errors
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted field path, e.g. `commands.max_attempts`.
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}
