//! Host process for LEGO train and switch hubs.
//!
//! Wires [`railhub_core::Fleet`] to the system Bluetooth adapter, reads its
//! settings from a TOML file and logs fleet status while it runs.
//!
//! # Configuration
//!
//! The service reads `~/.config/railhub/railhub.toml` (or the platform
//! equivalent). Every section is optional:
//!
//! ```toml
//! [scanner]
//! reset_adapter_on_startup = true
//! max_train_connections = 10
//!
//! [backoff]
//! initial_ms = 1000
//! max_ms = 30000
//!
//! [commands]
//! max_attempts = 3
//! verify_timeout_ms = 2000
//!
//! [self_drive]
//! debounce_window = 3
//! stop_colors = ["RED"]
//! reverse_colors = ["BLUE"]
//!
//! [monitor]
//! inactive_after_ms = 5000
//! report_interval_ms = 10000
//!
//! [logging]
//! level = "info"
//! json = false
//! ```

pub mod config;
pub mod reporter;

pub use config::{
    BackoffConfig, CommandsConfig, Config, ConfigError, ConnectionSection, LoggingConfig,
    MonitorSection, ScannerConfig, SelfDriveSection, ValidationError,
};
pub use reporter::{Reporter, Summary};
