//! Command line and startup helpers for the bridgesrv binary

use std::path::PathBuf;

use clap::Parser;
use common::LogOptions;
use tracing::info;

use crate::core::config::AppConfig;
use crate::error::Result;
use crate::protocols::AdapterFactoryRegistry;

/// GridLink device bridge
#[derive(Debug, Clone, Default, Parser)]
#[clap(author, version, about)]
pub struct Args {
    /// Configuration file (.yaml, .yml, .toml or .json)
    #[clap(short = 'c', long, env = "BRIDGESRV_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter directive, overrides the configured level (e.g. debug, bridgesrv=trace)
    #[clap(short = 'l', long)]
    pub log_level: Option<String>,

    /// Emit JSON log lines
    #[clap(long)]
    pub json_logs: bool,

    /// Disable colored output (useful for log files)
    #[clap(long)]
    pub no_color: bool,

    /// Only validate configuration without starting service
    #[clap(long)]
    pub validate: bool,

    /// Print an example configuration as YAML and exit
    #[clap(long)]
    pub print_default_config: bool,
}

impl Args {
    /// Configured logging with command line overrides applied
    pub fn log_options(&self, configured: &LogOptions) -> LogOptions {
        let mut options = configured.clone();
        if let Some(level) = &self.log_level {
            options.level = level.clone();
        }
        if self.json_logs {
            options.json = true;
        }
        if self.no_color {
            options.ansi = false;
        }
        options
    }
}

/// Check every device's protocol parameters against its factory
pub fn validate_devices(config: &AppConfig, factories: &AdapterFactoryRegistry) -> Result<()> {
    for device in &config.devices {
        factories.validate(device)?;
    }
    info!(
        "Configuration valid: {} device(s), bus {:?}",
        config.devices.len(),
        config.bus.kind
    );
    Ok(())
}

pub fn default_config_yaml() -> Result<String> {
    Ok(serde_yaml::to_string(&AppConfig::example())?)
}
