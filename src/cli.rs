use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use crate::config::{self, RelayConfig};

/// Command-line flags. Each one can also come from the environment (or a
/// `.env` file) and overrides the matching key of the configuration file.
#[derive(Debug, Default, Parser)]
#[command(name = "http2amqp", version, about = "Relay HTTP requests onto AMQP queues")]
pub struct Cli {
    /// The address for the AMQP server (including vhost)
    #[arg(long, env = "AMQP_ADDR")]
    pub uri: Option<String>,

    /// The listen port for inbound HTTP requests
    #[arg(long, env = "HTTP_PORT")]
    pub http_port: Option<u16>,

    /// Where log lines are written
    #[arg(long, env = "LOG_FILE_PATH")]
    pub log_file_path: Option<PathBuf>,

    /// JSON configuration file; created from the flags if it does not exist
    #[arg(long, env = "CONFIG_FILE")]
    pub config_file: Option<PathBuf>,
}

impl Cli {
    /// Overlay the flags that were given onto `config`.
    pub fn apply(&self, config: &mut RelayConfig) {
        if let Some(uri) = &self.uri {
            config.uri = uri.clone();
        }
        if let Some(port) = self.http_port {
            config.http_port = port;
        }
        if let Some(path) = &self.log_file_path {
            config.log_file_path = path.clone();
        }
    }

    /// Built-in defaults with the flags applied; written out when no
    /// configuration file exists yet.
    pub fn seed_config(&self) -> RelayConfig {
        let mut config = RelayConfig::default();
        self.apply(&mut config);
        config
    }

    /// Resolve the final configuration: defaults < file < flags/environment.
    pub fn load_config(&self) -> Result<RelayConfig> {
        let path = config::find_config_file(self.config_file.as_deref());
        let mut config = config::load_or_create(&path, &self.seed_config())
            .with_context(|| format!("Unable to load configuration from {}", path.display()))?;
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }
}
