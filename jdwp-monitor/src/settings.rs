// Monitor settings
//
// An optional JSON file supplies defaults; command-line flags override it.

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use jdwp_engine::{EngineConfig, SuspendPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Suspend policy requested for every subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SuspendMode {
    #[default]
    None,
    Thread,
    All,
}

impl From<SuspendMode> for SuspendPolicy {
    fn from(mode: SuspendMode) -> Self {
        match mode {
            SuspendMode::None => SuspendPolicy::None,
            SuspendMode::Thread => SuspendPolicy::EventThread,
            SuspendMode::All => SuspendPolicy::All,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub host: String,
    pub port: Option<u16>,
    /// Class patterns reported by ClassPrepare
    pub classes: Vec<String>,
    /// Class patterns suppressed from ClassPrepare
    pub exclude: Vec<String>,
    pub exceptions: bool,
    pub suspend: SuspendMode,
    pub engine: EngineConfig,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            classes: Vec::new(),
            exclude: Vec::new(),
            exceptions: false,
            suspend: SuspendMode::default(),
            engine: EngineConfig::default(),
        }
    }
}

/// Flag values that take precedence over the file
#[derive(Debug, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub classes: Vec<String>,
    pub exclude: Vec<String>,
    pub exceptions: bool,
    pub suspend: Option<SuspendMode>,
}

impl MonitorSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Apply flags on top of the file. Repeated patterns extend the file's
    /// lists rather than replacing them.
    pub fn merge(mut self, overrides: Overrides) -> Result<Self> {
        if let Some(host) = overrides.host {
            self.host = host;
        }
        if let Some(port) = overrides.port {
            self.port = Some(port);
        }
        self.classes.extend(overrides.classes);
        self.exclude.extend(overrides.exclude);
        self.exceptions |= overrides.exceptions;
        if let Some(suspend) = overrides.suspend {
            self.suspend = suspend;
        }

        if self.port.is_none() {
            bail!("no target port given (use --port or set \"port\" in the config file)");
        }
        Ok(self)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_default()
    }
}
