//! Predictor configuration, loaded from an optional TOML file layered with
//! `MODELPORT_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use config::{Config, Environment, File};
use modelport_core::{ExportSource, SavedModelExport, SessionConfig};
use serde::Deserialize;

/// Which predictor variant to build.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Call the loaded model directly.
    #[default]
    Eager,
    /// Build the prediction graph once, then run it in a dedicated session.
    Graph,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictorConfig {
    /// Export directory to restore from.
    #[serde(default)]
    pub saved_model_path: Option<PathBuf>,
    /// Directory of versioned exports; the newest complete one is used.
    #[serde(default)]
    pub export_root: Option<PathBuf>,
    /// How long restore waits for the export to appear.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Session options for graph mode; eager mode uses them for its model too.
    #[serde(default)]
    pub session: SessionConfig,
}

fn default_timeout_secs() -> f64 {
    600.0
}

fn default_poll_interval_secs() -> f64 {
    10.0
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            saved_model_path: None,
            export_root: None,
            timeout_secs: default_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            mode: ExecutionMode::default(),
            session: SessionConfig::default(),
        }
    }
}

impl PredictorConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let config: Self = builder
            .add_source(
                Environment::with_prefix("MODELPORT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to load predictor configuration")?
            .try_deserialize()
            .context("invalid predictor configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.timeout()?;
        ensure!(
            self.poll_interval()? > Duration::ZERO,
            "poll_interval_secs must be positive"
        );
        ensure!(
            self.session.intra_threads > 0,
            "session.intra_threads must be at least 1"
        );
        Ok(())
    }

    pub fn timeout(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.timeout_secs)
            .with_context(|| format!("invalid timeout_secs: {}", self.timeout_secs))
    }

    pub fn poll_interval(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.poll_interval_secs)
            .with_context(|| format!("invalid poll_interval_secs: {}", self.poll_interval_secs))
    }

    /// Where restore looks: `saved_model_path` if set, otherwise the newest
    /// complete export under `export_root`, searched again on every poll.
    pub fn export_source(&self) -> Result<ExportSource> {
        match (&self.saved_model_path, &self.export_root) {
            (Some(path), _) => Ok(ExportSource::Exact(SavedModelExport::new(path))),
            (None, Some(root)) => Ok(ExportSource::Latest(root.clone())),
            (None, None) => bail!("either saved_model_path or export_root must be set"),
        }
    }
}
