use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use modelport_predictor::{ExecutionMode, PredictorConfig};

#[derive(Parser, Debug)]
#[command(
    name = "modelport",
    version,
    about = "Restore model exports and run predictions"
)]
pub struct Cli {
    /// Log level (RUST_LOG)
    #[arg(long, global = true, default_value = "info")]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Restore an export and print its version, global step and specs
    Inspect {
        #[command(flatten)]
        predictor: PredictorArgs,
    },
    /// Restore an export and run one prediction
    Predict {
        #[command(flatten)]
        predictor: PredictorArgs,

        /// JSON file mapping feature names to {dtype, shape, data}
        #[arg(long)]
        features: PathBuf,

        /// Pretty-print the output JSON
        #[arg(long)]
        pretty: bool,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Eager,
    Graph,
}

impl From<Mode> for ExecutionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Eager => ExecutionMode::Eager,
            Mode::Graph => ExecutionMode::Graph,
        }
    }
}

#[derive(Args, Debug, Default)]
pub struct PredictorArgs {
    /// Predictor config file (TOML); flags override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Export directory to restore
    #[arg(long, conflicts_with = "export_root")]
    pub export: Option<PathBuf>,

    /// Directory of versioned exports; the newest complete one is restored
    #[arg(long)]
    pub export_root: Option<PathBuf>,

    /// Execution mode
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// Seconds to wait for the export to appear
    #[arg(long)]
    pub timeout_secs: Option<f64>,

    /// Seconds between availability checks
    #[arg(long)]
    pub poll_secs: Option<f64>,

    /// Device for inference (cpu or cuda:N)
    #[arg(long)]
    pub device: Option<String>,

    /// Intra-op threads per session
    #[arg(long)]
    pub threads: Option<usize>,
}

impl PredictorArgs {
    /// Loads the config file (if any) and applies flag overrides.
    pub fn resolve(&self) -> Result<PredictorConfig> {
        let mut config = PredictorConfig::load(self.config.as_deref())?;

        if let Some(export) = &self.export {
            config.saved_model_path = Some(export.clone());
            config.export_root = None;
        }
        if let Some(root) = &self.export_root {
            config.export_root = Some(root.clone());
            config.saved_model_path = None;
        }
        if let Some(mode) = self.mode {
            config.mode = mode.into();
        }
        if let Some(timeout) = self.timeout_secs {
            config.timeout_secs = timeout;
        }
        if let Some(poll) = self.poll_secs {
            config.poll_interval_secs = poll;
        }
        if let Some(device) = &self.device {
            config.session.device = device.parse()?;
        }
        if let Some(threads) = self.threads {
            config.session.intra_threads = threads;
        }

        config.validate()?;
        Ok(config)
    }
}
