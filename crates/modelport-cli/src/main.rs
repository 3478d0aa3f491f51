mod cli;
mod features;

use anyhow::{bail, Result};
use clap::Parser;
use cli::{Cli, Command};
use modelport_backend_ort::OrtRuntime;
use modelport_core::{PredictorError, PredictorResult};
use modelport_predictor::{
    EagerPredictor, ExecutionMode, GraphPredictor, Predictor, PredictorConfig,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Inspect { predictor } => {
            let config = predictor.resolve()?;
            let mut predictor = restored(&config)?;

            let version = recorded(predictor.model_version())?;
            let global_step = recorded(predictor.global_step())?;
            let report = json!({
                "path": predictor.model_path()?.display().to_string(),
                "version": version,
                "global_step": global_step,
                "feature_spec": predictor.feature_specification()?,
                "label_spec": predictor.label_specification()?,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            predictor.close()?;
        }
        Command::Predict {
            predictor,
            features,
            pretty,
        } => {
            let config = predictor.resolve()?;
            let features = features::read_features(&features)?;
            let mut predictor = restored(&config)?;

            let predictions = predictor.predict(features)?;
            let out = features::predictions_to_json(&predictions)?;
            if pretty {
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("{out}");
            }
            predictor.close()?;
        }
    }

    Ok(())
}

fn build_predictor(config: &PredictorConfig) -> Result<Box<dyn Predictor>> {
    let predictor: Box<dyn Predictor> = match config.mode {
        ExecutionMode::Eager => Box::new(EagerPredictor::from_config(
            OrtRuntime::with_config(config.session.clone()),
            config,
        )?),
        ExecutionMode::Graph => Box::new(GraphPredictor::from_config(OrtRuntime::new(), config)?),
    };
    Ok(predictor)
}

fn restored(config: &PredictorConfig) -> Result<Box<dyn Predictor>> {
    let mut predictor = build_predictor(config)?;
    tracing::info!(mode = ?config.mode, device = %config.session.device, "restoring predictor");
    if !predictor.restore()? {
        bail!("no export became available within {}s", config.timeout_secs);
    }
    Ok(predictor)
}

/// Maps "the export does not record this" to `None`; other failures propagate.
fn recorded<T>(result: PredictorResult<T>) -> PredictorResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(PredictorError::InvalidVersion(_) | PredictorError::GlobalStepNotRecorded) => Ok(None),
        Err(err) => Err(err),
    }
}
