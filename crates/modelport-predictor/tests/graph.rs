mod common;

use std::path::{Path, PathBuf};
use std::time::Duration;

use common::{assets, features, write_export, write_export_with, ScalingGraphRuntime, GLOBAL_STEP};
use modelport_core::{scope, Device, ExportAssets, PredictorError, SessionConfig};
use modelport_predictor::{ExecutionMode, GraphPredictor, Predictor, PredictorConfig};

fn predictor(path: impl Into<PathBuf>, timeout: Duration) -> GraphPredictor<ScalingGraphRuntime> {
    GraphPredictor::new(
        ScalingGraphRuntime::default(),
        path,
        timeout,
        SessionConfig::default(),
    )
    .with_poll_interval(Duration::from_millis(10))
}

fn restored(root: &Path) -> GraphPredictor<ScalingGraphRuntime> {
    let export = write_export(root, "20");
    let mut predictor = predictor(export.path(), Duration::from_secs(5));
    assert!(predictor.restore().unwrap());
    predictor
}

fn events(predictor: &GraphPredictor<ScalingGraphRuntime>) -> Vec<String> {
    predictor.runtime().events.lock().unwrap().clone()
}

#[test]
fn everything_fails_before_restore() {
    let dir = tempfile::tempdir().unwrap();
    let mut predictor = predictor(dir.path().join("20"), Duration::from_secs(1));

    assert!(matches!(
        predictor.predict(features(&[3], &[1.0, 2.0, 3.0])),
        Err(PredictorError::NotLoaded)
    ));
    assert!(matches!(predictor.global_step(), Err(PredictorError::NotLoaded)));
    assert!(matches!(predictor.feature_specification(), Err(PredictorError::NotLoaded)));
    assert!(matches!(predictor.close(), Err(PredictorError::NotLoaded)));
}

#[test]
fn restore_builds_graph_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut predictor = restored(dir.path());
    let built = vec!["load", "placeholder:x", "build", "global_step", "init"];
    assert_eq!(events(&predictor), built);

    for _ in 0..3 {
        predictor.predict(features(&[3], &[1.0, 2.0, 3.0])).unwrap();
    }
    let mut expected = built;
    expected.extend(["run", "run", "run"]);
    assert_eq!(events(&predictor), expected);
}

#[test]
fn restore_timeout_creates_no_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut predictor = predictor(dir.path().join("20"), Duration::from_millis(40));
    assert!(!predictor.restore().unwrap());
    assert!(predictor.runtime().configs.lock().unwrap().is_empty());
    assert!(events(&predictor).is_empty());
}

#[test]
fn predict_adds_missing_batch_dimension() {
    let dir = tempfile::tempdir().unwrap();
    let mut predictor = restored(dir.path());

    let outputs = predictor.predict(features(&[3], &[1.0, 2.0, 3.0])).unwrap();
    let scaled = outputs["x_scaled"].as_f32().unwrap();
    assert_eq!(scaled.shape(), &[1, 3]);
    assert_eq!(scaled.iter().copied().collect::<Vec<_>>(), vec![2.0, 4.0, 6.0]);
}

#[test]
fn session_is_default_only_during_calls() {
    let dir = tempfile::tempdir().unwrap();
    let mut predictor = restored(dir.path());
    predictor.predict(features(&[2, 3], &[1.0; 6])).unwrap();
    predictor.global_step().unwrap();

    let seen = predictor.runtime().active_sessions.lock().unwrap().clone();
    assert!(!seen.is_empty());
    assert!(seen.iter().all(|(session, active)| *active == Some(*session)));
    assert_eq!(scope::active(), None);
}

#[test]
fn global_step_reuses_the_node_built_at_restore() {
    let dir = tempfile::tempdir().unwrap();
    let mut predictor = restored(dir.path());
    for _ in 0..5 {
        assert_eq!(predictor.global_step().unwrap(), GLOBAL_STEP);
    }

    let events = events(&predictor);
    assert_eq!(events.iter().filter(|e| *e == "global_step").count(), 1);
    assert_eq!(events.iter().filter(|e| *e == "run").count(), 5);
}

#[test]
fn export_without_step_reports_it_as_not_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let export = write_export_with(
        dir.path(),
        "21",
        &ExportAssets {
            global_step: None,
            ..assets()
        },
    );
    let mut predictor = predictor(export.path(), Duration::from_secs(5));
    assert!(predictor.restore().unwrap());

    assert!(matches!(
        predictor.global_step(),
        Err(PredictorError::GlobalStepNotRecorded)
    ));
    assert!(!events(&predictor).contains(&"run".to_string()));
}

#[test]
fn close_drops_session_and_restore_builds_a_new_one() {
    let dir = tempfile::tempdir().unwrap();
    let mut predictor = restored(dir.path());
    predictor.close().unwrap();
    assert!(matches!(predictor.global_step(), Err(PredictorError::NotLoaded)));

    assert!(predictor.restore().unwrap());
    assert_eq!(predictor.runtime().configs.lock().unwrap().len(), 2);
    let sessions: std::collections::HashSet<_> = predictor
        .runtime()
        .active_sessions
        .lock()
        .unwrap()
        .iter()
        .map(|(session, _)| *session)
        .collect();
    assert_eq!(sessions.len(), 2);
}

#[test]
fn from_config_passes_session_options() {
    let dir = tempfile::tempdir().unwrap();
    let export = write_export(dir.path(), "31");
    let config = PredictorConfig {
        saved_model_path: Some(export.path().to_path_buf()),
        timeout_secs: 1.0,
        poll_interval_secs: 0.01,
        mode: ExecutionMode::Graph,
        session: SessionConfig {
            device: Device::Cuda { device_id: 1 },
            intra_threads: 8,
            ..SessionConfig::default()
        },
        ..PredictorConfig::default()
    };

    let mut predictor =
        GraphPredictor::from_config(ScalingGraphRuntime::default(), &config).unwrap();
    assert!(predictor.restore().unwrap());
    assert_eq!(predictor.model_version().unwrap(), 31);

    let configs = predictor.runtime().configs.lock().unwrap();
    assert_eq!(configs[0].intra_threads, 8);
    assert_eq!(configs[0].device, Device::Cuda { device_id: 1 });
}
