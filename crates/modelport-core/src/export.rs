use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{PredictorError, PredictorResult, SpecStructure};

/// Sidecar directory inside an export holding non-graph assets.
pub const EXTRA_ASSETS_DIRECTORY: &str = "assets.extra";
/// Spec file written last by the exporter; its presence marks the export complete.
pub const ASSETS_FILENAME: &str = "t2r_assets.json";
pub const MODEL_FILENAME: &str = "model.onnx";

/// Contents of the sidecar metadata file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportAssets {
    pub feature_spec: SpecStructure,
    #[serde(default)]
    pub label_spec: SpecStructure,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_step: Option<i64>,
}

/// One versioned model export directory, `<root>/<version>/`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SavedModelExport {
    path: PathBuf,
}

impl SavedModelExport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn assets_path(&self) -> PathBuf {
        self.path.join(EXTRA_ASSETS_DIRECTORY).join(ASSETS_FILENAME)
    }

    pub fn model_file(&self) -> PathBuf {
        self.path.join(MODEL_FILENAME)
    }

    pub fn is_complete(&self) -> bool {
        self.assets_path().is_file()
    }

    /// The model version, taken from the export directory's name.
    pub fn version(&self) -> PredictorResult<i64> {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.parse().ok())
            .ok_or_else(|| PredictorError::InvalidVersion(self.path.clone()))
    }

    pub fn load_assets(&self) -> PredictorResult<ExportAssets> {
        let path = self.assets_path();
        let raw = fs::read_to_string(&path).map_err(|e| PredictorError::Metadata {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|e| PredictorError::Metadata {
            path,
            reason: e.to_string(),
        })
    }

    /// Writes the sidecar through a temporary file so readers never see a
    /// partial marker.
    pub fn write_assets(&self, assets: &ExportAssets) -> PredictorResult<()> {
        let dir = self.path.join(EXTRA_ASSETS_DIRECTORY);
        fs::create_dir_all(&dir)?;
        let json = serde_json::to_vec_pretty(assets).map_err(|e| PredictorError::Metadata {
            path: self.assets_path(),
            reason: e.to_string(),
        })?;
        let tmp = dir.join(format!("{ASSETS_FILENAME}.tmp"));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, self.assets_path())?;
        Ok(())
    }

    /// Finds the complete export with the highest numeric version under `root`.
    pub fn latest_in(root: impl AsRef<Path>) -> PredictorResult<Option<Self>> {
        let root = root.as_ref();
        let mut best: Option<(i64, Self)> = None;

        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let export = Self::new(entry.path());
            let Ok(version) = export.version() else {
                continue;
            };
            if !export.is_complete() {
                debug!(path = %export.path().display(), "skipping incomplete export");
                continue;
            }
            if best.as_ref().map_or(true, |(v, _)| version > *v) {
                best = Some((version, export));
            }
        }

        Ok(best.map(|(_, export)| export))
    }
}

/// Where a predictor looks for the export it restores.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExportSource {
    /// A single export directory.
    Exact(SavedModelExport),
    /// The newest complete export under a directory of versioned exports.
    Latest(PathBuf),
}

impl ExportSource {
    pub fn path(&self) -> &Path {
        match self {
            ExportSource::Exact(export) => export.path(),
            ExportSource::Latest(root) => root,
        }
    }

    /// The export that is complete right now, if any. A root that does not
    /// exist yet holds no exports.
    pub fn poll(&self) -> PredictorResult<Option<SavedModelExport>> {
        match self {
            ExportSource::Exact(export) => Ok(export.is_complete().then(|| export.clone())),
            ExportSource::Latest(root) if !root.is_dir() => Ok(None),
            ExportSource::Latest(root) => SavedModelExport::latest_in(root),
        }
    }
}

impl From<SavedModelExport> for ExportSource {
    fn from(export: SavedModelExport) -> Self {
        ExportSource::Exact(export)
    }
}

impl fmt::Display for ExportSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportSource::Exact(export) => write!(f, "{}", export.path().display()),
            ExportSource::Latest(root) => write!(f, "latest under {}", root.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DType, TensorSpec};

    fn assets() -> ExportAssets {
        ExportAssets {
            feature_spec: SpecStructure::new()
                .with("x", TensorSpec::new("x", DType::F32, vec![Some(3)])),
            label_spec: SpecStructure::new(),
            global_step: Some(10),
        }
    }

    #[test]
    fn version_comes_from_directory_name() {
        assert_eq!(
            SavedModelExport::new("/models/1650000000").version().unwrap(),
            1650000000
        );
        assert!(matches!(
            SavedModelExport::new("/models/latest").version(),
            Err(PredictorError::InvalidVersion(_))
        ));
    }

    #[test]
    fn assets_round_trip_marks_export_complete() {
        let dir = tempfile::tempdir().unwrap();
        let export = SavedModelExport::new(dir.path().join("7"));
        assert!(!export.is_complete());

        export.write_assets(&assets()).unwrap();
        assert!(export.is_complete());
        assert_eq!(export.load_assets().unwrap(), assets());
    }

    #[test]
    fn malformed_assets_are_metadata_errors() {
        let dir = tempfile::tempdir().unwrap();
        let export = SavedModelExport::new(dir.path().join("1"));
        fs::create_dir_all(dir.path().join("1").join(EXTRA_ASSETS_DIRECTORY)).unwrap();
        fs::write(export.assets_path(), "{ not json").unwrap();
        assert!(matches!(
            export.load_assets(),
            Err(PredictorError::Metadata { .. })
        ));
    }

    #[test]
    fn latest_in_picks_highest_complete_version() {
        let dir = tempfile::tempdir().unwrap();
        for version in ["3", "12"] {
            SavedModelExport::new(dir.path().join(version))
                .write_assets(&assets())
                .unwrap();
        }
        // Newer but still being written.
        fs::create_dir_all(dir.path().join("20")).unwrap();
        fs::create_dir_all(dir.path().join("tmp-export")).unwrap();

        let latest = SavedModelExport::latest_in(dir.path()).unwrap().unwrap();
        assert_eq!(latest.version().unwrap(), 12);
    }

    #[test]
    fn latest_in_empty_root_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SavedModelExport::latest_in(dir.path()).unwrap().is_none());
    }

    #[test]
    fn missing_assets_report_their_path() {
        let dir = tempfile::tempdir().unwrap();
        let export = SavedModelExport::new(dir.path().join("4"));
        match export.load_assets() {
            Err(PredictorError::Metadata { path, .. }) => assert_eq!(path, export.assets_path()),
            other => panic!("expected a metadata error, got {other:?}"),
        }
    }

    #[test]
    fn exact_source_waits_for_marker() {
        let dir = tempfile::tempdir().unwrap();
        let export = SavedModelExport::new(dir.path().join("8"));
        let source = ExportSource::from(export.clone());
        assert_eq!(source.poll().unwrap(), None);

        export.write_assets(&assets()).unwrap();
        assert_eq!(source.poll().unwrap(), Some(export));
    }

    #[test]
    fn latest_source_tolerates_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("exports");
        let source = ExportSource::Latest(root.clone());
        assert_eq!(source.poll().unwrap(), None);

        SavedModelExport::new(root.join("5"))
            .write_assets(&assets())
            .unwrap();
        let found = source.poll().unwrap().unwrap();
        assert_eq!(found.version().unwrap(), 5);
    }
}
