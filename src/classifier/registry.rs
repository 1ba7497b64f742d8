//! Versioned model registry.
//!
//! `registry.json` in the models directory points at the version in use
//! (`current_version`) and the last known-good version
//! (`baseline_version`). Bundles live in `<models_dir>/<version>/`.
//! Pointer updates are written to a temp file and renamed into place so a
//! crash never leaves a half-written manifest.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::model::ModelBundle;
use crate::types::RegimeError;

const MANIFEST_FILE: &str = "registry.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryManifest {
    pub current_version: String,
    pub baseline_version: String,
    #[serde(default)]
    pub versions: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

pub struct ModelRegistry {
    dir: PathBuf,
}

impl ModelRegistry {
    pub fn open(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    fn version_dir(&self, version: &str) -> PathBuf {
        self.dir.join(version)
    }

    /// Read the manifest.
    pub fn manifest(&self) -> Result<RegistryManifest, RegimeError> {
        let path = self.manifest_path();
        let raw = std::fs::read_to_string(&path).map_err(|e| RegimeError::ModelLoad {
            version: "registry".into(),
            message: format!("cannot read {}: {e}", path.display()),
        })?;
        serde_json::from_str(&raw).map_err(|e| RegimeError::ModelLoad {
            version: "registry".into(),
            message: format!("cannot parse {}: {e}", path.display()),
        })
    }

    /// Load the bundle `current_version` points at.
    pub fn load_current(&self) -> Result<ModelBundle, RegimeError> {
        let manifest = self.manifest()?;
        self.load_version(&manifest.current_version)
    }

    pub fn load_version(&self, version: &str) -> Result<ModelBundle, RegimeError> {
        let bundle = ModelBundle::load(&self.version_dir(version), version)?;
        if bundle.metadata.version != version {
            return Err(RegimeError::ModelLoad {
                version: version.to_string(),
                message: format!("metadata claims version {}", bundle.metadata.version),
            });
        }
        Ok(bundle)
    }

    /// Create a registry with `version` as both current and baseline.
    pub fn init(&self, bundle: &ModelBundle) -> Result<RegistryManifest> {
        let version = bundle.metadata.version.clone();
        bundle.save(&self.version_dir(&version))?;
        let manifest = RegistryManifest {
            current_version: version.clone(),
            baseline_version: version.clone(),
            versions: vec![version],
            updated_at: Utc::now(),
        };
        self.write_manifest(&manifest)?;
        Ok(manifest)
    }

    /// Store a new bundle and make it current. With `as_baseline`, it also
    /// becomes the rollback target.
    pub fn promote(&self, bundle: &ModelBundle, as_baseline: bool) -> Result<RegistryManifest> {
        bundle.validate()?;
        let version = bundle.metadata.version.clone();
        bundle.save(&self.version_dir(&version))?;

        let mut manifest = self.manifest()?;
        manifest.current_version = version.clone();
        if as_baseline {
            manifest.baseline_version = version.clone();
        }
        if !manifest.versions.contains(&version) {
            manifest.versions.push(version.clone());
        }
        manifest.updated_at = Utc::now();
        self.write_manifest(&manifest)?;

        info!(version = %version, baseline = as_baseline, "Model promoted");
        Ok(manifest)
    }

    /// Point `current_version` back at the baseline.
    ///
    /// Returns `false` when current already is the baseline. Fails if the
    /// baseline bundle itself does not load, leaving the manifest unchanged.
    pub fn rollback_to_baseline(&self) -> Result<bool> {
        let mut manifest = self.manifest()?;
        if manifest.current_version == manifest.baseline_version {
            return Ok(false);
        }

        if let Err(e) = self.load_version(&manifest.baseline_version) {
            warn!(error = %e, "Baseline model does not load, refusing rollback");
            bail!("baseline {} is not loadable: {e}", manifest.baseline_version);
        }

        let from = std::mem::replace(&mut manifest.current_version, manifest.baseline_version.clone());
        manifest.updated_at = Utc::now();
        self.write_manifest(&manifest)?;

        warn!(from = %from, to = %manifest.current_version, "Model rolled back to baseline");
        Ok(true)
    }

    fn write_manifest(&self, manifest: &RegistryManifest) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let json = serde_json::to_string_pretty(manifest)
            .context("Failed to serialise registry manifest")?;
        let tmp = self.dir.join(format!("{MANIFEST_FILE}.tmp"));
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, self.manifest_path())
            .context("Failed to move registry manifest into place")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
