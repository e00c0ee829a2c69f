//! Discovery of migration artifacts on disk.
//!
//! A migrations directory holds `<digits><description>.sql` files and an
//! optional `manifest.toml` classifying the ones that must not run inside
//! a transaction:
//!
//! ```toml
//! [[artifact]]
//! file = "000_extensions.sql"
//! transactional = false
//!
//! [[artifact]]
//! file = "001_roles.sql"
//! bootstrap = true
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::MigrationError;

/// File name of the optional classification manifest.
pub const MANIFEST_FILE: &str = "manifest.toml";

/// How an artifact is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Runs inside a transaction together with its ledger record.
    Transactional,
    /// Runs directly, outside any transaction, then gets recorded.
    Special,
    /// Runs directly on every startup and is never recorded.
    Bootstrap,
}

/// One versioned unit of schema change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationArtifact {
    pub version: String,
    pub file_name: String,
    pub description: String,
    pub sql: String,
    pub kind: ArtifactKind,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    #[serde(default, rename = "artifact")]
    artifacts: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestEntry {
    file: String,
    #[serde(default = "default_transactional")]
    transactional: bool,
    #[serde(default)]
    bootstrap: bool,
}

fn default_transactional() -> bool {
    true
}

impl ManifestEntry {
    fn kind(&self) -> ArtifactKind {
        if self.bootstrap {
            ArtifactKind::Bootstrap
        } else if self.transactional {
            ArtifactKind::Transactional
        } else {
            ArtifactKind::Special
        }
    }
}

fn read(path: &Path) -> Result<String, MigrationError> {
    fs::read_to_string(path).map_err(|source| MigrationError::Discovery {
        path: path.to_path_buf(),
        source,
    })
}

fn load_manifest(dir: &Path) -> Result<HashMap<String, ArtifactKind>, MigrationError> {
    let path = dir.join(MANIFEST_FILE);
    if !path.is_file() {
        return Ok(HashMap::new());
    }

    let manifest: Manifest = toml::from_str(&read(&path)?)?;
    let mut kinds = HashMap::with_capacity(manifest.artifacts.len());
    for entry in manifest.artifacts {
        if !dir.join(&entry.file).is_file() {
            return Err(MigrationError::MissingManifestFile(entry.file));
        }
        kinds.insert(entry.file.clone(), entry.kind());
    }
    Ok(kinds)
}

/// Splits `001_add_users.sql` into `("001", "add users")`.
fn split_file_name(file_name: &str) -> Option<(String, String)> {
    let stem = file_name.strip_suffix(".sql")?;
    let digits = stem.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }

    let (version, rest) = stem.split_at(digits);
    let description = rest
        .trim_start_matches(['_', '-', '.', ' '])
        .replace(['_', '-'], " ");
    Some((version.to_string(), description))
}

/// Reads every `*.sql` artifact in `dir`, sorted by file name.
///
/// # Errors
///
/// Returns `MigrationError` if the directory or a file cannot be read, a
/// file has no numeric version prefix, two files share a version, or the
/// manifest is malformed or names a missing file.
pub fn discover_artifacts(dir: &Path) -> Result<Vec<MigrationArtifact>, MigrationError> {
    let discovery = |source| MigrationError::Discovery {
        path: dir.to_path_buf(),
        source,
    };

    let kinds = load_manifest(dir)?;

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(discovery)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<_, _>>()
        .map_err(discovery)?;
    paths.retain(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "sql"));
    paths.sort();

    let mut artifacts: Vec<MigrationArtifact> = Vec::with_capacity(paths.len());
    let mut seen: HashMap<String, String> = HashMap::new();

    for path in paths {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let (version, description) = split_file_name(&file_name)
            .ok_or_else(|| MigrationError::InvalidFileName(file_name.clone()))?;

        if let Some(first) = seen.insert(version.clone(), file_name.clone()) {
            return Err(MigrationError::DuplicateVersion {
                version,
                first,
                second: file_name,
            });
        }

        let kind = kinds
            .get(&file_name)
            .copied()
            .unwrap_or(ArtifactKind::Transactional);

        artifacts.push(MigrationArtifact {
            version,
            description,
            sql: read(&path)?,
            kind,
            file_name,
        });
    }

    tracing::debug!(
        directory = %dir.display(),
        count = artifacts.len(),
        "discovered migration artifacts"
    );

    Ok(artifacts)
}
