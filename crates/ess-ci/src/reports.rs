//! Test report archival.
//!
//! After the main stages finish, the JUnit XML file and the HTML coverage
//! directory are copied into the build's artifact directory, one
//! subdirectory per report kind, and recorded with their SHA-256 digests.
//! A missing report is not an error.

use std::fmt;
use std::path::{Path, PathBuf};

use ess_state::ContentDigest;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::Result;

/// Report locations, relative to the workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportsConfig {
    /// JUnit-style XML file.
    pub junit: Option<PathBuf>,
    /// HTML coverage directory.
    pub coverage: Option<PathBuf>,
}

impl ReportsConfig {
    pub fn is_empty(&self) -> bool {
        self.junit.is_none() && self.coverage.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Junit,
    Coverage,
}

impl ReportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKind::Junit => "junit",
            ReportKind::Coverage => "coverage",
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A report copied into the artifact directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedReport {
    pub kind: ReportKind,
    /// Path relative to the workspace, as declared.
    pub source: PathBuf,
    /// Absolute location of the archived copy.
    pub destination: PathBuf,
    /// Digest of the file, or of the directory listing for directories.
    pub digest: ContentDigest,
    pub size_bytes: u64,
    /// Number of files archived.
    pub files: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReportCollection {
    Collected(ArchivedReport),
    Missing { kind: ReportKind, path: PathBuf },
}

impl ReportCollection {
    pub fn kind(&self) -> ReportKind {
        match self {
            ReportCollection::Collected(report) => report.kind,
            ReportCollection::Missing { kind, .. } => *kind,
        }
    }

    pub fn is_collected(&self) -> bool {
        matches!(self, ReportCollection::Collected(_))
    }
}

/// Copy every declared report from `workspace` into `artifacts_dir`.
///
/// Reports that do not exist produce [`ReportCollection::Missing`] and a
/// warning; copy failures of existing reports are errors.
pub fn collect_reports(
    config: &ReportsConfig,
    workspace: &Path,
    artifacts_dir: &Path,
) -> Result<Vec<ReportCollection>> {
    let declared = [
        (ReportKind::Junit, config.junit.as_ref()),
        (ReportKind::Coverage, config.coverage.as_ref()),
    ];

    let mut collected = Vec::new();
    for (kind, path) in declared {
        let Some(path) = path else { continue };
        let source = workspace.join(path);
        if !source.exists() {
            warn!(report = %kind, path = %source.display(), "report not found");
            collected.push(ReportCollection::Missing {
                kind,
                path: path.clone(),
            });
            continue;
        }

        let kind_dir = artifacts_dir.join(kind.as_str());
        std::fs::create_dir_all(&kind_dir)?;
        let name = path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(kind.as_str()));
        let destination = kind_dir.join(name);

        let report = if source.is_dir() {
            archive_dir(kind, path, &source, &destination)?
        } else {
            archive_file(kind, path, &source, &destination)?
        };
        debug!(
            report = %kind,
            digest = %report.digest.short(),
            files = report.files,
            "report archived"
        );
        collected.push(ReportCollection::Collected(report));
    }
    Ok(collected)
}

fn archive_file(
    kind: ReportKind,
    declared: &Path,
    source: &Path,
    destination: &Path,
) -> Result<ArchivedReport> {
    let bytes = std::fs::read(source)?;
    std::fs::write(destination, &bytes)?;
    Ok(ArchivedReport {
        kind,
        source: declared.to_path_buf(),
        destination: destination.to_path_buf(),
        digest: ContentDigest::from_bytes(&bytes),
        size_bytes: bytes.len() as u64,
        files: 1,
    })
}

fn archive_dir(
    kind: ReportKind,
    declared: &Path,
    source: &Path,
    destination: &Path,
) -> Result<ArchivedReport> {
    let mut files = Vec::new();
    list_files(source, source, &mut files)?;
    files.sort();

    // Directory digest: sha256 over "<relative path>\0<file digest>\n" lines
    // in sorted path order.
    let mut hasher = Sha256::new();
    let mut size_bytes = 0u64;
    for relative in &files {
        let bytes = std::fs::read(source.join(relative))?;
        let target = destination.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, &bytes)?;

        size_bytes += bytes.len() as u64;
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update(b"\0");
        hasher.update(ContentDigest::from_bytes(&bytes).as_str().as_bytes());
        hasher.update(b"\n");
    }
    std::fs::create_dir_all(destination)?;

    let digest = ContentDigest::try_from(hex::encode(hasher.finalize()))?;
    Ok(ArchivedReport {
        kind,
        source: declared.to_path_buf(),
        destination: destination.to_path_buf(),
        digest,
        size_bytes,
        files: files.len(),
    })
}

/// Regular files under `dir`, relative to `root`. Symbolic links are not
/// followed, so a link cycle cannot recurse.
fn list_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_dir() {
            list_files(root, &path, out)?;
        } else if file_type.is_file() {
            if let Ok(relative) = path.strip_prefix(root) {
                out.push(relative.to_path_buf());
            }
        } else {
            debug!(path = %path.display(), "skipping non-regular file");
        }
    }
    Ok(())
}
