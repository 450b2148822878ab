//! Built-in pipeline handlers.
//!
//! Each supported pipeline ships a small handler behind the [`JobHandler`]
//! seam. The scheduler treats them as opaque; heavier payloads plug in the
//! same way.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::kernel::failure::JobFailure;

use super::scheduler::{JobContext, JobHandler};

const SKIPPED_DIRS: &[&str] = &[".git", "target", "node_modules", ".venv", "dist"];

const DEFAULT_IGNORE_PATTERNS: &[&str] =
    &["target/", "node_modules/", ".DS_Store", "*.log", ".env"];

const README_SECTIONS: &[&str] = &["## Installation", "## Usage", "## License"];

/// Resolve the handler for a pipeline id. Callers must have checked the id
/// against the supported set.
pub fn builtin(pipeline_id: &str) -> Option<Arc<dyn JobHandler>> {
    match pipeline_id {
        "duplicate-detection" => Some(Arc::new(DuplicateDetectionHandler)),
        "gitignore-update" => Some(Arc::new(GitignoreUpdateHandler)),
        "readme-enhancement" => Some(Arc::new(ReadmeEnhancementHandler)),
        "repomix-pack" => Some(Arc::new(RepomixPackHandler)),
        _ => None,
    }
}

fn repository_path(ctx: &JobContext) -> Result<PathBuf, JobFailure> {
    let raw = ctx
        .data
        .get("repositoryPath")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| JobFailure::new("repositoryPath is required").with_code("EINVAL"))?;
    let path = PathBuf::from(raw);
    if !path.is_dir() {
        return Err(
            JobFailure::new(format!("repository path {raw} does not exist")).with_code("ENOENT"),
        );
    }
    Ok(path)
}

/// Depth-first file walk, skipping VCS and build directories.
fn walk_files(root: &Path, cancelled: &CancellationToken) -> Result<Vec<PathBuf>, JobFailure> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if cancelled.is_cancelled() {
            return Err(JobFailure::cancelled("scan cancelled"));
        }
        for entry in std::fs::read_dir(&dir).map_err(JobFailure::from)? {
            let entry = entry.map_err(JobFailure::from)?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(JobFailure::from)?;
            if file_type.is_dir() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if !SKIPPED_DIRS.contains(&name.as_ref()) {
                    stack.push(path);
                }
            } else if file_type.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

// ---------------------------------------------------------------------------
// duplicate-detection
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct DuplicateGroup {
    digest: String,
    files: Vec<String>,
}

#[derive(Debug, Serialize)]
struct DuplicateReport {
    files_scanned: usize,
    duplicate_groups: Vec<DuplicateGroup>,
}

/// Hashes every file's contents and reports groups sharing a digest.
struct DuplicateDetectionHandler;

#[async_trait::async_trait]
impl JobHandler for DuplicateDetectionHandler {
    async fn run(&self, ctx: JobContext) -> Result<serde_json::Value, JobFailure> {
        let root = repository_path(&ctx)?;
        let cancelled = ctx.cancellation_token();
        let report = tokio::task::spawn_blocking(move || scan_for_duplicates(&root, &cancelled))
            .await
            .map_err(|e| JobFailure::new(format!("scan task failed: {e}")))??;
        serde_json::to_value(report).map_err(|e| JobFailure::new(e.to_string()))
    }
}

fn scan_for_duplicates(
    root: &Path,
    cancelled: &CancellationToken,
) -> Result<DuplicateReport, JobFailure> {
    let files = walk_files(root, cancelled)?;
    let mut by_digest: HashMap<String, Vec<String>> = HashMap::new();
    for path in &files {
        if cancelled.is_cancelled() {
            return Err(JobFailure::cancelled("scan cancelled"));
        }
        let contents = std::fs::read(path).map_err(JobFailure::from)?;
        let digest = hex::encode(Sha256::digest(&contents));
        let relative = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string();
        by_digest.entry(digest).or_default().push(relative);
    }

    let mut duplicate_groups: Vec<DuplicateGroup> = by_digest
        .into_iter()
        .filter(|(_, group)| group.len() > 1)
        .map(|(digest, mut group)| {
            group.sort();
            DuplicateGroup {
                digest,
                files: group,
            }
        })
        .collect();
    duplicate_groups.sort_by(|a, b| a.files.cmp(&b.files));

    Ok(DuplicateReport {
        files_scanned: files.len(),
        duplicate_groups,
    })
}

// ---------------------------------------------------------------------------
// gitignore-update
// ---------------------------------------------------------------------------

/// Ensures a baseline set of ignore patterns is present.
struct GitignoreUpdateHandler;

#[async_trait::async_trait]
impl JobHandler for GitignoreUpdateHandler {
    async fn run(&self, ctx: JobContext) -> Result<serde_json::Value, JobFailure> {
        let root = repository_path(&ctx)?;
        let path = root.join(".gitignore");
        let existing = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(JobFailure::from(e)),
        };

        let present: Vec<&str> = existing.lines().map(str::trim).collect();
        let added: Vec<&str> = DEFAULT_IGNORE_PATTERNS
            .iter()
            .copied()
            .filter(|pattern| !present.contains(pattern))
            .collect();

        if !added.is_empty() {
            let mut updated = existing.clone();
            if !updated.is_empty() && !updated.ends_with('\n') {
                updated.push('\n');
            }
            for pattern in &added {
                updated.push_str(pattern);
                updated.push('\n');
            }
            tokio::fs::write(&path, updated).await.map_err(JobFailure::from)?;
        }

        Ok(serde_json::json!({
            "path": path.to_string_lossy(),
            "added": added,
            "alreadyPresent": DEFAULT_IGNORE_PATTERNS.len() - added.len(),
        }))
    }
}

// ---------------------------------------------------------------------------
// readme-enhancement
// ---------------------------------------------------------------------------

/// Reports which standard sections a README is missing; creates a stub when
/// the file is absent entirely.
struct ReadmeEnhancementHandler;

#[async_trait::async_trait]
impl JobHandler for ReadmeEnhancementHandler {
    async fn run(&self, ctx: JobContext) -> Result<serde_json::Value, JobFailure> {
        let root = repository_path(&ctx)?;
        let path = root.join("README.md");

        let (existed, contents) = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => (true, contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let name = root
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "repository".to_string());
                let stub = format!("# {name}\n");
                tokio::fs::write(&path, &stub).await.map_err(JobFailure::from)?;
                (false, stub)
            }
            Err(e) => return Err(JobFailure::from(e)),
        };

        let missing: Vec<&str> = README_SECTIONS
            .iter()
            .copied()
            .filter(|section| !contents.contains(section))
            .collect();

        Ok(serde_json::json!({
            "path": path.to_string_lossy(),
            "existed": existed,
            "missingSections": missing,
        }))
    }
}

// ---------------------------------------------------------------------------
// repomix-pack
// ---------------------------------------------------------------------------

/// Builds a pack index of the repository: every file with its size, plus a
/// total, for downstream packers.
struct RepomixPackHandler;

#[async_trait::async_trait]
impl JobHandler for RepomixPackHandler {
    async fn run(&self, ctx: JobContext) -> Result<serde_json::Value, JobFailure> {
        let root = repository_path(&ctx)?;
        let cancelled = ctx.cancellation_token();
        let index = tokio::task::spawn_blocking(move || pack_index(&root, &cancelled))
            .await
            .map_err(|e| JobFailure::new(format!("pack task failed: {e}")))??;
        Ok(index)
    }
}

fn pack_index(root: &Path, cancelled: &CancellationToken) -> Result<serde_json::Value, JobFailure> {
    let files = walk_files(root, cancelled)?;
    let mut entries = Vec::with_capacity(files.len());
    let mut total_bytes: u64 = 0;
    for path in &files {
        let bytes = std::fs::metadata(path).map_err(JobFailure::from)?.len();
        total_bytes += bytes;
        entries.push(serde_json::json!({
            "path": path.strip_prefix(root).unwrap_or(path).to_string_lossy(),
            "bytes": bytes,
        }));
    }
    Ok(serde_json::json!({
        "files": entries,
        "fileCount": entries.len(),
        "totalBytes": total_bytes,
    }))
}
