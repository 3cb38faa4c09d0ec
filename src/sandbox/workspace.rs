use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::evaluator::EvaluationRequest;

/// Paths of the five transient files backing one evaluation
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub submission: PathBuf,
    pub ground_truth: PathBuf,
    pub public_test: PathBuf,
    pub program: PathBuf,
    pub output: PathBuf,
}

impl WorkspacePaths {
    fn new(scratch_dir: &Path, stem: &str, program_suffix: &str) -> Self {
        let file = |role: &str| scratch_dir.join(format!("{stem}_{role}"));
        Self {
            submission: file("submission.csv"),
            ground_truth: file("ground_truth.csv"),
            public_test: file("public_test.csv"),
            program: file(&format!("eval_script{program_suffix}")),
            output: file("output.txt"),
        }
    }

    fn all(&self) -> [&Path; 5] {
        [
            &self.submission,
            &self.ground_truth,
            &self.public_test,
            &self.program,
            &self.output,
        ]
    }
}

/// Transient files owned by a single evaluation
///
/// Every file this workspace created is removed exactly once, either by
/// [`Workspace::release`] on the blocking pool or, if the evaluation bailed
/// out before that, when it is dropped. This covers a half-finished
/// allocation too.
#[derive(Debug)]
pub struct Workspace {
    paths: WorkspacePaths,
    created: Vec<PathBuf>,
}

impl Workspace {
    /// Creates five fresh, empty files in `scratch_dir`
    ///
    /// Names carry a random UUID and files are opened with `create_new`, so
    /// concurrent allocations in the same directory never share a file.
    pub async fn allocate(scratch_dir: &Path, program_suffix: &str) -> Result<Self> {
        let stem = format!(
            "{}-{}",
            Local::now().format("%y%m%d-%H%M%S"),
            Uuid::new_v4().simple()
        );
        let mut workspace = Self {
            paths: WorkspacePaths::new(scratch_dir, &stem, program_suffix),
            created: Vec::with_capacity(5),
        };

        for path in workspace.paths.all().map(Path::to_path_buf) {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
                .with_context(|| format!("failed to create workspace file {}", path.display()))?;
            workspace.created.push(path);
        }

        log::debug!("Allocated workspace {stem} in {}", scratch_dir.display());
        Ok(workspace)
    }

    pub fn paths(&self) -> &WorkspacePaths {
        &self.paths
    }

    /// Writes every input blob and flushes it to disk
    ///
    /// Must complete before the evaluation program starts, so that it never
    /// observes a partial file.
    pub async fn populate(&self, request: &EvaluationRequest) -> Result<()> {
        for (path, content) in [
            (&self.paths.submission, &request.submission),
            (&self.paths.ground_truth, &request.ground_truth),
            (&self.paths.public_test, &request.public_test),
            (&self.paths.program, &request.program),
        ] {
            write_durably(path, content.as_bytes())
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        Ok(())
    }

    /// Removes the workspace files without blocking the async runtime
    pub async fn release(mut self) {
        let created = std::mem::take(&mut self.created);
        if let Err(e) = tokio::task::spawn_blocking(move || remove_files(created)).await {
            log::warn!("Workspace release task failed: {e}");
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        remove_files(std::mem::take(&mut self.created));
    }
}

/// Removes each path, including symlinks the program may have left in place
/// of a file, whether or not they point anywhere
fn remove_files(paths: Vec<PathBuf>) {
    for path in paths {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => log::warn!("Error removing temp file {}: {e}", path.display()),
        }
    }
}

async fn write_durably(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).truncate(true).open(path).await?;
    file.write_all(content).await?;
    file.flush().await?;
    file.sync_all().await
}

/// Removes every regular file or symlink left in `scratch_dir` by an earlier run
///
/// Failures are logged and skipped. Returns the number of files removed.
pub fn flush_scratch_dir(scratch_dir: &Path) -> Result<usize> {
    let entries = fs::read_dir(scratch_dir)
        .with_context(|| format!("failed to read scratch dir {}", scratch_dir.display()))?;

    let mut removed = 0;
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Failed to read scratch dir entry: {e}");
                continue;
            }
        };
        if !entry
            .file_type()
            .map(|t| t.is_file() || t.is_symlink())
            .unwrap_or(false)
        {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => log::warn!("Error removing stale file {}: {e}", entry.path().display()),
        }
    }

    log::info!(
        "Flushed {removed} stale file(s) from {}",
        scratch_dir.display()
    );
    Ok(removed)
}
