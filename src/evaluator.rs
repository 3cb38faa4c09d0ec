use std::ffi::OsString;
use std::fs;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::EvaluatorConfig;
use crate::sandbox::{ProcessRunner, Verdict, Workspace, WorkspacePaths, arbitrate};

/// The four blobs one evaluation needs, already validated as non-empty
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub submission: String,
    pub ground_truth: String,
    pub public_test: String,
    /// Source of the evaluation program
    pub program: String,
}

/// Runs evaluation programs against submissions and arbitrates their verdicts
///
/// Holds no per-request state; any number of evaluations may run on one
/// instance concurrently.
pub struct Evaluator {
    config: EvaluatorConfig,
    runner: ProcessRunner,
    token: CancellationToken,
}

impl Evaluator {
    /// Builds an evaluator, creating the scratch directory if needed
    ///
    /// Cancelling `token` kills every program still running.
    pub fn build(config: EvaluatorConfig, token: CancellationToken) -> Result<Self> {
        fs::create_dir_all(&config.scratch_dir).with_context(|| {
            format!(
                "failed to create scratch dir {}",
                config.scratch_dir.display()
            )
        })?;

        log::info!(
            "Evaluator ready: interpreter {:?}, timeout {:?}, scratch dir {}",
            config.interpreter,
            config.timeout,
            config.scratch_dir.display()
        );

        Ok(Self {
            runner: ProcessRunner::new(config.timeout),
            config,
            token,
        })
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Evaluates one request end to end
    ///
    /// Never fails: every problem, including our own, ends up in the verdict.
    /// No workspace file survives the call. File I/O stays off the async
    /// worker threads.
    pub async fn evaluate(&self, request: &EvaluationRequest) -> Verdict {
        let start_time = Instant::now();
        let verdict = self.run_in_workspace(request).await;
        let runtime = start_time.elapsed();

        log::info!(
            "Evaluation finished: {:?} score={:?} in {runtime:?}",
            verdict.status(),
            verdict.score()
        );
        verdict.with_runtime(runtime)
    }

    async fn run_in_workspace(&self, request: &EvaluationRequest) -> Verdict {
        let workspace = match self.prepare_workspace(request).await {
            Ok(workspace) => workspace,
            Err(e) => {
                log::error!("Error setting up evaluation files: {e:#}");
                return Verdict::infrastructure(format!(
                    "Internal server error setting up evaluation: {e:#}"
                ));
            }
        };

        let command = self.build_command(workspace.paths());
        let verdict = match self.runner.run(&command, &self.token).await {
            Ok(outcome) => {
                // Reading the output file is blocking I/O
                let output = workspace.paths().output.clone();
                tokio::task::spawn_blocking(move || arbitrate(&outcome, &output))
                    .await
                    .unwrap_or_else(|e| {
                        log::error!("Arbitration task failed: {e}");
                        Verdict::infrastructure(format!(
                            "Unexpected error during script execution: {e}"
                        ))
                    })
            }
            Err(e) => {
                log::error!("Unexpected execution error: {e:#}");
                Verdict::infrastructure(format!(
                    "Unexpected error during script execution: {e:#}"
                ))
            }
        };

        workspace.release().await;
        verdict
    }

    async fn prepare_workspace(&self, request: &EvaluationRequest) -> Result<Workspace> {
        let workspace =
            Workspace::allocate(&self.config.scratch_dir, &self.config.program_suffix).await?;
        workspace.populate(request).await?;

        let paths = workspace.paths();
        log::debug!("Running script: {}", paths.program.display());
        log::debug!("Submission file: {}", paths.submission.display());
        log::debug!("Ground Truth file: {}", paths.ground_truth.display());
        log::debug!("Public test file: {}", paths.public_test.display());
        log::debug!("Output file: {}", paths.output.display());

        Ok(workspace)
    }

    /// `interpreter..., program, submission, ground_truth, public_test, output`
    fn build_command(&self, paths: &WorkspacePaths) -> Vec<OsString> {
        self.config
            .interpreter
            .iter()
            .map(OsString::from)
            .chain(
                [
                    &paths.program,
                    &paths.submission,
                    &paths.ground_truth,
                    &paths.public_test,
                    &paths.output,
                ]
                .map(|path| path.as_os_str().to_os_string()),
            )
            .collect()
    }
}
