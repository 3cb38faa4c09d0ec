mod arbiter;
mod runner;
mod workspace;

pub use arbiter::{ContractViolation, ScoreReport, arbitrate, read_score};
pub use runner::{ProcessRunner, ProgramExit, RunOutcome};
pub use workspace::{Workspace, WorkspacePaths, flush_scratch_dir};

use std::time::Duration;

use serde::{Serialize, Serializer};

/// Final status of one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Succeeded,
    Failed,
}

/// Why an evaluation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Output file missing, unparseable or out of range
    ContractViolation,
    /// Non-zero exit or death by signal
    ProgramFailure,
    Timeout,
    /// Workspace, spawn or shutdown problems on our side
    Infrastructure,
}

/// Outcome of one evaluation request
///
/// Serializes as `{status, score, runtime_ms, error}`. The failure kind is
/// kept out of the wire format and only steers the transport status code.
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    status: Status,
    score: Option<f64>,
    #[serde(rename = "runtime_ms", serialize_with = "serialize_millis")]
    runtime: Duration,
    error: Option<String>,
    #[serde(skip)]
    failure: Option<FailureKind>,
}

impl Verdict {
    pub fn succeeded(score: f64) -> Self {
        Self {
            status: Status::Succeeded,
            score: Some(score),
            runtime: Duration::ZERO,
            error: None,
            failure: None,
        }
    }

    pub fn failed(kind: FailureKind, score: Option<f64>, error: String) -> Self {
        Self {
            status: Status::Failed,
            score,
            runtime: Duration::ZERO,
            error: Some(error),
            failure: Some(kind),
        }
    }

    pub fn infrastructure(error: String) -> Self {
        Self::failed(FailureKind::Infrastructure, None, error)
    }

    /// Stamps the elapsed wall-clock time onto the verdict
    pub fn with_runtime(self, runtime: Duration) -> Self {
        Self { runtime, ..self }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn score(&self) -> Option<f64> {
        self.score
    }

    pub fn runtime(&self) -> Duration {
        self.runtime
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn failure(&self) -> Option<FailureKind> {
        self.failure
    }

    pub fn is_infrastructure_error(&self) -> bool {
        self.failure == Some(FailureKind::Infrastructure)
    }
}

fn serialize_millis<S: Serializer>(runtime: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(runtime.as_secs_f64() * 1000.0)
}
