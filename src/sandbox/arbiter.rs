use std::fmt;
use std::fs;
use std::path::Path;

use super::{FailureKind, ProgramExit, RunOutcome, Verdict};

/// Sentinel a program writes when the submission itself is malformed
const FORMAT_ERROR_SENTINEL: f64 = -1.0;

/// A legal score read back from the output file
///
/// `0.0` doubles as the "scoring logic errored" sentinel; whether it means
/// that depends on the exit code, so it stays a plain `Success` here.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreReport {
    Success(f64),
    FormatError,
}

impl ScoreReport {
    /// Parses the textual contents of the output file
    pub fn parse(contents: &str) -> Result<Self, ContractViolation> {
        let text = contents.trim();
        let score: f64 = text
            .parse()
            .map_err(|_| ContractViolation::Unparseable(text.to_string()))?;

        if !score.is_finite() {
            return Err(ContractViolation::NotFinite(score));
        }
        // `0.0` is subsumed by `>= 0`
        let legal = score == FORMAT_ERROR_SENTINEL || score == 0.0 || score >= 0.0;
        if !legal {
            return Err(ContractViolation::OutOfRange(score));
        }

        if score == FORMAT_ERROR_SENTINEL {
            Ok(Self::FormatError)
        } else {
            Ok(Self::Success(score))
        }
    }

    /// The value as it travels on the wire
    pub fn value(&self) -> f64 {
        match self {
            Self::Success(score) => *score,
            Self::FormatError => FORMAT_ERROR_SENTINEL,
        }
    }
}

/// The output file does not honor the score contract
#[derive(Debug)]
pub enum ContractViolation {
    Unreadable(std::io::Error),
    Unparseable(String),
    NotFinite(f64),
    OutOfRange(f64),
}

impl fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreadable(e) => write!(f, "{e}"),
            Self::Unparseable(text) => write!(f, "could not convert string to float: '{text}'"),
            Self::NotFinite(score) => {
                write!(f, "Score read from file ({score}) is not a finite number.")
            }
            Self::OutOfRange(score) => {
                write!(f, "Score read from file ({score}) is not -1.0, 0.0, or >= 0.")
            }
        }
    }
}

impl std::error::Error for ContractViolation {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Unreadable(e) => Some(e),
            _ => None,
        }
    }
}

/// Reads the output file and checks it against the score contract
pub fn read_score(output_path: &Path) -> Result<ScoreReport, ContractViolation> {
    let contents = fs::read_to_string(output_path).map_err(ContractViolation::Unreadable)?;
    ScoreReport::parse(&contents)
}

/// Turns the observed run into the single authoritative verdict
///
/// The output file is read before the exit code is looked at, so a failing
/// program can still hand back `-1.0` or `0.0`. A timed out run never has its
/// output file inspected.
pub fn arbitrate(outcome: &RunOutcome, output_path: &Path) -> Verdict {
    let (exit, stderr) = match outcome {
        RunOutcome::Exited { exit, stderr, .. } => (*exit, stderr.as_str()),
        RunOutcome::TimedOut { limit, stderr } => {
            let stderr = stderr.trim();
            let stderr = if stderr.is_empty() {
                "No stderr output."
            } else {
                stderr
            };
            let message = format!(
                "Evaluation script timed out after {} seconds. Stderr: {stderr}",
                limit.as_secs_f64()
            );
            log::warn!("{message}");
            return Verdict::failed(FailureKind::Timeout, None, message);
        }
        RunOutcome::Cancelled { .. } => {
            log::warn!("Evaluation cancelled before the program finished");
            return Verdict::infrastructure(
                "Evaluation cancelled: service shutting down".to_string(),
            );
        }
    };

    let report = read_score(output_path);
    if let Err(violation) = &report {
        log::info!(
            "Failed to read/parse score from output file '{}': {violation}. Script stderr: {stderr}",
            output_path.display()
        );
    }
    let score = report.as_ref().ok().map(ScoreReport::value);

    match exit {
        ProgramExit::Code(0) => match report {
            Ok(report) => Verdict::succeeded(report.value()),
            Err(violation) => {
                let message = format!(
                    "Script exited successfully but failed to write a valid score to '{}': {violation}. Script stderr: {stderr}",
                    output_path.display()
                );
                log::info!("{message}");
                Verdict::failed(FailureKind::ContractViolation, None, message)
            }
        },
        ProgramExit::Code(code) => {
            let message = format!("Script exited with error code {code}. Stderr: {stderr}");
            log::info!("{message}");
            Verdict::failed(FailureKind::ProgramFailure, score, message)
        }
        ProgramExit::Signal(signal) => {
            let message = format!("Script was terminated by signal {signal}. Stderr: {stderr}");
            log::info!("{message}");
            Verdict::failed(FailureKind::ProgramFailure, score, message)
        }
    }
}
