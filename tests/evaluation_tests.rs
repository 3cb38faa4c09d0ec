use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use evald::config::EvaluatorConfig;
use evald::evaluator::{EvaluationRequest, Evaluator};
use evald::sandbox::{FailureKind, Status};

// Scores submissions by RMSE between predicted and true values on matching ids
const RMSE_PROGRAM: &str = r#"
awk -F, '
FNR == 1 { next }
FILENAME == ARGV[1] { pred[$1] = $2; next }
($1 in pred) { d = pred[$1] - $2; sum += d * d; n++ }
END {
  if (n == 0) exit 1
  printf "%.17g", 2 / (1 + exp(sqrt(sum / n)))
}' "$1" "$2" > "$4"
"#;

// Helper function to create an evaluator over an isolated scratch root
fn create_evaluator(timeout: Duration) -> (Evaluator, tempfile::TempDir) {
    create_evaluator_with(vec!["sh".to_string()], timeout)
}

fn create_evaluator_with(
    interpreter: Vec<String>,
    timeout: Duration,
) -> (Evaluator, tempfile::TempDir) {
    let scratch = tempfile::tempdir().unwrap();
    let config = EvaluatorConfig {
        interpreter,
        timeout,
        scratch_dir: scratch.path().to_path_buf(),
        program_suffix: ".sh".to_string(),
    };
    let evaluator = Evaluator::build(config, CancellationToken::new()).unwrap();
    (evaluator, scratch)
}

fn request(program: &str) -> EvaluationRequest {
    EvaluationRequest {
        submission: "id,SalePrice\n1,100\n2,200\n".to_string(),
        ground_truth: "id,SalePrice\n1,100\n2,200\n".to_string(),
        public_test: "id\n1\n2\n".to_string(),
        program: program.to_string(),
    }
}

fn leftover_files(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect()
}

// A process counts as gone once it is reaped or a zombie
fn process_alive(pid: u32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    let state = stat
        .rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next());
    state != Some('Z')
}

async fn wait_until_dead(pid: u32) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if !process_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_zero_exit_with_score_succeeds() {
    let (evaluator, scratch) = create_evaluator(Duration::from_secs(10));

    let verdict = evaluator
        .evaluate(&request(r#"printf '0.875' > "$4""#))
        .await;

    assert_eq!(verdict.status(), Status::Succeeded);
    assert_eq!(verdict.score(), Some(0.875));
    assert_eq!(verdict.error(), None);
    assert!(verdict.runtime() > Duration::ZERO);
    assert!(leftover_files(scratch.path()).is_empty());
}

#[tokio::test]
async fn test_program_sees_every_input() {
    let (evaluator, scratch) = create_evaluator(Duration::from_secs(10));

    // Exits non-zero unless all three inputs arrived complete
    let program = r#"
grep -q '2,200' "$1" || exit 7
grep -q '2,200' "$2" || exit 8
grep -q '^2$' "$3" || exit 9
echo 1.5 > "$4"
"#;
    let verdict = evaluator.evaluate(&request(program)).await;

    assert_eq!(verdict.status(), Status::Succeeded);
    assert_eq!(verdict.score(), Some(1.5));
    assert!(leftover_files(scratch.path()).is_empty());
}

#[tokio::test]
async fn test_format_error_sentinel_survives_failure() {
    let (evaluator, scratch) = create_evaluator(Duration::from_secs(10));

    let program = r#"
echo "submission is missing column 'id'" >&2
echo -1.0 > "$4"
exit 1
"#;
    let verdict = evaluator.evaluate(&request(program)).await;

    assert_eq!(verdict.status(), Status::Failed);
    assert_eq!(verdict.score(), Some(-1.0));
    assert_eq!(verdict.failure(), Some(FailureKind::ProgramFailure));
    let error = verdict.error().unwrap();
    assert!(error.starts_with("Script exited with error code 1."));
    assert!(error.contains("missing column 'id'"));
    assert!(leftover_files(scratch.path()).is_empty());
}

#[tokio::test]
async fn test_computation_error_sentinel_survives_failure() {
    let (evaluator, _scratch) = create_evaluator(Duration::from_secs(10));

    let verdict = evaluator
        .evaluate(&request("echo 0.0 > \"$4\"\nexit 2\n"))
        .await;

    assert_eq!(verdict.status(), Status::Failed);
    assert_eq!(verdict.score(), Some(0.0));
    assert_eq!(verdict.failure(), Some(FailureKind::ProgramFailure));
}

#[tokio::test]
async fn test_zero_exit_without_score_fails() {
    let (evaluator, scratch) = create_evaluator(Duration::from_secs(10));

    for program in ["true", r#"echo 'n/a' > "$4""#, r#"rm "$4""#] {
        let verdict = evaluator.evaluate(&request(program)).await;
        assert_eq!(verdict.status(), Status::Failed, "program: {program}");
        assert_eq!(verdict.score(), None, "program: {program}");
        assert_eq!(
            verdict.failure(),
            Some(FailureKind::ContractViolation),
            "program: {program}"
        );
    }
    assert!(leftover_files(scratch.path()).is_empty());
}

#[tokio::test]
async fn test_illegal_negative_score_overrides_zero_exit() {
    let (evaluator, _scratch) = create_evaluator(Duration::from_secs(10));

    let verdict = evaluator
        .evaluate(&request(r#"echo -2.5 > "$4""#))
        .await;

    assert_eq!(verdict.status(), Status::Failed);
    assert_eq!(verdict.score(), None);
    assert_eq!(verdict.failure(), Some(FailureKind::ContractViolation));
}

#[tokio::test]
async fn test_timeout_kills_process_tree_and_cleans_up() {
    let (evaluator, scratch) = create_evaluator(Duration::from_secs(1));
    let markers = tempfile::tempdir().unwrap();
    let shell_pid_file = markers.path().join("shell.pid");
    let child_pid_file = markers.path().join("child.pid");

    let program = format!(
        r#"
echo $$ > '{}'
sleep 30 &
echo $! > '{}'
echo "still working" >&2
echo 0.5 > "$4"
wait
"#,
        shell_pid_file.display(),
        child_pid_file.display()
    );

    let started = Instant::now();
    let verdict = evaluator.evaluate(&request(&program)).await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(verdict.status(), Status::Failed);
    assert_eq!(verdict.score(), None);
    assert_eq!(verdict.failure(), Some(FailureKind::Timeout));
    let error = verdict.error().unwrap();
    assert!(error.starts_with("Evaluation script timed out after 1 seconds."));
    assert!(error.contains("still working"));
    assert!(leftover_files(scratch.path()).is_empty());

    for pid_file in [&shell_pid_file, &child_pid_file] {
        let pid: u32 = fs::read_to_string(pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(wait_until_dead(pid).await, "process {pid} still running");
    }
}

#[tokio::test]
async fn test_concurrent_evaluations_are_independent() {
    let (evaluator, scratch) = create_evaluator(Duration::from_secs(20));
    let evaluator = Arc::new(evaluator);

    // Echoes the submission back as the score after a short pause
    let program = "sleep 0.2\ncat \"$1\" > \"$4\"\n";

    let mut tasks = JoinSet::new();
    for i in 0..8u32 {
        let evaluator = Arc::clone(&evaluator);
        let mut request = request(program);
        request.submission = format!("{i}.25");
        tasks.spawn(async move { (i, evaluator.evaluate(&request).await) });
    }

    let mut seen = 0;
    while let Some(result) = tasks.join_next().await {
        let (i, verdict) = result.unwrap();
        assert_eq!(verdict.status(), Status::Succeeded);
        assert_eq!(verdict.score(), Some(f64::from(i) + 0.25));
        seen += 1;
    }
    assert_eq!(seen, 8);
    assert!(leftover_files(scratch.path()).is_empty());
}

#[tokio::test]
async fn test_spawn_failure_is_infrastructure_error() {
    let (evaluator, scratch) = create_evaluator_with(
        vec!["/nonexistent/interpreter".to_string()],
        Duration::from_secs(5),
    );

    let verdict = evaluator.evaluate(&request("true")).await;

    assert!(verdict.is_infrastructure_error());
    assert_eq!(verdict.status(), Status::Failed);
    assert_eq!(verdict.score(), None);
    assert!(
        verdict
            .error()
            .unwrap()
            .starts_with("Unexpected error during script execution")
    );
    assert!(leftover_files(scratch.path()).is_empty());
}

#[tokio::test]
async fn test_workspace_failure_is_infrastructure_error() {
    let (evaluator, scratch) = create_evaluator(Duration::from_secs(5));
    fs::remove_dir(scratch.path()).unwrap();

    let verdict = evaluator.evaluate(&request("true")).await;

    assert!(verdict.is_infrastructure_error());
    assert_eq!(verdict.score(), None);
    assert!(
        verdict
            .error()
            .unwrap()
            .starts_with("Internal server error setting up evaluation")
    );
}

#[tokio::test]
async fn test_rmse_scoring_is_deterministic() {
    let (evaluator, scratch) = create_evaluator(Duration::from_secs(10));

    // Perfect predictions score exactly 2 * sigmoid(0) = 1
    let verdict = evaluator.evaluate(&request(RMSE_PROGRAM)).await;
    assert_eq!(verdict.status(), Status::Succeeded);
    assert_eq!(verdict.score(), Some(1.0));

    let mut off_by_some = request(RMSE_PROGRAM);
    off_by_some.submission = "id,SalePrice\n1,103\n2,196\n".to_string();

    let first = evaluator.evaluate(&off_by_some).await;
    let second = evaluator.evaluate(&off_by_some).await;
    assert_eq!(first.status(), Status::Succeeded);

    let first_score = first.score().unwrap();
    let second_score = second.score().unwrap();
    assert_eq!(first_score.to_bits(), second_score.to_bits());

    let expected = 2.0 / (1.0 + 12.5f64.sqrt().exp());
    assert!((first_score - expected).abs() < 1e-12);
    assert!(leftover_files(scratch.path()).is_empty());
}

#[tokio::test]
async fn test_rmse_without_matching_ids_fails() {
    let (evaluator, _scratch) = create_evaluator(Duration::from_secs(10));

    let mut unmatched = request(RMSE_PROGRAM);
    unmatched.submission = "id,SalePrice\n9,100\n".to_string();

    let verdict = evaluator.evaluate(&unmatched).await;
    assert_eq!(verdict.status(), Status::Failed);
    assert_eq!(verdict.score(), None);
    assert_eq!(verdict.failure(), Some(FailureKind::ProgramFailure));
}

#[tokio::test]
async fn test_shutdown_cancels_running_evaluation() {
    let scratch = tempfile::tempdir().unwrap();
    let token = CancellationToken::new();
    let config = EvaluatorConfig {
        interpreter: vec!["sh".to_string()],
        timeout: Duration::from_secs(30),
        scratch_dir: scratch.path().to_path_buf(),
        program_suffix: ".sh".to_string(),
    };
    let evaluator = Evaluator::build(config, token.clone()).unwrap();

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let verdict = evaluator.evaluate(&request("sleep 30")).await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(verdict.is_infrastructure_error());
    assert_eq!(verdict.score(), None);
    assert!(leftover_files(scratch.path()).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_large_inputs_on_multi_thread_runtime() {
    let (evaluator, scratch) = create_evaluator(Duration::from_secs(20));
    let evaluator = Arc::new(evaluator);

    let submission = format!("id,SalePrice\n{}", "1,100\n".repeat(500_000));
    let program = format!(
        r#"[ "$(wc -c < "$1")" -eq {} ] && printf '1' > "$4""#,
        submission.len()
    );

    let mut tasks = JoinSet::new();
    for _ in 0..4 {
        let evaluator = Arc::clone(&evaluator);
        let mut request = request(&program);
        request.submission = submission.clone();
        tasks.spawn(async move { evaluator.evaluate(&request).await });
    }

    while let Some(result) = tasks.join_next().await {
        let verdict = result.unwrap();
        assert_eq!(verdict.status(), Status::Succeeded);
        assert_eq!(verdict.score(), Some(1.0));
    }
    assert!(leftover_files(scratch.path()).is_empty());
}

#[tokio::test]
async fn test_dangling_symlink_output_is_cleaned_up() {
    let (evaluator, scratch) = create_evaluator(Duration::from_secs(10));

    let program = "rm \"$4\"\nln -s /nonexistent/score \"$4\"\n";
    let verdict = evaluator.evaluate(&request(program)).await;

    assert_eq!(verdict.status(), Status::Failed);
    assert_eq!(verdict.failure(), Some(FailureKind::ContractViolation));
    assert!(leftover_files(scratch.path()).is_empty());
}
