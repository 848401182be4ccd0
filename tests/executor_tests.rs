use std::time::{Duration, Instant};

use gradegrid::worker::TestExecutor;

fn commands(list: &[&str]) -> Vec<String> {
    list.iter().map(|c| c.to_string()).collect()
}

#[tokio::test]
async fn test_captures_output_with_end_separator() {
    let dir = tempfile::tempdir().unwrap();
    let executor = TestExecutor::new();

    let outcome = executor
        .run_sequence(dir.path(), &commands(&["echo hello"]), 30)
        .await;

    assert!(outcome.passed);
    assert!(!outcome.timed_out);
    assert_eq!(
        String::from_utf8_lossy(&outcome.transcript),
        "hello\nEND echo hello\n"
    );
}

#[tokio::test]
async fn test_commands_run_in_order_in_the_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("input.txt"), "from the submission\n").unwrap();
    let executor = TestExecutor::new();

    let outcome = executor
        .run_sequence(
            dir.path(),
            &commands(&["cat input.txt", "echo second"]),
            30,
        )
        .await;

    assert!(outcome.passed);
    let transcript = String::from_utf8_lossy(&outcome.transcript);
    assert_eq!(
        transcript,
        "from the submission\nEND cat input.txt\nsecond\nEND echo second\n"
    );
}

#[tokio::test]
async fn test_nonzero_exit_aborts_the_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let executor = TestExecutor::new();

    let outcome = executor
        .run_sequence(
            dir.path(),
            &commands(&["echo one", "false", "echo never"]),
            30,
        )
        .await;

    assert!(!outcome.passed);
    assert!(!outcome.timed_out);
    let transcript = String::from_utf8_lossy(&outcome.transcript);
    assert!(transcript.contains("one\n"));
    assert!(transcript.contains("END false"));
    assert!(!transcript.contains("never"));
}

#[tokio::test]
async fn test_stderr_is_part_of_the_transcript() {
    let dir = tempfile::tempdir().unwrap();
    let executor = TestExecutor::new();

    // cat on a missing file complains on stderr and exits non-zero.
    let outcome = executor
        .run_sequence(dir.path(), &commands(&["cat missing.txt"]), 30)
        .await;

    assert!(!outcome.passed);
    let transcript = String::from_utf8_lossy(&outcome.transcript);
    assert!(transcript.contains("missing.txt"));
}

#[tokio::test]
async fn test_deadline_kills_a_runaway_command() {
    let dir = tempfile::tempdir().unwrap();
    let executor = TestExecutor::new();

    let started = Instant::now();
    let outcome = executor
        .run_sequence(dir.path(), &commands(&["sleep 100"]), 1)
        .await;

    assert!(outcome.timed_out);
    assert!(!outcome.passed);
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "the kill must fire at the deadline, not at command completion"
    );
}

#[tokio::test]
async fn test_deadline_is_shared_across_the_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let executor = TestExecutor::new();

    // Two sleeps that individually fit the budget but together exceed it.
    let started = Instant::now();
    let outcome = executor
        .run_sequence(dir.path(), &commands(&["sleep 1", "sleep 100"]), 2)
        .await;

    assert!(outcome.timed_out);
    assert!(started.elapsed() < Duration::from_secs(6));
}

#[tokio::test]
async fn test_unknown_program_fails_the_test() {
    let dir = tempfile::tempdir().unwrap();
    let executor = TestExecutor::new();

    let outcome = executor
        .run_sequence(
            dir.path(),
            &commands(&["definitely-not-a-real-program-47"]),
            30,
        )
        .await;

    assert!(!outcome.passed);
    assert!(!outcome.timed_out);
}

#[tokio::test]
async fn test_zero_output_command_still_gets_a_separator_line() {
    let dir = tempfile::tempdir().unwrap();
    let executor = TestExecutor::new();

    // The first command prints nothing; its marker still lands on its own
    // line.
    let outcome = executor
        .run_sequence(dir.path(), &commands(&["true", "echo hi"]), 30)
        .await;

    assert!(outcome.passed);
    assert_eq!(
        String::from_utf8_lossy(&outcome.transcript),
        "\nEND true\nhi\nEND echo hi\n"
    );
}

#[tokio::test]
async fn test_blank_commands_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let executor = TestExecutor::new();

    let outcome = executor
        .run_sequence(dir.path(), &commands(&["   ", "echo ok"]), 30)
        .await;

    assert!(outcome.passed);
    assert_eq!(
        String::from_utf8_lossy(&outcome.transcript),
        "ok\nEND echo ok\n"
    );
}

#[tokio::test]
async fn test_empty_sequence_passes_with_empty_transcript() {
    let dir = tempfile::tempdir().unwrap();
    let executor = TestExecutor::new();

    let outcome = executor.run_sequence(dir.path(), &[], 30).await;
    assert!(outcome.passed);
    assert!(outcome.transcript.is_empty());
}
