mod support;

use std::time::{Duration, Instant};

use pythia::config::SandboxPaths;
use pythia::message::{Status, Task};
use pythia::runner::Job;

use support::{sandbox_paths, task};

/// Run `task` with `input` against a script sandbox and check the result,
/// failing if execution takes more than a second over the time limit.
async fn run_task(
    paths: SandboxPaths,
    task: Task,
    input: &str,
    status: Status,
    output: &str,
) -> Duration {
    let time_limit = task.limits.time;
    let job = Job::new(task, input, paths);
    let start = Instant::now();
    let (got_status, got_output) = job.execute().await;
    let elapsed = start.elapsed();
    assert_eq!(got_status, status);
    assert_eq!(got_output.trim(), output.trim());
    assert!(
        elapsed <= Duration::from_secs(time_limit + 1),
        "task took {:?}, limit was {}s",
        elapsed,
        time_limit
    );
    elapsed
}

#[tokio::test]
async fn hello_world() {
    let dir = tempfile::tempdir().unwrap();
    let paths = sandbox_paths(dir.path(), "echo 'Hello world!'");
    run_task(paths, task(5, 1024), "", Status::Success, "Hello world!\n").await;
}

#[tokio::test]
async fn input_is_passed_as_a_block_device() {
    let dir = tempfile::tempdir().unwrap();
    // The input file travels in the ubd2r= argument; greet every line of it.
    let script = r#"
for arg in "$@"; do
    case "$arg" in
        ubd2r=*) while read name; do echo "Hello $name!"; done < "${arg#ubd2r=}" ;;
    esac
done
"#;
    let paths = sandbox_paths(dir.path(), script);
    run_task(
        paths,
        task(5, 1024),
        "me\npythia\n",
        Status::Success,
        "Hello me!\nHello pythia!\n",
    )
    .await;
}

#[tokio::test]
async fn non_zero_exit_is_a_crash() {
    let dir = tempfile::tempdir().unwrap();
    let paths = sandbox_paths(dir.path(), "echo broken\nexit 3");
    run_task(paths, task(5, 1024), "", Status::Crash, "broken\n").await;
}

#[tokio::test]
async fn stderr_joins_the_output() {
    let dir = tempfile::tempdir().unwrap();
    let paths = sandbox_paths(dir.path(), "echo out\necho err >&2");
    let job = Job::new(task(5, 1024), "", paths);
    let (status, output) = job.execute().await;
    assert_eq!(status, Status::Success);
    assert!(output.contains("out"));
    assert!(output.contains("err"));
}

#[tokio::test]
async fn spawn_failure_reports_error() {
    let dir = tempfile::tempdir().unwrap();
    let paths = SandboxPaths {
        sandbox: dir.path().join("does-not-exist"),
        env_dir: dir.path().to_path_buf(),
        tasks_dir: dir.path().to_path_buf(),
    };
    let job = Job::new(task(5, 1024), "", paths);
    let (status, output) = job.execute().await;
    assert_eq!(status, Status::Error);
    assert!(!output.is_empty());
}

#[tokio::test]
async fn wall_clock_timeout_kills_the_sandbox() {
    let dir = tempfile::tempdir().unwrap();
    let paths = sandbox_paths(dir.path(), "echo Start\nsleep 30\necho Done");
    let elapsed = run_task(paths, task(1, 1024), "", Status::Timeout, "Start\n").await;
    assert!(
        elapsed < Duration::from_secs(2),
        "timeout enforcement took {:?}",
        elapsed
    );
}

#[tokio::test]
async fn output_limits_mark_overflow() {
    let dir = tempfile::tempdir().unwrap();
    for (limit, status, output) in [
        (10, Status::Success, "abcde"),
        (5, Status::Success, "abcde"),
        (4, Status::Overflow, "abcd"),
        (3, Status::Overflow, "abc"),
    ] {
        let paths = sandbox_paths(dir.path(), "printf abcde");
        run_task(paths, task(5, limit), "", status, output).await;
    }
}

#[tokio::test]
async fn overflow_kills_the_sandbox_promptly() {
    let dir = tempfile::tempdir().unwrap();
    let paths = sandbox_paths(dir.path(), "printf abcde\nsleep 30");
    let elapsed = run_task(paths, task(30, 4), "", Status::Overflow, "abcd").await;
    assert!(
        elapsed < Duration::from_secs(2),
        "overflow kill took {:?}",
        elapsed
    );
}

#[tokio::test]
async fn abort_preserves_partial_output() {
    let dir = tempfile::tempdir().unwrap();
    let paths = sandbox_paths(dir.path(), "echo Start\nsleep 30\necho Done");
    let job = Job::new(task(30, 1024), "", paths);
    let handle = job.handle();

    let start = Instant::now();
    let ((status, output), _) = tokio::join!(job.execute(), async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.abort();
    });
    let elapsed = start.elapsed();

    assert_eq!(status, Status::Abort);
    assert_eq!(output, "Start\n");
    assert!(elapsed < Duration::from_secs(2), "abort took {:?}", elapsed);
}

#[tokio::test]
async fn trailing_nul_bytes_mark_end_of_output() {
    let dir = tempfile::tempdir().unwrap();
    let paths = sandbox_paths(dir.path(), r"printf 'abc\000junk'");
    run_task(paths, task(5, 1024), "", Status::Success, "abc").await;
}

#[tokio::test]
async fn crlf_is_normalized() {
    let dir = tempfile::tempdir().unwrap();
    let paths = sandbox_paths(dir.path(), r"printf 'a\r\nb\r\n'");
    let job = Job::new(task(5, 1024), "", paths);
    let (status, output) = job.execute().await;
    assert_eq!(status, Status::Success);
    assert_eq!(output, "a\nb\n");
}
