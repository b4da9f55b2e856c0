//! Process-level tests for the fault trap.
//!
//! The trap terminates the process, so each scenario runs the `error-cure`
//! binary as a child and inspects its exit status and `error.log`.

use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

const BIN: &str = env!("CARGO_BIN_EXE_error-cure");

fn error_log(dir: &Path) -> String {
    std::fs::read_to_string(dir.join("error.log")).unwrap_or_default()
}

fn wait_with_deadline(child: &mut Child, deadline: Duration) -> ExitStatus {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().expect("try_wait") {
            return status;
        }
        if start.elapsed() > deadline {
            let _ = child.kill();
            panic!("child did not exit within {deadline:?}");
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

fn run_drill(drill: &str, log_dir: &Path) -> ExitStatus {
    Command::new(BIN)
        .args(["--simulate", drill, "--log-dir"])
        .arg(log_dir)
        .env_remove("RUST_BACKTRACE")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("run error-cure")
}

#[test]
fn unobserved_rejection_is_logged_and_exits_with_one() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log_dir = temp.path().join("logs");

    let status = run_drill("unobserved-rejection", &log_dir);

    assert_eq!(status.code(), Some(1));
    let log = error_log(&log_dir);
    let records: Vec<_> = log.lines().collect();
    assert_eq!(records.len(), 1, "log: {log}");
    assert!(
        records[0].ends_with("] Unhandled rejection in task 'drill': simulated unobserved rejection"),
        "log: {log}"
    );
}

#[test]
fn uncaught_panic_is_logged_and_exits_with_one() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log_dir = temp.path().join("logs");

    let status = run_drill("uncaught-panic", &log_dir);

    assert_eq!(status.code(), Some(1));
    let log = error_log(&log_dir);
    assert_eq!(log.lines().count(), 1, "log: {log}");
    assert!(log.contains("Uncaught panic in thread"), "log: {log}");
    assert!(log.contains("simulated uncaught panic"), "log: {log}");
}

/// Start the armed server on a free port and wait until `/health` answers.
async fn spawn_armed_server(log_dir: &Path) -> (Child, String) {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral");
        listener.local_addr().expect("addr").port()
    };

    let mut child = Command::new(BIN)
        .args(["--port", &port.to_string(), "--log-dir"])
        .arg(log_dir)
        .env_remove("RUST_BACKTRACE")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn error-cure");

    let base_url = format!("http://127.0.0.1:{port}");
    let client = reqwest::Client::new();
    let start = Instant::now();
    loop {
        if client.get(format!("{base_url}/health")).send().await.is_ok() {
            break;
        }
        if start.elapsed() > Duration::from_secs(10) {
            let _ = child.kill();
            panic!("server did not come up");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    (child, base_url)
}

#[tokio::test]
async fn failing_background_job_terminates_server() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log_dir = temp.path().join("logs");
    let (mut child, base_url) = spawn_armed_server(&log_dir).await;

    let resp = reqwest::Client::new()
        .post(format!("{base_url}/jobs"))
        .send()
        .await
        .expect("HTTP POST /jobs");
    assert_eq!(resp.status(), 202);

    let status = wait_with_deadline(&mut child, Duration::from_secs(10));
    assert_eq!(status.code(), Some(1));
    let log = error_log(&log_dir);
    assert!(
        log.contains("Unhandled rejection in task 'report-export': export storage connection reset"),
        "log: {log}"
    );
}

#[tokio::test]
async fn handler_panic_does_not_trip_armed_trap() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log_dir = temp.path().join("logs");
    let (mut child, base_url) = spawn_armed_server(&log_dir).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{base_url}/panic"))
        .send()
        .await
        .expect("HTTP GET /panic");
    assert_eq!(resp.status(), 500);
    let resp = client
        .get(format!("{base_url}/health"))
        .send()
        .await
        .expect("HTTP GET /health after panic");
    assert_eq!(resp.status(), 200);

    let start = Instant::now();
    while !error_log(&log_dir).contains("handler panicked") && start.elapsed() < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let still_running = child.try_wait().expect("try_wait").is_none();
    let _ = child.kill();
    let _ = child.wait();
    assert!(still_running, "server exited after a handled panic");

    let log = error_log(&log_dir);
    assert_eq!(log.lines().count(), 1, "log: {log}");
    assert!(log.contains("handler panicked"), "log: {log}");
    assert!(!log.contains("Uncaught panic"), "log: {log}");
}
