//! Unit tests for `FileErrorLog`.
//!
//! Validates lazy directory creation, the `[<timestamp>] <diagnostic>` line
//! format, ordering under concurrent records, and that an unusable log
//! location never surfaces as an error to the caller.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use error_cure::sink::LOG_FILE_NAME;
use error_cure::{ErrorLog, Fault, FileErrorLog, Incident};

const FLUSH: Duration = Duration::from_secs(5);

fn read_log(log: &FileErrorLog) -> String {
    assert!(log.flush(FLUSH), "log must drain");
    fs::read_to_string(log.log_path()).expect("read error.log")
}

// ── Directory handling ────────────────────────────────────────────────────────

#[test]
fn new_does_not_create_directory_until_first_record() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log_dir = temp.path().join("logs");
    let log = FileErrorLog::new(log_dir.clone()).expect("log");

    assert!(!log_dir.exists());
    log.record(&Fault::not_found("User").into());
    assert!(log.flush(FLUSH));
    assert!(log_dir.is_dir(), "first record creates the directory");
}

#[test]
fn record_creates_missing_ancestors() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log_dir = temp.path().join("a").join("b").join("logs");
    let log = FileErrorLog::new(log_dir.clone()).expect("log");

    log.record(&Incident::unexpected("deep"));

    assert!(log_dir.is_dir());
    assert_eq!(log.log_path(), log_dir.join(LOG_FILE_NAME));
    assert!(read_log(&log).contains("deep"));
}

#[test]
fn repeated_records_reuse_existing_directory() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log_dir = temp.path().join("logs");
    fs::create_dir_all(&log_dir).expect("pre-create");
    fs::write(log_dir.join("keep.txt"), "x").expect("marker");
    let log = FileErrorLog::new(log_dir.clone()).expect("log");

    for _ in 0..3 {
        log.record(&Incident::unexpected("again"));
    }

    let records = read_log(&log)
        .lines()
        .filter(|line| line.starts_with('['))
        .count();
    assert_eq!(records, 3);
    assert!(log_dir.join("keep.txt").exists(), "directory is not recreated");
}

#[test]
fn concurrent_directory_creation_is_tolerated() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log_dir = temp.path().join("shared");
    let logs: Vec<_> = (0..4)
        .map(|_| Arc::new(FileErrorLog::new(log_dir.clone()).expect("log")))
        .collect();

    let handles: Vec<_> = logs
        .iter()
        .map(|log| {
            let log = Arc::clone(log);
            std::thread::spawn(move || log.record(&Incident::unexpected("race")))
        })
        .collect();
    for h in handles {
        h.join().expect("record must not panic");
    }

    for log in &logs {
        assert!(log.flush(FLUSH));
    }
    let content = fs::read_to_string(log_dir.join(LOG_FILE_NAME)).expect("read");
    let records = content.lines().filter(|line| line.starts_with('[')).count();
    assert_eq!(records, 4);
}

// ── Line format ───────────────────────────────────────────────────────────────

#[test]
fn line_is_timestamp_then_diagnostic() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = FileErrorLog::new(temp.path().to_owned()).expect("log");
    let incident = Incident::unexpected("Test Error");

    log.record(&incident);
    let content = read_log(&log);

    assert!(content.starts_with('['), "line starts with timestamp: {content}");
    let (stamp, rest) = content[1..].split_once("] ").expect("timestamp delimiter");
    assert!(
        chrono::DateTime::parse_from_rfc3339(stamp).is_ok(),
        "ISO-8601 timestamp: {stamp}"
    );
    assert!(stamp.ends_with('Z'), "UTC timestamp: {stamp}");
    assert_eq!(rest, format!("{}\n", incident.diagnostic()));
}

#[test]
fn line_ends_with_trace_when_present() {
    #[derive(Debug)]
    struct Wrapped(std::io::Error);

    impl std::fmt::Display for Wrapped {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("upload failed")
        }
    }

    impl std::error::Error for Wrapped {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    let temp = tempfile::tempdir().expect("tempdir");
    let log = FileErrorLog::new(temp.path().to_owned()).expect("log");
    let incident = Incident::from_error(&Wrapped(std::io::Error::other("bucket missing")));
    let trace = incident.trace().expect("trace").to_owned();

    log.record(&incident);

    assert!(read_log(&log).ends_with(&format!("{trace}\n")));
}

#[test]
fn database_fault_line_names_the_query() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = FileErrorLog::new(temp.path().to_owned()).expect("log");

    log.record(&Fault::database("UPDATE ledger SET total = 0").into());

    let content = read_log(&log);
    assert!(content.contains("DatabaseFault"), "log: {content}");
    assert!(
        content.contains("[query: UPDATE ledger SET total = 0]"),
        "log: {content}"
    );
}

#[test]
fn record_message_writes_free_form_line() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = FileErrorLog::new(temp.path().to_owned()).expect("log");

    log.record_message("Unhandled rejection in task 'x': boom");

    assert!(read_log(&log).ends_with("] Unhandled rejection in task 'x': boom\n"));
}

// ── Ordering ──────────────────────────────────────────────────────────────────

#[test]
fn sequential_records_keep_submission_order() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = FileErrorLog::new(temp.path().to_owned()).expect("log");

    for i in 0..50 {
        log.record_message(&format!("record {i}"));
    }

    let content = read_log(&log);
    let order: Vec<_> = content
        .lines()
        .map(|line| line.split_once("] ").expect("delimiter").1.to_owned())
        .collect();
    let expected: Vec<_> = (0..50).map(|i| format!("record {i}")).collect();
    assert_eq!(order, expected);
}

#[test]
fn concurrent_records_are_never_torn() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = Arc::new(FileErrorLog::new(temp.path().to_owned()).expect("log"));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let log = Arc::clone(&log);
            std::thread::spawn(move || {
                for i in 0..25 {
                    log.record_message(&format!("thread {t} record {i} {}", "x".repeat(256)));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("thread should not panic");
    }

    let content = read_log(&log);
    assert_eq!(content.lines().count(), 200);
    for line in content.lines() {
        assert!(line.starts_with('['), "torn line: {line}");
        assert!(line.ends_with(&"x".repeat(256)), "torn line: {line}");
    }
}

// ── Failure handling ──────────────────────────────────────────────────────────

#[test]
fn unusable_log_location_is_not_an_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let blocker = temp.path().join("not-a-dir");
    fs::write(&blocker, "file in the way").expect("blocker");
    let log = FileErrorLog::new(blocker.join("logs")).expect("log");

    log.record(&Incident::unexpected("lost"));

    assert!(log.flush(FLUSH), "writer survives failed appends");
    assert!(!blocker.join("logs").exists());
}
