//! Task lifecycle tests: status monotonicity, signal liveness, exit code
//! recording, and resource cleanup on drop.
//!
//! These use the unjailed start path with host binaries (`sleep`, `true`),
//! so they run without namespaces or a prepared image.

use flate2::write::GzEncoder;
use flate2::Compression;
use jailrun::{Signal, Status, Task};
use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;
use url::Url;

// =============================================================================
// Helpers
// =============================================================================

fn targz_image() -> NamedTempFile {
    let body = b"This archive contains this file.";
    let mut header = tar::Header::new_ustar();
    header.set_path("readme.txt").unwrap();
    header.set_mode(0o600);
    header.set_size(body.len() as u64);
    header.set_cksum();

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append(&header, &body[..]).unwrap();
    let bytes = builder.into_inner().unwrap().finish().unwrap();

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&bytes).unwrap();
    file.flush().unwrap();
    file
}

fn image_task(program: &str, args: &[&str]) -> (NamedTempFile, Task) {
    let image = targz_image();
    let url = Url::from_file_path(image.path()).unwrap();
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    let task = Task::new(url.as_str(), program, &args).unwrap();
    (image, task)
}

/// Polls until the task reports `expected` or the deadline passes.
async fn wait_for_status(task: &Task, expected: Status) -> Status {
    for _ in 0..100 {
        let status = task.status();
        if status == expected {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    task.status()
}

// =============================================================================
// Monotonic lifecycle
// =============================================================================

#[tokio::test]
async fn status_progresses_through_lifecycle() {
    let (_image, task) = image_task("sleep", &["1"]);
    assert_eq!(task.status(), Status::NotStarted);

    task.retrieve().await.unwrap();
    assert_eq!(task.status(), Status::Retrieved);

    task.extract().unwrap();
    assert_eq!(task.status(), Status::Extracted);

    task.start(None, &HashMap::new()).await.unwrap();
    let live = wait_for_status(&task, Status::Sleeping).await;
    assert!(
        matches!(live, Status::Running | Status::Sleeping),
        "expected a live state, got {live}"
    );

    let code = task.wait().await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(task.status(), Status::Finished);
}

#[tokio::test]
async fn start_runs_prerequisites_idempotently() {
    let (_image, task) = image_task("true", &[]);
    // start() must fetch and extract on its own.
    task.start(None, &HashMap::new()).await.unwrap();
    assert!(task.image_path().is_some());
    assert!(task.rootfs_path().is_some());
    assert_eq!(task.wait().await.unwrap(), 0);
}

#[tokio::test]
async fn working_directory_override_applies() {
    let (_image, task) = image_task("pwd", &[]);
    task.start(Some(std::path::Path::new("/tmp")), &HashMap::new())
        .await
        .unwrap();
    assert_eq!(task.wait().await.unwrap(), 0);
}

// =============================================================================
// Signals
// =============================================================================

#[tokio::test]
async fn signal_before_start_is_rejected() {
    let (_image, task) = image_task("sleep", &["1"]);
    let err = task.signal(Signal::Kill).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Impossible to send a signal to a non-running process"
    );
}

#[tokio::test]
async fn stop_continue_kill_sequence() {
    let (_image, task) = image_task("sleep", &["30"]);
    task.start(None, &HashMap::new()).await.unwrap();

    task.signal(Signal::Stop).unwrap();
    assert_eq!(wait_for_status(&task, Status::Stopped).await, Status::Stopped);

    task.signal(Signal::Cont).unwrap();
    let resumed = wait_for_status(&task, Status::Sleeping).await;
    assert!(
        matches!(resumed, Status::Running | Status::Sleeping),
        "expected resumed state, got {resumed}"
    );

    task.signal(Signal::Kill).unwrap();
    let code = task.wait().await.unwrap();
    assert_eq!(code, 128 + 9, "SIGKILL must surface as 137");
    assert_eq!(task.status(), Status::Finished);
}

#[tokio::test]
async fn second_wait_is_rejected() {
    let (_image, task) = image_task("true", &[]);
    task.start(None, &HashMap::new()).await.unwrap();
    task.wait().await.unwrap();
    assert!(task.wait().await.is_err());
}

// =============================================================================
// Resource ownership
// =============================================================================

#[tokio::test]
async fn drop_releases_image_and_root() {
    let (_image, task) = image_task("sleep", &["1"]);
    task.retrieve().await.unwrap();
    task.extract().unwrap();

    let image_path = task.image_path().unwrap();
    let root_path = task.rootfs_path().unwrap();
    assert!(image_path.exists());
    assert!(root_path.exists());

    drop(task);
    assert!(!image_path.exists(), "image temp file must be unlinked");
    assert!(!root_path.exists(), "extracted root must be removed");
}
