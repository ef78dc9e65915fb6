use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;

use tether_daemon::paths::{config_path, socket_path};
use tether_daemon::{
    request_shutdown, request_start, request_status, request_stop, run, send_request,
    DaemonError, DaemonRequest,
};

/// Point the execution service at a closed local port so launches fail fast.
fn write_unreachable_config(home: &Path) {
    let path = config_path(home);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(
        path,
        "execution_url: http://127.0.0.1:9\nrequest_timeout_secs: 2\n",
    )
    .unwrap();
}

fn wait_for_status(home: &Path) -> Value {
    for _ in 0..50 {
        match request_status(home) {
            Ok(status) => return status,
            Err(DaemonError::DaemonNotRunning { .. }) => sleep(Duration::from_millis(100)),
            Err(err) => panic!("status failed: {err}"),
        }
    }
    panic!("daemon never came up");
}

async fn blocking<T: Send + 'static>(
    home: &Path,
    f: impl FnOnce(PathBuf) -> T + Send + 'static,
) -> T {
    let home = home.to_path_buf();
    tokio::task::spawn_blocking(move || f(home))
        .await
        .expect("blocking task")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn daemon_serves_status_and_rejections_then_shuts_down() {
    let home = TempDir::new().unwrap();
    write_unreachable_config(home.path());
    let daemon = tokio::spawn(run(home.path().to_path_buf()));

    let status = blocking(home.path(), |home| wait_for_status(&home)).await;
    assert_eq!(status["running"], Value::Bool(true));
    assert!(status["processes"].as_array().unwrap().is_empty());
    assert_eq!(
        status["socket"],
        Value::String(socket_path(home.path()).display().to_string())
    );

    let err = blocking(home.path(), |home| request_start(&home, "42"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, DaemonError::Rejected { kind: Some(ref kind), .. } if kind == "launch_failed"),
        "got: {err}"
    );

    let response = blocking(home.path(), |home| {
        send_request(&home, &DaemonRequest::new("stop"))
    })
    .await
    .unwrap();
    assert!(!response.ok);
    assert!(response.error.unwrap().contains("application_id"));

    let response = blocking(home.path(), |home| {
        send_request(&home, &DaemonRequest::new("bogus"))
    })
    .await
    .unwrap();
    assert!(!response.ok);

    blocking(home.path(), |home| request_shutdown(&home))
        .await
        .expect("shutdown");
    tokio::time::timeout(Duration::from_secs(5), daemon)
        .await
        .expect("daemon exits")
        .expect("join")
        .expect("daemon result");

    assert!(!socket_path(home.path()).exists());
}

#[test]
fn requests_fail_cleanly_without_daemon() {
    let home = TempDir::new().unwrap();
    let err = request_stop(home.path(), "42").unwrap_err();
    assert!(matches!(err, DaemonError::DaemonNotRunning { .. }));
}
