use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use tether_core::{config, ApplicationId, RegistrySnapshot};

use crate::channel::WebSocketConnector;
use crate::error::{io_err, DaemonError};
use crate::execution::HttpExecutionService;
use crate::paths::{config_path, socket_path, store_path, tether_root};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::tracker::{self, TrackerEvent, TrackerHandle, TrackerOptions};

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon runtime: reconcile, then serve requests until shutdown.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let config = Arc::new(config::load_at(&home)?);
    let service = Arc::new(HttpExecutionService::new(&config)?);
    let connector = Arc::new(WebSocketConnector::new(config.clone()));
    let options = TrackerOptions {
        audit_interval: config.audit_interval(),
    };

    let (tracker, control_task) = tracker::spawn(home.clone(), options, service, connector);
    tracing::info!(
        tracked = tracker.snapshot().len(),
        execution_url = %config.execution_url,
        "tracker started",
    );
    let started_at_unix = unix_seconds_now();

    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        let home = home.clone();
        let tracker = tracker.clone();
        tokio::spawn(async move {
            let result = socket_server_task(
                home,
                tracker,
                shutdown.clone(),
                shutdown_rx,
                started_at_unix,
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let event_log_handle = {
        let events = tracker.subscribe();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            event_log_task(events, shutdown_rx).await;
            Ok(())
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (socket_result, event_log_result, signal_result) =
        tokio::join!(socket_handle, event_log_handle, signal_handle);

    if let Err(err) = tracker.shutdown().await {
        tracing::warn!(error = %err, "tracker already stopped");
    }
    if let Err(err) = control_task.await {
        tracing::error!(error = %err, "tracker control loop panicked");
    }

    handle_join("socket_server", socket_result)?;
    handle_join("event_log", event_log_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

async fn socket_server_task(
    home: PathBuf,
    tracker: TrackerHandle,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
    started_at_unix: u64,
) -> Result<(), DaemonError> {
    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "listening for requests");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let home = home.clone();
                let tracker = tracker.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(
                        stream,
                        home,
                        tracker,
                        shutdown_tx,
                        started_at_unix,
                    ).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    home: PathBuf,
    tracker: TrackerHandle,
    shutdown_tx: broadcast::Sender<()>,
    started_at_unix: u64,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let cmd = request.cmd.clone();
        let response = dispatch(request, &home, &tracker, &shutdown_tx, started_at_unix).await;
        write_response(&mut writer, &response).await?;
        if cmd == "shutdown" {
            break;
        }
    }

    Ok(())
}

async fn dispatch(
    request: DaemonRequest,
    home: &Path,
    tracker: &TrackerHandle,
    shutdown_tx: &broadcast::Sender<()>,
    started_at_unix: u64,
) -> DaemonResponse {
    match request.cmd.as_str() {
        "status" => match tracker.channels().await {
            Ok(channels) => {
                let channels: Vec<Value> = channels
                    .into_iter()
                    .map(|(process_id, application_id)| {
                        json!({ "process_id": process_id, "application_id": application_id })
                    })
                    .collect();
                DaemonResponse::ok(build_status_payload(
                    home,
                    &tracker.snapshot(),
                    channels,
                    started_at_unix,
                ))
            }
            Err(err) => DaemonResponse::tracker_error(&err),
        },
        "start" => {
            let Some(application_id) = required_application(&request) else {
                return DaemonResponse::error("'start' requires application_id");
            };
            match tracker.start(application_id).await {
                Ok(handle) => DaemonResponse::ok(json!(handle)),
                Err(err) => DaemonResponse::tracker_error(&err),
            }
        }
        "stop" => {
            let Some(application_id) = required_application(&request) else {
                return DaemonResponse::error("'stop' requires application_id");
            };
            match tracker.stop(application_id.clone()).await {
                Ok(()) => DaemonResponse::ok(json!({ "stopped": application_id })),
                Err(err) => DaemonResponse::tracker_error(&err),
            }
        }
        "shutdown" => {
            let _ = shutdown_tx.send(());
            DaemonResponse::ok(json!({ "stopping": true }))
        }
        other => DaemonResponse::error(format!("unknown command '{other}'")),
    }
}

fn required_application(request: &DaemonRequest) -> Option<ApplicationId> {
    request
        .application_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(ApplicationId::from)
}

fn build_status_payload(
    home: &Path,
    snapshot: &RegistrySnapshot,
    channels: Vec<Value>,
    started_at_unix: u64,
) -> Value {
    let processes: Vec<Value> = snapshot
        .handles
        .values()
        .map(|handle| {
            json!({
                "application_id": handle.application_id,
                "process_id": handle.process_id,
                "channel_state": handle.channel_state,
                "last_event_at": handle.last_event_at.to_rfc3339(),
            })
        })
        .collect();

    json!({
        "running": true,
        "label": crate::paths::DAEMON_LABEL,
        "started_at_unix": started_at_unix,
        "snapshot_at": snapshot.taken_at.to_rfc3339(),
        "processes": processes,
        "channels": channels,
        "socket": socket_path(home).display().to_string(),
        "store": store_path(home).display().to_string(),
        "config": config_path(home).display().to_string(),
    })
}

async fn event_log_task(
    mut events: broadcast::Receiver<TrackerEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = events.recv() => match event {
                Ok(TrackerEvent::Output { application_id, process_id, payload }) => {
                    tracing::debug!(
                        application_id = %application_id,
                        process_id = %process_id,
                        payload = %payload,
                        "status channel output",
                    );
                }
                Ok(event) => tracing::debug!(event = ?event, "tracker event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event log fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    let root = tether_root(home);
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
