//! Control socket server.
//!
//! Accepts client connections on the daemon's Unix socket, unpacks one JSON
//! request per line and forwards the validated command to the controller.
//! Commands are fire-and-forget: `Ok` means "accepted for execution", not
//! that playback reached the commanded state.

use anyhow::Result;
use common::{ControlCommand, Request, Response, RpcError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use crate::controller::ControllerEvent;

pub async fn start(
    should_exit: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<ControllerEvent>,
) -> Result<()> {
    let socket_path = common::get_socket_path();

    // Remove old socket if it exists
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }

    let listener = UnixListener::bind(&socket_path)?;
    log::info!("IPC server listening on: {}", socket_path.display());

    loop {
        if should_exit.load(Ordering::Relaxed) {
            break;
        }

        // Accept connections with timeout
        let accept_result =
            tokio::time::timeout(std::time::Duration::from_millis(100), listener.accept()).await;

        match accept_result {
            Ok(Ok((stream, _addr))) => {
                let events = events.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, events).await {
                        log::error!("Error handling client: {}", e);
                    }
                });
            }
            Ok(Err(e)) => {
                log::error!("Error accepting connection: {}", e);
            }
            Err(_) => {
                // Timeout, continue loop to check exit condition
                continue;
            }
        }
    }

    // Clean up socket
    let _ = std::fs::remove_file(&socket_path);
    log::info!("IPC server stopped");
    Ok(())
}

async fn handle_client(
    stream: UnixStream,
    events: mpsc::UnboundedSender<ControllerEvent>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(&request, &events),
            Err(e) => {
                log::warn!("Invalid request: {}", e);
                Response::Error(RpcError::Failed(format!("invalid request: {}", e)))
            }
        };

        // Send response
        let response_json = serde_json::to_string(&response)?;
        writer.write_all(response_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        line.clear();
    }

    Ok(())
}

/// Translate one request into a controller event, or into the RPC error the
/// caller should see.
fn dispatch(request: &Request, events: &mpsc::UnboundedSender<ControllerEvent>) -> Response {
    log::debug!("Handling request: {:?}", request);

    let command = match ControlCommand::from_request(request) {
        Ok(command) => command,
        Err(e) => {
            log::warn!("Rejected '{}' request: {}", request.method, e);
            return Response::Error(e);
        }
    };

    match events.send(ControllerEvent::Control(command)) {
        Ok(()) => Response::Ok,
        Err(e) => Response::Error(RpcError::Failed(format!("controller unavailable: {}", e))),
    }
}
