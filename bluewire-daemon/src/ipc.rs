/*!
 * IPC Server for Bluewire Daemon
 * JSON protocol over Unix socket
 */

use anyhow::{Context, Result};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::daemon::DaemonHandle;
use crate::protocol::{Request, Response};

pub struct IpcServer {
    listener: UnixListener,
    handle: DaemonHandle,
}

impl IpcServer {
    /// Binds `path`, replacing a socket left behind by an earlier run.
    pub fn bind(path: impl AsRef<Path>, handle: DaemonHandle) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| {
                    format!("Failed to create socket directory {}", parent.display())
                })?;
        }
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind {}", path.display()))?;
        Ok(Self { listener, handle })
    }

    pub async fn run(self) -> Result<()> {
        tracing::info!("IPC server listening for connections...");

        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    tracing::debug!("New client connected");
                    let handle = self.handle.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, handle).await {
                            tracing::error!("Client error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

async fn handle_client(stream: UnixStream, handle: DaemonHandle) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        tracing::debug!("Received request: {}", line);

        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => handle
                .request(request)
                .await
                .unwrap_or_else(Response::error),
            Err(e) => Response::error(format!("Invalid request: {}", e)),
        };

        let response = serde_json::to_string(&response)?;
        writer.write_all(response.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }

    Ok(())
}

/// One request/response exchange with a running daemon.
pub async fn send_request(socket_path: impl AsRef<Path>, request: &Request) -> Result<Response> {
    let socket_path = socket_path.as_ref();
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("Failed to connect to {}", socket_path.display()))?;
    let (reader, mut writer) = stream.into_split();

    let request = serde_json::to_string(request)?;
    writer.write_all(request.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    let line = BufReader::new(reader)
        .lines()
        .next_line()
        .await?
        .context("Daemon closed the connection without replying")?;
    Ok(serde_json::from_str(&line)?)
}
