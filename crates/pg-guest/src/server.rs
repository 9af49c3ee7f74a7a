// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control-plane RPC server.
//!
//! Listens on a Unix socket. Each line received is one JSON request; each
//! reply is written back as one JSON line on the same connection.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::handlers::{RpcRequest, RpcResponse, handle_request};
use crate::manager::SharedManager;

/// Bind the RPC socket, replacing a stale socket file.
pub async fn bind(socket_path: &Path) -> Result<UnixListener> {
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::remove_file(socket_path).await {
        Ok(()) => debug!(path = %socket_path.display(), "Removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(UnixListener::bind(socket_path)?)
}

/// Serve requests until `shutdown_rx` flips to true.
pub async fn run_server_with_shutdown(
    socket_path: PathBuf,
    manager: SharedManager,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let listener = bind(&socket_path).await?;
    info!(path = %socket_path.display(), "RPC server listening");

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("RPC server received shutdown signal");
                    break;
                }
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let manager = manager.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, manager).await {
                                error!("Connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }
    }

    if let Err(e) = tokio::fs::remove_file(&socket_path).await {
        debug!(error = %e, "Socket file not removed");
    }
    Ok(())
}

/// Handle every request line of one connection.
pub async fn handle_connection(stream: UnixStream, manager: SharedManager) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => handle_request(&manager, request).await,
            Err(e) => {
                warn!(error = %e, "Malformed request");
                RpcResponse::failure(&Error::InvalidInput(format!("malformed request: {}", e)))
            }
        };
        let mut body = serde_json::to_vec(&response)?;
        body.push(b'\n');
        writer.write_all(&body).await?;
        writer.flush().await?;
    }

    debug!("Connection closed");
    Ok(())
}
