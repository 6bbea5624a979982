use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::events::{ControlCommand, ControlReply, ControlRequest};

/// Serves newline-delimited JSON commands on a Unix socket.
///
/// Each request line gets exactly one JSON reply line. The socket file is
/// removed when the task stops.
#[instrument(name = "control", skip_all, fields(path = %path.display()))]
pub async fn run(
    path: PathBuf,
    requests: mpsc::Sender<ControlRequest>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = bind(&path)?;
    info!("control socket listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let requests = requests.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve(stream, requests, cancel).await {
                            debug!("control client dropped: {err:#}");
                        }
                    });
                }
                Err(err) => warn!("failed to accept control client: {err}"),
            },
        }
    }

    if let Err(err) = std::fs::remove_file(&path) {
        debug!("failed to remove control socket: {err}");
    }
    Ok(())
}

fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("failed to create control socket directory {}", parent.display())
        })?;
    }
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove stale control socket {}", path.display()))?;
    }
    UnixListener::bind(path)
        .with_context(|| format!("failed to bind control socket at {}", path.display()))
}

async fn serve(
    stream: UnixStream,
    requests: mpsc::Sender<ControlRequest>,
    cancel: CancellationToken,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line.context("failed to read control request")?,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<ControlCommand>(&line) {
            Ok(command) => dispatch(command, &requests).await,
            Err(err) => ControlReply::failure(format!("invalid command: {err}")),
        };
        let mut encoded = serde_json::to_vec(&reply).context("failed to encode reply")?;
        encoded.push(b'\n');
        writer
            .write_all(&encoded)
            .await
            .context("failed to write control reply")?;
    }
    Ok(())
}

async fn dispatch(command: ControlCommand, requests: &mpsc::Sender<ControlRequest>) -> ControlReply {
    let (reply_tx, reply_rx) = oneshot::channel();
    let request = ControlRequest {
        command,
        reply: Some(reply_tx),
    };
    if requests.send(request).await.is_err() {
        return ControlReply::failure("runtime is shutting down");
    }
    reply_rx
        .await
        .unwrap_or_else(|_| ControlReply::failure("runtime dropped the request"))
}
