//! Local socket listener for remote/unix-socket sources.
//!
//! Each connection supplies the same newline-delimited JSON stream a
//! subprocess destination receives on its stdin: a descriptor envelope
//! first, then event batches. The listener reads the envelope, builds an
//! IPC-backed `SourceDevice`, and hands it to the Hub, which treats it
//! uniformly with an evdev source.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use evdev_transformer_config::SourceIdentifier;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::hub::Hub;
use crate::source::SourceDevice;
use crate::wire::DescriptorEnvelope;

/// Local stream socket the daemon listens on for remote sources.
///
/// Bound once at startup, mode 0600, removed on `Drop` so a clean shutdown
/// never leaves a stale socket file for the next run to trip over.
pub struct IpcListener {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl IpcListener {
    pub fn bind() -> Result<Self> {
        Self::bind_at(default_socket_path())
    }

    fn bind_at(socket_path: PathBuf) -> Result<Self> {
        if socket_path.exists() {
            tracing::debug!(path = %socket_path.display(), "removing stale IPC socket file");
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("failed to remove stale IPC socket at {}", socket_path.display()))?;
        }

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("failed to bind IPC socket at {}", socket_path.display()))?;

        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to set permissions on IPC socket at {}", socket_path.display()))?;

        tracing::info!(path = %socket_path.display(), "IPC listener bound");

        Ok(Self {
            listener,
            socket_path,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accepts connections until the listener errors. Each connection is
    /// handled on its own spawned task so one slow or malformed client
    /// never blocks the next `accept`.
    pub async fn serve(&self, hub: Arc<Hub>) -> Result<()> {
        loop {
            let (stream, _addr) = self
                .listener
                .accept()
                .await
                .context("failed to accept IPC connection")?;
            let hub = hub.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, hub).await {
                    tracing::warn!(error = %err, "IPC connection dropped");
                }
            });
        }
    }
}

impl Drop for IpcListener {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            if let Err(err) = std::fs::remove_file(&self.socket_path) {
                tracing::warn!(error = %err, path = %self.socket_path.display(), "failed to remove IPC socket on shutdown");
            }
        }
    }
}

fn default_socket_path() -> PathBuf {
    let dir = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(dir).join("evdev-ipc.sock")
}

/// Reads the leading descriptor envelope off the connection, then hands the
/// rest of the stream (still positioned right after that line, nothing
/// buffered-and-discarded) to a fresh `SourceDevice`.
async fn handle_connection(stream: UnixStream, hub: Arc<Hub>) -> Result<()> {
    let mut lines = BufReader::new(stream).lines();
    let first = lines
        .next_line()
        .await
        .context("failed to read descriptor envelope")?
        .context("connection closed before sending a descriptor envelope")?;

    let envelope: DescriptorEnvelope =
        serde_json::from_str(&first).context("malformed descriptor envelope")?;

    let name = format!(
        "{} ({:04x}:{:04x} via {})",
        envelope.data.name, envelope.vendor, envelope.product, envelope.host
    );
    let identifier = SourceIdentifier::NetTriple {
        host: envelope.host,
        vendor: envelope.vendor,
        product: envelope.product,
    };

    let source = SourceDevice::new_ipc(name, identifier, envelope.data, lines);
    hub.add_source(Arc::new(source));
    Ok(())
}
