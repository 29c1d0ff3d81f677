//! `TcpChannel`: owns the connected socket and provides task-safe,
//! independently-locked reads and writes.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpSocket;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

use crate::config::ConnectionConfig;
use crate::error::{AmiError, Result};

/// A connected TCP socket split into independently-locked read and write
/// halves, so a blocked reader never starves a writer and vice versa.
pub struct TcpChannel {
    read_half: Mutex<Option<OwnedReadHalf>>,
    write_half: Mutex<Option<OwnedWriteHalf>>,
}

impl TcpChannel {
    /// Resolve `config.host` (any address family), set `SO_REUSEADDR`, and
    /// connect within `config.connect_timeout`.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        config.validate()?;

        let mut addrs = tokio::net::lookup_host((config.host.as_str(), config.port))
            .await
            .map_err(|e| AmiError::Connect(format!("DNS resolution failed for {}: {e}", config.host)))?;
        let addr = addrs
            .next()
            .ok_or_else(|| AmiError::Connect(format!("no addresses found for host {}", config.host)))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(AmiError::Io)?;
        socket.set_reuseaddr(true).map_err(AmiError::Io)?;

        let stream = tokio::time::timeout(config.connect_timeout, socket.connect(addr))
            .await
            .map_err(|_| AmiError::Connect(format!("connect to {addr} timed out")))?
            .map_err(|e| AmiError::Connect(e.to_string()))?;

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            read_half: Mutex::new(Some(read_half)),
            write_half: Mutex::new(Some(write_half)),
        })
    }

    /// Read up to `max_bytes` (clamped to `[1024, 65535]`) within
    /// `timeout` (clamped to `>= 0`). Returns an empty vector on timeout,
    /// spurious wakeup, or orderly peer close — never blocks past
    /// `timeout`.
    pub async fn read(&self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>> {
        let clamped = max_bytes.clamp(1024, 65535);
        let mut guard = self.read_half.lock().await;
        let Some(half) = guard.as_mut() else {
            return Ok(Vec::new());
        };

        let mut buf = vec![0_u8; clamped];
        match tokio::time::timeout(timeout, half.read(&mut buf)).await {
            Err(_elapsed) => Ok(Vec::new()),
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(buf)
            }
            Ok(Err(e)) => Err(AmiError::Io(e)),
        }
    }

    /// Write `bytes` atomically under the write lock. A short write is
    /// surfaced as an error — this layer defines no partial-action
    /// recovery.
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.write_half.lock().await;
        let Some(half) = guard.as_mut() else {
            return Ok(());
        };

        let n = half.write(bytes).await.map_err(AmiError::Io)?;
        if n != bytes.len() {
            return Err(AmiError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("short write: wrote {n} of {} bytes", bytes.len()),
            )));
        }
        Ok(())
    }

    /// Idempotent: close the socket under both locks and mark it invalid.
    /// Subsequent reads return empty; subsequent writes no-op.
    pub async fn shutdown(&self) {
        let mut write_guard = self.write_half.lock().await;
        if let Some(mut half) = write_guard.take() {
            let _ = half.shutdown().await;
        }
        let mut read_guard = self.read_half.lock().await;
        read_guard.take();
    }
}
