// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Raw TCP transport to receipt printers (JetDirect, port 9100).
//
// Receipt printers take the rendered command stream over a plain socket:
// no negotiation, no job tracking.  Connections are kept open between
// receipts by the pool, so the transport also exposes a cheap liveness probe.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

use tillprint_core::error::{Result, TillprintError};
use tillprint_core::types::PrinterTarget;

/// Writes are issued in chunks so a partial write reports how far it got.
const CHUNK_SIZE: usize = 4096;

/// Opens connections to printers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, target: &PrinterTarget) -> Result<Box<dyn PrinterConnection>>;
}

/// An open byte pipe to one printer.
#[async_trait]
pub trait PrinterConnection: Send + std::fmt::Debug {
    /// Write the whole of `bytes`. Any failure counts as transient.
    async fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Whether the connection still looks usable. Must not block.
    fn is_alive(&mut self) -> bool;
}

/// Production transport over `tokio::net::TcpStream`.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, target: &PrinterTarget) -> Result<Box<dyn PrinterConnection>> {
        let addr = target.key();
        debug!(addr = %addr, "connecting to printer");

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                TillprintError::TransientDispatch(format!(
                    "connect to {addr} timed out after {}ms",
                    self.connect_timeout.as_millis()
                ))
            })?
            .map_err(|e| TillprintError::TransientDispatch(format!("connect to {addr}: {e}")))?;
        // Receipts are small; don't let Nagle hold back the cut command.
        stream.set_nodelay(true)?;

        info!(addr = %addr, "printer connection opened");
        Ok(Box::new(TcpConnection { stream, addr }))
    }
}

#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    addr: String,
}

#[async_trait]
impl PrinterConnection for TcpConnection {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let mut sent = 0;
        for chunk in bytes.chunks(CHUNK_SIZE) {
            self.stream.write_all(chunk).await.map_err(|e| {
                TillprintError::TransientDispatch(format!(
                    "partial write to {} at byte {sent} of {}: {e}",
                    self.addr,
                    bytes.len()
                ))
            })?;
            sent += chunk.len();
        }
        self.stream.flush().await.map_err(|e| {
            TillprintError::TransientDispatch(format!("flush to {}: {e}", self.addr))
        })?;

        debug!(addr = %self.addr, bytes = sent, "receipt bytes sent");
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        // A non-blocking read: EOF means the printer hung up, WouldBlock means
        // an idle but open socket. Status bytes some printers push are
        // discarded.
        let mut buf = [0u8; 64];
        match self.stream.try_read(&mut buf) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) => e.kind() == std::io::ErrorKind::WouldBlock,
        }
    }
}
