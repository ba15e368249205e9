//! Command/response transport towards node event managers

use super::protocol::{CommandMessage, ResultCode, ResultMessage};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Delivers commands to nodes
///
/// Implementations only move bytes; status checking is the caller's job.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fire-and-forget delivery
    async fn send(&self, command: &CommandMessage) -> Result<()>;

    /// Deliver and wait for the node's result message
    async fn send_wait(&self, command: &CommandMessage) -> Result<ResultMessage>;
}

/// One TCP connection per command
#[derive(Debug, Clone)]
pub struct TcpTransport {
    pub timeout: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn open(&self, command: &CommandMessage) -> Result<TcpStream> {
        let target = (command.address, command.port);
        let mut stream = tokio::time::timeout(self.timeout, TcpStream::connect(target))
            .await
            .map_err(|_| {
                Error::Transport(format!(
                    "connecting to {}:{} timed out",
                    command.address, command.port
                ))
            })?
            .map_err(|e| {
                Error::Transport(format!("{}:{}: {}", command.address, command.port, e))
            })?;
        let frame = command.encode()?;
        stream
            .write_all(&frame)
            .await
            .map_err(|e| Error::Transport(format!("sending {}: {}", command.code, e)))?;
        Ok(stream)
    }

    async fn read_result(&self, stream: &mut TcpStream) -> Result<ResultMessage> {
        let mut header = [0u8; 3];
        stream.read_exact(&mut header).await?;
        let len = u16::from_be_bytes([header[1], header[2]]) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        Ok(ResultMessage::new(ResultCode::from_u8(header[0]), payload))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, command: &CommandMessage) -> Result<()> {
        let mut stream = self.open(command).await?;
        stream.shutdown().await?;
        Ok(())
    }

    async fn send_wait(&self, command: &CommandMessage) -> Result<ResultMessage> {
        let mut stream = self.open(command).await?;
        tokio::time::timeout(self.timeout, self.read_result(&mut stream))
            .await
            .map_err(|_| {
                Error::Transport(format!(
                    "no response to {} from {}:{}",
                    command.code, command.address, command.port
                ))
            })?
    }
}
