//! Single-connection TCP transport for one server.
//!
//! Frames are written as produced by the codec. Replies are read by their
//! leading `messageLength` field. Any I/O failure drops the connection so the
//! next request reconnects.

use super::server::{Server, ServerFeatures};
use crate::error::{DriverError, DriverResult};
use crate::protocol::{HEADER_LEN, MAX_MESSAGE_SIZE};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct TcpServer {
    address: String,
    features: ServerFeatures,
    socket_timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpServer {
    /// Create a lazily connected server handle.
    ///
    /// # Arguments
    /// * `address` - Server address (e.g., "localhost:27017")
    /// * `features` - Capabilities the server advertised
    pub fn new(address: &str, features: ServerFeatures) -> Self {
        Self {
            address: address.to_string(),
            features,
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            stream: Mutex::new(None),
        }
    }

    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    async fn connect(&self) -> DriverResult<TcpStream> {
        let stream = TcpStream::connect(&self.address).await.map_err(|e| {
            DriverError::Connection(format!("Failed to connect to {}: {}", self.address, e))
        })?;
        stream.set_nodelay(true)?;
        tracing::debug!("Connected to {}", self.address);
        Ok(stream)
    }

    async fn exchange(
        &self,
        slot: &mut Option<TcpStream>,
        request: &[u8],
        expect_reply: bool,
    ) -> DriverResult<Vec<u8>> {
        if slot.is_none() {
            *slot = Some(self.connect().await?);
        }
        let Some(stream) = slot.as_mut() else {
            return Err(DriverError::Connection(format!(
                "No connection to {}",
                self.address
            )));
        };

        stream
            .write_all(request)
            .await
            .map_err(|e| DriverError::Connection(format!("Write failed: {}", e)))?;
        stream
            .flush()
            .await
            .map_err(|e| DriverError::Connection(format!("Flush failed: {}", e)))?;

        if !expect_reply {
            return Ok(Vec::new());
        }

        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| DriverError::Connection(format!("Read length failed: {}", e)))?;

        let msg_len = i32::from_le_bytes(len_buf);
        if msg_len < HEADER_LEN as i32 {
            return Err(DriverError::Protocol(format!(
                "Reply length {} is shorter than the header",
                msg_len
            )));
        }
        let msg_len = msg_len as usize;
        if msg_len > MAX_MESSAGE_SIZE {
            return Err(DriverError::MessageTooLarge(msg_len));
        }

        let mut frame = vec![0u8; msg_len];
        frame[..4].copy_from_slice(&len_buf);
        stream
            .read_exact(&mut frame[4..])
            .await
            .map_err(|e| DriverError::Connection(format!("Read payload failed: {}", e)))?;

        Ok(frame)
    }

    async fn round_trip(&self, request: Vec<u8>, expect_reply: bool) -> DriverResult<Vec<u8>> {
        let mut slot = self.stream.lock().await;
        let result = tokio::time::timeout(
            self.socket_timeout,
            self.exchange(&mut slot, &request, expect_reply),
        )
        .await
        .unwrap_or_else(|_| {
            Err(DriverError::SocketTimeout(format!(
                "No reply from {} within {:?}",
                self.address, self.socket_timeout
            )))
        });

        if result.is_err() {
            // The stream may hold half a frame; never reuse it.
            *slot = None;
        }
        result
    }
}

#[async_trait]
impl Server for TcpServer {
    fn address(&self) -> &str {
        &self.address
    }

    fn features(&self) -> &ServerFeatures {
        &self.features
    }

    async fn issue(&self, request: Vec<u8>) -> DriverResult<Vec<u8>> {
        self.round_trip(request, true).await
    }

    async fn send_unacknowledged(&self, request: Vec<u8>) -> DriverResult<()> {
        self.round_trip(request, false).await.map(|_| ())
    }
}
