use crate::error::DriverResult;
use crate::protocol::Compressor;
use async_trait::async_trait;

/// Address of a cluster member (`host:port`)
pub type ServerAddress = String;

/// Capabilities a server advertised during its handshake.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerFeatures {
    pub max_wire_version: i32,
    /// Compressors the server accepts, in its preference order
    pub compressors: Vec<Compressor>,
}

impl ServerFeatures {
    /// First wire version supporting `find`/`getMore`/`killCursors` commands
    pub const CURSOR_COMMANDS_WIRE_VERSION: i32 = 4;
    /// First wire version supporting `OP_MSG`
    pub const OP_MSG_WIRE_VERSION: i32 = 6;

    pub fn new(max_wire_version: i32) -> Self {
        Self {
            max_wire_version,
            compressors: Vec::new(),
        }
    }

    pub fn with_compressors(mut self, compressors: Vec<Compressor>) -> Self {
        self.compressors = compressors;
        self
    }

    pub fn supports_compressed_messages(&self) -> bool {
        !self.compressors.is_empty()
    }

    pub fn supports_op_msg(&self) -> bool {
        self.max_wire_version >= Self::OP_MSG_WIRE_VERSION
    }

    pub fn supports_cursor_commands(&self) -> bool {
        self.max_wire_version >= Self::CURSOR_COMMANDS_WIRE_VERSION
    }

    /// Pick the first of the client's `preferred` compressors this server
    /// also accepts.
    pub fn negotiate(&self, preferred: &[Compressor]) -> Option<Compressor> {
        if !self.supports_compressed_messages() {
            return None;
        }
        preferred
            .iter()
            .copied()
            .find(|c| self.compressors.contains(c))
    }
}

/// A cluster member requests can be sent to.
///
/// Implementations own the connection handling; the driver core only ever
/// hands them complete frames.
#[async_trait]
pub trait Server: Send + Sync + std::fmt::Debug {
    fn address(&self) -> &str;

    fn features(&self) -> &ServerFeatures;

    /// Send a complete request frame and return the complete reply frame.
    async fn issue(&self, request: Vec<u8>) -> DriverResult<Vec<u8>>;

    /// Send a complete frame the server does not answer (legacy kill-cursors).
    async fn send_unacknowledged(&self, request: Vec<u8>) -> DriverResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_gates() {
        let legacy = ServerFeatures::new(3);
        assert!(!legacy.supports_cursor_commands());
        assert!(!legacy.supports_op_msg());

        let modern = ServerFeatures::new(8);
        assert!(modern.supports_cursor_commands());
        assert!(modern.supports_op_msg());
    }

    #[test]
    fn test_negotiate_uses_client_preference() {
        let features =
            ServerFeatures::new(8).with_compressors(vec![Compressor::Snappy, Compressor::Zlib]);
        assert_eq!(
            features.negotiate(&[Compressor::Zlib, Compressor::Snappy]),
            Some(Compressor::Zlib)
        );
        assert_eq!(features.negotiate(&[Compressor::Noop]), None);
        assert_eq!(features.negotiate(&[]), None);
    }

    #[test]
    fn test_no_compression_without_advertisement() {
        let features = ServerFeatures::new(8);
        assert!(!features.supports_compressed_messages());
        assert_eq!(features.negotiate(&[Compressor::Zlib]), None);
    }
}
