pub mod change_stream;
pub mod client;
pub mod cluster;
pub mod config;
pub mod cursor;
pub mod error;
pub mod namespace;
pub mod operation;
pub mod protocol;
pub mod retry;

pub use change_stream::{ChangeStream, ChangeStreamOptions, FullDocument, ResumeToken};
pub use client::Client;
pub use cluster::{Cluster, PeriodicExecutor, Reaper, Server, ServerFeatures, ServerSelector};
pub use config::ClientConfig;
pub use cursor::Cursor;
pub use error::{DriverError, DriverResult};
pub use namespace::Namespace;
pub use protocol::{Compressor, Document, WireMessage};
pub use retry::{Resumable, RetryPolicy};
