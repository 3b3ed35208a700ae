//! MySQL client protocol engine.
//!
//! This crate implements the MySQL wire protocol from scratch over blocking
//! std I/O. It provides:
//!
//! - Packet framing with sequence numbers and continuation frames
//! - Handshake with optional TLS upgrade and pluggable authentication
//! - Text and binary result decoding, multi-result chains
//! - Prepared statements with a bounded per-connection statement cache
//! - Type-directed parameter encoding
//! - Link-failure diagnostics for dropped connections
//!
//! # MySQL Protocol Overview
//!
//! MySQL uses a packet-based protocol with:
//! - 3-byte payload length + 1-byte sequence number header
//! - Packets over 16MB are split
//! - Request/response pairing via sequence numbers
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlwire_mysql::{MySqlConfig, MySqlConnection};
//!
//! let config = MySqlConfig::new()
//!     .host("localhost")
//!     .port(3306)
//!     .user("root")
//!     .database("mydb");
//!
//! let mut conn = MySqlConnection::open(config)?;
//! let rows = conn.query_rows("SELECT 1")?;
//! ```

pub mod auth;
pub mod bind;
pub mod cache;
pub mod column;
pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod encoder;
pub mod protocol;
pub mod resultset;
pub mod server_session;
pub mod session;
pub mod tls;
pub mod transport;
pub mod types;

pub use auth::{AuthStep, AuthenticationPlugin};
pub use bind::{BindValue, ParameterBindings};
pub use cache::{QueryInfoCache, QueryInfoCacheFactory};
pub use column::{ColumnDefinition, Field};
pub use config::{MySqlConfig, SslMode, TlsConfig};
pub use connection::{ConnectionState, MySqlConnection};
pub use diagnostics::{LinkFailureContext, LinkFailureDiagnosis, diagnose_link_failure};
pub use encoder::{EncodeContext, EncoderRegistry, EncodingOptions, ValueEncoder};
pub use protocol::{Message, PreparedStatement};
pub use resultset::{
    BinaryResultsetFactory, Resultset, ResultsetChain, ResultsetFactory, Row, TextResultsetFactory,
};
pub use server_session::{Greeting, ServerSession};
pub use session::Session;
pub use transport::{NetStream, SocketConnection};
pub use types::FieldType;
