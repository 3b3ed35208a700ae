//! State the server reported about this session.

use std::collections::HashMap;

use sqlwire_core::Result;

use crate::auth;
use crate::protocol::{PacketReader, capabilities, server_status};

/// Parsed initial handshake (protocol version 10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub protocol_version: u8,
    pub server_version: String,
    /// Server thread id
    pub connection_id: u32,
    pub capabilities: u32,
    pub charset: u8,
    pub status_flags: u16,
    /// Scramble (20 bytes for the built-in plugins)
    pub auth_data: Vec<u8>,
    pub auth_plugin: String,
}

impl Greeting {
    /// Parse the greeting payload. Only protocol version 10 is accepted.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);

        let protocol_version = reader.read_u8()?;
        if protocol_version != 10 {
            return Err(sqlwire_core::Error::protocol(format!(
                "Unsupported protocol version: {}",
                protocol_version
            )));
        }

        let server_version = reader.read_null_string();
        let connection_id = reader.read_u32_le()?;
        let auth_data_1 = reader.read_bytes(8)?;
        reader.skip(1)?;
        let caps_lower = reader.read_u16_le()?;

        let mut greeting = Self {
            protocol_version,
            server_version,
            connection_id,
            capabilities: u32::from(caps_lower),
            charset: crate::protocol::charset::DEFAULT_CHARSET,
            status_flags: 0,
            auth_data: auth_data_1.to_vec(),
            auth_plugin: auth::plugins::MYSQL_NATIVE_PASSWORD.to_string(),
        };
        if reader.is_empty() {
            return Ok(greeting);
        }

        greeting.charset = reader.read_u8()?;
        greeting.status_flags = reader.read_u16_le()?;
        let caps_upper = reader.read_u16_le()?;
        greeting.capabilities |= u32::from(caps_upper) << 16;

        let auth_data_len = usize::from(reader.read_u8()?);
        reader.skip(10)?;

        if greeting.capabilities & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            let len2 = auth_data_len.saturating_sub(8).max(13).min(reader.remaining());
            let part2 = reader.read_bytes(len2)?;
            let part2 = part2.strip_suffix(&[0]).unwrap_or(part2);
            greeting.auth_data.extend_from_slice(part2);
        }

        if greeting.capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            let name = reader.read_null_string();
            if !name.is_empty() {
                greeting.auth_plugin = name;
            }
        }

        Ok(greeting)
    }
}

/// Server-reported session state.
///
/// Written during the handshake, by `init_server_session`,
/// `configure_time_zone` and by status flags in OK/EOF packets.
#[derive(Debug, Clone, Default)]
pub struct ServerSession {
    pub server_version: String,
    /// Server thread id
    pub connection_id: u32,
    /// Capabilities the server advertised
    pub server_capabilities: u32,
    /// Capabilities in effect (client request and server offer)
    pub client_capabilities: u32,
    pub status_flags: u16,
    pub charset: u8,
    variables: HashMap<String, String>,
    /// Resolved session time zone
    pub time_zone: Option<String>,
}

impl ServerSession {
    pub fn from_greeting(greeting: &Greeting) -> Self {
        Self {
            server_version: greeting.server_version.clone(),
            connection_id: greeting.connection_id,
            server_capabilities: greeting.capabilities,
            status_flags: greeting.status_flags,
            charset: greeting.charset,
            ..Self::default()
        }
    }

    pub fn has_capability(&self, flag: u32) -> bool {
        self.client_capabilities & flag != 0
    }

    pub fn uses_deprecate_eof(&self) -> bool {
        self.has_capability(capabilities::CLIENT_DEPRECATE_EOF)
    }

    pub fn in_transaction(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_IN_TRANS != 0
    }

    pub fn is_autocommit(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_AUTOCOMMIT != 0
    }

    pub fn no_backslash_escapes(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_NO_BACKSLASH_ESCAPES != 0
    }

    pub fn more_results_exist(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }

    /// Server variable by name, e.g. `wait_timeout`.
    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn variables(&self) -> impl Iterator<Item = (&str, &str)> {
        self.variables.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn variable_u64(&self, name: &str) -> Option<u64> {
        self.variable(name)?.trim().parse().ok()
    }

    /// Idle timeout in seconds the server applies to this session.
    ///
    /// `interactive_timeout` for interactive clients, `wait_timeout`
    /// otherwise. `None` until the variables have been read.
    pub fn server_timeout(&self, interactive: bool) -> Option<u64> {
        if interactive {
            self.variable_u64("interactive_timeout")
                .or_else(|| self.variable_u64("wait_timeout"))
        } else {
            self.variable_u64("wait_timeout")
        }
    }

    pub fn max_allowed_packet(&self) -> Option<u64> {
        self.variable_u64("max_allowed_packet")
    }
}
