//! The protocol engine.
//!
//! [`MySqlConnection`] drives one server session over any
//! [`SocketConnection`]: handshake and authentication, command dispatch,
//! result decoding, prepared statements and failure diagnosis. It is driven
//! by a single thread; commands are strictly sequential.

// MySQL protocol uses well-defined packet sizes that fit in u32 (max 16MB)
#![allow(clippy::cast_possible_truncation)]

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlwire_core::error::{ConnectionError, ConnectionErrorKind, UsageErrorKind};
use sqlwire_core::{Error, PropertyKey, Result, Value};

use crate::auth::{self, AuthStep, AuthenticationPlugin};
use crate::bind::{self, BindValue, ParameterBindings};
use crate::cache::{QueryInfoCache, QueryInfoCacheFactory};
use crate::column::{ColumnDefinition, Field};
use crate::config::MySqlConfig;
use crate::diagnostics::{LinkFailureContext, diagnose_link_failure};
use crate::encoder::{EncoderRegistry, EncodingOptions};
use crate::protocol::message::DEFAULT_BUFFER_CAPACITY;
use crate::protocol::prepared::{
    stmt_close_payload, stmt_execute_payload, stmt_prepare_payload,
};
use crate::protocol::writer::frame_payload;
use crate::protocol::{
    Command, ErrPacket, MAX_PACKET_SIZE, Message, PacketType, PacketWriter, PreparedStatement,
    StmtPrepareOk, capabilities, server_status,
};
use crate::resultset::{
    BinaryResultsetFactory, Resultset, ResultsetChain, ResultsetFactory, Row, TextResultsetFactory,
};
use crate::server_session::{Greeting, ServerSession};
use crate::tls;
use crate::transport::{NetStream, SocketConnection};
use crate::types::escape_string;

/// Upper bound on auth-switch and auth-more-data rounds.
const MAX_AUTH_ROUNDS: usize = 8;

/// Server variables read by [`MySqlConnection::init_server_session`].
const SESSION_VARIABLES: &[&str] = &[
    "wait_timeout",
    "interactive_timeout",
    "max_allowed_packet",
    "time_zone",
    "system_time_zone",
    "character_set_client",
    "character_set_connection",
    "character_set_results",
    "collation_connection",
    "sql_mode",
    "auto_increment_increment",
];

/// Engine state.
///
/// `Unconnected → Handshaking → Ready → (Executing ⇄ Ready) → Closed`;
/// `Failed` after an unrecoverable I/O or protocol error. A failed engine
/// must be discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Unconnected,
    Handshaking,
    Ready,
    Executing,
    Failed,
    Closed,
}

/// A MySQL protocol engine over the transport `S`.
pub struct MySqlConnection<S: SocketConnection> {
    stream: S,
    state: ConnectionState,
    config: MySqlConfig,
    session: ServerSession,
    database: Option<String>,
    /// Reusable buffer holding the most recent response
    message: Message,
    /// Sequence id expected on the next frame, read or written
    sequence_id: u8,
    last_sent: Instant,
    last_received: Option<Instant>,
    statements: QueryInfoCache<Arc<PreparedStatement>>,
    registry: Arc<EncoderRegistry>,
    options: Arc<EncodingOptions>,
}

impl<S: SocketConnection> std::fmt::Debug for MySqlConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConnection")
            .field("state", &self.state)
            .field("connection_id", &self.session.connection_id)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

impl MySqlConnection<NetStream> {
    /// Open a TCP connection and run the handshake with the configured
    /// credentials.
    pub fn open(config: MySqlConfig) -> Result<Self> {
        let stream = NetStream::connect(&config)?;
        let user = config.user.clone();
        let password = config.password.clone().unwrap_or_default();
        let database = config.database.clone();
        let mut conn = Self::new(stream, config);
        conn.connect(&user, &password, database.as_deref())?;
        Ok(conn)
    }
}

impl<S: SocketConnection> MySqlConnection<S> {
    /// Wrap an established transport. Nothing is read or written until
    /// [`connect`](Self::connect).
    pub fn new(stream: S, config: MySqlConfig) -> Self {
        let statements = QueryInfoCacheFactory::from_properties(&config.properties).create();
        let options = Arc::new(EncodingOptions::from_properties(&config.properties));
        Self {
            stream,
            state: ConnectionState::Unconnected,
            config,
            session: ServerSession::default(),
            database: None,
            message: Message::new(),
            sequence_id: 0,
            last_sent: Instant::now(),
            last_received: None,
            statements,
            registry: Arc::new(EncoderRegistry::with_defaults()),
            options,
        }
    }

    /// Use `registry` for every bind value created from now on.
    pub fn with_encoder_registry(mut self, registry: Arc<EncoderRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    pub fn server_session(&self) -> &ServerSession {
        &self.session
    }

    /// Server thread id.
    pub fn connection_id(&self) -> u32 {
        self.session.connection_id
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn is_secure(&self) -> bool {
        self.stream.is_secure()
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn encoding_options(&self) -> Arc<EncodingOptions> {
        Arc::clone(&self.options)
    }

    pub fn encoder_registry(&self) -> Arc<EncoderRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn statement_cache(&self) -> &QueryInfoCache<Arc<PreparedStatement>> {
        &self.statements
    }

    /// A fresh bind slot sharing this connection's registry and options.
    pub fn bind_value(&self, index: usize) -> BindValue {
        BindValue::new(index, self.encoder_registry(), self.encoding_options())
    }

    /// Parameter slots for `stmt`.
    pub fn bindings_for(&self, stmt: &PreparedStatement) -> ParameterBindings {
        ParameterBindings::new(
            stmt.param_count(),
            self.encoder_registry(),
            self.encoding_options(),
        )
    }

    // ==================== Handshake ====================

    /// Run the handshake and authenticate.
    ///
    /// 1. Read the greeting
    /// 2. Negotiate capabilities and, if required, upgrade to TLS before any
    ///    credential is written
    /// 3. Send the handshake response and answer auth-switch and
    ///    auth-more-data requests until OK or ERR
    /// 4. Select `database` if it was not sent in the handshake
    ///
    /// Any failure leaves the engine `Failed`.
    #[tracing::instrument(level = "debug", skip(self, password), fields(host = %self.config.host))]
    pub fn connect(&mut self, user: &str, password: &str, database: Option<&str>) -> Result<()> {
        if self.state != ConnectionState::Unconnected {
            return Err(invalid_state(format!(
                "Cannot connect an engine in state {:?}",
                self.state
            )));
        }
        self.state = ConnectionState::Handshaking;
        let result = self
            .handshake(user, password, database)
            .and_then(|()| self.select_initial_database(database));
        if let Err(e) = &result {
            tracing::debug!(error = %e, "connect failed");
            self.state = ConnectionState::Failed;
            return result;
        }
        self.state = ConnectionState::Ready;
        tracing::debug!(
            connection_id = self.session.connection_id,
            server_version = %self.session.server_version,
            secure = self.stream.is_secure(),
            "connected"
        );
        Ok(())
    }

    /// `COM_INIT_DB` for servers that could not take the schema in the
    /// handshake response. Runs while still `Handshaking`.
    fn select_initial_database(&mut self, database: Option<&str>) -> Result<()> {
        let Some(db) = database else {
            return Ok(());
        };
        if self.session.has_capability(capabilities::CLIENT_CONNECT_WITH_DB) {
            return Ok(());
        }
        let payload = init_db_payload(db);
        self.check_packet_size(payload.as_bytes().len())?;
        self.round_trip(payload.as_bytes(), None)?;
        self.message.check_error()?;
        let ok = self.message.parse_ok()?;
        self.update_status(ok.status_flags);
        self.database = Some(db.to_string());
        Ok(())
    }

    fn handshake(&mut self, user: &str, password: &str, database: Option<&str>) -> Result<()> {
        let handshake_timeout = self.config.connect_timeout_value();
        self.apply_timeouts(handshake_timeout)?;

        self.sequence_id = 0;
        self.next_message()?;
        if self.message.is_err() {
            return Err(connect_failure(self.message.parse_err()?));
        }
        let greeting = Greeting::parse(self.message.payload())?;
        self.session = ServerSession::from_greeting(&greeting);

        let ssl_mode = self.config.ssl_mode_value();
        tls::validate_tls_config(ssl_mode, &self.config.tls)?;
        let use_ssl = tls::negotiate_ssl(ssl_mode, greeting.capabilities)?;

        let mut client_caps = self.config.capability_flags();
        match database {
            Some(_) => client_caps |= capabilities::CLIENT_CONNECT_WITH_DB,
            None => client_caps &= !capabilities::CLIENT_CONNECT_WITH_DB,
        }
        if !use_ssl {
            client_caps &= !capabilities::CLIENT_SSL;
        }
        client_caps &= greeting.capabilities;
        self.session.client_capabilities = client_caps;
        tracing::debug!(
            server_caps = format_args!("{:#010x}", greeting.capabilities),
            client_caps = format_args!("{:#010x}", client_caps),
            plugin = %greeting.auth_plugin,
            "negotiated capabilities"
        );

        let max_packet = u32::try_from(self.config.max_allowed_packet_value()).unwrap_or(u32::MAX);
        if use_ssl {
            let request =
                tls::build_ssl_request_payload(client_caps, max_packet, self.config.charset);
            self.write_packet(&request)?;
            let server_name = self
                .config
                .tls
                .server_name
                .clone()
                .unwrap_or_else(|| self.config.host.clone());
            self.stream
                .upgrade_to_secure(&self.config.tls, &server_name, ssl_mode)?;
            tracing::debug!(%server_name, "upgraded to TLS");
        }
        let secure = self.stream.is_secure();

        let mut plugin = auth::plugin_for(&greeting.auth_plugin, password).or_else(|e| {
            let fallback = self
                .config
                .properties
                .get_str(PropertyKey::DefaultAuthenticationPlugin)
                .unwrap_or(auth::plugins::CACHING_SHA2_PASSWORD);
            tracing::debug!(error = %e, fallback, "server plugin unavailable, using default");
            auth::plugin_for(fallback, password)
        })?;
        let auth_response = match plugin.next_response(&greeting.auth_data, secure)? {
            AuthStep::Respond(bytes) => bytes,
            AuthStep::Wait => Vec::new(),
        };

        let response = self.handshake_response(
            client_caps,
            max_packet,
            user,
            &auth_response,
            database,
            plugin.name(),
        );
        self.write_packet(&response)?;

        self.authenticate(&mut plugin, password, secure)?;
        if let Some(db) = database {
            if client_caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
                self.database = Some(db.to_string());
            }
        }

        self.apply_timeouts(self.config.socket_timeout_value())?;
        self.refresh_options();
        Ok(())
    }

    fn handshake_response(
        &self,
        client_caps: u32,
        max_packet: u32,
        user: &str,
        auth_response: &[u8],
        database: Option<&str>,
        plugin: &str,
    ) -> Vec<u8> {
        let mut writer = PacketWriter::new();
        writer.write_u32_le(client_caps);
        writer.write_u32_le(max_packet);
        writer.write_u8(self.config.charset);
        writer.write_zeros(23);
        writer.write_null_string(user);

        if client_caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            writer.write_lenenc_bytes(auth_response);
        } else if client_caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            writer.write_u8(auth_response.len() as u8);
            writer.write_bytes(auth_response);
        } else {
            writer.write_bytes(auth_response);
            writer.write_u8(0);
        }

        if client_caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            writer.write_null_string(database.unwrap_or_default());
        }

        if client_caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            writer.write_null_string(plugin);
        }

        if client_caps & capabilities::CLIENT_CONNECT_ATTRS != 0 {
            let mut attrs = PacketWriter::new();
            for (key, value) in &self.config.attributes {
                attrs.write_lenenc_string(key);
                attrs.write_lenenc_string(value);
            }
            writer.write_lenenc_bytes(attrs.as_bytes());
        }

        writer.into_bytes()
    }

    /// Answer the server until it accepts or rejects the credentials.
    fn authenticate(
        &mut self,
        plugin: &mut Box<dyn AuthenticationPlugin>,
        password: &str,
        secure: bool,
    ) -> Result<()> {
        for _ in 0..MAX_AUTH_ROUNDS {
            self.next_message()?;
            let payload = self.message.payload();
            let step = match payload.first() {
                Some(0x00) => {
                    let ok = self.message.parse_ok()?;
                    self.session.status_flags = ok.status_flags;
                    return Ok(());
                }
                Some(0xFF) => return Err(auth_failure(self.message.parse_err()?)),
                Some(0xFE) => {
                    let mut reader = self.message.reader();
                    reader.skip(1)?;
                    let name = reader.read_null_string();
                    let data = reader.read_rest().to_vec();
                    tracing::debug!(from = plugin.name(), to = %name, "auth switch");
                    *plugin = auth::plugin_for(&name, password)?;
                    plugin.next_response(&data, secure)?
                }
                Some(0x01) => {
                    let data = payload[1..].to_vec();
                    plugin.next_response(&data, secure)?
                }
                Some(other) => {
                    return Err(Error::protocol(format!(
                        "Unexpected authentication packet 0x{:02X}",
                        other
                    )));
                }
                None => return Err(Error::protocol("Empty authentication packet")),
            };
            if let AuthStep::Respond(bytes) = step {
                self.write_packet(&bytes)?;
            }
        }
        Err(Error::protocol("Too many authentication round trips"))
    }

    fn apply_timeouts(&mut self, read_timeout: Option<Duration>) -> Result<()> {
        let write_timeout = self.config.write_timeout_value();
        let applied = self
            .stream
            .set_read_timeout(read_timeout)
            .and_then(|()| self.stream.set_write_timeout(write_timeout));
        applied.map_err(|e| self.link_failure(e))
    }

    // ==================== Framing ====================

    /// Frame and write one logical message, continuing the current sequence.
    fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let (wire, next) = frame_payload(payload, self.sequence_id);
        tracing::trace!(seq = self.sequence_id, len = payload.len(), "write packet");
        let written = self
            .stream
            .write_all(&wire)
            .and_then(|()| self.stream.flush());
        if let Err(e) = written {
            return Err(self.link_failure(e));
        }
        self.sequence_id = next;
        self.last_sent = Instant::now();
        Ok(())
    }

    /// Read one logical message into `message`, reassembling continuation
    /// frames.
    fn read_into(&mut self, message: &mut Message) -> Result<()> {
        if let Err(e) = message.read_from(&mut self.stream) {
            if e.kind() == std::io::ErrorKind::InvalidData {
                self.state = ConnectionState::Failed;
                return Err(Error::protocol(e.to_string()));
            }
            return Err(self.link_failure(e));
        }
        self.last_received = Some(Instant::now());
        tracing::trace!(
            seq = message.first_sequence_id(),
            len = message.len(),
            frames = message.frames(),
            "read packet"
        );
        if message.first_sequence_id() != self.sequence_id {
            self.state = ConnectionState::Failed;
            return Err(Error::protocol(format!(
                "Packets out of order: expected sequence {}, received {}",
                self.sequence_id,
                message.first_sequence_id()
            )));
        }
        self.sequence_id = message.sequence_id().wrapping_add(1);
        Ok(())
    }

    fn next_message(&mut self) -> Result<()> {
        let mut message = std::mem::take(&mut self.message);
        let result = self.read_into(&mut message);
        self.message = message;
        result
    }

    /// Read the next logical message, reusing the allocation of `reuse`.
    ///
    /// A framing failure leaves the engine `Failed`.
    pub fn read_message(&mut self, reuse: Option<Message>) -> Result<Message> {
        let mut message = reuse.unwrap_or_default();
        let result = self.read_into(&mut message);
        self.fail_on_desync(result)?;
        Ok(message)
    }

    /// Classify and describe an I/O failure; the engine is unusable afterwards.
    fn link_failure(&mut self, cause: std::io::Error) -> Error {
        let interactive = self.config.properties.get_bool(PropertyKey::InteractiveClient);
        let ctx = LinkFailureContext::capture(
            &self.config.properties,
            self.last_sent,
            self.last_received,
            self.session.server_timeout(interactive),
            Instant::now(),
        );
        let diagnosis = diagnose_link_failure(&ctx, &cause);
        tracing::warn!(
            error = %cause,
            due_to_timeout = ?diagnosis.due_to_timeout,
            "communications link failure"
        );
        self.state = ConnectionState::Failed;
        diagnosis.into_error(cause)
    }

    // ==================== Command dispatch ====================

    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            ConnectionState::Ready => Ok(()),
            ConnectionState::Closed => Err(invalid_state("Connection is closed")),
            ConnectionState::Failed => Err(invalid_state(
                "Connection is broken after a communications failure",
            )),
            other => Err(invalid_state(format!(
                "Connection not ready for commands (state {:?})",
                other
            ))),
        }
    }

    fn begin(&mut self) -> Result<()> {
        self.ensure_ready()?;
        self.state = ConnectionState::Executing;
        Ok(())
    }

    /// Leave `Executing`: back to `Ready` unless the error desynchronised
    /// the stream.
    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        if self.state == ConnectionState::Executing {
            self.state = ConnectionState::Ready;
        }
        self.fail_on_desync(result)
    }

    /// Link, framing and decoding errors leave the stream at an unknown
    /// position; the engine cannot be used after them.
    fn fail_on_desync<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(Error::Connection(_) | Error::Protocol(_) | Error::Io(_) | Error::Type(_)) =
            &result
        {
            self.state = ConnectionState::Failed;
        }
        result
    }

    fn check_packet_size(&self, len: usize) -> Result<()> {
        let max = self.options.max_allowed_packet;
        if len > max {
            return Err(Error::usage(
                UsageErrorKind::PacketTooLarge,
                format!(
                    "Packet for query is too large ({} > {}). You can change this value \
                     on the server by setting the 'max_allowed_packet' variable.",
                    len, max
                ),
            ));
        }
        Ok(())
    }

    /// Start a new command: write `payload` with sequence 0 and read the
    /// first response message under `timeout`.
    fn round_trip(&mut self, payload: &[u8], timeout: Option<Duration>) -> Result<()> {
        self.sequence_id = 0;
        self.write_packet(payload)?;
        if timeout.is_none() {
            return self.next_message();
        }
        if let Err(e) = self.stream.set_read_timeout(timeout) {
            return Err(self.link_failure(e));
        }
        let result = self.next_message();
        let restore = self.config.socket_timeout_value();
        if let Err(e) = self.stream.set_read_timeout(restore) {
            tracing::debug!(error = %e, "failed to restore socket timeout");
        }
        result
    }

    /// Send one command and return the raw first response message.
    ///
    /// Unless `skip_check`, an ERR response becomes the server error. The
    /// read is bounded by `timeout`, falling back to `socketTimeout`.
    #[tracing::instrument(level = "debug", skip(self, payload), fields(len = payload.len()))]
    pub fn send_command(
        &mut self,
        payload: &[u8],
        skip_check: bool,
        timeout: Option<Duration>,
    ) -> Result<&Message> {
        self.check_packet_size(payload.len())?;
        self.begin()?;
        let result = self.round_trip(payload, timeout).and_then(|()| {
            if skip_check {
                Ok(())
            } else {
                self.message.check_error()
            }
        });
        self.finish(result)?;
        Ok(&self.message)
    }

    fn simple_command(&mut self, payload: &[u8]) -> Result<()> {
        self.check_packet_size(payload.len())?;
        self.begin()?;
        let result = self.round_trip(payload, None).and_then(|()| {
            self.message.check_error()?;
            let ok = self.message.parse_ok()?;
            self.update_status(ok.status_flags);
            Ok(())
        });
        self.finish(result)
    }

    fn update_status(&mut self, status_flags: u16) {
        let escapes_changed = (self.session.status_flags ^ status_flags)
            & server_status::SERVER_STATUS_NO_BACKSLASH_ESCAPES
            != 0;
        self.session.status_flags = status_flags;
        if escapes_changed {
            self.refresh_options();
        }
    }

    fn refresh_options(&mut self) {
        let options =
            EncodingOptions::from_properties(&self.config.properties).with_server(&self.session);
        if *self.options != options {
            self.options = Arc::new(options);
        }
    }

    // ==================== Result decoding ====================

    fn read_column_definitions(&mut self, count: usize) -> Result<ColumnDefinition> {
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            self.next_message()?;
            fields.push(Field::parse(self.message.payload())?);
        }
        if count > 0 && !self.session.uses_deprecate_eof() {
            self.next_message()?;
            if !self.message.is_eof() {
                return Err(Error::protocol("Expected EOF after column definitions"));
            }
        }
        Ok(ColumnDefinition::new(fields))
    }

    /// Is the current message the end of a row stream?
    fn is_row_terminator(&self) -> bool {
        let payload = self.message.payload();
        match payload.first() {
            Some(0xFE) if self.session.uses_deprecate_eof() => payload.len() < MAX_PACKET_SIZE,
            Some(0xFE) => payload.len() < 9,
            _ => false,
        }
    }

    /// Decode `column_count` column definitions and the rows that follow,
    /// using `factory` for the row format.
    ///
    /// A malformed column definition or row leaves the engine `Failed`.
    pub fn read(
        &mut self,
        factory: &dyn ResultsetFactory,
        column_count: usize,
    ) -> Result<Resultset> {
        let result = self.read_resultset(factory, column_count);
        self.fail_on_desync(result)
    }

    fn read_resultset(
        &mut self,
        factory: &dyn ResultsetFactory,
        column_count: usize,
    ) -> Result<Resultset> {
        let columns = Arc::new(self.read_column_definitions(column_count)?);
        let mut rows = Vec::new();

        loop {
            self.next_message()?;
            if self.message.is_err() {
                return Err(self.message.parse_err()?.into_error());
            }
            if self.is_row_terminator() {
                break;
            }
            let values = factory.decode_row(&columns, self.message.payload())?;
            rows.push(Row::new(Arc::clone(&columns), values));
        }

        let (warnings, status_flags) = if self.session.uses_deprecate_eof() {
            let ok = self.message.parse_ok()?;
            (ok.warnings, ok.status_flags)
        } else {
            let eof = self.message.parse_eof()?;
            (eof.warnings, eof.status_flags)
        };
        self.update_status(status_flags);

        if columns.has_large_fields() {
            self.message.shrink(DEFAULT_BUFFER_CAPACITY);
        }

        let mut result = Resultset::with_rows(columns, rows);
        result.warnings = warnings;
        result.status_flags = status_flags;
        Ok(result)
    }

    /// Decode every result of the response whose first message is current.
    ///
    /// An ERR anywhere fails the whole chain.
    fn read_results(&mut self, factory: &dyn ResultsetFactory) -> Result<ResultsetChain> {
        let mut chain = ResultsetChain::new();
        loop {
            match self.message.packet_type() {
                PacketType::Ok => {
                    let ok = self.message.parse_ok()?;
                    self.update_status(ok.status_flags);
                    chain.push(Resultset::from_ok(ok));
                }
                PacketType::Error => return Err(self.message.parse_err()?.into_error()),
                PacketType::LocalInfile => {
                    self.decline_local_infile()?;
                    continue;
                }
                PacketType::Eof => {
                    return Err(Error::protocol("Unexpected EOF packet at start of result"));
                }
                PacketType::Data => {
                    let count = self.message.reader().read_lenenc_int()?;
                    let count = usize::try_from(count)
                        .map_err(|_| Error::protocol("Column count out of range"))?;
                    let result = self.read_resultset(factory, count)?;
                    chain.push(result);
                }
            }
            if !self.session.more_results_exist() {
                return Ok(chain);
            }
            self.next_message()?;
        }
    }

    /// Refuse a `LOAD DATA LOCAL INFILE` request with an empty packet and
    /// read the server's answer.
    fn decline_local_infile(&mut self) -> Result<()> {
        let file = String::from_utf8_lossy(&self.message.payload()[1..]).into_owned();
        tracing::warn!(%file, "declining LOCAL INFILE request");
        self.write_packet(&[])?;
        self.next_message()
    }

    // ==================== Queries ====================

    /// Run `sql` over the text protocol.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn execute_query(&mut self, sql: &str) -> Result<ResultsetChain> {
        let mut payload = PacketWriter::command(Command::Query, sql.len());
        payload.write_bytes(sql.as_bytes());
        let payload = payload.into_bytes();
        self.check_packet_size(payload.len())?;

        self.begin()?;
        let result = self
            .round_trip(&payload, None)
            .and_then(|()| self.read_results(&TextResultsetFactory));
        self.finish(result).map_err(|e| e.with_sql(sql))
    }

    /// Run `sql` with `?` parameters.
    ///
    /// With `useServerPrepStmts` the statement is prepared on the server and
    /// executed over the binary protocol. Otherwise each `?` is replaced by
    /// the literal of the matching parameter.
    pub fn execute_query_with(&mut self, sql: &str, params: &[BindValue]) -> Result<ResultsetChain> {
        if !self
            .config
            .properties
            .get_bool(PropertyKey::UseServerPrepStmts)
        {
            let sql = bind::interpolate(sql, params, self.session.no_backslash_escapes())?;
            return self.execute_query(&sql);
        }

        let stmt = self.prepare(sql)?;
        let result = self.execute_prepared(&stmt, params);
        let cached = self
            .statements
            .peek(sql)
            .is_some_and(|s| Arc::ptr_eq(s, &stmt));
        if !cached && self.is_ready() {
            if let Err(e) = self.close_statement(&stmt) {
                tracing::warn!(error = %e, statement_id = stmt.statement_id, "failed to close statement");
            }
        }
        result
    }

    /// Rows of the first row-bearing result of `sql`.
    pub fn query_rows(&mut self, sql: &str) -> Result<Vec<Row>> {
        let chain = self.execute_query(sql)?;
        Ok(chain
            .into_iter()
            .find(Resultset::has_rows)
            .map(Resultset::into_rows)
            .unwrap_or_default())
    }

    /// Affected rows of the first status result of `sql`.
    pub fn execute_update(&mut self, sql: &str) -> Result<u64> {
        let chain = self.execute_query(sql)?;
        Ok(chain
            .iter()
            .find_map(Resultset::update_count)
            .unwrap_or(0))
    }

    // ==================== Prepared statements ====================

    /// Prepare `sql` on the server, reusing a cached statement when
    /// `cachePrepStmts` is on.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn prepare(&mut self, sql: &str) -> Result<Arc<PreparedStatement>> {
        if let Some(stmt) = self.statements.get(sql) {
            tracing::trace!(statement_id = stmt.statement_id, "statement cache hit");
            return Ok(Arc::clone(stmt));
        }

        let payload = stmt_prepare_payload(sql);
        self.check_packet_size(payload.len())?;
        self.begin()?;
        let result = self.prepare_on_server(sql, &payload);
        let stmt = Arc::new(self.finish(result).map_err(|e| e.with_sql(sql))?);

        if let Some((key, evicted)) = self.statements.put(sql, Arc::clone(&stmt)) {
            if !Arc::ptr_eq(&evicted, &stmt) {
                tracing::debug!(sql = %key, statement_id = evicted.statement_id, "evicted cached statement");
                if let Err(e) = self.send_close(evicted.statement_id) {
                    tracing::warn!(error = %e, statement_id = evicted.statement_id, "failed to close evicted statement");
                }
            }
        }
        Ok(stmt)
    }

    fn prepare_on_server(&mut self, sql: &str, payload: &[u8]) -> Result<PreparedStatement> {
        self.round_trip(payload, None)?;
        self.message.check_error()?;
        let ok = StmtPrepareOk::parse(self.message.payload())?;
        let params = self.read_column_definitions(usize::from(ok.num_params))?;
        let columns = self.read_column_definitions(usize::from(ok.num_columns))?;
        tracing::debug!(
            statement_id = ok.statement_id,
            params = ok.num_params,
            columns = ok.num_columns,
            "prepared statement"
        );
        Ok(PreparedStatement::new(sql, ok.statement_id, params, columns))
    }

    /// Execute a prepared statement over the binary protocol.
    #[tracing::instrument(level = "debug", skip(self, stmt, params), fields(statement_id = stmt.statement_id))]
    pub fn execute_prepared(
        &mut self,
        stmt: &PreparedStatement,
        params: &[BindValue],
    ) -> Result<ResultsetChain> {
        if params.len() != stmt.param_count() {
            return Err(Error::usage(
                UsageErrorKind::InvalidArgument,
                format!(
                    "Statement expects {} parameters but {} were supplied",
                    stmt.param_count(),
                    params.len()
                ),
            ));
        }
        let payload = stmt_execute_payload(stmt.statement_id, params)?;
        self.check_packet_size(payload.len())?;

        self.begin()?;
        let result = self
            .round_trip(&payload, None)
            .and_then(|()| self.read_results(&BinaryResultsetFactory));
        self.finish(result).map_err(|e| e.with_sql(&stmt.sql))
    }

    /// Execute every queued batch row of `bindings`, returning the update
    /// count of each.
    pub fn execute_batch(
        &mut self,
        stmt: &PreparedStatement,
        bindings: &mut ParameterBindings,
    ) -> Result<Vec<u64>> {
        bindings
            .take_batch()
            .iter()
            .map(|row| {
                let chain = self.execute_prepared(stmt, row)?;
                Ok(chain.iter().find_map(Resultset::update_count).unwrap_or(0))
            })
            .collect()
    }

    /// Deallocate `stmt` on the server and drop it from the cache.
    pub fn close_statement(&mut self, stmt: &PreparedStatement) -> Result<()> {
        let cached = self
            .statements
            .peek(&stmt.sql)
            .is_some_and(|s| s.statement_id == stmt.statement_id);
        if cached {
            self.statements.invalidate(&stmt.sql);
        }
        self.send_close(stmt.statement_id)
    }

    /// `COM_STMT_CLOSE` has no response.
    fn send_close(&mut self, statement_id: u32) -> Result<()> {
        self.begin()?;
        self.sequence_id = 0;
        let result = self.write_packet(&stmt_close_payload(statement_id));
        self.finish(result)
    }

    // ==================== Session management ====================

    /// `COM_PING`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn ping(&mut self) -> Result<()> {
        self.simple_command(&[Command::Ping as u8])
    }

    /// `COM_INIT_DB`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn change_database(&mut self, database: &str) -> Result<()> {
        self.simple_command(init_db_payload(database).as_bytes())?;
        self.database = Some(database.to_string());
        Ok(())
    }

    /// `COM_RESET_CONNECTION`: clear session state on the server without
    /// re-authenticating. Server-side statements are gone afterwards, so
    /// the statement cache is dropped.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn reset(&mut self) -> Result<()> {
        self.simple_command(&[Command::ResetConnection as u8])?;
        let dropped = self.statements.invalidate_all();
        self.message.shrink(DEFAULT_BUFFER_CAPACITY);
        tracing::debug!(dropped_statements = dropped.len(), "connection reset");
        Ok(())
    }

    /// Read the server variables the engine relies on and apply
    /// `defaultTransactionTimeout`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn init_server_session(&mut self) -> Result<()> {
        let select = SESSION_VARIABLES
            .iter()
            .map(|name| format!("@@{name} AS {name}"))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = self.query_rows(&format!("SELECT {select}"))?;
        let row = rows
            .first()
            .ok_or_else(|| Error::protocol("Server returned no session variables"))?;
        for (field, value) in row.columns().fields().iter().zip(row.values()) {
            if let Some(text) = value_text(value) {
                self.session.set_variable(field.name.clone(), text);
            }
        }

        let lock_wait = self
            .config
            .properties
            .get_int(PropertyKey::DefaultTransactionTimeout);
        if lock_wait > 0 {
            self.execute_query(&format!("SET SESSION innodb_lock_wait_timeout = {lock_wait}"))?;
        }

        self.refresh_options();
        Ok(())
    }

    /// Resolve the session time zone.
    ///
    /// With no `connectionTimeZone` (or `SERVER`) the server's zone is used,
    /// `SYSTEM` resolving to `system_time_zone`. Otherwise the configured
    /// zone is used, and written to the session when
    /// `forceConnectionTimeZoneToSession` is on.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn configure_time_zone(&mut self) -> Result<String> {
        let configured = self
            .config
            .properties
            .get_str(PropertyKey::ConnectionTimeZone)
            .map(str::to_string);

        let zone = match configured {
            Some(zone) if !zone.eq_ignore_ascii_case("SERVER") => {
                if self
                    .config
                    .properties
                    .get_bool(PropertyKey::ForceConnectionTimeZoneToSession)
                {
                    let literal = escape_string(&zone, self.session.no_backslash_escapes());
                    self.execute_query(&format!("SET SESSION time_zone = '{literal}'"))?;
                    self.session.set_variable("time_zone", zone.clone());
                }
                zone
            }
            _ => self.server_time_zone()?,
        };

        tracing::debug!(%zone, "session time zone");
        self.session.time_zone = Some(zone.clone());
        Ok(zone)
    }

    fn server_time_zone(&mut self) -> Result<String> {
        if self.session.variable("time_zone").is_none() {
            let rows = self.query_rows(
                "SELECT @@session.time_zone AS time_zone, @@system_time_zone AS system_time_zone",
            )?;
            if let Some(row) = rows.first() {
                for (field, value) in row.columns().fields().iter().zip(row.values()) {
                    if let Some(text) = value_text(value) {
                        self.session.set_variable(field.name.clone(), text);
                    }
                }
            }
        }
        let zone = match self.session.variable("time_zone") {
            Some(zone) if zone.eq_ignore_ascii_case("SYSTEM") => {
                self.session.variable("system_time_zone").unwrap_or(zone)
            }
            Some(zone) => zone,
            None => return Err(Error::protocol("Server did not report its time zone")),
        };
        Ok(zone.to_string())
    }

    /// `COM_QUIT` and shut the transport down. Best effort and idempotent.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn close(&mut self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        if matches!(
            self.state,
            ConnectionState::Ready | ConnectionState::Executing
        ) {
            self.sequence_id = 0;
            let (wire, _) = frame_payload(&[Command::Quit as u8], 0);
            let quit = self.stream.write_all(&wire).and_then(|()| self.stream.flush());
            if let Err(e) = quit {
                tracing::warn!(error = %e, "failed to send COM_QUIT");
            }
        }
        if let Err(e) = self.stream.shutdown() {
            tracing::debug!(error = %e, "transport shutdown failed");
        }
        self.statements.invalidate_all();
        self.state = ConnectionState::Closed;
        Ok(())
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Text(s) | Value::Decimal(s) => Some(s.clone()),
        Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
        Value::UnsignedBigInt(v) => Some(v.to_string()),
        other => other
            .as_i64()
            .map(|v| v.to_string())
            .or_else(|| other.as_f64().map(|v| v.to_string())),
    }
}

fn invalid_state(message: impl Into<String>) -> Error {
    Error::usage(UsageErrorKind::InvalidState, message)
}

fn server_connection_error(kind: ConnectionErrorKind, err: ErrPacket) -> Error {
    let sqlstate = (!err.sql_state.is_empty()).then_some(err.sql_state);
    let mut base = Error::connection(kind, err.error_message);
    if let Error::Connection(ConnectionError {
        sqlstate: state,
        vendor_code,
        ..
    }) = &mut base
    {
        if sqlstate.is_some() {
            *state = sqlstate;
        }
        *vendor_code = Some(err.error_code);
    }
    base
}

fn auth_failure(err: ErrPacket) -> Error {
    server_connection_error(ConnectionErrorKind::Authentication, err)
}

/// The server refused the connection in its greeting.
fn init_db_payload(database: &str) -> PacketWriter {
    let mut payload = PacketWriter::command(Command::InitDb, database.len());
    payload.write_bytes(database.as_bytes());
    payload
}

fn connect_failure(err: ErrPacket) -> Error {
    server_connection_error(ConnectionErrorKind::Connect, err)
}
