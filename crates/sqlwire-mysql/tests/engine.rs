//! Engine tests against a scripted in-memory server.
//!
//! Each test pre-records every byte the server will send, drives the engine
//! and then inspects the messages the client wrote.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlwire_core::error::{ConnectionErrorKind, UsageErrorKind};
use sqlwire_core::{Error, Result, Value};
use sqlwire_mysql::auth;
use sqlwire_mysql::protocol::writer::frame_payload;
use sqlwire_mysql::protocol::{MAX_PACKET_SIZE, Message, PacketWriter, capabilities};
use sqlwire_mysql::session::Connector;
use sqlwire_mysql::{
    ConnectionState, Field, FieldType, MySqlConfig, MySqlConnection, Session, SocketConnection,
    SslMode, TextResultsetFactory, TlsConfig,
};

const SEED: &[u8; 20] = b"abcdefghijklmnopqrst";
const AUTOCOMMIT: u16 = 0x0002;
const MORE_RESULTS: u16 = 0x0008;
const CAPS: u32 = capabilities::BASE_CLIENT_FLAGS | capabilities::CLIENT_CONNECT_WITH_DB;
const LEGACY_CAPS: u32 = CAPS & !capabilities::CLIENT_DEPRECATE_EOF;

// ==================== Transport ====================

/// What the client did, shared with the test after the transport moves into
/// the engine.
#[derive(Clone, Default)]
struct Wire {
    written: Arc<Mutex<Vec<u8>>>,
    read_timeouts: Arc<Mutex<Vec<Option<Duration>>>>,
    shut_down: Arc<AtomicBool>,
}

impl Wire {
    fn messages(&self) -> Vec<Message> {
        let bytes = self.written.lock().unwrap().clone();
        let mut rest = bytes.as_slice();
        let mut out = Vec::new();
        while !rest.is_empty() {
            let mut message = Message::new();
            message.read_from(&mut rest).unwrap();
            out.push(message);
        }
        out
    }

    fn last_message(&self) -> Message {
        self.messages().pop().unwrap()
    }

    fn read_timeouts(&self) -> Vec<Option<Duration>> {
        self.read_timeouts.lock().unwrap().clone()
    }
}

struct ScriptedTransport {
    input: io::Cursor<Vec<u8>>,
    wire: Wire,
    /// Reads past the script time out instead of hitting end of stream.
    timeout_when_drained: bool,
    secure: bool,
}

impl ScriptedTransport {
    fn new(script: Script) -> (Self, Wire) {
        let wire = Wire::default();
        let transport = Self {
            input: io::Cursor::new(script.bytes),
            wire: wire.clone(),
            timeout_when_drained: false,
            secure: false,
        };
        (transport, wire)
    }
}

impl Read for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let drained = self.input.position() as usize >= self.input.get_ref().len();
        if drained && self.timeout_when_drained {
            return Err(io::Error::from(io::ErrorKind::TimedOut));
        }
        self.input.read(buf)
    }
}

impl Write for ScriptedTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.wire.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SocketConnection for ScriptedTransport {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.wire.read_timeouts.lock().unwrap().push(timeout);
        Ok(())
    }

    fn set_write_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn upgrade_to_secure(&mut self, _: &TlsConfig, _: &str, _: SslMode) -> Result<()> {
        self.secure = true;
        Ok(())
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.wire.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ==================== Server script ====================

/// Server bytes with automatic sequence numbering.
#[derive(Default)]
struct Script {
    bytes: Vec<u8>,
    seq: u8,
}

impl Script {
    fn packet(mut self, payload: &[u8]) -> Self {
        let (wire, next) = frame_payload(payload, self.seq);
        self.bytes.extend_from_slice(&wire);
        self.seq = next;
        self
    }

    /// Skip the sequence id of a client packet.
    fn client(mut self) -> Self {
        self.seq = self.seq.wrapping_add(1);
        self
    }

    /// Start the response to a new command.
    fn command(mut self) -> Self {
        self.seq = 1;
        self
    }

    /// Greeting and OK for a one-round mysql_native_password login.
    fn handshake(caps: u32) -> Self {
        Script::default()
            .packet(&greeting(auth::plugins::MYSQL_NATIVE_PASSWORD, caps))
            .client()
            .packet(&ok(0, AUTOCOMMIT))
    }

    fn text_result(self, columns: &[Field], rows: &[&[Option<&str>]], status: u16, eof: bool) -> Self {
        let mut script = self.packet(&[columns.len() as u8]);
        for column in columns {
            script = script.packet(&column.to_payload());
        }
        if eof {
            script = script.packet(&eof_packet(status));
        }
        for row in rows {
            script = script.packet(&text_row(row));
        }
        if eof {
            script.packet(&eof_packet(status))
        } else {
            script.packet(&ok_terminator(status))
        }
    }
}

fn greeting(plugin: &str, caps: u32) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(10);
    w.write_null_string("8.0.36-scripted");
    w.write_u32_le(77);
    w.write_bytes(&SEED[..8]);
    w.write_u8(0);
    w.write_u16_le((caps & 0xFFFF) as u16);
    w.write_u8(255);
    w.write_u16_le(AUTOCOMMIT);
    w.write_u16_le((caps >> 16) as u16);
    w.write_u8(21);
    w.write_zeros(10);
    w.write_bytes(&SEED[8..]);
    w.write_u8(0);
    w.write_null_string(plugin);
    w.into_bytes()
}

fn ok(affected_rows: u64, status: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0x00);
    w.write_lenenc_int(affected_rows);
    w.write_lenenc_int(0);
    w.write_u16_le(status);
    w.write_u16_le(0);
    w.into_bytes()
}

fn ok_terminator(status: u16) -> Vec<u8> {
    let mut payload = ok(0, status);
    payload[0] = 0xFE;
    payload
}

fn eof_packet(status: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0xFE);
    w.write_u16_le(0);
    w.write_u16_le(status);
    w.into_bytes()
}

fn err(code: u16, sqlstate: &str, message: &str) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0xFF);
    w.write_u16_le(code);
    w.write_u8(b'#');
    w.write_bytes(sqlstate.as_bytes());
    w.write_bytes(message.as_bytes());
    w.into_bytes()
}

fn text_row(values: &[Option<&str>]) -> Vec<u8> {
    let mut w = PacketWriter::new();
    for value in values {
        match value {
            Some(v) => w.write_lenenc_string(v),
            None => w.write_u8(0xFB),
        }
    }
    w.into_bytes()
}

fn prepare_ok(statement_id: u32, columns: u16, params: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0x00);
    w.write_u32_le(statement_id);
    w.write_u16_le(columns);
    w.write_u16_le(params);
    w.write_u8(0);
    w.write_u16_le(0);
    w.into_bytes()
}

fn config() -> MySqlConfig {
    MySqlConfig::new().user("app").password("secret")
}

fn connect(script: Script, config: MySqlConfig) -> (MySqlConnection<ScriptedTransport>, Wire) {
    let (transport, wire) = ScriptedTransport::new(script);
    let mut conn = MySqlConnection::new(transport, config.clone());
    conn.connect(
        &config.user,
        config.password.as_deref().unwrap_or_default(),
        config.database.as_deref(),
    )
    .unwrap();
    (conn, wire)
}

/// Fields of a client handshake response.
struct HandshakeResponse {
    caps: u32,
    user: String,
    auth: Vec<u8>,
    database: Option<String>,
    plugin: String,
}

fn parse_handshake_response(message: &Message) -> HandshakeResponse {
    let mut r = message.reader();
    let caps = r.read_u32_le().unwrap();
    r.skip(4 + 1 + 23).unwrap();
    let user = r.read_null_string();
    let auth = r.read_lenenc_bytes().unwrap().to_vec();
    let database =
        (caps & capabilities::CLIENT_CONNECT_WITH_DB != 0).then(|| r.read_null_string());
    let plugin = r.read_null_string();
    HandshakeResponse {
        caps,
        user,
        auth,
        database,
        plugin,
    }
}

fn connection_kind(err: &Error) -> Option<ConnectionErrorKind> {
    match err {
        Error::Connection(c) => Some(c.kind),
        _ => None,
    }
}

fn usage_kind(err: &Error) -> Option<UsageErrorKind> {
    match err {
        Error::Usage(u) => Some(u.kind),
        _ => None,
    }
}

// ==================== Handshake ====================

#[test]
fn handshake_native_password() {
    let (conn, wire) = connect(Script::handshake(CAPS), config().database("shop"));

    assert_eq!(conn.state(), ConnectionState::Ready);
    assert_eq!(conn.connection_id(), 77);
    assert_eq!(conn.server_session().server_version, "8.0.36-scripted");
    assert_eq!(conn.database(), Some("shop"));
    assert!(conn.server_session().uses_deprecate_eof());

    let messages = wire.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].sequence_id(), 1);
    let response = parse_handshake_response(&messages[0]);
    assert_eq!(response.user, "app");
    assert_eq!(response.auth, auth::mysql_native_password("secret", SEED));
    assert_eq!(response.database.as_deref(), Some("shop"));
    assert_eq!(response.plugin, auth::plugins::MYSQL_NATIVE_PASSWORD);
    assert_eq!(response.caps & capabilities::CLIENT_SSL, 0);

    // connectTimeout during the handshake, socketTimeout (none) afterwards
    assert_eq!(
        wire.read_timeouts(),
        vec![Some(Duration::from_secs(30)), None]
    );
}

#[test]
fn handshake_selects_database_when_server_lacks_connect_with_db() {
    let caps = CAPS & !capabilities::CLIENT_CONNECT_WITH_DB;
    let script = Script::handshake(caps).command().packet(&ok(0, AUTOCOMMIT));
    let (conn, wire) = connect(script, config().database("shop"));

    assert_eq!(conn.database(), Some("shop"));
    let init_db = wire.last_message();
    assert_eq!(init_db.payload(), b"\x02shop");
    assert_eq!(init_db.first_sequence_id(), 0);
}

#[test]
fn failed_database_selection_fails_connect() {
    let caps = CAPS & !capabilities::CLIENT_CONNECT_WITH_DB;
    let script = Script::handshake(caps)
        .command()
        .packet(&err(1049, "42000", "Unknown database 'nope'"));
    let (transport, _wire) = ScriptedTransport::new(script);
    let mut conn = MySqlConnection::new(transport, config());

    let err = conn.connect("app", "secret", Some("nope")).unwrap_err();
    assert_eq!(err.vendor_code(), Some(1049));
    assert_eq!(conn.state(), ConnectionState::Failed);
    assert_eq!(conn.database(), None);
    assert!(conn.ping().is_err());
    assert!(conn.connect("app", "secret", None).is_err());
}

#[test]
fn handshake_auth_switch() {
    let new_seed = b"ABCDEFGHIJKLMNOPQRST";
    let mut switch = vec![0xFE];
    switch.extend_from_slice(b"mysql_native_password\0");
    switch.extend_from_slice(new_seed);
    switch.push(0);

    let script = Script::default()
        .packet(&greeting(auth::plugins::CACHING_SHA2_PASSWORD, CAPS))
        .client()
        .packet(&switch)
        .client()
        .packet(&ok(0, AUTOCOMMIT));
    let (conn, wire) = connect(script, config());

    assert!(conn.is_ready());
    let messages = wire.messages();
    assert_eq!(messages.len(), 2);
    let first = parse_handshake_response(&messages[0]);
    assert_eq!(first.plugin, auth::plugins::CACHING_SHA2_PASSWORD);
    assert_eq!(first.auth, auth::caching_sha2_password("secret", SEED));
    assert_eq!(messages[1].sequence_id(), 3);
    assert_eq!(
        messages[1].payload(),
        auth::mysql_native_password("secret", new_seed).as_slice()
    );
}

#[test]
fn handshake_caching_sha2_fast_auth() {
    let script = Script::default()
        .packet(&greeting(auth::plugins::CACHING_SHA2_PASSWORD, CAPS))
        .client()
        .packet(&[0x01, auth::caching_sha2::FAST_AUTH_SUCCESS])
        .packet(&ok(0, AUTOCOMMIT));
    let (conn, wire) = connect(script, config());

    assert!(conn.is_ready());
    // nothing is written in answer to the fast-auth marker
    assert_eq!(wire.messages().len(), 1);
}

#[test]
fn handshake_upgrades_before_credentials() {
    let caps = CAPS | capabilities::CLIENT_SSL;
    let script = Script::default()
        .packet(&greeting(auth::plugins::MYSQL_CLEAR_PASSWORD, caps))
        .client()
        .client()
        .packet(&ok(0, AUTOCOMMIT));
    let (conn, wire) = connect(script, config().ssl_mode(SslMode::Required));

    assert!(conn.is_secure());
    let messages = wire.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].len(), 32);
    assert_eq!(messages[0].sequence_id(), 1);
    let response = parse_handshake_response(&messages[1]);
    assert_eq!(messages[1].sequence_id(), 2);
    assert_ne!(response.caps & capabilities::CLIENT_SSL, 0);
    assert_eq!(response.auth, b"secret\0");
}

#[test]
fn handshake_required_ssl_without_server_support_fails() {
    let script = Script::default().packet(&greeting(auth::plugins::MYSQL_NATIVE_PASSWORD, CAPS));
    let (transport, wire) = ScriptedTransport::new(script);
    let mut conn = MySqlConnection::new(transport, config().ssl_mode(SslMode::Required));

    let err = conn.connect("app", "secret", None).unwrap_err();
    assert_eq!(connection_kind(&err), Some(ConnectionErrorKind::Ssl));
    assert_eq!(conn.state(), ConnectionState::Failed);
    assert!(wire.messages().is_empty());
}

#[test]
fn handshake_access_denied() {
    let script = Script::default()
        .packet(&greeting(auth::plugins::MYSQL_NATIVE_PASSWORD, CAPS))
        .client()
        .packet(&err(1045, "28000", "Access denied for user 'app'"));
    let (transport, _wire) = ScriptedTransport::new(script);
    let mut conn = MySqlConnection::new(transport, config());

    let err = conn.connect("app", "wrong", None).unwrap_err();
    assert_eq!(connection_kind(&err), Some(ConnectionErrorKind::Authentication));
    assert_eq!(err.vendor_code(), Some(1045));
    assert_eq!(err.sqlstate(), Some("28000"));
    assert_eq!(conn.state(), ConnectionState::Failed);

    let again = conn.connect("app", "secret", None).unwrap_err();
    assert_eq!(usage_kind(&again), Some(UsageErrorKind::InvalidState));
}

#[test]
fn handshake_rejected_in_greeting() {
    let script = Script::default().packet(&err(1130, "HY000", "Host is not allowed to connect"));
    let (transport, _wire) = ScriptedTransport::new(script);
    let mut conn = MySqlConnection::new(transport, config());

    let err = conn.connect("app", "secret", None).unwrap_err();
    assert_eq!(connection_kind(&err), Some(ConnectionErrorKind::Connect));
    assert_eq!(err.vendor_code(), Some(1130));
}

// ==================== Queries ====================

#[test]
fn text_query_rows() {
    let columns = [
        Field::new("id", FieldType::LongLong).with_table("users"),
        Field::new("name", FieldType::VarString).with_table("users"),
    ];
    let script = Script::handshake(CAPS).command().text_result(
        &columns,
        &[&[Some("1"), Some("ann")], &[Some("2"), None]],
        AUTOCOMMIT,
        false,
    );
    let (mut conn, wire) = connect(script, config());

    let chain = conn.execute_query("SELECT id, name FROM users").unwrap();
    assert_eq!(chain.len(), 1);
    let result = chain.first().unwrap();
    assert!(result.has_rows());
    let rows = result.rows();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get(0), Some(&Value::BigInt(1)));
    assert_eq!(rows[0].get_by_name("NAME").unwrap(), &Value::Text("ann".into()));
    assert_eq!(rows[1].get_by_name("users.name").unwrap(), &Value::Null);
    assert!(result.columns().unwrap().has_built_index_mapping());

    assert_eq!(wire.last_message().payload(), b"\x03SELECT id, name FROM users");
    assert!(conn.is_ready());
}

#[test]
fn text_query_with_legacy_eof_packets() {
    let columns = [Field::new("n", FieldType::Long)];
    let script = Script::handshake(LEGACY_CAPS)
        .command()
        .text_result(&columns, &[&[Some("7")]], AUTOCOMMIT, true);
    let (mut conn, _wire) = connect(script, config());

    assert!(!conn.server_session().uses_deprecate_eof());
    let rows = conn.query_rows("SELECT 7 AS n").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_as::<i64>("n").unwrap(), 7);
}

#[test]
fn multi_result_chain() {
    let columns = [Field::new("a", FieldType::Long)];
    let script = Script::handshake(CAPS)
        .command()
        .text_result(&columns, &[&[Some("1")]], AUTOCOMMIT | MORE_RESULTS, false)
        .packet(&ok(3, AUTOCOMMIT | MORE_RESULTS))
        .packet(&ok(0, AUTOCOMMIT));
    let (mut conn, _wire) = connect(script, config().allow_multi_queries(true));

    let chain = conn
        .execute_query("SELECT 1 AS a; UPDATE t SET x = 1; DO 0")
        .unwrap();
    assert_eq!(chain.len(), 3);
    assert!(chain.get(0).unwrap().has_rows());
    assert_eq!(chain.next_of(0).and_then(|r| r.update_count()), Some(3));
    assert_eq!(chain.next_of(1).and_then(|r| r.update_count()), Some(0));
    assert!(chain.next_of(2).is_none());

    // restartable traversal
    let counts: Vec<_> = chain.iter().map(|r| r.update_count()).collect();
    assert_eq!(counts, vec![None, Some(3), Some(0)]);
    assert_eq!(chain.iter().count(), 3);
    assert!(!conn.server_session().more_results_exist());
}

#[test]
fn error_mid_chain_fails_whole_chain() {
    let script = Script::handshake(CAPS)
        .command()
        .packet(&ok(1, AUTOCOMMIT | MORE_RESULTS))
        .packet(&err(1146, "42S02", "Table 'shop.missing' doesn't exist"))
        .command()
        .packet(&ok(0, AUTOCOMMIT));
    let (mut conn, _wire) = connect(script, config());

    let sql = "INSERT INTO t VALUES (1); SELECT * FROM missing";
    let err = conn.execute_query(sql).unwrap_err();
    assert_eq!(err.vendor_code(), Some(1146));
    assert_eq!(err.sqlstate(), Some("42S02"));
    assert_eq!(err.sql(), Some(sql));

    // a server error leaves the connection usable
    assert!(conn.is_ready());
    conn.ping().unwrap();
}

#[test]
fn continuation_frames_are_reassembled() {
    let blob = vec![0x5Au8; MAX_PACKET_SIZE + 100];
    let mut row = PacketWriter::with_capacity(blob.len() + 9);
    row.write_lenenc_bytes(&blob);

    let column = Field::new("data", FieldType::LongBlob).with_charset(63);
    let script = Script::handshake(CAPS)
        .command()
        .packet(&[1])
        .packet(&column.to_payload())
        .packet(row.as_bytes())
        .packet(&ok_terminator(AUTOCOMMIT))
        .command()
        .packet(&ok(0, AUTOCOMMIT));
    let (mut conn, _wire) = connect(script, config());

    let rows = conn.query_rows("SELECT data FROM blobs").unwrap();
    assert_eq!(rows.len(), 1);
    match rows[0].get(0) {
        Some(Value::Bytes(bytes)) => assert_eq!(bytes.len(), blob.len()),
        other => panic!("unexpected value {:?}", other),
    }
    // the sequence continued correctly across the split row
    conn.ping().unwrap();
}

#[test]
fn payload_at_exact_frame_multiple_gets_empty_terminator() {
    let (wire, next) = frame_payload(&vec![0u8; MAX_PACKET_SIZE], 3);
    assert_eq!(wire.len(), MAX_PACKET_SIZE + 8);
    assert_eq!(&wire[MAX_PACKET_SIZE + 4..], &[0, 0, 0, 4]);
    assert_eq!(next, 5);

    let mut message = Message::new();
    message.read_from(&mut wire.as_slice()).unwrap();
    assert_eq!(message.len(), MAX_PACKET_SIZE);
    assert_eq!(message.frames(), 2);
}

#[test]
fn read_message_reuses_buffer() {
    let (transport, _wire) = ScriptedTransport::new(Script::default().packet(&ok(9, 0)));
    let mut conn = MySqlConnection::new(transport, config());

    let reuse = Message::with_capacity(4096);
    let capacity = reuse.capacity();
    let message = conn.read_message(Some(reuse)).unwrap();
    assert!(message.capacity() >= capacity);
    assert_eq!(message.parse_ok().unwrap().affected_rows, 9);
}

#[test]
fn send_command_skip_check() {
    let script = Script::handshake(CAPS)
        .command()
        .packet(&err(1064, "42000", "You have an error in your SQL syntax"))
        .command()
        .packet(&err(1064, "42000", "You have an error in your SQL syntax"));
    let (mut conn, _wire) = connect(script, config());

    let message = conn.send_command(b"\x03SELEC 1", true, None).unwrap();
    assert!(message.is_err());

    let err = conn.send_command(b"\x03SELEC 1", false, None).unwrap_err();
    assert_eq!(err.vendor_code(), Some(1064));
    assert!(conn.is_ready());
}

#[test]
fn execute_query_with_binds_client_side() {
    let script = Script::handshake(CAPS)
        .command()
        .packet(&ok(1, AUTOCOMMIT));
    let (mut conn, wire) = connect(script, config());

    let mut name = conn.bind_value(1);
    name.bind(Value::Text("O'Brien".into())).unwrap();
    let mut age = conn.bind_value(2);
    age.bind(Value::Int(40)).unwrap();

    let chain = conn
        .execute_query_with("INSERT INTO people VALUES (?, ?)", &[name, age])
        .unwrap();
    assert_eq!(chain.first().and_then(|r| r.update_count()), Some(1));
    assert_eq!(
        wire.last_message().payload(),
        b"\x03INSERT INTO people VALUES ('O''Brien', 40)"
    );
}

#[test]
fn execute_query_with_server_prepared_statement() {
    let script = Script::handshake(CAPS)
        .command()
        .packet(&prepare_ok(3, 0, 1))
        .packet(&Field::new("?", FieldType::LongLong).to_payload())
        .command()
        .packet(&ok(1, AUTOCOMMIT));
    let config = config().property("useServerPrepStmts", "true").unwrap();
    let (mut conn, wire) = connect(script, config);

    let mut id = conn.bind_value(1);
    id.bind(Value::Int(9)).unwrap();
    let chain = conn
        .execute_query_with("DELETE FROM people WHERE id = ?", &[id])
        .unwrap();
    assert_eq!(chain.first().and_then(|r| r.update_count()), Some(1));

    let messages = wire.messages();
    let payloads: Vec<u8> = messages[1..].iter().map(|m| m.payload()[0]).collect();
    assert_eq!(payloads, vec![0x16, 0x17, 0x19]);
    assert_eq!(wire.last_message().payload(), &[0x19, 3, 0, 0, 0]);
}

#[test]
fn local_infile_is_declined() {
    let mut request = vec![0xFB];
    request.extend_from_slice(b"/etc/passwd");
    let script = Script::handshake(CAPS)
        .command()
        .packet(&request)
        .client()
        .packet(&ok(0, AUTOCOMMIT));
    let (mut conn, wire) = connect(script, config());

    let chain = conn
        .execute_query("LOAD DATA LOCAL INFILE '/etc/passwd' INTO TABLE t")
        .unwrap();
    assert_eq!(chain.len(), 1);

    let reply = wire.last_message();
    assert!(reply.is_empty());
    assert_eq!(reply.sequence_id(), 2);
}

#[test]
fn oversized_packet_is_rejected_before_writing() {
    let (mut conn, wire) = connect(Script::handshake(CAPS), config().max_allowed_packet(64));
    let written_before = wire.messages().len();

    let sql = format!("SELECT '{}'", "x".repeat(100));
    let err = conn.execute_query(&sql).unwrap_err();
    assert_eq!(usage_kind(&err), Some(UsageErrorKind::PacketTooLarge));
    assert!(err.to_string().contains("max_allowed_packet"));
    assert_eq!(wire.messages().len(), written_before);
    assert!(conn.is_ready());
}

// ==================== Failures ====================

#[test]
fn dropped_link_fails_engine() {
    let (mut conn, _wire) = connect(Script::handshake(CAPS), config());

    let err = conn.execute_query("SELECT 1").unwrap_err();
    assert_eq!(connection_kind(&err), Some(ConnectionErrorKind::Disconnected));
    assert_eq!(err.sqlstate(), Some("08S01"));
    assert!(err.to_string().contains("Communications link failure"));
    assert_eq!(conn.state(), ConnectionState::Failed);

    let err = conn.reset().unwrap_err();
    assert_eq!(usage_kind(&err), Some(UsageErrorKind::InvalidState));
}

#[test]
fn per_command_timeout() {
    let (transport, wire) = ScriptedTransport::new(Script::handshake(CAPS));
    let transport = ScriptedTransport {
        timeout_when_drained: true,
        ..transport
    };
    let mut conn = MySqlConnection::new(transport, config());
    conn.connect("app", "secret", None).unwrap();

    let err = conn
        .send_command(&[0x0e], false, Some(Duration::from_secs(5)))
        .unwrap_err();
    assert_eq!(connection_kind(&err), Some(ConnectionErrorKind::Timeout));
    assert_eq!(conn.state(), ConnectionState::Failed);

    let timeouts = wire.read_timeouts();
    assert!(timeouts.contains(&Some(Duration::from_secs(5))));
    assert_eq!(timeouts.last(), Some(&None));
}

#[test]
fn out_of_order_sequence_is_protocol_error() {
    let script = Script::handshake(CAPS).packet(&ok(0, AUTOCOMMIT));
    let (mut conn, _wire) = connect(script, config());

    let err = conn.ping().unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    assert!(err.to_string().contains("out of order"));
    assert_eq!(conn.state(), ConnectionState::Failed);
}

#[test]
fn malformed_column_definition_fails_engine() {
    let script = Script::handshake(CAPS)
        .command()
        .packet(&[1])
        .packet(&[0x03, b'd', b'e']);
    let (mut conn, _wire) = connect(script, config());

    let first = conn.send_command(b"\x03SELECT 1", false, None).unwrap();
    assert_eq!(first.payload(), &[1]);
    assert!(conn.is_ready());

    let err = conn.read(&TextResultsetFactory, 1).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "{err}");
    assert_eq!(conn.state(), ConnectionState::Failed);
    assert!(conn.ping().is_err());
}

#[test]
fn continuation_frame_out_of_order_fails_engine() {
    let (mut frames, _) = frame_payload(&vec![0x41u8; MAX_PACKET_SIZE + 10], 3);
    let second = 4 + MAX_PACKET_SIZE;
    frames[second + 3] = 7;
    let mut script = Script::handshake(CAPS);
    script.bytes.extend_from_slice(&frames);
    let (mut conn, _wire) = connect(script, config());

    let err = conn.read_message(None).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "{err}");
    assert!(err.to_string().contains("continuation sequence 4, received 7"));
    assert_eq!(conn.state(), ConnectionState::Failed);
}

// ==================== Prepared statements ====================

#[test]
fn prepare_execute_and_cache() {
    let script = Script::handshake(CAPS)
        .command()
        .packet(&prepare_ok(7, 1, 1))
        .packet(&Field::new("?", FieldType::LongLong).to_payload())
        .packet(&Field::new("x", FieldType::LongLong).to_payload())
        .command()
        .packet(&[1])
        .packet(&Field::new("x", FieldType::LongLong).to_payload())
        .packet(&[0x00, 0x00, 42, 0, 0, 0, 0, 0, 0, 0])
        .packet(&ok_terminator(AUTOCOMMIT));
    let (mut conn, wire) = connect(script, config().cache_prep_stmts(true));

    let stmt = conn.prepare("SELECT ? + 1 AS x").unwrap();
    assert_eq!(stmt.statement_id, 7);
    assert_eq!(stmt.param_count(), 1);
    assert_eq!(stmt.column_count(), 1);

    let again = conn.prepare("SELECT ? + 1 AS x").unwrap();
    assert!(Arc::ptr_eq(&stmt, &again));
    assert_eq!(wire.messages().len(), 2);

    let mut params = conn.bindings_for(&stmt);
    params.bind(1, Value::Int(41)).unwrap();
    let chain = conn.execute_prepared(&stmt, params.values()).unwrap();
    assert_eq!(chain.rows()[0].get_as::<i64>("x").unwrap(), 42);

    let execute = wire.last_message();
    assert_eq!(
        execute.payload(),
        &[0x17, 7, 0, 0, 0, 0x00, 1, 0, 0, 0, 0x00, 1, 0x03, 0x00, 41, 0, 0, 0]
    );
}

#[test]
fn execute_with_wrong_param_count() {
    let script = Script::handshake(CAPS)
        .command()
        .packet(&prepare_ok(1, 0, 2))
        .packet(&Field::new("?", FieldType::LongLong).to_payload())
        .packet(&Field::new("?", FieldType::LongLong).to_payload());
    let (mut conn, _wire) = connect(script, config());

    let stmt = conn.prepare("DO ? + ?").unwrap();
    let mut only = conn.bind_value(1);
    only.bind(Value::Int(1)).unwrap();
    let err = conn.execute_prepared(&stmt, &[only]).unwrap_err();
    assert_eq!(usage_kind(&err), Some(UsageErrorKind::InvalidArgument));

    let unset = [conn.bind_value(1), conn.bind_value(2)];
    let err = conn.execute_prepared(&stmt, &unset).unwrap_err();
    assert_eq!(usage_kind(&err), Some(UsageErrorKind::ParameterNotSet));
    assert!(conn.is_ready());
}

#[test]
fn evicted_statement_is_closed_on_server() {
    let column = Field::new("1", FieldType::LongLong).to_payload();
    let script = Script::handshake(CAPS)
        .command()
        .packet(&prepare_ok(1, 1, 0))
        .packet(&column)
        .command()
        .packet(&prepare_ok(2, 1, 0))
        .packet(&column);
    let config = config().cache_prep_stmts(true).prep_stmt_cache_size(1);
    let (mut conn, wire) = connect(script, config);

    conn.prepare("SELECT 1").unwrap();
    conn.prepare("SELECT 2").unwrap();

    let close = wire.last_message();
    assert_eq!(close.payload(), &[0x19, 1, 0, 0, 0]);
    assert_eq!(close.first_sequence_id(), 0);
    assert_eq!(conn.statement_cache().keys().collect::<Vec<_>>(), vec!["SELECT 2"]);
}

#[test]
fn close_statement_invalidates_cache() {
    let column = Field::new("1", FieldType::LongLong).to_payload();
    let script = Script::handshake(CAPS)
        .command()
        .packet(&prepare_ok(4, 1, 0))
        .packet(&column);
    let (mut conn, wire) = connect(script, config().cache_prep_stmts(true));

    let stmt = conn.prepare("SELECT 1").unwrap();
    assert!(conn.statement_cache().contains("SELECT 1"));
    conn.close_statement(&stmt).unwrap();
    assert!(!conn.statement_cache().contains("SELECT 1"));
    assert_eq!(wire.last_message().payload(), &[0x19, 4, 0, 0, 0]);
}

// ==================== Session management ====================

#[test]
fn reset_clears_statement_cache() {
    let column = Field::new("1", FieldType::LongLong).to_payload();
    let script = Script::handshake(CAPS)
        .command()
        .packet(&prepare_ok(4, 1, 0))
        .packet(&column)
        .command()
        .packet(&ok(0, AUTOCOMMIT));
    let (mut conn, wire) = connect(script, config().cache_prep_stmts(true));

    conn.prepare("SELECT 1").unwrap();
    conn.reset().unwrap();
    assert!(conn.statement_cache().is_empty());
    assert_eq!(wire.last_message().payload(), &[0x1f]);
    assert!(conn.is_ready());
}

#[test]
fn init_server_session_and_time_zone() {
    let names = [
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
    let columns: Vec<Field> = names
        .iter()
        .map(|n| Field::new(*n, FieldType::VarString))
        .collect();
    let values = [
        Some("600"),
        Some("900"),
        Some("1048576"),
        Some("SYSTEM"),
        Some("CET"),
        Some("utf8mb4"),
        Some("utf8mb4"),
        Some("utf8mb4"),
        Some("utf8mb4_0900_ai_ci"),
        Some("STRICT_TRANS_TABLES"),
        Some("1"),
    ];
    let script = Script::handshake(CAPS)
        .command()
        .text_result(&columns, &[&values], AUTOCOMMIT, false);
    let (mut conn, wire) = connect(script, config());

    conn.init_server_session().unwrap();
    let session = conn.server_session();
    assert_eq!(session.server_timeout(false), Some(600));
    assert_eq!(session.server_timeout(true), Some(900));
    assert_eq!(conn.encoding_options().max_allowed_packet, 1_048_576);
    assert!(
        String::from_utf8_lossy(wire.last_message().payload()).contains("@@wait_timeout")
    );

    assert_eq!(conn.configure_time_zone().unwrap(), "CET");
    assert_eq!(conn.server_session().time_zone.as_deref(), Some("CET"));
}

#[test]
fn forced_connection_time_zone() {
    let script = Script::handshake(CAPS)
        .command()
        .packet(&ok(0, AUTOCOMMIT));
    let config = config()
        .connection_time_zone("+02:00")
        .property("forceConnectionTimeZoneToSession", "true")
        .unwrap();
    let (mut conn, wire) = connect(script, config);

    assert_eq!(conn.configure_time_zone().unwrap(), "+02:00");
    assert_eq!(
        wire.last_message().payload(),
        b"\x03SET SESSION time_zone = '+02:00'"
    );
}

#[test]
fn default_transaction_timeout_is_applied() {
    let script = Script::handshake(CAPS)
        .command()
        .text_result(
            &[Field::new("wait_timeout", FieldType::LongLong)],
            &[&[Some("100")]],
            AUTOCOMMIT,
            false,
        )
        .command()
        .packet(&ok(0, AUTOCOMMIT));
    let config = config().property("defaultTransactionTimeout", "15").unwrap();
    let (mut conn, wire) = connect(script, config);

    conn.init_server_session().unwrap();
    assert_eq!(conn.server_session().server_timeout(false), Some(100));
    assert_eq!(
        wire.last_message().payload(),
        b"\x03SET SESSION innodb_lock_wait_timeout = 15"
    );
}

#[test]
fn close_is_idempotent() {
    let (mut conn, wire) = connect(Script::handshake(CAPS), config());

    conn.close().unwrap();
    conn.close().unwrap();
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(wire.shut_down.load(Ordering::SeqCst));
    assert_eq!(wire.last_message().payload(), &[0x01]);
    assert_eq!(wire.messages().len(), 2);

    let err = conn.ping().unwrap_err();
    assert_eq!(usage_kind(&err), Some(UsageErrorKind::InvalidState));
}

// ==================== Session ====================

fn session_script(connection_id: u32) -> Script {
    let mut payload = greeting(auth::plugins::MYSQL_NATIVE_PASSWORD, CAPS);
    // connection id follows the version string
    let id_at = 1 + "8.0.36-scripted".len() + 1;
    payload[id_at..id_at + 4].copy_from_slice(&connection_id.to_le_bytes());

    let columns = [
        Field::new("wait_timeout", FieldType::LongLong),
        Field::new("time_zone", FieldType::VarString),
    ];
    Script::default()
        .packet(&payload)
        .client()
        .packet(&ok(0, AUTOCOMMIT))
        .command()
        .text_result(&columns, &[&[Some("28800"), Some("UTC")]], AUTOCOMMIT, false)
}

fn scripted_connector(scripts: Vec<Script>, wires: Arc<Mutex<Vec<Wire>>>) -> Connector<ScriptedTransport> {
    let mut scripts = scripts.into_iter();
    Box::new(move |_config: &MySqlConfig| -> Result<ScriptedTransport> {
        let script = scripts
            .next()
            .ok_or_else(|| Error::connection(ConnectionErrorKind::Refused, "no more scripts"))?;
        let (transport, wire) = ScriptedTransport::new(script);
        wires.lock().unwrap().push(wire);
        Ok(transport)
    })
}

#[test]
fn session_reconnect_keeps_id() {
    let wires = Arc::new(Mutex::new(Vec::new()));
    let connector = scripted_connector(
        vec![session_script(100), session_script(200)],
        Arc::clone(&wires),
    );
    let mut session = Session::connect_with(config(), connector).unwrap();
    let id = session.id();
    assert!(session.is_connected());
    assert_eq!(session.engine().unwrap().connection_id(), 100);
    assert_eq!(
        session.engine().unwrap().server_session().time_zone.as_deref(),
        Some("UTC")
    );

    session.reconnect().unwrap();
    assert_eq!(session.id(), id);
    assert_eq!(session.engine().unwrap().connection_id(), 200);

    let wires = wires.lock().unwrap();
    assert!(wires[0].shut_down.load(Ordering::SeqCst));
    assert_eq!(wires[0].last_message().payload(), &[0x01]);
}

#[test]
fn session_ids_are_unique_and_cleanup_is_final() {
    let wires = Arc::new(Mutex::new(Vec::new()));
    let mut a = Session::connect_with(
        config(),
        scripted_connector(vec![session_script(1)], Arc::clone(&wires)),
    )
    .unwrap();
    let b = Session::connect_with(
        config(),
        scripted_connector(vec![session_script(2)], Arc::clone(&wires)),
    )
    .unwrap();
    assert_ne!(a.id(), b.id());

    a.cleanup();
    a.cleanup();
    assert!(!a.is_connected());
    let err = a.engine().unwrap_err();
    assert_eq!(usage_kind(&err), Some(UsageErrorKind::InvalidState));

    let err = a.reconnect().unwrap_err();
    assert_eq!(connection_kind(&err), Some(ConnectionErrorKind::Refused));
}
