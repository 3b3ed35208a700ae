//! Error types for sqlwire operations.
//!
//! The taxonomy is closed: every failure the engine can raise is one of the
//! [`Error`] variants, and each variant is built through a plain constructor
//! function (see [`Error::new`] and the per-variant helpers) rather than by
//! looking a type up at runtime.

use std::fmt;

/// The primary error type for all sqlwire operations.
#[derive(Debug)]
pub enum Error {
    /// Communications failures: I/O errors, timeouts, authentication and TLS
    /// negotiation. The connection must be discarded.
    Connection(ConnectionError),
    /// A well-formed ERR response from the server. The connection stays usable.
    Query(QueryError),
    /// A malformed or unexpected frame. The connection must be discarded.
    Protocol(ProtocolError),
    /// Type conversion errors
    Type(TypeError),
    /// Invalid configuration value
    Config(ConfigError),
    /// API misuse: unset parameters, unknown columns, wrong connection state
    Usage(UsageError),
    /// Raw I/O errors that did not pass through the link-failure diagnostics
    Io(std::io::Error),
}

/// Discriminant of [`Error`], used to construct errors by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Query,
    Protocol,
    Type,
    Config,
    Usage,
    Io,
}

/// Whether a communications failure was caused by an idle timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DueToTimeout {
    /// Elapsed time exceeded the timeout the server reported.
    Yes,
    /// The server timeout is unknown but elapsed time exceeded the fallback.
    Maybe,
    /// Neither condition holds.
    #[default]
    No,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    /// SQLSTATE reported with the failure (`08S01` for link failures)
    pub sqlstate: Option<String>,
    /// Vendor error code, when the failure came from a server ERR packet
    pub vendor_code: Option<u16>,
    /// Timeout classification produced by the link-failure diagnostics
    pub due_to_timeout: DueToTimeout,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Authentication failed
    Authentication,
    /// Connection lost during operation
    Disconnected,
    /// Read or write did not complete within the configured timeout
    Timeout,
    /// SSL/TLS negotiation failed
    Ssl,
    /// Connection refused
    Refused,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    /// Server error number (e.g. 1062 for a duplicate key)
    pub vendor_code: u16,
    pub sqlstate: Option<String>,
    pub message: String,
    pub sql: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// Table, column or database not found
    NotFound,
    /// Permission denied
    Permission,
    /// Data too large for column
    DataTruncation,
    /// Deadlock detected
    Deadlock,
    /// Lock wait timeout exceeded
    LockWaitTimeout,
    /// Statement execution time exceeded
    Timeout,
    /// Query was interrupted
    Cancelled,
    /// Other database error
    Database,
}

impl QueryErrorKind {
    /// Classify a server error number.
    pub fn from_vendor_code(code: u16) -> Self {
        match code {
            1048 | 1062 | 1216 | 1217 | 1451 | 1452 | 1557 | 1586 | 3819 => Self::Constraint,
            1064 | 1149 => Self::Syntax,
            1049 | 1051 | 1054 | 1146 => Self::NotFound,
            1044 | 1045 | 1142 | 1143 | 1227 => Self::Permission,
            1264 | 1265 | 1406 => Self::DataTruncation,
            1213 => Self::Deadlock,
            1205 => Self::LockWaitTimeout,
            3024 => Self::Timeout,
            1317 => Self::Cancelled,
            _ => Self::Database,
        }
    }
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct ConfigError {
    /// Property name the error refers to, if any
    pub property: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct UsageError {
    pub kind: UsageErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageErrorKind {
    /// A parameter was read before a value was bound to it
    ParameterNotSet,
    /// No encoder is registered for the runtime kind of a bound value
    NoEncoder,
    /// A column name did not resolve to an index
    ColumnNotFound,
    /// The operation is not valid in the current connection state
    InvalidState,
    /// An outgoing packet exceeds the server's max_allowed_packet
    PacketTooLarge,
    /// Invalid argument supplied by the caller
    InvalidArgument,
}

impl UsageErrorKind {
    pub const fn sqlstate(self) -> &'static str {
        match self {
            UsageErrorKind::ParameterNotSet => "07001",
            UsageErrorKind::ColumnNotFound => "S0022",
            UsageErrorKind::InvalidState => "08003",
            UsageErrorKind::PacketTooLarge => "S1000",
            UsageErrorKind::NoEncoder | UsageErrorKind::InvalidArgument => "S1009",
        }
    }
}

/// SQLSTATE for communication link failures.
pub const SQLSTATE_LINK_FAILURE: &str = "08S01";
/// SQLSTATE for failed connection attempts.
pub const SQLSTATE_UNABLE_TO_CONNECT: &str = "08001";
/// SQLSTATE for rejected credentials.
pub const SQLSTATE_INVALID_AUTHORIZATION: &str = "28000";
/// SQLSTATE for invalid argument / configuration values.
pub const SQLSTATE_ILLEGAL_ARGUMENT: &str = "S1009";

impl Error {
    /// Construct an error of the given kind with default classification.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Connection => Self::connection(ConnectionErrorKind::Disconnected, message),
            ErrorKind::Query => Error::Query(QueryError {
                kind: QueryErrorKind::Database,
                vendor_code: 0,
                sqlstate: None,
                message,
                sql: None,
                source: None,
            }),
            ErrorKind::Protocol => Self::protocol(message),
            ErrorKind::Type => Error::Type(TypeError {
                expected: "value",
                actual: message,
                column: None,
            }),
            ErrorKind::Config => Self::config(None, message),
            ErrorKind::Usage => Self::usage(UsageErrorKind::InvalidArgument, message),
            ErrorKind::Io => Error::Io(std::io::Error::other(message)),
        }
    }

    /// A communications error with the SQLSTATE implied by `kind`.
    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        let sqlstate = match kind {
            ConnectionErrorKind::Authentication => SQLSTATE_INVALID_AUTHORIZATION,
            ConnectionErrorKind::Connect | ConnectionErrorKind::Refused => {
                SQLSTATE_UNABLE_TO_CONNECT
            }
            _ => SQLSTATE_LINK_FAILURE,
        };
        Error::Connection(ConnectionError {
            kind,
            message: message.into(),
            sqlstate: Some(sqlstate.to_string()),
            vendor_code: None,
            due_to_timeout: DueToTimeout::No,
            source: None,
        })
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError {
            message: message.into(),
            raw_data: None,
            source: None,
        })
    }

    pub fn config(property: Option<&str>, message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            property: property.map(str::to_string),
            message: message.into(),
            source: None,
        })
    }

    pub fn usage(kind: UsageErrorKind, message: impl Into<String>) -> Self {
        Error::Usage(UsageError {
            kind,
            message: message.into(),
        })
    }

    /// Build a server error from the fields of an ERR packet.
    pub fn server(vendor_code: u16, sqlstate: Option<String>, message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind: QueryErrorKind::from_vendor_code(vendor_code),
            vendor_code,
            sqlstate,
            message: message.into(),
            sql: None,
            source: None,
        })
    }

    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection(_) => ErrorKind::Connection,
            Error::Query(_) => ErrorKind::Query,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Type(_) => ErrorKind::Type,
            Error::Config(_) => ErrorKind::Config,
            Error::Usage(_) => ErrorKind::Usage,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Can the same operation succeed if retried, possibly on a new connection?
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Connection(c) => {
                matches!(
                    c.kind,
                    ConnectionErrorKind::Disconnected
                        | ConnectionErrorKind::Timeout
                        | ConnectionErrorKind::Refused
                ) || c.due_to_timeout != DueToTimeout::No
            }
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::LockWaitTimeout | QueryErrorKind::Timeout
            ),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    /// Does this error leave the connection unusable?
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Protocol(_) | Error::Io(_)
        )
    }

    /// SQLSTATE if available (e.g. "23000" for an integrity violation).
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            Error::Connection(c) => c.sqlstate.as_deref(),
            Error::Protocol(_) => Some(SQLSTATE_LINK_FAILURE),
            Error::Config(_) => Some(SQLSTATE_ILLEGAL_ARGUMENT),
            Error::Usage(u) => Some(u.kind.sqlstate()),
            Error::Type(_) | Error::Io(_) => None,
        }
    }

    /// Vendor error code, when the server supplied one.
    pub fn vendor_code(&self) -> Option<u16> {
        match self {
            Error::Query(q) => Some(q.vendor_code),
            Error::Connection(c) => c.vendor_code,
            _ => None,
        }
    }

    /// The SQL that caused this error, if it was recorded.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    /// Timeout classification of a communications failure.
    pub fn due_to_timeout(&self) -> DueToTimeout {
        match self {
            Error::Connection(c) => c.due_to_timeout,
            _ => DueToTimeout::No,
        }
    }

    /// Prefix the message with `context`, keeping variant, SQLSTATE, vendor
    /// code and transience unchanged.
    #[must_use]
    pub fn context(mut self, context: &str) -> Self {
        let prefix = |message: &mut String| *message = format!("{context}: {message}");
        match &mut self {
            Error::Connection(e) => prefix(&mut e.message),
            Error::Query(e) => prefix(&mut e.message),
            Error::Protocol(e) => prefix(&mut e.message),
            Error::Type(e) => prefix(&mut e.actual),
            Error::Config(e) => prefix(&mut e.message),
            Error::Usage(e) => prefix(&mut e.message),
            Error::Io(e) => {
                let kind = e.kind();
                return Error::Io(std::io::Error::new(kind, format!("{context}: {e}")));
            }
        }
        self
    }

    /// Attach the statement text to a server error.
    #[must_use]
    pub fn with_sql(mut self, sql: &str) -> Self {
        if let Error::Query(q) = &mut self {
            q.sql = Some(sql.to_string());
        }
        self
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_duplicate_key(&self) -> bool {
        self.vendor_code == 1062
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(self.vendor_code, 1216 | 1217 | 1451 | 1452)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => write!(f, "Query error: {e}"),
            Error::Type(e) => write!(f, "Type error: {e}"),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Usage(e) => write!(f, "{}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sqlstate {
            Some(sqlstate) => write!(
                f,
                "{} (error {}, SQLSTATE {})",
                self.message, self.vendor_code, sqlstate
            ),
            None => write!(f, "{} (error {})", self.message, self.vendor_code),
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<UsageError> for Error {
    fn from(err: UsageError) -> Self {
        Error::Usage(err)
    }
}

/// Result type alias for sqlwire operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_classification() {
        let err = Error::server(1062, Some("23000".to_string()), "Duplicate entry");
        assert_eq!(err.kind(), ErrorKind::Query);
        assert_eq!(err.sqlstate(), Some("23000"));
        assert_eq!(err.vendor_code(), Some(1062));
        assert!(!err.is_transient());
        assert!(!err.is_connection_error());
        match &err {
            Error::Query(q) => {
                assert_eq!(q.kind, QueryErrorKind::Constraint);
                assert!(q.is_duplicate_key());
                assert!(!q.is_foreign_key_violation());
            }
            other => panic!("expected query error, got {other:?}"),
        }

        let deadlock = Error::server(1213, Some("40001".to_string()), "Deadlock found");
        assert!(deadlock.is_transient());
    }

    #[test]
    fn factory_by_kind() {
        for kind in [
            ErrorKind::Connection,
            ErrorKind::Query,
            ErrorKind::Protocol,
            ErrorKind::Type,
            ErrorKind::Config,
            ErrorKind::Usage,
            ErrorKind::Io,
        ] {
            assert_eq!(Error::new(kind, "boom").kind(), kind);
        }
    }

    #[test]
    fn connection_error_flags() {
        let err = Error::connection(ConnectionErrorKind::Disconnected, "lost connection");
        assert!(err.is_connection_error());
        assert!(err.is_transient());
        assert_eq!(err.sqlstate(), Some(SQLSTATE_LINK_FAILURE));

        let auth = Error::connection(ConnectionErrorKind::Authentication, "denied");
        assert!(!auth.is_transient());
        assert_eq!(auth.sqlstate(), Some(SQLSTATE_INVALID_AUTHORIZATION));
    }

    #[test]
    fn context_preserves_classification() {
        let mut inner = ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: "Communications link failure".to_string(),
            sqlstate: Some("08S01".to_string()),
            vendor_code: Some(2013),
            due_to_timeout: DueToTimeout::Maybe,
            source: None,
        };
        inner.message.push('!');
        let err = Error::Connection(inner).context("changing database");

        assert_eq!(err.sqlstate(), Some("08S01"));
        assert_eq!(err.vendor_code(), Some(2013));
        assert_eq!(err.due_to_timeout(), DueToTimeout::Maybe);
        assert!(err.is_transient());
        assert!(err.to_string().contains("changing database: Communications link failure!"));
    }

    #[test]
    fn usage_sqlstates() {
        let err = Error::usage(UsageErrorKind::ColumnNotFound, "Column 'x' not found.");
        assert_eq!(err.sqlstate(), Some("S0022"));
        let err = Error::usage(UsageErrorKind::ParameterNotSet, "No value specified");
        assert_eq!(err.sqlstate(), Some("07001"));
    }

    #[test]
    fn with_sql_only_touches_query_errors() {
        let err = Error::server(1064, Some("42000".to_string()), "syntax").with_sql("SELEC 1");
        assert_eq!(err.sql(), Some("SELEC 1"));
        let err = Error::protocol("bad frame").with_sql("SELECT 1");
        assert_eq!(err.sql(), None);
    }
}
