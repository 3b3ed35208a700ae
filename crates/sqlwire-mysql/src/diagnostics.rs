//! Explanations for communication failures.
//!
//! A dropped socket carries no reason. [`diagnose_link_failure`] guesses one
//! from packet timing and the server's idle timeout, and classifies whether
//! the idle timeout is to blame.

use std::io;
use std::time::{Duration, Instant};

use sqlwire_core::error::{ConnectionError, ConnectionErrorKind, SQLSTATE_LINK_FAILURE};
use sqlwire_core::{DueToTimeout, Error, PropertyKey, PropertySet};

/// Server idle timeout assumed when the real one is unknown (8 hours).
pub const DEFAULT_WAIT_TIMEOUT_SECONDS: u64 = 28_800;

/// Timing and configuration at the moment a link failure was observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkFailureContext {
    /// Time since the last packet was written.
    pub since_last_sent: Duration,
    /// Time since the last packet was read, `None` if nothing was ever read.
    pub since_last_received: Option<Duration>,
    /// Server `wait_timeout` or `interactive_timeout` in seconds, if known.
    pub server_timeout: Option<u64>,
    pub interactive_client: bool,
    pub maintain_time_stats: bool,
    pub paranoid: bool,
    pub local_socket_address: Option<String>,
}

impl LinkFailureContext {
    /// Capture the context from connection properties and packet timestamps.
    pub fn capture(
        properties: &PropertySet,
        last_sent: Instant,
        last_received: Option<Instant>,
        server_timeout: Option<u64>,
        now: Instant,
    ) -> Self {
        Self {
            since_last_sent: now.saturating_duration_since(last_sent),
            since_last_received: last_received.map(|t| now.saturating_duration_since(t)),
            server_timeout,
            interactive_client: properties.get_bool(PropertyKey::InteractiveClient),
            maintain_time_stats: properties.get_bool(PropertyKey::MaintainTimeStats),
            paranoid: properties.get_bool(PropertyKey::Paranoid),
            local_socket_address: properties
                .get_str(PropertyKey::LocalSocketAddress)
                .map(str::to_string),
        }
    }

    fn timeout_variable(&self) -> &'static str {
        if self.interactive_client {
            "interactive_timeout"
        } else {
            "wait_timeout"
        }
    }

    fn timing(&self) -> String {
        let sent = self.since_last_sent.as_millis();
        match self.since_last_received {
            Some(received) => format!(
                "The last packet successfully received from the server was {} milliseconds ago. \
                 The last packet sent successfully to the server was {} milliseconds ago.",
                received.as_millis(),
                sent
            ),
            None => format!(
                "The last packet sent successfully to the server was {} milliseconds ago. \
                 The driver has not received any packets from the server.",
                sent
            ),
        }
    }
}

/// Outcome of [`diagnose_link_failure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFailureDiagnosis {
    pub due_to_timeout: DueToTimeout,
    pub message: String,
}

impl LinkFailureDiagnosis {
    /// Wrap the underlying I/O error into a communications error.
    pub fn into_error(self, cause: io::Error) -> Error {
        let kind = if self.due_to_timeout == DueToTimeout::Yes || is_timeout(&cause) {
            ConnectionErrorKind::Timeout
        } else {
            ConnectionErrorKind::Disconnected
        };
        Error::Connection(ConnectionError {
            kind,
            message: self.message,
            sqlstate: Some(SQLSTATE_LINK_FAILURE.to_string()),
            vendor_code: None,
            due_to_timeout: self.due_to_timeout,
            source: Some(Box::new(cause)),
        })
    }
}

pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

/// Classify a communications failure and describe it.
///
/// - server timeout known and exceeded since the last send: `Yes`
/// - server timeout unknown and more than 28800 s since the last send: `Maybe`
/// - otherwise `No`, with a bind-failure explanation or a generic message
pub fn diagnose_link_failure(ctx: &LinkFailureContext, cause: &io::Error) -> LinkFailureDiagnosis {
    let idle_secs = ctx.since_last_sent.as_secs();
    let known_timeout = ctx.server_timeout.filter(|&t| t > 0);

    let due_to_timeout = match known_timeout {
        Some(timeout) if idle_secs > timeout => DueToTimeout::Yes,
        None if idle_secs > DEFAULT_WAIT_TIMEOUT_SECONDS => DueToTimeout::Maybe,
        _ => DueToTimeout::No,
    };

    let variable = ctx.timeout_variable();
    let message = match due_to_timeout {
        DueToTimeout::Yes => format!(
            "{} This is longer than the server configured value of '{}'. \
             Consider validating connections before use or increasing the server \
             configured value of '{}'.",
            ctx.timing(),
            variable,
            variable
        ),
        DueToTimeout::Maybe => format!(
            "{} This is longer than the default server value of '{}' ({} seconds); \
             the server may have closed the idle connection. Consider validating \
             connections before use or increasing the server configured value of '{}'.",
            ctx.timing(),
            variable,
            DEFAULT_WAIT_TIMEOUT_SECONDS,
            variable
        ),
        DueToTimeout::No => no_timeout_message(ctx, cause),
    };

    LinkFailureDiagnosis {
        due_to_timeout,
        message,
    }
}

fn no_timeout_message(ctx: &LinkFailureContext, cause: &io::Error) -> String {
    match cause.kind() {
        io::ErrorKind::AddrNotAvailable if ctx.local_socket_address.is_some() => format!(
            "Unable to bind to local socket address '{}'. Check that the address \
             belongs to a local network interface.",
            ctx.local_socket_address.as_deref().unwrap_or_default()
        ),
        io::ErrorKind::AddrInUse | io::ErrorKind::AddrNotAvailable => {
            "Unable to bind a local port. The client may have too many open connections, \
             or the operating system has run out of ephemeral ports."
                .to_string()
        }
        _ if ctx.maintain_time_stats && !ctx.paranoid => {
            format!("Communications link failure\n\n{}", ctx.timing())
        }
        _ => "Communications link failure".to_string(),
    }
}
