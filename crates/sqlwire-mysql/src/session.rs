//! A logical client session owning one protocol engine at a time.

use std::sync::atomic::{AtomicU64, Ordering};

use sqlwire_core::error::UsageErrorKind;
use sqlwire_core::{Error, Result};

use crate::config::MySqlConfig;
use crate::connection::MySqlConnection;
use crate::transport::{NetStream, SocketConnection};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Opens a transport for a configuration.
pub type Connector<S> = Box<dyn FnMut(&MySqlConfig) -> Result<S> + Send>;

/// Configuration plus the active engine.
///
/// The session id is process-wide unique and stays the same across
/// [`reconnect`](Session::reconnect); the engine carries the server's
/// thread id.
pub struct Session<S: SocketConnection = NetStream> {
    id: u64,
    config: MySqlConfig,
    connector: Connector<S>,
    engine: Option<MySqlConnection<S>>,
}

impl<S: SocketConnection> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl Session<NetStream> {
    /// Connect over TCP.
    pub fn connect(config: MySqlConfig) -> Result<Self> {
        Self::connect_with(config, Box::new(NetStream::connect))
    }
}

impl<S: SocketConnection> Session<S> {
    /// Connect using `connector` to open transports.
    pub fn connect_with(config: MySqlConfig, connector: Connector<S>) -> Result<Self> {
        let mut session = Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            config,
            connector,
            engine: None,
        };
        session.reconnect()?;
        Ok(session)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.engine.as_ref().is_some_and(MySqlConnection::is_ready)
    }

    /// The active engine.
    pub fn engine(&mut self) -> Result<&mut MySqlConnection<S>> {
        self.engine.as_mut().ok_or_else(|| {
            Error::usage(
                UsageErrorKind::InvalidState,
                "Session has no active connection",
            )
        })
    }

    /// Replace the engine with a freshly connected one.
    ///
    /// The old engine is closed first. The new one is authenticated, its
    /// server session variables read and its time zone resolved before it
    /// becomes active.
    #[tracing::instrument(level = "debug", skip(self), fields(session_id = self.id))]
    pub fn reconnect(&mut self) -> Result<()> {
        self.cleanup();

        let stream = (self.connector)(&self.config)?;
        let mut engine = MySqlConnection::new(stream, self.config.clone());
        let password = self.config.password.clone().unwrap_or_default();
        engine.connect(&self.config.user, &password, self.config.database.as_deref())?;
        engine.init_server_session()?;
        engine.configure_time_zone()?;

        tracing::debug!(connection_id = engine.connection_id(), "session connected");
        self.engine = Some(engine);
        Ok(())
    }

    /// Close the engine. Safe to call repeatedly.
    pub fn cleanup(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            if let Err(e) = engine.close() {
                tracing::warn!(error = %e, "error while closing connection");
            }
        }
    }
}

impl<S: SocketConnection> Drop for Session<S> {
    fn drop(&mut self) {
        self.cleanup();
    }
}
