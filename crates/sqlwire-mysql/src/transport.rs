//! Byte transport under the protocol engine.
//!
//! The engine only needs a blocking duplex stream with timeouts and an
//! in-place TLS upgrade. [`NetStream`] provides that over TCP; tests plug in
//! scripted in-memory transports.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use sqlwire_core::error::ConnectionErrorKind;
use sqlwire_core::{Error, Result};

use crate::config::{MySqlConfig, SslMode, TlsConfig};
use crate::diagnostics::{LinkFailureContext, diagnose_link_failure};
use crate::tls::TlsStream;

/// A blocking byte stream the engine can drive.
pub trait SocketConnection: Read + Write {
    /// Bound every subsequent read; `None` blocks indefinitely.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Run the TLS handshake and continue over the encrypted channel.
    fn upgrade_to_secure(
        &mut self,
        tls_config: &TlsConfig,
        server_name: &str,
        ssl_mode: SslMode,
    ) -> Result<()>;

    fn is_secure(&self) -> bool;

    /// Close both directions. Blocked reads on other handles fail.
    fn shutdown(&mut self) -> io::Result<()>;
}

/// TCP transport, optionally upgraded to TLS.
#[derive(Debug)]
pub enum NetStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// Left behind by a failed upgrade; every operation fails.
    Broken,
}

impl NetStream {
    /// Open a TCP connection to the configured host, honouring
    /// `connectTimeout` and `localSocketAddress`.
    #[tracing::instrument(level = "debug", skip(config), fields(addr = %config.socket_addr()))]
    pub fn connect(config: &MySqlConfig) -> Result<Self> {
        let addrs: Vec<SocketAddr> = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| {
                Error::connection(
                    ConnectionErrorKind::Connect,
                    format!("Cannot resolve {}: {}", config.socket_addr(), e),
                )
            })?
            .collect();

        let started = Instant::now();
        let timeout = config.connect_timeout_value();
        let local = config.local_socket_address_value();
        let mut last_error = None;
        for addr in addrs {
            match open_socket(addr, local, timeout) {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::warn!(error = %e, "failed to set TCP_NODELAY");
                    }
                    tracing::debug!(%addr, "TCP connection established");
                    return Ok(NetStream::Plain(stream));
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        let Some(e) = last_error else {
            return Err(Error::connection(
                ConnectionErrorKind::Connect,
                format!("No addresses found for {}", config.socket_addr()),
            ));
        };
        Err(connect_failure(config, started, e))
    }

    fn tcp(&self) -> io::Result<&TcpStream> {
        match self {
            NetStream::Plain(stream) => Ok(stream),
            NetStream::Tls(stream) => Ok(stream.get_ref()),
            NetStream::Broken => Err(broken()),
        }
    }
}

/// Create a socket for `addr`, bind it to `local` if given, and connect.
fn open_socket(
    addr: SocketAddr,
    local: Option<&str>,
    timeout: Option<Duration>,
) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if let Some(local) = local {
        let bind_addr = resolve_local(local, addr)?;
        socket.bind(&SockAddr::from(bind_addr))?;
        tracing::trace!(local = %bind_addr, "bound local socket address");
    }
    let remote = SockAddr::from(addr);
    match timeout {
        Some(timeout) => socket.connect_timeout(&remote, timeout)?,
        None => socket.connect(&remote)?,
    }
    Ok(socket.into())
}

/// Resolve `local` to an ephemeral-port address of the same family as `remote`.
fn resolve_local(local: &str, remote: SocketAddr) -> io::Result<SocketAddr> {
    let family = if remote.is_ipv4() { "IPv4" } else { "IPv6" };
    (local, 0)
        .to_socket_addrs()?
        .find(|candidate| candidate.is_ipv4() == remote.is_ipv4())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {} address for '{}'", family, local),
            )
        })
}

/// Describe a failed connect attempt. Nothing has been received yet, so the
/// diagnosis can only point at local binding problems or report timing.
fn connect_failure(config: &MySqlConfig, started: Instant, cause: io::Error) -> Error {
    let ctx = LinkFailureContext::capture(&config.properties, started, None, None, Instant::now());
    let diagnosis = diagnose_link_failure(&ctx, &cause);
    let kind = match cause.kind() {
        io::ErrorKind::ConnectionRefused => ConnectionErrorKind::Refused,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ConnectionErrorKind::Timeout,
        _ => ConnectionErrorKind::Connect,
    };
    let message = format!(
        "Failed to connect to {}: {} ({})",
        config.socket_addr(),
        diagnosis.message,
        cause
    );
    let mut err = diagnosis.into_error(cause);
    if let Error::Connection(conn) = &mut err {
        conn.kind = kind;
        conn.message = message;
    }
    err
}

fn broken() -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        "transport unusable after failed TLS upgrade",
    )
}

impl Read for NetStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            NetStream::Plain(stream) => stream.read(buf),
            NetStream::Tls(stream) => stream.read(buf),
            NetStream::Broken => Err(broken()),
        }
    }
}

impl Write for NetStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            NetStream::Plain(stream) => stream.write(buf),
            NetStream::Tls(stream) => stream.write(buf),
            NetStream::Broken => Err(broken()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            NetStream::Plain(stream) => stream.flush(),
            NetStream::Tls(stream) => stream.flush(),
            NetStream::Broken => Err(broken()),
        }
    }
}

impl SocketConnection for NetStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.tcp()?.set_read_timeout(timeout)
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.tcp()?.set_write_timeout(timeout)
    }

    fn upgrade_to_secure(
        &mut self,
        tls_config: &TlsConfig,
        server_name: &str,
        ssl_mode: SslMode,
    ) -> Result<()> {
        match std::mem::replace(self, NetStream::Broken) {
            NetStream::Plain(stream) => {
                let tls = TlsStream::new(stream, tls_config, server_name, ssl_mode)?;
                *self = NetStream::Tls(Box::new(tls));
                Ok(())
            }
            other => {
                *self = other;
                Err(crate::tls::tls_error("Transport is already secure or unusable"))
            }
        }
    }

    fn is_secure(&self) -> bool {
        matches!(self, NetStream::Tls(_))
    }

    fn shutdown(&mut self) -> io::Result<()> {
        #[cfg(feature = "tls")]
        if let NetStream::Tls(stream) = self {
            if let Err(e) = stream.send_close_notify() {
                tracing::debug!(error = %e, "TLS close_notify failed");
            }
        }
        self.tcp()?.shutdown(Shutdown::Both)
    }
}
