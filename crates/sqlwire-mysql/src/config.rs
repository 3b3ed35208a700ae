//! MySQL connection configuration.
//!
//! Endpoint and credential settings live on [`MySqlConfig`] directly; every
//! tunable engine behaviour is a property in the owned [`PropertySet`], and
//! the builder methods write through to it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlwire_core::{Error, PropertyKey, PropertySet, PropertyValue, Result};

use crate::protocol::capabilities;

/// SSL mode for MySQL connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SslMode {
    /// Do not use SSL
    #[default]
    Disabled,
    /// Use SSL if the server offers it, without certificate verification
    Preferred,
    /// Require SSL, without certificate verification
    Required,
    /// Require SSL and verify the certificate chain
    VerifyCa,
    /// Require SSL, verify the chain and the server host name
    VerifyIdentity,
}

impl SslMode {
    pub const fn should_try_ssl(self) -> bool {
        !matches!(self, SslMode::Disabled)
    }

    pub const fn is_required(self) -> bool {
        matches!(
            self,
            SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            SslMode::Disabled => "DISABLED",
            SslMode::Preferred => "PREFERRED",
            SslMode::Required => "REQUIRED",
            SslMode::VerifyCa => "VERIFY_CA",
            SslMode::VerifyIdentity => "VERIFY_IDENTITY",
        }
    }

    /// Parse the canonical property token.
    pub fn from_token(token: &str) -> Option<Self> {
        [
            SslMode::Disabled,
            SslMode::Preferred,
            SslMode::Required,
            SslMode::VerifyCa,
            SslMode::VerifyIdentity,
        ]
        .into_iter()
        .find(|mode| mode.as_str().eq_ignore_ascii_case(token))
    }
}

/// Certificate material for the TLS upgrade.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM file with trusted CA certificates; the webpki roots are used when unset
    pub ca_cert_path: Option<PathBuf>,
    /// PEM client certificate for mutual TLS
    pub client_cert_path: Option<PathBuf>,
    /// PEM private key matching `client_cert_path`
    pub client_key_path: Option<PathBuf>,
    /// Overrides the host name used for SNI and identity verification
    pub server_name: Option<String>,
    /// Accept any server certificate, even in the verifying modes
    pub danger_skip_verify: bool,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn client_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_cert_path = Some(path.into());
        self
    }

    pub fn client_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_key_path = Some(path.into());
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.danger_skip_verify = skip;
        self
    }
}

/// MySQL connection configuration.
#[derive(Debug, Clone)]
pub struct MySqlConfig {
    /// Hostname or IP address
    pub host: String,
    /// Port number (default: 3306)
    pub port: u16,
    /// Username for authentication
    pub user: String,
    /// Password for authentication
    pub password: Option<String>,
    /// Database selected after authentication
    pub database: Option<String>,
    /// Collation id sent in the handshake (default: utf8mb4)
    pub charset: u8,
    /// TLS certificate settings
    pub tls: TlsConfig,
    /// Connection attributes sent with the handshake response
    pub attributes: BTreeMap<String, String>,
    /// Engine properties
    pub properties: PropertySet,
}

impl Default for MySqlConfig {
    fn default() -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert("_client_name".to_string(), "sqlwire".to_string());
        attributes.insert(
            "_client_version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: String::new(),
            password: None,
            database: None,
            charset: crate::protocol::charset::DEFAULT_CHARSET,
            tls: TlsConfig::default(),
            attributes,
            properties: PropertySet::new(),
        }
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).map_or(i64::from(i32::MAX), |ms| {
        ms.min(i64::from(i32::MAX))
    })
}

fn optional_duration(ms: i64) -> Option<Duration> {
    u64::try_from(ms)
        .ok()
        .filter(|&ms| ms > 0)
        .map(Duration::from_millis)
}

impl MySqlConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn charset(mut self, charset: u8) -> Self {
        self.charset = charset;
        self
    }

    pub fn tls_config(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Set any property from its external name and textual value.
    pub fn property(mut self, name: &str, value: &str) -> Result<Self> {
        let key = PropertyKey::from_name(name).ok_or_else(|| {
            Error::config(Some(name), format!("Unknown connection property '{name}'"))
        })?;
        self.properties.set_from_str(key, value)?;
        Ok(self)
    }

    fn put(mut self, key: PropertyKey, value: PropertyValue) -> Self {
        if let Err(e) = self.properties.set(key, value) {
            tracing::warn!(property = key.name(), error = %e, "ignoring invalid property value");
        }
        self
    }

    pub fn connect_timeout(self, timeout: Duration) -> Self {
        self.put(PropertyKey::ConnectTimeout, PropertyValue::Int(millis(timeout)))
    }

    pub fn socket_timeout(self, timeout: Duration) -> Self {
        self.put(PropertyKey::SocketTimeout, PropertyValue::Int(millis(timeout)))
    }

    pub fn write_timeout(self, timeout: Duration) -> Self {
        self.put(PropertyKey::WriteTimeout, PropertyValue::Int(millis(timeout)))
    }

    pub fn ssl_mode(self, mode: SslMode) -> Self {
        self.put(PropertyKey::SslMode, PropertyValue::Str(mode.as_str().to_string()))
    }

    pub fn cache_prep_stmts(self, enabled: bool) -> Self {
        self.put(PropertyKey::CachePrepStmts, PropertyValue::Bool(enabled))
    }

    pub fn prep_stmt_cache_size(self, size: u16) -> Self {
        self.put(PropertyKey::PrepStmtCacheSize, PropertyValue::Int(i64::from(size)))
    }

    pub fn prep_stmt_cache_sql_limit(self, limit: u32) -> Self {
        let limit = i64::from(limit).min(i64::from(i32::MAX));
        self.put(PropertyKey::PrepStmtCacheSqlLimit, PropertyValue::Int(limit))
    }

    pub fn interactive_client(self, interactive: bool) -> Self {
        self.put(PropertyKey::InteractiveClient, PropertyValue::Bool(interactive))
    }

    pub fn max_allowed_packet(self, size: u32) -> Self {
        self.put(PropertyKey::MaxAllowedPacket, PropertyValue::Int(i64::from(size)))
    }

    pub fn allow_multi_queries(self, enabled: bool) -> Self {
        self.put(PropertyKey::AllowMultiQueries, PropertyValue::Bool(enabled))
    }

    pub fn connection_time_zone(self, zone: impl Into<String>) -> Self {
        self.put(PropertyKey::ConnectionTimeZone, PropertyValue::Str(zone.into()))
    }

    /// Bind the client side of the TCP connection to this host or IP.
    pub fn local_socket_address(self, address: impl Into<String>) -> Self {
        self.put(PropertyKey::LocalSocketAddress, PropertyValue::Str(address.into()))
    }

    pub fn local_socket_address_value(&self) -> Option<&str> {
        self.properties.get_str(PropertyKey::LocalSocketAddress)
    }

    /// Get the socket address string for connection.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ssl_mode_value(&self) -> SslMode {
        self.properties
            .get_str(PropertyKey::SslMode)
            .and_then(SslMode::from_token)
            .unwrap_or_default()
    }

    pub fn connect_timeout_value(&self) -> Option<Duration> {
        optional_duration(self.properties.get_int(PropertyKey::ConnectTimeout))
    }

    pub fn socket_timeout_value(&self) -> Option<Duration> {
        optional_duration(self.properties.get_int(PropertyKey::SocketTimeout))
    }

    pub fn write_timeout_value(&self) -> Option<Duration> {
        optional_duration(self.properties.get_int(PropertyKey::WriteTimeout))
    }

    pub fn max_allowed_packet_value(&self) -> usize {
        usize::try_from(self.properties.get_int(PropertyKey::MaxAllowedPacket)).unwrap_or(0)
    }

    /// Build capability flags based on configuration.
    pub fn capability_flags(&self) -> u32 {
        let mut flags = capabilities::BASE_CLIENT_FLAGS;

        if self.database.is_some() {
            flags |= capabilities::CLIENT_CONNECT_WITH_DB;
        }
        if self.ssl_mode_value().should_try_ssl() {
            flags |= capabilities::CLIENT_SSL;
        }
        if self.properties.get_bool(PropertyKey::InteractiveClient) {
            flags |= capabilities::CLIENT_INTERACTIVE;
        }
        if self.properties.get_bool(PropertyKey::AllowMultiQueries) {
            flags |= capabilities::CLIENT_MULTI_STATEMENTS;
        }
        if self.attributes.is_empty() {
            flags &= !capabilities::CLIENT_CONNECT_ATTRS;
        }

        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::capabilities::*;

    #[test]
    fn test_config_builder_writes_through() {
        let config = MySqlConfig::new()
            .host("db.example.com")
            .port(3307)
            .user("myuser")
            .password("secret")
            .database("testdb")
            .connect_timeout(Duration::from_secs(10))
            .socket_timeout(Duration::from_millis(1500))
            .ssl_mode(SslMode::Required)
            .cache_prep_stmts(true)
            .attribute("program_name", "myapp");

        assert_eq!(config.socket_addr(), "db.example.com:3307");
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.connect_timeout_value(), Some(Duration::from_secs(10)));
        assert_eq!(config.socket_timeout_value(), Some(Duration::from_millis(1500)));
        assert_eq!(config.ssl_mode_value(), SslMode::Required);
        assert!(config.properties.get_bool(PropertyKey::CachePrepStmts));
        assert_eq!(
            config.attributes.get("program_name").map(String::as_str),
            Some("myapp")
        );
    }

    #[test]
    fn test_property_by_name() {
        let config = MySqlConfig::new()
            .property("sslMode", "preferred")
            .unwrap()
            .property("socketTimeout", "0")
            .unwrap();
        assert_eq!(config.ssl_mode_value(), SslMode::Preferred);
        assert_eq!(config.socket_timeout_value(), None);

        assert!(MySqlConfig::new().property("nope", "1").is_err());
        assert!(MySqlConfig::new().property("paranoid", "maybe").is_err());
    }

    #[test]
    fn test_invalid_builder_value_is_ignored() {
        let config = MySqlConfig::new().max_allowed_packet(10);
        assert_eq!(config.max_allowed_packet_value(), 67_108_864);
    }

    #[test]
    fn test_ssl_mode_properties() {
        assert!(!SslMode::Disabled.should_try_ssl());
        assert!(SslMode::Preferred.should_try_ssl());
        assert!(!SslMode::Preferred.is_required());
        assert!(SslMode::VerifyIdentity.is_required());
        assert_eq!(SslMode::from_token("verify_ca"), Some(SslMode::VerifyCa));
        assert_eq!(SslMode::from_token("bogus"), None);
    }

    #[test]
    fn test_tls_settings_from_json() {
        let tls: TlsConfig =
            serde_json::from_str(r#"{"ca_cert_path": "/etc/ssl/ca.pem"}"#).unwrap();
        assert_eq!(tls.ca_cert_path, Some(PathBuf::from("/etc/ssl/ca.pem")));
        assert!(!tls.danger_skip_verify);

        let mode: SslMode = serde_json::from_str(r#""VERIFY_CA""#).unwrap();
        assert_eq!(mode, SslMode::VerifyCa);
        assert_eq!(serde_json::to_string(&mode).unwrap(), format!("\"{}\"", mode.as_str()));
    }

    #[test]
    fn test_capability_flags() {
        let config = MySqlConfig::new()
            .database("test")
            .interactive_client(true)
            .allow_multi_queries(true);
        let flags = config.capability_flags();

        assert!(flags & CLIENT_CONNECT_WITH_DB != 0);
        assert!(flags & CLIENT_INTERACTIVE != 0);
        assert!(flags & CLIENT_MULTI_STATEMENTS != 0);
        assert!(flags & CLIENT_PROTOCOL_41 != 0);
        assert!(flags & CLIENT_SSL == 0);

        let plain = MySqlConfig::new();
        assert!(plain.capability_flags() & CLIENT_CONNECT_WITH_DB == 0);
        assert!(plain.capability_flags() & CLIENT_MULTI_STATEMENTS == 0);
    }

    #[test]
    fn test_default_config() {
        let config = MySqlConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 3306);
        assert_eq!(config.ssl_mode_value(), SslMode::Disabled);
        assert_eq!(config.connect_timeout_value(), Some(Duration::from_secs(30)));
        assert_eq!(config.socket_timeout_value(), None);
        assert!(config.attributes.contains_key("_client_name"));
    }
}
