//! Connection property store.
//!
//! Definitions are process-wide and immutable: one [`PropertyDefinition`] per
//! [`PropertyKey`], held in a lazily initialised static table. Each
//! connection owns a [`PropertySet`] with exactly one [`RuntimeProperty`] cell
//! per definition. Cells are created once and reset in place.

use std::fmt;
use std::sync::LazyLock;

use crate::error::{Error, Result, UsageErrorKind};

/// Every configuration key the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PropertyKey {
    CachePrepStmts,
    PrepStmtCacheSize,
    PrepStmtCacheSqlLimit,
    ConnectTimeout,
    SocketTimeout,
    WriteTimeout,
    DefaultTransactionTimeout,
    InteractiveClient,
    MaintainTimeStats,
    Paranoid,
    LocalSocketAddress,
    SslMode,
    MaxAllowedPacket,
    UseServerPrepStmts,
    AllowMultiQueries,
    SendFractionalSeconds,
    ConnectionTimeZone,
    ForceConnectionTimeZoneToSession,
    DefaultAuthenticationPlugin,
}

impl PropertyKey {
    pub const ALL: [PropertyKey; 19] = [
        PropertyKey::CachePrepStmts,
        PropertyKey::PrepStmtCacheSize,
        PropertyKey::PrepStmtCacheSqlLimit,
        PropertyKey::ConnectTimeout,
        PropertyKey::SocketTimeout,
        PropertyKey::WriteTimeout,
        PropertyKey::DefaultTransactionTimeout,
        PropertyKey::InteractiveClient,
        PropertyKey::MaintainTimeStats,
        PropertyKey::Paranoid,
        PropertyKey::LocalSocketAddress,
        PropertyKey::SslMode,
        PropertyKey::MaxAllowedPacket,
        PropertyKey::UseServerPrepStmts,
        PropertyKey::AllowMultiQueries,
        PropertyKey::SendFractionalSeconds,
        PropertyKey::ConnectionTimeZone,
        PropertyKey::ForceConnectionTimeZoneToSession,
        PropertyKey::DefaultAuthenticationPlugin,
    ];

    /// Position of this key in [`PropertyKey::ALL`] and in every property set.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The external property name, e.g. `cachePrepStmts`.
    pub fn name(self) -> &'static str {
        PropertyDefinition::for_key(self).name
    }

    /// Look a key up by its external name, ignoring ASCII case.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|key| key.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Value domain of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    Boolean,
    Integer { min: i64, max: i64 },
    String,
    /// One of a fixed set of tokens, matched case-insensitively.
    Enumeration(&'static [&'static str]),
}

/// Default of a property as stored in the static table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyDefault {
    Bool(bool),
    Int(i64),
    Str(&'static str),
    Unset,
}

/// The current value held by a runtime cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Str(String),
    Unset,
}

impl From<PropertyDefault> for PropertyValue {
    fn from(default: PropertyDefault) -> Self {
        match default {
            PropertyDefault::Bool(b) => PropertyValue::Bool(b),
            PropertyDefault::Int(i) => PropertyValue::Int(i),
            PropertyDefault::Str(s) => PropertyValue::Str(s.to_string()),
            PropertyDefault::Unset => PropertyValue::Unset,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{b}"),
            PropertyValue::Int(i) => write!(f, "{i}"),
            PropertyValue::Str(s) => f.write_str(s),
            PropertyValue::Unset => f.write_str("<unset>"),
        }
    }
}

/// Immutable description of one configuration property.
#[derive(Debug)]
pub struct PropertyDefinition {
    pub key: PropertyKey,
    pub name: &'static str,
    pub default: PropertyDefault,
    pub ty: PropertyType,
    /// May be changed on a live connection through [`PropertySet::set_runtime`].
    pub runtime_modifiable: bool,
    pub description: &'static str,
}

const BOOLEAN_TOKENS: &str = "'TRUE', 'FALSE', 'YES' or 'NO'";

pub const SSL_MODES: &[&str] = &[
    "DISABLED",
    "PREFERRED",
    "REQUIRED",
    "VERIFY_CA",
    "VERIFY_IDENTITY",
];

pub const AUTHENTICATION_PLUGINS: &[&str] = &[
    "mysql_native_password",
    "caching_sha2_password",
    "sha256_password",
    "mysql_clear_password",
];

const fn def(
    key: PropertyKey,
    name: &'static str,
    default: PropertyDefault,
    ty: PropertyType,
    runtime_modifiable: bool,
    description: &'static str,
) -> PropertyDefinition {
    PropertyDefinition {
        key,
        name,
        default,
        ty,
        runtime_modifiable,
        description,
    }
}

const MILLIS: PropertyType = PropertyType::Integer {
    min: 0,
    max: i32::MAX as i64,
};

static DEFINITIONS: LazyLock<Vec<PropertyDefinition>> = LazyLock::new(|| {
    use PropertyDefault as D;
    use PropertyKey as K;
    use PropertyType as T;

    let table = vec![
        def(
            K::CachePrepStmts,
            "cachePrepStmts",
            D::Bool(false),
            T::Boolean,
            false,
            "Cache prepared statement metadata per connection",
        ),
        def(
            K::PrepStmtCacheSize,
            "prepStmtCacheSize",
            D::Int(25),
            T::Integer { min: 0, max: 65535 },
            false,
            "Number of statements kept in the per-connection cache",
        ),
        def(
            K::PrepStmtCacheSqlLimit,
            "prepStmtCacheSqlLimit",
            D::Int(256),
            MILLIS,
            false,
            "Longest SQL text, in bytes, eligible for the statement cache",
        ),
        def(
            K::ConnectTimeout,
            "connectTimeout",
            D::Int(30_000),
            MILLIS,
            false,
            "Socket connect timeout in milliseconds, 0 waits forever",
        ),
        def(
            K::SocketTimeout,
            "socketTimeout",
            D::Int(0),
            MILLIS,
            true,
            "Socket read timeout in milliseconds, 0 waits forever",
        ),
        def(
            K::WriteTimeout,
            "writeTimeout",
            D::Int(0),
            MILLIS,
            false,
            "Socket write timeout in milliseconds, 0 waits forever",
        ),
        def(
            K::DefaultTransactionTimeout,
            "defaultTransactionTimeout",
            D::Int(0),
            T::Integer {
                min: 0,
                max: 1_073_741_824,
            },
            false,
            "Lock wait timeout in seconds applied to the session, 0 keeps the server default",
        ),
        def(
            K::InteractiveClient,
            "interactiveClient",
            D::Bool(false),
            T::Boolean,
            false,
            "Use interactive_timeout instead of wait_timeout",
        ),
        def(
            K::MaintainTimeStats,
            "maintainTimeStats",
            D::Bool(true),
            T::Boolean,
            false,
            "Track last packet sent/received times for diagnostics",
        ),
        def(
            K::Paranoid,
            "paranoid",
            D::Bool(false),
            T::Boolean,
            false,
            "Hide timing and server details in error messages",
        ),
        def(
            K::LocalSocketAddress,
            "localSocketAddress",
            D::Unset,
            T::String,
            false,
            "Local address to bind before connecting",
        ),
        def(
            K::SslMode,
            "sslMode",
            D::Str("DISABLED"),
            T::Enumeration(SSL_MODES),
            false,
            "TLS policy for the connection",
        ),
        def(
            K::MaxAllowedPacket,
            "maxAllowedPacket",
            D::Int(67_108_864),
            T::Integer {
                min: 1024,
                max: 1_073_741_824,
            },
            false,
            "Largest packet the client will send before the server reports its limit",
        ),
        def(
            K::UseServerPrepStmts,
            "useServerPrepStmts",
            D::Bool(false),
            T::Boolean,
            false,
            "Use server-side prepared statements for parameterised queries",
        ),
        def(
            K::AllowMultiQueries,
            "allowMultiQueries",
            D::Bool(false),
            T::Boolean,
            false,
            "Allow ';' separated statements in one query",
        ),
        def(
            K::SendFractionalSeconds,
            "sendFractionalSeconds",
            D::Bool(true),
            T::Boolean,
            false,
            "Send fractional seconds of temporal parameters",
        ),
        def(
            K::ConnectionTimeZone,
            "connectionTimeZone",
            D::Unset,
            T::String,
            false,
            "Time zone of the session, SERVER or LOCAL or an explicit zone",
        ),
        def(
            K::ForceConnectionTimeZoneToSession,
            "forceConnectionTimeZoneToSession",
            D::Bool(false),
            T::Boolean,
            false,
            "Issue SET time_zone with connectionTimeZone after connecting",
        ),
        def(
            K::DefaultAuthenticationPlugin,
            "defaultAuthenticationPlugin",
            D::Str("caching_sha2_password"),
            T::Enumeration(AUTHENTICATION_PLUGINS),
            false,
            "Plugin used for the first authentication response",
        ),
    ];

    debug_assert!(
        table
            .iter()
            .enumerate()
            .all(|(i, d)| d.key.index() == i)
    );
    table
});

impl PropertyDefinition {
    /// The static definition for `key`.
    pub fn for_key(key: PropertyKey) -> &'static PropertyDefinition {
        &DEFINITIONS[key.index()]
    }

    /// All definitions, indexed by [`PropertyKey::index`].
    pub fn all() -> &'static [PropertyDefinition] {
        &DEFINITIONS
    }

    pub fn default_value(&self) -> PropertyValue {
        self.default.into()
    }

    /// Parse and validate the textual form of a value for this property.
    pub fn parse(&self, text: &str) -> Result<PropertyValue> {
        let trimmed = text.trim();
        match self.ty {
            PropertyType::Boolean => parse_boolean(trimmed)
                .map(PropertyValue::Bool)
                .ok_or_else(|| {
                    Error::config(
                        Some(self.name),
                        format!(
                            "The connection property '{}' acceptable values are: {}. The value '{}' is not acceptable.",
                            self.name, BOOLEAN_TOKENS, text
                        ),
                    )
                }),
            PropertyType::Integer { .. } => {
                let value: i64 = trimmed.parse().map_err(|_| {
                    Error::config(
                        Some(self.name),
                        format!(
                            "The connection property '{}' only accepts integer values. The value '{}' can not be converted to an integer.",
                            self.name, text
                        ),
                    )
                })?;
                self.validate(PropertyValue::Int(value))
            }
            PropertyType::Enumeration(allowed) => allowed
                .iter()
                .find(|token| token.eq_ignore_ascii_case(trimmed))
                .map(|token| PropertyValue::Str((*token).to_string()))
                .ok_or_else(|| {
                    Error::config(
                        Some(self.name),
                        format!(
                            "The connection property '{}' acceptable values are: {}. The value '{}' is not acceptable.",
                            self.name,
                            allowed
                                .iter()
                                .map(|t| format!("'{t}'"))
                                .collect::<Vec<_>>()
                                .join(", "),
                            text
                        ),
                    )
                }),
            PropertyType::String => Ok(PropertyValue::Str(text.to_string())),
        }
    }

    /// Check that a typed value belongs to this property's domain.
    pub fn validate(&self, value: PropertyValue) -> Result<PropertyValue> {
        match (self.ty, value) {
            (_, PropertyValue::Unset) if matches!(self.default, PropertyDefault::Unset) => {
                Ok(PropertyValue::Unset)
            }
            (PropertyType::Boolean, v @ PropertyValue::Bool(_)) => Ok(v),
            (PropertyType::Integer { min, max }, PropertyValue::Int(v)) => {
                if (min..=max).contains(&v) {
                    Ok(PropertyValue::Int(v))
                } else {
                    Err(Error::config(
                        Some(self.name),
                        format!(
                            "The connection property '{}' only accepts integer values in the range of {} - {}, the value '{}' exceeds this range.",
                            self.name, min, max, v
                        ),
                    ))
                }
            }
            (PropertyType::String, v @ PropertyValue::Str(_)) => Ok(v),
            (PropertyType::Enumeration(_), PropertyValue::Str(s)) => self.parse(&s),
            (_, other) => Err(Error::config(
                Some(self.name),
                format!(
                    "The connection property '{}' does not accept the value '{}'.",
                    self.name, other
                ),
            )),
        }
    }
}

/// Parse TRUE/FALSE/YES/NO, ignoring ASCII case.
pub fn parse_boolean(text: &str) -> Option<bool> {
    if text.eq_ignore_ascii_case("true") || text.eq_ignore_ascii_case("yes") {
        Some(true)
    } else if text.eq_ignore_ascii_case("false") || text.eq_ignore_ascii_case("no") {
        Some(false)
    } else {
        None
    }
}

/// Per-connection value cell for one property.
#[derive(Debug, Clone)]
pub struct RuntimeProperty {
    definition: &'static PropertyDefinition,
    value: PropertyValue,
    explicitly_set: bool,
}

impl RuntimeProperty {
    fn new(definition: &'static PropertyDefinition) -> Self {
        Self {
            definition,
            value: definition.default_value(),
            explicitly_set: false,
        }
    }

    pub fn definition(&self) -> &'static PropertyDefinition {
        self.definition
    }

    pub fn value(&self) -> &PropertyValue {
        &self.value
    }

    /// Was the value assigned after creation or the last reset?
    pub fn is_explicitly_set(&self) -> bool {
        self.explicitly_set
    }

    pub fn set_from_str(&mut self, text: &str) -> Result<()> {
        let parsed = self.definition.parse(text)?;
        self.store(parsed);
        Ok(())
    }

    pub fn set_value(&mut self, value: PropertyValue) -> Result<()> {
        let validated = self.definition.validate(value)?;
        self.store(validated);
        Ok(())
    }

    /// Restore the default in place.
    pub fn reset(&mut self) {
        self.value = self.definition.default_value();
        self.explicitly_set = false;
    }

    fn store(&mut self, value: PropertyValue) {
        tracing::trace!(property = self.definition.name, value = %value, "property set");
        self.value = value;
        self.explicitly_set = true;
    }
}

/// The runtime configuration of one connection.
#[derive(Debug, Clone)]
pub struct PropertySet {
    cells: Vec<RuntimeProperty>,
}

impl Default for PropertySet {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertySet {
    /// One cell per definition, each holding its default.
    pub fn new() -> Self {
        Self {
            cells: PropertyDefinition::all()
                .iter()
                .map(RuntimeProperty::new)
                .collect(),
        }
    }

    /// Build a set from external name/value pairs.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut set = Self::new();
        for (name, value) in pairs {
            let key = PropertyKey::from_name(name).ok_or_else(|| {
                Error::config(Some(name), format!("Unknown connection property '{name}'"))
            })?;
            set.set_from_str(key, value)?;
        }
        Ok(set)
    }

    pub fn get(&self, key: PropertyKey) -> &RuntimeProperty {
        &self.cells[key.index()]
    }

    pub fn get_mut(&mut self, key: PropertyKey) -> &mut RuntimeProperty {
        &mut self.cells[key.index()]
    }

    /// Boolean value of `key`; false if the property is not boolean.
    pub fn get_bool(&self, key: PropertyKey) -> bool {
        matches!(self.get(key).value, PropertyValue::Bool(true))
    }

    /// Integer value of `key`; 0 if the property is not an integer.
    pub fn get_int(&self, key: PropertyKey) -> i64 {
        match self.get(key).value {
            PropertyValue::Int(v) => v,
            _ => 0,
        }
    }

    /// String value of `key`, `None` when unset.
    pub fn get_str(&self, key: PropertyKey) -> Option<&str> {
        match &self.get(key).value {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn set_from_str(&mut self, key: PropertyKey, text: &str) -> Result<()> {
        self.get_mut(key).set_from_str(text)
    }

    pub fn set(&mut self, key: PropertyKey, value: PropertyValue) -> Result<()> {
        self.get_mut(key).set_value(value)
    }

    pub fn set_bool(&mut self, key: PropertyKey, value: bool) -> Result<()> {
        self.set(key, PropertyValue::Bool(value))
    }

    pub fn set_int(&mut self, key: PropertyKey, value: i64) -> Result<()> {
        self.set(key, PropertyValue::Int(value))
    }

    /// Change a property on a live connection. Only definitions marked
    /// runtime-modifiable accept this.
    pub fn set_runtime(&mut self, key: PropertyKey, text: &str) -> Result<()> {
        let definition = PropertyDefinition::for_key(key);
        if !definition.runtime_modifiable {
            return Err(Error::usage(
                UsageErrorKind::InvalidState,
                format!(
                    "The connection property '{}' can not be changed after the connection is established.",
                    definition.name
                ),
            ));
        }
        self.set_from_str(key, text)
    }

    /// Reset every cell to its default without reallocating.
    pub fn reset(&mut self) {
        for cell in &mut self.cells {
            cell.reset();
        }
    }

    /// Properties whose value differs from creation or the last reset.
    pub fn explicitly_set(&self) -> impl Iterator<Item = &RuntimeProperty> {
        self.cells.iter().filter(|c| c.explicitly_set)
    }
}
