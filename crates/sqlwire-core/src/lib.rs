//! Core types shared by the sqlwire engine crates.
//!
//! - [`Error`] and the closed error taxonomy
//! - [`Value`] for dynamically-typed parameters and row values
//! - [`PropertySet`] holding per-connection configuration

pub mod error;
pub mod property;
pub mod value;

pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, DueToTimeout, Error, ErrorKind,
    ProtocolError, QueryError, QueryErrorKind, Result, TypeError, UsageError, UsageErrorKind,
};
pub use property::{
    PropertyDefinition, PropertyKey, PropertySet, PropertyType, PropertyValue, RuntimeProperty,
};
pub use value::{Value, ValueKind};
