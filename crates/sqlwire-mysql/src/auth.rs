//! MySQL authentication plugins.
//!
//! The handshake asks a plugin for a response to the server scramble, then
//! keeps feeding it auth-more-data payloads until the server answers OK or
//! ERR. An auth-switch request replaces the plugin mid-exchange.
//!
//! # mysql_native_password
//!
//! ```text
//! SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))
//! ```
//!
//! # caching_sha2_password
//!
//! Fast auth (password hash cached on server):
//! ```text
//! XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + seed))
//! ```
//!
//! Full auth sends the password in clear over TLS, or RSA-encrypted with
//! the server public key otherwise.

use std::fmt;

use sha1::Sha1;
use sha2::{Digest, Sha256};

use rand::rngs::OsRng;

use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;

use sqlwire_core::error::ConnectionErrorKind;
use sqlwire_core::{Error, Result};

/// Well-known authentication plugin names.
pub mod plugins {
    /// SHA1-based authentication (legacy default)
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    /// SHA256-based authentication (MySQL 8.0+ default)
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    /// RSA-based SHA256 authentication
    pub const SHA256_PASSWORD: &str = "sha256_password";
    /// Cleartext password, only over a secure channel
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
}

/// Auth-more-data codes of caching_sha2_password.
pub mod caching_sha2 {
    /// Client asks for the server public key
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    /// Fast auth succeeded, OK follows
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    /// Full auth needed
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// Public key request byte of sha256_password.
const SHA256_REQUEST_PUBLIC_KEY: u8 = 0x01;

/// What the plugin wants the engine to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Write these bytes as the next auth packet.
    Respond(Vec<u8>),
    /// Write nothing and read the next server message.
    Wait,
}

/// A client-side authentication plugin.
pub trait AuthenticationPlugin: fmt::Debug + Send {
    /// Protocol name as sent in the handshake response.
    fn name(&self) -> &'static str;

    /// Produce the reply to `server_data`.
    ///
    /// The first call receives the scramble from the greeting or auth-switch
    /// request; later calls receive auth-more-data payloads without the
    /// leading `0x01`. `secure` is true once the transport is encrypted.
    fn next_response(&mut self, server_data: &[u8], secure: bool) -> Result<AuthStep>;
}

/// Create the plugin called `name` for `password`.
pub fn plugin_for(name: &str, password: &str) -> Result<Box<dyn AuthenticationPlugin>> {
    let password = password.to_string();
    match name {
        plugins::MYSQL_NATIVE_PASSWORD => Ok(Box::new(NativePassword { password })),
        plugins::CACHING_SHA2_PASSWORD => Ok(Box::new(CachingSha2Password {
            password,
            seed: Vec::new(),
            stage: Sha2Stage::Initial,
        })),
        plugins::SHA256_PASSWORD => Ok(Box::new(Sha256Password {
            password,
            seed: Vec::new(),
            awaiting_key: false,
        })),
        plugins::MYSQL_CLEAR_PASSWORD => Ok(Box::new(ClearPassword { password })),
        other => Err(auth_error(format!(
            "Authentication plugin '{}' is not supported",
            other
        ))),
    }
}

fn auth_error(message: impl Into<String>) -> Error {
    Error::connection(ConnectionErrorKind::Authentication, message)
}

/// The 20-byte scramble, without the trailing NUL some servers append.
fn scramble_seed(auth_data: &[u8]) -> &[u8] {
    match auth_data {
        [seed @ .., 0] if seed.len() == 20 => seed,
        _ => auth_data,
    }
}

fn null_terminated(password: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(password.len() + 1);
    bytes.extend_from_slice(password.as_bytes());
    bytes.push(0);
    bytes
}

#[derive(Debug)]
struct NativePassword {
    password: String,
}

impl AuthenticationPlugin for NativePassword {
    fn name(&self) -> &'static str {
        plugins::MYSQL_NATIVE_PASSWORD
    }

    fn next_response(&mut self, server_data: &[u8], _secure: bool) -> Result<AuthStep> {
        Ok(AuthStep::Respond(mysql_native_password(
            &self.password,
            server_data,
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sha2Stage {
    Initial,
    Scrambled,
    AwaitingKey,
}

#[derive(Debug)]
struct CachingSha2Password {
    password: String,
    seed: Vec<u8>,
    stage: Sha2Stage,
}

impl AuthenticationPlugin for CachingSha2Password {
    fn name(&self) -> &'static str {
        plugins::CACHING_SHA2_PASSWORD
    }

    fn next_response(&mut self, server_data: &[u8], secure: bool) -> Result<AuthStep> {
        match self.stage {
            Sha2Stage::Initial => {
                self.seed = scramble_seed(server_data).to_vec();
                self.stage = Sha2Stage::Scrambled;
                Ok(AuthStep::Respond(caching_sha2_password(
                    &self.password,
                    &self.seed,
                )))
            }
            Sha2Stage::Scrambled => match server_data.first() {
                Some(&caching_sha2::FAST_AUTH_SUCCESS) => Ok(AuthStep::Wait),
                Some(&caching_sha2::PERFORM_FULL_AUTH) if secure => {
                    Ok(AuthStep::Respond(null_terminated(&self.password)))
                }
                Some(&caching_sha2::PERFORM_FULL_AUTH) => {
                    tracing::debug!("caching_sha2_password full auth, requesting public key");
                    self.stage = Sha2Stage::AwaitingKey;
                    Ok(AuthStep::Respond(vec![caching_sha2::REQUEST_PUBLIC_KEY]))
                }
                other => Err(auth_error(format!(
                    "Unexpected caching_sha2_password response {:?}",
                    other
                ))),
            },
            Sha2Stage::AwaitingKey => {
                let encrypted = rsa_encrypt_password(&self.password, &self.seed, server_data)?;
                self.stage = Sha2Stage::Scrambled;
                Ok(AuthStep::Respond(encrypted))
            }
        }
    }
}

#[derive(Debug)]
struct Sha256Password {
    password: String,
    seed: Vec<u8>,
    awaiting_key: bool,
}

impl AuthenticationPlugin for Sha256Password {
    fn name(&self) -> &'static str {
        plugins::SHA256_PASSWORD
    }

    fn next_response(&mut self, server_data: &[u8], secure: bool) -> Result<AuthStep> {
        if self.awaiting_key {
            self.awaiting_key = false;
            return rsa_encrypt_password(&self.password, &self.seed, server_data)
                .map(AuthStep::Respond);
        }

        self.seed = scramble_seed(server_data).to_vec();
        if self.password.is_empty() {
            Ok(AuthStep::Respond(vec![0]))
        } else if secure {
            Ok(AuthStep::Respond(null_terminated(&self.password)))
        } else {
            self.awaiting_key = true;
            Ok(AuthStep::Respond(vec![SHA256_REQUEST_PUBLIC_KEY]))
        }
    }
}

#[derive(Debug)]
struct ClearPassword {
    password: String,
}

impl AuthenticationPlugin for ClearPassword {
    fn name(&self) -> &'static str {
        plugins::MYSQL_CLEAR_PASSWORD
    }

    fn next_response(&mut self, _server_data: &[u8], secure: bool) -> Result<AuthStep> {
        if !secure {
            return Err(auth_error(
                "mysql_clear_password requires a secure connection",
            ));
        }
        Ok(AuthStep::Respond(null_terminated(&self.password)))
    }
}

/// Compute the mysql_native_password response (20 bytes, empty for no password).
pub fn mysql_native_password(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }

    let seed = if auth_data.len() > 20 {
        &auth_data[..20]
    } else {
        auth_data
    };

    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();

    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Compute the caching_sha2_password fast-auth response (32 bytes, empty for no password).
pub fn caching_sha2_password(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }

    let seed = scramble_seed(auth_data);

    let password_hash: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let password_hash_hash: [u8; 32] = Sha256::digest(password_hash).into();

    let mut hasher = Sha256::new();
    hasher.update(password_hash_hash);
    hasher.update(seed);
    let scramble: [u8; 32] = hasher.finalize().into();

    password_hash
        .iter()
        .zip(scramble.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Generate `length` random bytes from the OS generator.
pub fn generate_nonce(length: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; length];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// XOR the NUL-terminated password with the repeating seed.
pub fn xor_password_with_seed(password: &str, seed: &[u8]) -> Vec<u8> {
    let mut bytes = null_terminated(password);
    if seed.is_empty() {
        return bytes;
    }
    for (i, b) in bytes.iter_mut().enumerate() {
        *b ^= seed[i % seed.len()];
    }
    bytes
}

/// Encrypt the password for full authentication without TLS.
///
/// The NUL-terminated password is XORed with the seed and encrypted with
/// RSA-OAEP under the server's PEM public key (SPKI or PKCS#1).
pub fn rsa_encrypt_password(password: &str, seed: &[u8], public_key_pem: &[u8]) -> Result<Vec<u8>> {
    if seed.is_empty() {
        return Err(auth_error("Cannot encrypt password: empty scramble"));
    }
    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| auth_error(format!("Server public key is not valid PEM: {}", e)))?;
    let pub_key = RsaPublicKey::from_public_key_pem(pem.trim())
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem.trim()))
        .map_err(|e| auth_error(format!("Failed to parse server public key: {}", e)))?;

    let scrambled = xor_password_with_seed(password, seed);
    pub_key
        .encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &scrambled)
        .map_err(|e| auth_error(format!("RSA encryption of password failed: {}", e)))
}
