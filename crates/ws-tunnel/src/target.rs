use std::fmt;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use thiserror::Error;

const LENIENT: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);

/// Standard alphabet, padding optional.
const STANDARD: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);

/// URL-safe alphabet, padding optional. Clients building the request path
/// by hand often reach for this one.
const URL_SAFE: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("target identifier is not valid base64")]
    InvalidBase64,
    #[error("decoded target is not valid UTF-8")]
    NotUtf8,
    #[error("target '{0}' has no ':port' suffix")]
    MissingPort(String),
    #[error("target '{0}' has an empty host")]
    EmptyHost(String),
    #[error("target '{0}' has an invalid port")]
    InvalidPort(String),
}

/// Destination a session dials, decoded from the upgrade request path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    host: String,
    port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Decode a base64 `host:port` identifier.
    ///
    /// The host is everything before the first `:`, so bracketed IPv6
    /// literals are not supported.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let plain = decode_identifier(raw)?;
        let (host, port) = plain
            .split_once(':')
            .ok_or_else(|| DecodeError::MissingPort(plain.clone()))?;

        if host.is_empty() {
            return Err(DecodeError::EmptyHost(plain));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| DecodeError::InvalidPort(plain.clone()))?;

        Ok(Self::new(host, port))
    }

    /// The identifier a client puts in the request path to reach this target.
    pub fn encode(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.to_string())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Base64-decode an identifier to its plain string form without
/// interpreting it as `host:port`.
pub fn decode_identifier(raw: &str) -> Result<String, DecodeError> {
    let raw = raw.trim();
    let bytes = STANDARD
        .decode(raw)
        .or_else(|_| URL_SAFE.decode(raw))
        .map_err(|_| DecodeError::InvalidBase64)?;
    String::from_utf8(bytes).map_err(|_| DecodeError::NotUtf8)
}

/// Strip the leading `/` and any query string from an upgrade request path,
/// leaving the raw target identifier.
pub fn identifier_from_path(path: &str) -> &str {
    let path = path.split('?').next().unwrap_or_default();
    path.strip_prefix('/').unwrap_or(path)
}
