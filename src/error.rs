//! Unified error type for local stores, remote backends and configuration.
//!
//! Remote failures are normally absorbed by the shim and reported to a
//! [`SyncObserver`](crate::observer::SyncObserver); only local-store and
//! configuration errors reach application code.

use thiserror::Error;

/// Things that can go wrong when reading, writing or syncing entries.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// File system problem (read, write, rename).
    #[error("i/o error: {0}")]
    Io(String),
    /// A value could not be encoded as JSON.
    #[error("encode error: {0}")]
    Encode(String),
    /// Stored bytes were not the JSON we expected.
    #[error("decode error: {0}")]
    Decode(String),
    /// The remote backend rejected the call or could not be reached.
    #[error("remote backend error: {0}")]
    Remote(String),
    /// The remote table has no row for this key.
    #[error("no remote row for key `{0}`")]
    NotFound(String),
    /// Bad configuration (invalid path, pattern, url, etc.).
    #[error("config error: {0}")]
    Config(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            Error::Io(err.to_string())
        } else if err.is_syntax() || err.is_eof() || err.is_data() {
            Error::Decode(err.to_string())
        } else {
            Error::Encode(err.to_string())
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Error::Decode(err.to_string())
        } else {
            Error::Remote(err.to_string())
        }
    }
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result alias using our [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syntax_errors_classify_as_decode() {
        let err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        assert!(matches!(Error::from(err), Error::Decode(_)));
    }

    #[test]
    fn wrong_shape_classifies_as_decode() {
        let err = serde_json::from_str::<Vec<u8>>("\"text\"").unwrap_err();
        assert!(matches!(Error::from(err), Error::Decode(_)));
    }

    #[test]
    fn display_includes_key() {
        let msg = Error::NotFound("gallery".into()).to_string();
        assert!(msg.contains("gallery"));
    }
}
