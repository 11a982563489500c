//! Content-addressing primitives used across the Strata workspace.
//!
//! Every identifier that names content is a [`Digest`] of the form
//! `sha256:<64 hex chars>`. The newtypes [`DiffId`], [`ChainId`], and
//! [`ImageId`] keep the three addressing spaces apart at compile time.

use std::fmt;
use std::io;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::constants::{DIGEST_ALGORITHM, SHA256_HEX_LENGTH};
use crate::error::{Result, StrataError};

/// A validated `algorithm:hex` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parses and validates a digest string.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::InvalidDigest` if the algorithm is not `sha256`
    /// or the encoded part is not 64 lowercase hex characters.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || StrataError::InvalidDigest {
            value: value.to_string(),
        };
        let (algorithm, hex) = value.split_once(':').ok_or_else(invalid)?;
        if algorithm != DIGEST_ALGORITHM || !is_sha256_hex(hex) {
            return Err(invalid());
        }
        Ok(Self(value.to_string()))
    }

    /// Builds a digest from a bare hex string.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::InvalidDigest` if `hex` is malformed.
    pub fn from_hex(hex: &str) -> Result<Self> {
        Self::parse(&format!("{DIGEST_ALGORITHM}:{hex}"))
    }

    /// Computes the digest of a byte slice.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut digester = Digester::new();
        digester.update(data);
        digester.finish()
    }

    /// Returns the algorithm part (always `sha256`).
    #[must_use]
    pub fn algorithm(&self) -> &str {
        &self.0[..DIGEST_ALGORITHM.len()]
    }

    /// Returns the hex-encoded part.
    #[must_use]
    pub fn hex(&self) -> &str {
        &self.0[DIGEST_ALGORITHM.len() + 1..]
    }

    /// Returns the full `algorithm:hex` string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_sha256_hex(hex: &str) -> bool {
    hex.len() == SHA256_HEX_LENGTH
        && hex
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = StrataError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.0
    }
}

/// Streaming SHA-256 digester.
///
/// Implements [`io::Write`] so it can sit on the far side of a tee while a
/// tar stream is being applied.
#[derive(Debug, Clone, Default)]
pub struct Digester {
    hasher: Sha256,
}

impl Digester {
    /// Creates an empty digester.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes into the hash.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Consumes the digester and returns the resulting digest.
    #[must_use]
    pub fn finish(self) -> Digest {
        Digest(format!(
            "{DIGEST_ALGORITHM}:{}",
            hex::encode(self.hasher.finalize())
        ))
    }
}

impl io::Write for Digester {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

macro_rules! digest_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Digest);

        impl $name {
            /// Wraps an existing digest.
            #[must_use]
            pub const fn new(digest: Digest) -> Self {
                Self(digest)
            }

            /// Parses an `algorithm:hex` string.
            ///
            /// # Errors
            ///
            /// Returns `StrataError::InvalidDigest` if the string is malformed.
            pub fn parse(value: &str) -> Result<Self> {
                Digest::parse(value).map(Self)
            }

            /// Returns the underlying digest.
            #[must_use]
            pub const fn digest(&self) -> &Digest {
                &self.0
            }

            /// Returns the full `algorithm:hex` string.
            #[must_use]
            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = StrataError;

            fn from_str(s: &str) -> Result<Self> {
                Self::parse(s)
            }
        }

        impl From<Digest> for $name {
            fn from(digest: Digest) -> Self {
                Self(digest)
            }
        }
    };
}

digest_id!(
    /// Content hash of exactly one layer's uncompressed tar stream.
    DiffId
);

digest_id!(
    /// Content hash of an entire ordered stack of layers.
    ChainId
);

digest_id!(
    /// Content address of an image configuration document.
    ImageId
);

impl From<DiffId> for ChainId {
    /// A layer without a parent is addressed by its own diff id.
    fn from(diff_id: DiffId) -> Self {
        Self(diff_id.0)
    }
}

/// Generates a random host-local identifier (64 hex characters).
///
/// Used for graph driver cache ids and mount ids; never content-derived.
#[must_use]
pub fn random_id() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}
