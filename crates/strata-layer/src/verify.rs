//! Digesting readers.

use std::io::{self, Read};

use strata_common::error::StrataError;
use strata_common::types::{DiffId, Digest, Digester};

/// Hashes every byte that passes through it.
#[derive(Debug)]
pub struct DigestReader<R> {
    inner: R,
    digester: Digester,
    total: u64,
}

impl<R: Read> DigestReader<R> {
    /// Wraps `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            digester: Digester::new(),
            total: 0,
        }
    }

    /// Number of bytes read so far.
    pub const fn total(&self) -> u64 {
        self.total
    }

    /// Returns the digest of everything read so far.
    pub fn finish(self) -> Digest {
        self.digester.finish()
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digester.update(&buf[..n]);
        self.total += n as u64;
        Ok(n)
    }
}

/// Checks that a layer stream hashes to its diff id.
///
/// The check happens when the inner reader reports end of stream; a
/// mismatch surfaces as an [`io::ErrorKind::InvalidData`] error instead of
/// the final `Ok(0)`.
pub struct VerifiedReader<R> {
    inner: R,
    digester: Digester,
    expected: DiffId,
    verified: bool,
}

impl<R: Read> VerifiedReader<R> {
    /// Wraps `inner`, expecting it to hash to `expected`.
    pub fn new(inner: R, expected: DiffId) -> Self {
        Self {
            inner,
            digester: Digester::new(),
            expected,
            verified: false,
        }
    }
}

impl<R: Read> Read for VerifiedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.verified || buf.is_empty() {
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.digester.update(&buf[..n]);
            return Ok(n);
        }
        let actual = std::mem::take(&mut self.digester).finish();
        if &actual != self.expected.digest() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                StrataError::HashMismatch {
                    resource: "layer tar stream".into(),
                    expected: self.expected.to_string(),
                    actual: actual.to_string(),
                },
            ));
        }
        self.verified = true;
        Ok(0)
    }
}
