use std::fmt;
use std::str::FromStr;

use data_encoding::HEXLOWER;
use ring::digest;
use thiserror::Error;

pub const SHA256_SIZE: usize = 256 / 8;

/// A SHA-256 digest. Rendered as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sha256([u8; SHA256_SIZE]);

impl Sha256 {
    pub const fn new(data: [u8; SHA256_SIZE]) -> Sha256 {
        Sha256(data)
    }

    pub fn from_slice(data: &[u8]) -> Result<Sha256, InvalidHashError> {
        if data.len() != SHA256_SIZE {
            return Err(InvalidHashError::Length(data.len()));
        }
        let mut buf = [0u8; SHA256_SIZE];
        buf.copy_from_slice(data);
        Ok(Sha256(buf))
    }

    /// The leading 20 bytes, the truncation used for store path digests.
    pub fn truncated(&self) -> &[u8] {
        &self.0[..20]
    }

    pub fn digest_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Digests `data` with SHA-256.
pub fn digest<B: AsRef<[u8]>>(data: B) -> Sha256 {
    let d = digest::digest(&digest::SHA256, data.as_ref());
    Sha256::from_slice(d.as_ref()).unwrap()
}

/// Convenience form returning the 64-hex text rendering directly.
pub fn digest_hex<B: AsRef<[u8]>>(data: B) -> String {
    digest(data).to_string()
}

impl fmt::Display for Sha256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for Sha256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha256({})", self)
    }
}

impl AsRef<[u8]> for Sha256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for Sha256 {
    type Err = InvalidHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != SHA256_SIZE * 2 {
            return Err(InvalidHashError::Length(s.len() / 2));
        }
        let decoded = HEXLOWER
            .decode(s.as_bytes())
            .map_err(|e| InvalidHashError::Symbol(e.position))?;
        Sha256::from_slice(&decoded)
    }
}

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum InvalidHashError {
    #[error("hash has wrong length {0} != {SHA256_SIZE}")]
    Length(usize),
    #[error("invalid hash symbol at {0}")]
    Symbol(usize),
}

/// Returns true when `s` looks like a 64-char lowercase hex digest.
pub fn is_hex_digest(s: &str) -> bool {
    s.len() == SHA256_SIZE * 2
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
