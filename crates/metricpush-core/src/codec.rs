//! Transport codec: gzip framing and the optional RSA-OAEP envelope.
//!
//! Outbound order is `gzip → encrypt`, inbound is `decrypt → gunzip`. Both
//! agent and server use these functions so the two sides cannot drift.
//!
//! RSA-OAEP (SHA-512, empty label) can only seal `k - 2*64 - 2` bytes per
//! operation, where `k` is the modulus size in bytes. Larger payloads are
//! split into chunks of that size and each chunk becomes one `k`-byte block
//! in the ciphertext. A payload that fits into one chunk is therefore
//! identical to plain single-shot OAEP.

use std::io::{Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use rand_core::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha512;

/// Upper bound on an inflated request body.
pub const MAX_DECOMPRESSED: usize = 32 * 1024 * 1024;

/// SHA-512 output length, the `hLen` in the OAEP overhead.
const OAEP_HASH_LEN: usize = 64;

/// A modulus of this many bytes or fewer leaves no room for OAEP-SHA512
/// plaintext.
const OAEP_OVERHEAD: usize = 2 * OAEP_HASH_LEN + 2;

fn check_modulus(size: usize) -> Result<(), CodecError> {
    if size <= OAEP_OVERHEAD {
        return Err(CodecError::Key(format!(
            "modulus too small for OAEP-SHA512 ({} bits, need more than {})",
            size * 8,
            OAEP_OVERHEAD * 8
        )));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("gzip compression failed: {0}")]
    Compress(#[source] std::io::Error),
    #[error("gzip decompression failed: {0}")]
    Decompress(#[source] std::io::Error),
    #[error("decompressed payload exceeds {0} bytes")]
    TooLarge(usize),
    #[error("cannot read key file {path}: {source}")]
    KeyFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid RSA key: {0}")]
    Key(String),
    #[error("ciphertext length {len} is not a multiple of the {block}-byte block size")]
    BlockLength { len: usize, block: usize },
    #[error("RSA operation failed: {0}")]
    Rsa(#[from] rsa::Error),
}

// ---------------------------------------------------------------------------
// gzip
// ---------------------------------------------------------------------------

pub fn compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data).map_err(CodecError::Compress)?;
    encoder.finish().map_err(CodecError::Compress)
}

/// Inflate a gzip buffer, refusing anything larger than [`MAX_DECOMPRESSED`].
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(MAX_DECOMPRESSED as u64 + 1)
        .read_to_end(&mut out)
        .map_err(CodecError::Decompress)?;
    if out.len() > MAX_DECOMPRESSED {
        return Err(CodecError::TooLarge(MAX_DECOMPRESSED));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// RSA-OAEP
// ---------------------------------------------------------------------------

fn read_pem(path: &Path) -> Result<String, CodecError> {
    std::fs::read_to_string(path).map_err(|source| CodecError::KeyFile {
        path: path.display().to_string(),
        source,
    })
}

/// Agent-side key: encrypts outbound payloads for the server.
#[derive(Debug, Clone)]
pub struct PublicKey(RsaPublicKey);

impl PublicKey {
    /// Wrap `key`, rejecting moduli too small to carry any OAEP plaintext.
    pub fn new(key: RsaPublicKey) -> Result<Self, CodecError> {
        check_modulus(key.size())?;
        Ok(Self(key))
    }

    /// Parse an SPKI (`BEGIN PUBLIC KEY`) or PKCS#1 (`BEGIN RSA PUBLIC KEY`) PEM.
    pub fn from_pem(pem: &str) -> Result<Self, CodecError> {
        RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|e| CodecError::Key(e.to_string()))
            .and_then(Self::new)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CodecError> {
        Self::from_pem(&read_pem(path.as_ref())?)
    }

    /// Largest plaintext chunk a single OAEP block can carry.
    pub fn chunk_len(&self) -> usize {
        self.0.size() - OAEP_OVERHEAD
    }

    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let block = self.0.size();
        let mut out = Vec::with_capacity(data.len().div_ceil(self.chunk_len()) * block);
        for chunk in data.chunks(self.chunk_len()) {
            let sealed = self.0.encrypt(&mut OsRng, Oaep::new::<Sha512>(), chunk)?;
            out.extend_from_slice(&sealed);
        }
        Ok(out)
    }
}

/// Server-side key: opens payloads sealed with the matching [`PublicKey`].
#[derive(Debug, Clone)]
pub struct PrivateKey(RsaPrivateKey);

impl PrivateKey {
    /// Wrap `key`, rejecting moduli too small to carry any OAEP plaintext.
    pub fn new(key: RsaPrivateKey) -> Result<Self, CodecError> {
        check_modulus(key.size())?;
        Ok(Self(key))
    }

    /// Parse a PKCS#8 (`BEGIN PRIVATE KEY`) or PKCS#1 (`BEGIN RSA PRIVATE KEY`) PEM.
    pub fn from_pem(pem: &str) -> Result<Self, CodecError> {
        RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| CodecError::Key(e.to_string()))
            .and_then(Self::new)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CodecError> {
        Self::from_pem(&read_pem(path.as_ref())?)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.to_public_key())
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let block = self.0.size();
        if data.len() % block != 0 {
            return Err(CodecError::BlockLength {
                len: data.len(),
                block,
            });
        }
        let mut out = Vec::with_capacity(data.len());
        for sealed in data.chunks(block) {
            out.extend_from_slice(&self.0.decrypt(Oaep::new::<Sha512>(), sealed)?);
        }
        Ok(out)
    }
}
