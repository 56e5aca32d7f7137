//! Integrity and confidentiality envelope for tally payloads.
//!
//! Two independent, optional layers applied to a serialized payload before it
//! leaves the agent and reversed before the server accepts it:
//!
//! 1. Integrity: HMAC-SHA256 over the plaintext with a shared secret,
//!    carried as a hex tag in request metadata.
//! 2. Confidentiality: RSA-OAEP (SHA-256) over the plaintext, chunked so
//!    payloads larger than one RSA block survive the trip.
//!
//! The sender computes the tag first, then encrypts. The receiver decrypts
//! first, then verifies the tag against the recovered plaintext. A tag that
//! is absent while a secret is configured is a rejection, not a pass.

#![deny(clippy::all)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

use hmac::{Hmac, Mac};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::rand_core::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// OAEP with SHA-256 reserves `2 * hash_len + 2` bytes of every RSA block.
const OAEP_OVERHEAD: usize = 2 * 32 + 2;

#[derive(thiserror::Error, Debug)]
/// Errors produced by functions in this module
pub enum Error {
    /// Key material failed to parse, fatal at startup
    #[error("unreadable key material: {0}")]
    KeyMaterial(String),
    /// Wrapper for [`rsa::Error`]
    #[error("rsa: {0}")]
    Rsa(#[from] rsa::Error),
    /// Integrity tag is not valid hex
    #[error("integrity tag is not hex: {0}")]
    TagEncoding(#[from] hex::FromHexError),
    /// Integrity tag did not match the payload
    #[error("integrity tag mismatch")]
    TagMismatch,
    /// Integrity tag absent while a shared secret is configured
    #[error("integrity tag absent")]
    TagMissing,
    /// Ciphertext is not a whole number of RSA blocks
    #[error("ciphertext is not a whole number of rsa blocks")]
    Fragment,
    /// Shared secret rejected by the mac implementation
    #[error("invalid shared secret")]
    Secret,
}

/// Parse an RSA public key from PEM, accepting PKCS#8 (`BEGIN PUBLIC KEY`)
/// and PKCS#1 (`BEGIN RSA PUBLIC KEY`) encodings.
///
/// # Errors
///
/// Function will error if the PEM does not contain an RSA public key.
pub fn load_public_key(pem: &str) -> Result<RsaPublicKey, Error> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| Error::KeyMaterial(e.to_string()))
}

/// Parse an RSA private key from PEM, accepting PKCS#8 (`BEGIN PRIVATE KEY`)
/// and PKCS#1 (`BEGIN RSA PRIVATE KEY`) encodings.
///
/// # Errors
///
/// Function will error if the PEM does not contain an RSA private key.
pub fn load_private_key(pem: &str) -> Result<RsaPrivateKey, Error> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| Error::KeyMaterial(e.to_string()))
}

/// Compute the hex integrity tag of `payload` under `secret`.
///
/// # Errors
///
/// Function will error if the mac implementation rejects the secret.
pub fn sign(secret: &[u8], payload: &[u8]) -> Result<String, Error> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| Error::Secret)?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify the hex integrity tag of `payload` under `secret` in constant
/// time.
///
/// # Errors
///
/// Function will error if the tag is not hex or does not match the payload.
pub fn verify(secret: &[u8], payload: &[u8], tag: &str) -> Result<(), Error> {
    let expected = hex::decode(tag)?;
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| Error::Secret)?;
    mac.update(payload);
    mac.verify_slice(&expected).map_err(|_| Error::TagMismatch)
}

/// Encrypt `plaintext` under `key` with OAEP/SHA-256, chunking so inputs of
/// any length fit. Output is a concatenation of key-sized blocks.
///
/// # Errors
///
/// Function will error if the underlying RSA operation fails.
pub fn encrypt(key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
    let block = key.size();
    let max_plain = block - OAEP_OVERHEAD;
    let mut rng = OsRng;
    let mut out = Vec::with_capacity(plaintext.len().div_ceil(max_plain) * block);
    for chunk in plaintext.chunks(max_plain) {
        let sealed = key.encrypt(&mut rng, Oaep::new::<Sha256>(), chunk)?;
        out.extend_from_slice(&sealed);
    }
    Ok(out)
}

/// Decrypt a concatenation of key-sized OAEP blocks produced by [`encrypt`].
///
/// # Errors
///
/// Function will error if the ciphertext is not block-aligned or any block
/// fails to decrypt.
pub fn decrypt(key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
    let block = key.size();
    if ciphertext.len() % block != 0 {
        return Err(Error::Fragment);
    }
    let mut out = Vec::with_capacity(ciphertext.len());
    for chunk in ciphertext.chunks(block) {
        let plain = key.decrypt(Oaep::new::<Sha256>(), chunk)?;
        out.extend_from_slice(&plain);
    }
    Ok(out)
}

/// A payload transformed for the wire: the body to send and, if a secret is
/// configured, the integrity tag to attach alongside it.
#[derive(Debug, Clone)]
pub struct Sealed {
    /// The bytes to put on the wire, encrypted if a public key is configured.
    pub body: Vec<u8>,
    /// Hex integrity tag over the plaintext, present iff a secret is
    /// configured.
    pub tag: Option<String>,
}

/// Sender half of the envelope, held by the agent.
#[derive(Debug, Clone)]
pub struct Sealer {
    secret: Option<Vec<u8>>,
    public_key: Option<RsaPublicKey>,
}

impl Sealer {
    /// Create a `Sealer`. Either layer may be absent, an empty secret counts
    /// as absent.
    ///
    /// # Errors
    ///
    /// Function will error if `public_key_pem` is present but unparsable.
    pub fn new(secret: Option<&str>, public_key_pem: Option<&str>) -> Result<Self, Error> {
        let public_key = public_key_pem.map(load_public_key).transpose()?;
        Ok(Self {
            secret: secret
                .filter(|s| !s.is_empty())
                .map(|s| s.as_bytes().to_vec()),
            public_key,
        })
    }

    /// Apply the envelope: tag the plaintext, then encrypt it.
    ///
    /// # Errors
    ///
    /// Function will error if either layer fails.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Sealed, Error> {
        let tag = self
            .secret
            .as_deref()
            .map(|secret| sign(secret, plaintext))
            .transpose()?;
        let body = match &self.public_key {
            Some(key) => encrypt(key, plaintext)?,
            None => plaintext.to_vec(),
        };
        Ok(Sealed { body, tag })
    }
}

/// Receiver half of the envelope, held by the server.
#[derive(Debug, Clone)]
pub struct Opener {
    secret: Option<Vec<u8>>,
    private_key: Option<RsaPrivateKey>,
}

impl Opener {
    /// Create an `Opener`. Either layer may be absent, an empty secret
    /// counts as absent.
    ///
    /// # Errors
    ///
    /// Function will error if `private_key_pem` is present but unparsable.
    pub fn new(secret: Option<&str>, private_key_pem: Option<&str>) -> Result<Self, Error> {
        let private_key = private_key_pem.map(load_private_key).transpose()?;
        Ok(Self {
            secret: secret
                .filter(|s| !s.is_empty())
                .map(|s| s.as_bytes().to_vec()),
            private_key,
        })
    }

    /// Reverse the envelope: decrypt the body, then verify the tag against
    /// the recovered plaintext. With a secret configured, an absent tag is
    /// [`Error::TagMissing`].
    ///
    /// # Errors
    ///
    /// Function will error if decryption fails, the tag is absent while a
    /// secret is configured, or the tag does not match.
    pub fn open(&self, body: &[u8], tag: Option<&str>) -> Result<Vec<u8>, Error> {
        let plaintext = match &self.private_key {
            Some(key) => decrypt(key, body)?,
            None => body.to_vec(),
        };
        if let Some(secret) = self.secret.as_deref() {
            let tag = tag.ok_or(Error::TagMissing)?;
            verify(secret, &plaintext, tag)?;
        }
        Ok(plaintext)
    }

    /// Hex integrity tag for an outbound response body, present iff a secret
    /// is configured.
    ///
    /// # Errors
    ///
    /// Function will error if the mac implementation rejects the secret.
    pub fn response_tag(&self, body: &[u8]) -> Result<Option<String>, Error> {
        self.secret
            .as_deref()
            .map(|secret| sign(secret, body))
            .transpose()
    }
}
