//! Cryptographic collaborator for the dispatcher.
//!
//! Two independent layers:
//!
//! - **Recipient sealing** (end to end): ephemeral X25519 agreement with
//!   the recipient's Ed25519 identity key converted to Montgomery form,
//!   HKDF-SHA256, XChaCha20-Poly1305.
//! - **Transit** (node to node over the bus): XChaCha20-Poly1305 keyed by
//!   HKDF over the per-deployment shared secret. Output is hex text.
//!
//! Everything the dispatcher needs goes through [`CryptoProvider`], so the
//! algorithms can be swapped without touching routing code.

use chacha20poly1305::aead::rand_core::{OsRng, RngCore};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519Secret};

use crate::error::ProtocolError;

const SEAL_INFO: &[u8] = b"neptune-seal-xchacha20poly1305-v1";
const TRANSIT_INFO: &[u8] = b"neptune-transit-xchacha20poly1305-v1";
const NONCE_LEN: usize = 24;

// ── Contract ───────────────────────────────────────────────────────────

/// Crypto operations the dispatcher and the broker bus rely on.
pub trait CryptoProvider: Send + Sync {
    /// Seal `plaintext` so only the holder of `recipient_public_key`
    /// (hex Ed25519) can open it. Returns printable ciphertext.
    fn encrypt_for(
        &self,
        plaintext: &[u8],
        recipient_public_key: &str,
    ) -> Result<String, ProtocolError>;

    /// Signature over `plaintext` by this node. Returns printable text.
    fn sign(&self, plaintext: &[u8]) -> Result<String, ProtocolError>;

    /// Symmetric transit encryption with a shared secret.
    fn encrypt_string(&self, text: &str, shared_key: &str) -> Result<String, ProtocolError>;

    fn decrypt_string(&self, text: &str, shared_key: &str) -> Result<String, ProtocolError>;
}

// ── Recipient sealing ──────────────────────────────────────────────────

/// Sealed payload: ciphertext plus what the recipient needs to rebuild the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedPayload {
    /// Includes the 16-byte Poly1305 tag.
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub ephemeral_pk: [u8; 32],
}

impl SealedPayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }

    pub fn to_hex(&self) -> Result<String, ProtocolError> {
        Ok(hex::encode(self.to_bytes()?))
    }

    pub fn from_hex(text: &str) -> Result<Self, ProtocolError> {
        let bytes = hex::decode(text).map_err(|e| ProtocolError::Crypto(format!("bad hex: {e}")))?;
        Self::from_bytes(&bytes)
    }
}

/// Edwards to Montgomery, as libsodium's `crypto_sign_ed25519_pk_to_curve25519`.
pub fn ed25519_to_x25519_public(ed25519_pk: &[u8; 32]) -> Result<[u8; 32], ProtocolError> {
    CompressedEdwardsY(*ed25519_pk)
        .decompress()
        .map(|point| point.to_montgomery().to_bytes())
        .ok_or_else(|| ProtocolError::Crypto("public key is not a valid Ed25519 point".into()))
}

/// SHA-512 of the seed, first half, clamped.
pub fn ed25519_to_x25519_secret(ed25519_seed: &[u8; 32]) -> [u8; 32] {
    let digest = Sha512::digest(ed25519_seed);
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&digest[..32]);
    secret[0] &= 248;
    secret[31] &= 127;
    secret[31] |= 64;
    secret
}

fn hkdf_key(ikm: &[u8], info: &[u8]) -> Result<[u8; 32], ProtocolError> {
    let mut key = [0u8; 32];
    Hkdf::<Sha256>::new(None, ikm)
        .expand(info, &mut key)
        .map_err(|_| ProtocolError::Crypto("hkdf expand failed".into()))?;
    Ok(key)
}

fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn seal(
    plaintext: &[u8],
    recipient_ed25519_pk: &[u8; 32],
) -> Result<SealedPayload, ProtocolError> {
    let recipient = X25519PublicKey::from(ed25519_to_x25519_public(recipient_ed25519_pk)?);
    let ephemeral = X25519Secret::random_from_rng(OsRng);
    let ephemeral_pk = X25519PublicKey::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(&recipient);
    let cipher = XChaCha20Poly1305::new(&hkdf_key(shared.as_bytes(), SEAL_INFO)?.into());
    let nonce = random_nonce();
    let ciphertext = cipher
        .encrypt(&XNonce::from(nonce), plaintext)
        .map_err(|e| ProtocolError::Crypto(format!("seal failed: {e}")))?;

    Ok(SealedPayload {
        ciphertext,
        nonce,
        ephemeral_pk: ephemeral_pk.to_bytes(),
    })
}

pub fn open(
    sealed: &SealedPayload,
    recipient_ed25519_seed: &[u8; 32],
) -> Result<Vec<u8>, ProtocolError> {
    let secret = X25519Secret::from(ed25519_to_x25519_secret(recipient_ed25519_seed));
    let shared = secret.diffie_hellman(&X25519PublicKey::from(sealed.ephemeral_pk));
    let cipher = XChaCha20Poly1305::new(&hkdf_key(shared.as_bytes(), SEAL_INFO)?.into());
    cipher
        .decrypt(&XNonce::from(sealed.nonce), sealed.ciphertext.as_ref())
        .map_err(|_| ProtocolError::Crypto("open failed: authentication error".into()))
}

// ── Transit ────────────────────────────────────────────────────────────

/// Encrypt `text` under `shared_key`. Output: hex(nonce || ciphertext).
pub fn transit_encrypt(text: &str, shared_key: &str) -> Result<String, ProtocolError> {
    if shared_key.is_empty() {
        return Err(ProtocolError::Crypto("empty shared key".into()));
    }
    let cipher = XChaCha20Poly1305::new(&hkdf_key(shared_key.as_bytes(), TRANSIT_INFO)?.into());
    let nonce = random_nonce();
    let ciphertext = cipher
        .encrypt(&XNonce::from(nonce), text.as_bytes())
        .map_err(|e| ProtocolError::Crypto(format!("transit encryption failed: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(hex::encode(out))
}

pub fn transit_decrypt(text: &str, shared_key: &str) -> Result<String, ProtocolError> {
    if shared_key.is_empty() {
        return Err(ProtocolError::Crypto("empty shared key".into()));
    }
    let raw = hex::decode(text.trim()).map_err(|e| ProtocolError::Crypto(format!("bad hex: {e}")))?;
    if raw.len() < NONCE_LEN + 16 {
        return Err(ProtocolError::Crypto(format!("transit blob too short: {} bytes", raw.len())));
    }
    let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(&hkdf_key(shared_key.as_bytes(), TRANSIT_INFO)?.into());
    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| {
            ProtocolError::Crypto("transit decryption failed: authentication error".into())
        })?;
    String::from_utf8(plaintext)
        .map_err(|_| ProtocolError::Crypto("transit plaintext is not utf-8".into()))
}

// ── Default provider ───────────────────────────────────────────────────

/// Ed25519-keyed node crypto.
pub struct NodeCrypto {
    signing_key: SigningKey,
}

impl NodeCrypto {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Fresh random identity.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Identity from a 64-character hex seed.
    pub fn from_hex_seed(seed_hex: &str) -> Result<Self, ProtocolError> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|e| ProtocolError::Config(format!("node key: {e}")))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ProtocolError::Config("node key must be 32 bytes".into()))?;
        Ok(Self::from_seed(seed))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key().as_bytes())
    }

    /// Inverse of [`from_hex_seed`](Self::from_hex_seed). Secret material.
    pub fn seed_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }
}

fn parse_public_key(hex_key: &str) -> Result<[u8; 32], ProtocolError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| ProtocolError::Crypto(format!("recipient key is not hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| ProtocolError::Crypto("recipient key must be 32 bytes".into()))
}

impl CryptoProvider for NodeCrypto {
    fn encrypt_for(
        &self,
        plaintext: &[u8],
        recipient_public_key: &str,
    ) -> Result<String, ProtocolError> {
        seal(plaintext, &parse_public_key(recipient_public_key)?)?.to_hex()
    }

    fn sign(&self, plaintext: &[u8]) -> Result<String, ProtocolError> {
        Ok(hex::encode(self.signing_key.sign(plaintext).to_bytes()))
    }

    fn encrypt_string(&self, text: &str, shared_key: &str) -> Result<String, ProtocolError> {
        transit_encrypt(text, shared_key)
    }

    fn decrypt_string(&self, text: &str, shared_key: &str) -> Result<String, ProtocolError> {
        transit_decrypt(text, shared_key)
    }
}
