//! Hub identity — the long-term ed25519 keypair from config.
//!
//! The same key serves three purposes: it is the iroh endpoint secret (peer
//! transport identity), it signs `challenge` bytes so clients can prove they
//! hold the real hub key, and its public half derives the overlay discovery
//! key the hub advertises on.

use anyhow::{bail, Context, Result};
use ed25519_dalek::{Signer, SigningKey};
use sha2::{Digest, Sha256};

const DISCOVERY_NAMESPACE: &[u8] = b"symmetry";

pub struct Identity {
    signing: SigningKey,
}

impl Identity {
    /// Build from the config's hex keypair. `private_hex` is 64 bytes,
    /// seed || public, and must agree with `public_hex`.
    pub fn from_hex(public_hex: &str, private_hex: &str) -> Result<Self> {
        let public = hex::decode(public_hex.trim()).context("publicKey is not valid hex")?;
        if public.len() != 32 {
            bail!("publicKey must be 32 bytes, got {}", public.len());
        }
        let private = hex::decode(private_hex.trim()).context("privateKey is not valid hex")?;
        if private.len() != 64 {
            bail!("privateKey must be 64 bytes (seed || public), got {}", private.len());
        }
        let seed: [u8; 32] = private[..32].try_into().expect("length checked");
        let signing = SigningKey::from_bytes(&seed);
        let derived = signing.verifying_key().to_bytes();
        if derived.as_slice() != &private[32..] {
            bail!("privateKey is inconsistent: embedded public half does not match the seed");
        }
        if derived.as_slice() != public.as_slice() {
            bail!("publicKey does not match privateKey");
        }
        Ok(Self { signing })
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing.verifying_key().to_bytes())
    }

    pub fn discovery_key_hex(&self) -> String {
        discovery_key(&self.signing.verifying_key().to_bytes())
    }

    /// The same seed doubles as the iroh endpoint secret.
    pub fn transport_key(&self) -> iroh::SecretKey {
        iroh::SecretKey::from_bytes(&self.signing.to_bytes())
    }
}

/// One-way derivation of a public key for overlay advertisement.
pub fn discovery_key(public_key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(DISCOVERY_NAMESPACE);
    hasher.update(public_key);
    hex::encode(hasher.finalize())
}
