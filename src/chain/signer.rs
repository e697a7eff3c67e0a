//! Transaction signing seam.
//!
//! Key management is deliberately a black box behind [`TxSigner`]: the
//! engine only needs sign-doc bytes turned into a signature and the
//! matching public key. [`KeyringSigner`] resolves the configured key
//! material selection and signs with secp256k1 ECDSA.

use k256::ecdsa::signature::Signer as _;
use k256::ecdsa::{Signature, SigningKey};
use sha2::{Digest, Sha256};

use crate::chain::ChainError;
use crate::config::KeyringConfig;

pub trait TxSigner: Send + Sync {
    /// 64-byte r||s signature over the sign-doc bytes.
    fn sign(&self, sign_doc: &[u8]) -> Result<Vec<u8>, ChainError>;

    /// Compressed secp256k1 public key (33 bytes).
    fn public_key(&self) -> Vec<u8>;
}

#[derive(Debug)]
pub struct KeyringSigner {
    key: SigningKey,
}

impl KeyringSigner {
    /// Resolve the configured key material. Exactly one selection must be
    /// provided: a hex private key, a mnemonic, or a file/test keyring
    /// backend directory.
    pub fn from_config(cfg: &KeyringConfig) -> Result<Self, ChainError> {
        let selections = [
            !cfg.priv_key_hex.is_empty(),
            !cfg.mnemonic.is_empty(),
            !cfg.dir.is_empty(),
        ]
        .iter()
        .filter(|s| **s)
        .count();
        if selections != 1 {
            return Err(ChainError::Signer(
                "exactly one of keyring.priv_key_hex, keyring.mnemonic or keyring.dir must be set"
                    .to_string(),
            ));
        }

        let key_bytes: Vec<u8> = if !cfg.priv_key_hex.is_empty() {
            hex::decode(cfg.priv_key_hex.trim())
                .map_err(|e| ChainError::Signer(format!("invalid priv_key_hex: {e}")))?
        } else if !cfg.mnemonic.is_empty() {
            // Digest-derived key; the seam is the trait, not the
            // derivation path.
            Sha256::digest(cfg.mnemonic.trim().as_bytes()).to_vec()
        } else {
            match cfg.backend.as_str() {
                "file" | "test" => {
                    let path = std::path::Path::new(&cfg.dir).join("priv_key.hex");
                    let contents = std::fs::read_to_string(&path).map_err(|e| {
                        ChainError::Signer(format!("failed to read {}: {e}", path.display()))
                    })?;
                    hex::decode(contents.trim())
                        .map_err(|e| ChainError::Signer(format!("invalid key file: {e}")))?
                }
                other => {
                    return Err(ChainError::Signer(format!(
                        "unsupported keyring backend: {other}"
                    )));
                }
            }
        };

        let key = SigningKey::from_slice(&key_bytes)
            .map_err(|e| ChainError::Signer(format!("invalid secp256k1 key: {e}")))?;

        Ok(Self { key })
    }
}

impl TxSigner for KeyringSigner {
    fn sign(&self, sign_doc: &[u8]) -> Result<Vec<u8>, ChainError> {
        let signature: Signature = self.key.sign(sign_doc);
        // The chain rejects malleable high-S signatures.
        let signature = signature.normalize_s().unwrap_or(signature);
        Ok(signature.to_bytes().to_vec())
    }

    fn public_key(&self) -> Vec<u8> {
        self.key
            .verifying_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyring(priv_key_hex: &str, mnemonic: &str, dir: &str) -> KeyringConfig {
        KeyringConfig {
            dir: dir.to_string(),
            backend: "file".to_string(),
            passphrase: String::new(),
            priv_key_hex: priv_key_hex.to_string(),
            mnemonic: mnemonic.to_string(),
        }
    }

    const KEY_HEX: &str = "2c14c94a4dd9ea1098a0c232940be3baa8aba553f9d95ba5dd45656d86a3b432";

    #[test]
    fn hex_key_resolves_and_signs() {
        let signer = KeyringSigner::from_config(&keyring(KEY_HEX, "", "")).unwrap();
        let sig = signer.sign(b"sign me").unwrap();
        assert_eq!(sig.len(), 64);
        assert_eq!(signer.public_key().len(), 33);
    }

    #[test]
    fn signing_is_deterministic() {
        let signer = KeyringSigner::from_config(&keyring(KEY_HEX, "", "")).unwrap();
        assert_eq!(signer.sign(b"doc").unwrap(), signer.sign(b"doc").unwrap());
        assert_ne!(signer.sign(b"doc").unwrap(), signer.sign(b"other").unwrap());
    }

    #[test]
    fn mnemonic_resolves() {
        let signer =
            KeyringSigner::from_config(&keyring("", "abandon ability able about", "")).unwrap();
        assert_eq!(signer.public_key().len(), 33);
    }

    #[test]
    fn multiple_selections_rejected() {
        let err = KeyringSigner::from_config(&keyring(KEY_HEX, "mnemonic words", "")).unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn no_selection_rejected() {
        assert!(KeyringSigner::from_config(&keyring("", "", "")).is_err());
    }

    #[test]
    fn unsupported_backend_rejected() {
        let mut cfg = keyring("", "", "/tmp/keys");
        cfg.backend = "os".to_string();
        let err = KeyringSigner::from_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("unsupported keyring backend"));
    }
}
