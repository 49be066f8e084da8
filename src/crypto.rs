//! Message signing and peer identity.
//!
//! Every pub/sub record carries a detached ML-DSA-65 signature binding it to
//! its publisher. Peer ids are SHA3-256 digests of the signing public key.
//! The transport session layer adds no authentication of its own; the
//! per-message signature is the one binding.

use crate::types::{Hash, PeerId, PublicKey, Signature};
use pqcrypto_dilithium::dilithium3 as dilithium;
use pqcrypto_traits::sign::{DetachedSignature, PublicKey as PkTrait};
use sha3::{Digest, Sha3_256};
use thiserror::Error;

pub const MLDSA65_PUBKEY_SIZE: usize = 1952;
pub const MLDSA65_SIG_SIZE: usize = 3293;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid public key")]
    InvalidPublicKey,
}

pub struct Keypair {
    pub public: PublicKey,
    secret: dilithium::SecretKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let (pk, sk) = dilithium::keypair();
        Self {
            public: pk.as_bytes().to_vec(),
            secret: sk,
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = dilithium::detached_sign(message, &self.secret);
        sig.as_bytes().to_vec()
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn peer_id(&self) -> PeerId {
        peer_id_for(&self.public)
    }
}

pub fn verify(pubkey: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let pk = dilithium::PublicKey::from_bytes(pubkey).map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig = dilithium::DetachedSignature::from_bytes(signature)
        .map_err(|_| CryptoError::InvalidSignature)?;
    dilithium::verify_detached_signature(&sig, message, &pk)
        .map_err(|_| CryptoError::InvalidSignature)
}

pub fn sha3(data: &[u8]) -> Hash {
    Sha3_256::digest(data).into()
}

/// Derive the stable peer id from a public key.
pub fn peer_id_for(pubkey: &[u8]) -> PeerId {
    PeerId(sha3(pubkey))
}
