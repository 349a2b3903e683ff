//! Node identity and signing keys using CRYSTALS-Dilithium.
//!
//! Dilithium3 provides NIST security level 3, which is ample for checkpoint
//! and proposal signatures. Keys are wrapped so the rest of the crate only
//! ever sees opaque, size-validated byte containers; the node identity
//! [`NodeId`] is the fingerprint of the signing public key.

use pqcrypto_dilithium::dilithium3;
use pqcrypto_traits::sign::{
    DetachedSignature as SigTrait, PublicKey as PkTrait, SecretKey as SkTrait,
};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::Hash;

// Expected sizes for validation during deserialization
const DILITHIUM3_PK_BYTES: usize = 1952;
pub(crate) const DILITHIUM3_SIG_BYTES: usize = 3309;

/// A node identity: fingerprint of the signing public key, hex-rendered
/// externally.
pub type NodeId = Hash;

/// A Dilithium3 signing public key (1952 bytes).
///
/// Inner bytes are `pub(crate)` to prevent external construction of
/// unvalidated keys. Use [`NodeKeypair::generate`] or deserialization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodePublicKey(pub(crate) Vec<u8>);

/// A Dilithium3 signing secret key.
///
/// Inner bytes are `pub(crate)` so external crates cannot read or construct
/// secret keys directly; the bytes are wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct NodeSecretKey(pub(crate) Vec<u8>);

/// A Dilithium3 detached signature (3293 bytes).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(pub(crate) Vec<u8>);

impl Signature {
    /// Create an empty signature (genesis blocks only).
    pub fn empty() -> Self {
        Signature(vec![])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
        // Empty signatures are allowed (genesis); anything else must be
        // exactly one Dilithium3 signature to bound allocations.
        if !bytes.is_empty() && bytes.len() != DILITHIUM3_SIG_BYTES {
            return Err(serde::de::Error::custom(format!(
                "invalid Dilithium3 signature: expected {} bytes, got {}",
                DILITHIUM3_SIG_BYTES,
                bytes.len()
            )));
        }
        Ok(Signature(bytes))
    }
}

/// A Dilithium3 signing keypair.
///
/// `Clone` because the keypair is shared between the round machinery and the
/// snapshot service; the secret half is zeroized on drop.
#[derive(Clone)]
pub struct NodeKeypair {
    pub public: NodePublicKey,
    pub secret: NodeSecretKey,
}

impl NodeKeypair {
    /// Generate a new random Dilithium3 keypair.
    pub fn generate() -> Self {
        let (pk, sk) = dilithium3::keypair();
        NodeKeypair {
            public: NodePublicKey(pk.as_bytes().to_vec()),
            secret: NodeSecretKey(sk.as_bytes().to_vec()),
        }
    }

    /// Sign a message, producing a detached signature.
    ///
    /// A corrupted secret key yields an empty signature (which never
    /// verifies) rather than a panic.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sk = match dilithium3::SecretKey::from_bytes(&self.secret.0) {
            Ok(sk) => sk,
            Err(_) => {
                tracing::error!("NodeKeypair::sign called with corrupted secret key");
                return Signature::empty();
            }
        };
        let sig = dilithium3::detached_sign(message, &sk);
        Signature(sig.as_bytes().to_vec())
    }

    /// Reconstruct a keypair from raw bytes, validating sizes.
    pub fn from_bytes(public: Vec<u8>, secret: Vec<u8>) -> Option<Self> {
        dilithium3::PublicKey::from_bytes(&public).ok()?;
        dilithium3::SecretKey::from_bytes(&secret).ok()?;
        Some(NodeKeypair {
            public: NodePublicKey(public),
            secret: NodeSecretKey(secret),
        })
    }

    /// The node identity derived from this keypair.
    pub fn id(&self) -> NodeId {
        self.public.fingerprint()
    }
}

impl NodePublicKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Verify a detached signature over a message.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let pk = match dilithium3::PublicKey::from_bytes(&self.0) {
            Ok(pk) => pk,
            Err(_) => return false,
        };
        let sig = match dilithium3::DetachedSignature::from_bytes(&signature.0) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        dilithium3::verify_detached_signature(&sig, message, &pk).is_ok()
    }

    /// 32-byte fingerprint used as the node identity.
    pub fn fingerprint(&self) -> Hash {
        crate::hash_domain(b"parhelion.node.id", &self.0)
    }
}

impl Serialize for NodePublicKey {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for NodePublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
        if bytes.len() != DILITHIUM3_PK_BYTES {
            return Err(serde::de::Error::custom(format!(
                "invalid Dilithium3 public key: expected {} bytes, got {}",
                DILITHIUM3_PK_BYTES,
                bytes.len()
            )));
        }
        Ok(NodePublicKey(bytes))
    }
}
