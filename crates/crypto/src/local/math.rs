//! Curve arithmetic behind the local provider.
//!
//! Shares are additive: player `i` holds `d_i` and the group key is
//! `Q = Σ d_i·G`. Nonces are derived deterministically from the transcript
//! so that every player agrees on `R` without extra rounds. The resulting
//! signatures are algebraically valid ECDSA / Ed25519 signatures under `Q`.

use crate::error::{CryptoError, CryptoResult};
use crate::provider::{EcdsaSignature, EddsaSignature};
use mpc_types::Algorithm;
use sha2::{Digest, Sha256, Sha512};
use std::collections::BTreeMap;

const SHARE_TAG: &[u8] = b"mpc-share-v1";
const ECDSA_NONCE_TAG: &[u8] = b"mpc-ecdsa-nonce-v1";
const EDDSA_NONCE_TAG: &[u8] = b"mpc-eddsa-nonce-v1";

pub fn hash256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Deterministic 32-byte share seed for `(key_id, player_id)`. Reduction
/// into the scalar field happens per curve.
pub fn derive_share(key_id: &str, player_id: u64) -> [u8; 32] {
    hash256(&[SHARE_TAG, key_id.as_bytes(), &player_id.to_le_bytes()])
}

fn stark_unsupported() -> CryptoError {
    CryptoError::InvalidAlgorithm("ECDSA_STARK is not supported by the local provider".to_string())
}

macro_rules! ecdsa_curve_ops {
    ($name:ident, $curve:ident) => {
        mod $name {
            use super::*;
            use $curve::elliptic_curve::ops::Reduce;
            use $curve::elliptic_curve::scalar::IsHigh;
            use $curve::elliptic_curve::sec1::ToEncodedPoint;
            use $curve::elliptic_curve::Field;
            use $curve::{FieldBytes, ProjectivePoint, PublicKey, Scalar, U256};

            pub fn scalar(bytes: &[u8; 32]) -> Scalar {
                <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::from(*bytes))
            }

            pub fn public_share(share: &[u8; 32]) -> Vec<u8> {
                let point = ProjectivePoint::GENERATOR * scalar(share);
                point.to_affine().to_encoded_point(true).as_bytes().to_vec()
            }

            pub fn decode_point(bytes: &[u8]) -> CryptoResult<ProjectivePoint> {
                let key = PublicKey::from_sec1_bytes(bytes).map_err(|_| {
                    CryptoError::ProofVerification("malformed curve point".to_string())
                })?;
                Ok(key.to_projective())
            }

            pub fn sum_points<'a>(
                points: impl Iterator<Item = &'a Vec<u8>>,
            ) -> CryptoResult<Vec<u8>> {
                let mut acc = ProjectivePoint::IDENTITY;
                for bytes in points {
                    acc += decode_point(bytes)?;
                }
                if acc == ProjectivePoint::IDENTITY {
                    return Err(CryptoError::Internal(
                        "aggregated public key is the identity".to_string(),
                    ));
                }
                Ok(acc.to_affine().to_encoded_point(true).as_bytes().to_vec())
            }

            struct Nonce {
                k: Scalar,
                r: Scalar,
                odd_y: bool,
            }

            fn nonce(key_id: &str, tx_id: &str) -> CryptoResult<Nonce> {
                let seed = hash256(&[ECDSA_NONCE_TAG, key_id.as_bytes(), tx_id.as_bytes()]);
                let k = scalar(&seed);
                if bool::from(k.is_zero()) {
                    return Err(CryptoError::Internal("degenerate nonce".to_string()));
                }
                let point = (ProjectivePoint::GENERATOR * k).to_affine();
                let uncompressed = point.to_encoded_point(false);
                let x = uncompressed.x().ok_or_else(|| {
                    CryptoError::Internal("nonce point at infinity".to_string())
                })?;
                let r = <Scalar as Reduce<U256>>::reduce_bytes(x);
                if bool::from(r.is_zero()) {
                    return Err(CryptoError::Internal("degenerate nonce x".to_string()));
                }
                let odd_y = point.to_encoded_point(true).as_bytes()[0] == 0x03;
                Ok(Nonce { k, r, odd_y })
            }

            /// `s_i = k⁻¹ · (z·m⁻¹ + r·d_i)` so that `Σ s_i = k⁻¹(z + r·d)`.
            pub fn partial(
                key_id: &str,
                tx_id: &str,
                message_hash: &[u8; 32],
                share: &[u8; 32],
                player_count: u64,
            ) -> CryptoResult<[u8; 32]> {
                let nonce = nonce(key_id, tx_id)?;
                let k_inv = Option::<Scalar>::from(nonce.k.invert()).ok_or_else(|| {
                    CryptoError::Internal("nonce not invertible".to_string())
                })?;
                let m_inv = Option::<Scalar>::from(Scalar::from(player_count).invert())
                    .ok_or_else(|| {
                        CryptoError::Internal("player count not invertible".to_string())
                    })?;
                let z = scalar(message_hash);
                let d = scalar(share);
                let s_i = k_inv * (z * m_inv + nonce.r * d);
                Ok(s_i.to_bytes().into())
            }

            pub fn combine(
                key_id: &str,
                tx_id: &str,
                partials: &BTreeMap<u64, [u8; 32]>,
            ) -> CryptoResult<EcdsaSignature> {
                let nonce = nonce(key_id, tx_id)?;
                let mut s = Scalar::ZERO;
                for bytes in partials.values() {
                    s += scalar(bytes);
                }
                if bool::from(s.is_zero()) {
                    return Err(CryptoError::Internal("zero signature scalar".to_string()));
                }
                let mut v: u8 = if nonce.odd_y { 1 } else { 0 };
                if bool::from(s.is_high()) {
                    s = -s;
                    v ^= 1;
                }
                Ok(EcdsaSignature {
                    r: nonce.r.to_bytes().into(),
                    s: s.to_bytes().into(),
                    v,
                })
            }

            /// Textbook verification: x(`z·s⁻¹·G + r·s⁻¹·Q`) ≡ r (mod n).
            pub fn verify(
                message_hash: &[u8; 32],
                public_key: &[u8],
                signature: &EcdsaSignature,
            ) -> CryptoResult<()> {
                let r = scalar(&signature.r);
                let s = scalar(&signature.s);
                if bool::from(r.is_zero()) || bool::from(s.is_zero()) {
                    return Err(CryptoError::ProofVerification(
                        "zero signature component".to_string(),
                    ));
                }
                let s_inv = Option::<Scalar>::from(s.invert()).ok_or_else(|| {
                    CryptoError::ProofVerification("signature scalar not invertible".to_string())
                })?;
                let z = scalar(message_hash);
                let q = decode_point(public_key)?;
                let point =
                    (ProjectivePoint::GENERATOR * (z * s_inv) + q * (r * s_inv)).to_affine();
                let encoded = point.to_encoded_point(false);
                let x = encoded.x().ok_or_else(|| {
                    CryptoError::ProofVerification("verification point at infinity".to_string())
                })?;
                let x_reduced = <Scalar as Reduce<U256>>::reduce_bytes(x);
                if x_reduced != r {
                    return Err(CryptoError::ProofVerification(
                        "signature does not verify".to_string(),
                    ));
                }
                Ok(())
            }
        }
    };
}

ecdsa_curve_ops!(secp256k1_ops, k256);
ecdsa_curve_ops!(secp256r1_ops, p256);

mod ed25519_ops {
    use super::*;
    use curve25519_dalek::constants::ED25519_BASEPOINT_POINT;
    use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
    use curve25519_dalek::scalar::Scalar;
    use curve25519_dalek::traits::Identity;

    pub fn scalar(bytes: &[u8; 32]) -> Scalar {
        Scalar::from_bytes_mod_order(*bytes)
    }

    pub fn public_share(share: &[u8; 32]) -> Vec<u8> {
        (ED25519_BASEPOINT_POINT * scalar(share))
            .compress()
            .to_bytes()
            .to_vec()
    }

    pub fn decode_point(bytes: &[u8]) -> CryptoResult<EdwardsPoint> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            CryptoError::ProofVerification("edwards point must be 32 bytes".to_string())
        })?;
        CompressedEdwardsY(arr)
            .decompress()
            .ok_or_else(|| CryptoError::ProofVerification("malformed edwards point".to_string()))
    }

    pub fn sum_points<'a>(points: impl Iterator<Item = &'a Vec<u8>>) -> CryptoResult<[u8; 32]> {
        let mut acc = EdwardsPoint::identity();
        for bytes in points {
            acc += decode_point(bytes)?;
        }
        if acc == EdwardsPoint::identity() {
            return Err(CryptoError::Internal(
                "aggregated point is the identity".to_string(),
            ));
        }
        Ok(acc.compress().to_bytes())
    }

    pub fn nonce_scalar(key_id: &str, tx_id: &str, player_id: u64, message: &[u8]) -> Scalar {
        let mut hasher = Sha512::new();
        hasher.update(EDDSA_NONCE_TAG);
        hasher.update(key_id.as_bytes());
        hasher.update(tx_id.as_bytes());
        hasher.update(player_id.to_le_bytes());
        hasher.update(message);
        Scalar::from_bytes_mod_order_wide(&hasher.finalize().into())
    }

    pub fn nonce_point(nonce: &Scalar) -> [u8; 32] {
        (ED25519_BASEPOINT_POINT * nonce).compress().to_bytes()
    }

    /// Ed25519 challenge `c = SHA-512(R ‖ A ‖ M) mod ℓ`.
    pub fn challenge(aggregated_r: &[u8; 32], public_key: &[u8; 32], message: &[u8]) -> Scalar {
        let mut hasher = Sha512::new();
        hasher.update(aggregated_r);
        hasher.update(public_key);
        hasher.update(message);
        Scalar::from_bytes_mod_order_wide(&hasher.finalize().into())
    }

    pub fn partial(nonce: &Scalar, challenge: &Scalar, share: &[u8; 32]) -> [u8; 32] {
        (nonce + challenge * scalar(share)).to_bytes()
    }

    pub fn combine(
        aggregated_r: [u8; 32],
        partials: &BTreeMap<u64, [u8; 32]>,
    ) -> CryptoResult<EddsaSignature> {
        let mut s = Scalar::ZERO;
        for bytes in partials.values() {
            s += scalar(bytes);
        }
        Ok(EddsaSignature {
            r: aggregated_r,
            s: s.to_bytes(),
        })
    }

    /// Standard verification equation `s·B == R + c·A`.
    pub fn verify(
        message: &[u8],
        public_key: &[u8; 32],
        signature: &EddsaSignature,
    ) -> CryptoResult<()> {
        let s = scalar(&signature.s);
        let r_point = decode_point(&signature.r)?;
        let a_point = decode_point(public_key)?;
        let c = challenge(&signature.r, public_key, message);
        if ED25519_BASEPOINT_POINT * s != r_point + a_point * c {
            return Err(CryptoError::ProofVerification(
                "signature does not verify".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Algorithm-dispatched entry points
// ---------------------------------------------------------------------------

/// Encoded public share `d_i·G` for the algorithm's curve.
pub fn public_share(algorithm: Algorithm, share: &[u8; 32]) -> CryptoResult<Vec<u8>> {
    match algorithm {
        Algorithm::EcdsaSecp256k1 => Ok(secp256k1_ops::public_share(share)),
        Algorithm::EcdsaSecp256r1 => Ok(secp256r1_ops::public_share(share)),
        Algorithm::EddsaEd25519 => Ok(ed25519_ops::public_share(share)),
        Algorithm::EcdsaStark => Err(stark_unsupported()),
    }
}

/// Aggregate encoded public shares into the group public key.
pub fn aggregate_public_key(
    algorithm: Algorithm,
    public_shares: &BTreeMap<u64, Vec<u8>>,
) -> CryptoResult<Vec<u8>> {
    match algorithm {
        Algorithm::EcdsaSecp256k1 => secp256k1_ops::sum_points(public_shares.values()),
        Algorithm::EcdsaSecp256r1 => secp256r1_ops::sum_points(public_shares.values()),
        Algorithm::EddsaEd25519 => {
            ed25519_ops::sum_points(public_shares.values()).map(|bytes| bytes.to_vec())
        }
        Algorithm::EcdsaStark => Err(stark_unsupported()),
    }
}

/// Group public key recomputed from the deterministic shares of `player_ids`.
pub fn group_public_key(
    algorithm: Algorithm,
    key_id: &str,
    player_ids: &[u64],
) -> CryptoResult<Vec<u8>> {
    let mut shares = BTreeMap::new();
    for &player in player_ids {
        let seed = derive_share(key_id, player);
        shares.insert(player, public_share(algorithm, &seed)?);
    }
    aggregate_public_key(algorithm, &shares)
}

pub fn ecdsa_partial(
    algorithm: Algorithm,
    key_id: &str,
    tx_id: &str,
    message_hash: &[u8; 32],
    share: &[u8; 32],
    player_count: u64,
) -> CryptoResult<[u8; 32]> {
    match algorithm {
        Algorithm::EcdsaSecp256k1 => {
            secp256k1_ops::partial(key_id, tx_id, message_hash, share, player_count)
        }
        Algorithm::EcdsaSecp256r1 => {
            secp256r1_ops::partial(key_id, tx_id, message_hash, share, player_count)
        }
        Algorithm::EcdsaStark => Err(stark_unsupported()),
        Algorithm::EddsaEd25519 => Err(CryptoError::InvalidAlgorithm(
            "EDDSA_ED25519 is not an ECDSA algorithm".to_string(),
        )),
    }
}

pub fn ecdsa_combine(
    algorithm: Algorithm,
    key_id: &str,
    tx_id: &str,
    partials: &BTreeMap<u64, [u8; 32]>,
) -> CryptoResult<EcdsaSignature> {
    match algorithm {
        Algorithm::EcdsaSecp256k1 => secp256k1_ops::combine(key_id, tx_id, partials),
        Algorithm::EcdsaSecp256r1 => secp256r1_ops::combine(key_id, tx_id, partials),
        Algorithm::EcdsaStark => Err(stark_unsupported()),
        Algorithm::EddsaEd25519 => Err(CryptoError::InvalidAlgorithm(
            "EDDSA_ED25519 is not an ECDSA algorithm".to_string(),
        )),
    }
}

pub fn ecdsa_verify(
    algorithm: Algorithm,
    message_hash: &[u8; 32],
    public_key: &[u8],
    signature: &EcdsaSignature,
) -> CryptoResult<()> {
    match algorithm {
        Algorithm::EcdsaSecp256k1 => secp256k1_ops::verify(message_hash, public_key, signature),
        Algorithm::EcdsaSecp256r1 => secp256r1_ops::verify(message_hash, public_key, signature),
        Algorithm::EcdsaStark => Err(stark_unsupported()),
        Algorithm::EddsaEd25519 => Err(CryptoError::InvalidAlgorithm(
            "EDDSA_ED25519 is not an ECDSA algorithm".to_string(),
        )),
    }
}

pub use ed25519_ops::{
    challenge as eddsa_challenge, combine as eddsa_combine, nonce_point as eddsa_nonce_point,
    nonce_scalar as eddsa_nonce_scalar, partial as eddsa_partial, verify as eddsa_verify,
};

/// Aggregate the revealed EdDSA nonce points.
pub fn eddsa_aggregate_r(rs: &BTreeMap<u64, Vec<u8>>) -> CryptoResult<[u8; 32]> {
    ed25519_ops::sum_points(rs.values())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_derivation_is_deterministic() {
        assert_eq!(derive_share("k1", 0), derive_share("k1", 0));
        assert_ne!(derive_share("k1", 0), derive_share("k1", 1));
        assert_ne!(derive_share("k1", 0), derive_share("k2", 0));
    }

    #[test]
    fn test_public_share_shapes() {
        let share = derive_share("k1", 0);
        let k1 = public_share(Algorithm::EcdsaSecp256k1, &share).unwrap();
        assert_eq!(k1.len(), 33);
        let r1 = public_share(Algorithm::EcdsaSecp256r1, &share).unwrap();
        assert_eq!(r1.len(), 33);
        let ed = public_share(Algorithm::EddsaEd25519, &share).unwrap();
        assert_eq!(ed.len(), 32);
        assert!(public_share(Algorithm::EcdsaStark, &share).is_err());
    }

    #[test]
    fn test_ecdsa_distributed_signature_verifies() {
        let algorithm = Algorithm::EcdsaSecp256k1;
        let players = [0u64, 1, 2];
        let message_hash = hash256(&[b"transfer 1 BTC"]);

        let mut partials = BTreeMap::new();
        for &player in &players {
            let share = derive_share("k1", player);
            let s_i = ecdsa_partial(
                algorithm,
                "k1",
                "tx1",
                &message_hash,
                &share,
                players.len() as u64,
            )
            .unwrap();
            partials.insert(player, s_i);
        }

        let signature = ecdsa_combine(algorithm, "k1", "tx1", &partials).unwrap();
        assert!(signature.v <= 1);

        let public_key = group_public_key(algorithm, "k1", &players).unwrap();
        ecdsa_verify(algorithm, &message_hash, &public_key, &signature).unwrap();

        // Cross-check against the RustCrypto verifier.
        use k256::ecdsa::signature::hazmat::PrehashVerifier;
        let verifying_key = k256::ecdsa::VerifyingKey::from_sec1_bytes(&public_key).unwrap();
        let sig = k256::ecdsa::Signature::from_scalars(signature.r, signature.s).unwrap();
        verifying_key.verify_prehash(&message_hash, &sig).unwrap();
    }

    #[test]
    fn test_ecdsa_p256_signature_verifies() {
        let algorithm = Algorithm::EcdsaSecp256r1;
        let players = [3u64, 7];
        let message_hash = hash256(&[b"p256 message"]);

        let mut partials = BTreeMap::new();
        for &player in &players {
            let share = derive_share("key-r1", player);
            partials.insert(
                player,
                ecdsa_partial(algorithm, "key-r1", "tx9", &message_hash, &share, 2).unwrap(),
            );
        }
        let signature = ecdsa_combine(algorithm, "key-r1", "tx9", &partials).unwrap();
        let public_key = group_public_key(algorithm, "key-r1", &players).unwrap();
        ecdsa_verify(algorithm, &message_hash, &public_key, &signature).unwrap();
    }

    #[test]
    fn test_ecdsa_tampered_signature_fails() {
        let algorithm = Algorithm::EcdsaSecp256k1;
        let players = [0u64, 1];
        let message_hash = hash256(&[b"msg"]);
        let mut partials = BTreeMap::new();
        for &player in &players {
            let share = derive_share("k1", player);
            partials.insert(
                player,
                ecdsa_partial(algorithm, "k1", "tx1", &message_hash, &share, 2).unwrap(),
            );
        }
        let mut signature = ecdsa_combine(algorithm, "k1", "tx1", &partials).unwrap();
        signature.s[31] ^= 0x01;
        let public_key = group_public_key(algorithm, "k1", &players).unwrap();
        assert!(ecdsa_verify(algorithm, &message_hash, &public_key, &signature).is_err());
    }

    #[test]
    fn test_eddsa_distributed_signature_verifies() {
        let players = [0u64, 1, 2];
        let message = b"solana transfer".to_vec();

        let mut rs = BTreeMap::new();
        let mut nonces = BTreeMap::new();
        for &player in &players {
            let nonce = eddsa_nonce_scalar("k-ed", "tx2", player, &message);
            rs.insert(player, eddsa_nonce_point(&nonce).to_vec());
            nonces.insert(player, nonce);
        }
        let aggregated_r = eddsa_aggregate_r(&rs).unwrap();

        let public_key_vec = group_public_key(Algorithm::EddsaEd25519, "k-ed", &players).unwrap();
        let public_key: [u8; 32] = public_key_vec.as_slice().try_into().unwrap();
        let challenge = eddsa_challenge(&aggregated_r, &public_key, &message);

        let mut partials = BTreeMap::new();
        for &player in &players {
            let share = derive_share("k-ed", player);
            partials.insert(player, eddsa_partial(&nonces[&player], &challenge, &share));
        }
        let signature = eddsa_combine(aggregated_r, &partials).unwrap();
        eddsa_verify(&message, &public_key, &signature).unwrap();

        // Cross-check with ed25519-dalek.
        let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&public_key).unwrap();
        let mut sig_bytes = [0u8; 64];
        sig_bytes[..32].copy_from_slice(&signature.r);
        sig_bytes[32..].copy_from_slice(&signature.s);
        let dalek_sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        use ed25519_dalek::Verifier;
        verifying_key.verify(&message, &dalek_sig).unwrap();
    }

    #[test]
    fn test_aggregate_public_key_order_independent() {
        let players = [5u64, 9, 2];
        let a = group_public_key(Algorithm::EcdsaSecp256k1, "k1", &players).unwrap();
        let b = group_public_key(Algorithm::EcdsaSecp256k1, "k1", &[2, 5, 9]).unwrap();
        assert_eq!(a, b);
    }
}
