//! Finite cyclic group 19 (NIST P-256) for SAE
//!
//! Scalars are 32 bytes big-endian, elements are the affine x || y
//! coordinates, 32 bytes each.

use hkdf::Hkdf;
use p256::elliptic_curve::group::Group;
use p256::elliptic_curve::hash2curve::{ExpandMsgXmd, GroupDigest};
use p256::elliptic_curve::ops::Reduce;
use p256::elliptic_curve::point::{AffineCoordinates, DecompressPoint};
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::elliptic_curve::{Field, PrimeField};
use p256::{AffinePoint, EncodedPoint, FieldBytes, NistP256, ProjectivePoint, Scalar, U256};
use rand::{CryptoRng, RngCore};
use sha2::Sha256;
use subtle::Choice;
use zeroize::Zeroizing;

use crate::error::{HandshakeError, Result};
use crate::suite::kdf::{mac_over, HmacSha256, KdfSha256, KeyDerivation};
use crate::types::MacAddr;

pub const GROUP_19: u16 = 19;
pub const SCALAR_LEN: usize = 32;
pub const ELEMENT_LEN: usize = 64;

/// Minimum hunting-and-pecking iterations, run in full whatever the
/// iteration that finds the element
const HUNT_ITERATIONS: u8 = 40;

const PRIME: [u8; 32] = [
    0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

const H2E_DST: &[u8] = b"SAE Hash to Element u1 P1 u2 P2";

/// Password element derivation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PweMethod {
    HuntingAndPecking,
    HashToElement,
}

fn crypto_err(context: &str) -> HandshakeError {
    HandshakeError::Crypto(context.to_string())
}

/// Hunting-and-pecking: try counters 1..=40, keep the first x that lies on
/// the curve, and take the y whose parity matches the seed
pub fn pwe_hunting_and_pecking(password: &[u8], a: MacAddr, b: MacAddr) -> Result<ProjectivePoint> {
    let mut key = [0u8; 12];
    key[..6].copy_from_slice(a.max(b).as_bytes());
    key[6..].copy_from_slice(a.min(b).as_bytes());

    let mut found: Option<AffinePoint> = None;
    for counter in 1..=HUNT_ITERATIONS {
        let seed = Zeroizing::new(mac_over::<HmacSha256>(&key, &[password, &[counter]])?);
        let value = KdfSha256.derive(&seed, "SAE Hunting and Pecking", &PRIME, 32)?;
        if value[..] >= PRIME[..] {
            continue;
        }
        let x = FieldBytes::clone_from_slice(&value);
        let odd = Choice::from(seed[31] & 1);
        let candidate: Option<AffinePoint> = AffinePoint::decompress(&x, odd).into();
        if found.is_none() {
            found = candidate;
        }
    }

    found
        .map(ProjectivePoint::from)
        .ok_or_else(|| crypto_err("no password element within the iteration bound"))
}

/// Password-dependent base point PT for hash-to-element
///
/// The seed is HKDF-Extract(salt = SSID, password); the point is the
/// SSWU random-oracle hash of the seed.
pub fn h2e_pt(password: &[u8], ssid: &[u8]) -> Result<ProjectivePoint> {
    let (seed, _) = Hkdf::<Sha256>::extract(Some(ssid), password);
    NistP256::hash_from_bytes::<ExpandMsgXmd<Sha256>>(&[&seed[..]], &[H2E_DST])
        .map_err(|_| crypto_err("hash to curve failed"))
}

/// PWE = val * PT with val = HKDF-Extract(0^32, max(A,B) || min(A,B)) mod r
pub fn pwe_from_pt(pt: &ProjectivePoint, a: MacAddr, b: MacAddr) -> Result<ProjectivePoint> {
    let mut macs = [0u8; 12];
    macs[..6].copy_from_slice(a.max(b).as_bytes());
    macs[6..].copy_from_slice(a.min(b).as_bytes());
    let (val, _) = Hkdf::<Sha256>::extract(Some(&[0u8; 32][..]), &macs);
    let mut scalar = <Scalar as Reduce<U256>>::reduce_bytes(&val);
    if bool::from(scalar.is_zero()) {
        scalar = Scalar::ONE;
    }
    let pwe = *pt * scalar;
    if bool::from(pwe.is_identity()) {
        return Err(crypto_err("password element is the identity"));
    }
    Ok(pwe)
}

/// Derive the password element for a peer pair
pub fn derive_pwe(
    method: PweMethod,
    password: &[u8],
    ssid: &[u8],
    a: MacAddr,
    b: MacAddr,
) -> Result<ProjectivePoint> {
    match method {
        PweMethod::HuntingAndPecking => pwe_hunting_and_pecking(password, a, b),
        PweMethod::HashToElement => pwe_from_pt(&h2e_pt(password, ssid)?, a, b),
    }
}

/// Uniform scalar in [2, r)
pub fn random_scalar<R: RngCore + CryptoRng + ?Sized>(rng: &mut R) -> Scalar {
    loop {
        let s = Scalar::random(&mut *rng);
        if !bool::from(s.is_zero()) && s != Scalar::ONE {
            return s;
        }
    }
}

pub fn encode_scalar(s: &Scalar) -> [u8; SCALAR_LEN] {
    s.to_repr().into()
}

/// Parse a peer scalar; it must lie in (1, r)
pub fn decode_scalar(bytes: &[u8]) -> Result<Scalar> {
    if bytes.len() != SCALAR_LEN {
        return Err(HandshakeError::SaeCommitRejected(format!(
            "scalar of {} bytes",
            bytes.len()
        )));
    }
    let repr = FieldBytes::clone_from_slice(bytes);
    let scalar: Option<Scalar> = Scalar::from_repr(repr).into();
    match scalar {
        Some(s) if !bool::from(s.is_zero()) && s != Scalar::ONE => Ok(s),
        _ => Err(HandshakeError::SaeCommitRejected("scalar out of range".to_string())),
    }
}

pub fn encode_element(p: &ProjectivePoint) -> Result<[u8; ELEMENT_LEN]> {
    let encoded = p.to_affine().to_encoded_point(false);
    match (encoded.x(), encoded.y()) {
        (Some(x), Some(y)) => {
            let mut out = [0u8; ELEMENT_LEN];
            out[..32].copy_from_slice(x);
            out[32..].copy_from_slice(y);
            Ok(out)
        }
        _ => Err(crypto_err("cannot encode the identity element")),
    }
}

/// Parse a peer element; it must be a valid point on the curve
pub fn decode_element(bytes: &[u8]) -> Result<ProjectivePoint> {
    if bytes.len() != ELEMENT_LEN {
        return Err(HandshakeError::SaeCommitRejected(format!(
            "element of {} bytes",
            bytes.len()
        )));
    }
    let encoded = EncodedPoint::from_affine_coordinates(
        FieldBytes::from_slice(&bytes[..32]),
        FieldBytes::from_slice(&bytes[32..]),
        false,
    );
    let point: Option<AffinePoint> = AffinePoint::from_encoded_point(&encoded).into();
    point
        .map(ProjectivePoint::from)
        .ok_or_else(|| HandshakeError::SaeCommitRejected("element not on the curve".to_string()))
}

/// x coordinate of a point, or an error for the identity
pub fn x_coordinate(p: &ProjectivePoint) -> Result<Zeroizing<[u8; 32]>> {
    if bool::from(p.is_identity()) {
        return Err(crypto_err("shared secret is the identity"));
    }
    Ok(Zeroizing::new(p.to_affine().x().into()))
}
