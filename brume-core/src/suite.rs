//! Cipher suite seam: prime-order group, hash, and CTR keystream.
//!
//! The protocol only ever touches the group through this trait, so the
//! concrete primitives can be swapped without touching the round logic. The
//! default [`Ristretto`] suite pairs curve25519 Ristretto points with SHA-256
//! and an AES-256-CTR keystream.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::Error;

type Aes256Ctr = Ctr128BE<Aes256>;

/// Content hashes and sealed digests are this long.
pub const DIGEST_LEN: usize = 32;

/// Keystream keys consume this many bytes of a serialized point.
pub const KEY_LEN: usize = 32;

/// Group, hash, and keystream operations the protocol is parametric in.
pub trait Suite: Send + Sync + 'static {
    type Scalar: Clone + Zeroize + Send + Sync + 'static;
    type Point: Clone + PartialEq + Send + Sync + 'static;

    /// Serialized point size. Chain states and PIR masks share it.
    const POINT_LEN: usize;

    fn random_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> Self::Scalar;
    fn mul_base(s: &Self::Scalar) -> Self::Point;
    fn mul(p: &Self::Point, s: &Self::Scalar) -> Self::Point;
    fn add(a: &Self::Point, b: &Self::Point) -> Self::Point;
    fn sub(a: &Self::Point, b: &Self::Point) -> Self::Point;

    fn marshal(p: &Self::Point) -> Vec<u8>;

    /// Strict decode: wrong length or a non-canonical encoding is an error.
    fn unmarshal(bytes: &[u8]) -> Result<Self::Point, Error>;

    fn hash(data: &[u8]) -> [u8; DIGEST_LEN];

    /// XOR `buf` with the keystream keyed by the first [`KEY_LEN`] bytes of
    /// `key`. Deterministic given (key, len); applying it twice restores the
    /// input.
    fn keystream_xor(key: &[u8], buf: &mut [u8]) -> Result<(), Error>;

    /// First `len` keystream bytes under `key`.
    fn keystream(key: &[u8], len: usize) -> Result<Vec<u8>, Error> {
        let mut out = vec![0u8; len];
        Self::keystream_xor(key, &mut out)?;
        Ok(out)
    }
}

/// Default suite: Ristretto group, SHA-256, AES-256-CTR.
pub struct Ristretto;

impl Suite for Ristretto {
    type Scalar = Scalar;
    type Point = RistrettoPoint;

    const POINT_LEN: usize = 32;

    fn random_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> Scalar {
        Scalar::random(rng)
    }

    fn mul_base(s: &Scalar) -> RistrettoPoint {
        RistrettoPoint::mul_base(s)
    }

    fn mul(p: &RistrettoPoint, s: &Scalar) -> RistrettoPoint {
        p * s
    }

    fn add(a: &RistrettoPoint, b: &RistrettoPoint) -> RistrettoPoint {
        a + b
    }

    fn sub(a: &RistrettoPoint, b: &RistrettoPoint) -> RistrettoPoint {
        a - b
    }

    fn marshal(p: &RistrettoPoint) -> Vec<u8> {
        p.compress().to_bytes().to_vec()
    }

    fn unmarshal(bytes: &[u8]) -> Result<RistrettoPoint, Error> {
        let compressed =
            CompressedRistretto::from_slice(bytes).map_err(|_| Error::LengthMismatch {
                expected: Self::POINT_LEN,
                actual: bytes.len(),
            })?;
        compressed.decompress().ok_or(Error::MalformedPoint)
    }

    fn hash(data: &[u8]) -> [u8; DIGEST_LEN] {
        Sha256::digest(data).into()
    }

    fn keystream_xor(key: &[u8], buf: &mut [u8]) -> Result<(), Error> {
        if key.len() < KEY_LEN {
            return Err(Error::ShortKey(key.len()));
        }
        let mut aes_key = [0u8; KEY_LEN];
        aes_key.copy_from_slice(&key[..KEY_LEN]);
        let iv = [0u8; 16];
        let mut cipher = Aes256Ctr::new(&aes_key.into(), &iv.into());
        cipher.apply_keystream(buf);
        Ok(())
    }
}
