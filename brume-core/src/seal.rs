//! Sealed boxes over the suite group.
//!
//! Two shapes are needed by the protocol: a multi-recipient seal of a block
//! digest (every server independently recovers the same 32 bytes), and a
//! single-recipient seal of a group element (only the first server can open
//! the onion key point). Both are ElGamal with hashed key derivation, the
//! `hash(pk * r) ^ msg` construction common to OT implementations.

use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::suite::{Suite, DIGEST_LEN};

/// One 32-byte message sealed to N recipients with a single blinding scalar.
///
/// `shares[i]` is `g * r` (replicated so each recipient's pair stands alone on
/// the wire) and `blinded[i]` is `msg ^ H(pk_i * r)`.
pub struct MultiSealed<S: Suite> {
    pub shares: Vec<S::Point>,
    pub blinded: Vec<[u8; DIGEST_LEN]>,
}

/// Seal `msg` to every public key in `pks` under one fresh blinding scalar.
pub fn multi_seal<S: Suite, R: RngCore + CryptoRng>(
    pks: &[S::Point],
    msg: &[u8; DIGEST_LEN],
    rng: &mut R,
) -> MultiSealed<S> {
    let r = Zeroizing::new(S::random_scalar(rng));
    let share = S::mul_base(&r);
    let mut shares = Vec::with_capacity(pks.len());
    let mut blinded = Vec::with_capacity(pks.len());
    for pk in pks {
        let pad = S::hash(&S::marshal(&S::mul(pk, &r)));
        let mut c = *msg;
        for (byte, p) in c.iter_mut().zip(pad.iter()) {
            *byte ^= p;
        }
        shares.push(share.clone());
        blinded.push(c);
    }
    MultiSealed { shares, blinded }
}

/// Recipient side of [`multi_seal`]: recover the message with `sk`.
pub fn open<S: Suite>(sk: &S::Scalar, share: &S::Point, blinded: &[u8; DIGEST_LEN]) -> [u8; DIGEST_LEN] {
    let pad = S::hash(&S::marshal(&S::mul(share, sk)));
    let mut msg = *blinded;
    for (byte, p) in msg.iter_mut().zip(pad.iter()) {
        *byte ^= p;
    }
    msg
}

/// Seal a group element to one recipient: `(g * r, p + pk * r)`.
pub fn seal_point<S: Suite, R: RngCore + CryptoRng>(
    pk: &S::Point,
    p: &S::Point,
    rng: &mut R,
) -> (S::Point, S::Point) {
    let r = Zeroizing::new(S::random_scalar(rng));
    (S::mul_base(&r), S::add(p, &S::mul(pk, &r)))
}

/// Invert [`seal_point`] with the recipient secret: `dh2 - dh1 * sk`.
pub fn open_point<S: Suite>(sk: &S::Scalar, dh1: &S::Point, dh2: &S::Point) -> S::Point {
    S::sub(dh2, &S::mul(dh1, sk))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::Ristretto;
    use rand::rngs::OsRng;

    fn keypair() -> (<Ristretto as Suite>::Scalar, <Ristretto as Suite>::Point) {
        let sk = Ristretto::random_scalar(&mut OsRng);
        let pk = Ristretto::mul_base(&sk);
        (sk, pk)
    }

    #[test]
    fn every_recipient_recovers_the_message() {
        let keys: Vec<_> = (0..3).map(|_| keypair()).collect();
        let pks: Vec<_> = keys.iter().map(|(_, pk)| pk.clone()).collect();
        let msg = Ristretto::hash(b"audited digest");
        let sealed = multi_seal::<Ristretto, _>(&pks, &msg, &mut OsRng);
        assert_eq!(sealed.shares.len(), 3);
        for (i, (sk, _)) in keys.iter().enumerate() {
            let got = open::<Ristretto>(sk, &sealed.shares[i], &sealed.blinded[i]);
            assert_eq!(got, msg);
        }
    }

    #[test]
    fn wrong_key_recovers_garbage() {
        let (_, pk) = keypair();
        let (other_sk, _) = keypair();
        let msg = Ristretto::hash(b"secret");
        let sealed = multi_seal::<Ristretto, _>(std::slice::from_ref(&pk), &msg, &mut OsRng);
        let got = open::<Ristretto>(&other_sk, &sealed.shares[0], &sealed.blinded[0]);
        assert_ne!(got, msg);
    }

    #[test]
    fn point_seal_round_trip() {
        let (sk, pk) = keypair();
        let hidden = Ristretto::mul_base(&Ristretto::random_scalar(&mut OsRng));
        let (dh1, dh2) = seal_point::<Ristretto, _>(&pk, &hidden, &mut OsRng);
        assert_eq!(open_point::<Ristretto>(&sk, &dh1, &dh2), hidden);
    }

    #[test]
    fn onion_layers_peel_in_reverse_order() {
        // Uploader side: layer keys are eph_pk_i * r. Server side: each
        // server derives the same key as opener * eph_sk_i after recovering
        // the opener point, and peels in reverse order of application.
        let eph: Vec<_> = (0..3).map(|_| keypair()).collect();
        let r = Ristretto::random_scalar(&mut OsRng);
        let opener = Ristretto::mul_base(&r);

        let plain = vec![0x42u8; 256];
        let mut body = plain.clone();
        for (_, eph_pk) in &eph {
            let key = Ristretto::marshal(&Ristretto::mul(eph_pk, &r));
            Ristretto::keystream_xor(&key, &mut body).expect("layer applies");
        }
        assert_ne!(body, plain);
        for (eph_sk, _) in eph.iter().rev() {
            let key = Ristretto::marshal(&Ristretto::mul(&opener, eph_sk));
            Ristretto::keystream_xor(&key, &mut body).expect("layer peels");
        }
        assert_eq!(body, plain);
    }

}
