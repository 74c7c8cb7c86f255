//! Per-server secret chains for PIR blinding and response unblinding.
//!
//! Each server shares two S-byte states with the client, seeded from the
//! setup Diffie-Hellman outputs. After every successful download both sides
//! step each state by rekeying the keystream with the state's current bytes,
//! so chains stay in lock-step round for round. Skipping or repeating an
//! advance desynchronizes the pair permanently; the chains are therefore
//! owned by the download path alone and handed out immutably everywhere else.

use std::marker::PhantomData;

use crate::error::Error;
use crate::mask::{one_hot, xor_into};
use crate::suite::Suite;

pub struct SecretChains<S: Suite> {
    masks: Vec<Vec<u8>>,
    secrets: Vec<Vec<u8>>,
    _suite: PhantomData<S>,
}

impl<S: Suite> SecretChains<S> {
    /// Build chains from per-server DH seeds. Both lists must hold one
    /// S-byte state per server.
    pub fn from_seeds(masks: Vec<Vec<u8>>, secrets: Vec<Vec<u8>>) -> Result<Self, Error> {
        if masks.len() != secrets.len() || masks.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "chain seed counts disagree: {} masks, {} secrets",
                masks.len(),
                secrets.len()
            )));
        }
        for state in masks.iter().chain(secrets.iter()) {
            if state.len() != S::POINT_LEN {
                return Err(Error::LengthMismatch {
                    expected: S::POINT_LEN,
                    actual: state.len(),
                });
            }
        }
        Ok(Self {
            masks,
            secrets,
            _suite: PhantomData,
        })
    }

    pub fn server_count(&self) -> usize {
        self.masks.len()
    }

    pub fn masks(&self) -> &[Vec<u8>] {
        &self.masks
    }

    pub fn secrets(&self) -> &[Vec<u8>] {
        &self.secrets
    }

    /// The PIR query for `slot`: XOR of every non-home mask with the one-hot
    /// slot vector folded in. The home server applies this directly; the
    /// remaining mask terms cancel against the other servers' contributions.
    pub fn pir_query(&self, home: usize, slot: usize) -> Result<Vec<u8>, Error> {
        if home >= self.masks.len() {
            return Err(Error::InvalidConfig(format!(
                "home index {home} out of range for {} servers",
                self.masks.len()
            )));
        }
        let mut query = one_hot(slot, S::POINT_LEN)?;
        for (i, mask) in self.masks.iter().enumerate() {
            if i != home {
                xor_into(&mut query, mask)?;
            }
        }
        Ok(query)
    }

    /// One-time pad over a `len`-byte response: XOR of every secret state
    /// expanded through the keystream.
    pub fn pad(&self, len: usize) -> Result<Vec<u8>, Error> {
        let mut pad = vec![0u8; len];
        for secret in &self.secrets {
            xor_into(&mut pad, &S::keystream(secret, len)?)?;
        }
        Ok(pad)
    }

    /// Step every chain once. Call exactly once per successful download; the
    /// home server performs the identical advance.
    pub fn advance(&mut self) -> Result<(), Error> {
        for state in self.masks.iter_mut().chain(self.secrets.iter_mut()) {
            *state = S::keystream(state, state.len())?;
        }
        Ok(())
    }
}
