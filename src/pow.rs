//! Hash primitives and proof-of-work admission.
//!
//! Two rounds of SHA-512 ([`hash_chain`]) are used three ways: the frame
//! checksum, the inventory vector of an object, and the value a
//! proof-of-work target is evaluated on. The target search itself depends
//! on object size and age and is supplied from outside through
//! [`PowTarget`].

use std::time::Duration;

use ripemd::Ripemd160;
use sha2::{Digest, Sha512};

use crate::error::AdmissionError;
use crate::wire::message::{InventoryVector, Object};

/// Objects older than this are no longer advertised or accepted.
pub const MAX_OBJECT_AGE: Duration = Duration::from_secs(2 * 24 * 60 * 60);

/// How far in the future an object timestamp may be.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(3 * 60 * 60);

/// `SHA512(SHA512(bytes))`.
///
/// ```
/// let hash = bitmessage::pow::hash_chain(b"hello");
/// assert_eq!(hash[..4], [0x05, 0x92, 0xa1, 0x05]);
/// ```
pub fn hash_chain(bytes: &[u8]) -> [u8; 64] {
    let digest = Sha512::digest(Sha512::digest(bytes));

    let mut out = [0u8; 64];
    out.copy_from_slice(&digest);
    out
}

/// `RIPEMD160(SHA512(bytes))`, the short identifier used for address hashes.
pub fn bitmessage_hash(bytes: &[u8]) -> [u8; 20] {
    let digest = Ripemd160::digest(Sha512::digest(bytes));

    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// Frame checksum: the first 4 bytes of [`hash_chain`].
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = hash_chain(payload);
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Inputs a difficulty function derives its target from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DifficultyParams {
    /// Length of the object payload, nonce included.
    pub payload_len: usize,
    /// How old the object is according to its own timestamp.
    pub age: Duration,
}

/// Decides whether a proof-of-work nonce is good enough for an object.
///
/// `object_bytes` are the payload bytes the nonce commits to (everything
/// after the nonce). Implementations evaluate [`hash_chain`] against their
/// own target; any `Fn(u64, &[u8], &DifficultyParams) -> bool` works.
pub trait PowTarget {
    fn meets_target(&self, nonce: u64, object_bytes: &[u8], params: &DifficultyParams) -> bool;
}

impl<F> PowTarget for F
where
    F: Fn(u64, &[u8], &DifficultyParams) -> bool,
{
    fn meets_target(&self, nonce: u64, object_bytes: &[u8], params: &DifficultyParams) -> bool {
        self(nonce, object_bytes, params)
    }
}

/// Gatekeeper for network objects.
pub struct ObjectAdmission<T> {
    target: T,
    max_age: Duration,
    max_skew: Duration,
}

impl<T: PowTarget> ObjectAdmission<T> {
    pub fn new(target: T) -> Self {
        Self {
            target,
            max_age: MAX_OBJECT_AGE,
            max_skew: MAX_CLOCK_SKEW,
        }
    }

    /// Checks freshness and proof of work of `object`, decoded from
    /// `payload`, at UNIX time `now`. Returns the object's inventory vector.
    pub fn admit(
        &self,
        payload: &[u8],
        object: &Object,
        now: u64,
    ) -> Result<InventoryVector, AdmissionError> {
        let time = u64::from(object.time);

        if time > now + self.max_skew.as_secs() {
            return Err(AdmissionError::FromFuture {
                ahead_secs: time - now,
            });
        }

        let age_secs = now.saturating_sub(time);
        if age_secs > self.max_age.as_secs() {
            return Err(AdmissionError::Expired {
                age_secs,
                max_secs: self.max_age.as_secs(),
            });
        }

        let params = DifficultyParams {
            payload_len: payload.len(),
            age: Duration::from_secs(age_secs),
        };
        let committed = payload.get(8..).unwrap_or_default();

        if !self
            .target
            .meets_target(object.pow_nonce, committed, &params)
        {
            return Err(AdmissionError::InsufficientWork);
        }

        Ok(InventoryVector::of(payload))
    }
}
