//! Sealed share custody
//!
//! [`SecretShareStore`] turns a [`MasterKey`] into three [`SecretShare`]s, each
//! sealed to one holder key and bound to its owner and index, and back again.
//!
//! Reconstruction opens every supplied share, checks its commitment, and drops
//! the ones that fail. Interpolation only ever sees verified shares; if fewer
//! than two survive the whole operation fails with
//! [`ShamirError::InvalidShare`].

use crate::shamir::{self, Share, SHARE_COUNT, THRESHOLD};
use crate::ShamirError;
use heirloom_core::memory::LockedBuffer;
use heirloom_core::{open_share, seal_share, HolderKey, HolderKeyRef, OwnerId, SealedShare};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

pub const MASTER_KEY_LEN: usize = 32;
pub const COMMITMENT_LEN: usize = 32;
pub const COMMITMENT_SALT_LEN: usize = 32;

const COMMITMENT_DOMAIN: &[u8] = b"heirloom/share-commitment/v1";
const UNLOCK_MARKER_DOMAIN: &[u8] = b"heirloom/unlock-marker/v1";

/// The vault master key. Lives in an mlocked buffer, wiped on drop.
pub struct MasterKey(LockedBuffer);

impl MasterKey {
    pub fn generate() -> Self {
        let mut buf = LockedBuffer::new(MASTER_KEY_LEN);
        rand::rngs::OsRng.fill_bytes(buf.as_mut_slice());
        Self(buf)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ShamirError> {
        if bytes.len() != MASTER_KEY_LEN {
            return Err(ShamirError::InvalidShare(format!(
                "reconstructed key is {} bytes, expected {}",
                bytes.len(),
                MASTER_KEY_LEN
            )));
        }
        Ok(Self(LockedBuffer::from_slice(bytes)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    /// A one-way marker proving the key was reconstructed for `owner`.
    ///
    /// Stored on unlock in place of the key itself.
    pub fn unlock_marker(&self, owner: &OwnerId) -> Result<String, ShamirError> {
        let mut mac = HmacSha256::new_from_slice(self.as_bytes())
            .map_err(|e| ShamirError::InvalidShare(e.to_string()))?;
        mac.update(UNLOCK_MARKER_DOMAIN);
        mac.update(owner.as_str().as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

/// Resolves a holder reference to the key its share is sealed with.
pub trait HolderKeys {
    fn holder_key(&self, holder: &HolderKeyRef) -> Option<HolderKey>;
}

impl HolderKeys for HashMap<HolderKeyRef, HolderKey> {
    fn holder_key(&self, holder: &HolderKeyRef) -> Option<HolderKey> {
        self.get(holder).cloned()
    }
}

/// One share at rest: sealed bytes plus the metadata needed to open and
/// check it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretShare {
    pub owner_id: OwnerId,
    pub index: u8,
    pub holder: HolderKeyRef,
    pub sealed: SealedShare,
    pub commitment: [u8; COMMITMENT_LEN],
}

/// The output of a split: three sealed shares and the per-vault salt their
/// commitments are keyed with.
#[derive(Debug, Clone)]
pub struct ShareSet {
    pub commitment_salt: [u8; COMMITMENT_SALT_LEN],
    pub shares: [SecretShare; SHARE_COUNT],
}

/// Splits and reconstructs master keys against a set of holder keys.
///
/// Each commitment is HMAC-SHA256 over the share, keyed with the per-vault
/// salt. The salt is stored next to the commitments (`owners.commitment_salt`),
/// so anyone who reads the database can test a guessed share against them.
/// The commitments are binding but only computationally hiding; the secrecy
/// of a share rests on its seal.
pub struct SecretShareStore<'k, K: HolderKeys + ?Sized> {
    keys: &'k K,
}

impl<'k, K: HolderKeys + ?Sized> SecretShareStore<'k, K> {
    pub fn new(keys: &'k K) -> Self {
        Self { keys }
    }

    /// Split `master` into three shares sealed to `holders` in index order.
    pub fn split(
        &self,
        owner: &OwnerId,
        master: &MasterKey,
        holders: &[HolderKeyRef; SHARE_COUNT],
    ) -> Result<ShareSet, ShamirError> {
        let holder_keys = holders
            .iter()
            .map(|h| {
                self.keys
                    .holder_key(h)
                    .ok_or_else(|| ShamirError::UnknownHolder(h.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut commitment_salt = [0u8; COMMITMENT_SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut commitment_salt);

        let plain = shamir::split(master.as_bytes())?;

        let mut sealed = Vec::with_capacity(SHARE_COUNT);
        for ((share, holder), key) in plain.iter().zip(holders.iter()).zip(holder_keys.iter()) {
            let aad = share_aad(owner, share.index);
            sealed.push(SecretShare {
                owner_id: owner.clone(),
                index: share.index,
                holder: holder.clone(),
                sealed: seal_share(key, &share.data, &aad)?,
                commitment: commitment(&commitment_salt, owner, share.index, &share.data)?,
            });
        }

        let shares: [SecretShare; SHARE_COUNT] = sealed
            .try_into()
            .map_err(|_| ShamirError::InvalidShare("split produced wrong share count".into()))?;

        log::debug!("Split master key for {} into {} shares", owner, SHARE_COUNT);
        Ok(ShareSet {
            commitment_salt,
            shares,
        })
    }

    /// Open one share and check its commitment.
    pub fn verify(
        &self,
        owner: &OwnerId,
        commitment_salt: &[u8],
        share: &SecretShare,
    ) -> Result<Share, ShamirError> {
        if &share.owner_id != owner {
            return Err(ShamirError::InvalidShare(format!(
                "share {} belongs to another vault",
                share.index
            )));
        }

        let key = self
            .keys
            .holder_key(&share.holder)
            .ok_or_else(|| ShamirError::UnknownHolder(share.holder.to_string()))?;

        let data = open_share(&key, &share.sealed, &share_aad(owner, share.index)).map_err(|_| {
            ShamirError::InvalidShare(format!("share {} failed authentication", share.index))
        })?;

        commitment_mac(commitment_salt, owner, share.index, &data)?
            .verify_slice(&share.commitment)
            .map_err(|_| {
                ShamirError::InvalidShare(format!("share {} commitment mismatch", share.index))
            })?;

        Ok(Share {
            index: share.index,
            data,
        })
    }

    /// Recover the master key from any two valid shares.
    ///
    /// Shares that fail to open or verify are skipped and logged. Fails if
    /// fewer than two distinct verified shares remain.
    pub fn reconstruct(
        &self,
        owner: &OwnerId,
        commitment_salt: &[u8],
        shares: &[SecretShare],
    ) -> Result<MasterKey, ShamirError> {
        let mut verified: Vec<Share> = Vec::with_capacity(THRESHOLD);

        for share in shares {
            if verified.len() == THRESHOLD {
                break;
            }
            if verified.iter().any(|v| v.index == share.index) {
                continue;
            }
            match self.verify(owner, commitment_salt, share) {
                Ok(plain) => verified.push(plain),
                Err(e) => log::warn!("Discarding share for {}: {}", owner, e),
            }
        }

        if verified.len() < THRESHOLD {
            return Err(ShamirError::InvalidShare(format!(
                "need {} verified shares, got {}",
                THRESHOLD,
                verified.len()
            )));
        }

        let secret = shamir::combine(&verified)?;
        MasterKey::from_slice(&secret)
    }
}

/// Associated data binding a sealed share to its vault and position
fn share_aad(owner: &OwnerId, index: u8) -> Vec<u8> {
    let owner = owner.as_str().as_bytes();
    let mut aad = Vec::with_capacity(4 + owner.len() + 1);
    aad.extend_from_slice(&(owner.len() as u32).to_be_bytes());
    aad.extend_from_slice(owner);
    aad.push(index);
    aad
}

fn commitment_mac(
    salt: &[u8],
    owner: &OwnerId,
    index: u8,
    data: &Zeroizing<Vec<u8>>,
) -> Result<HmacSha256, ShamirError> {
    let mut mac = HmacSha256::new_from_slice(salt)
        .map_err(|e| ShamirError::InvalidShare(e.to_string()))?;
    mac.update(COMMITMENT_DOMAIN);
    mac.update(&share_aad(owner, index));
    mac.update(data);
    Ok(mac)
}

fn commitment(
    salt: &[u8],
    owner: &OwnerId,
    index: u8,
    data: &Zeroizing<Vec<u8>>,
) -> Result<[u8; COMMITMENT_LEN], ShamirError> {
    Ok(commitment_mac(salt, owner, index, data)?
        .finalize()
        .into_bytes()
        .into())
}
