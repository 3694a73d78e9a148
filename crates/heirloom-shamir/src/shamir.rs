//! Fixed 2-of-3 Shamir secret sharing over GF(256)
//!
//! Each secret byte gets its own degree-1 polynomial `p(x) = s + c*x` with a
//! uniformly random slope `c`. Shares are `p(1)`, `p(2)`, `p(3)`.

use crate::gf256::{interpolate_at_zero, poly_eval};
use crate::ShamirError;
use rand::RngCore;
use std::fmt;
use zeroize::Zeroizing;

/// Shares needed to reconstruct
pub const THRESHOLD: usize = 2;

/// Shares produced by a split
pub const SHARE_COUNT: usize = 3;

/// A single plaintext share. Only ever lives in memory; at rest it is sealed.
#[derive(Clone, PartialEq, Eq)]
pub struct Share {
    /// Evaluation point, 1..=3
    pub index: u8,
    pub data: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for Share {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Share")
            .field("index", &self.index)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Split `secret` into three shares.
pub fn split(secret: &[u8]) -> Result<[Share; SHARE_COUNT], ShamirError> {
    if secret.is_empty() {
        return Err(ShamirError::EmptySecret);
    }

    let mut slopes = Zeroizing::new(vec![0u8; secret.len()]);
    rand::thread_rng().fill_bytes(&mut slopes);

    let share_at = |x: u8| Share {
        index: x,
        data: Zeroizing::new(
            secret
                .iter()
                .zip(slopes.iter())
                .map(|(&s, &c)| poly_eval(&[s, c], x))
                .collect(),
        ),
    };

    Ok([share_at(1), share_at(2), share_at(3)])
}

/// Reconstruct the secret from at least two shares.
///
/// Only the first two shares with distinct indices are used. Any share beyond
/// those does not participate.
pub fn combine(shares: &[Share]) -> Result<Zeroizing<Vec<u8>>, ShamirError> {
    let first = shares
        .first()
        .ok_or_else(|| ShamirError::InvalidShare("no shares supplied".into()))?;
    let second = shares
        .iter()
        .find(|s| s.index != first.index)
        .ok_or_else(|| {
            ShamirError::InvalidShare(format!(
                "need {} distinct shares, got 1",
                THRESHOLD
            ))
        })?;

    for share in [first, second] {
        if share.index == 0 || share.index as usize > SHARE_COUNT {
            return Err(ShamirError::InvalidShare(format!(
                "index {} out of range",
                share.index
            )));
        }
    }
    if first.data.len() != second.data.len() {
        return Err(ShamirError::InvalidShare("share lengths differ".into()));
    }
    if first.data.is_empty() {
        return Err(ShamirError::InvalidShare("empty share".into()));
    }

    let secret = first
        .data
        .iter()
        .zip(second.data.iter())
        .map(|(&a, &b)| interpolate_at_zero(&[(first.index, a), (second.index, b)]))
        .collect();

    Ok(Zeroizing::new(secret))
}
