//! Heirloom Shamir Module
//!
//! Splits a vault's 32-byte master key into three shares, any two of which
//! reconstruct it.
//!
//! # Share custody
//!
//! - Share 1 is sealed to the owner's own holder key
//! - Shares 2 and 3 are sealed to trusted contacts (or to the escrow key in
//!   self-only mode)
//! - Every share carries an HMAC commitment, checked before interpolation so a
//!   tampered share is dropped instead of silently producing a wrong key
//!
//! # Example
//!
//! ```
//! use heirloom_shamir::shamir::{combine, split};
//!
//! let secret = [0x42u8; 32];
//! let shares = split(&secret).unwrap();
//! let recovered = combine(&[shares[0].clone(), shares[2].clone()]).unwrap();
//! assert_eq!(&recovered[..], &secret[..]);
//! ```

pub mod gf256;
pub mod shamir;
pub mod shares;

pub use shamir::{combine, split, Share, SHARE_COUNT, THRESHOLD};
pub use shares::{HolderKeys, MasterKey, SecretShare, SecretShareStore, ShareSet};

use heirloom_core::CryptoError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShamirError {
    #[error("Empty secret")]
    EmptySecret,
    #[error("Invalid share: {0}")]
    InvalidShare(String),
    #[error("No key for share holder {0}")]
    UnknownHolder(String),
    #[error("Share sealing failed: {0}")]
    Sealing(#[from] CryptoError),
}
