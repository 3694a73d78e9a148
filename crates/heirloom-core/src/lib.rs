//! Heirloom Core
//!
//! Shared identifiers and low-level primitives for the posthumous unlock
//! subsystem.
//!
//! # Share Sealing
//!
//! Every secret share is sealed to exactly one holder (owner device, trusted
//! contact, or escrow) with AES-256-GCM. The owner id and share index are bound
//! in as associated data, so a sealed share cannot be moved to another row.
//!
//! # Memory Hygiene
//!
//! The reconstructed master key only ever lives in a [`memory::LockedBuffer`],
//! which is mlocked while alive and zeroized on drop.

pub mod crypto;
pub mod ids;
pub mod memory;

pub use crypto::{open_share, seal_share, CryptoError, HolderKey, SealedShare};
pub use ids::{ContactId, HolderKeyRef, OwnerId};
