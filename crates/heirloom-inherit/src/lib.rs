//! Heirloom Inherit Module
//!
//! The rules of the posthumous unlock, with no I/O.
//!
//! # Lifecycle
//!
//! ```text
//! Alive --[missed >= threshold]--> Escalation --[2 of 3 contacts]--> PendingUnlock
//!   ^                                  |                                   |
//!   +----------- owner check-in -------+-----------------------------------+
//!                                                                          |
//!                                               [grace period elapsed]     v
//!                                                                      Unlocked
//! ```
//!
//! - [`policy`]: validated per-vault timing policy
//! - [`state`]: states, triggers and the transition table
//! - [`heartbeat`]: missed check-in arithmetic and reminder ladder
//! - [`quorum`]: trusted-contact vote tally
//! - [`events`]: what the coordinator emits when a transition commits
//!
//! Persistence, concurrency control and notification delivery live in
//! `heirloom-vault`.

pub mod events;
pub mod heartbeat;
pub mod policy;
pub mod quorum;
pub mod state;

pub use events::{NotificationKind, VaultEvent};
pub use policy::{PolicyError, UnlockPolicy};
pub use quorum::{Assertion, QuorumProgress, Vote};
pub use state::{CheckInSource, TransitionError, Trigger, VaultState, VaultUnlockState};
