//! Heirloom vault: persistent unlock coordination
//!
//! SQLite-backed components for the posthumous unlock of a vault:
//! - [`CheckInScheduler`]: owner check-ins and the missed-check-in sweep
//! - [`TrustedContactQuorum`]: contact enrollment and death verification votes
//! - [`UnlockCoordinator`]: the versioned state transitions and final unlock
//! - [`LegacyTokenLedger`]: bearer tokens redeemable once the vault is unlocked
//!
//! Components hold no database handle of their own. Each call takes the
//! connection it should use, and every write runs in one immediate
//! transaction. [`VaultService`] bundles a connection with the components for
//! callers that want a single entry point.

pub mod audit;
pub mod contacts;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod idempotency;
pub mod keyring;
pub mod ledger;
pub mod outbox;
pub mod owners;
pub mod quorum;
pub mod scheduler;
pub mod service;

pub use contacts::TrustedContact;
pub use coordinator::{UnlockCoordinator, UnlockOutcome, UnlockSweep};
pub use error::{DenyReason, Result, VaultError};
pub use keyring::{FileKeyring, MemoryKeyring, SharedKeyring};
pub use ledger::{AccessGrant, AccessScope, IssuedToken, LegacyTokenLedger};
pub use outbox::OutboxMessage;
pub use owners::{CheckInHistory, ProvisionReceipt, ProvisionRequest, UnlockStatus};
pub use quorum::{TrustedContactQuorum, VerificationOutcome};
pub use scheduler::{CheckInReceipt, CheckInScheduler, Shard, SweepReport};
pub use service::{MaintenanceReport, VaultService};
