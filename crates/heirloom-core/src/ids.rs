//! Strongly-typed identifiers
//!
//! Owners, contacts and holder keys are all plain strings on the wire and in
//! SQLite, but mixing them up in code is a bug, so each gets a newtype.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Vault owner identifier
    OwnerId
);

string_id!(
    /// Trusted contact identifier
    ContactId
);

string_id!(
    /// Reference to the key a share is sealed to.
    ///
    /// Resolved to an actual [`crate::HolderKey`] by a keyring; the reference
    /// itself carries no key material.
    HolderKeyRef
);
