//! Buyer and address records as returned by the catalog collaborator.
//!
//! Providers mask phone numbers in some fields and return the clear value
//! in others, so both record types carry an ordered candidate list instead
//! of a single phone field. The single `*` wildcard is the only masking
//! convention recognized; partial-length masks or alternative wildcard
//! characters are treated as ordinary (unusable) text.

use serde::{Deserialize, Serialize};

/// Wildcard character providers substitute for hidden digits.
pub const MASK_CHAR: char = '*';

/// Check whether a phone-like string contains masked digits.
#[must_use]
pub fn is_masked(value: &str) -> bool {
    value.contains(MASK_CHAR)
}

/// Identity record for a ticket buyer, immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buyer {
    /// Provider-assigned buyer id.
    pub id: String,

    /// Legal name on the identity record.
    pub name: String,

    /// Identity document number, possibly masked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_number: Option<String>,

    /// Phone-like strings in provider order; any entry may be masked.
    #[serde(default)]
    pub phone_candidates: Vec<String>,
}

/// Delivery record from the user's address book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Provider-assigned address id.
    pub id: String,

    /// Recipient name.
    pub name: String,

    /// Phone-like strings in provider order; any entry may be masked.
    #[serde(default)]
    pub phone_candidates: Vec<String>,

    /// Whether the provider flags this as the default address.
    #[serde(default)]
    pub is_default: bool,

    /// Province-level region name.
    #[serde(default)]
    pub province: String,

    /// City-level region name.
    #[serde(default)]
    pub city: String,

    /// District-level region name.
    #[serde(default)]
    pub district: String,

    /// Street-level detail.
    #[serde(default)]
    pub detail: String,
}

/// Final contact for one buyer: name plus a phone that is either empty or
/// fully unmasked. An empty field on an override means "inherit from the
/// next source in priority order".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedContact {
    pub name: String,
    pub phone: String,
}

impl ResolvedContact {
    /// Create a resolved contact.
    #[must_use]
    pub fn new(name: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phone: phone.into(),
        }
    }

    /// A contact is complete when both fields are usable.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.name.is_empty() && !self.phone.is_empty()
    }
}
