//! Purchase payload assembly.
//!
//! Builds the request handed to the purchase executor from a task's
//! selection, buyers, overrides and the address book, using the contact
//! resolver per buyer. The executor sizes its per-buyer retry loop from
//! `count`, so `count` must always equal the buyer list length.

use serde::{Deserialize, Serialize};

use crate::contact::{match_address, resolve_contact};
use crate::domain::{Address, ContactMode, ResolvedContact, Task};
use crate::error::PayloadError;

/// Delivery block embedded per buyer (and mirrored at the top level for
/// single-buyer consumers) when an address was matched or overridden.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverInfo {
    pub name: String,
    pub tel: String,
    pub province: String,
    pub city: String,
    pub district: String,
    pub detail: String,
}

impl DeliverInfo {
    fn from_address(addr: &Address, contact: &ResolvedContact) -> Self {
        Self {
            name: if contact.name.is_empty() {
                addr.name.clone()
            } else {
                contact.name.clone()
            },
            tel: contact.phone.clone(),
            province: addr.province.clone(),
            city: addr.city.clone(),
            district: addr.district.clone(),
            detail: addr.detail.clone(),
        }
    }
}

/// One buyer entry in the purchase request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadBuyer {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_number: Option<String>,
    /// Resolved phone; empty when every source was masked, which marks the
    /// task incomplete without failing the build.
    pub tel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_info: Option<DeliverInfo>,
}

/// The finished purchase request for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchasePayload {
    pub project_id: String,
    pub project_name: String,
    pub screen_id: String,
    pub screen_name: String,
    pub sku_id: String,
    pub sku_name: String,
    /// Always equal to `buyer_info.len()`.
    pub count: u32,
    pub buyer_info: Vec<PayloadBuyer>,
    /// First buyer's delivery block, for single-buyer consumers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_info: Option<DeliverInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pay_money: Option<u32>,
    /// First buyer's resolved contact, for single-buyer consumers.
    pub contact_name: String,
    pub contact_tel: String,
}

impl PurchasePayload {
    /// Whether every buyer ended up with a usable phone.
    #[must_use]
    pub fn is_contact_complete(&self) -> bool {
        self.buyer_info.iter().all(|b| !b.tel.is_empty())
    }
}

/// Merge the task-level shared contact under a per-buyer override.
///
/// Field-wise: the per-buyer override wins, the shared contact fills the
/// gaps, and an empty result field falls through to address/profile
/// resolution downstream.
fn effective_override(
    per_buyer: Option<&ResolvedContact>,
    shared: Option<&ResolvedContact>,
) -> Option<ResolvedContact> {
    match (per_buyer, shared) {
        (None, None) => None,
        (Some(o), None) => Some(o.clone()),
        (None, Some(s)) => Some(s.clone()),
        (Some(o), Some(s)) => Some(ResolvedContact {
            name: if o.name.is_empty() {
                s.name.clone()
            } else {
                o.name.clone()
            },
            phone: if o.phone.is_empty() {
                s.phone.clone()
            } else {
                o.phone.clone()
            },
        }),
    }
}

/// Assemble the purchase request for a task.
///
/// Fails when the catalog selection is incomplete or the task has no
/// buyers. Per buyer, the delivery block is embedded only when an address
/// was matched or explicitly overridden.
pub fn build(task: &Task, addresses: &[Address]) -> Result<PurchasePayload, PayloadError> {
    let selection = &task.selection;
    if selection.project_id.is_empty() {
        return Err(PayloadError::MissingSelection {
            field: "project_id",
        });
    }
    if selection.screen_id.is_empty() {
        return Err(PayloadError::MissingSelection { field: "screen_id" });
    }
    if selection.sku_id.is_empty() {
        return Err(PayloadError::MissingSelection { field: "sku_id" });
    }
    if task.buyers.is_empty() {
        return Err(PayloadError::NoBuyers);
    }

    let shared = match task.contact_mode {
        ContactMode::Shared => task.shared_contact.as_ref(),
        ContactMode::PerBuyer => None,
    };

    let mut buyer_info = Vec::with_capacity(task.buyers.len());
    for buyer in &task.buyers {
        let matched = task
            .address_overrides
            .get(&buyer.id)
            .or_else(|| match_address(buyer, addresses));

        let over = effective_override(task.contact_overrides.get(&buyer.id), shared);
        let contact = resolve_contact(buyer, matched, over.as_ref());

        buyer_info.push(PayloadBuyer {
            id: buyer.id.clone(),
            name: contact.name.clone(),
            id_number: buyer.id_number.clone(),
            tel: contact.phone.clone(),
            deliver_info: matched.map(|addr| DeliverInfo::from_address(addr, &contact)),
        });
    }

    let first = &buyer_info[0];
    let count = u32::try_from(buyer_info.len()).unwrap_or(u32::MAX);

    Ok(PurchasePayload {
        project_id: selection.project_id.clone(),
        project_name: selection.project_name.clone(),
        screen_id: selection.screen_id.clone(),
        screen_name: selection.screen_name.clone(),
        sku_id: selection.sku_id.clone(),
        sku_name: selection.sku_name.clone(),
        count,
        contact_name: first.name.clone(),
        contact_tel: first.tel.clone(),
        deliver_info: first.deliver_info.clone(),
        pay_money: selection.pay_money,
        buyer_info,
    })
}
