//! Contact resolution: reconciling buyer identity records with address-book
//! records into a usable delivery contact.
//!
//! Providers return the clear phone number in one field and a masked copy in
//! another, and the address book rarely shares ids with the buyer list, so
//! matching is heuristic. The tier order in [`match_address`] is a trust
//! ordering: an exact match always beats the fuzzy last-4-digits fallback,
//! and callers must not reorder the tiers.

use crate::domain::{is_masked, Address, Buyer, ResolvedContact};

/// Pick the first usable phone from an ordered candidate list.
///
/// A candidate is usable when it is non-empty after trimming and contains
/// no mask character. Returns the empty string when every candidate is
/// empty or masked.
#[must_use]
pub fn resolve_phone(candidates: &[String]) -> &str {
    candidates
        .iter()
        .map(|c| c.trim())
        .find(|c| !c.is_empty() && !is_masked(c))
        .unwrap_or("")
}

/// Strip non-digit characters and keep at most the last four digits.
fn last_four_digits(value: &str) -> Option<String> {
    let digits: String = value.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    let start = digits.len().saturating_sub(4);
    Some(digits[start..].to_string())
}

/// Find the address-book entry that belongs to a buyer.
///
/// Tiers, first match wins:
/// 1. exact name equality,
/// 2. exact equality between any unmasked buyer candidate and the
///    address's resolved phone,
/// 3. equality of the last four digits (non-digits stripped) between any
///    buyer candidate and the address's resolved phone.
///
/// Masked provider phones make tier 2 frequently unusable; tier 3 is the
/// deliberate fuzzy fallback for that case.
#[must_use]
pub fn match_address<'a>(buyer: &Buyer, addresses: &'a [Address]) -> Option<&'a Address> {
    // 1) exact name
    if let Some(addr) = addresses.iter().find(|a| a.name == buyer.name) {
        return Some(addr);
    }

    // 2) exact phone match (unmasked candidates only)
    let clear_candidates: Vec<&str> = buyer
        .phone_candidates
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty() && !is_masked(c))
        .collect();

    if let Some(addr) = addresses.iter().find(|a| {
        let addr_phone = resolve_phone(&a.phone_candidates);
        !addr_phone.is_empty() && clear_candidates.iter().any(|c| *c == addr_phone)
    }) {
        return Some(addr);
    }

    // 3) match by last 4 digits, masked candidates included
    let buyer_tails: Vec<String> = buyer
        .phone_candidates
        .iter()
        .filter_map(|c| last_four_digits(c))
        .collect();

    addresses.iter().find(|a| {
        let addr_phone = resolve_phone(&a.phone_candidates);
        match last_four_digits(addr_phone) {
            Some(tail) => buyer_tails.iter().any(|t| *t == tail),
            None => false,
        }
    })
}

/// Resolve the final contact for one buyer.
///
/// Priority per field, independently: override > matched address > the
/// buyer's own record. An empty override field inherits from the next
/// source. The returned phone is either empty or fully unmasked; an empty
/// phone marks the task incomplete rather than failing the build.
#[must_use]
pub fn resolve_contact(
    buyer: &Buyer,
    matched: Option<&Address>,
    user_override: Option<&ResolvedContact>,
) -> ResolvedContact {
    let mut name = String::new();
    let mut phone = String::new();

    if let Some(over) = user_override {
        if !over.name.is_empty() {
            name = over.name.clone();
        }
        let trimmed = over.phone.trim();
        if !trimmed.is_empty() && !is_masked(trimmed) {
            phone = trimmed.to_string();
        }
    }

    if let Some(addr) = matched {
        if name.is_empty() && !addr.name.is_empty() {
            name = addr.name.clone();
        }
        if phone.is_empty() {
            phone = resolve_phone(&addr.phone_candidates).to_string();
        }
    }

    if name.is_empty() {
        name = buyer.name.clone();
    }
    if phone.is_empty() {
        phone = resolve_phone(&buyer.phone_candidates).to_string();
    }

    ResolvedContact { name, phone }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buyer(name: &str, candidates: &[&str]) -> Buyer {
        Buyer {
            id: "b1".to_string(),
            name: name.to_string(),
            id_number: None,
            phone_candidates: candidates.iter().map(ToString::to_string).collect(),
        }
    }

    fn address(id: &str, name: &str, candidates: &[&str]) -> Address {
        Address {
            id: id.to_string(),
            name: name.to_string(),
            phone_candidates: candidates.iter().map(ToString::to_string).collect(),
            is_default: false,
            province: String::new(),
            city: String::new(),
            district: String::new(),
            detail: String::new(),
        }
    }

    #[test]
    fn test_resolve_phone_picks_first_unmasked() {
        let candidates = vec![
            "138****1234".to_string(),
            String::new(),
            "13800001234".to_string(),
        ];
        assert_eq!(resolve_phone(&candidates), "13800001234");
    }

    #[test]
    fn test_resolve_phone_all_masked_or_empty() {
        let candidates = vec!["138****1234".to_string(), "  ".to_string()];
        assert_eq!(resolve_phone(&candidates), "");
        assert_eq!(resolve_phone(&[]), "");
    }

    #[test]
    fn test_name_tier_beats_phone_tier() {
        let b = buyer("Alice", &["138****0000"]);
        let addresses = vec![
            address("a1", "Alice", &["139****9999"]),
            address("a2", "Bob", &["13800000000"]),
        ];

        let matched = match_address(&b, &addresses).unwrap();
        assert_eq!(matched.id, "a1");
    }

    #[test]
    fn test_exact_phone_tier() {
        let b = buyer("Carol", &["13800001234"]);
        let addresses = vec![
            address("a1", "Alice", &["13900009999"]),
            address("a2", "Bob", &["13800001234"]),
        ];

        let matched = match_address(&b, &addresses).unwrap();
        assert_eq!(matched.id, "a2");
    }

    #[test]
    fn test_masked_candidate_excluded_from_exact_tier() {
        // The masked candidate textually equals the address phone but must
        // not be trusted for the exact tier; the last-4 tier still applies.
        let b = buyer("Carol", &["138****1234"]);
        let addresses = vec![address("a1", "Bob", &["138****1234"])];
        assert!(match_address(&b, &addresses).is_none());
    }

    #[test]
    fn test_last_four_digit_fallback() {
        let b = buyer("Carol", &["138****1234"]);
        let addresses = vec![address("a1", "Bob", &["999991234"])];

        let matched = match_address(&b, &addresses).unwrap();
        assert_eq!(matched.id, "a1");
    }

    #[test]
    fn test_no_tier_matches() {
        let b = buyer("Carol", &["138****1234"]);
        let addresses = vec![address("a1", "Bob", &["13900005678"])];
        assert!(match_address(&b, &addresses).is_none());
    }

    #[test]
    fn test_resolve_contact_priority() {
        let b = buyer("Alice", &["138****0000", "13811112222"]);
        let addr = address("a1", "Alice Chen", &["13833334444"]);

        // No override: address wins both fields.
        let contact = resolve_contact(&b, Some(&addr), None);
        assert_eq!(contact.name, "Alice Chen");
        assert_eq!(contact.phone, "13833334444");

        // Phone-only override inherits the address name.
        let over = ResolvedContact::new("", "13855556666");
        let contact = resolve_contact(&b, Some(&addr), Some(&over));
        assert_eq!(contact.name, "Alice Chen");
        assert_eq!(contact.phone, "13855556666");

        // Masked override phone is ignored, not propagated.
        let over = ResolvedContact::new("Custom", "138****7777");
        let contact = resolve_contact(&b, Some(&addr), Some(&over));
        assert_eq!(contact.name, "Custom");
        assert_eq!(contact.phone, "13833334444");
    }

    #[test]
    fn test_resolve_contact_falls_back_to_buyer() {
        let b = buyer("Alice", &["138****0000", "13811112222"]);
        let contact = resolve_contact(&b, None, None);
        assert_eq!(contact.name, "Alice");
        assert_eq!(contact.phone, "13811112222");
    }

    #[test]
    fn test_resolve_contact_everything_masked() {
        let b = buyer("Alice", &["138****0000"]);
        let addr = address("a1", "", &["139****1111"]);
        let contact = resolve_contact(&b, Some(&addr), None);
        assert_eq!(contact.name, "Alice");
        assert_eq!(contact.phone, "");
        assert!(!contact.is_complete());
    }
}
