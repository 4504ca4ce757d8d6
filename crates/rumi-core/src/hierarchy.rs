//! Helpers for the `parent__child` hierarchical Pack id convention (§4.3).

/// Separator between a parent Pack id and its child segment.
const SEPARATOR: &str = "__";

/// Returns the immediate parent id of `pack_id`, if it names a hierarchical
/// child (contains `__`). Returns `None` for a root-level Pack id.
///
/// Only the *rightmost* separator is split, so `"a__b__c"` has parent
/// `"a__b"` (the chain is walked one hop at a time by [`ancestors`]).
pub fn parent_id(pack_id: &str) -> Option<&str> {
    pack_id.rsplit_once(SEPARATOR).map(|(parent, _child)| parent)
}

/// Returns every ancestor of `pack_id`, nearest first, by repeatedly
/// stripping the trailing `__child` segment. Empty for a root-level Pack id.
///
/// `"acme__billing__invoices"` yields `["acme__billing", "acme"]`.
pub fn ancestors(pack_id: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut current = pack_id;
    while let Some(parent) = parent_id(current) {
        out.push(parent);
        current = parent;
    }
    out
}

/// Intersects a child's allowlist entries with every ancestor's, per the
/// "child cannot exceed its ancestors" rule in §4.3. Order-preserving over
/// `child`; an ancestor's list being empty is treated as "grants nothing"
/// rather than "unconstrained", so an unapproved/empty ancestor entry
/// collapses the effective set to empty.
pub fn intersect_allowlist<T: PartialEq + Clone>(child: &[T], ancestors: &[Vec<T>]) -> Vec<T> {
    let mut effective: Vec<T> = child.to_vec();
    for ancestor in ancestors {
        effective.retain(|item| ancestor.contains(item));
    }
    effective
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_pack_has_no_parent() {
        assert_eq!(parent_id("weather"), None);
        assert!(ancestors("weather").is_empty());
    }

    #[test]
    fn single_level_child() {
        assert_eq!(parent_id("acme__billing"), Some("acme"));
        assert_eq!(ancestors("acme__billing"), vec!["acme"]);
    }

    #[test]
    fn multi_level_chain_walks_one_hop_at_a_time() {
        assert_eq!(parent_id("acme__billing__invoices"), Some("acme__billing"));
        assert_eq!(
            ancestors("acme__billing__invoices"),
            vec!["acme__billing", "acme"]
        );
    }

    #[test]
    fn intersection_narrows_to_shared_entries() {
        let child = vec!["api.example.com".to_string(), "cdn.example.com".to_string()];
        let ancestors = vec![
            vec!["api.example.com".to_string(), "other.example.com".to_string()],
        ];
        let effective = intersect_allowlist(&child, &ancestors);
        assert_eq!(effective, vec!["api.example.com".to_string()]);
    }

    #[test]
    fn empty_ancestor_allowlist_collapses_effective_set() {
        let child = vec![443u16];
        let ancestors: Vec<Vec<u16>> = vec![vec![]];
        assert!(intersect_allowlist(&child, &ancestors).is_empty());
    }

    #[test]
    fn no_ancestors_leaves_child_list_untouched() {
        let child = vec![443u16, 8443];
        assert_eq!(intersect_allowlist(&child, &[]), child);
    }
}
