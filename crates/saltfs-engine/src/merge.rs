//! Pure three-way merge of folder children maps.
//!
//! `base` is the children map at the version both sides diverged from,
//! `local` ours, `remote` the server's. Entries compare by access id only;
//! manifest contents are merged per entry by their own sync pass.

use std::collections::BTreeSet;

use saltfs_core::{Access, Children, Timestamp};

fn same(a: Option<&Access>, b: Option<&Access>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.id() == b.id(),
        _ => false,
    }
}

/// First free `"{name} (conflict {ts})"` variant, growing a counter on
/// collision.
pub fn conflict_name(taken: &Children, name: &str, now: Timestamp) -> String {
    let candidate = format!("{name} (conflict {now})");
    if !taken.contains_key(&candidate) {
        return candidate;
    }
    let mut n = 2u32;
    loop {
        let candidate = format!("{name} (conflict {now} #{n})");
        if !taken.contains_key(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Merge `local` and `remote` against `base`. Returns the merged map and
/// whether it differs from `remote` (i.e. whether a re-upload is needed).
///
/// Per name: an unchanged side yields to the other; when both sides changed,
/// a missing side loses to a present one, and two distinct present accesses
/// keep remote under the name while local survives under a conflict name.
pub fn merge_children(
    base: &Children,
    local: &Children,
    remote: &Children,
    now: Timestamp,
) -> (Children, bool) {
    let names: BTreeSet<&String> = base.keys().chain(local.keys()).chain(remote.keys()).collect();

    let mut merged = Children::new();
    let mut conflicts: Vec<(&String, Access)> = Vec::new();

    for name in names {
        let b = base.get(name);
        let l = local.get(name);
        let r = remote.get(name);

        let winner = if same(l, r) || same(l, b) {
            r
        } else if same(r, b) {
            l
        } else {
            // Both sides changed the entry
            match (l, r) {
                (Some(_), None) => l,
                (None, Some(_)) => r,
                (Some(l), Some(r)) => {
                    conflicts.push((name, l.clone()));
                    Some(r)
                }
                (None, None) => unreachable!("name came from the key union"),
            }
        };
        if let Some(access) = winner {
            merged.insert(name.clone(), access.clone());
        }
    }

    // Place conflict losers once all regular names are known
    for (name, access) in conflicts {
        let renamed = conflict_name(&merged, name, now);
        merged.insert(renamed, access);
    }

    let modified = merged.len() != remote.len()
        || merged
            .iter()
            .any(|(name, access)| !same(Some(access), remote.get(name)));
    (merged, modified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry() -> Access {
        Access::new_placeholder()
    }

    fn map(entries: &[(&str, &Access)]) -> Children {
        entries
            .iter()
            .map(|(name, access)| (name.to_string(), (*access).clone()))
            .collect()
    }

    #[test]
    fn concurrent_disjoint_adds_union() {
        let a = entry();
        let b = entry();
        let base = Children::new();
        let local = map(&[("a", &a)]);
        let remote = map(&[("b", &b)]);

        let (merged, modified) = merge_children(&base, &local, &remote, 100);
        assert_eq!(merged, map(&[("a", &a), ("b", &b)]));
        assert!(modified);
    }

    #[test]
    fn same_name_distinct_entities_renames_local() {
        let x_local = entry();
        let x_remote = entry();
        let base = Children::new();
        let local = map(&[("x", &x_local)]);
        let remote = map(&[("x", &x_remote)]);

        let (merged, modified) = merge_children(&base, &local, &remote, 100);
        assert!(modified);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["x"].id(), x_remote.id());
        assert_eq!(merged["x (conflict 100)"].id(), x_local.id());
    }

    #[test]
    fn conflict_name_counter_grows_on_collision() {
        let taken = map(&[
            ("x (conflict 100)", &entry()),
            ("x (conflict 100 #2)", &entry()),
        ]);
        assert_eq!(conflict_name(&taken, "x", 100), "x (conflict 100 #3)");
    }

    #[test]
    fn remote_delete_wins_over_unchanged_local() {
        let a = entry();
        let base = map(&[("a", &a)]);
        let local = base.clone();
        let remote = Children::new();

        let (merged, modified) = merge_children(&base, &local, &remote, 100);
        assert!(merged.is_empty());
        assert!(!modified);
    }

    #[test]
    fn local_delete_survives_unchanged_remote() {
        let a = entry();
        let base = map(&[("a", &a)]);
        let local = Children::new();
        let remote = base.clone();

        let (merged, modified) = merge_children(&base, &local, &remote, 100);
        assert!(merged.is_empty());
        assert!(modified);
    }

    #[test]
    fn local_replace_beats_remote_delete() {
        let old = entry();
        let new = entry();
        let base = map(&[("a", &old)]);
        let local = map(&[("a", &new)]);
        let remote = Children::new();

        let (merged, modified) = merge_children(&base, &local, &remote, 100);
        assert_eq!(merged["a"].id(), new.id());
        assert!(modified);
    }

    #[test]
    fn remote_replace_beats_local_delete() {
        let old = entry();
        let new = entry();
        let base = map(&[("a", &old)]);
        let local = Children::new();
        let remote = map(&[("a", &new)]);

        let (merged, modified) = merge_children(&base, &local, &remote, 100);
        assert_eq!(merged["a"].id(), new.id());
        assert!(!modified);
    }

    #[test]
    fn identical_sides_are_clean() {
        let a = entry();
        let base = Children::new();
        let local = map(&[("a", &a)]);
        let remote = map(&[("a", &a)]);

        let (merged, modified) = merge_children(&base, &local, &remote, 100);
        assert_eq!(merged, remote);
        assert!(!modified);
    }

    fn arb_children() -> impl Strategy<Value = Children> {
        prop::collection::btree_map("[a-d]", Just(()), 0..4)
            .prop_map(|m| m.into_keys().map(|k| (k, Access::new_placeholder())).collect())
    }

    proptest! {
        // An unchanged local side always accepts remote verbatim
        #[test]
        fn unchanged_local_accepts_remote(base in arb_children(), remote in arb_children()) {
            let (merged, modified) = merge_children(&base, &base, &remote, 1);
            prop_assert_eq!(&merged, &remote);
            prop_assert!(!modified);
        }

        // An unchanged remote side keeps local verbatim
        #[test]
        fn unchanged_remote_keeps_local(base in arb_children(), local in arb_children()) {
            let (merged, _) = merge_children(&base, &local, &base, 1);
            prop_assert_eq!(&merged, &local);
        }

        // Merging never invents access ids
        #[test]
        fn no_invented_ids(
            base in arb_children(),
            local in arb_children(),
            remote in arb_children(),
        ) {
            let (merged, _) = merge_children(&base, &local, &remote, 1);
            for access in merged.values() {
                let id = access.id();
                let known = local.values().chain(remote.values()).any(|a| a.id() == id);
                prop_assert!(known);
            }
        }
    }
}
