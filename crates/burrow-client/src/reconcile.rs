//! Desired vs. established forwards

use std::sync::Arc;

use crate::forward::{Forward, ForwardSet};

/// What has to change to turn `current` into `desired`
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// In `desired` but not yet established
    pub inserts: Vec<Arc<Forward>>,
    /// Established but no longer desired
    pub deletes: Vec<Arc<Forward>>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.deletes.is_empty()
    }
}

/// Set difference by forward request id, ignoring the access suffix.
///
/// Callers apply deletes before inserts.
pub fn reconcile(current: &ForwardSet, desired: &ForwardSet) -> Reconciliation {
    let inserts = desired
        .iter()
        .filter(|forward| !current.contains(forward.key()))
        .cloned()
        .collect();
    let deletes = current
        .iter()
        .filter(|forward| !desired.contains(forward.key()))
        .cloned()
        .collect();

    Reconciliation { inserts, deletes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::ServiceIdentity;
    use burrow_proto::Access;

    fn set(ports: &[(&str, u16, Access)]) -> ForwardSet {
        ports
            .iter()
            .map(|(name, port, access)| {
                Forward::new(ServiceIdentity::new(*name, "127.0.0.1", *port), *access)
            })
            .collect()
    }

    fn keys(forwards: &[Arc<Forward>]) -> Vec<&str> {
        forwards.iter().map(|f| f.key()).collect()
    }

    #[test]
    fn test_unchanged_set_is_a_noop() {
        let current = set(&[("web", 80, Access::Public), ("api", 3000, Access::Private)]);
        let desired = set(&[("api", 3000, Access::Private), ("web", 80, Access::Public)]);
        assert!(reconcile(&current, &desired).is_empty());
    }

    #[test]
    fn test_inserts_and_deletes() {
        let current = set(&[("web", 80, Access::Public), ("old", 1, Access::Public)]);
        let desired = set(&[("web", 80, Access::Public), ("new", 2, Access::Public)]);

        let plan = reconcile(&current, &desired);
        assert_eq!(keys(&plan.inserts), ["new-2"]);
        assert_eq!(keys(&plan.deletes), ["old-1"]);
    }

    #[test]
    fn test_access_change_is_not_a_difference() {
        let current = set(&[("web", 80, Access::Public)]);
        let desired = set(&[("web", 80, Access::Private)]);
        assert!(reconcile(&current, &desired).is_empty());
    }

    #[test]
    fn test_symmetry() {
        let a = set(&[("a", 1, Access::Public), ("b", 2, Access::Public)]);
        let b = set(&[("b", 2, Access::Public), ("c", 3, Access::Public)]);

        let forward = reconcile(&a, &b);
        let backward = reconcile(&b, &a);
        assert_eq!(keys(&forward.inserts), keys(&backward.deletes));
        assert_eq!(keys(&forward.deletes), keys(&backward.inserts));
    }

    #[test]
    fn test_applying_plan_converges() {
        let mut current = set(&[("a", 1, Access::Public), ("b", 2, Access::Public)]);
        let desired = set(&[("b", 2, Access::Public), ("c", 3, Access::Public)]);

        let plan = reconcile(&current, &desired);
        for forward in &plan.deletes {
            current.remove(forward.key());
        }
        for forward in plan.inserts {
            current.insert(forward);
        }
        assert!(reconcile(&current, &desired).is_empty());
    }
}
