//! Organization-scoped locks shared by ingestion and recomputation.

use crate::fact::OrganizationId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// One mutex per organization, created on first use.
///
/// Holders must lock slots in ascending id order.
#[derive(Debug, Default)]
pub struct OrganizationLocks {
    slots: Mutex<HashMap<OrganizationId, Arc<Mutex<()>>>>,
}

impl OrganizationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mutexes of `ids`, in the order given.
    pub fn slots(&self, ids: &[OrganizationId]) -> Vec<Arc<Mutex<()>>> {
        let mut map = self.slots.lock();
        ids.iter()
            .map(|id| Arc::clone(map.entry(*id).or_default()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_slots_are_shared_per_organization() {
        let locks = OrganizationLocks::new();
        let first = locks.slots(&[OrganizationId(1), OrganizationId(2)]);
        let second = locks.slots(&[OrganizationId(2)]);

        assert!(Arc::ptr_eq(&first[1], &second[0]));
        let _held = first[1].lock();
        assert!(second[0].try_lock().is_none());
        assert!(first[0].try_lock().is_some());
    }
}
