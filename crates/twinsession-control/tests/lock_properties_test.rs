//! Lock manager properties over generated operation sequences

use proptest::prelude::*;

use twinsession_control::{ElementId, LockManager};
use twinsession_proto::{LockCapability, ServiceId};

const OWNERS: [ServiceId; 3] = [ServiceId(1), ServiceId(2), ServiceId(3)];

#[derive(Debug, Clone)]
enum LockOp {
    Lock(usize, LockCapability),
    Unlock(usize, LockCapability),
    CreateElement(usize, LockCapability),
    Disable(u64),
    Enable(u64, bool),
}

fn arb_capabilities() -> impl Strategy<Value = LockCapability> {
    any::<u32>().prop_map(LockCapability::from_bits_truncate)
}

fn arb_owner() -> impl Strategy<Value = usize> {
    0..OWNERS.len()
}

fn arb_op() -> impl Strategy<Value = LockOp> {
    prop_oneof![
        2 => (arb_owner(), arb_capabilities()).prop_map(|(o, c)| LockOp::Lock(o, c)),
        1 => (arb_owner(), arb_capabilities()).prop_map(|(o, c)| LockOp::Unlock(o, c)),
        1 => (arb_owner(), arb_capabilities()).prop_map(|(o, c)| LockOp::CreateElement(o, c)),
        1 => (1u64..32).prop_map(LockOp::Disable),
        1 => (1u64..32, any::<bool>()).prop_map(|(e, reset)| LockOp::Enable(e, reset)),
    ]
}

fn arb_ops() -> impl Strategy<Value = Vec<LockOp>> {
    prop::collection::vec(arb_op(), 0..200)
}

fn apply(locks: &mut LockManager, ops: &[LockOp]) {
    let mut next_element = 0u64;
    for op in ops {
        match *op {
            LockOp::Lock(owner, caps) => {
                let _ = locks.lock(OWNERS[owner], caps);
            }
            LockOp::Unlock(owner, caps) => {
                locks.unlock(OWNERS[owner], caps);
            }
            LockOp::CreateElement(owner, caps) => {
                next_element += 1;
                locks
                    .ui_element_created(OWNERS[owner], ElementId(next_element), caps)
                    .unwrap();
            }
            // Unknown elements are rejected, which is fine here
            LockOp::Disable(element) => {
                let _ = locks.disable(ElementId(element));
            }
            LockOp::Enable(element, reset) => {
                let _ = locks.enable(ElementId(element), reset);
            }
        }
    }
}

proptest! {
    #[test]
    fn prop_clean_service_leaves_no_residue(ops in arb_ops(), target in arb_owner()) {
        let mut locks = LockManager::new();
        apply(&mut locks, &ops);

        let target = OWNERS[target];
        locks.clean_service(target);

        prop_assert!(locks.held_by(target).is_empty());
        prop_assert!(locks.elements_of(target).is_empty());
        prop_assert!(!locks.owners().contains(&target));
        prop_assert!(!locks.holders(LockCapability::all()).contains(&target));
    }

    #[test]
    fn prop_split_lock_equals_union_lock(
        first in arb_capabilities(),
        second in arb_capabilities(),
        other_holder in arb_capabilities(),
    ) {
        let other_holder = other_holder.exclusive();
        let mut split = LockManager::new();
        let mut union = LockManager::new();
        for locks in [&mut split, &mut union] {
            locks.lock(ServiceId(9), other_holder).unwrap();
        }

        let split_result = split
            .lock(ServiceId(1), first)
            .and_then(|_| split.lock(ServiceId(1), second));
        let union_result = union.lock(ServiceId(1), first | second);

        if split_result.is_ok() && union_result.is_ok() {
            prop_assert_eq!(split.held_by(ServiceId(1)), union.held_by(ServiceId(1)));
        } else {
            // A conflict on either path means the union is not grantable
            prop_assert!(union_result.is_err());
        }
    }

    #[test]
    fn prop_element_state_matches_rule_after_any_sequence(ops in arb_ops()) {
        let mut locks = LockManager::new();
        apply(&mut locks, &ops);

        if locks.lock_level(LockCapability::ALL) > 0 {
            for owner in OWNERS {
                for element in locks.elements_of(owner) {
                    prop_assert_eq!(locks.is_enabled(element), Some(false));
                }
            }
        }

        for owner in OWNERS {
            locks.clean_service(owner);
        }
        prop_assert!(locks.owners().is_empty());
    }
}
