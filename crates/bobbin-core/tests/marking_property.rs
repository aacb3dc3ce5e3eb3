//! Token bookkeeping and multi-instance aggregation properties.
//!
//! - A marking always agrees with a plain per-condition counter
//! - Conditions never hold a zero entry, so equal tokens mean equal markings
//! - A multi-instance parent completes exactly when enough children succeeded

use std::collections::BTreeMap;

use bobbin_core::domain::{Marking, WorkItemStatus, derive_parent_status};
use proptest::prelude::*;

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Op {
    Add(String, u32),
    Consume(String),
    Clear(String),
}

fn arb_condition() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("start".to_string()),
        Just("c1".to_string()),
        Just("c2".to_string()),
        Just("end".to_string()),
    ]
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (arb_condition(), 0u32..4).prop_map(|(c, n)| Op::Add(c, n)),
        arb_condition().prop_map(Op::Consume),
        arb_condition().prop_map(Op::Clear),
    ]
}

fn arb_child_status() -> impl Strategy<Value = WorkItemStatus> {
    prop_oneof![
        Just(WorkItemStatus::Fired),
        Just(WorkItemStatus::Offered),
        Just(WorkItemStatus::Allocated),
        Just(WorkItemStatus::Started),
        Just(WorkItemStatus::Suspended),
        Just(WorkItemStatus::Completed),
        Just(WorkItemStatus::ForceCompleted),
        Just(WorkItemStatus::Cancelled),
        Just(WorkItemStatus::Failed),
    ]
}

fn apply(marking: &mut Marking, model: &mut BTreeMap<String, u32>, op: &Op) {
    match op {
        Op::Add(c, n) => {
            marking.add(c, *n);
            *model.entry(c.clone()).or_insert(0) += n;
        }
        Op::Consume(c) => {
            let had = model.get(c).copied().unwrap_or(0);
            assert_eq!(marking.consume(c), had > 0);
            if had > 0 {
                model.insert(c.clone(), had - 1);
            }
        }
        Op::Clear(c) => {
            let had = model.remove(c).unwrap_or(0);
            assert_eq!(marking.clear(c), had);
        }
    }
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn marking_matches_a_counter(ops in prop::collection::vec(arb_op(), 0..40)) {
        let mut marking = Marking::new();
        let mut model = BTreeMap::new();
        for op in &ops {
            apply(&mut marking, &mut model, op);
        }

        model.retain(|_, n| *n > 0);
        let marked: BTreeMap<String, u32> =
            marking.marked().map(|(c, n)| (c.to_string(), n)).collect();
        prop_assert_eq!(&marked, &model);
        prop_assert_eq!(marking.total(), model.values().map(|&n| u64::from(n)).sum::<u64>());
        prop_assert_eq!(marking.is_empty(), model.is_empty());
    }

    #[test]
    fn equal_tokens_give_equal_markings(ops in prop::collection::vec(arb_op(), 0..40)) {
        let mut marking = Marking::new();
        let mut model = BTreeMap::new();
        for op in &ops {
            apply(&mut marking, &mut model, op);
        }

        // Rebuild the same tokens in a different order.
        let mut rebuilt = Marking::new();
        for (c, n) in model.iter().rev() {
            rebuilt.add(c, *n);
        }
        prop_assert_eq!(marking, rebuilt);
    }

    #[test]
    fn parent_completes_once_threshold_children_succeed(
        children in prop::collection::vec(arb_child_status(), 1..8),
        threshold in 1usize..8,
    ) {
        let successful = children.iter().filter(|s| s.is_successful()).count();
        let verdict = derive_parent_status(threshold, &children);

        prop_assert_eq!(verdict == WorkItemStatus::Completed, successful >= threshold);
        if verdict == WorkItemStatus::Failed {
            prop_assert!(children.iter().all(|s| s.is_finished()));
        }
    }
}
