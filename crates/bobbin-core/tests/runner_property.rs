//! Token-game properties of the net runner on random block-structured nets.
//!
//! Each block is `split -> branch tasks -> join` with a matching join, so a
//! case that completes every item must end with one token in the output
//! condition.
//!
//! - Firing consumes per join: AND every preset, XOR the first marked, OR every marked
//! - Firing produces per split: AND every postset, XOR exactly one, OR at least one
//! - Random complete/cancel sequences never leave a condition with two tokens
//!   or a token outside the net
//! - Completing every item reaches exactly `{o: 1}`

use bobbin_core::domain::{
    Case, CaseId, DataMap, JoinType, Marking, Net, NetBuilder, Specification, SpecificationId,
    SplitType, Task, WorkItemId, into_data_map,
};
use bobbin_core::impls::SimpleEvaluator;
use bobbin_core::ports::{Clock, FixedClock, UlidGenerator};
use bobbin_core::runner::{NetRunner, Quiescence, RunnerLimits};
use chrono::{DateTime, Utc};
use proptest::prelude::*;
use proptest::sample::Index;
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Block {
    split: SplitType,
    join: JoinType,
    /// One flag per branch; branch 0 is the default flow of a conditional split.
    flags: Vec<bool>,
}

fn arb_block() -> impl Strategy<Value = Block> {
    (
        prop_oneof![
            Just(SplitType::And),
            Just(SplitType::Xor),
            Just(SplitType::Or)
        ],
        any::<bool>(),
        prop::collection::vec(any::<bool>(), 1..=3),
    )
        .prop_map(|(split, or_join, flags)| {
            let join = match (split, or_join) {
                (SplitType::Or, _) | (_, true) => JoinType::Or,
                (SplitType::And, false) => JoinType::And,
                (SplitType::Xor, false) => JoinType::Xor,
            };
            Block { split, join, flags }
        })
}

fn arb_blocks() -> impl Strategy<Value = Vec<Block>> {
    prop::collection::vec(arb_block(), 1..=3)
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

fn block_net(blocks: &[Block]) -> Net {
    let mut builder = NetBuilder::new("main")
        .input_condition("i")
        .output_condition("o");
    let mut previous = "i".to_string();
    for (k, block) in blocks.iter().enumerate() {
        let split = format!("s{k}");
        let join = format!("j{k}");
        builder = builder
            .task(Task::new(split.as_str()).split(block.split))
            .task(Task::new(join.as_str()).join(block.join))
            .flow(previous.as_str(), split.as_str());
        for n in 0..block.flags.len() {
            let branch = format!("b{k}_{n}");
            builder = builder.task(Task::new(branch.as_str()).decomposes_to("work"));
            builder = match (block.split, n) {
                (SplitType::And, _) => builder.flow(split.as_str(), branch.as_str()),
                (_, 0) => builder.default_flow(split.as_str(), branch.as_str()),
                _ => builder.flow_when(split.as_str(), branch.as_str(), format!("f{k}_{n} == true")),
            };
            builder = builder.flow(branch.as_str(), join.as_str());
        }
        previous = join;
    }
    builder.flow(previous.as_str(), "o").build().unwrap()
}

fn flags(blocks: &[Block]) -> Value {
    let mut data = Map::new();
    for (k, block) in blocks.iter().enumerate() {
        for (n, flag) in block.flags.iter().enumerate().skip(1) {
            data.insert(format!("f{k}_{n}"), Value::Bool(*flag));
        }
    }
    Value::Object(data)
}

struct Fixture {
    spec: Specification,
    ids: UlidGenerator<FixedClock>,
    now: DateTime<Utc>,
}

impl Fixture {
    fn new(blocks: &[Block]) -> Self {
        let spec = Specification::builder("s", "blocks")
            .net(block_net(blocks))
            .atomic("work")
            .build()
            .unwrap();
        let clock = FixedClock::new(Utc::now());
        let now = clock.now();
        Self {
            spec,
            ids: UlidGenerator::new(clock),
            now,
        }
    }

    fn net(&self) -> &Net {
        self.spec.root_net().unwrap()
    }

    fn runner(&self) -> NetRunner<'_> {
        NetRunner::new(
            &self.spec,
            &SimpleEvaluator,
            &self.ids,
            RunnerLimits::default(),
            self.now,
        )
    }

    fn case(&self, input: Value) -> Case {
        let net = self.net();
        let mut case = Case::new(
            CaseId::generate(),
            SpecificationId::new("s"),
            net.id(),
            net.input_condition(),
            into_data_map(input),
            self.now,
        );
        case.start(self.now).unwrap();
        case
    }
}

/// Active leaf items ordered by task id.
fn pending(case: &Case) -> Vec<(String, WorkItemId)> {
    let mut items: Vec<_> = case
        .active_items()
        .filter(|w| !w.is_parent())
        .map(|w| (w.task_id.clone(), w.id))
        .collect();
    items.sort_by(|a, b| a.0.cmp(&b.0));
    items
}

fn assert_safe(net: &Net, marking: &Marking) -> Result<(), TestCaseError> {
    for (condition, count) in marking.marked() {
        prop_assert!(net.condition(condition).is_some(), "token on unknown {condition}");
        prop_assert_eq!(count, 1, "{} holds {} tokens", condition, count);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn firing_consumes_and_produces_per_join_and_split(
        blocks in arb_blocks(),
        marks in prop::collection::vec(any::<bool>(), 64),
    ) {
        let fx = Fixture::new(&blocks);
        let net = fx.net();
        let runner = fx.runner();

        let mut case = fx.case(flags(&blocks));
        case.marking = Marking::new();
        for (condition, marked) in net.conditions().zip(&marks) {
            if *marked {
                case.marking.add(&condition.id, 1);
            }
        }

        let enabled = runner.enabled_tasks(&case);
        prop_assert!(enabled.is_ok(), "{:?}", enabled);
        for task_id in enabled.unwrap() {
            let task = net.task(&task_id).unwrap();
            let before = case.marking.clone();
            let mut after_case = case.clone();
            let fired = runner.fire(&mut after_case, &task_id, &mut Vec::new());
            prop_assert!(fired.is_ok(), "{:?}", fired);
            let after = &after_case.marking;

            let preset = net.preset(&task_id);
            let marked: Vec<&str> = preset.iter().copied().filter(|c| before.is_marked(c)).collect();
            let consumed: Vec<&str> = preset
                .iter()
                .copied()
                .filter(|c| after.count(c) + 1 == before.count(c))
                .collect();
            for c in &preset {
                prop_assert!(after.count(c) <= before.count(c));
                prop_assert!(after.count(c) + 1 >= before.count(c));
            }
            match task.join {
                JoinType::And => {
                    prop_assert_eq!(&consumed, &preset);
                }
                JoinType::Xor => {
                    prop_assert_eq!(&consumed, &marked[..1].to_vec());
                }
                JoinType::Or => {
                    prop_assert_eq!(&consumed, &marked);
                }
            }

            let postset = net.postset(&task_id);
            let produced = postset
                .iter()
                .filter(|c| after.count(c) == before.count(c) + 1)
                .count();
            if task.is_empty_task() {
                match task.split {
                    SplitType::And => {
                        prop_assert_eq!(produced, postset.len());
                    }
                    SplitType::Xor => {
                        prop_assert_eq!(produced, 1);
                    }
                    SplitType::Or => {
                        prop_assert!(produced >= 1);
                    }
                }
            } else {
                prop_assert_eq!(produced, 0);
                prop_assert!(after_case.active_items().any(|w| w.task_id == task_id));
            }
        }
    }

    #[test]
    fn completing_every_item_leaves_one_output_token(
        blocks in arb_blocks(),
        picks in prop::collection::vec(any::<Index>(), 0..32),
    ) {
        let fx = Fixture::new(&blocks);
        let net = fx.net();
        let runner = fx.runner();
        let mut case = fx.case(flags(&blocks));
        let mut effects = Vec::new();
        prop_assert!(runner.run(&mut case, &mut effects).is_ok());
        assert_safe(net, &case.marking)?;

        // Random picks first, then whatever is left in task order.
        let mut picks = picks.into_iter();
        loop {
            let items = pending(&case);
            if items.is_empty() {
                break;
            }
            let at = picks.next().map_or(0, |p| p.index(items.len()));
            let id = items[at].1;
            let now = fx.now;
            let started = case.with_item(id, |w| { w.allocate("u", now)?; w.start(now) });
            prop_assert!(started.is_ok());
            let done = runner.complete_item(&mut case, id, DataMap::new(), &mut effects);
            prop_assert!(done.is_ok(), "{:?}", done);
            assert_safe(net, &case.marking)?;
        }

        prop_assert_eq!(runner.quiescence(&case).unwrap(), Quiescence::Completed);
        prop_assert_eq!(case.marking.count("o"), 1);
        prop_assert_eq!(case.marking.total(), 1);
    }

    #[test]
    fn random_complete_and_cancel_keeps_the_marking_safe(
        blocks in arb_blocks(),
        actions in prop::collection::vec((any::<Index>(), any::<bool>()), 1..32),
    ) {
        let fx = Fixture::new(&blocks);
        let net = fx.net();
        let runner = fx.runner();
        let mut case = fx.case(flags(&blocks));
        let mut effects = Vec::new();
        prop_assert!(runner.run(&mut case, &mut effects).is_ok());

        for (pick, cancel) in actions {
            let items = pending(&case);
            if items.is_empty() {
                break;
            }
            let id = items[pick.index(items.len())].1;
            let step = if cancel {
                runner
                    .cancel_item(&mut case, id, "dropped", &mut effects)
                    .and_then(|()| runner.run(&mut case, &mut effects))
            } else {
                let now = fx.now;
                case.with_item(id, |w| {
                    w.allocate("u", now)?;
                    w.start(now)
                })
                .and_then(|()| runner.complete_item(&mut case, id, DataMap::new(), &mut effects))
            };
            prop_assert!(step.is_ok(), "{:?}", step);
            assert_safe(net, &case.marking)?;
            prop_assert!(runner.enabled_tasks(&case).unwrap().is_empty());

            let quiet = runner.quiescence(&case).unwrap();
            prop_assert_eq!(quiet == Quiescence::Completed, case.marking.is_marked("o") && !case.has_active_items());
            if quiet == Quiescence::Stalled {
                prop_assert!(case.marking.is_empty());
            }
        }
    }
}
