use causal_core::event::EventType;
use causal_core::{Id, NewEvent};
use proptest::prelude::*;
use proptest::sample::Index;
use serde_json::json;

pub const TYPE_NAMES: &[&str] = &[
    "doc.new",
    "doc.edit",
    "doc.edit.minor",
    "task-open",
    "task-close",
    "audit/log",
];

/// Filters worth querying: full names, shared prefixes and a miss.
pub const TYPE_FILTERS: &[&str] = &["doc", "doc.edit", "task", "audit", "doc.new", "nothing"];

/// One step of a generated history.
#[derive(Debug, Clone)]
pub enum Step {
    Genesis { ty: usize, payload: u8 },
    Child { ty: usize, parents: Vec<Index>, payload: u8 },
}

pub fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        1 => (0..TYPE_NAMES.len(), any::<u8>())
            .prop_map(|(ty, payload)| Step::Genesis { ty, payload }),
        4 => (
            0..TYPE_NAMES.len(),
            prop::collection::vec(any::<Index>(), 1..4),
            any::<u8>(),
        )
            .prop_map(|(ty, parents, payload)| Step::Child { ty, parents, payload }),
    ]
}

pub fn arb_history() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(arb_step(), 1..40)
}

/// Turn steps into submittable events. `key_of` must return the key the
/// store will assign. Children pick parents among earlier events and take
/// the first parent's effective root.
pub fn materialize(steps: &[Step], key_of: impl Fn(&NewEvent) -> Id) -> Vec<NewEvent> {
    let mut events: Vec<NewEvent> = Vec::new();
    let mut keys: Vec<Id> = Vec::new();
    let mut roots: Vec<Id> = Vec::new();

    for step in steps {
        let (event, root) = match step {
            Step::Genesis { ty, payload } => {
                let event = NewEvent::genesis(type_at(*ty), json!(payload));
                let key = key_of(&event);
                (event, key)
            }
            Step::Child { ty, parents, payload } => {
                if keys.is_empty() {
                    let event = NewEvent::genesis(type_at(*ty), json!(payload));
                    let key = key_of(&event);
                    (event, key)
                } else {
                    let picked: Vec<usize> = parents.iter().map(|i| i.index(keys.len())).collect();
                    let root = roots[picked[0]].clone();
                    let event = NewEvent::child(
                        type_at(*ty),
                        json!(payload),
                        root.clone(),
                        picked.iter().map(|&i| keys[i].clone()),
                    );
                    (event, root)
                }
            }
        };
        keys.push(key_of(&event));
        roots.push(root);
        events.push(event);
    }
    events
}

pub fn type_at(index: usize) -> EventType {
    EventType::new(TYPE_NAMES[index % TYPE_NAMES.len()]).unwrap()
}
