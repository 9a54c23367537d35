//! Event generation for simulated writers.
//!
//! Each round a replica may author one event. The shape is drawn from the
//! configured mix: a new root, an append to a head, a fork off an older
//! event, a merge of heads, or a resubmission of something it already wrote.

use causal_core::event::EventType;
use causal_core::{Id, NewEvent};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::rng::DeterministicRng;

/// Percent weights for each action. They need not sum to 100; an action is
/// chosen proportionally to its weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Chance per round that a replica authors anything.
    pub emit_percent: u8,
    pub genesis_weight: u8,
    pub append_weight: u8,
    pub fork_weight: u8,
    pub merge_weight: u8,
    pub resubmit_weight: u8,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            emit_percent: 70,
            genesis_weight: 5,
            append_weight: 45,
            fork_weight: 20,
            merge_weight: 20,
            resubmit_weight: 10,
        }
    }
}

impl WorkloadConfig {
    fn total_weight(&self) -> u64 {
        [
            self.genesis_weight,
            self.append_weight,
            self.fork_weight,
            self.merge_weight,
            self.resubmit_weight,
        ]
        .iter()
        .map(|w| u64::from(*w))
        .sum()
    }
}

/// The shape of an authored event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Genesis,
    Append,
    Fork,
    Merge,
    Resubmit,
}

impl Action {
    const fn type_name(self) -> &'static str {
        match self {
            Self::Genesis => "doc.new",
            Self::Append => "doc.edit",
            Self::Fork => "doc.edit.branch",
            Self::Merge => "doc.merge",
            Self::Resubmit => "doc.resubmit",
        }
    }
}

/// What a replica knows when it authors: its heads and every stored key
/// with its effective root.
#[derive(Debug, Clone, Copy)]
pub struct LocalView<'a> {
    pub heads: &'a [Id],
    pub known: &'a [(Id, Id)],
    pub authored: &'a [NewEvent],
}

/// Draw an action, downgrading it when the local view cannot support it.
#[must_use]
pub fn choose_action(config: &WorkloadConfig, view: &LocalView<'_>, rng: &mut DeterministicRng) -> Action {
    let total = config.total_weight();
    let mut roll = rng.next_bounded(total.max(1));
    let mut action = Action::Append;
    for (candidate, weight) in [
        (Action::Genesis, config.genesis_weight),
        (Action::Append, config.append_weight),
        (Action::Fork, config.fork_weight),
        (Action::Merge, config.merge_weight),
        (Action::Resubmit, config.resubmit_weight),
    ] {
        let weight = u64::from(weight);
        if roll < weight {
            action = candidate;
            break;
        }
        roll -= weight;
    }

    match action {
        _ if view.known.is_empty() => Action::Genesis,
        Action::Merge if view.heads.len() < 2 => Action::Append,
        Action::Resubmit if view.authored.is_empty() => Action::Append,
        other => other,
    }
}

/// Author a new event. `author_id` and `serial` make the payload unique, so
/// distinct authorings never collide on a key.
///
/// `Resubmit` returns a clone of an earlier authored event.
#[must_use]
pub fn author(
    action: Action,
    view: &LocalView<'_>,
    author_id: usize,
    serial: u64,
    rng: &mut DeterministicRng,
) -> NewEvent {
    let payload = json!({ "author": author_id, "serial": serial });
    let root_of = |key: &Id| {
        view.known
            .iter()
            .find(|(k, _)| k == key)
            .map_or_else(|| key.clone(), |(_, root)| root.clone())
    };

    let single = |parent: Option<&Id>| match parent {
        Some(parent) => NewEvent::child(event_type(action), payload.clone(), root_of(parent), [parent.clone()]),
        None => NewEvent::genesis(event_type(Action::Genesis), payload.clone()),
    };

    match action {
        Action::Genesis => NewEvent::genesis(event_type(action), payload.clone()),
        Action::Append => single(rng.choose(view.heads)),
        Action::Fork => single(rng.choose(view.known).map(|(key, _)| key)),
        Action::Merge => {
            let mut heads = view.heads.to_vec();
            rng.shuffle(&mut heads);
            let take = 2 + rng.next_index(heads.len().saturating_sub(1));
            heads.truncate(take.min(heads.len()));
            match heads.first() {
                Some(first) => {
                    let root = root_of(first);
                    NewEvent::child(event_type(action), payload.clone(), root, heads)
                }
                None => NewEvent::genesis(event_type(Action::Genesis), payload.clone()),
            }
        }
        Action::Resubmit => match rng.choose(view.authored) {
            Some(event) => event.clone(),
            None => NewEvent::genesis(event_type(Action::Genesis), payload.clone()),
        },
    }
}

fn event_type(action: Action) -> EventType {
    // Static names are valid type names.
    EventType::new(action.type_name()).unwrap_or_else(|_| unreachable!())
}

#[cfg(test)]
mod tests {
    use super::*;
    use causal_core::{Blake3Hasher, ContentHasher};

    fn key(n: u8) -> Id {
        Blake3Hasher.hash(&[n])
    }

    #[test]
    fn empty_view_forces_genesis() {
        let mut rng = DeterministicRng::new(0);
        let view = LocalView {
            heads: &[],
            known: &[],
            authored: &[],
        };
        for _ in 0..50 {
            assert_eq!(
                choose_action(&WorkloadConfig::default(), &view, &mut rng),
                Action::Genesis
            );
        }
    }

    #[test]
    fn merge_needs_two_heads() {
        let mut rng = DeterministicRng::new(1);
        let config = WorkloadConfig {
            merge_weight: 100,
            genesis_weight: 0,
            append_weight: 0,
            fork_weight: 0,
            resubmit_weight: 0,
            ..WorkloadConfig::default()
        };
        let known = [(key(1), key(1))];
        let heads = [key(1)];
        let view = LocalView {
            heads: &heads,
            known: &known,
            authored: &[],
        };
        assert_eq!(choose_action(&config, &view, &mut rng), Action::Append);
    }

    #[test]
    fn children_inherit_the_parent_root() {
        let mut rng = DeterministicRng::new(2);
        let root = key(1);
        let mid = key(2);
        let known = [(root.clone(), root.clone()), (mid.clone(), root.clone())];
        let heads = [mid.clone()];
        let view = LocalView {
            heads: &heads,
            known: &known,
            authored: &[],
        };
        let event = author(Action::Append, &view, 0, 1, &mut rng);
        assert_eq!(event.parents, vec![mid]);
        assert_eq!(event.root, Some(root));
    }

    #[test]
    fn merge_names_at_least_two_heads() {
        let mut rng = DeterministicRng::new(3);
        let known = [(key(1), key(1)), (key(2), key(1)), (key(3), key(1))];
        let heads = [key(2), key(3)];
        let view = LocalView {
            heads: &heads,
            known: &known,
            authored: &[],
        };
        let event = author(Action::Merge, &view, 0, 1, &mut rng);
        assert_eq!(event.normalized_parents(), vec![key(2), key(3)]);
        assert_eq!(event.root, Some(key(1)));
    }

    #[test]
    fn resubmit_repeats_an_authored_event() {
        let mut rng = DeterministicRng::new(4);
        let earlier = NewEvent::genesis(event_type(Action::Genesis), json!(1));
        let known = [(key(1), key(1))];
        let authored = [earlier.clone()];
        let view = LocalView {
            heads: &[],
            known: &known,
            authored: &authored,
        };
        assert_eq!(author(Action::Resubmit, &view, 0, 9, &mut rng), earlier);
    }
}
