use std::collections::{BTreeSet, HashMap, HashSet};

use causal_core::Id;

use crate::replica::{ReplicaId, ReplicaState};

// ── Core result types ─────────────────────────────────────────────────────────

/// Oracle result for an invariant check.
///
/// Returned by each checker and by [`StoreOracle::check_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleResult {
    /// `true` iff no violations were found.
    pub passed: bool,
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    #[must_use]
    const fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    fn from_violations(violations: Vec<InvariantViolation>) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
        }
    }

    /// Merge another result into this one (failures accumulate).
    #[must_use]
    fn merge(mut self, other: Self) -> Self {
        if !other.passed {
            self.passed = false;
            self.violations.extend(other.violations);
        }
        self
    }
}

// ── Invariant violation diagnostics ──────────────────────────────────────────

/// Diagnostic information for a single failed invariant check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// Two replicas hold different event sets after full delivery.
    Convergence {
        replica_a: ReplicaId,
        replica_b: ReplicaId,
        only_in_a: Vec<Id>,
        only_in_b: Vec<Id>,
    },

    /// The tracked head set is not the set of events without children.
    Heads {
        replica: ReplicaId,
        expected: Vec<Id>,
        actual: Vec<Id>,
    },

    /// A listing yielded an event before one of its parents.
    Topology {
        replica: ReplicaId,
        event: Id,
        parent: Id,
    },

    /// An event's logical time is not after a parent's, or is reused.
    Clock {
        replica: ReplicaId,
        event: Id,
        time: u64,
        conflicting: Id,
        conflicting_time: u64,
    },

    /// Paging with checkpoints missed or repeated events.
    Paging {
        replica: ReplicaId,
        missing: Vec<Id>,
        repeated: Vec<Id>,
    },

    /// Resubmitting a stored event changed the store.
    Idempotence {
        replica: ReplicaId,
        event: Id,
        returned: Id,
    },

    /// Events were still waiting on parents after the final drain.
    Stalled { replica: ReplicaId, parked: usize },
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Convergence {
                replica_a,
                replica_b,
                only_in_a,
                only_in_b,
            } => write!(
                f,
                "Convergence: replicas {replica_a} and {replica_b} diverge \
                 (only_in_a={}, only_in_b={})",
                only_in_a.len(),
                only_in_b.len()
            ),
            Self::Heads {
                replica,
                expected,
                actual,
            } => write!(
                f,
                "Heads: replica {replica} tracks {} heads, expected {}",
                actual.len(),
                expected.len()
            ),
            Self::Topology {
                replica,
                event,
                parent,
            } => write!(f, "Topology: replica {replica} listed {event} before parent {parent}"),
            Self::Clock {
                replica,
                event,
                time,
                conflicting,
                conflicting_time,
            } => write!(
                f,
                "Clock: replica {replica} gave {event} time {time}, \
                 {conflicting} has {conflicting_time}"
            ),
            Self::Paging {
                replica,
                missing,
                repeated,
            } => write!(
                f,
                "Paging: replica {replica} missed {} and repeated {} events",
                missing.len(),
                repeated.len()
            ),
            Self::Idempotence {
                replica,
                event,
                returned,
            } => write!(
                f,
                "Idempotence: replica {replica} resubmitting {event} returned {returned} or moved heads"
            ),
            Self::Stalled { replica, parked } => {
                write!(f, "Stalled: replica {replica} still holds {parked} parked events")
            }
        }
    }
}

// ── Oracle ────────────────────────────────────────────────────────────────────

/// Oracle for verifying event store invariants after simulation.
///
/// # Invariants checked
///
/// 1. **Convergence**: every replica stores the same key set.
/// 2. **Heads**: each head set is exactly the childless events.
/// 3. **Topology**: listings never yield a child before its parent.
/// 4. **Clock**: times are unique per replica and increase along edges.
/// 5. **Paging**: checkpointed pages cover the listing exactly once.
/// 6. **Idempotence**: resubmission returns the same key and keeps heads.
/// 7. **Progress**: no event stays parked once everything is delivered.
pub struct StoreOracle;

impl StoreOracle {
    #[must_use]
    pub fn check_convergence(states: &[ReplicaState]) -> OracleResult {
        let mut violations = Vec::new();
        for (i, a) in states.iter().enumerate() {
            for b in &states[i + 1..] {
                if a.keys == b.keys {
                    continue;
                }
                violations.push(InvariantViolation::Convergence {
                    replica_a: a.id,
                    replica_b: b.id,
                    only_in_a: a.keys.difference(&b.keys).cloned().collect(),
                    only_in_b: b.keys.difference(&a.keys).cloned().collect(),
                });
            }
        }
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_heads(states: &[ReplicaState]) -> OracleResult {
        let mut violations = Vec::new();
        for state in states {
            let with_children: HashSet<&Id> =
                state.listing.iter().flat_map(|e| &e.meta.parents).collect();
            let expected: Vec<Id> = state
                .listing
                .iter()
                .filter(|e| !with_children.contains(&e.key))
                .map(|e| e.key.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            if expected != state.heads {
                violations.push(InvariantViolation::Heads {
                    replica: state.id,
                    expected,
                    actual: state.heads.clone(),
                });
            }
        }
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_topology(states: &[ReplicaState]) -> OracleResult {
        let mut violations = Vec::new();
        for state in states {
            let mut seen = HashSet::new();
            for event in &state.listing {
                if let Some(parent) = event.meta.parents.iter().find(|p| !seen.contains(*p)) {
                    violations.push(InvariantViolation::Topology {
                        replica: state.id,
                        event: event.key.clone(),
                        parent: parent.clone(),
                    });
                }
                seen.insert(&event.key);
            }
        }
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_clock(states: &[ReplicaState]) -> OracleResult {
        let mut violations = Vec::new();
        for state in states {
            let mut by_time: HashMap<u64, &Id> = HashMap::new();
            let times: HashMap<&Id, u64> = state
                .listing
                .iter()
                .map(|e| (&e.key, e.time().get()))
                .collect();
            for event in &state.listing {
                let time = event.time().get();
                if let Some(other) = by_time.insert(time, &event.key) {
                    violations.push(InvariantViolation::Clock {
                        replica: state.id,
                        event: event.key.clone(),
                        time,
                        conflicting: other.clone(),
                        conflicting_time: time,
                    });
                }
                for parent in &event.meta.parents {
                    match times.get(parent) {
                        Some(&parent_time) if parent_time < time => {}
                        Some(&parent_time) => violations.push(InvariantViolation::Clock {
                            replica: state.id,
                            event: event.key.clone(),
                            time,
                            conflicting: parent.clone(),
                            conflicting_time: parent_time,
                        }),
                        // Reported by the topology check.
                        None => {}
                    }
                }
            }
        }
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_paging(states: &[ReplicaState]) -> OracleResult {
        let mut violations = Vec::new();
        for state in states {
            let mut seen = BTreeSet::new();
            let mut repeated = Vec::new();
            for key in &state.paged {
                if !seen.insert(key.clone()) {
                    repeated.push(key.clone());
                }
            }
            let missing: Vec<Id> = state.keys.difference(&seen).cloned().collect();
            if !missing.is_empty() || !repeated.is_empty() {
                violations.push(InvariantViolation::Paging {
                    replica: state.id,
                    missing,
                    repeated,
                });
            }
        }
        OracleResult::from_violations(violations)
    }

    /// `changed` holds `(replica, stored key, key returned on resubmission)`
    /// for every resubmission that was not a no-op.
    #[must_use]
    pub fn check_idempotence(changed: &[(ReplicaId, Id, Id)]) -> OracleResult {
        OracleResult::from_violations(
            changed
                .iter()
                .map(|(replica, event, returned)| InvariantViolation::Idempotence {
                    replica: *replica,
                    event: event.clone(),
                    returned: returned.clone(),
                })
                .collect(),
        )
    }

    #[must_use]
    pub fn check_progress(states: &[ReplicaState]) -> OracleResult {
        OracleResult::from_violations(
            states
                .iter()
                .filter(|s| s.parked > 0)
                .map(|s| InvariantViolation::Stalled {
                    replica: s.id,
                    parked: s.parked,
                })
                .collect(),
        )
    }

    /// Run every check and return a merged result.
    #[must_use]
    pub fn check_all(states: &[ReplicaState], changed: &[(ReplicaId, Id, Id)]) -> OracleResult {
        OracleResult::pass()
            .merge(Self::check_convergence(states))
            .merge(Self::check_heads(states))
            .merge(Self::check_topology(states))
            .merge(Self::check_clock(states))
            .merge(Self::check_paging(states))
            .merge(Self::check_idempotence(changed))
            .merge(Self::check_progress(states))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use causal_core::event::{EventMeta, EventType};
    use causal_core::{Blake3Hasher, ContentHasher, Event, LogicalTime};
    use serde_json::json;

    fn key(n: u8) -> Id {
        Blake3Hasher.hash(&[n])
    }

    fn event(n: u8, parents: &[u8], time: u64) -> Event {
        Event {
            key: key(n),
            event_type: EventType::new("doc.edit").unwrap(),
            payload: json!(n),
            meta: EventMeta {
                parents: parents.iter().map(|p| key(*p)).collect(),
                root: (!parents.is_empty()).then(|| key(0)),
                time: LogicalTime::new(time),
            },
        }
    }

    fn state(id: ReplicaId, listing: Vec<Event>) -> ReplicaState {
        let keys: BTreeSet<Id> = listing.iter().map(|e| e.key.clone()).collect();
        let with_children: HashSet<Id> = listing
            .iter()
            .flat_map(|e| e.meta.parents.clone())
            .collect();
        let heads = keys
            .iter()
            .filter(|k| !with_children.contains(*k))
            .cloned()
            .collect();
        ReplicaState {
            id,
            indexed: true,
            paged: listing.iter().map(|e| e.key.clone()).collect(),
            keys,
            heads,
            listing,
            parked: 0,
        }
    }

    fn chain() -> Vec<Event> {
        vec![event(0, &[], 0), event(1, &[0], 1), event(2, &[1], 2)]
    }

    #[test]
    fn consistent_replicas_pass_every_check() {
        let states = vec![state(0, chain()), state(1, chain())];
        let result = StoreOracle::check_all(&states, &[]);
        assert!(result.passed, "{:?}", result.violations);
    }

    #[test]
    fn divergent_key_sets_fail_convergence() {
        let mut short = chain();
        short.pop();
        let states = vec![state(0, chain()), state(1, short)];
        let result = StoreOracle::check_convergence(&states);
        assert!(!result.passed);
        assert_eq!(
            result.violations,
            vec![InvariantViolation::Convergence {
                replica_a: 0,
                replica_b: 1,
                only_in_a: vec![key(2)],
                only_in_b: vec![],
            }]
        );
    }

    #[test]
    fn stale_head_set_is_reported() {
        let mut s = state(0, chain());
        s.heads.push(key(0));
        s.heads.sort();
        let result = StoreOracle::check_heads(&[s]);
        assert!(matches!(result.violations[0], InvariantViolation::Heads { .. }));
    }

    #[test]
    fn child_before_parent_is_reported() {
        let mut listing = chain();
        listing.swap(1, 2);
        let result = StoreOracle::check_topology(&[state(0, listing)]);
        assert_eq!(
            result.violations,
            vec![InvariantViolation::Topology {
                replica: 0,
                event: key(2),
                parent: key(1),
            }]
        );
    }

    #[test]
    fn clock_must_increase_along_edges() {
        let listing = vec![event(0, &[], 5), event(1, &[0], 3)];
        let result = StoreOracle::check_clock(&[state(0, listing)]);
        assert_eq!(result.violations.len(), 1);

        let reused = vec![event(0, &[], 1), event(1, &[], 1)];
        assert!(!StoreOracle::check_clock(&[state(0, reused)]).passed);
    }

    #[test]
    fn paging_gaps_and_repeats_are_reported() {
        let mut s = state(0, chain());
        s.paged = vec![key(0), key(0), key(1)];
        let result = StoreOracle::check_paging(&[s]);
        assert_eq!(
            result.violations,
            vec![InvariantViolation::Paging {
                replica: 0,
                missing: vec![key(2)],
                repeated: vec![key(0)],
            }]
        );
    }

    #[test]
    fn idempotence_and_progress_failures_surface() {
        let mut s = state(0, chain());
        s.parked = 2;
        let result = StoreOracle::check_all(&[s], &[(0, key(1), key(1))]);
        assert!(!result.passed);
        assert_eq!(result.violations.len(), 2);
        let text: Vec<String> = result.violations.iter().map(ToString::to_string).collect();
        assert!(text[0].starts_with("Idempotence"));
        assert!(text[1].starts_with("Stalled"));
    }
}
