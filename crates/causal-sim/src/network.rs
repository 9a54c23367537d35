use std::collections::BTreeSet;

use causal_core::NewEvent;
use serde::{Deserialize, Serialize};

use crate::replica::ReplicaId;
use crate::rng::DeterministicRng;

/// Fault injection configuration for simulated event delivery.
///
/// Nothing is ever lost: delayed, duplicated and partitioned messages all
/// arrive eventually, so replicas are expected to converge after the final
/// drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Maximum delivery delay in rounds.
    pub max_delay_rounds: u8,
    /// Percentage of sends duplicated.
    pub duplicate_rate_percent: u8,
    /// Percentage chance of shuffling ready messages at each round.
    pub reorder_rate_percent: u8,
    /// Percentage chance per round to toggle a random replica's partition.
    pub partition_rate_percent: u8,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            max_delay_rounds: 3,
            duplicate_rate_percent: 5,
            reorder_rate_percent: 20,
            partition_rate_percent: 5,
        }
    }
}

/// An event in flight between two replicas.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkMessage {
    pub from: ReplicaId,
    pub to: ReplicaId,
    pub event: NewEvent,
}

#[derive(Debug, Clone, PartialEq)]
struct PendingMessage {
    deliver_at_round: u64,
    message: NetworkMessage,
}

/// Result of a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    pub duplicated: bool,
    pub delay_rounds: u8,
}

/// Result of delivering all ready messages for a round.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliverOutcome {
    pub delivered: Vec<NetworkMessage>,
    /// Whether delivery order was shuffled.
    pub reordered: bool,
}

/// Deterministic fault-injecting network model.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedNetwork {
    pending: Vec<PendingMessage>,
    partitioned: BTreeSet<ReplicaId>,
    fault: FaultConfig,
}

impl SimulatedNetwork {
    #[must_use]
    pub const fn new(fault: FaultConfig) -> Self {
        Self {
            pending: Vec::new(),
            partitioned: BTreeSet::new(),
            fault,
        }
    }

    #[must_use]
    pub const fn fault_config(&self) -> FaultConfig {
        self.fault
    }

    /// Isolate or reconnect a replica. Messages to or from an isolated
    /// replica stay queued until it reconnects.
    pub fn set_partitioned(&mut self, replica: ReplicaId, isolated: bool) {
        if isolated {
            self.partitioned.insert(replica);
        } else {
            self.partitioned.remove(&replica);
        }
    }

    #[must_use]
    pub fn is_partitioned(&self, replica: ReplicaId) -> bool {
        self.partitioned.contains(&replica)
    }

    /// Number of queued in-flight messages.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Queue a message with a random delay, possibly twice.
    pub fn send(
        &mut self,
        message: NetworkMessage,
        round: u64,
        rng: &mut DeterministicRng,
    ) -> SendOutcome {
        let delay_bound = u64::from(self.fault.max_delay_rounds).saturating_add(1);
        let delay = u8::try_from(rng.next_bounded(delay_bound)).unwrap_or(self.fault.max_delay_rounds);
        let deliver_at_round = round.saturating_add(u64::from(delay));

        let duplicated = rng.hit_rate_percent(self.fault.duplicate_rate_percent);
        if duplicated {
            // The copy trails the original by a round.
            self.pending.push(PendingMessage {
                deliver_at_round: deliver_at_round.saturating_add(1),
                message: message.clone(),
            });
        }
        self.pending.push(PendingMessage {
            deliver_at_round,
            message,
        });

        SendOutcome {
            duplicated,
            delay_rounds: delay,
        }
    }

    /// Deliver every due message whose endpoints are both connected.
    #[must_use]
    pub fn deliver_ready(&mut self, round: u64, rng: &mut DeterministicRng) -> DeliverOutcome {
        let mut ready = Vec::new();
        let mut waiting = Vec::new();

        for pending in self.pending.drain(..) {
            let blocked = self.partitioned.contains(&pending.message.from)
                || self.partitioned.contains(&pending.message.to);
            if pending.deliver_at_round <= round && !blocked {
                ready.push(pending.message);
            } else {
                waiting.push(pending);
            }
        }
        self.pending = waiting;

        let reordered = ready.len() > 1 && rng.hit_rate_percent(self.fault.reorder_rate_percent);
        if reordered {
            rng.shuffle(&mut ready);
        }

        DeliverOutcome {
            delivered: ready,
            reordered,
        }
    }

    /// Heal every partition and hand over everything still in flight.
    pub fn drain(&mut self) -> Vec<NetworkMessage> {
        self.partitioned.clear();
        self.pending.drain(..).map(|p| p.message).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use causal_core::event::EventType;
    use serde_json::json;

    fn message(to: ReplicaId) -> NetworkMessage {
        NetworkMessage {
            from: 0,
            to,
            event: NewEvent::genesis(EventType::new("doc.new").unwrap(), json!(to)),
        }
    }

    fn quiet() -> FaultConfig {
        FaultConfig {
            max_delay_rounds: 0,
            duplicate_rate_percent: 0,
            reorder_rate_percent: 0,
            partition_rate_percent: 0,
        }
    }

    #[test]
    fn undelayed_messages_arrive_the_same_round() {
        let mut rng = DeterministicRng::new(1);
        let mut net = SimulatedNetwork::new(quiet());
        let outcome = net.send(message(1), 4, &mut rng);
        assert_eq!(outcome.delay_rounds, 0);
        let delivered = net.deliver_ready(4, &mut rng).delivered;
        assert_eq!(delivered, vec![message(1)]);
        assert_eq!(net.pending_len(), 0);
    }

    #[test]
    fn delays_hold_messages_back() {
        let mut rng = DeterministicRng::new(2);
        let mut net = SimulatedNetwork::new(FaultConfig {
            max_delay_rounds: 5,
            ..quiet()
        });
        for to in 0..20 {
            let _ = net.send(message(to), 0, &mut rng);
        }
        let mut total = 0;
        for round in 0..=5 {
            total += net.deliver_ready(round, &mut rng).delivered.len();
        }
        assert_eq!(total, 20);
    }

    #[test]
    fn partition_holds_until_drain() {
        let mut rng = DeterministicRng::new(3);
        let mut net = SimulatedNetwork::new(quiet());
        net.set_partitioned(2, true);
        let _ = net.send(message(2), 0, &mut rng);
        assert!(net.deliver_ready(10, &mut rng).delivered.is_empty());
        assert_eq!(net.pending_len(), 1);

        let drained = net.drain();
        assert_eq!(drained, vec![message(2)]);
        assert!(!net.is_partitioned(2));
    }

    #[test]
    fn duplicates_are_queued_twice() {
        let mut rng = DeterministicRng::new(4);
        let mut net = SimulatedNetwork::new(FaultConfig {
            duplicate_rate_percent: 100,
            ..quiet()
        });
        let outcome = net.send(message(1), 0, &mut rng);
        assert!(outcome.duplicated);
        assert_eq!(net.pending_len(), 2);
    }
}
