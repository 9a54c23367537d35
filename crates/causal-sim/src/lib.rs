//! causal-sim library.
//!
//! Deterministic simulation of several event-store replicas authoring events
//! and exchanging them over a faulty network. Each replica owns a separate
//! in-memory [`causal_core::EventStore`]; replicas alternate between indexed
//! and walk-only query strategies so the oracle compares both.
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod campaign;
pub mod network;
pub mod oracle;
pub mod replica;
pub mod rng;
pub mod workload;

use anyhow::{Result, bail};
use causal_core::{Cancel, Id};
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;
use tracing::{debug, info};

use crate::network::{FaultConfig, NetworkMessage, SimulatedNetwork};
use crate::replica::{Delivery, ReplicaId, ReplicaState, SimulatedReplica};
use crate::rng::DeterministicRng;
use crate::workload::{Action, WorkloadConfig, author, choose_action};

/// Parameters of one simulation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    pub replica_count: usize,
    pub rounds: u64,
    pub workload: WorkloadConfig,
    pub fault: FaultConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            replica_count: 3,
            rounds: 24,
            workload: WorkloadConfig::default(),
            fault: FaultConfig::default(),
        }
    }
}

/// One entry of the simulation trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub round: u64,
    pub kind: TraceEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TraceEventKind {
    Author {
        replica: ReplicaId,
        action: Action,
        key: Id,
    },
    Deliver {
        from: ReplicaId,
        to: ReplicaId,
        key: Id,
        outcome: Delivery,
    },
    Partition {
        replica: ReplicaId,
        isolated: bool,
    },
    Reorder {
        messages: usize,
    },
    Drain {
        messages: usize,
    },
}

/// Everything a finished run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub seed: u64,
    pub trace: Vec<TraceEvent>,
    /// Replica states after the final drain.
    pub states: Vec<ReplicaState>,
    /// Resubmissions that were not no-ops: `(replica, stored, returned)`.
    pub non_idempotent: Vec<(ReplicaId, Id, Id)>,
    /// Whether the run hit parking, duplicates, reordering or partitions.
    pub interesting_state_reached: bool,
}

impl SimulationResult {
    /// Keys authored during the run, in trace order, without repeats.
    #[must_use]
    pub fn authored_keys(&self) -> Vec<Id> {
        let mut seen = std::collections::HashSet::new();
        self.trace
            .iter()
            .filter_map(|t| match &t.kind {
                TraceEventKind::Author { key, .. } => Some(key.clone()),
                _ => None,
            })
            .filter(|k| seen.insert(k.clone()))
            .collect()
    }
}

/// Runs one seeded simulation on a private single-threaded runtime.
#[derive(Debug)]
pub struct Simulator {
    config: SimulationConfig,
    runtime: Runtime,
}

impl Simulator {
    /// # Errors
    ///
    /// Returns an error for an invalid config or if the runtime cannot start.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        if config.replica_count == 0 {
            bail!("replica_count must be > 0");
        }
        if config.rounds == 0 {
            bail!("rounds must be > 0");
        }
        let runtime = tokio::runtime::Builder::new_current_thread().build()?;
        Ok(Self { config, runtime })
    }

    #[must_use]
    pub const fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Run all rounds, drain the network and snapshot every replica.
    ///
    /// # Errors
    ///
    /// Returns an error if any replica's store fails for a reason other
    /// than a missing dependency.
    pub fn run(&mut self) -> Result<SimulationResult> {
        let config = self.config;
        self.runtime.block_on(simulate(config))
    }
}

async fn simulate(config: SimulationConfig) -> Result<SimulationResult> {
    let cancel = Cancel::new();
    let mut rng = DeterministicRng::new(config.seed);
    let mut network = SimulatedNetwork::new(config.fault);
    let mut trace = Vec::new();
    let mut interesting = false;

    let mut replicas = Vec::with_capacity(config.replica_count);
    for id in 0..config.replica_count {
        replicas.push(SimulatedReplica::open(id, id % 2 == 0).await?);
    }

    for round in 0..config.rounds {
        if config.replica_count > 1 && rng.hit_rate_percent(config.fault.partition_rate_percent) {
            let replica = rng.next_index(config.replica_count);
            let isolated = !network.is_partitioned(replica);
            network.set_partitioned(replica, isolated);
            interesting = true;
            trace.push(TraceEvent {
                round,
                kind: TraceEventKind::Partition { replica, isolated },
            });
        }

        for replica in &mut replicas {
            if !rng.hit_rate_percent(config.workload.emit_percent) {
                continue;
            }
            let action = replica.with_view(|view| choose_action(&config.workload, view, &mut rng));
            let serial = replica.next_serial();
            let id = replica.id();
            let event = replica.with_view(|view| author(action, view, id, serial, &mut rng));
            let key = replica.author(event.clone(), &cancel).await?;
            trace.push(TraceEvent {
                round,
                kind: TraceEventKind::Author {
                    replica: id,
                    action,
                    key,
                },
            });

            for to in (0..config.replica_count).filter(|&to| to != id) {
                let message = NetworkMessage {
                    from: id,
                    to,
                    event: event.clone(),
                };
                if network.send(message, round, &mut rng).duplicated {
                    interesting = true;
                }
            }
        }

        let outcome = network.deliver_ready(round, &mut rng);
        if outcome.reordered {
            interesting = true;
            trace.push(TraceEvent {
                round,
                kind: TraceEventKind::Reorder {
                    messages: outcome.delivered.len(),
                },
            });
        }
        interesting |= deliver(&mut replicas, outcome.delivered, round, &mut trace, &cancel).await?;
    }

    let leftover = network.drain();
    trace.push(TraceEvent {
        round: config.rounds,
        kind: TraceEventKind::Drain {
            messages: leftover.len(),
        },
    });
    interesting |= deliver(&mut replicas, leftover, config.rounds, &mut trace, &cancel).await?;

    let mut states = Vec::with_capacity(replicas.len());
    let mut non_idempotent = Vec::new();
    for replica in &replicas {
        for (stored, returned) in replica.resubmit_all(&cancel).await? {
            non_idempotent.push((replica.id(), stored, returned));
        }
        states.push(replica.snapshot(&cancel).await?);
    }

    info!(
        seed = config.seed,
        events = states.first().map_or(0, |s| s.keys.len()),
        trace = trace.len(),
        interesting,
        "simulation complete"
    );

    Ok(SimulationResult {
        seed: config.seed,
        trace,
        states,
        non_idempotent,
        interesting_state_reached: interesting,
    })
}

/// Hand messages to their receivers; `true` if any arrived early or twice.
async fn deliver(
    replicas: &mut [SimulatedReplica],
    messages: Vec<NetworkMessage>,
    round: u64,
    trace: &mut Vec<TraceEvent>,
    cancel: &Cancel,
) -> Result<bool> {
    let mut interesting = false;
    for message in messages {
        let Some(replica) = replicas.get_mut(message.to) else {
            bail!("message addressed to unknown replica {}", message.to);
        };
        let key = replica.store().key_of(&message.event);
        let outcome = replica.receive(message.event, cancel).await?;
        debug!(round, from = message.from, to = message.to, ?outcome, "delivered");
        interesting |= outcome != Delivery::Stored;
        trace.push(TraceEvent {
            round,
            kind: TraceEventKind::Deliver {
                from: message.from,
                to: message.to,
                key,
                outcome,
            },
        });
    }
    Ok(interesting)
}
