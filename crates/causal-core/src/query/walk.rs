//! Graph-walk query strategy for stores without a secondary index.
//!
//! The walk collects every event reachable backwards from the head set that
//! is not already covered by the checkpoint, assigns each a level (longest
//! path from the oldest collected ancestor), and pops them from a min-heap on
//! `(level, key)`. A parent always has a lower level than its child, so the
//! output is topologically sorted and ties break deterministically by key.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};

use tracing::{debug, warn};

use super::{Page, Query, Sources, fetch, load_since};
use crate::backend::ContentStore;
use crate::cancel::Cancel;
use crate::error::StoreError;
use crate::event::Event;
use crate::id::Id;

pub(crate) async fn run(
    src: Sources<'_>,
    query: &Query,
    cancel: &Cancel,
) -> Result<Page<Event>, StoreError> {
    let since = query.normalized_since();
    let since_events = load_since(src.content, &since, cancel).await?;
    let excluded = covered_by(src.content, since_events, cancel).await?;

    let starts: Vec<Id> = src
        .heads
        .snapshot()
        .into_iter()
        .filter(|k| !excluded.contains(k))
        .collect();
    let graph = collect(src.content, starts, &excluded, cancel).await?;
    let levels = levels(&graph);

    let mut heap: BinaryHeap<Reverse<(u64, &Id)>> = levels
        .iter()
        .map(|(key, level)| Reverse((*level, *key)))
        .collect();

    let limit = query.limit.unwrap_or(usize::MAX);
    let mut rolling: BTreeSet<Id> = since.iter().cloned().collect();
    let mut popped: Vec<&Event> = Vec::with_capacity(graph.len());
    let mut items: Vec<Event> = Vec::new();

    while let Some(Reverse((_, key))) = heap.pop() {
        if !query.head && items.len() >= limit {
            break;
        }
        let Some(event) = graph.get(key) else {
            continue;
        };
        for parent in &event.meta.parents {
            rolling.remove(parent);
        }
        rolling.insert(key.clone());
        popped.push(event);

        if !query.head && query.matches(event, src.separators) {
            items.push(event.clone());
        }
    }

    let checkpoint = if query.head {
        items = popped
            .into_iter()
            .filter(|e| rolling.contains(&e.key) && query.matches(e, src.separators))
            .take(limit)
            .cloned()
            .collect();
        if items.is_empty() {
            since
        } else {
            items.iter().map(|e| e.key.clone()).collect()
        }
    } else {
        rolling.into_iter().collect()
    };

    debug!(
        head = query.head,
        visited = graph.len(),
        yielded = items.len(),
        "graph-walk query"
    );
    Ok(Page { items, checkpoint })
}

/// Checkpoint events and all of their ancestors.
async fn covered_by(
    content: &dyn ContentStore,
    since: Vec<Event>,
    cancel: &Cancel,
) -> Result<HashSet<Id>, StoreError> {
    let mut covered: HashSet<Id> = since.iter().map(|e| e.key.clone()).collect();
    let mut queue: VecDeque<Id> = VecDeque::new();
    for event in &since {
        for parent in &event.meta.parents {
            if covered.insert(parent.clone()) {
                queue.push_back(parent.clone());
            }
        }
    }

    while let Some(current) = queue.pop_front() {
        cancel.check()?;
        let Some(event) = fetch(content, &current).await? else {
            continue;
        };
        for parent in event.meta.parents {
            if covered.insert(parent.clone()) {
                queue.push_back(parent);
            }
        }
    }
    Ok(covered)
}

/// Events reachable backwards from `starts` without entering `excluded`.
async fn collect(
    content: &dyn ContentStore,
    starts: Vec<Id>,
    excluded: &HashSet<Id>,
    cancel: &Cancel,
) -> Result<HashMap<Id, Event>, StoreError> {
    let mut graph: HashMap<Id, Event> = HashMap::new();
    let mut seen: HashSet<Id> = starts.iter().cloned().collect();
    let mut queue: VecDeque<Id> = starts.into();

    while let Some(current) = queue.pop_front() {
        cancel.check()?;
        let Some(event) = fetch(content, &current).await? else {
            warn!(key = %current, "head without content record, skipping");
            continue;
        };
        for parent in &event.meta.parents {
            if !excluded.contains(parent) && seen.insert(parent.clone()) {
                queue.push_back(parent.clone());
            }
        }
        graph.insert(current, event);
    }
    Ok(graph)
}

/// Level of every collected event: 0 when none of its parents were
/// collected, else one more than the highest collected parent.
///
/// Iterative post-order DFS; shared ancestors are computed once.
fn levels(graph: &HashMap<Id, Event>) -> HashMap<&Id, u64> {
    let mut levels: HashMap<&Id, u64> = HashMap::with_capacity(graph.len());
    let mut stack: Vec<(&Id, bool)> = Vec::new();

    for start in graph.keys() {
        if levels.contains_key(start) {
            continue;
        }
        stack.push((start, false));
        while let Some((key, expanded)) = stack.pop() {
            if levels.contains_key(key) {
                continue;
            }
            let parents = graph[key]
                .meta
                .parents
                .iter()
                .filter_map(|p| graph.get_key_value(p).map(|(k, _)| k));
            if expanded {
                let level = parents
                    .filter_map(|p| levels.get(p))
                    .max()
                    .map_or(0, |max| max + 1);
                levels.insert(key, level);
            } else {
                stack.push((key, true));
                stack.extend(
                    parents
                        .filter(|p| !levels.contains_key(*p))
                        .map(|p| (p, false)),
                );
            }
        }
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventType, LogicalTime, NewEvent};
    use crate::id::Blake3Hasher;
    use serde_json::json;

    fn add(graph: &mut HashMap<Id, Event>, n: u64, root: Option<&Id>, parents: &[&Id]) -> Id {
        let ty = EventType::new("t").unwrap();
        let new = match root {
            Some(root) => NewEvent::child(ty, json!(n), root.clone(), parents.iter().map(|p| (*p).clone())),
            None => NewEvent::genesis(ty, json!(n)),
        };
        let key = new.key_with(&Blake3Hasher);
        graph.insert(key.clone(), new.into_event(key.clone(), LogicalTime::new(n)));
        key
    }

    #[test]
    fn levels_follow_longest_path() {
        let mut graph = HashMap::new();
        let g = add(&mut graph, 0, None, &[]);
        let a = add(&mut graph, 1, Some(&g), &[&g]);
        let b = add(&mut graph, 2, Some(&g), &[&a]);
        let c = add(&mut graph, 3, Some(&g), &[&g]);
        let d = add(&mut graph, 4, Some(&g), &[&b, &c]);

        let levels = levels(&graph);
        assert_eq!(levels[&g], 0);
        assert_eq!(levels[&a], 1);
        assert_eq!(levels[&b], 2);
        assert_eq!(levels[&c], 1);
        assert_eq!(levels[&d], 3);
    }

    #[test]
    fn uncollected_parents_do_not_count() {
        let mut graph = HashMap::new();
        let g = add(&mut graph, 0, None, &[]);
        let a = add(&mut graph, 1, Some(&g), &[&g]);
        graph.remove(&g);

        let levels = levels(&graph);
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[&a], 0);
    }
}
