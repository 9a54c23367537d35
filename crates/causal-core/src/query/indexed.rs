//! Range-scan query strategy over the composite index.

use std::ops::Bound;

use tracing::{debug, warn};

use super::{Page, Query, Sources, load_since};
use crate::cancel::Cancel;
use crate::error::{Stage, StoreError};
use crate::event::{Event, LogicalTime};
use crate::id::Id;
use crate::index::{Axis, IndexKeyEncoder, entry_time, render_key};

/// Entries fetched per scan call.
const SCAN_BATCH: usize = 256;

/// Scan the axis matching `query`'s filters, starting just after the latest
/// checkpoint event.
///
/// Ticks are unique per store, so `[last yielded]` as the next `since`
/// resumes without gaps or repeats.
pub(crate) async fn run(
    src: Sources<'_>,
    encoder: &IndexKeyEncoder,
    query: &Query,
    cancel: &Cancel,
) -> Result<Page<Event>, StoreError> {
    let since = query.normalized_since();
    let from = load_since(src.content, &since, cancel)
        .await?
        .iter()
        .map(Event::time)
        .max()
        .map_or(LogicalTime::ZERO, LogicalTime::next);

    let axis = Axis::select(query.root.as_ref(), query.event_type.as_ref());
    let prefix_len = encoder.prefix(axis, query.head).len();
    let mut range = encoder.time_range(axis, query.head, from).limit(SCAN_BATCH);
    let limit = query.limit.unwrap_or(usize::MAX);
    let mut items: Vec<Event> = Vec::new();

    'scan: while items.len() < limit {
        cancel.check()?;
        let rows = src
            .kv
            .scan(&range, cancel)
            .await
            .map_err(|e| StoreError::failed(Stage::IndexRead, e))?;
        let exhausted = rows.len() < SCAN_BATCH;

        let keys = rows
            .iter()
            .map(|(entry, value)| {
                Id::from_bytes(value).map_err(|e| StoreError::Corrupt {
                    key: render_key(entry),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let records = src
            .content
            .get_many(&keys)
            .await
            .map_err(|e| StoreError::failed(Stage::ContentRead, e))?;

        for ((entry, _), (key, record)) in rows.iter().zip(keys.iter().zip(records)) {
            let event = record.map(|bytes| Event::decode(key, &bytes)).transpose()?;
            match event {
                // An entry left by an interrupted put carries the time of
                // that attempt, not the stored one.
                Some(event) if entry_time(entry, prefix_len) == Some(event.time()) => {
                    items.push(event);
                }
                Some(_) => warn!(
                    entry = %render_key(entry),
                    key = %key,
                    "stale index entry, skipping"
                ),
                None => warn!(
                    entry = %render_key(entry),
                    key = %key,
                    "index entry without content record, skipping"
                ),
            }
            if items.len() >= limit {
                break 'scan;
            }
        }

        match rows.last() {
            Some((last, _)) if !exhausted => range.lower = Bound::Excluded(last.clone()),
            _ => break,
        }
    }

    let checkpoint = if items.is_empty() {
        since
    } else if query.head {
        items.iter().map(|e| e.key.clone()).collect()
    } else {
        items.last().map(|e| vec![e.key.clone()]).unwrap_or_default()
    };
    debug!(
        axis = %char::from(axis.tag()),
        head = query.head,
        from = %from,
        yielded = items.len(),
        "indexed query"
    );
    Ok(Page { items, checkpoint })
}
