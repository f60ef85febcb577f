//! New-item detection against a watermark.

use crate::types::Item;

/// Outcome of [`dedup`].
#[derive(Debug, Clone, PartialEq)]
pub struct Dedup {
    /// Items to deliver, in source (newest-first) order.
    pub new_items: Vec<Item>,
    /// Watermark to persist once the new items were dispatched.
    pub last_seen: Option<String>,
}

/// Split a newest-first batch into the items not seen before.
///
/// - no watermark: baseline poll, nothing is new;
/// - watermark found at position `p`: the `p` items before it are new;
/// - watermark not found: every item is new.
///
/// The returned watermark is the newest item id, or the previous one when the
/// batch is empty.
pub fn dedup(last_seen: Option<&str>, mut items: Vec<Item>) -> Dedup {
    let Some(first) = items.first() else {
        return Dedup {
            new_items: Vec::new(),
            last_seen: last_seen.map(str::to_string),
        };
    };
    let newest = Some(first.id.clone());

    let Some(last_seen) = last_seen else {
        return Dedup {
            new_items: Vec::new(),
            last_seen: newest,
        };
    };

    if let Some(position) = items.iter().position(|item| item.id == last_seen) {
        items.truncate(position);
    }
    Dedup {
        new_items: items,
        last_seen: newest,
    }
}
