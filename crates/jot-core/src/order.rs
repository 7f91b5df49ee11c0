//! Sort key allocation for manual ordering
//!
//! Records carry an integer sort key and render smallest-first. New keys are
//! handed out with a fixed gap so a card can later be dropped between two
//! neighbors without rewriting the rest of the list. When the gap between
//! two neighbors is used up, [`order_for_move`] reports exhaustion and the
//! caller respaces the whole collection with [`renormalize`].

/// Gap left between neighboring sort keys
pub const ORDER_GAP: i64 = 1000;

/// Sort key for a record inserted at the top of the list
///
/// An empty collection seeds the keyspace with the current timestamp;
/// afterwards new cards go one gap above the current minimum.
#[must_use]
pub fn order_for_insert_at_top(orders: &[i64], now_ms: i64) -> i64 {
    orders
        .iter()
        .min()
        .map_or(now_ms, |min| min.saturating_sub(ORDER_GAP))
}

/// Sort key that places the record at `from` onto position `to`
///
/// `orders` is the current render order. `to` addresses the position in the
/// resulting list and is clamped to it. Returns `None` when the keyspace
/// between the destination neighbors is exhausted; the caller renormalizes
/// and tries again.
#[must_use]
pub fn order_for_move(orders: &[i64], from: usize, to: usize) -> Option<i64> {
    if from >= orders.len() {
        return None;
    }
    let to = to.min(orders.len() - 1);
    if from == to {
        return Some(orders[from]);
    }

    // Neighbors are taken from the list with the moving record removed
    let mut reduced: Vec<i64> = Vec::with_capacity(orders.len() - 1);
    reduced.extend_from_slice(&orders[..from]);
    reduced.extend_from_slice(&orders[from + 1..]);

    let prev = to.checked_sub(1).and_then(|i| reduced.get(i).copied());
    let next = reduced.get(to).copied();

    match (prev, next) {
        (None, None) => Some(orders[from]),
        (None, Some(next)) => next.checked_sub(ORDER_GAP),
        (Some(prev), None) => prev.checked_add(ORDER_GAP),
        (Some(prev), Some(next)) => {
            let mid = midpoint(prev, next);
            (mid != prev && mid != next).then_some(mid)
        }
    }
}

/// Evenly respaced sort keys for a collection of `count` records
///
/// Keys are assigned in render order. Respacing changes sort keys only;
/// `updated_at` is a content timestamp and must not move.
#[must_use]
pub fn renormalize(count: usize) -> Vec<i64> {
    (1i64..).take(count).map(|i| i * ORDER_GAP).collect()
}

#[allow(clippy::cast_possible_truncation)] // result lies between the i64 inputs
const fn midpoint(a: i64, b: i64) -> i64 {
    ((a as i128 + b as i128) / 2) as i64
}
