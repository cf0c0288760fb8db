// Snake pick order: odd rounds run the draft order forward, even rounds
// run it in reverse. Every consumer derives the order from the same inputs,
// so no precomputed order ever needs to be pushed by the server.

/// The pick order for a given round (1-indexed).
pub fn round_order<T: Clone>(draft_order: &[T], round: u32) -> Vec<T> {
    if is_reversed(round) {
        draft_order.iter().rev().cloned().collect()
    } else {
        draft_order.to_vec()
    }
}

/// Round (1-indexed) that an overall pick number falls in.
pub fn round_of(order_len: usize, pick_number: u32) -> u32 {
    if order_len == 0 || pick_number == 0 {
        return 0;
    }
    (pick_number - 1) / order_len as u32 + 1
}

/// The participant holding the given overall pick number (1-indexed).
pub fn holder_at<T>(draft_order: &[T], pick_number: u32) -> Option<&T> {
    let n = draft_order.len();
    if n == 0 || pick_number == 0 {
        return None;
    }
    let idx = ((pick_number - 1) as usize) % n;
    let round = round_of(n, pick_number);
    if is_reversed(round) {
        draft_order.get(n - 1 - idx)
    } else {
        draft_order.get(idx)
    }
}

/// The participants adjacent to the current slot.
#[derive(Debug, PartialEq, Eq)]
pub struct Neighbors<'a, T> {
    pub just_picked: Option<&'a T>,
    pub up_next: Option<&'a T>,
}

/// Order-relative neighbours of `pick_number`.
///
/// At a round boundary the snake repeats the boundary participant
/// (…B, C | C, B…). The repeated slot is skipped so that the neighbour
/// reported is the next participant in the flipped direction. With a
/// single participant every slot belongs to them and nothing is skipped.
///
/// `total_picks` bounds `up_next`; pass `None` for an open-ended draft.
pub fn neighbors<T: PartialEq>(
    draft_order: &[T],
    pick_number: u32,
    total_picks: Option<u32>,
) -> Neighbors<'_, T> {
    let Some(current) = holder_at(draft_order, pick_number) else {
        return Neighbors {
            just_picked: None,
            up_next: None,
        };
    };
    let skip_repeats = draft_order.len() > 1;
    let in_range = |p: u32| p >= 1 && total_picks.map_or(true, |total| p <= total);

    let mut next = pick_number.checked_add(1);
    let mut up_next = None;
    while let Some(n) = next.filter(|&n| in_range(n)) {
        match holder_at(draft_order, n) {
            Some(h) if skip_repeats && h == current => next = n.checked_add(1),
            other => {
                up_next = other;
                break;
            }
        }
    }

    let mut prev = pick_number.saturating_sub(1);
    let mut just_picked = None;
    while in_range(prev) {
        match holder_at(draft_order, prev) {
            Some(h) if skip_repeats && h == current => prev -= 1,
            other => {
                just_picked = other;
                break;
            }
        }
    }

    Neighbors {
        just_picked,
        up_next,
    }
}

fn is_reversed(round: u32) -> bool {
    round % 2 == 0
}
