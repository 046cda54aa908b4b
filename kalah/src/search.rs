//! Depth-bounded lookahead for the reference bots.
//!
//! Negamax with alpha-beta pruning over deep copies of the position. A move
//! that ends in the own store does not pass the turn, so the recursion keeps
//! the side and skips the sign flip for those branches.

use crate::{Board, Side};

/// The strongest pit for `side` at the given search depth, or `None` when the
/// side has no legal move. Every speculative move runs on a copy; the board
/// handed in is never touched.
pub fn best_move(board: &Board, side: Side, depth: u32) -> Option<usize> {
    let (count, last) = board.moves(side);
    if count == 0 {
        return None;
    }
    if count == 1 {
        return Some(last);
    }

    let mut best = i64::MIN;
    let mut chosen = last;
    let mut alpha = i64::MIN + 1;
    for pit in 0..board.size() {
        if !board.legal(side, pit) {
            continue;
        }
        let mut child = board.clone();
        let again = child.sow(side, pit);
        let value = if again {
            descend(&child, side, depth, alpha, i64::MAX)
        } else {
            -descend(&child, side.opposite(), depth, i64::MIN + 1, -alpha)
        };
        if value > best {
            best = value;
            chosen = pit;
        }
        alpha = alpha.max(value);
    }
    Some(chosen)
}

fn descend(board: &Board, side: Side, depth: u32, mut alpha: i64, beta: i64) -> i64 {
    if board.over() {
        let mut settled = board.clone();
        settled.collect();
        return lead(&settled, side);
    }
    if depth == 0 {
        return lead(board, side);
    }

    let mut best = i64::MIN + 1;
    for pit in 0..board.size() {
        if !board.legal(side, pit) {
            continue;
        }
        let mut child = board.clone();
        let again = child.sow(side, pit);
        let value = if again {
            descend(&child, side, depth - 1, alpha, beta)
        } else {
            -descend(&child, side.opposite(), depth - 1, -beta, -alpha)
        };
        best = best.max(value);
        alpha = alpha.max(value);
        if alpha >= beta {
            break;
        }
    }
    best
}

/// Store difference from `side`'s point of view.
fn lead(board: &Board, side: Side) -> i64 {
    board.store(side) as i64 - board.store(side.opposite()) as i64
}
