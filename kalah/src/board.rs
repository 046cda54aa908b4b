//! The Kalah position and its mechanics.
//!
//! A board is parameterised by the number of pits per side and the initial
//! stone count. The textual wire form is
//! `<size,south_store,north_store,s0,…,s(n-1),n0,…,n(n-1)>`; parsing is
//! forgiving about interior whitespace.

use crate::{Outcome, Side};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// A Kalah position. Pit sequences run counter-clockwise from each player's
/// leftmost pit; the store sits to the player's right.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Board {
    size: usize,
    init: u32,
    stores: [u32; 2],
    pits: [Vec<u32>; 2],
}

/// A cell the sow walk can land on, relative to the sowing player.
#[derive(Copy, Clone)]
enum Loc {
    Pit(Side, usize),
    Store(Side),
}

impl Board {
    /// A fresh board: all pits hold `init` stones, both stores are empty.
    pub fn make(size: usize, init: u32) -> Board {
        assert!(size >= 1, "a board needs at least one pit per side");
        Board {
            size,
            init,
            stores: [0, 0],
            pits: [vec![init; size], vec![init; size]],
        }
    }

    /// Pits per side.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The initial stone count the board was created with. Retained so a
    /// fresh board of the same shape can be reconstructed.
    #[inline]
    pub fn init(&self) -> u32 {
        self.init
    }

    /// Stones in a side's store.
    #[inline]
    pub fn store(&self, side: Side) -> u32 {
        self.stores[side.idx()]
    }

    /// Stones in the named pit of a side.
    #[inline]
    pub fn pit(&self, side: Side, pit: usize) -> u32 {
        self.pits[side.idx()][pit]
    }

    /// All stones on the board, stores included. Conserved by `sow`.
    pub fn total(&self) -> u32 {
        let pits: u32 = self.pits.iter().flatten().sum();
        pits + self.stores[0] + self.stores[1]
    }

    /// True iff `pit` names a pit of that side holding at least one stone.
    pub fn legal(&self, side: Side, pit: usize) -> bool {
        pit < self.size && self.pits[side.idx()][pit] > 0
    }

    /// Number of legal moves for a side, and the last legal pit index.
    pub fn moves(&self, side: Side) -> (usize, usize) {
        let mut count = 0;
        let mut last = 0;
        for pit in 0..self.size {
            if self.pits[side.idx()][pit] > 0 {
                count += 1;
                last = pit;
            }
        }
        (count, last)
    }

    /// Uniformly picks a legal pit for a side.
    ///
    /// # Panics
    ///
    /// Panics if the side has no legal move.
    pub fn random(&self, side: Side) -> usize {
        use rand::seq::IndexedRandom;
        let legal: Vec<usize> = (0..self.size).filter(|&p| self.legal(side, p)).collect();
        *legal
            .choose(&mut rand::rng())
            .expect("no legal move to pick from")
    }

    /// Sows from the named pit. The stones are dropped one per cell walking
    /// counter-clockwise, filling the own store in passing and skipping the
    /// opponent's store entirely. Returns true iff the last stone landed in
    /// the own store and the player moves again. A last stone landing in an
    /// empty own pit captures the opposite pit, unless that pit is empty.
    ///
    /// # Panics
    ///
    /// Panics if the move is not legal; callers check `legal` first.
    pub fn sow(&mut self, side: Side, pit: usize) -> bool {
        assert!(self.legal(side, pit), "sow from an illegal pit");

        let mut stones = self.pits[side.idx()][pit];
        self.pits[side.idx()][pit] = 0;

        let size = self.size;
        let step = |loc: Loc| -> Loc {
            match loc {
                Loc::Pit(s, i) if i + 1 < size => Loc::Pit(s, i + 1),
                Loc::Pit(s, _) => Loc::Store(s),
                Loc::Store(s) => Loc::Pit(s.opposite(), 0),
            }
        };

        let mut loc = Loc::Pit(side, pit);
        while stones > 0 {
            loc = step(loc);
            // the opponent's store is never filled
            if let Loc::Store(s) = loc
                && s != side
            {
                loc = step(loc);
            }
            match loc {
                Loc::Pit(s, i) => self.pits[s.idx()][i] += 1,
                Loc::Store(s) => self.stores[s.idx()] += 1,
            }
            stones -= 1;
        }

        if let Loc::Store(_) = loc {
            return true;
        }

        // capture: last stone in an own empty pit takes the opposite pit,
        // but only if the opposite pit holds anything
        if let Loc::Pit(s, i) = loc
            && s == side
            && self.pits[s.idx()][i] == 1
        {
            let opposite = self.size - 1 - i;
            let taken = self.pits[s.opposite().idx()][opposite];
            if taken > 0 {
                self.pits[s.idx()][i] = 0;
                self.pits[s.opposite().idx()][opposite] = 0;
                self.stores[s.idx()] += taken + 1;
            }
        }

        false
    }

    /// True iff the game is finished: either side has run out of stones in
    /// its pits, or one store already holds strictly more than half of all
    /// stones (the early-win rule).
    pub fn over(&self) -> bool {
        let empty = self
            .pits
            .iter()
            .any(|side| side.iter().all(|&stones| stones == 0));
        let total = self.total();
        empty || self.stores[0] * 2 > total || self.stores[1] * 2 > total
    }

    /// Sweeps the remaining stones of each side into that side's store.
    /// Callers establish `over()` first; collecting twice is harmless.
    pub fn collect(&mut self) {
        debug_assert!(self.over(), "collect on a running game");
        for idx in 0..2 {
            self.stores[idx] += self.pits[idx].iter().sum::<u32>();
            self.pits[idx].fill(0);
        }
    }

    /// The result from the named side's perspective, on totals of pits plus
    /// store. `Pending` while the game is not over.
    pub fn outcome(&self, side: Side) -> Outcome {
        if !self.over() {
            return Outcome::Pending;
        }
        let tally = |s: Side| self.stores[s.idx()] + self.pits[s.idx()].iter().sum::<u32>();
        match tally(side).cmp(&tally(side.opposite())) {
            Ordering::Greater => Outcome::Win,
            Ordering::Less => Outcome::Loss,
            Ordering::Equal => Outcome::Draw,
        }
    }

    /// The position with both sides swapped. This is a deep copy meant for
    /// rendering state to a north-seated player; sowing happens on the
    /// original, never on a mirrored view.
    pub fn mirror(&self) -> Board {
        Board {
            size: self.size,
            init: self.init,
            stores: [self.stores[1], self.stores[0]],
            pits: [self.pits[1].clone(), self.pits[0].clone()],
        }
    }
}

#[cfg(test)]
impl Board {
    pub(crate) fn force_pit(&mut self, side: Side, pit: usize, stones: u32) {
        self.pits[side.idx()][pit] = stones;
    }

    pub(crate) fn force_store(&mut self, side: Side, stones: u32) {
        self.stores[side.idx()] = stones;
    }
}

/// Structural equality on the visible position; the retained `init` is
/// bookkeeping and does not survive the wire form.
impl PartialEq for Board {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size && self.stores == other.stores && self.pits == other.pits
    }
}

impl Eq for Board {}

impl Display for Board {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{},{},{}", self.size, self.stores[0], self.stores[1])?;
        for side in &self.pits {
            for stones in side {
                write!(f, ",{}", stones)?;
            }
        }
        write!(f, ">")
    }
}

impl FromStr for Board {
    type Err = String;

    /// Parses the `<…>` wire form. Interior whitespace is accepted; any
    /// token that is not a non-negative integer, or a count of tokens other
    /// than `1 + 2 + 2·size`, is rejected.
    fn from_str(s: &str) -> Result<Board, String> {
        let body = s
            .trim()
            .strip_prefix('<')
            .and_then(|rest| rest.strip_suffix('>'))
            .ok_or_else(|| format!("board literal not delimited by <>: {:?}", s))?;

        let mut numbers = Vec::new();
        for token in body.split(',') {
            let token = token.trim();
            let value: u32 = token
                .parse()
                .map_err(|_| format!("not a non-negative integer: {:?}", token))?;
            numbers.push(value);
        }

        let size = numbers[0] as usize;
        if size < 1 {
            return Err("board size must be at least 1".into());
        }
        if numbers.len() != 1 + 2 + 2 * size {
            return Err(format!(
                "expected {} numbers for size {}, got {}",
                1 + 2 + 2 * size,
                size,
                numbers.len()
            ));
        }

        let south = numbers[3..3 + size].to_vec();
        let north = numbers[3 + size..].to_vec();
        let total: u32 = numbers[1] + numbers[2] + south.iter().sum::<u32>() + north.iter().sum::<u32>();
        Ok(Board {
            size,
            // best-effort reconstruction value; the wire form does not carry it
            init: total / (2 * size as u32),
            stores: [numbers[1], numbers[2]],
            pits: [south, north],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_board_shape() {
        let b = Board::make(6, 4);
        assert_eq!(b.size(), 6);
        assert_eq!(b.total(), 48);
        assert_eq!(b.store(Side::South), 0);
        assert_eq!(b.store(Side::North), 0);
        assert_eq!(b.moves(Side::South), (6, 5));
    }

    #[test]
    fn legality_decides_emptiness() {
        let mut b = Board::make(3, 1);
        assert!(b.legal(Side::South, 0));
        assert!(!b.legal(Side::South, 3));
        b.sow(Side::South, 2); // lands in the store
        assert!(!b.legal(Side::South, 2));
    }

    #[test]
    fn sow_conserves_stones() {
        let mut b = Board::make(6, 4);
        let before = b.total();
        b.sow(Side::South, 0);
        assert_eq!(b.total(), before);
        b.sow(Side::North, 3);
        assert_eq!(b.total(), before);
    }

    #[test]
    fn landing_in_own_store_repeats() {
        let mut b = Board::make(6, 4);
        // pit 2 holds 4 stones, the fourth lands in the south store
        assert!(b.sow(Side::South, 2));
        assert_eq!(b.store(Side::South), 1);
    }

    #[test]
    fn sow_skips_opponent_store() {
        let mut b = Board::make(3, 1);
        // 8 stones from pit 0 walk the whole board twice past the north store
        b.pits[Side::South.idx()][0] = 8;
        let before = b.total();
        b.sow(Side::South, 0);
        assert_eq!(b.store(Side::North), 0);
        assert_eq!(b.total(), before);
    }

    #[test]
    fn capture_takes_opposite_pit() {
        let mut b = Board::make(6, 0);
        b.pits[Side::South.idx()][0] = 1;
        b.pits[Side::North.idx()][4] = 3; // opposite of south pit 1
        b.pits[Side::North.idx()][0] = 1; // keep the game open
        let again = b.sow(Side::South, 0);
        assert!(!again);
        assert_eq!(b.store(Side::South), 4);
        assert_eq!(b.pit(Side::South, 1), 0);
        assert_eq!(b.pit(Side::North, 4), 0);
    }

    #[test]
    fn no_capture_into_empty_opposite_pit() {
        let mut b = Board::make(6, 0);
        b.pits[Side::South.idx()][0] = 1;
        b.pits[Side::North.idx()][0] = 2;
        b.sow(Side::South, 0);
        assert_eq!(b.store(Side::South), 0);
        assert_eq!(b.pit(Side::South, 1), 1);
    }

    #[test]
    fn no_capture_on_occupied_own_pit() {
        let mut b = Board::make(6, 0);
        b.pits[Side::South.idx()][0] = 1;
        b.pits[Side::South.idx()][1] = 2;
        b.pits[Side::North.idx()][4] = 5;
        b.sow(Side::South, 0);
        assert_eq!(b.store(Side::South), 0);
        assert_eq!(b.pit(Side::South, 1), 3);
        assert_eq!(b.pit(Side::North, 4), 5);
    }

    #[test]
    fn over_on_empty_side() {
        let mut b = Board::make(3, 0);
        b.pits[Side::North.idx()] = vec![1, 1, 1];
        assert!(b.over());
    }

    #[test]
    fn over_on_early_win() {
        let mut b = Board::make(3, 3);
        // nobody is empty, but south already holds more than half of 18
        b.pits[Side::South.idx()] = vec![1, 1, 1];
        b.pits[Side::North.idx()] = vec![2, 2, 1];
        b.stores[Side::South.idx()] = 10;
        b.stores[Side::North.idx()] = 0;
        assert!(b.over());
        assert_eq!(b.outcome(Side::South), Outcome::Win);
        assert_eq!(b.outcome(Side::North), Outcome::Loss);
    }

    #[test]
    fn not_over_at_exactly_half() {
        let mut b = Board::make(3, 3);
        b.pits[Side::South.idx()] = vec![1, 1, 1];
        b.pits[Side::North.idx()] = vec![2, 2, 2];
        b.stores[Side::South.idx()] = 9;
        assert!(!b.over());
        assert_eq!(b.outcome(Side::South), Outcome::Pending);
    }

    #[test]
    fn collect_sweeps_and_conserves() {
        let mut b = Board::make(3, 0);
        b.pits[Side::South.idx()] = vec![0, 0, 0];
        b.pits[Side::North.idx()] = vec![2, 0, 3];
        b.stores = [4, 1];
        let before = b.total();
        b.collect();
        assert_eq!(b.total(), before);
        assert!(b.pits.iter().flatten().all(|&stones| stones == 0));
        assert_eq!(b.store(Side::North), 6);
        // idempotent
        b.collect();
        assert_eq!(b.store(Side::North), 6);
        assert_eq!(b.store(Side::South), 4);
    }

    #[test]
    fn draw_outcome_on_equal_totals() {
        let mut b = Board::make(2, 2);
        b.pits = [vec![0, 0], vec![0, 0]];
        b.stores = [4, 4];
        assert_eq!(b.outcome(Side::South), Outcome::Draw);
        assert_eq!(b.outcome(Side::North), Outcome::Draw);
    }

    #[test]
    fn mirror_is_an_involution() {
        let mut b = Board::make(4, 3);
        b.sow(Side::South, 1);
        b.sow(Side::North, 2);
        assert_eq!(b.mirror().mirror(), b);
    }

    #[test]
    fn mirror_swaps_sides() {
        let b: Board = "<3,0,0,0,0,0,3,3,3>".parse().unwrap();
        assert_eq!(b.mirror().to_string(), "<3,0,0,3,3,3,0,0,0>");
    }

    #[test]
    fn wire_round_trip() {
        let mut b = Board::make(8, 8);
        b.sow(Side::South, 3);
        b.sow(Side::South, 0);
        b.sow(Side::North, 7);
        let parsed: Board = b.to_string().parse().unwrap();
        assert_eq!(parsed, b);
    }

    #[test]
    fn parse_accepts_interior_whitespace() {
        let b: Board = "< 2 , 1 , 0 , 2,0 , 1 ,2 >".parse().unwrap();
        assert_eq!(b.size(), 2);
        assert_eq!(b.store(Side::South), 1);
        assert_eq!(b.pit(Side::North, 1), 2);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("<2,1,0,2,0,1,2".parse::<Board>().is_err());
        assert!("<2,1,0,2,0,1>".parse::<Board>().is_err());
        assert!("<2,1,-1,2,0,1,2>".parse::<Board>().is_err());
        assert!("<2,1,x,2,0,1,2>".parse::<Board>().is_err());
        assert!("(2,1,0,2,0,1,2)".parse::<Board>().is_err());
    }

    #[test]
    fn random_picks_a_legal_pit() {
        let mut b = Board::make(5, 0);
        b.pits[Side::South.idx()][3] = 2;
        for _ in 0..10 {
            assert_eq!(b.random(Side::South), 3);
        }
    }

    #[test]
    #[should_panic]
    fn random_panics_without_moves() {
        let b = Board::make(3, 0);
        b.random(Side::South);
    }

    #[test]
    #[should_panic]
    fn sow_panics_on_illegal_pit() {
        let mut b = Board::make(3, 0);
        b.sow(Side::South, 1);
    }
}
