//! Windowings: the infinite length sequences governing how summary windows
//! grow with age, plus the merge-time oracle built on top of them.
//!
//! A windowing is a non-decreasing sequence of positive window lengths
//! `L1, L2, L3, ...` anchored at count zero. The store consults it in two
//! ways: to slice an ingest buffer into an integral prefix of the sequence
//! ([`GenericWindowing::windows_covering_upto`]) and to decide *when* two
//! adjacent summary windows must be merged to keep the bucketing valid
//! ([`GenericWindowing::first_containing_time`]).

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

/// An infinite, non-decreasing sequence of window lengths.
pub trait LengthsSequence: Send {
    /// Returns the next window length in the sequence.
    fn next_window_length(&mut self) -> i64;

    /// The largest window length the sequence will ever emit.
    fn max_window_size(&self) -> i64;
}

/// Serializable description of a windowing, stored in stream metadata.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowingSpec {
    /// `Lk = ceil(base^(k-1))`.
    Exponential {
        /// Growth base, > 1.
        base: f64,
    },
    /// `R * k^(p-1)` windows of size `S * k^q` for `k = 1, 2, ...`.
    Power {
        /// Window-count growth exponent.
        p: i64,
        /// Window-size growth exponent.
        q: i64,
        /// Window-count scale.
        r: i64,
        /// Window-size scale.
        s: i64,
    },
}

impl WindowingSpec {
    /// Builds a fresh sequence positioned at the first window length.
    pub fn sequence(&self) -> Box<dyn LengthsSequence> {
        match *self {
            WindowingSpec::Exponential { base } => {
                Box::new(ExponentialLengthsSequence::new(base))
            }
            WindowingSpec::Power { p, q, r, s } => Box::new(PowerLengthsSequence::new(p, q, r, s)),
        }
    }
}

/// `1, base, base^2, ...` rounded up to integers.
#[derive(Debug, Clone)]
pub struct ExponentialLengthsSequence {
    next: f64,
    base: f64,
}

impl ExponentialLengthsSequence {
    /// Creates the sequence `Lk = ceil(base^(k-1))`.
    pub fn new(base: f64) -> Self {
        Self { next: 1.0, base }
    }
}

impl LengthsSequence for ExponentialLengthsSequence {
    fn next_window_length(&mut self) -> i64 {
        let prev = self.next;
        self.next *= self.base;
        prev.ceil() as i64
    }

    fn max_window_size(&self) -> i64 {
        u32::MAX as i64
    }
}

/// `R * k^(p-1)` windows of size `S * k^q` for each `k = 1, 2, ...`.
#[derive(Debug, Clone)]
pub struct PowerLengthsSequence {
    p: i64,
    q: i64,
    r: i64,
    s: i64,
    k: i64,
    curr: i64,
}

impl PowerLengthsSequence {
    /// Creates the power-law sequence with the given exponents and scales.
    pub fn new(p: i64, q: i64, r: i64, s: i64) -> Self {
        Self {
            p,
            q,
            r,
            s,
            k: 1,
            curr: 0,
        }
    }
}

fn int_pow(base: i64, exp: i64) -> i64 {
    if exp <= 0 {
        return 1;
    }
    base.pow(exp as u32)
}

impl LengthsSequence for PowerLengthsSequence {
    fn next_window_length(&mut self) -> i64 {
        let count = self.r * int_pow(self.k, self.p - 1);
        if count <= self.curr {
            self.k += 1;
            self.curr = 0;
        }
        self.curr += 1;
        self.s * int_pow(self.k, self.q)
    }

    fn max_window_size(&self) -> i64 {
        u32::MAX as i64
    }
}

/// Lazily materialised windowing over a [`LengthsSequence`].
///
/// Window start markers (the prefix sums of the sequence) are extended on
/// demand; `first_window_of_length` records the start marker of the first
/// window of each distinct length so that containment queries resolve with
/// ordered-map lookups.
pub struct GenericWindowing {
    seq: Box<dyn LengthsSequence>,
    first_window_of_length: BTreeMap<i64, i64>,
    window_start_markers: BTreeSet<i64>,
    first_window_length: i64,
    last_window_start: i64,
    last_window_length: i64,
}

impl GenericWindowing {
    /// Creates a windowing and materialises its first window.
    pub fn new(seq: Box<dyn LengthsSequence>) -> Self {
        let mut windowing = Self {
            seq,
            first_window_of_length: BTreeMap::new(),
            window_start_markers: BTreeSet::new(),
            first_window_length: 0,
            last_window_start: 0,
            last_window_length: 0,
        };
        windowing.first_window_length = windowing.seq.next_window_length();
        let first = windowing.first_window_length;
        windowing.add_window(first);
        windowing
    }

    fn add_window(&mut self, length: i64) {
        self.last_window_start += self.last_window_length;
        if length > self.last_window_length {
            self.first_window_of_length
                .insert(length, self.last_window_start);
        }
        self.window_start_markers.insert(self.last_window_start);
        self.last_window_length = length;
    }

    /// Extends the sequence until one window has length >= `target`; false
    /// when the sequence does not admit such a length.
    fn add_windows_until_length(&mut self, target: i64) -> bool {
        if target > self.seq.max_window_size() {
            return false;
        }
        while self.last_window_length < target {
            let next = self.seq.next_window_length();
            self.add_window(next);
        }
        true
    }

    fn add_windows_past_marker(&mut self, target: i64) {
        while self.last_window_start <= target {
            let next = self.seq.next_window_length();
            self.add_window(next);
        }
    }

    /// The earliest logical time `T' >= t` at which the interval `[tl, tr]`
    /// lies entirely inside one window of the sequence anchored at zero.
    ///
    /// `None` means no future element count will ever require the pair to
    /// merge (the sequence does not admit a window of the combined length).
    pub fn first_containing_time(&mut self, tl: i64, tr: i64, t: i64) -> Option<i64> {
        let l = t - 1 - tr;
        let r = t - 1 - tl;
        let length = tr - tl + 1;

        if !self.add_windows_until_length(length) {
            return None;
        }

        let (_, &first_marker) = self.first_window_of_length.range(length..).next()?;
        if first_marker >= l {
            // The interval reaches the first window of sufficient length
            // when l' == first_marker, i.e. at time first_marker + tr + 1.
            return Some(first_marker + tr + 1);
        }

        // A window of sufficient length already covers l; [l, r] is either
        // inside the same window now or will be once it slides into the next.
        self.add_windows_past_marker(l);
        let &curr_window_l = self.window_start_markers.range(..=l).next_back()?;
        let &curr_window_r = self
            .window_start_markers
            .range((Bound::Excluded(l), Bound::Unbounded))
            .next()?;

        if r <= curr_window_r {
            Some(t)
        } else if curr_window_r - curr_window_l + 1 < length {
            None
        } else {
            Some(curr_window_r + tr + 2)
        }
    }

    /// Length of the youngest window.
    pub fn size_of_first_window(&self) -> i64 {
        self.first_window_length
    }

    /// The longest prefix `[L1, ..., Lk]` whose sum does not exceed `n`.
    pub fn windows_covering_upto(&mut self, n: i64) -> Vec<i64> {
        if n <= 0 {
            return Vec::new();
        }
        self.add_windows_past_marker(n);

        let mut windows = Vec::new();
        let mut prev_marker = 0i64;
        for &marker in &self.window_start_markers {
            if marker > n {
                break;
            }
            if marker != 0 {
                windows.push(marker - prev_marker);
                prev_marker = marker;
            }
        }
        windows
    }
}
