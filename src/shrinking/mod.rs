//! # Shrinking: Greedy Local Search over Candidate Values
//!
//! This module provides the generic driver that every shrinker in the crate is built on.
//! A shrinker owns a *current* value that satisfies some acceptance predicate and repeatedly
//! proposes strictly better values, keeping the ones the predicate still accepts.
//!
//! ## Architecture
//!
//! - [`ShrinkStrategy`]: what varies between shrinkers (the ordering, the canonical form,
//!   the invariants and the passes that propose candidates).
//! - [`Shrinker`]: the driver. It holds the current value, counts accepted changes, remembers
//!   every value it has evaluated and enforces optional call and time budgets.
//! - [`BufferShrinker`]: the strategy the runner uses to minimize byte buffers.
//! - [`find_integer`]: the boundary search most passes use to take large steps.
//!
//! ## Example
//!
//! ```rust
//! use conjecture_core::shrinking::{BufferShrinker, Shrinker};
//! use rand::SeedableRng;
//! use rand_chacha::ChaCha8Rng;
//!
//! let shrunk = Shrinker::shrink(
//!     BufferShrinker,
//!     vec![7, 200, 13],
//!     |buf: &Vec<u8>| buf.iter().map(|&b| b as u32).sum::<u32>() >= 10,
//!     ChaCha8Rng::seed_from_u64(0),
//!     true,
//! )
//! .unwrap();
//! assert_eq!(shrunk, vec![10]);
//! ```

mod buffer;
pub mod common;

use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Instant;

use log::debug;
use rand_chacha::ChaCha8Rng;

pub use buffer::{shortlex_lt, BufferShrinker};
pub use common::{find_integer, try_find_integer};

/// Errors that abort a shrink session
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShrinkError {
    #[error("shrink invariant violated: {0}")]
    InvariantViolation(String),
}

/// The parts of a shrinker that differ from one value space to another.
///
/// `short_circuit`, `preamble` and `run_step` receive the whole [`Shrinker`] so they can
/// propose candidates through [`Shrinker::consider`] and [`Shrinker::incorporate`].
pub trait ShrinkStrategy: Sized {
    type Value: Clone + Eq + Hash + Debug;

    /// Canonical form of a value. Must be idempotent.
    fn make_immutable(&self, value: Self::Value) -> Self::Value {
        value
    }

    /// Structural checks applied to every candidate before it is evaluated.
    fn check_invariants(&self, _value: &Self::Value) -> Result<(), ShrinkError> {
        Ok(())
    }

    /// Strict "is simpler than" ordering.
    fn left_is_better(&self, left: &Self::Value, right: &Self::Value) -> bool;

    /// Returns true when no further work is needed.
    fn short_circuit(shrinker: &mut Shrinker<'_, Self>) -> Result<bool, ShrinkError>;

    /// Runs once before the first step.
    fn preamble(shrinker: &mut Shrinker<'_, Self>) -> Result<(), ShrinkError>;

    /// One pass of candidate proposals.
    fn run_step(shrinker: &mut Shrinker<'_, Self>) -> Result<(), ShrinkError>;
}

/// Generic greedy shrink driver
pub struct Shrinker<'a, S: ShrinkStrategy> {
    strategy: S,
    current: S::Value,
    changes: usize,
    full: bool,
    seen: HashSet<S::Value>,
    predicate: Box<dyn FnMut(&S::Value) -> bool + 'a>,
    rng: ChaCha8Rng,
    calls: usize,
    max_calls: Option<usize>,
    deadline: Option<Instant>,
}

impl<'a, S: ShrinkStrategy> Shrinker<'a, S> {
    /// Create a shrinker starting from `initial`, which is assumed to satisfy `predicate`.
    pub fn new<P>(strategy: S, initial: S::Value, predicate: P, rng: ChaCha8Rng, full: bool) -> Self
    where
        P: FnMut(&S::Value) -> bool + 'a,
    {
        let current = strategy.make_immutable(initial);
        Self {
            strategy,
            current,
            changes: 0,
            full,
            seen: HashSet::new(),
            predicate: Box::new(predicate),
            rng,
            calls: 0,
            max_calls: None,
            deadline: None,
        }
    }

    /// Stop evaluating candidates after `max_calls` predicate invocations.
    pub fn with_max_calls(mut self, max_calls: usize) -> Self {
        self.max_calls = Some(max_calls);
        self
    }

    /// Stop evaluating candidates once `deadline` has passed.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Build a shrinker, run it and return the best value it found.
    pub fn shrink<P>(
        strategy: S,
        initial: S::Value,
        predicate: P,
        rng: ChaCha8Rng,
        full: bool,
    ) -> Result<S::Value, ShrinkError>
    where
        P: FnMut(&S::Value) -> bool + 'a,
    {
        let mut shrinker = Self::new(strategy, initial, predicate, rng, full);
        shrinker.run()?;
        Ok(shrinker.into_current())
    }

    /// Run the strategy. In full mode steps repeat until one makes no change.
    pub fn run(&mut self) -> Result<(), ShrinkError> {
        if S::short_circuit(self)? {
            debug!("shrink short-circuited after {} calls", self.calls);
            return Ok(());
        }
        S::preamble(self)?;
        if self.full {
            let mut prev = None;
            while prev != Some(self.changes) && !self.is_exhausted() {
                prev = Some(self.changes);
                S::run_step(self)?;
            }
        } else {
            S::run_step(self)?;
        }
        debug!(
            "shrink finished: {} changes in {} calls (exhausted: {})",
            self.changes,
            self.calls,
            self.is_exhausted()
        );
        Ok(())
    }

    /// Try to replace `current` with `value`.
    ///
    /// Returns `Ok(true)` only if `value` is strictly better than `current`, has not been
    /// evaluated before in this session and satisfies the predicate.
    pub fn incorporate(&mut self, value: S::Value) -> Result<bool, ShrinkError> {
        let value = self.strategy.make_immutable(value);
        self.strategy.check_invariants(&value)?;
        if !self.strategy.left_is_better(&value, &self.current) {
            return Ok(false);
        }
        if self.seen.contains(&value) || self.is_exhausted() {
            return Ok(false);
        }
        self.seen.insert(value.clone());
        self.calls += 1;
        if (self.predicate)(&value) {
            self.changes += 1;
            self.current = value;
            return Ok(true);
        }
        Ok(false)
    }

    /// Like [`incorporate`](Self::incorporate), but a value equal to `current` counts as
    /// accepted without calling the predicate.
    pub fn consider(&mut self, value: S::Value) -> Result<bool, ShrinkError> {
        let value = self.strategy.make_immutable(value);
        if value == self.current {
            return Ok(true);
        }
        self.incorporate(value)
    }

    /// True once the call budget or the deadline has been used up.
    pub fn is_exhausted(&self) -> bool {
        if let Some(max) = self.max_calls {
            if self.calls >= max {
                return true;
            }
        }
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    pub fn current(&self) -> &S::Value {
        &self.current
    }

    pub fn changes(&self) -> usize {
        self.changes
    }

    /// Number of predicate invocations so far
    pub fn calls(&self) -> usize {
        self.calls
    }

    /// Random source for passes that visit candidates in a random order
    pub fn rng_mut(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    pub fn into_current(self) -> S::Value {
        self.current
    }
}
