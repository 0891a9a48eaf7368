//! ConjectureRunner - The main test execution engine
//!
//! The runner owns everything that lives longer than one execution: the prefix tree, the
//! result cache, the table of best interesting examples and the seeded random source. It
//! drives a test function through three phases:
//!
//! 1. **Reuse**: replay buffers saved by earlier runs, dropping those that no longer fail.
//! 2. **Generation**: run the all-zero buffer, then novel prefixes from the tree, until a
//!    budget is spent, the search space is exhausted or a failure is found.
//! 3. **Shrinking**: minimize the best buffer of every interesting origin.
//!
//! Every new best example is written to the database as soon as it is found, so an
//! interrupted run still leaves its failures behind.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::data::{ConjectureData, ConjectureResult, InterestingOrigin, Status, StopTest, DEFAULT_ORIGIN};
use crate::datatree::{DataTree, PathLookup};
use crate::persistence::{DatabaseError, DatabaseKey, ExampleDatabase};
use crate::shrinking::{shortlex_lt, BufferShrinker, ShrinkError, Shrinker};

/// Configuration for the ConjectureRunner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Stop generating after this many valid examples
    pub max_examples: usize,

    /// Maximum number of bytes a single execution may consume
    pub max_buffer_size: usize,

    /// Whether to minimize interesting examples once generation stops
    pub shrinking_enabled: bool,

    /// Random seed for deterministic execution
    pub seed: u64,

    /// Maximum number of test calls spent shrinking, across all origins
    pub max_shrinks: usize,

    /// Maximum time allowed for generation
    pub max_time: Option<Duration>,

    /// Maximum time allowed for the shrinking phase
    pub shrink_timeout: Option<Duration>,

    /// Keep generating after the first failure to look for distinct ones
    pub report_multiple_bugs: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_examples: 100,
            max_buffer_size: 8 * 1024,
            shrinking_enabled: true,
            seed: 0,
            max_shrinks: 10_000,
            max_time: Some(Duration::from_secs(60)),
            shrink_timeout: Some(Duration::from_secs(10)),
            report_multiple_bugs: false,
        }
    }
}

impl RunnerConfig {
    /// Total test calls allowed during generation
    pub fn max_iterations(&self) -> usize {
        self.max_examples.saturating_mul(10).max(1000)
    }
}

/// Statistics about test execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerStats {
    /// Test function invocations, in every phase
    pub calls: usize,
    pub valid_examples: usize,
    pub invalid_examples: usize,
    pub interesting_examples: usize,
    pub overrun_examples: usize,

    /// Buffers answered from the cache or the tree without running the test
    pub cache_hits: usize,

    /// Candidates evaluated by shrinkers
    pub shrink_calls: usize,

    /// Times a best interesting example was replaced by a smaller one
    pub shrinks: usize,

    pub generation_time: Duration,
    pub shrinking_time: Duration,
    pub total_runtime: Duration,
}

/// Current phase of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionPhase {
    Initialize,
    Reuse,
    Generate,
    Shrink,
    Done,
}

/// Why generation or shrinking stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    MaxExamples,
    MaxIterations,
    Timeout,
    /// Every reachable behavior was explored
    Exhausted,
    FoundInteresting,
    MaxShrinks,
    Finished,
}

/// Final outcome of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    Passed,
    /// Best example of every interesting origin, in origin order
    Failed(Vec<ConjectureResult>),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("shrinking failed: {0}")]
    Shrink(#[from] ShrinkError),
}

/// Main test execution engine
pub struct ConjectureRunner<F> {
    test_fn: F,
    config: RunnerConfig,
    tree: DataTree,
    cache: HashMap<Vec<u8>, ConjectureResult>,
    interesting_examples: BTreeMap<InterestingOrigin, ConjectureResult>,
    rng: ChaCha8Rng,
    database: Option<Box<dyn ExampleDatabase>>,
    database_key: Option<DatabaseKey>,
    stats: RunnerStats,
    phase: ExecutionPhase,
    exit_reason: Option<ExitReason>,
}

impl<F> ConjectureRunner<F>
where
    F: FnMut(&mut ConjectureData) -> Result<(), StopTest>,
{
    pub fn new(test_fn: F, config: RunnerConfig) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        // A depth of zero would kill the root before anything has been tried.
        let tree = DataTree::new((config.max_buffer_size / 2).max(1));
        Self {
            test_fn,
            config,
            tree,
            cache: HashMap::new(),
            interesting_examples: BTreeMap::new(),
            rng,
            database: None,
            database_key: None,
            stats: RunnerStats::default(),
            phase: ExecutionPhase::Initialize,
            exit_reason: None,
        }
    }

    /// Persist interesting examples in `database` under `key`.
    pub fn with_database<D: ExampleDatabase + 'static>(mut self, database: D, key: DatabaseKey) -> Self {
        self.database = Some(Box::new(database));
        self.database_key = Some(key);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn tree(&self) -> &DataTree {
        &self.tree
    }

    pub fn stats(&self) -> &RunnerStats {
        &self.stats
    }

    pub fn phase(&self) -> ExecutionPhase {
        self.phase
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit_reason
    }

    /// Best known result for each interesting origin
    pub fn interesting_examples(&self) -> &BTreeMap<InterestingOrigin, ConjectureResult> {
        &self.interesting_examples
    }

    /// Run all phases and report the best failures, if any.
    pub fn run(&mut self) -> Result<RunResult, EngineError> {
        let started = Instant::now();
        info!(
            "starting run: max_examples={} max_buffer_size={} seed={}",
            self.config.max_examples, self.config.max_buffer_size, self.config.seed
        );

        self.phase = ExecutionPhase::Reuse;
        self.reuse_existing_examples()?;

        self.phase = ExecutionPhase::Generate;
        let generation_started = Instant::now();
        if self.interesting_examples.is_empty() || self.config.report_multiple_bugs {
            self.generate_new_examples();
        } else {
            self.exit_reason = Some(ExitReason::FoundInteresting);
        }
        self.stats.generation_time = generation_started.elapsed();
        debug!(
            "generation stopped ({:?}) after {} calls: {} valid, {} invalid, {} overrun, {} interesting",
            self.exit_reason,
            self.stats.calls,
            self.stats.valid_examples,
            self.stats.invalid_examples,
            self.stats.overrun_examples,
            self.stats.interesting_examples
        );

        if self.config.shrinking_enabled && !self.interesting_examples.is_empty() {
            self.phase = ExecutionPhase::Shrink;
            let shrinking_started = Instant::now();
            self.shrink_interesting_examples()?;
            self.stats.shrinking_time = shrinking_started.elapsed();
        }

        self.phase = ExecutionPhase::Done;
        self.save_final_examples()?;
        self.stats.total_runtime = started.elapsed();

        if self.interesting_examples.is_empty() {
            info!("run passed after {} calls", self.stats.calls);
            Ok(RunResult::Passed)
        } else {
            info!(
                "run failed with {} distinct origin(s) after {} calls",
                self.interesting_examples.len(),
                self.stats.calls
            );
            Ok(RunResult::Failed(self.interesting_examples.values().cloned().collect()))
        }
    }

    /// Execute the test on `data` and fold the outcome into the runner's state.
    pub fn test_function(&mut self, data: &mut ConjectureData) -> ConjectureResult {
        // The outcome is read from `data`; StopTest only unwinds the test body.
        let _ = (self.test_fn)(data);
        data.freeze();
        let result = data.as_result();

        self.stats.calls += 1;
        match result.status {
            Status::Valid => self.stats.valid_examples += 1,
            Status::Invalid => self.stats.invalid_examples += 1,
            Status::Overrun => self.stats.overrun_examples += 1,
            Status::Interesting => self.stats.interesting_examples += 1,
        }

        self.tree.record(&result);
        self.cache.insert(result.buffer.clone(), result.clone());

        if result.status == Status::Interesting {
            self.record_interesting(&result);
        }
        result
    }

    /// Result of running the test on exactly `buffer`, reusing earlier executions when
    /// their outcome is already determined.
    pub fn cached_test_function(&mut self, buffer: &[u8]) -> ConjectureResult {
        if let Some(result) = self.cache.get(buffer) {
            self.stats.cache_hits += 1;
            return result.clone();
        }

        match self.tree.lookup(buffer) {
            PathLookup::Concluded(path) => {
                if let Some(result) = self.cache.get(&path).cloned() {
                    self.stats.cache_hits += 1;
                    self.cache.insert(buffer.to_vec(), result.clone());
                    return result;
                }
            }
            PathLookup::Overrun => {
                self.stats.cache_hits += 1;
                let result = ConjectureResult {
                    status: Status::Overrun,
                    interesting_origin: None,
                    buffer: buffer.to_vec(),
                    forced: BTreeSet::new(),
                    capped: BTreeMap::new(),
                };
                self.cache.insert(buffer.to_vec(), result.clone());
                return result;
            }
            PathLookup::Unknown => {}
        }

        let mut data = ConjectureData::for_buffer(buffer);
        let result = self.test_function(&mut data);
        self.cache.insert(buffer.to_vec(), result.clone());
        result
    }

    /// Next prefix to explore, or `None` once the tree is exhausted.
    pub fn generate_novel_prefix(&mut self) -> Option<Vec<u8>> {
        self.tree.generate_novel_prefix(&mut self.rng)
    }

    fn record_interesting(&mut self, result: &ConjectureResult) {
        let origin = result.interesting_origin.unwrap_or(DEFAULT_ORIGIN);
        let improved = self
            .interesting_examples
            .get(&origin)
            .map_or(true, |best| shortlex_lt(&result.buffer, &best.buffer));
        if !improved {
            return;
        }

        let previous = self.interesting_examples.insert(origin, result.clone());
        self.save_buffer(&result.buffer);
        match previous {
            Some(previous) => {
                self.stats.shrinks += 1;
                debug!(
                    "origin {:#x} improved from {} to {} bytes",
                    origin,
                    previous.buffer.len(),
                    result.buffer.len()
                );
                self.downgrade_buffer(&previous.buffer);
            }
            None => info!("found new interesting origin {:#x} after {} calls", origin, self.stats.calls),
        }
    }

    fn save_buffer(&mut self, buffer: &[u8]) {
        if let (Some(db), Some(key)) = (self.database.as_mut(), self.database_key.as_ref()) {
            if let Err(e) = db.save(key, buffer) {
                warn!("failed to save example: {}", e);
            }
        }
    }

    fn downgrade_buffer(&mut self, buffer: &[u8]) {
        if let (Some(db), Some(key)) = (self.database.as_mut(), self.database_key.as_ref()) {
            if let Err(e) = db.move_value(key, &key.secondary(), buffer) {
                warn!("failed to move superseded example: {}", e);
            }
        }
    }

    fn reuse_existing_examples(&mut self) -> Result<(), EngineError> {
        let (Some(db), Some(key)) = (self.database.as_ref(), self.database_key.clone()) else {
            return Ok(());
        };
        let secondary = key.secondary();

        let mut corpus = db.fetch(&key)?;
        corpus.extend(db.fetch(&secondary)?);
        corpus.sort_by(|a, b| (a.len(), a).cmp(&(b.len(), b)));
        corpus.dedup();
        if corpus.is_empty() {
            return Ok(());
        }
        info!("replaying {} saved example(s)", corpus.len());

        for buffer in corpus {
            let result = self.cached_test_function(&buffer);
            if result.status != Status::Interesting {
                debug!("saved example of {} bytes no longer fails, deleting it", buffer.len());
                if let Some(db) = self.database.as_mut() {
                    db.delete(&key, &buffer)?;
                    db.delete(&secondary, &buffer)?;
                }
            }
        }
        Ok(())
    }

    fn generate_new_examples(&mut self) {
        let zeros = vec![0u8; self.config.max_buffer_size];
        self.cached_test_function(&zeros);

        let started = Instant::now();
        loop {
            if let Some(reason) = self.should_stop_generating(started) {
                self.exit_reason = Some(reason);
                return;
            }
            let prefix = match self.generate_novel_prefix() {
                Some(prefix) => prefix,
                None => {
                    info!("search space exhausted after {} calls", self.stats.calls);
                    self.exit_reason = Some(ExitReason::Exhausted);
                    return;
                }
            };
            let rng = ChaCha8Rng::seed_from_u64(self.rng.gen());
            let mut data = ConjectureData::new(prefix, self.config.max_buffer_size, Some(rng));
            self.test_function(&mut data);
        }
    }

    fn should_stop_generating(&self, started: Instant) -> Option<ExitReason> {
        if !self.interesting_examples.is_empty() && !self.config.report_multiple_bugs {
            return Some(ExitReason::FoundInteresting);
        }
        if self.stats.valid_examples >= self.config.max_examples {
            return Some(ExitReason::MaxExamples);
        }
        if self.stats.calls >= self.config.max_iterations() {
            return Some(ExitReason::MaxIterations);
        }
        if self.config.max_time.map_or(false, |limit| started.elapsed() >= limit) {
            return Some(ExitReason::Timeout);
        }
        None
    }

    fn shrink_interesting_examples(&mut self) -> Result<(), EngineError> {
        let deadline = self.config.shrink_timeout.map(|limit| Instant::now() + limit);
        let mut done = BTreeSet::new();

        // Shrinking one origin may discover others; keep going until all are handled.
        while let Some(origin) = self.interesting_examples.keys().copied().find(|o| !done.contains(o)) {
            done.insert(origin);
            if self.stats.shrink_calls >= self.config.max_shrinks {
                info!("shrink budget of {} calls used up", self.config.max_shrinks);
                self.exit_reason = Some(ExitReason::MaxShrinks);
                break;
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                info!("shrink timeout reached");
                self.exit_reason = Some(ExitReason::Timeout);
                break;
            }
            self.shrink(origin, deadline)?;
        }

        if self.exit_reason.is_none() {
            self.exit_reason = Some(ExitReason::Finished);
        }
        Ok(())
    }

    /// Shrink one origin, restarting from the recorded best until a session leaves it unchanged.
    ///
    /// The shrinker works on raw candidates while the table keeps the bytes the test actually
    /// consumed (masked, forced and truncated), so the two can differ after a session.
    fn shrink(&mut self, origin: InterestingOrigin, deadline: Option<Instant>) -> Result<(), EngineError> {
        loop {
            let initial = match self.interesting_examples.get(&origin) {
                Some(best) => best.buffer.clone(),
                None => return Ok(()),
            };
            let remaining = self.config.max_shrinks.saturating_sub(self.stats.shrink_calls);
            if remaining == 0 || deadline.map_or(false, |d| Instant::now() >= d) {
                return Ok(());
            }
            debug!("shrinking origin {:#x} from {} bytes", origin, initial.len());

            let rng = ChaCha8Rng::seed_from_u64(self.rng.gen());
            let calls = {
                let mut shrinker = Shrinker::new(
                    BufferShrinker,
                    initial.clone(),
                    |candidate: &Vec<u8>| {
                        let result = self.cached_test_function(candidate);
                        result.status == Status::Interesting && result.interesting_origin == Some(origin)
                    },
                    rng,
                    true,
                )
                .with_max_calls(remaining);
                if let Some(deadline) = deadline {
                    shrinker = shrinker.with_deadline(deadline);
                }
                shrinker.run()?;
                shrinker.calls()
            };
            self.stats.shrink_calls += calls;

            let best = match self.interesting_examples.get(&origin) {
                Some(best) => &best.buffer,
                None => return Ok(()),
            };
            debug!("origin {:#x} at {} bytes after {} calls", origin, best.len(), calls);
            if *best == initial {
                return Ok(());
            }
        }
    }

    fn save_final_examples(&mut self) -> Result<(), EngineError> {
        if let (Some(db), Some(key)) = (self.database.as_mut(), self.database_key.as_ref()) {
            for best in self.interesting_examples.values() {
                db.save(key, &best.buffer)?;
            }
        }
        Ok(())
    }
}
