//! # Conjecture Core
//!
//! Search and minimization engine for property-based testing. Inputs are byte buffers:
//! a test draws bytes from a [`ConjectureData`] record, the [`ConjectureRunner`] explores
//! the space of buffers with the help of a [`DataTree`], and failing buffers are reduced
//! in shortlex order by a [`Shrinker`] before being persisted to an [`ExampleDatabase`].
//!
//! ```rust
//! use conjecture_core::{ConjectureData, ConjectureRunner, RunResult, RunnerConfig};
//!
//! let mut runner = ConjectureRunner::new(
//!     |data: &mut ConjectureData| {
//!         let n = data.draw_bits(16)?;
//!         if n >= 1000 {
//!             data.mark_interesting()?;
//!         }
//!         Ok(())
//!     },
//!     RunnerConfig::default(),
//! );
//! match runner.run().unwrap() {
//!     RunResult::Failed(results) => assert_eq!(results[0].buffer, vec![0x03, 0xe8]),
//!     RunResult::Passed => unreachable!(),
//! }
//! ```

pub mod data;
pub mod datatree;
pub mod engine;
pub mod persistence;
pub mod shrinking;

pub use data::{calc_label_from_name, ConjectureData, ConjectureResult, InterestingOrigin, Status, StopTest};
pub use datatree::{DataTree, NodeId, PathLookup, TreeStats};
pub use engine::{ConjectureRunner, EngineError, ExecutionPhase, ExitReason, RunResult, RunnerConfig, RunnerStats};
pub use persistence::{DatabaseError, DatabaseKey, DirectoryDatabase, ExampleDatabase, InMemoryDatabase};
pub use shrinking::{find_integer, BufferShrinker, ShrinkError, ShrinkStrategy, Shrinker};
