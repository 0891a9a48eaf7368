//! # ConjectureData: One Test Execution
//!
//! A [`ConjectureData`] records a single run of the test function. Every byte the test
//! consumes is appended to its buffer, either replayed from a supplied prefix or drawn from
//! a seeded random source, so re-feeding the recorded buffer reproduces the same draws.
//!
//! ## Lifecycle
//!
//! A record starts out `Valid` and running. The test ends it in one of three ways:
//! - returning normally (the runner then calls [`ConjectureData::freeze`]),
//! - calling [`ConjectureData::mark_invalid`] or [`ConjectureData::mark_interesting`],
//! - drawing past the buffer budget, which concludes the record as `Overrun`.
//!
//! Every conclusion is reported to the test as `Err(StopTest)`, so a test body is written
//! with `?` and unwinds straight back to the runner:
//!
//! ```rust
//! use conjecture_core::data::{ConjectureData, StopTest, Status};
//!
//! fn test(data: &mut ConjectureData) -> Result<(), StopTest> {
//!     let x = data.draw_bits(8)?;
//!     if x > 100 {
//!         data.mark_interesting()?;
//!     }
//!     Ok(())
//! }
//!
//! let mut data = ConjectureData::for_buffer(&[200]);
//! assert!(test(&mut data).is_err());
//! assert_eq!(data.status(), Status::Interesting);
//! ```
//!
//! Once concluded a record is frozen: the status never changes again and further draws fail.

use std::collections::{BTreeMap, BTreeSet};

use byteorder::{BigEndian, ByteOrder};
use rand::RngCore;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha384};

/// Identifies which failure an interesting execution reproduces
pub type InterestingOrigin = u64;

/// Origin used by [`ConjectureData::mark_interesting`]
pub const DEFAULT_ORIGIN: InterestingOrigin = 0;

/// Terminal status of an execution, ordered from least to most useful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Status {
    /// The test tried to draw more bytes than the record allows
    Overrun = 0,
    /// The test rejected its input
    Invalid = 1,
    /// The test ran to completion
    Valid = 2,
    /// The test found what it was looking for
    Interesting = 3,
}

impl Default for Status {
    fn default() -> Self {
        Status::Valid
    }
}

/// Stable label for a name: the first eight bytes of its SHA-384 digest.
pub fn calc_label_from_name(name: &str) -> u64 {
    let digest = Sha384::digest(name.as_bytes());
    BigEndian::read_u64(&digest[..8])
}

/// Signal returned by draws and marks once a record has concluded.
///
/// Test functions propagate it with `?`; the runner reads the outcome from the record
/// itself, not from this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("test execution stopped with status {status:?}")]
pub struct StopTest {
    status: Status,
}

impl StopTest {
    pub fn status(&self) -> Status {
        self.status
    }
}

/// Frozen snapshot of a finished execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConjectureResult {
    pub status: Status,
    /// Set only for interesting results
    pub interesting_origin: Option<InterestingOrigin>,
    /// Bytes actually consumed, with forced bytes and masks applied
    pub buffer: Vec<u8>,
    /// Positions written with [`ConjectureData::write`]
    pub forced: BTreeSet<usize>,
    /// Positions whose byte only had `mask + 1` legal values, mapped to the mask
    pub capped: BTreeMap<usize, u8>,
}

/// Record of a single test execution
#[derive(Debug, Clone)]
pub struct ConjectureData {
    prefix: Vec<u8>,
    rng: Option<ChaCha8Rng>,
    max_length: usize,
    buffer: Vec<u8>,
    status: Status,
    frozen: bool,
    interesting_origin: Option<InterestingOrigin>,
    forced: BTreeSet<usize>,
    capped: BTreeMap<usize, u8>,
}

impl ConjectureData {
    /// Replay `prefix`, then draw from `rng`, never consuming more than `max_length` bytes.
    pub fn new(prefix: Vec<u8>, max_length: usize, rng: Option<ChaCha8Rng>) -> Self {
        Self {
            prefix,
            rng,
            max_length,
            buffer: Vec::new(),
            status: Status::Valid,
            frozen: false,
            interesting_origin: None,
            forced: BTreeSet::new(),
            capped: BTreeMap::new(),
        }
    }

    /// Pure replay of `buffer`; drawing past its end is an overrun.
    pub fn for_buffer(buffer: &[u8]) -> Self {
        Self::new(buffer.to_vec(), buffer.len(), None)
    }

    /// Draw `n` bytes.
    pub fn draw_bytes(&mut self, n: usize) -> Result<Vec<u8>, StopTest> {
        self.check_running()?;
        let start = self.buffer.len();
        if !self.fits(n) {
            return Err(self.overrun());
        }

        let replayed = self.prefix.len().saturating_sub(start).min(n);
        if replayed < n && self.rng.is_none() {
            return Err(self.overrun());
        }

        let mut bytes = vec![0u8; n];
        if replayed > 0 {
            bytes[..replayed].copy_from_slice(&self.prefix[start..start + replayed]);
        }
        if let Some(rng) = self.rng.as_mut() {
            rng.fill_bytes(&mut bytes[replayed..]);
        }

        self.buffer.extend_from_slice(&bytes);
        Ok(bytes)
    }

    /// Draw an `n`-bit unsigned integer, `n <= 64`.
    ///
    /// The value occupies `ceil(n / 8)` bytes, big-endian. When `n` is not a multiple of 8
    /// the excess high bits of the first byte are cleared in the recorded buffer.
    pub fn draw_bits(&mut self, n: u32) -> Result<u64, StopTest> {
        assert!(n <= 64, "cannot draw {} bits into a u64", n);
        if n == 0 {
            return Ok(0);
        }
        let n_bytes = ((n + 7) / 8) as usize;
        let start = self.buffer.len();
        let mut bytes = self.draw_bytes(n_bytes)?;

        let spare = n % 8;
        if spare != 0 {
            let mask = ((1u16 << spare) - 1) as u8;
            bytes[0] &= mask;
            self.buffer[start] = bytes[0];
            self.capped.insert(start, mask);
        }
        Ok(BigEndian::read_uint(&bytes, n_bytes))
    }

    /// Record `bytes` as a draw whatever the prefix or random source would have produced.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), StopTest> {
        self.check_running()?;
        let start = self.buffer.len();
        if !self.fits(bytes.len()) {
            return Err(self.overrun());
        }
        self.buffer.extend_from_slice(bytes);
        self.forced.extend(start..start + bytes.len());
        Ok(())
    }

    /// Conclude as `Invalid`. Always returns `Err`.
    pub fn mark_invalid(&mut self) -> Result<(), StopTest> {
        Err(self.conclude(Status::Invalid, None))
    }

    /// Conclude as `Interesting` with [`DEFAULT_ORIGIN`]. Always returns `Err`.
    pub fn mark_interesting(&mut self) -> Result<(), StopTest> {
        self.mark_interesting_with_origin(DEFAULT_ORIGIN)
    }

    /// Conclude as `Interesting` for a specific failure. Always returns `Err`.
    pub fn mark_interesting_with_origin(&mut self, origin: InterestingOrigin) -> Result<(), StopTest> {
        Err(self.conclude(Status::Interesting, Some(origin)))
    }

    /// Stop accepting draws, keeping whatever status has been reached.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn interesting_origin(&self) -> Option<InterestingOrigin> {
        self.interesting_origin
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn as_result(&self) -> ConjectureResult {
        ConjectureResult {
            status: self.status,
            interesting_origin: self.interesting_origin,
            buffer: self.buffer.clone(),
            forced: self.forced.clone(),
            capped: self.capped.clone(),
        }
    }

    fn check_running(&self) -> Result<(), StopTest> {
        if self.frozen {
            return Err(StopTest { status: self.status });
        }
        Ok(())
    }

    /// Whether `n` more bytes stay within `max_length`.
    fn fits(&self, n: usize) -> bool {
        self.buffer
            .len()
            .checked_add(n)
            .map_or(false, |end| end <= self.max_length)
    }

    fn overrun(&mut self) -> StopTest {
        self.conclude(Status::Overrun, None)
    }

    fn conclude(&mut self, status: Status, origin: Option<InterestingOrigin>) -> StopTest {
        if !self.frozen {
            self.status = status;
            self.interesting_origin = origin;
            self.frozen = true;
        }
        StopTest { status: self.status }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn seeded(prefix: Vec<u8>, max_length: usize) -> ConjectureData {
        ConjectureData::new(prefix, max_length, Some(ChaCha8Rng::seed_from_u64(3)))
    }

    #[test]
    fn test_replays_prefix_then_draws_randomly() {
        let mut data = seeded(vec![1, 2, 3], 100);
        assert_eq!(data.draw_bytes(2).unwrap(), vec![1, 2]);
        let mixed = data.draw_bytes(4).unwrap();
        assert_eq!(mixed[0], 3);
        assert_eq!(data.buffer().len(), 6);
        assert_eq!(&data.buffer()[2..], &mixed[..]);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let mut first = seeded(vec![], 64);
        let a = first.draw_bytes(5).unwrap();
        let b = first.draw_bits(13).unwrap();
        first.freeze();

        let mut replay = ConjectureData::for_buffer(first.buffer());
        assert_eq!(replay.draw_bytes(5).unwrap(), a);
        assert_eq!(replay.draw_bits(13).unwrap(), b);
        replay.freeze();
        assert_eq!(replay.as_result(), first.as_result());
    }

    #[test]
    fn test_for_buffer_overruns_past_end() {
        let mut data = ConjectureData::for_buffer(&[7]);
        let err = data.draw_bytes(2).unwrap_err();
        assert_eq!(err.status(), Status::Overrun);
        assert_eq!(data.status(), Status::Overrun);
        assert!(data.buffer().is_empty());
    }

    #[test]
    fn test_max_length_overrun_with_random_source() {
        let mut data = seeded(vec![], 4);
        data.draw_bytes(3).unwrap();
        assert!(data.draw_bytes(2).is_err());
        assert_eq!(data.status(), Status::Overrun);
    }

    #[test]
    fn test_huge_draw_overruns_instead_of_overflowing() {
        let mut data = ConjectureData::for_buffer(&[1, 2, 3]);
        data.draw_bytes(1).unwrap();
        let err = data.draw_bytes(usize::MAX).unwrap_err();
        assert_eq!(err.status(), Status::Overrun);
        assert_eq!(data.status(), Status::Overrun);
        assert_eq!(data.buffer(), &[1]);

        let mut data = seeded(vec![], usize::MAX);
        data.draw_bytes(2).unwrap();
        assert_eq!(data.draw_bytes(usize::MAX).unwrap_err().status(), Status::Overrun);
    }

    #[test]
    fn test_draw_bits_masks_first_byte() {
        let mut data = ConjectureData::for_buffer(&[0xff, 0xff]);
        assert_eq!(data.draw_bits(9).unwrap(), 0x1ff);
        assert_eq!(data.buffer(), &[0x01, 0xff]);
        assert_eq!(data.as_result().capped.get(&0), Some(&1));

        let mut data = ConjectureData::for_buffer(&[0xab]);
        assert_eq!(data.draw_bits(8).unwrap(), 0xab);
        assert!(data.as_result().capped.is_empty());
    }

    #[test]
    fn test_draw_zero_bits_consumes_nothing() {
        let mut data = ConjectureData::for_buffer(&[]);
        assert_eq!(data.draw_bits(0).unwrap(), 0);
        assert!(data.buffer().is_empty());
        assert_eq!(data.status(), Status::Valid);
    }

    #[test]
    fn test_write_ignores_prefix_bytes() {
        let mut data = ConjectureData::for_buffer(&[9, 9, 5]);
        data.write(&[1, 2]).unwrap();
        assert_eq!(data.draw_bytes(1).unwrap(), vec![5]);
        let result = data.as_result();
        assert_eq!(result.buffer, vec![1, 2, 5]);
        assert_eq!(result.forced, [0, 1].into_iter().collect());
    }

    #[test]
    fn test_conclusion_is_final() {
        let mut data = ConjectureData::for_buffer(&[1, 2]);
        assert!(data.mark_interesting_with_origin(42).is_err());
        assert_eq!(data.mark_invalid().unwrap_err().status(), Status::Interesting);
        assert!(data.draw_bytes(1).is_err());
        data.freeze();
        assert_eq!(data.status(), Status::Interesting);
        assert_eq!(data.interesting_origin(), Some(42));
    }

    #[test]
    fn test_freeze_keeps_valid_status() {
        let mut data = ConjectureData::for_buffer(&[1]);
        data.draw_bytes(1).unwrap();
        data.freeze();
        assert_eq!(data.status(), Status::Valid);
        assert!(data.draw_bytes(0).is_err());
    }

    #[test]
    fn test_status_order() {
        assert!(Status::Overrun < Status::Invalid);
        assert!(Status::Invalid < Status::Valid);
        assert!(Status::Valid < Status::Interesting);
    }

    #[test]
    fn test_labels_are_stable_and_distinct() {
        assert_eq!(calc_label_from_name("foo"), calc_label_from_name("foo"));
        assert_ne!(calc_label_from_name("foo"), calc_label_from_name("bar"));
    }
}
