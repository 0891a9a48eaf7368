//! Byte-buffer shrink strategy used by the runner.

use byteorder::{BigEndian, ByteOrder};
use rand::seq::SliceRandom;

use super::common::try_find_integer;
use super::{ShrinkError, ShrinkStrategy, Shrinker};

const CHUNK_SIZES: [usize; 4] = [8, 4, 2, 1];
const WINDOW_WIDTHS: [usize; 3] = [4, 2, 1];
const MAX_PAIR_GAP: usize = 8;

/// Strict shortlex comparison: shorter buffers are simpler, equal lengths compare
/// lexicographically.
pub fn shortlex_lt(left: &[u8], right: &[u8]) -> bool {
    (left.len(), left) < (right.len(), right)
}

/// Minimizes a byte buffer in shortlex order.
///
/// Each step deletes chunks, zeroes chunks, lowers small big-endian windows and finally
/// shifts weight from earlier bytes to later ones. Passes take adaptive steps through
/// [`find_integer`](super::find_integer).
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferShrinker;

impl ShrinkStrategy for BufferShrinker {
    type Value = Vec<u8>;

    fn left_is_better(&self, left: &Vec<u8>, right: &Vec<u8>) -> bool {
        shortlex_lt(left, right)
    }

    fn short_circuit(s: &mut Shrinker<'_, Self>) -> Result<bool, ShrinkError> {
        if s.current().is_empty() {
            return Ok(true);
        }
        s.incorporate(Vec::new())
    }

    fn preamble(s: &mut Shrinker<'_, Self>) -> Result<(), ShrinkError> {
        let zeros = vec![0; s.current().len()];
        s.incorporate(zeros)?;
        Ok(())
    }

    fn run_step(s: &mut Shrinker<'_, Self>) -> Result<(), ShrinkError> {
        delete_chunks(s)?;
        zero_chunks(s)?;
        minimize_windows(s)?;
        redistribute_pairs(s)?;
        Ok(())
    }
}

/// Deletes runs of `k`-byte chunks, scanning from the end of the buffer.
fn delete_chunks(s: &mut Shrinker<'_, BufferShrinker>) -> Result<(), ShrinkError> {
    for &k in &CHUNK_SIZES {
        let mut end = s.current().len();
        while end >= k && !s.is_exhausted() {
            let base = s.current().clone();
            if end > base.len() {
                end = base.len();
                continue;
            }
            let deleted = try_find_integer(|n| {
                let width = (n as usize).saturating_mul(k);
                if width > end {
                    return Ok(false);
                }
                let mut candidate = base[..end - width].to_vec();
                candidate.extend_from_slice(&base[end..]);
                s.consider(candidate)
            })?;
            if deleted > 0 {
                end -= deleted as usize * k;
            } else {
                end -= 1;
            }
        }
    }
    Ok(())
}

/// Replaces aligned non-zero chunks with zeros.
fn zero_chunks(s: &mut Shrinker<'_, BufferShrinker>) -> Result<(), ShrinkError> {
    for &k in &CHUNK_SIZES {
        let mut start = 0;
        while start + k <= s.current().len() && !s.is_exhausted() {
            if s.current()[start..start + k].iter().any(|&b| b != 0) {
                let mut candidate = s.current().clone();
                candidate[start..start + k].fill(0);
                s.consider(candidate)?;
            }
            start += k;
        }
    }
    Ok(())
}

/// Reads each window as a big-endian integer and lowers it as far as possible.
fn minimize_windows(s: &mut Shrinker<'_, BufferShrinker>) -> Result<(), ShrinkError> {
    for &width in &WINDOW_WIDTHS {
        let mut start = 0;
        while start + width <= s.current().len() && !s.is_exhausted() {
            let base = s.current().clone();
            let value = BigEndian::read_uint(&base[start..start + width], width);
            if value > 0 {
                try_find_integer(|k| {
                    if k > value {
                        return Ok(false);
                    }
                    let mut candidate = base.clone();
                    BigEndian::write_uint(&mut candidate[start..start + width], value - k, width);
                    s.consider(candidate)
                })?;
            }
            start += 1;
        }
    }
    Ok(())
}

/// Moves value from byte `i` to a nearby later byte `j`, keeping their sum.
///
/// Pairs are visited in a random order drawn from the shrinker's generator.
fn redistribute_pairs(s: &mut Shrinker<'_, BufferShrinker>) -> Result<(), ShrinkError> {
    let len = s.current().len();
    let mut pairs: Vec<(usize, usize)> = (0..len)
        .flat_map(|i| (i + 1..len.min(i + 1 + MAX_PAIR_GAP)).map(move |j| (i, j)))
        .collect();
    pairs.shuffle(s.rng_mut());

    for (i, j) in pairs {
        if s.is_exhausted() {
            break;
        }
        let base = s.current().clone();
        if base.len() != len {
            break;
        }
        let limit = base[i].min(u8::MAX - base[j]) as u64;
        if limit == 0 {
            continue;
        }
        try_find_integer(|d| {
            if d > limit {
                return Ok(false);
            }
            let mut candidate = base.clone();
            candidate[i] -= d as u8;
            candidate[j] += d as u8;
            s.consider(candidate)
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn shrink<P: FnMut(&Vec<u8>) -> bool>(initial: Vec<u8>, predicate: P) -> Vec<u8> {
        Shrinker::shrink(BufferShrinker, initial, predicate, ChaCha8Rng::seed_from_u64(0), true).unwrap()
    }

    #[test]
    fn test_shortlex_order() {
        assert!(shortlex_lt(&[], &[0]));
        assert!(shortlex_lt(&[9], &[0, 0]));
        assert!(shortlex_lt(&[1, 2], &[1, 3]));
        assert!(!shortlex_lt(&[1, 3], &[1, 3]));
        assert!(!shortlex_lt(&[0, 0, 0], &[255]));
    }

    #[test]
    fn test_shrinks_to_empty_when_possible() {
        assert_eq!(shrink(vec![1, 2, 3], |_| true), Vec::<u8>::new());
    }

    #[test]
    fn test_deletes_down_to_required_length() {
        let result = shrink(vec![5; 40], |b| b.len() >= 3);
        assert_eq!(result, vec![0, 0, 0]);
    }

    #[test]
    fn test_lowers_single_byte() {
        assert_eq!(shrink(vec![200], |b| b.len() == 1 && b[0] >= 17), vec![17]);
    }

    #[test]
    fn test_lowers_multi_byte_window() {
        let result = shrink(vec![0x12, 0x34], |b| {
            b.len() == 2 && BigEndian::read_u16(b) >= 300
        });
        assert_eq!(BigEndian::read_u16(&result), 300);
    }

    #[test]
    fn test_keeps_interesting_byte_and_drops_the_rest() {
        let result = shrink(vec![3, 1, 4, 1, 5, 9, 2, 6, 5, 3, 5], |b| b.contains(&9));
        assert_eq!(result, vec![9]);
    }

    #[test]
    fn test_moves_weight_to_later_byte() {
        let result = shrink(vec![200, 7, 200], |b| {
            b.len() == 3 && b[1] == 7 && b[0] as u32 + b[2] as u32 >= 300
        });
        assert_eq!(result, vec![45, 7, 255]);
    }

    #[test]
    fn test_result_is_never_worse() {
        let initial = vec![0, 0, 1];
        let result = shrink(initial.clone(), |b| b == &[0, 0, 1]);
        assert_eq!(result, initial);
    }
}
