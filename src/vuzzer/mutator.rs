//! Byte-level mutations of the evolutionary engine.

use std::collections::{BTreeSet, HashMap};

use libafl::mutators::MutationResult;
use libafl::state::HasRand;
use libafl_bolts::rands::Rand;

/// Mutation scratchpad over one input buffer.
pub struct VUzzerMutator {
    buf: Vec<u8>,
}

impl VUzzerMutator {
    #[must_use]
    pub fn new(buf: Vec<u8>) -> Self {
        Self { buf }
    }

    #[must_use]
    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    #[must_use]
    pub fn into_buf(self) -> Vec<u8> {
        self.buf
    }

    /// Replace every byte with a random one; the length is preserved.
    pub fn totally_random<S: HasRand>(&mut self, state: &mut S) {
        for b in self.buf.iter_mut() {
            *b = state.rand_mut().below(256) as u8;
        }
    }

    /// One random structural or byte-level change, dictionary-informed.
    pub fn mutate_random<S: HasRand>(
        &mut self,
        state: &mut S,
        dict: &[Vec<u8>],
    ) -> MutationResult {
        if self.buf.is_empty() {
            self.buf.push(state.rand_mut().below(256) as u8);
            return MutationResult::Mutated;
        }

        match state.rand_mut().below(5) {
            0 => {
                // overwrite a few random bytes
                let n = 1 + state.rand_mut().below(4) as usize;
                for _ in 0..n {
                    let pos = state.rand_mut().below(self.buf.len() as u64) as usize;
                    self.buf[pos] = state.rand_mut().below(256) as u8;
                }
            }
            1 => {
                // insert a dictionary token (random bytes without one)
                let token = if dict.is_empty() {
                    vec![state.rand_mut().below(256) as u8]
                } else {
                    state.rand_mut().choose(dict).clone()
                };
                let pos = state.rand_mut().below(self.buf.len() as u64 + 1) as usize;
                self.buf.splice(pos..pos, token);
            }
            2 => {
                // remove a random range, keeping at least one byte
                if self.buf.len() > 1 {
                    let start = state.rand_mut().below(self.buf.len() as u64) as usize;
                    let max_len = (self.buf.len() - start).min(self.buf.len() - 1);
                    let len = 1 + state.rand_mut().below(max_len as u64) as usize;
                    self.buf.drain(start..start + len);
                }
            }
            3 => {
                // duplicate a random slice of the buffer
                let start = state.rand_mut().below(self.buf.len() as u64) as usize;
                let len = 1 + state.rand_mut().below((self.buf.len() - start) as u64) as usize;
                let slice = self.buf[start..start + len].to_vec();
                let pos = state.rand_mut().below(self.buf.len() as u64 + 1) as usize;
                self.buf.splice(pos..pos, slice);
            }
            _ => {
                // small arithmetic step on one byte
                let pos = state.rand_mut().below(self.buf.len() as u64) as usize;
                let delta = 1 + state.rand_mut().below(16) as u8;
                if state.rand_mut().below(2) == 0 {
                    self.buf[pos] = self.buf[pos].wrapping_add(delta);
                } else {
                    self.buf[pos] = self.buf[pos].wrapping_sub(delta);
                }
            }
        }
        MutationResult::Mutated
    }

    /// Single-point crossover with `other`; returns both children.
    pub fn crossover<S: HasRand>(&self, state: &mut S, other: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let cut_a = state.rand_mut().below(self.buf.len() as u64 + 1) as usize;
        let cut_b = state.rand_mut().below(other.len() as u64 + 1) as usize;

        let mut child_a = self.buf[..cut_a].to_vec();
        child_a.extend_from_slice(&other[cut_b..]);
        let mut child_b = other[..cut_b].to_vec();
        child_b.extend_from_slice(&self.buf[cut_a..]);
        (child_a, child_b)
    }

    /// Steer tainted offsets towards values the PUT compared them against.
    pub fn taint_based_change<S: HasRand>(
        &mut self,
        state: &mut S,
        taint: &HashMap<usize, BTreeSet<u8>>,
    ) -> MutationResult {
        let mut result = MutationResult::Skipped;
        for (&offset, values) in taint {
            if offset >= self.buf.len() || values.is_empty() {
                continue;
            }
            if state.rand_mut().below(100) < 80 {
                let values: Vec<u8> = values.iter().copied().collect();
                self.buf[offset] = *state.rand_mut().choose(&values);
                result = MutationResult::Mutated;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap};

    use libafl::mutators::MutationResult;

    use super::VUzzerMutator;
    use crate::state::FuzzState;

    #[test]
    fn totally_random_preserves_length() {
        let mut state = FuzzState::with_seed(1);
        let mut m = VUzzerMutator::new(vec![0; 64]);
        m.totally_random(&mut state);
        assert_eq!(m.buf().len(), 64);
    }

    #[test]
    fn crossover_children_cover_both_parents() {
        let mut state = FuzzState::with_seed(2);
        let a = vec![b'A'; 10];
        let b = vec![b'B'; 6];
        let m = VUzzerMutator::new(a.clone());
        let (c1, c2) = m.crossover(&mut state, &b);
        assert_eq!(c1.len() + c2.len(), a.len() + b.len());
        assert!(c1.iter().chain(c2.iter()).all(|&x| x == b'A' || x == b'B'));
    }

    #[test]
    fn taint_change_writes_only_observed_values() {
        let mut state = FuzzState::with_seed(3);
        let original = vec![0u8; 8];
        let mut taint = HashMap::new();
        taint.insert(2usize, BTreeSet::from([0x41u8]));
        taint.insert(5usize, BTreeSet::from([0x42u8, 0x43u8]));
        taint.insert(100usize, BTreeSet::from([0x44u8]));

        let mut m = VUzzerMutator::new(original.clone());
        m.taint_based_change(&mut state, &taint);
        let out = m.into_buf();

        assert_eq!(out.len(), original.len());
        for (i, (&was, &now)) in original.iter().zip(out.iter()).enumerate() {
            match i {
                2 => assert!(now == was || now == 0x41),
                5 => assert!(now == was || now == 0x42 || now == 0x43),
                _ => assert_eq!(now, was),
            }
        }
    }

    #[test]
    fn mutate_random_never_empties_the_buffer() {
        let mut state = FuzzState::with_seed(4);
        let dict = vec![b"token".to_vec()];
        let mut m = VUzzerMutator::new(vec![1, 2, 3, 4]);
        for _ in 0..256 {
            let result = m.mutate_random(&mut state, &dict);
            assert_eq!(result, MutationResult::Mutated);
            assert!(!m.buf().is_empty());
        }
    }
}
