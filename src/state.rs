use libafl::state::HasRand;
use libafl_bolts::rands::StdRand;

/// RNG carrier threaded through generation and every mutator.
///
/// Holding the generator behind [`HasRand`] keeps the mutation code generic
/// over the state shape and makes runs reproducible from a single seed.
pub struct FuzzState {
    rand: StdRand,
}

impl FuzzState {
    #[must_use]
    pub fn new(rand: StdRand) -> Self {
        Self { rand }
    }

    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rand: StdRand::with_seed(seed),
        }
    }
}

impl HasRand for FuzzState {
    type Rand = StdRand;

    fn rand(&self) -> &Self::Rand {
        &self.rand
    }

    fn rand_mut(&mut self) -> &mut Self::Rand {
        &mut self.rand
    }
}
