//! Mutable state of the evolutionary engine.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use libafl::state::HasRand;
use libafl_bolts::{rands::StdRand, Error};

/// Index of the full-bytes dictionary in [`VUzzerState::dicts`].
pub const DICT_FULL: usize = 0;
/// Index of the unique-bytes dictionary.
pub const DICT_UNIQUE: usize = 1;
/// Index of the generated high-characters dictionary.
pub const DICT_HIGH: usize = 2;
/// Index of the generated all-characters dictionary.
pub const DICT_ALL: usize = 3;

/// One corpus entry: an on-disk file, a lazily loaded buffer, a fitness
/// score and the taint map gathered for it.
pub struct VUzzerTestcase {
    path: PathBuf,
    buf: Option<Vec<u8>>,
    pub fitness: f64,
    pub scored: bool,
    pub keep: bool,
    /// file offset → values observed at that offset under taint tracking
    pub taint: HashMap<usize, BTreeSet<u8>>,
}

impl VUzzerTestcase {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            buf: None,
            fitness: 0.0,
            scored: false,
            keep: false,
            taint: HashMap::new(),
        }
    }

    /// Entry whose bytes are already in memory (freshly written children).
    #[must_use]
    pub fn with_buf(path: PathBuf, buf: Vec<u8>) -> Self {
        Self {
            buf: Some(buf),
            ..Self::new(path)
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&mut self) -> Result<&[u8], Error> {
        if self.buf.is_none() {
            self.buf = Some(fs::read(&self.path)?);
        }
        Ok(self.buf.as_deref().expect("just loaded"))
    }

    pub fn unload(&mut self) {
        self.buf = None;
    }
}

pub struct VUzzerState {
    rand: StdRand,
    pub pending_queue: Vec<VUzzerTestcase>,
    /// Number of user-provided seeds at the head of the queue at startup.
    pub seed_count: usize,
    /// Blocks observed under valid seeds during the dry run.
    pub good_bbs: HashSet<u64>,
    /// Error-handling blocks: seen only under invalidated inputs.
    pub ehb: HashSet<u64>,
    pub bb_weights: HashMap<u64, f64>,
    pub queued_paths: u32,
}

impl VUzzerState {
    #[must_use]
    pub fn new(rand: StdRand) -> Self {
        Self {
            rand,
            pending_queue: Vec::new(),
            seed_count: 0,
            good_bbs: HashSet::new(),
            ehb: HashSet::new(),
            bb_weights: HashMap::new(),
            queued_paths: 0,
        }
    }
}

impl HasRand for VUzzerState {
    type Rand = StdRand;

    fn rand(&self) -> &Self::Rand {
        &self.rand
    }

    fn rand_mut(&mut self) -> &mut Self::Rand {
        &mut self.rand
    }
}

/// Single-byte tokens 0x80..=0xff.
#[must_use]
pub fn high_chars_dict() -> Vec<Vec<u8>> {
    (0x80u8..=0xff).map(|b| vec![b]).collect()
}

/// Single-byte tokens over the whole byte range.
#[must_use]
pub fn all_chars_dict() -> Vec<Vec<u8>> {
    (0u8..=0xff).map(|b| vec![b]).collect()
}
