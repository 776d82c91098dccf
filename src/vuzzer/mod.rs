//! Evolutionary fuzzing loop: dry-run calibration, seed filling, and the
//! per-round pipeline (keep decision, EHB probing, execution and fitness,
//! queue trimming, taint refresh, mutation, queue rotation).

pub mod mutator;
pub mod state;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use libafl::state::HasRand;
use libafl_bolts::{rands::Rand, Error};

use crate::dict;
use crate::executor::{ExitStatus, PutExecutor};
use crate::feedback::{parse_bb_cov, parse_taint};
use crate::vuzzer::mutator::VUzzerMutator;
use crate::vuzzer::state::{
    all_chars_dict, high_chars_dict, VUzzerState, VUzzerTestcase, DICT_ALL, DICT_FULL, DICT_HIGH,
    DICT_UNIQUE,
};

pub struct VUzzerSetting {
    pub in_dir: PathBuf,
    pub out_dir: PathBuf,
    pub pop_size: usize,
    pub fill_seeds_with_crossover_prob: f64,
    pub keep_num: usize,
    pub ehb_interval: u64,
    pub ehb_penalty: f64,
    pub path_to_weight_file: Option<PathBuf>,
    pub path_to_full_dict: Option<PathBuf>,
    pub path_to_unique_dict: Option<PathBuf>,
}

pub struct VUzzer<E: PutExecutor> {
    setting: VUzzerSetting,
    state: VUzzerState,
    executor: E,
    stop: &'static AtomicBool,
    /// Dictionary storage; `all_dicts` is the priority list indexing into it.
    dicts: Vec<Vec<Vec<u8>>>,
    all_dicts: Vec<usize>,
    round: u64,
    execs: u64,
}

impl<E: PutExecutor> VUzzer<E> {
    /// Build the engine: load weights and dictionaries, read the seeds, run
    /// the dry run and fill the population up to `pop_size`.
    pub fn new(
        setting: VUzzerSetting,
        state: VUzzerState,
        executor: E,
        stop: &'static AtomicBool,
    ) -> Result<Self, Error> {
        fs::create_dir_all(setting.out_dir.join("queue"))?;

        let mut state = state;
        if let Some(path) = &setting.path_to_weight_file {
            state.bb_weights = parse_bb_weights(path)?;
        }

        let mut dicts = vec![Vec::new(), Vec::new(), high_chars_dict(), all_chars_dict()];
        if let Some(path) = &setting.path_to_full_dict {
            dict::load(path, &mut dicts[DICT_FULL], false, &mut |m| {
                log::warn!("{m}");
            })?;
        }
        if let Some(path) = &setting.path_to_unique_dict {
            dict::load(path, &mut dicts[DICT_UNIQUE], false, &mut |m| {
                log::warn!("{m}");
            })?;
        }
        let all_dicts = if !dicts[DICT_FULL].is_empty() {
            vec![DICT_FULL, DICT_FULL, DICT_HIGH, DICT_UNIQUE]
        } else if !dicts[DICT_UNIQUE].is_empty() {
            vec![DICT_UNIQUE, DICT_UNIQUE, DICT_HIGH]
        } else {
            vec![DICT_ALL]
        };

        let mut this = Self {
            setting,
            state,
            executor,
            stop,
            dicts,
            all_dicts,
            round: 0,
            execs: 0,
        };
        this.read_testcases()?;
        this.perform_dry_run()?;

        let seeds = this.state.pending_queue.len();
        if seeds < this.setting.pop_size {
            this.fill_seeds(this.setting.pop_size - seeds)?;
        }
        Ok(this)
    }

    fn read_testcases(&mut self) -> Result<(), Error> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.setting.in_dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                let hidden = path
                    .file_name()
                    .map_or(true, |n| n.to_string_lossy().starts_with('.'));
                path.is_file() && !hidden
            })
            .collect();
        files.sort();

        for path in files {
            log::debug!("loading seed {}", path.display());
            self.state.pending_queue.push(VUzzerTestcase::new(path));
        }
        self.state.seed_count = self.state.pending_queue.len();
        Ok(())
    }

    /// Calibrate: union seed coverage into the good blocks, probe with
    /// randomized inputs to find error-handling blocks, gather seed taint.
    fn perform_dry_run(&mut self) -> Result<(), Error> {
        log::debug!("starting dry run");
        if self.state.pending_queue.len() < 3 {
            return Err(Error::illegal_argument(
                "not sufficient initial files: at least 3 seeds are required",
            ));
        }

        let mut exit = ExitStatus::default();
        for index in 0..self.state.pending_queue.len() {
            let buf = self.state.pending_queue[index].load()?.to_vec();
            let feedback = self.executor.run(&buf, &mut exit)?;
            self.execs += 1;
            for addr in parse_bb_cov(&feedback).keys() {
                self.state.good_bbs.insert(*addr);
            }
            self.state.pending_queue[index].unload();
        }
        log::debug!("{} good blocks", self.state.good_bbs.len());

        // two passes of 30 fully randomized inputs reveal the error path
        for _ in 0..60 {
            let pending_len = self.state.pending_queue.len() as u64;
            let index = self.state.rand_mut().below(pending_len) as usize;
            let buf = self.state.pending_queue[index].load()?.to_vec();
            let mut mutator = VUzzerMutator::new(buf);
            mutator.totally_random(&mut self.state);

            let feedback = self.executor.run(mutator.buf(), &mut exit)?;
            self.execs += 1;
            for addr in parse_bb_cov(&feedback).keys() {
                if !self.state.good_bbs.contains(addr) {
                    self.state.ehb.insert(*addr);
                }
            }
            self.state.pending_queue[index].unload();
        }
        log::debug!("{} error-handling blocks", self.state.ehb.len());

        for index in 0..self.state.pending_queue.len() {
            let buf = self.state.pending_queue[index].load()?.to_vec();
            let feedback = self.executor.run_taint(&buf, &mut exit)?;
            self.execs += 1;
            self.state.pending_queue[index].taint = parse_taint(&feedback);
            self.state.pending_queue[index].unload();
        }
        Ok(())
    }

    /// Grow the population to its target size by mutating the initial seeds.
    fn fill_seeds(&mut self, size: usize) -> Result<(), Error> {
        log::debug!("filling seeds with {size} children");
        let initial_count = self.state.pending_queue.len();

        let mut added = 0usize;
        while added < size {
            let coin = self.state.rand_mut().below(1000) as f64 / 1000.0;
            if coin > 1.0 - self.setting.fill_seeds_with_crossover_prob && size - added > 1 {
                let (a, b) = self.sample_two(initial_count);
                let buf_a = self.state.pending_queue[a].load()?.to_vec();
                let buf_b = self.state.pending_queue[b].load()?.to_vec();
                let taint_a = self.state.pending_queue[a].taint.clone();
                let taint_b = self.state.pending_queue[b].taint.clone();
                self.state.pending_queue[a].unload();
                self.state.pending_queue[b].unload();

                let crossover = VUzzerMutator::new(buf_a);
                let (child_a, child_b) = crossover.crossover(&mut self.state, &buf_b);

                let mut mutator = VUzzerMutator::new(child_a);
                mutator.taint_based_change(&mut self.state, &taint_a);
                self.enqueue_child(mutator.into_buf())?;
                let mut mutator = VUzzerMutator::new(child_b);
                mutator.taint_based_change(&mut self.state, &taint_b);
                self.enqueue_child(mutator.into_buf())?;
                added += 2;
            } else {
                let pending_len = self.state.pending_queue.len() as u64;
                let index = self.state.rand_mut().below(pending_len) as usize;
                let buf = self.state.pending_queue[index].load()?.to_vec();
                let taint = self.state.pending_queue[index].taint.clone();
                self.state.pending_queue[index].unload();

                let mut mutator = VUzzerMutator::new(buf);
                let dict = self.pick_dict();
                mutator.mutate_random(&mut self.state, &dict);
                mutator.taint_based_change(&mut self.state, &taint);
                self.enqueue_child(mutator.into_buf())?;
                added += 1;
            }
        }
        Ok(())
    }

    /// One full fuzzing round:
    /// keep decision, EHB probe, execute + fitness + trim, taint refresh,
    /// mutation, queue rotation.
    pub fn one_loop(&mut self) -> Result<(), Error> {
        self.round += 1;
        self.decide_keep();
        self.run_ehb()?;
        self.execute_and_update_fitness()?;
        self.trim_queue();
        self.execute_taint_and_update()?;
        self.mutate()?;
        self.update_queue();
        Ok(())
    }

    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Flag the parents of this round: the fittest `keep_num` always stay,
    /// the rest survive in proportion to their relative fitness.
    fn decide_keep(&mut self) {
        let mut order: Vec<usize> = (0..self.state.pending_queue.len()).collect();
        order.sort_by(|&a, &b| {
            self.state.pending_queue[b]
                .fitness
                .total_cmp(&self.state.pending_queue[a].fitness)
        });

        let best = order
            .first()
            .map(|&i| self.state.pending_queue[i].fitness)
            .unwrap_or(0.0);
        for (rank, &index) in order.iter().enumerate() {
            let keep = if rank < self.setting.keep_num {
                true
            } else if best > 0.0 {
                let relative = self.state.pending_queue[index].fitness.max(0.0) / best;
                (self.state.rand_mut().below(1000) as f64 / 1000.0) < relative * 0.3
            } else {
                false
            };
            self.state.pending_queue[index].keep = keep;
        }
    }

    /// Periodically re-probe with fully randomized inputs so late-blooming
    /// error paths do not keep earning fitness.
    fn run_ehb(&mut self) -> Result<(), Error> {
        if self.setting.ehb_interval == 0 || self.round % self.setting.ehb_interval != 0 {
            return Ok(());
        }
        let mut exit = ExitStatus::default();
        for _ in 0..5 {
            if self.state.pending_queue.is_empty() {
                break;
            }
            let pending_len = self.state.pending_queue.len() as u64;
            let index = self.state.rand_mut().below(pending_len) as usize;
            let buf = self.state.pending_queue[index].load()?.to_vec();
            self.state.pending_queue[index].unload();
            let mut mutator = VUzzerMutator::new(buf);
            mutator.totally_random(&mut self.state);

            let feedback = self.executor.run(mutator.buf(), &mut exit)?;
            self.execs += 1;
            for addr in parse_bb_cov(&feedback).keys() {
                if !self.state.good_bbs.contains(addr) {
                    self.state.ehb.insert(*addr);
                }
            }
        }
        Ok(())
    }

    /// Execute every unscored entry and assign its fitness.
    fn execute_and_update_fitness(&mut self) -> Result<(), Error> {
        let mut exit = ExitStatus::default();
        for index in 0..self.state.pending_queue.len() {
            if self.state.pending_queue[index].scored {
                continue;
            }
            let buf = self.state.pending_queue[index].load()?.to_vec();
            let feedback = self.executor.run(&buf, &mut exit)?;
            self.execs += 1;
            let cov = parse_bb_cov(&feedback);
            let fitness = self.fitness_of(&cov);
            let testcase = &mut self.state.pending_queue[index];
            testcase.fitness = fitness;
            testcase.scored = true;
            testcase.unload();
        }
        Ok(())
    }

    /// Weighted good-block coverage, penalized per error-handling block.
    fn fitness_of(&self, cov: &BTreeMap<u64, u32>) -> f64 {
        let mut fitness = 0.0;
        for addr in cov.keys() {
            if self.state.ehb.contains(addr) {
                fitness -= self.setting.ehb_penalty;
            } else {
                fitness += self.state.bb_weights.get(addr).copied().unwrap_or(1.0);
            }
        }
        fitness
    }

    /// Cap the population at `pop_size` by fitness rank, unlinking dropped
    /// files the engine owns (never the user's seeds).
    fn trim_queue(&mut self) {
        if self.state.pending_queue.len() <= self.setting.pop_size {
            return;
        }
        self.state
            .pending_queue
            .sort_by(|a, b| b.fitness.total_cmp(&a.fitness));
        let dropped = self.state.pending_queue.split_off(self.setting.pop_size);
        for testcase in dropped {
            if testcase.path().starts_with(&self.setting.out_dir) {
                if let Err(e) = fs::remove_file(testcase.path()) {
                    log::warn!("cannot unlink {}: {e}", testcase.path().display());
                }
            }
        }
    }

    /// Refresh the taint maps of this round's parents.
    fn execute_taint_and_update(&mut self) -> Result<(), Error> {
        let mut exit = ExitStatus::default();
        for index in 0..self.state.pending_queue.len() {
            if !self.state.pending_queue[index].keep {
                continue;
            }
            let buf = self.state.pending_queue[index].load()?.to_vec();
            let feedback = self.executor.run_taint(&buf, &mut exit)?;
            self.execs += 1;
            self.state.pending_queue[index].taint = parse_taint(&feedback);
            self.state.pending_queue[index].unload();
        }
        Ok(())
    }

    /// Breed the next generation from the kept parents.
    fn mutate(&mut self) -> Result<(), Error> {
        let parents: Vec<usize> = (0..self.state.pending_queue.len())
            .filter(|&i| self.state.pending_queue[i].keep)
            .collect();
        if parents.is_empty() {
            return Ok(());
        }

        let target = self.setting.pop_size;
        let mut added = 0usize;
        while added < target {
            if self.stop_requested() {
                break;
            }
            let coin = self.state.rand_mut().below(1000) as f64 / 1000.0;
            if coin < self.setting.fill_seeds_with_crossover_prob
                && parents.len() > 1
                && target - added > 1
            {
                let a = parents[self.state.rand_mut().below(parents.len() as u64) as usize];
                let b = loop {
                    let b = parents[self.state.rand_mut().below(parents.len() as u64) as usize];
                    if b != a {
                        break b;
                    }
                };
                let buf_a = self.state.pending_queue[a].load()?.to_vec();
                let buf_b = self.state.pending_queue[b].load()?.to_vec();
                let taint_a = self.state.pending_queue[a].taint.clone();
                let taint_b = self.state.pending_queue[b].taint.clone();
                self.state.pending_queue[a].unload();
                self.state.pending_queue[b].unload();

                let crossover = VUzzerMutator::new(buf_a);
                let (child_a, child_b) = crossover.crossover(&mut self.state, &buf_b);
                let mut mutator = VUzzerMutator::new(child_a);
                mutator.taint_based_change(&mut self.state, &taint_a);
                self.enqueue_child(mutator.into_buf())?;
                let mut mutator = VUzzerMutator::new(child_b);
                mutator.taint_based_change(&mut self.state, &taint_b);
                self.enqueue_child(mutator.into_buf())?;
                added += 2;
            } else {
                let index = parents[self.state.rand_mut().below(parents.len() as u64) as usize];
                let buf = self.state.pending_queue[index].load()?.to_vec();
                let taint = self.state.pending_queue[index].taint.clone();
                self.state.pending_queue[index].unload();

                let mut mutator = VUzzerMutator::new(buf);
                let dict = self.pick_dict();
                mutator.mutate_random(&mut self.state, &dict);
                mutator.taint_based_change(&mut self.state, &taint);
                self.enqueue_child(mutator.into_buf())?;
                added += 1;
            }
        }
        Ok(())
    }

    /// Close the round: clear the parent flags and report.
    fn update_queue(&mut self) {
        for testcase in &mut self.state.pending_queue {
            testcase.keep = false;
        }
        let best = self
            .state
            .pending_queue
            .iter()
            .map(|t| t.fitness)
            .fold(f64::NEG_INFINITY, f64::max);
        println!(
            "generation {:>4}: execs {:>8}, population {:>5}, best fitness {:.2}, ehb {}",
            self.round,
            self.execs,
            self.state.pending_queue.len(),
            best,
            self.state.ehb.len(),
        );
    }

    fn enqueue_child(&mut self, buf: Vec<u8>) -> Result<(), Error> {
        let path = self
            .setting
            .out_dir
            .join("queue")
            .join(format!("id:{:06}", self.state.queued_paths));
        fs::write(&path, &buf).map_err(|e| {
            Error::file(std::io::Error::new(
                e.kind(),
                format!("unable to create file {}: {e}", path.display()),
            ))
        })?;
        self.state
            .pending_queue
            .push(VUzzerTestcase::with_buf(path, buf));
        self.state.queued_paths = self.state.queued_paths.wrapping_add(1);
        Ok(())
    }

    /// Two distinct indices below `bound`.
    fn sample_two(&mut self, bound: usize) -> (usize, usize) {
        debug_assert!(bound >= 2);
        let a = self.state.rand_mut().below(bound as u64) as usize;
        let b = loop {
            let b = self.state.rand_mut().below(bound as u64) as usize;
            if b != a {
                break b;
            }
        };
        (a, b)
    }

    /// One dictionary from the priority list.
    fn pick_dict(&mut self) -> Vec<Vec<u8>> {
        let index = self
            .state
            .rand_mut()
            .below(self.all_dicts.len() as u64) as usize;
        self.dicts[self.all_dicts[index]].clone()
    }
}

/// Parse a `ADDR WEIGHT` per line weights file (hex address, float weight).
fn parse_bb_weights(path: &Path) -> Result<std::collections::HashMap<u64, f64>, Error> {
    let text = fs::read_to_string(path).map_err(|e| {
        Error::illegal_argument(format!("unreadable weights file {}: {e}", path.display()))
    })?;
    let mut weights = std::collections::HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(addr), Some(weight)) = (fields.next(), fields.next()) else {
            log::warn!("malformed weight record: {line:?}");
            continue;
        };
        let addr = addr.strip_prefix("0x").unwrap_or(addr);
        match (u64::from_str_radix(addr, 16), weight.parse::<f64>()) {
            (Ok(addr), Ok(weight)) => {
                weights.insert(addr, weight);
            }
            _ => log::warn!("malformed weight record: {line:?}"),
        }
    }
    Ok(weights)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicBool;

    use libafl_bolts::rands::StdRand;
    use libafl_bolts::Error;

    use super::{VUzzer, VUzzerSetting};
    use crate::executor::{ExitStatus, PutExecutor, PutFeedback};
    use crate::vuzzer::state::VUzzerState;

    static STOP: AtomicBool = AtomicBool::new(false);

    /// Fake PUT: block per distinct byte value; taint says offset 0 saw 'A'.
    struct ByteCoverage;

    impl PutExecutor for ByteCoverage {
        fn run(&mut self, buf: &[u8], _exit: &mut ExitStatus) -> Result<PutFeedback, Error> {
            let mut cov: BTreeMap<u64, u32> = BTreeMap::new();
            for &b in buf {
                *cov.entry(0x1000 + b as u64).or_insert(0) += 1;
            }
            let text: String = cov.iter().map(|(a, c)| format!("{a:x} {c}\n")).collect();
            Ok(PutFeedback::new(text.into_bytes()))
        }

        fn run_taint(&mut self, _buf: &[u8], _exit: &mut ExitStatus) -> Result<PutFeedback, Error> {
            Ok(PutFeedback::new(b"0 65\n".to_vec()))
        }
    }

    fn dirs(tag: &str) -> (std::path::PathBuf, std::path::PathBuf) {
        let base = std::env::temp_dir().join(format!("tarsier-vuzzer-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&base);
        let in_dir = base.join("seeds");
        let out_dir = base.join("out");
        std::fs::create_dir_all(&in_dir).unwrap();
        (in_dir, out_dir)
    }

    fn setting(in_dir: std::path::PathBuf, out_dir: std::path::PathBuf) -> VUzzerSetting {
        VUzzerSetting {
            in_dir,
            out_dir,
            pop_size: 8,
            fill_seeds_with_crossover_prob: 0.4,
            keep_num: 2,
            ehb_interval: 4,
            ehb_penalty: 1.0,
            path_to_weight_file: None,
            path_to_full_dict: None,
            path_to_unique_dict: None,
        }
    }

    #[test]
    fn dry_run_requires_three_seeds() {
        let (in_dir, out_dir) = dirs("fewseeds");
        std::fs::write(in_dir.join("only"), b"one").unwrap();

        let result = VUzzer::new(
            setting(in_dir.clone(), out_dir),
            VUzzerState::new(StdRand::with_seed(1)),
            ByteCoverage,
            &STOP,
        );
        assert!(result.is_err());
        std::fs::remove_dir_all(in_dir.parent().unwrap()).unwrap();
    }

    #[test]
    fn startup_fills_population_and_rounds_run() {
        let (in_dir, out_dir) = dirs("rounds");
        std::fs::write(in_dir.join("s1"), b"AAAA").unwrap();
        std::fs::write(in_dir.join("s2"), b"BBBB").unwrap();
        std::fs::write(in_dir.join("s3"), b"CCCC").unwrap();

        let mut vuzzer = VUzzer::new(
            setting(in_dir.clone(), out_dir.clone()),
            VUzzerState::new(StdRand::with_seed(7)),
            ByteCoverage,
            &STOP,
        )
        .unwrap();

        assert_eq!(vuzzer.state.pending_queue.len(), 8);
        assert!(!vuzzer.state.good_bbs.is_empty());
        // children were persisted under out_dir/queue
        assert!(out_dir.join("queue").join("id:000000").exists());

        for _ in 0..3 {
            vuzzer.one_loop().unwrap();
            assert!(vuzzer.state.pending_queue.len() <= 2 * vuzzer.setting.pop_size);
        }
        // every survivor has been scored at least once
        assert!(vuzzer
            .state
            .pending_queue
            .iter()
            .filter(|t| t.scored)
            .count()
            >= vuzzer.setting.pop_size.min(vuzzer.state.pending_queue.len()));
        std::fs::remove_dir_all(in_dir.parent().unwrap()).unwrap();
    }
}
