//! Driving loop of the grammar engine.
//!
//! One round: drain the pending queue, putting every popped item through
//! minimization (while it still owns fresh coverage), deterministic rules
//! mutation and a randomized havoc stage; once the queue runs dry, generate
//! a batch of fresh derivations and recycle the processed items.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use libafl::executors::ExitKind;
use libafl::state::HasRand;
use libafl_bolts::{rands::Rand, Error};

use crate::chunkstore::ChunkStore;
use crate::executor::{ExitReason, ExitStatus, PutExecutor};
use crate::feedback::{cov_to_bitmap, parse_bb_cov};
use crate::grammar::rule::NTermId;
use crate::grammar::Context;
use crate::hash::sha1_hex;
use crate::mutator::Mutator;
use crate::queue::{Queue, QueueItem};
use crate::state::FuzzState;
use crate::tree::{Tree, TreeLike, TreeMutation};

pub struct FuzzerSetting {
    pub work_dir: PathBuf,
    pub bitmap_size: usize,
    pub number_of_generate_inputs: usize,
    pub havoc_iterations: usize,
    pub max_chunks_per_rule: usize,
}

pub struct GrammarFuzzer<E: PutExecutor> {
    ctx: Context,
    start: NTermId,
    setting: FuzzerSetting,
    state: FuzzState,
    queue: Queue,
    chunkstore: ChunkStore,
    mutator: Mutator,
    executor: E,
    stop: &'static AtomicBool,
    crash_dir: PathBuf,
    rounds: u64,
    execs: u64,
    crashes: u64,
}

impl<E: PutExecutor> GrammarFuzzer<E> {
    pub fn new(
        ctx: Context,
        start: NTermId,
        setting: FuzzerSetting,
        state: FuzzState,
        executor: E,
        stop: &'static AtomicBool,
    ) -> Result<Self, Error> {
        let queue = Queue::new(&setting.work_dir)?;
        let crash_dir = setting.work_dir.join("crashes");
        fs::create_dir_all(&crash_dir)?;
        let chunkstore = ChunkStore::new(setting.max_chunks_per_rule);
        Ok(Self {
            ctx,
            start,
            setting,
            state,
            queue,
            chunkstore,
            mutator: Mutator::new(),
            executor,
            stop,
            crash_dir,
            rounds: 0,
            execs: 0,
            crashes: 0,
        })
    }

    pub fn run_loop(&mut self) -> Result<(), Error> {
        while !self.stop.load(Ordering::Relaxed) {
            if self.queue.is_empty() {
                self.generate_round()?;
                self.queue.new_round();
                self.rounds += 1;
                println!(
                    "round {:>4}: execs {:>8}, pending {:>4}, bits {:>6}, chunks {:>4}, crashes {}",
                    self.rounds,
                    self.execs,
                    self.queue.num_pending(),
                    self.queue.num_indexed_bits(),
                    self.chunkstore.number_of_trees(),
                    self.crashes,
                );
            } else {
                let item = self.queue.pop();
                if let Err(e) = self.process_item(item) {
                    log::warn!("input discarded: {e}");
                }
            }
        }
        log::info!("stop requested, shutting down after {} execs", self.execs);
        Ok(())
    }

    /// Generate a batch of fresh derivations and offer each to the queue.
    fn generate_round(&mut self) -> Result<(), Error> {
        for _ in 0..self.setting.number_of_generate_inputs {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            let budget = self.ctx.random_len_for_nt(&mut self.state, self.start);
            let mut tree = Tree::default();
            tree.generate_from_nt(&mut self.state, self.start, budget, &self.ctx);

            let bytes = tree.unparse(&self.ctx);
            let (bitmap, status) = run_put(
                &mut self.executor,
                &self.setting,
                &self.crash_dir,
                &mut self.execs,
                &mut self.crashes,
                &bytes,
            )?;
            self.queue.add(
                tree,
                bitmap,
                ExitReason::from(status.exit_kind),
                &self.ctx,
                status.time,
            )?;
        }
        Ok(())
    }

    fn process_item(&mut self, mut item: QueueItem) -> Result<(), Error> {
        let ctx = &self.ctx;
        let setting = &self.setting;
        let crash_dir = &self.crash_dir;

        // shrink while the item still pins fresh coverage
        if !item.fresh_bits.is_empty() {
            let executor = &mut self.executor;
            let execs = &mut self.execs;
            let crashes = &mut self.crashes;
            let mut tester =
                |repl: &TreeMutation, bits: &HashSet<usize>, ctx: &Context| -> Result<bool, Error> {
                    let bytes = repl.unparse(ctx);
                    let (bitmap, _) = run_put(executor, setting, crash_dir, execs, crashes, &bytes)?;
                    Ok(bits.iter().all(|&b| bitmap[b] != 0))
                };

            self.mutator.minimize_tree(
                &mut self.state,
                &mut item.tree,
                &item.fresh_bits,
                ctx,
                0,
                usize::MAX,
                &mut tester,
            )?;
            self.mutator.minimize_rec(
                &mut self.state,
                &mut item.tree,
                &item.fresh_bits,
                ctx,
                0,
                usize::MAX,
                &mut tester,
            )?;
        }

        {
            let executor = &mut self.executor;
            let queue = &mut self.queue;
            let execs = &mut self.execs;
            let crashes = &mut self.crashes;
            let mut tester = |repl: &TreeMutation, ctx: &Context| -> Result<(), Error> {
                let bytes = repl.unparse(ctx);
                let (bitmap, status) =
                    run_put(executor, setting, crash_dir, execs, crashes, &bytes)?;
                queue.add(
                    repl.to_tree(ctx),
                    bitmap,
                    ExitReason::from(status.exit_kind),
                    ctx,
                    status.time,
                )
            };

            self.mutator.mut_rules(
                &mut self.state,
                &item.tree,
                ctx,
                0,
                item.tree.size(),
                &mut tester,
            )?;

            let recursions = item.tree.calc_recursions(ctx);
            for _ in 0..setting.havoc_iterations {
                if self.stop.load(Ordering::Relaxed) {
                    break;
                }
                match self.state.rand_mut().below(3) {
                    0 => self
                        .mutator
                        .mut_random(&mut self.state, &item.tree, ctx, &mut tester)?,
                    1 => self.mutator.mut_splice(
                        &mut self.state,
                        &item.tree,
                        ctx,
                        &self.chunkstore,
                        &mut tester,
                    )?,
                    _ => {
                        if let Some(recursions) = &recursions {
                            self.mutator.mut_random_recursion(
                                &mut self.state,
                                &item.tree,
                                recursions,
                                ctx,
                                &mut tester,
                            )?;
                        }
                    }
                }
            }
        }

        self.chunkstore.record(item.tree.clone(), ctx);
        self.queue.finished(item)
    }
}

/// Execute `bytes`, fold the probe output into a bitmap, and persist any
/// crashing input under the crash directory (deduplicated by content hash).
fn run_put<E: PutExecutor>(
    executor: &mut E,
    setting: &FuzzerSetting,
    crash_dir: &Path,
    execs: &mut u64,
    crashes: &mut u64,
    bytes: &[u8],
) -> Result<(Vec<u8>, ExitStatus), Error> {
    let mut status = ExitStatus::default();
    let feedback = executor.run(bytes, &mut status)?;
    *execs += 1;

    if status.exit_kind == ExitKind::Crash {
        *crashes += 1;
        let path = crash_dir.join(sha1_hex(bytes));
        if !path.exists() {
            if let Err(e) = fs::write(&path, bytes) {
                log::warn!("cannot save crash {}: {e}", path.display());
            }
        }
    }

    let bitmap = cov_to_bitmap(&parse_bb_cov(&feedback), setting.bitmap_size);
    Ok((bitmap, status))
}
