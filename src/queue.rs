//! Corpus queue with an inverted index from coverage bits to inputs.

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use libafl_bolts::Error;

use crate::executor::ExitReason;
use crate::grammar::Context;
use crate::tree::{Tree, TreeLike};

pub struct QueueItem {
    pub id: usize,
    pub tree: Tree,
    /// Bits that were new to the index when this item was admitted.
    pub fresh_bits: HashSet<usize>,
    pub all_bits: Vec<u8>,
    pub exit_reason: ExitReason,
    pub execution_time: Duration,
}

pub struct Queue {
    work_dir: PathBuf,
    current_id: usize,
    inputs: Vec<QueueItem>,
    processed: Vec<QueueItem>,
    bit_to_inputs: HashMap<usize, Vec<usize>>,
}

impl Queue {
    pub fn new<P: Into<PathBuf>>(work_dir: P) -> Result<Self, Error> {
        let work_dir = work_dir.into();
        fs::create_dir_all(work_dir.join("queue"))?;
        fs::create_dir_all(work_dir.join("outputs").join("queue"))?;
        Ok(Self {
            work_dir,
            current_id: 0,
            inputs: Vec::new(),
            processed: Vec::new(),
            bit_to_inputs: HashMap::new(),
        })
    }

    /// True iff `all_bits` sets at least one bit the index does not know yet.
    fn has_fresh_bits(&self, all_bits: &[u8]) -> bool {
        all_bits
            .iter()
            .enumerate()
            .any(|(i, &b)| b != 0 && !self.bit_to_inputs.contains_key(&i))
    }

    /// Register every set bit under `id`, returning the bits that were new.
    fn register_bits(&mut self, all_bits: &[u8], id: usize) -> HashSet<usize> {
        let mut fresh = HashSet::new();
        for (i, &b) in all_bits.iter().enumerate() {
            if b != 0 {
                if !self.bit_to_inputs.contains_key(&i) {
                    fresh.insert(i);
                }
                self.bit_to_inputs.entry(i).or_default().push(id);
            }
        }
        fresh
    }

    /// Admit an executed tree. Inputs without fresh coverage are dropped
    /// without being persisted; their id is still consumed so corpus
    /// numbering stays stable.
    pub fn add(
        &mut self,
        tree: Tree,
        all_bits: Vec<u8>,
        exit_reason: ExitReason,
        ctx: &Context,
        execution_time: Duration,
    ) -> Result<(), Error> {
        if !self.has_fresh_bits(&all_bits) {
            self.bump_id();
            return Ok(());
        }

        let id = self.current_id;
        let fresh_bits = self.register_bits(&all_bits, id);

        let mut buffer = Vec::new();
        tree.unparse_to(ctx, &mut buffer);
        let path = self.input_path(id, exit_reason);
        write_file_0600(&path, &buffer)?;

        self.inputs.push(QueueItem {
            id,
            tree,
            fresh_bits,
            all_bits,
            exit_reason,
            execution_time,
        });
        self.bump_id();
        Ok(())
    }

    /// Remove and return the most recently added pending item, purging its
    /// id from every posting list.
    pub fn pop(&mut self) -> QueueItem {
        debug_assert!(!self.is_empty());
        let item = self.inputs.pop().expect("pop on empty queue");

        self.bit_to_inputs.retain(|_, ids| {
            ids.retain(|&id| id != item.id);
            !ids.is_empty()
        });
        item
    }

    /// Re-check a processed item against the current index. Items whose bits
    /// were all retired in the meantime are dropped and their mirror file
    /// deleted; the rest re-register and move to the processed list.
    pub fn finished(&mut self, item: QueueItem) -> Result<(), Error> {
        if !self.has_fresh_bits(&item.all_bits) {
            let path = self.output_path(item.id, item.exit_reason);
            match fs::remove_file(&path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    return Err(Error::file(io::Error::new(
                        e.kind(),
                        format!("unable to delete file {}: {e}", path.display()),
                    )));
                }
                _ => {}
            }
            return Ok(());
        }

        self.register_bits(&item.all_bits, item.id);
        self.processed.push(item);
        Ok(())
    }

    /// Move all processed entries back into the pending list, after any
    /// items that are still pending.
    pub fn new_round(&mut self) {
        let mut processed = std::mem::take(&mut self.processed);
        self.inputs.append(&mut processed);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    #[must_use]
    pub fn num_pending(&self) -> usize {
        self.inputs.len()
    }

    #[must_use]
    pub fn num_processed(&self) -> usize {
        self.processed.len()
    }

    #[must_use]
    pub fn num_indexed_bits(&self) -> usize {
        self.bit_to_inputs.len()
    }

    fn bump_id(&mut self) {
        self.current_id = self.current_id.wrapping_add(1);
    }

    fn input_path(&self, id: usize, exit_reason: ExitReason) -> PathBuf {
        self.work_dir
            .join("queue")
            .join(format!("id:{:09},er:{}", id, exit_reason.code()))
    }

    fn output_path(&self, id: usize, exit_reason: ExitReason) -> PathBuf {
        self.work_dir
            .join("outputs")
            .join("queue")
            .join(format!("id:{:09},er:{}", id, exit_reason.code()))
    }
}

fn write_file_0600(path: &Path, data: &[u8]) -> Result<(), Error> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| {
            Error::file(io::Error::new(
                e.kind(),
                format!("unable to create file {}: {e}", path.display()),
            ))
        })?;
    file.write_all(data).map_err(|e| {
        Error::file(io::Error::new(
            e.kind(),
            format!("unable to write file {}: {e}", path.display()),
        ))
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    use super::Queue;
    use crate::executor::ExitReason;
    use crate::grammar::tests::ab_grammar;
    use crate::grammar::Context;
    use crate::state::FuzzState;
    use crate::tree::{Tree, TreeLike};

    fn work_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("tarsier-queue-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn some_tree(ctx: &Context, seed: u64) -> Tree {
        let s = ctx.nt_id("S").unwrap();
        let mut state = FuzzState::with_seed(seed);
        let mut tree = Tree::default();
        tree.generate_from_nt(&mut state, s, 5, ctx);
        tree
    }

    fn bits(raw: &[u8]) -> Vec<u8> {
        raw.to_vec()
    }

    #[test]
    fn empty_coverage_is_a_noop() {
        let (ctx, _) = ab_grammar();
        let dir = work_dir("empty");
        let mut queue = Queue::new(&dir).unwrap();

        queue
            .add(
                some_tree(&ctx, 1),
                bits(&[0, 0, 0, 0]),
                ExitReason::Ok,
                &ctx,
                Duration::ZERO,
            )
            .unwrap();

        assert!(queue.is_empty());
        assert_eq!(queue.num_indexed_bits(), 0);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn disjoint_bits_index_and_pop() {
        let (ctx, _) = ab_grammar();
        let dir = work_dir("disjoint");
        let mut queue = Queue::new(&dir).unwrap();

        queue
            .add(
                some_tree(&ctx, 1),
                bits(&[0, 1, 0, 1]),
                ExitReason::Ok,
                &ctx,
                Duration::ZERO,
            )
            .unwrap();
        queue
            .add(
                some_tree(&ctx, 2),
                bits(&[0, 0, 1, 0]),
                ExitReason::Ok,
                &ctx,
                Duration::ZERO,
            )
            .unwrap();

        assert_eq!(queue.num_pending(), 2);
        assert_eq!(queue.num_indexed_bits(), 3);

        let item = queue.pop();
        assert_eq!(item.id, 1);
        assert_eq!(item.fresh_bits, HashSet::from([2]));
        assert_eq!(queue.num_indexed_bits(), 2);

        let item = queue.pop();
        assert_eq!(item.id, 0);
        assert_eq!(queue.num_indexed_bits(), 0);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn duplicate_coverage_is_skipped_but_reserves_id() {
        let (ctx, _) = ab_grammar();
        let dir = work_dir("dup");
        let mut queue = Queue::new(&dir).unwrap();

        queue
            .add(
                some_tree(&ctx, 1),
                bits(&[1, 0]),
                ExitReason::Ok,
                &ctx,
                Duration::ZERO,
            )
            .unwrap();
        // same bits again: dropped, id 1 consumed
        queue
            .add(
                some_tree(&ctx, 2),
                bits(&[1, 0]),
                ExitReason::Ok,
                &ctx,
                Duration::ZERO,
            )
            .unwrap();
        queue
            .add(
                some_tree(&ctx, 3),
                bits(&[0, 1]),
                ExitReason::Ok,
                &ctx,
                Duration::ZERO,
            )
            .unwrap();

        assert_eq!(queue.num_pending(), 2);
        let ids: Vec<usize> = [queue.pop().id, queue.pop().id].to_vec();
        assert_eq!(ids, vec![2, 0]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn persisted_entry_round_trips() {
        let (ctx, _) = ab_grammar();
        let dir = work_dir("roundtrip");
        let mut queue = Queue::new(&dir).unwrap();

        let tree = some_tree(&ctx, 4);
        let expected = tree.unparse(&ctx);
        queue
            .add(
                tree,
                bits(&[1]),
                ExitReason::Ok,
                &ctx,
                Duration::from_millis(1),
            )
            .unwrap();

        let path = dir.join("queue").join("id:000000000,er:0");
        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk, expected);

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        // restoring the tree from a snapshot reproduces the same bytes
        let item = queue.pop();
        let snapshot = serde_json::to_string(&item.tree).unwrap();
        let restored: Tree = serde_json::from_str(&snapshot).unwrap();
        assert_eq!(restored.unparse(&ctx), expected);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn finished_keeps_interesting_items_and_new_round_recycles() {
        let (ctx, _) = ab_grammar();
        let dir = work_dir("finished");
        let mut queue = Queue::new(&dir).unwrap();

        queue
            .add(
                some_tree(&ctx, 1),
                bits(&[1, 0]),
                ExitReason::Ok,
                &ctx,
                Duration::ZERO,
            )
            .unwrap();

        let item = queue.pop();
        assert_eq!(queue.num_indexed_bits(), 0);

        queue.finished(item).unwrap();
        assert_eq!(queue.num_processed(), 1);
        assert_eq!(queue.num_indexed_bits(), 1);

        queue.new_round();
        assert_eq!(queue.num_pending(), 1);
        assert_eq!(queue.num_processed(), 0);

        // index soundness: the only posting list points at the only item
        let item = queue.pop();
        assert_eq!(item.id, 0);
        assert_eq!(queue.num_indexed_bits(), 0);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn finished_drops_items_with_retired_bits() {
        let (ctx, _) = ab_grammar();
        let dir = work_dir("retire");
        let mut queue = Queue::new(&dir).unwrap();

        queue
            .add(
                some_tree(&ctx, 1),
                bits(&[1, 0]),
                ExitReason::Ok,
                &ctx,
                Duration::ZERO,
            )
            .unwrap();
        queue
            .add(
                some_tree(&ctx, 2),
                bits(&[1, 1]),
                ExitReason::Ok,
                &ctx,
                Duration::ZERO,
            )
            .unwrap();

        // popping id 1 leaves bit 0 owned by id 0 only
        let newer = queue.pop();
        let older = queue.pop();
        assert_eq!(queue.num_indexed_bits(), 0);

        // the newer item still owns fresh bit 1; the older one covers
        // nothing new once re-registered after it
        queue.finished(newer).unwrap();
        queue.finished(older).unwrap();
        assert_eq!(queue.num_processed(), 1);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
