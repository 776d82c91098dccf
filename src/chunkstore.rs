//! Donor subtrees for splicing, indexed by the rule at their root.

use std::collections::{HashMap, HashSet};

use libafl::state::HasRand;
use libafl_bolts::rands::Rand;

use crate::grammar::rule::RuleId;
use crate::grammar::Context;
use crate::hash::sha1_hex;
use crate::tree::{NodeId, Tree, TreeLike};

pub const DEFAULT_CHUNKS_PER_RULE: usize = 512;

pub struct ChunkStore {
    trees: Vec<Tree>,
    rule_to_chunks: HashMap<RuleId, Vec<(usize, NodeId)>>,
    seen_outputs: HashSet<String>,
    max_chunks_per_rule: usize,
}

impl ChunkStore {
    #[must_use]
    pub fn new(max_chunks_per_rule: usize) -> Self {
        Self {
            trees: Vec::new(),
            rule_to_chunks: HashMap::new(),
            seen_outputs: HashSet::new(),
            max_chunks_per_rule,
        }
    }

    /// Index every subtree of `tree` by its root rule. Trees whose terminal
    /// string was recorded before are dropped.
    pub fn record(&mut self, tree: Tree, ctx: &Context) {
        let digest = sha1_hex(&tree.unparse(ctx));
        if !self.seen_outputs.insert(digest) {
            return;
        }

        let tree_index = self.trees.len();
        for i in 0..tree.size() {
            let n = NodeId::new(i);
            let chunks = self.rule_to_chunks.entry(tree.get_rule_id(n)).or_default();
            if chunks.len() < self.max_chunks_per_rule {
                chunks.push((tree_index, n));
            }
        }
        self.trees.push(tree);
    }

    /// A uniformly chosen recorded subtree whose root rule is `rule`, if any.
    pub fn get_alternative_to<S: HasRand>(
        &self,
        state: &mut S,
        rule: RuleId,
    ) -> Option<(&Tree, NodeId)> {
        let chunks = self.rule_to_chunks.get(&rule)?;
        if chunks.is_empty() {
            return None;
        }
        let (tree_index, node) = *state.rand_mut().choose(chunks);
        Some((&self.trees[tree_index], node))
    }

    #[must_use]
    pub fn number_of_trees(&self) -> usize {
        self.trees.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{ChunkStore, DEFAULT_CHUNKS_PER_RULE};
    use crate::grammar::tests::ab_grammar;
    use crate::state::FuzzState;
    use crate::tree::{Tree, TreeLike};

    #[test]
    fn records_and_serves_chunks() {
        let (ctx, s) = ab_grammar();
        let mut state = FuzzState::with_seed(9);
        let mut store = ChunkStore::new(DEFAULT_CHUNKS_PER_RULE);

        let mut tree = Tree::default();
        tree.generate_from_nt(&mut state, s, 5, &ctx);
        let rule = ctx.rules_for_nt(s)[1];
        store.record(tree.clone(), &ctx);
        // same terminal string is deduplicated
        store.record(tree, &ctx);
        assert_eq!(store.number_of_trees(), 1);

        let (donor, node) = store.get_alternative_to(&mut state, rule).unwrap();
        assert_eq!(donor.get_rule_id(node), rule);
    }

    #[test]
    fn missing_rule_yields_none() {
        let (ctx, s) = ab_grammar();
        let mut state = FuzzState::with_seed(9);
        let store = ChunkStore::new(DEFAULT_CHUNKS_PER_RULE);
        assert!(store
            .get_alternative_to(&mut state, ctx.rules_for_nt(s)[0])
            .is_none());
    }
}
