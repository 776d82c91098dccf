//! Structure-preserving tree mutations and minimization.
//!
//! Every mutation proposes replacement views ([`TreeMutation`]) instead of
//! copies. Minimizers call back through an accepting tester (keep the
//! proposal iff the fresh coverage bits survive); exploratory mutations call
//! back through an observing tester that decides internally what to keep.

use std::collections::HashSet;

use libafl::state::HasRand;
use libafl_bolts::{rands::Rand, Error};

use crate::chunkstore::ChunkStore;
use crate::grammar::Context;
use crate::tree::recursion::RecursionInfo;
use crate::tree::{NodeId, Tree, TreeLike, TreeMutation};

pub struct Mutator {
    scratchpad: Tree,
}

impl Mutator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            scratchpad: Tree::default(),
        }
    }

    /// Subtree minimization: walk `[start_index, end_index)` in preorder and
    /// shrink every node to its grammar minimum that the tester accepts.
    ///
    /// Returns `true` once the whole tree has been processed, `false` when
    /// `end_index` was hit first (the caller resumes from there).
    pub fn minimize_tree<S, F>(
        &mut self,
        state: &mut S,
        tree: &mut Tree,
        bits: &HashSet<usize>,
        ctx: &Context,
        start_index: usize,
        end_index: usize,
        tester: &mut F,
    ) -> Result<bool, Error>
    where
        S: HasRand,
        F: FnMut(&TreeMutation, &HashSet<usize>, &Context) -> Result<bool, Error>,
    {
        let mut i = start_index;
        while i < tree.size() {
            let n = NodeId::new(i);
            let nt = ctx.get_nt(tree.get_rule_or_custom(n));

            if tree.subtree_size(n) > ctx.min_len_for_nt(nt) {
                self.scratchpad
                    .generate_from_nt(state, nt, ctx.min_len_for_nt(nt), ctx);
                if let Some(t) = Self::test_and_convert(
                    tree,
                    n,
                    &self.scratchpad,
                    NodeId::new(0),
                    ctx,
                    bits,
                    tester,
                )? {
                    *tree = t;
                }
            }

            i += 1;
            if i == end_index {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Recursive minimization: collapse one level of recursion by replacing
    /// an ancestor's subtree with the nested same-nonterminal subtree.
    pub fn minimize_rec<S, F>(
        &mut self,
        _state: &mut S,
        tree: &mut Tree,
        bits: &HashSet<usize>,
        ctx: &Context,
        start_index: usize,
        end_index: usize,
        tester: &mut F,
    ) -> Result<bool, Error>
    where
        S: HasRand,
        F: FnMut(&TreeMutation, &HashSet<usize>, &Context) -> Result<bool, Error>,
    {
        let mut i = start_index;
        while i < tree.size() {
            let n = NodeId::new(i);

            if let Some(parent) = Self::find_parent_with_nt(tree, n, ctx) {
                if let Some(t) = Self::test_and_convert(tree, parent, tree, n, ctx, bits, tester)? {
                    *tree = t;
                    i = parent.id();
                }
            }

            i += 1;
            if i == end_index {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Rules mutation: for every node in the range, propose a fresh subtree
    /// for each alternative rule of its nonterminal.
    ///
    /// The tree is never mutated in place; each proposal is independent.
    pub fn mut_rules<S, F>(
        &mut self,
        state: &mut S,
        tree: &Tree,
        ctx: &Context,
        start_index: usize,
        end_index: usize,
        tester: &mut F,
    ) -> Result<bool, Error>
    where
        S: HasRand,
        F: FnMut(&TreeMutation, &Context) -> Result<(), Error>,
    {
        for i in start_index..end_index {
            if i == tree.size() {
                return Ok(true);
            }

            let n = NodeId::new(i);
            let old_rule = tree.get_rule_id(n);
            let nt = ctx.get_nt(tree.get_rule_or_custom(n));

            for &new_rule in ctx.rules_for_nt(nt) {
                if new_rule != old_rule {
                    let budget = ctx.random_len_for_rule(state, new_rule);
                    self.scratchpad
                        .generate_from_rule(state, new_rule, budget, ctx);
                    let repl = tree.mutate_replace_from_tree(n, &self.scratchpad, NodeId::new(0));
                    tester(&repl, ctx)?;
                }
            }
        }
        Ok(false)
    }

    /// Random mutation: regenerate one random node, if its nonterminal has
    /// alternatives.
    pub fn mut_random<S, F>(
        &mut self,
        state: &mut S,
        tree: &Tree,
        ctx: &Context,
        tester: &mut F,
    ) -> Result<(), Error>
    where
        S: HasRand,
        F: FnMut(&TreeMutation, &Context) -> Result<(), Error>,
    {
        let n = NodeId::new(state.rand_mut().below(tree.size() as u64) as usize);
        let nt = ctx.get_nt(tree.get_rule_or_custom(n));

        if ctx.nt_has_multiple_alternatives(nt) {
            let budget = ctx.random_len_for_nt(state, nt);
            self.scratchpad.generate_from_nt(state, nt, budget, ctx);
            let repl = tree.mutate_replace_from_tree(n, &self.scratchpad, NodeId::new(0));
            tester(&repl, ctx)?;
        }
        Ok(())
    }

    /// Random recursive mutation: repeat a randomly chosen recursion
    /// 2^(1+k) times, k uniform in [1, 10].
    pub fn mut_random_recursion<S, F>(
        &mut self,
        state: &mut S,
        tree: &Tree,
        recursions: &[RecursionInfo],
        ctx: &Context,
        tester: &mut F,
    ) -> Result<(), Error>
    where
        S: HasRand,
        F: FnMut(&TreeMutation, &Context) -> Result<(), Error>,
    {
        if recursions.is_empty() {
            return Ok(());
        }

        let max_len_of_recursions = 2usize << state.rand_mut().between(1, 10);
        let info = state.rand_mut().choose(recursions);
        let (rec0, rec1) = info.get_random_pair(state);

        let total = tree.subtree_size(rec0) - tree.subtree_size(rec1);
        let reps = max_len_of_recursions / total;

        let recursion_tree = build_recursion_tree(tree, rec0, rec1, reps);
        let repl = tree.mutate_replace_from_tree(rec1, &recursion_tree, NodeId::new(0));
        tester(&repl, ctx)
    }

    /// Splicing mutation: replace one random node with a recorded chunk of
    /// the same rule, if the store has one.
    pub fn mut_splice<S, F>(
        &mut self,
        state: &mut S,
        tree: &Tree,
        ctx: &Context,
        chunkstore: &ChunkStore,
        tester: &mut F,
    ) -> Result<(), Error>
    where
        S: HasRand,
        F: FnMut(&TreeMutation, &Context) -> Result<(), Error>,
    {
        let n = NodeId::new(state.rand_mut().below(tree.size() as u64) as usize);

        if let Some((donor, donor_node)) =
            chunkstore.get_alternative_to(state, tree.get_rule_id(n))
        {
            let repl = tree.mutate_replace_from_tree(n, donor, donor_node);
            tester(&repl, ctx)?;
        }
        Ok(())
    }

    /// Nearest ancestor of `node` sharing its nonterminal.
    fn find_parent_with_nt(tree: &Tree, node: NodeId, ctx: &Context) -> Option<NodeId> {
        let nt = ctx.get_nt(tree.get_rule_or_custom(node));
        let mut cur = node;
        while let Some(parent) = tree.get_parent(cur) {
            if ctx.get_nt(tree.get_rule_or_custom(parent)) == nt {
                return Some(parent);
            }
            cur = parent;
        }
        None
    }

    /// Form the replacement view, consult the tester, materialize on accept.
    fn test_and_convert<F>(
        tree_a: &Tree,
        n_a: NodeId,
        tree_b: &Tree,
        n_b: NodeId,
        ctx: &Context,
        fresh_bits: &HashSet<usize>,
        tester: &mut F,
    ) -> Result<Option<Tree>, Error>
    where
        F: FnMut(&TreeMutation, &HashSet<usize>, &Context) -> Result<bool, Error>,
    {
        let repl = tree_a.mutate_replace_from_tree(n_a, tree_b, n_b);
        if tester(&repl, fresh_bits, ctx)? {
            return Ok(Some(repl.to_tree(ctx)));
        }
        Ok(None)
    }
}

impl Default for Mutator {
    fn default() -> Self {
        Self::new()
    }
}

/// Unrolled recursion: `reps` copies of the opening region, the inner
/// subtree, then `reps` copies of the closing region, with subtree sizes
/// adjusted so that earlier copies account for everything nested below them.
pub(crate) fn build_recursion_tree(tree: &Tree, rec0: NodeId, rec1: NodeId, reps: usize) -> Tree {
    let pre = rec1.id() - rec0.id();
    let total = tree.subtree_size(rec0) - tree.subtree_size(rec1);
    let post = total - pre;
    let postfix = tree.subtree_size(rec1);

    let mut rules = Vec::with_capacity(reps * pre + postfix + reps * post);
    let mut sizes = Vec::with_capacity(reps * pre + postfix + reps * post);

    for i in 0..reps * pre {
        let src = rec0.id() + i % pre;
        rules.push(tree.get_rule_or_custom(NodeId::new(src)).clone());
        sizes.push(tree.sizes()[src]);
    }
    for i in 0..postfix {
        let src = rec1.id() + i;
        rules.push(tree.get_rule_or_custom(NodeId::new(src)).clone());
        sizes.push(tree.sizes()[src]);
    }
    for i in 0..reps * pre {
        if sizes[i] >= pre {
            sizes[i] += (reps - i / pre - 1) * total;
        }
    }
    for i in 0..reps * post {
        let src = rec1.id() + postfix + i % post;
        rules.push(tree.get_rule_or_custom(NodeId::new(src)).clone());
        sizes.push(tree.sizes()[src]);
    }

    Tree::from_rules_and_sizes(rules, sizes)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{build_recursion_tree, Mutator};
    use crate::chunkstore::{ChunkStore, DEFAULT_CHUNKS_PER_RULE};
    use crate::grammar::tests::ab_grammar;
    use crate::grammar::Context;
    use crate::state::FuzzState;
    use crate::tree::{NodeId, Tree, TreeLike, TreeMutation};

    fn nested_tree(ctx: &Context, s: crate::grammar::rule::NTermId, depth: usize) -> Tree {
        let mut state = FuzzState::with_seed(1);
        let mut tree = Tree::default();
        loop {
            tree.generate_from_nt(&mut state, s, depth, ctx);
            if tree.size() == depth {
                return tree;
            }
        }
    }

    #[test]
    fn minimize_tree_reaches_smallest_accepted() {
        let (ctx, s) = ab_grammar();
        let mut state = FuzzState::with_seed(2);
        // aaabbb
        let mut tree = nested_tree(&ctx, s, 3);
        assert_eq!(tree.unparse(&ctx), b"aaabbb");

        let bits = HashSet::new();
        let mut accept_nonempty = |repl: &TreeMutation, _: &HashSet<usize>, ctx: &Context| {
            Ok(!repl.unparse(ctx).is_empty())
        };
        let mut mutator = Mutator::new();
        let done = mutator
            .minimize_tree(
                &mut state,
                &mut tree,
                &bits,
                &ctx,
                0,
                usize::MAX,
                &mut accept_nonempty,
            )
            .unwrap();

        assert!(done);
        assert_eq!(tree.unparse(&ctx), b"ab");
        assert_eq!(tree.size(), ctx.min_len_for_nt(s));
    }

    #[test]
    fn minimize_tree_respects_rejections() {
        let (ctx, s) = ab_grammar();
        let mut state = FuzzState::with_seed(2);
        let mut tree = nested_tree(&ctx, s, 3);

        let bits = HashSet::new();
        let mut reject_all =
            |_: &TreeMutation, _: &HashSet<usize>, _: &Context| Ok(false);
        let mut mutator = Mutator::new();
        mutator
            .minimize_tree(&mut state, &mut tree, &bits, &ctx, 0, usize::MAX, &mut reject_all)
            .unwrap();

        assert_eq!(tree.unparse(&ctx), b"aaabbb");
    }

    #[test]
    fn minimize_rec_collapses_recursion() {
        let (ctx, s) = ab_grammar();
        let mut state = FuzzState::with_seed(2);
        let mut tree = nested_tree(&ctx, s, 4);
        assert_eq!(tree.unparse(&ctx), b"aaaabbbb");

        let bits = HashSet::new();
        let mut accept_all = |_: &TreeMutation, _: &HashSet<usize>, _: &Context| Ok(true);
        let mut mutator = Mutator::new();
        let done = mutator
            .minimize_rec(&mut state, &mut tree, &bits, &ctx, 0, usize::MAX, &mut accept_all)
            .unwrap();

        assert!(done);
        assert_eq!(tree.unparse(&ctx), b"ab");
    }

    #[test]
    fn mut_rules_proposes_each_alternative_once() {
        let (ctx, s) = ab_grammar();
        let mut state = FuzzState::with_seed(3);
        let tree = nested_tree(&ctx, s, 2);

        let mut proposals = Vec::new();
        let mut collect = |repl: &TreeMutation, ctx: &Context| {
            proposals.push(repl.unparse(ctx));
            Ok(())
        };
        let mut mutator = Mutator::new();
        let done = mutator
            .mut_rules(&mut state, &tree, &ctx, 0, tree.size() + 1, &mut collect)
            .unwrap();

        assert!(done);
        // each of the two nodes has exactly one alternative rule
        assert_eq!(proposals.len(), 2);
    }

    #[test]
    fn recursion_tree_has_expected_shape() {
        let (ctx, s) = ab_grammar();
        // a(ab)b — recursion pair (0, 1), pre = 1, total = 1, postfix = 1
        let tree = nested_tree(&ctx, s, 2);

        let unrolled = build_recursion_tree(&tree, NodeId::new(0), NodeId::new(1), 4);
        // reps * pre + postfix + reps * post
        assert_eq!(unrolled.size(), 4 + 1);
        assert_eq!(unrolled.sizes(), &[5, 4, 3, 2, 1]);
        assert_eq!(unrolled.unparse(&ctx), b"aaaaabbbbb");

        let repl = tree.mutate_replace_from_tree(NodeId::new(1), &unrolled, NodeId::new(0));
        let out = repl.to_tree(&ctx);
        assert_eq!(out.unparse(&ctx), b"aaaaaabbbbbb");
    }

    #[test]
    fn splice_replaces_with_recorded_chunk() {
        let (ctx, s) = ab_grammar();
        let mut state = FuzzState::with_seed(8);

        let mut store = ChunkStore::new(DEFAULT_CHUNKS_PER_RULE);
        store.record(nested_tree(&ctx, s, 3), &ctx);

        let tree = nested_tree(&ctx, s, 1);
        let mut results = Vec::new();
        let mut collect = |repl: &TreeMutation, ctx: &Context| {
            results.push(repl.unparse(ctx));
            Ok(())
        };
        let mut mutator = Mutator::new();
        mutator
            .mut_splice(&mut state, &tree, &ctx, &store, &mut collect)
            .unwrap();

        // the host's only node carries the leaf rule, so the single donor
        // chunk with that root is the aaabbb tree's own leaf
        assert_eq!(results, vec![b"ab".to_vec()]);
    }
}
