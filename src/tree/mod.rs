//! Preorder-flat derivation trees.
//!
//! A tree is three parallel sequences: the rule applied at each node, the
//! preorder subtree size rooted there, and the parent link. Children of node
//! `i` occupy the contiguous range `[i + 1, i + sizes[i])`, which makes
//! subtree extraction a slice operation and structural replacement a
//! concatenation of three slices.

pub mod recursion;

use libafl::state::HasRand;
use libafl_bolts::rands::Rand;
use serde_derive::{Deserialize, Serialize};

use crate::grammar::rule::{NTermId, Rule, RuleChild, RuleId, RuleIdOrCustom};
use crate::grammar::Context;
use crate::tree::recursion::RecursionInfo;

/// Index into a tree's preorder array; node 0 is the root.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NodeId(usize);

impl NodeId {
    #[must_use]
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn id(self) -> usize {
        self.0
    }
}

/// Anything that exposes a preorder rule sequence: owned trees and lazy
/// replacement views alike.
pub trait TreeLike {
    fn size(&self) -> usize;
    fn get_rule_or_custom(&self, n: NodeId) -> &RuleIdOrCustom;

    fn get_rule_id(&self, n: NodeId) -> RuleId {
        self.get_rule_or_custom(n).rule_id()
    }

    fn get_rule<'c>(&self, n: NodeId, ctx: &'c Context) -> &'c Rule {
        ctx.get_rule(self.get_rule_id(n))
    }

    /// Emit the terminal string by preorder traversal. Pure in `(self, ctx)`.
    fn unparse_to(&self, ctx: &Context, out: &mut Vec<u8>)
    where
        Self: Sized,
    {
        unparse(self, ctx, out);
    }

    fn unparse(&self, ctx: &Context) -> Vec<u8>
    where
        Self: Sized,
    {
        let mut out = Vec::new();
        self.unparse_to(ctx, &mut out);
        out
    }

    /// Materialize into an owned [`Tree`], recomputing sizes and parents.
    fn to_tree(&self, ctx: &Context) -> Tree
    where
        Self: Sized,
    {
        let rules = (0..self.size())
            .map(|i| self.get_rule_or_custom(NodeId::new(i)).clone())
            .collect();
        Tree::from_rule_vec(rules, ctx)
    }
}

fn unparse<'c, T: TreeLike>(tree: &T, ctx: &'c Context, out: &mut Vec<u8>) {
    enum Step<'a> {
        Emit(&'a [u8]),
        Expand,
    }

    let mut next = 0usize;
    let mut stack: Vec<Step<'c>> = vec![Step::Expand];
    while let Some(step) = stack.pop() {
        match step {
            Step::Emit(data) => out.extend_from_slice(data),
            Step::Expand => {
                let roc = tree.get_rule_or_custom(NodeId::new(next));
                next += 1;
                match roc {
                    RuleIdOrCustom::Custom(_, data) => out.extend_from_slice(data),
                    RuleIdOrCustom::Rule(id) => match ctx.get_rule(*id) {
                        // a sampled-payload node without its payload emits nothing
                        Rule::Bytes(_) => {}
                        Rule::Plain(plain) => {
                            for child in plain.children.iter().rev() {
                                match child {
                                    RuleChild::Term(data) => stack.push(Step::Emit(data)),
                                    RuleChild::NTerm(_) => stack.push(Step::Expand),
                                }
                            }
                        }
                    },
                }
            }
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Tree {
    rules: Vec<RuleIdOrCustom>,
    sizes: Vec<usize>,
    paren: Vec<Option<NodeId>>,
}

impl TreeLike for Tree {
    fn size(&self) -> usize {
        self.rules.len()
    }

    fn get_rule_or_custom(&self, n: NodeId) -> &RuleIdOrCustom {
        &self.rules[n.id()]
    }
}

impl Tree {
    /// Rebuild a tree from a bare preorder rule sequence, deriving sizes and
    /// parent links from the grammar's arities.
    #[must_use]
    pub fn from_rule_vec(rules: Vec<RuleIdOrCustom>, ctx: &Context) -> Self {
        let len = rules.len();
        let mut sizes = vec![1usize; len];
        let mut paren = vec![None; len];

        // (node, nonterminal children still expected)
        let mut stack: Vec<(usize, usize)> = Vec::new();
        for (i, roc) in rules.iter().enumerate() {
            while matches!(stack.last(), Some((_, 0))) {
                stack.pop();
            }
            if let Some((p, remaining)) = stack.last_mut() {
                paren[i] = Some(NodeId::new(*p));
                *remaining -= 1;
            }
            let expected = match ctx.get_rule(roc.rule_id()) {
                Rule::Plain(plain) => plain
                    .children
                    .iter()
                    .filter(|c| matches!(c, RuleChild::NTerm(_)))
                    .count(),
                Rule::Bytes(_) => 0,
            };
            stack.push((i, expected));
        }
        for i in (0..len).rev() {
            if let Some(p) = paren[i] {
                sizes[p.id()] += sizes[i];
            }
        }

        Self {
            rules,
            sizes,
            paren,
        }
    }

    /// Build a tree from rules plus already-correct sizes, deriving parents
    /// from the preorder interval nesting.
    #[must_use]
    pub(crate) fn from_rules_and_sizes(rules: Vec<RuleIdOrCustom>, sizes: Vec<usize>) -> Self {
        debug_assert_eq!(rules.len(), sizes.len());
        let len = rules.len();
        let mut paren = vec![None; len];

        // (node, end of its subtree interval)
        let mut stack: Vec<(usize, usize)> = Vec::new();
        for i in 0..len {
            while matches!(stack.last(), Some(&(_, end)) if i >= end) {
                stack.pop();
            }
            if let Some(&(p, _)) = stack.last() {
                paren[i] = Some(NodeId::new(p));
            }
            stack.push((i, i + sizes[i]));
        }

        Self {
            rules,
            sizes,
            paren,
        }
    }

    #[must_use]
    pub fn subtree_size(&self, n: NodeId) -> usize {
        self.sizes[n.id()]
    }

    #[must_use]
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    #[must_use]
    pub fn get_parent(&self, n: NodeId) -> Option<NodeId> {
        self.paren[n.id()]
    }

    pub fn truncate(&mut self) {
        self.rules.clear();
        self.sizes.clear();
        self.paren.clear();
    }

    /// Lazy view of `self` with the subtree at `n` replaced by the subtree
    /// of `other` rooted at `other_node`.
    #[must_use]
    pub fn mutate_replace_from_tree<'a>(
        &'a self,
        n: NodeId,
        other: &'a Tree,
        other_node: NodeId,
    ) -> TreeMutation<'a> {
        let old_size = self.subtree_size(n);
        let new_size = other.subtree_size(other_node);
        TreeMutation {
            prefix: &self.rules[..n.id()],
            repl: &other.rules[other_node.id()..other_node.id() + new_size],
            postfix: &self.rules[n.id() + old_size..],
        }
    }

    /// Replace the contents with a fresh derivation of `nt`.
    ///
    /// The result never exceeds `budget` nodes unless the budget is below
    /// the nonterminal's minimum, in which case the minimum expansion is
    /// produced.
    pub fn generate_from_nt<S: HasRand>(
        &mut self,
        state: &mut S,
        nt: NTermId,
        budget: usize,
        ctx: &Context,
    ) {
        self.truncate();
        self.generate_nt_inner(state, nt, budget, None, ctx);
    }

    /// Replace the contents with a fresh derivation of `rule`.
    pub fn generate_from_rule<S: HasRand>(
        &mut self,
        state: &mut S,
        rule: RuleId,
        budget: usize,
        ctx: &Context,
    ) {
        self.truncate();
        self.generate_rule_inner(state, rule, budget, None, ctx);
    }

    fn generate_nt_inner<S: HasRand>(
        &mut self,
        state: &mut S,
        nt: NTermId,
        budget: usize,
        paren: Option<NodeId>,
        ctx: &Context,
    ) -> usize {
        let rule = ctx.random_rule_for_nt(state, nt, budget);
        self.generate_rule_inner(state, rule, budget, paren, ctx)
    }

    fn generate_rule_inner<S: HasRand>(
        &mut self,
        state: &mut S,
        rule: RuleId,
        budget: usize,
        paren: Option<NodeId>,
        ctx: &Context,
    ) -> usize {
        let node = self.rules.len();
        match ctx.get_rule(rule) {
            Rule::Bytes(bytes) => {
                let data = bytes.sample(state);
                self.rules.push(RuleIdOrCustom::Custom(rule, data));
                self.sizes.push(1);
                self.paren.push(paren);
                1
            }
            Rule::Plain(plain) => {
                self.rules.push(RuleIdOrCustom::Rule(rule));
                self.sizes.push(0);
                self.paren.push(paren);

                let min_total: usize = plain
                    .children
                    .iter()
                    .filter_map(|c| match c {
                        RuleChild::NTerm(nt) => Some(ctx.min_len_for_nt(*nt)),
                        RuleChild::Term(_) => None,
                    })
                    .sum();
                // spare budget beyond the guaranteed minimum, spread over the children
                let mut remaining = budget.saturating_sub(1 + min_total);

                let mut size = 1;
                for child in &plain.children {
                    if let RuleChild::NTerm(nt) = child {
                        let min = ctx.min_len_for_nt(*nt);
                        let extra = if remaining > 0 {
                            state.rand_mut().below(remaining as u64 + 1) as usize
                        } else {
                            0
                        };
                        let child_size = self.generate_nt_inner(
                            state,
                            *nt,
                            min + extra,
                            Some(NodeId::new(node)),
                            ctx,
                        );
                        remaining -= child_size.saturating_sub(min).min(remaining);
                        size += child_size;
                    }
                }
                self.sizes[node] = size;
                size
            }
        }
    }

    /// One [`RecursionInfo`] per nonterminal that recurses in this tree, or
    /// none when the tree has no recursion at all.
    #[must_use]
    pub fn calc_recursions(&self, ctx: &Context) -> Option<Vec<RecursionInfo>> {
        let mut seen = std::collections::HashSet::new();
        let mut infos = Vec::new();
        for i in 0..self.size() {
            let nt = ctx.get_nt(self.get_rule_or_custom(NodeId::new(i)));
            if seen.insert(nt) {
                if let Some(info) = RecursionInfo::new(self, nt, ctx) {
                    infos.push(info);
                }
            }
        }
        (!infos.is_empty()).then_some(infos)
    }
}

pub struct TreeMutation<'a> {
    pub prefix: &'a [RuleIdOrCustom],
    pub repl: &'a [RuleIdOrCustom],
    pub postfix: &'a [RuleIdOrCustom],
}

impl TreeLike for TreeMutation<'_> {
    fn size(&self) -> usize {
        self.prefix.len() + self.repl.len() + self.postfix.len()
    }

    fn get_rule_or_custom(&self, n: NodeId) -> &RuleIdOrCustom {
        let mut i = n.id();
        if i < self.prefix.len() {
            return &self.prefix[i];
        }
        i -= self.prefix.len();
        if i < self.repl.len() {
            return &self.repl[i];
        }
        &self.postfix[i - self.repl.len()]
    }
}

#[cfg(test)]
mod tests {
    use libafl::state::HasRand;
    use libafl_bolts::rands::Rand;

    use super::{NodeId, Tree, TreeLike};
    use crate::grammar::tests::ab_grammar;
    use crate::state::FuzzState;

    fn assert_size_invariant(tree: &Tree) {
        assert_eq!(tree.sizes()[0], tree.size());
        for i in 0..tree.size() {
            let mut children_sum = 0;
            for j in 0..tree.size() {
                if tree.get_parent(NodeId::new(j)) == Some(NodeId::new(i)) {
                    children_sum += tree.subtree_size(NodeId::new(j));
                }
            }
            assert_eq!(tree.subtree_size(NodeId::new(i)), 1 + children_sum);
        }
    }

    #[test]
    fn generation_respects_budget_and_invariants() {
        let (ctx, s) = ab_grammar();
        let mut state = FuzzState::with_seed(42);
        for _ in 0..64 {
            let budget = 1 + state.rand_mut().below(16) as usize;
            let mut tree = Tree::default();
            tree.generate_from_nt(&mut state, s, budget, &ctx);
            assert!(tree.size() <= budget.max(ctx.min_len_for_nt(s)));
            assert_size_invariant(&tree);
        }
    }

    #[test]
    fn unparse_is_deterministic_and_balanced() {
        let (ctx, s) = ab_grammar();
        let mut state = FuzzState::with_seed(7);
        let mut tree = Tree::default();
        tree.generate_from_nt(&mut state, s, 9, &ctx);

        let once = tree.unparse(&ctx);
        let twice = tree.unparse(&ctx);
        assert_eq!(once, twice);

        let n = once.iter().filter(|&&b| b == b'a').count();
        assert_eq!(once.len(), 2 * n);
        assert!(once[..n].iter().all(|&b| b == b'a'));
        assert!(once[n..].iter().all(|&b| b == b'b'));
    }

    #[test]
    fn from_rule_vec_round_trips() {
        let (ctx, s) = ab_grammar();
        let mut state = FuzzState::with_seed(3);
        let mut tree = Tree::default();
        tree.generate_from_nt(&mut state, s, 13, &ctx);

        let rebuilt = tree.to_tree(&ctx);
        assert_eq!(rebuilt.size(), tree.size());
        assert_eq!(rebuilt.sizes(), tree.sizes());
        assert_eq!(rebuilt.unparse(&ctx), tree.unparse(&ctx));
        assert_size_invariant(&rebuilt);
    }

    #[test]
    fn replacement_view_concatenates() {
        let (ctx, s) = ab_grammar();
        let mut state = FuzzState::with_seed(11);

        // host: a(ab)b, donor: ab
        let mut host = Tree::default();
        host.generate_from_nt(&mut state, s, 2, &ctx);
        while host.size() != 2 {
            host.generate_from_nt(&mut state, s, 2, &ctx);
        }
        let mut donor = Tree::default();
        donor.generate_from_nt(&mut state, s, 1, &ctx);
        assert_eq!(donor.size(), 1);

        let repl = host.mutate_replace_from_tree(NodeId::new(0), &donor, NodeId::new(0));
        assert_eq!(repl.size(), 1);
        let materialized = repl.to_tree(&ctx);
        assert_eq!(materialized.unparse(&ctx), b"ab");
        assert_size_invariant(&materialized);
    }

    #[test]
    fn serde_snapshot_round_trips() {
        let (ctx, s) = ab_grammar();
        let mut state = FuzzState::with_seed(23);
        let mut tree = Tree::default();
        tree.generate_from_nt(&mut state, s, 11, &ctx);

        let json = serde_json::to_string(&tree).unwrap();
        let restored: Tree = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.unparse(&ctx), tree.unparse(&ctx));
        assert_eq!(restored.sizes(), tree.sizes());
    }
}
