//! Recursion pairs: positions where a nonterminal reappears below itself.

use libafl::state::HasRand;
use libafl_bolts::rands::Rand;

use crate::grammar::rule::NTermId;
use crate::grammar::Context;
use crate::tree::{NodeId, Tree, TreeLike};

/// All `(ancestor, descendant)` pairs of one nonterminal within one tree.
#[derive(Clone, Debug)]
pub struct RecursionInfo {
    pairs: Vec<(NodeId, NodeId)>,
    nt: NTermId,
}

impl RecursionInfo {
    /// Collect the recursion pairs of `nt` in `tree`, or none if it never
    /// recurses there.
    #[must_use]
    pub fn new(tree: &Tree, nt: NTermId, ctx: &Context) -> Option<Self> {
        let mut pairs = Vec::new();
        for i in 0..tree.size() {
            let n = NodeId::new(i);
            if ctx.get_nt(tree.get_rule_or_custom(n)) != nt {
                continue;
            }
            let mut cur = n;
            while let Some(parent) = tree.get_parent(cur) {
                if ctx.get_nt(tree.get_rule_or_custom(parent)) == nt {
                    pairs.push((parent, n));
                }
                cur = parent;
            }
        }
        (!pairs.is_empty()).then_some(Self { pairs, nt })
    }

    /// One pair, uniformly.
    pub fn get_random_pair<S: HasRand>(&self, state: &mut S) -> (NodeId, NodeId) {
        *state.rand_mut().choose(&self.pairs)
    }

    #[must_use]
    pub fn nonterm(&self) -> NTermId {
        self.nt
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::grammar::tests::ab_grammar;
    use crate::state::FuzzState;
    use crate::tree::recursion::RecursionInfo;
    use crate::tree::{Tree, TreeLike};

    #[test]
    fn finds_all_ancestor_pairs() {
        let (ctx, s) = ab_grammar();
        let mut state = FuzzState::with_seed(5);

        // force a(a(ab)b)b: three nested S nodes
        let mut tree = Tree::default();
        loop {
            tree.generate_from_nt(&mut state, s, 3, &ctx);
            if tree.size() == 3 {
                break;
            }
        }

        let info = RecursionInfo::new(&tree, s, &ctx).unwrap();
        // (0,1), (0,2), (1,2)
        assert_eq!(info.len(), 3);

        let recursions = tree.calc_recursions(&ctx).unwrap();
        assert_eq!(recursions.len(), 1);
    }

    #[test]
    fn flat_tree_has_no_recursion() {
        let (ctx, s) = ab_grammar();
        let mut state = FuzzState::with_seed(5);
        let mut tree = Tree::default();
        tree.generate_from_nt(&mut state, s, 1, &ctx);
        assert!(RecursionInfo::new(&tree, s, &ctx).is_none());
        assert!(tree.calc_recursions(&ctx).is_none());
    }
}
