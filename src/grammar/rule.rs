//! Production rules and the identifiers used to refer to them.

use libafl::state::HasRand;
use libafl_bolts::rands::Rand;
use serde_derive::{Deserialize, Serialize};

/// Dense index of a nonterminal inside a [`Context`](crate::grammar::Context).
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NTermId(usize);

impl NTermId {
    #[must_use]
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn id(self) -> usize {
        self.0
    }
}

/// Dense index of a production rule inside a [`Context`](crate::grammar::Context).
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RuleId(usize);

impl RuleId {
    #[must_use]
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn id(self) -> usize {
        self.0
    }
}

/// The rule applied at a tree node.
///
/// Sampled-payload rules carry the concrete bytes drawn at generation time;
/// unparsing emits them verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleIdOrCustom {
    Rule(RuleId),
    Custom(RuleId, Vec<u8>),
}

impl RuleIdOrCustom {
    #[must_use]
    pub fn rule_id(&self) -> RuleId {
        match self {
            Self::Rule(id) | Self::Custom(id, _) => *id,
        }
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        match self {
            Self::Rule(_) => &[],
            Self::Custom(_, data) => data,
        }
    }
}

/// One symbol on the right-hand side of a plain rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleChild {
    /// A terminal byte string, emitted verbatim.
    Term(Vec<u8>),
    /// A reference to another nonterminal.
    NTerm(NTermId),
}

/// A production rule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Rule {
    Plain(PlainRule),
    Bytes(BytesRule),
}

/// An ordinary rule: a sequence of terminals and nonterminal references.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlainRule {
    pub nonterm: NTermId,
    pub children: Vec<RuleChild>,
}

/// A rule whose expansion is sampled at generation time: `reps` bytes drawn
/// from `chars`, with `reps` uniform in `[min_reps, max_reps]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BytesRule {
    pub nonterm: NTermId,
    pub chars: Vec<u8>,
    pub min_reps: usize,
    pub max_reps: usize,
}

impl BytesRule {
    pub fn sample<S: HasRand>(&self, state: &mut S) -> Vec<u8> {
        let reps = state
            .rand_mut()
            .between(self.min_reps as u64, self.max_reps as u64) as usize;
        (0..reps)
            .map(|_| *state.rand_mut().choose(&self.chars))
            .collect()
    }
}

impl Rule {
    #[must_use]
    pub fn nonterm(&self) -> NTermId {
        match self {
            Self::Plain(r) => r.nonterm,
            Self::Bytes(r) => r.nonterm,
        }
    }

    /// Nonterminal references on the right-hand side, left to right.
    pub fn nonterms(&self) -> impl Iterator<Item = NTermId> + '_ {
        let children: &[RuleChild] = match self {
            Self::Plain(r) => &r.children,
            Self::Bytes(_) => &[],
        };
        children.iter().filter_map(|c| match c {
            RuleChild::NTerm(nt) => Some(*nt),
            RuleChild::Term(_) => None,
        })
    }

    #[must_use]
    pub fn number_of_nonterms(&self) -> usize {
        self.nonterms().count()
    }
}
