//! Grammar context: interned nonterminals, production rules, precomputed
//! minimum expansion lengths and the sampling queries used by generation.

pub mod parser;
pub mod rule;

use std::collections::HashMap;

use libafl::state::HasRand;
use libafl_bolts::{rands::Rand, Error};

use crate::grammar::rule::{NTermId, Rule, RuleId, RuleIdOrCustom};

/// Read-only after [`Context::initialize`]; all lengths are counted in tree
/// nodes, not bytes.
#[derive(Clone, Debug, Default)]
pub struct Context {
    rules: Vec<Rule>,
    nt_names: Vec<String>,
    names_to_nt: HashMap<String, NTermId>,
    nts_to_rules: HashMap<NTermId, Vec<RuleId>>,
    rules_to_min_size: Vec<usize>,
    nts_to_min_size: HashMap<NTermId, usize>,
    max_len: usize,
    ready: bool,
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `name`, allocating a fresh id on first sight.
    pub fn intern_nt(&mut self, name: &str) -> NTermId {
        debug_assert!(!self.ready);
        if let Some(id) = self.names_to_nt.get(name) {
            return *id;
        }
        let id = NTermId::new(self.nt_names.len());
        self.nt_names.push(name.to_owned());
        self.names_to_nt.insert(name.to_owned(), id);
        self.nts_to_rules.entry(id).or_default();
        id
    }

    #[must_use]
    pub fn nt_id(&self, name: &str) -> Option<NTermId> {
        self.names_to_nt.get(name).copied()
    }

    #[must_use]
    pub fn nt_name(&self, nt: NTermId) -> &str {
        &self.nt_names[nt.id()]
    }

    pub fn add_rule(&mut self, rule: Rule) -> RuleId {
        debug_assert!(!self.ready);
        let id = RuleId::new(self.rules.len());
        self.nts_to_rules
            .entry(rule.nonterm())
            .or_default()
            .push(id);
        self.rules.push(rule);
        id
    }

    /// Run the minimum-length fixpoint and freeze the context.
    ///
    /// Fails when a rule references a nonterminal that has no productions,
    /// or when some nonterminal cannot produce a finite expansion (the
    /// fixpoint leaves it without a minimum).
    pub fn initialize(&mut self, max_len: usize) -> Result<(), Error> {
        for rule in &self.rules {
            for nt in rule.nonterms() {
                if self.nts_to_rules[&nt].is_empty() {
                    return Err(Error::illegal_argument(format!(
                        "nonterminal <{}> is referenced but never defined",
                        self.nt_name(nt)
                    )));
                }
            }
        }

        let mut rule_min: Vec<Option<usize>> = vec![None; self.rules.len()];
        let mut nt_min: HashMap<NTermId, usize> = HashMap::new();
        loop {
            let mut changed = false;
            for (i, rule) in self.rules.iter().enumerate() {
                let mut candidate = Some(1usize);
                for nt in rule.nonterms() {
                    candidate = match (candidate, nt_min.get(&nt)) {
                        (Some(c), Some(m)) => Some(c + m),
                        _ => None,
                    };
                }
                let Some(candidate) = candidate else { continue };
                if rule_min[i].map_or(true, |m| candidate < m) {
                    rule_min[i] = Some(candidate);
                    changed = true;
                }
                let nt = rule.nonterm();
                if nt_min.get(&nt).map_or(true, |m| candidate < *m) {
                    nt_min.insert(nt, candidate);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        for (nt, rules) in &self.nts_to_rules {
            if !rules.is_empty() && !nt_min.contains_key(nt) {
                return Err(Error::illegal_argument(format!(
                    "nonterminal <{}> has no finite expansion",
                    self.nt_name(*nt)
                )));
            }
        }

        self.rules_to_min_size = rule_min.into_iter().map(Option::unwrap).collect();
        self.nts_to_min_size = nt_min;
        self.max_len = max_len;
        self.ready = true;
        Ok(())
    }

    #[must_use]
    pub fn get_rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.id()]
    }

    /// Nonterminal on the left-hand side of the rule behind `roc`.
    #[must_use]
    pub fn get_nt(&self, roc: &RuleIdOrCustom) -> NTermId {
        self.get_rule(roc.rule_id()).nonterm()
    }

    #[must_use]
    pub fn rules_for_nt(&self, nt: NTermId) -> &[RuleId] {
        &self.nts_to_rules[&nt]
    }

    #[must_use]
    pub fn nt_has_multiple_alternatives(&self, nt: NTermId) -> bool {
        self.rules_for_nt(nt).len() > 1
    }

    #[must_use]
    pub fn min_len_for_nt(&self, nt: NTermId) -> usize {
        debug_assert!(self.ready);
        self.nts_to_min_size[&nt]
    }

    #[must_use]
    pub fn min_len_for_rule(&self, id: RuleId) -> usize {
        debug_assert!(self.ready);
        self.rules_to_min_size[id.id()]
    }

    #[must_use]
    pub fn number_of_rules(&self) -> usize {
        self.rules.len()
    }

    pub fn random_len_for_nt<S: HasRand>(&self, state: &mut S, nt: NTermId) -> usize {
        let min = self.min_len_for_nt(nt);
        let max = self.max_len.max(min);
        state.rand_mut().between(min as u64, max as u64) as usize
    }

    pub fn random_len_for_rule<S: HasRand>(&self, state: &mut S, id: RuleId) -> usize {
        let min = self.min_len_for_rule(id);
        let max = self.max_len.max(min);
        state.rand_mut().between(min as u64, max as u64) as usize
    }

    /// Uniform pick among the alternatives of `nt` that fit inside `budget`.
    ///
    /// A budget below the nonterminal's minimum starves the choice: the
    /// smallest alternative is used instead and a debug note is recorded.
    pub fn random_rule_for_nt<S: HasRand>(
        &self,
        state: &mut S,
        nt: NTermId,
        budget: usize,
    ) -> RuleId {
        let rules = self.rules_for_nt(nt);
        let candidates: Vec<RuleId> = rules
            .iter()
            .copied()
            .filter(|r| self.min_len_for_rule(*r) <= budget)
            .collect();
        if candidates.is_empty() {
            log::debug!(
                "budget {} starves <{}> (minimum {}), using smallest expansion",
                budget,
                self.nt_name(nt),
                self.min_len_for_nt(nt)
            );
            return *rules
                .iter()
                .min_by_key(|r| self.min_len_for_rule(**r))
                .expect("nonterminal without rules");
        }
        *state.rand_mut().choose(&candidates)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::Context;
    use crate::grammar::rule::{NTermId, PlainRule, Rule, RuleChild};

    /// `S -> aSb | ab`
    pub(crate) fn ab_grammar() -> (Context, NTermId) {
        let mut ctx = Context::new();
        let s = ctx.intern_nt("S");
        ctx.add_rule(Rule::Plain(PlainRule {
            nonterm: s,
            children: vec![
                RuleChild::Term(b"a".to_vec()),
                RuleChild::NTerm(s),
                RuleChild::Term(b"b".to_vec()),
            ],
        }));
        ctx.add_rule(Rule::Plain(PlainRule {
            nonterm: s,
            children: vec![RuleChild::Term(b"ab".to_vec())],
        }));
        ctx.initialize(16).unwrap();
        (ctx, s)
    }

    #[test]
    fn min_len_fixpoint() {
        let (ctx, s) = ab_grammar();
        assert_eq!(ctx.min_len_for_nt(s), 1);
        let rules = ctx.rules_for_nt(s);
        assert_eq!(ctx.min_len_for_rule(rules[0]), 2);
        assert_eq!(ctx.min_len_for_rule(rules[1]), 1);
        assert!(ctx.nt_has_multiple_alternatives(s));
    }

    #[test]
    fn unsatisfiable_nonterminal_is_rejected() {
        let mut ctx = Context::new();
        let s = ctx.intern_nt("S");
        ctx.add_rule(Rule::Plain(PlainRule {
            nonterm: s,
            children: vec![RuleChild::NTerm(s)],
        }));
        assert!(ctx.initialize(16).is_err());
    }

    #[test]
    fn undefined_reference_is_rejected() {
        let mut ctx = Context::new();
        let s = ctx.intern_nt("S");
        let t = ctx.intern_nt("T");
        ctx.add_rule(Rule::Plain(PlainRule {
            nonterm: s,
            children: vec![RuleChild::NTerm(t)],
        }));
        assert!(ctx.initialize(16).is_err());
    }
}
