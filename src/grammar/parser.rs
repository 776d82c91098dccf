//! Front end turning a grammar description file into a [`Context`].

use std::fs;
use std::path::Path;

use libafl_bolts::Error;
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;

use crate::grammar::rule::{BytesRule, NTermId, PlainRule, Rule as GrammarRule, RuleChild};
use crate::grammar::Context;

#[derive(Parser)]
#[grammar = "grammar/dsl.pest"]
struct DslParser;

/// Load and initialize a grammar from the file at `path`.
pub fn load_grammar(path: &Path, max_len: usize) -> Result<Context, Error> {
    let text = fs::read_to_string(path).map_err(|e| {
        Error::illegal_argument(format!("unreadable grammar {}: {e}", path.display()))
    })?;
    parse_grammar(&text, max_len)
        .map_err(|e| Error::illegal_argument(format!("{}: {e}", path.display())))
}

/// Parse a grammar description and run [`Context::initialize`] on the result.
pub fn parse_grammar(text: &str, max_len: usize) -> Result<Context, Error> {
    let mut pairs = DslParser::parse(Rule::grammar, text)
        .map_err(|e| Error::illegal_argument(format!("grammar parse error: {e}")))?;

    let mut ctx = Context::new();
    let grammar = pairs.next().expect("grammar root");
    for rule_pair in grammar.into_inner() {
        if rule_pair.as_rule() != Rule::grammar_rule {
            continue;
        }
        let mut inner = rule_pair.into_inner();
        let name = inner.next().expect("rule name").as_str();
        let nt = ctx.intern_nt(name);
        let alternatives = inner.next().expect("rule alternatives");
        for alt in alternatives.into_inner() {
            build_alternative(&mut ctx, nt, alt)?;
        }
    }

    ctx.initialize(max_len)?;
    Ok(ctx)
}

fn build_alternative(ctx: &mut Context, nt: NTermId, alt: Pair<Rule>) -> Result<(), Error> {
    let symbols: Vec<Pair<Rule>> = alt
        .into_inner()
        .map(|s| s.into_inner().next().expect("symbol body"))
        .collect();

    if symbols.iter().any(|s| s.as_rule() == Rule::byte_class) {
        if symbols.len() != 1 {
            return Err(Error::illegal_argument(format!(
                "<{}>: a byte class must be the only symbol of its alternative",
                ctx.nt_name(nt)
            )));
        }
        let (chars, min_reps, max_reps) = parse_byte_class(symbols.into_iter().next().unwrap())?;
        ctx.add_rule(GrammarRule::Bytes(BytesRule {
            nonterm: nt,
            chars,
            min_reps,
            max_reps,
        }));
        return Ok(());
    }

    let mut children = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        match symbol.as_rule() {
            Rule::nonterminal => {
                let name = symbol.into_inner().next().expect("nonterminal name");
                children.push(RuleChild::NTerm(ctx.intern_nt(name.as_str())));
            }
            Rule::terminal => {
                let inner = symbol.into_inner().next().expect("terminal body");
                children.push(RuleChild::Term(unescape(inner.as_str())?));
            }
            other => unreachable!("unexpected symbol {other:?}"),
        }
    }
    ctx.add_rule(GrammarRule::Plain(PlainRule {
        nonterm: nt,
        children,
    }));
    Ok(())
}

fn parse_byte_class(pair: Pair<Rule>) -> Result<(Vec<u8>, usize, usize), Error> {
    let mut chars = Vec::new();
    let mut min_reps = 1usize;
    let mut max_reps = 1usize;

    for item in pair.into_inner() {
        match item.as_rule() {
            Rule::class_item => {
                let item = item.into_inner().next().expect("class item body");
                match item.as_rule() {
                    Rule::class_range => {
                        let mut ends = item.into_inner();
                        let lo = single_byte(ends.next().expect("range start").as_str())?;
                        let hi = single_byte(ends.next().expect("range end").as_str())?;
                        if lo > hi {
                            return Err(Error::illegal_argument(format!(
                                "empty byte range {}-{}",
                                lo as char, hi as char
                            )));
                        }
                        chars.extend(lo..=hi);
                    }
                    Rule::class_single => {
                        let c = item.into_inner().next().expect("class char");
                        chars.push(single_byte(c.as_str())?);
                    }
                    other => unreachable!("unexpected class item {other:?}"),
                }
            }
            Rule::repetition => {
                let mut numbers = item.into_inner();
                min_reps = numbers
                    .next()
                    .expect("repetition minimum")
                    .as_str()
                    .parse()
                    .map_err(|e| Error::illegal_argument(format!("bad repetition: {e}")))?;
                max_reps = match numbers.next() {
                    Some(n) => n
                        .as_str()
                        .parse()
                        .map_err(|e| Error::illegal_argument(format!("bad repetition: {e}")))?,
                    None => min_reps,
                };
            }
            other => unreachable!("unexpected byte class part {other:?}"),
        }
    }

    if chars.is_empty() {
        return Err(Error::illegal_argument("empty byte class"));
    }
    if max_reps < min_reps {
        return Err(Error::illegal_argument(format!(
            "byte class repetition {{{min_reps},{max_reps}}} is empty"
        )));
    }
    chars.sort_unstable();
    chars.dedup();
    Ok((chars, min_reps, max_reps))
}

fn single_byte(s: &str) -> Result<u8, Error> {
    let bytes = s.as_bytes();
    if bytes.len() != 1 {
        return Err(Error::illegal_argument(format!(
            "byte classes accept single-byte characters only, got {s:?}"
        )));
    }
    Ok(bytes[0])
}

fn unescape(s: &str) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(s.len());
    let mut bytes = s.bytes();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'"') => out.push(b'"'),
            Some(b'\\') => out.push(b'\\'),
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b't') => out.push(b'\t'),
            Some(b'0') => out.push(0),
            Some(b'x') => {
                let hex = [
                    bytes.next().ok_or_else(|| {
                        Error::illegal_argument("truncated \\x escape in terminal")
                    })?,
                    bytes.next().ok_or_else(|| {
                        Error::illegal_argument("truncated \\x escape in terminal")
                    })?,
                ];
                let hex = std::str::from_utf8(&hex)
                    .map_err(|_| Error::illegal_argument("bad \\x escape in terminal"))?;
                out.push(
                    u8::from_str_radix(hex, 16)
                        .map_err(|_| Error::illegal_argument("bad \\x escape in terminal"))?,
                );
            }
            other => {
                return Err(Error::illegal_argument(format!(
                    "unsupported escape in terminal: {other:?}"
                )))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::parse_grammar;
    use crate::state::FuzzState;
    use crate::tree::{Tree, TreeLike};

    #[test]
    fn parses_alternatives_and_accumulates_lhs() {
        let ctx = parse_grammar(
            "# toy grammar\nS ::= \"a\" <S> \"b\"\nS ::= \"ab\"\n",
            16,
        )
        .unwrap();
        let s = ctx.nt_id("S").unwrap();
        assert_eq!(ctx.rules_for_nt(s).len(), 2);
        assert_eq!(ctx.min_len_for_nt(s), 1);
    }

    #[test]
    fn inline_alternatives() {
        let ctx = parse_grammar("S ::= \"x\" | \"y\" <S>\n", 8).unwrap();
        let s = ctx.nt_id("S").unwrap();
        assert_eq!(ctx.rules_for_nt(s).len(), 2);
    }

    #[test]
    fn escapes_in_terminals() {
        let ctx = parse_grammar("S ::= \"a\\x41\\n\\\"\"\n", 8).unwrap();
        let s = ctx.nt_id("S").unwrap();
        let mut state = FuzzState::with_seed(1);
        let mut tree = Tree::default();
        tree.generate_from_nt(&mut state, s, 8, &ctx);
        assert_eq!(tree.unparse(&ctx), b"aA\n\"");
    }

    #[test]
    fn byte_class_rule_samples_within_bounds() {
        let ctx = parse_grammar("S ::= [a-c]{2,4}\n", 8).unwrap();
        let s = ctx.nt_id("S").unwrap();
        let mut state = FuzzState::with_seed(7);
        for _ in 0..32 {
            let mut tree = Tree::default();
            tree.generate_from_nt(&mut state, s, 8, &ctx);
            let out = tree.unparse(&ctx);
            assert!(out.len() >= 2 && out.len() <= 4);
            assert!(out.iter().all(|b| (b'a'..=b'c').contains(b)));
        }
    }

    #[test]
    fn byte_class_mixed_with_symbols_is_rejected() {
        assert!(parse_grammar("S ::= \"a\" [0-9]{1}\n", 8).is_err());
    }

    #[test]
    fn undefined_reference_is_rejected() {
        assert!(parse_grammar("S ::= <MISSING>\n", 8).is_err());
    }
}
