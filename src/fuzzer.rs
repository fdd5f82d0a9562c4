//! A small free-instantiation grammar fuzzer, standing in for this
//! crate's "external" grammar fuzzer collaborator (§6 Non-goals) since a
//! self-contained crate needs something to actually call at 4.G step h.
//! Grounded on the three-phase expand/random/shrink strategy from
//! `stfnw-fuzzingbook-notes`' `grammarfuzzer` series: grow the tree with
//! maximum-cost expansions until it has at least `min_leaves` open
//! leaves, expand randomly up to `max_leaves`, then close out with
//! minimum-cost expansions so the tree actually terminates.

use std::collections::HashMap;
use std::rc::Rc;

use rand::Rng;

use crate::grammar::Grammar;
use crate::rules::{Production, Rule};
use crate::tree::DerivationTree;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Strategy {
  Max,
  Random,
  Min,
}

fn rule_cost(rule: &Rule, costs: &HashMap<String, usize>) -> usize {
  1 + rule
    .productions
    .iter()
    .map(|p| match p {
      Production::Terminal(_) => 0,
      Production::Nonterminal(s) => costs.get(&s.name).copied().unwrap_or(usize::MAX / 2),
    })
    .sum::<usize>()
}

fn pick_rule<'a>(rng: &mut impl Rng, costs: &HashMap<String, usize>, rules: &'a [Rc<Rule>], strategy: Strategy) -> &'a Rc<Rule> {
  match strategy {
    Strategy::Random => &rules[rng.gen_range(0..rules.len())],
    Strategy::Min | Strategy::Max => {
      let costed: Vec<(usize, &Rc<Rule>)> = rules.iter().map(|r| (rule_cost(r, costs), r)).collect();
      let target = match strategy {
        Strategy::Min => costed.iter().map(|(c, _)| *c).min().unwrap(),
        Strategy::Max => costed.iter().map(|(c, _)| *c).max().unwrap(),
        Strategy::Random => unreachable!(),
      };
      let candidates: Vec<&Rc<Rule>> = costed.iter().filter(|(c, _)| *c == target).map(|(_, r)| *r).collect();
      candidates[rng.gen_range(0..candidates.len())]
    }
  }
}

/// Expands every open leaf of `tree` until it is complete, following the
/// grow/random/shrink schedule. `min_leaves`/`max_leaves` bound the
/// growth phase's target open-leaf count, the way the original bounds
/// `min_nonterminals`/`max_nonterminals`.
pub fn free_expand(rng: &mut impl Rng, grammar: &Grammar, tree: &DerivationTree, min_leaves: usize, max_leaves: usize) -> DerivationTree {
  let costs = grammar.symbol_costs();
  let mut current = tree.clone();

  loop {
    let open = current.open_leaves();
    if open.is_empty() {
      break;
    }

    let strategy = if open.len() < min_leaves {
      Strategy::Max
    } else if open.len() < max_leaves {
      Strategy::Random
    } else {
      Strategy::Min
    };

    let path = open[rng.gen_range(0..open.len())].clone();
    let node = current.get_subtree(&path).expect("open leaf path must resolve");
    let symbol = node.symbol().to_string();
    let rules = grammar.rules_for(&symbol);
    if rules.is_empty() {
      tracing::debug!(symbol = %symbol, "free expansion stuck: no rules for nonterminal");
      break;
    }
    let rule = pick_rule(rng, &costs, rules, strategy);

    let children: Vec<DerivationTree> = rule
      .productions
      .iter()
      .map(|p| match p {
        Production::Terminal(s) => DerivationTree::leaf(s.clone()),
        Production::Nonterminal(s) => DerivationTree::open(s.name.clone()),
      })
      .collect();

    let expanded = DerivationTree::closed(symbol, children);
    current = current.replace_path(&path, expanded);
  }

  current
}

#[cfg(test)]
mod tests {
  use super::*;
  use rand::SeedableRng;
  use rand::rngs::StdRng;

  #[test]
  fn free_expand_always_terminates_and_completes() {
    let g: Grammar = "<s> ::= <a><a>; <a> ::= x | <a>y;".parse().unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    let tree = DerivationTree::open(g.start.clone());
    let expanded = free_expand(&mut rng, &g, &tree, 2, 6);
    assert!(expanded.is_complete());
  }

  #[test]
  fn free_expand_respects_single_alternative_grammars() {
    let g: Grammar = "<s> ::= a;".parse().unwrap();
    let mut rng = StdRng::seed_from_u64(1);
    let tree = DerivationTree::open(g.start.clone());
    let expanded = free_expand(&mut rng, &g, &tree, 0, 0);
    assert_eq!(expanded.unparse(), "a");
  }
}
