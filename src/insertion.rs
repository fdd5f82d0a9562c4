//! Tree insertion (4.E): given a tree to insert and a target sub-derivation
//! to insert it into, finds ways to grow the target so that it ends up
//! containing the inserted tree somewhere, the way existential quantifier
//! elimination needs to place a witness inside an already-existing tree
//! (`isla/solver.py`'s `eliminate_existential_formula`, which delegates to
//! an `insert_tree` collaborator this module reimplements directly since
//! it has no corresponding file in the retrieved sources). Three
//! strategies are tried in order, cheapest first: direct embedding into an
//! open leaf, self embedding through a recursive nonterminal, and context
//! addition by wrapping the target inside a larger rule application.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::grammar::Grammar;
use crate::graph::GrammarGraph;
use crate::rules::Production;
use crate::tree::DerivationTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsertionMethod {
  DirectEmbedding,
  SelfEmbedding,
  ContextAddition,
}

impl InsertionMethod {
  pub fn all() -> Vec<Self> {
    vec![Self::DirectEmbedding, Self::SelfEmbedding, Self::ContextAddition]
  }
}

const FANOUT_CAP: usize = 64;

/// How many more expansion steps `tree` needs to close every open leaf,
/// summing each leaf's minimal symbol cost; used to rank insertion
/// candidates (and, more generally, any candidate tree) cheapest first.
pub fn tree_closing_cost(tree: &DerivationTree, costs: &HashMap<String, usize>) -> usize {
  tree
    .open_leaves()
    .iter()
    .map(|path| {
      let leaf = tree.get_subtree(path).expect("open leaf path must resolve");
      costs.get(leaf.symbol()).copied().unwrap_or(usize::MAX / 2)
    })
    .sum()
}

fn direct_embedding(to_insert: &DerivationTree, target: &DerivationTree, out: &mut Vec<DerivationTree>) {
  for path in target.open_leaves() {
    let leaf = target.get_subtree(&path).expect("open leaf path must resolve");
    if leaf.symbol() == to_insert.symbol() {
      out.push(target.replace_path(&path, to_insert.clone()));
    }
  }
}

pub(crate) fn fresh_children(rule_productions: &[Production]) -> Vec<DerivationTree> {
  rule_productions
    .iter()
    .map(|p| match p {
      Production::Terminal(s) => DerivationTree::leaf(s.clone()),
      Production::Nonterminal(s) => DerivationTree::open(s.name.clone()),
    })
    .collect()
}

fn self_embedding(grammar: &Grammar, graph: &GrammarGraph, to_insert: &DerivationTree, target: &DerivationTree, depth_budget: usize, out: &mut Vec<DerivationTree>) {
  if depth_budget == 0 || out.len() >= FANOUT_CAP {
    return;
  }

  for path in target.open_leaves() {
    let leaf = target.get_subtree(&path).expect("open leaf path must resolve");
    let symbol = leaf.symbol().to_string();
    if symbol == to_insert.symbol() {
      continue;
    }
    if !graph.reachable(&symbol, to_insert.symbol()) {
      continue;
    }

    for rule in grammar.rules_for(&symbol) {
      let leads_toward_target = rule.productions.iter().any(|p| match p {
        Production::Nonterminal(s) => s.name == to_insert.symbol() || graph.reachable(&s.name, to_insert.symbol()),
        Production::Terminal(_) => false,
      });
      if !leads_toward_target {
        continue;
      }

      let expanded = DerivationTree::closed(symbol.clone(), fresh_children(&rule.productions));
      let grown = target.replace_path(&path, expanded);

      let mut direct = Vec::new();
      direct_embedding(to_insert, &grown, &mut direct);
      if !direct.is_empty() {
        out.extend(direct);
      } else {
        self_embedding(grammar, graph, to_insert, &grown, depth_budget - 1, out);
      }

      if out.len() >= FANOUT_CAP {
        return;
      }
    }
  }
}

fn context_addition(grammar: &Grammar, graph: &GrammarGraph, to_insert: &DerivationTree, target: &DerivationTree, depth_budget: usize, out: &mut Vec<DerivationTree>) {
  if depth_budget == 0 || out.len() >= FANOUT_CAP {
    return;
  }

  let target_symbol = target.symbol().to_string();

  for nt in grammar.nonterminals() {
    for rule in grammar.rules_for(nt) {
      let has_slot_for_target = rule.productions.iter().any(|p| matches!(p, Production::Nonterminal(s) if s.name == target_symbol));
      let has_slot_toward_insertion = rule.productions.iter().any(|p| match p {
        Production::Nonterminal(s) => s.name != target_symbol && graph.reachable(&s.name, to_insert.symbol()),
        Production::Terminal(_) => false,
      });
      if !has_slot_for_target || !has_slot_toward_insertion {
        continue;
      }

      let mut used_target_slot = false;
      let mut children = Vec::with_capacity(rule.len());
      for p in &rule.productions {
        match p {
          Production::Terminal(s) => children.push(DerivationTree::leaf(s.clone())),
          Production::Nonterminal(s) if s.name == target_symbol && !used_target_slot => {
            used_target_slot = true;
            children.push(target.clone());
          }
          Production::Nonterminal(s) => children.push(DerivationTree::open(s.name.clone())),
        }
      }

      let wrapped = DerivationTree::closed(nt.clone(), children);

      let mut nested = Vec::new();
      direct_embedding(to_insert, &wrapped, &mut nested);
      if nested.is_empty() {
        self_embedding(grammar, graph, to_insert, &wrapped, depth_budget - 1, &mut nested);
      }
      out.extend(nested);

      if out.len() >= FANOUT_CAP {
        return;
      }
    }
  }
}

/// Finds ways to grow `target` so the result contains `to_insert`
/// somewhere, trying only the strategies named in `methods` and stopping
/// at the first strategy that yields any candidate at all (direct
/// embedding is always cheaper than growing the grammar further, so a
/// later strategy is only worth trying once the cheaper ones come up
/// empty). Callers rank the result by [`tree_closing_cost`] and truncate
/// to whatever budget they're enforcing.
pub fn insert_tree(grammar: &Grammar, graph: &GrammarGraph, to_insert: &DerivationTree, target: &DerivationTree, methods: &[InsertionMethod], max_depth: usize) -> Vec<DerivationTree> {
  let mut results = Vec::new();

  if methods.contains(&InsertionMethod::DirectEmbedding) {
    direct_embedding(to_insert, target, &mut results);
  }
  if results.is_empty() && methods.contains(&InsertionMethod::SelfEmbedding) {
    self_embedding(grammar, graph, to_insert, target, max_depth, &mut results);
  }
  if results.is_empty() && methods.contains(&InsertionMethod::ContextAddition) {
    context_addition(grammar, graph, to_insert, target, max_depth, &mut results);
  }

  results
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn direct_embedding_fills_a_matching_open_leaf() {
    let g: Grammar = "<s> ::= <a><b>; <a> ::= x; <b> ::= y;".parse().unwrap();
    let graph = GrammarGraph::build(&g, false);
    let target = DerivationTree::closed("<s>", vec![DerivationTree::open("<a>"), DerivationTree::open("<b>")]);
    let to_insert = DerivationTree::closed("<a>", vec![DerivationTree::leaf("x")]);

    let results = insert_tree(&g, &graph, &to_insert, &target, &InsertionMethod::all(), 4);
    assert!(!results.is_empty());
    assert!(results.iter().any(|t| t.unparse() == "xy"));
  }

  #[test]
  fn self_embedding_grows_through_a_recursive_nonterminal() {
    let g: Grammar = "<s> ::= <a>; <a> ::= x<a> | x<b>; <b> ::= z;".parse().unwrap();
    let graph = GrammarGraph::build(&g, false);
    let target = DerivationTree::open("<a>");
    let to_insert = DerivationTree::closed("<b>", vec![DerivationTree::leaf("z")]);

    let results = insert_tree(&g, &graph, &to_insert, &target, &InsertionMethod::all(), 4);
    assert!(!results.is_empty());
  }

  #[test]
  fn context_addition_wraps_a_complete_target() {
    let g: Grammar = "<s> ::= <a><c>; <a> ::= x; <c> ::= <b>; <b> ::= z;".parse().unwrap();
    let graph = GrammarGraph::build(&g, false);
    let target = DerivationTree::closed("<a>", vec![DerivationTree::leaf("x")]);
    let to_insert = DerivationTree::closed("<b>", vec![DerivationTree::leaf("z")]);

    let results = insert_tree(&g, &graph, &to_insert, &target, &[InsertionMethod::ContextAddition], 4);
    assert!(!results.is_empty());
  }

  #[test]
  fn tree_closing_cost_sums_open_leaf_costs() {
    let g: Grammar = "<s> ::= <a><b>; <a> ::= x; <b> ::= yy;".parse().unwrap();
    let costs = g.symbol_costs();
    let tree = DerivationTree::closed("<s>", vec![DerivationTree::open("<a>"), DerivationTree::open("<b>")]);
    assert_eq!(tree_closing_cost(&tree, &costs), costs["<a>"] + costs["<b>"]);
  }
}
