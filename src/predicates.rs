//! The built-in structural/semantic predicate library (§11), grounded on
//! `input_constraints/isla_predicates.py`: `before`/`after` (relative
//! position of two sub-derivations), `level` (ancestor-nesting relation)
//! and `count` (occurrence counting, a semantic predicate since its
//! readiness depends on how much of the tree is still open).

use crate::graph::GrammarGraph;
use crate::tree::{DerivationTree, NodeId};

/// The outcome of evaluating a semantic predicate against a
/// possibly-incomplete tree. `Unknown` means re-check once the tree has
/// grown further, mirroring `evaluation_result.ready()` in the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateOutcome {
  Decided(bool),
  Unknown,
}

impl PredicateOutcome {
  pub fn ready(&self) -> bool {
    matches!(self, Self::Decided(_))
  }
}

fn leaf_count(node: &DerivationTree) -> usize {
  if node.is_open() {
    0
  } else if node.is_leaf() {
    1
  } else {
    node.children().iter().map(leaf_count).sum()
  }
}

fn leaf_offset(node: &DerivationTree, path: &[usize]) -> usize {
  match path.split_first() {
    None => 0,
    Some((&i, rest)) => {
      let preceding: usize = node.children()[..i].iter().map(leaf_count).sum();
      preceding + leaf_offset(&node.children()[i], rest)
    }
  }
}

fn path_of(root: &DerivationTree, id: NodeId) -> Vec<usize> {
  root.find_node(id).unwrap_or_else(|| {
    debug_assert!(false, "predicate argument {} is not a node of the tree it was evaluated against", id);
    Vec::new()
  })
}

/// True if the sub-derivation `a` ends at or before `b` begins.
pub fn before(root: &DerivationTree, a: NodeId, b: NodeId) -> bool {
  let a_path = path_of(root, a);
  let b_path = path_of(root, b);
  let a_tree = root.get_subtree(&a_path).expect("resolved path must exist");
  let a_end = leaf_offset(root, &a_path) + leaf_count(a_tree);
  let b_start = leaf_offset(root, &b_path);
  a_end <= b_start
}

pub fn after(root: &DerivationTree, a: NodeId, b: NodeId) -> bool {
  before(root, b, a)
}

/// The number of ancestors of the node at `path` (not including the node
/// itself) whose symbol is `nonterminal`.
fn nesting_level(root: &DerivationTree, path: &[usize], nonterminal: &str) -> usize {
  let mut count = 0;
  let mut cur = root;
  for &i in path {
    if cur.symbol() == nonterminal {
      count += 1;
    }
    cur = &cur.children()[i];
  }
  count
}

/// `level(relation, nonterminal, a, b)`: compares the `nonterminal`-ancestor
/// nesting depth of `a` against that of `b`. `relation` is one of
/// `"EQ"`, `"LE"`, `"GE"`, `"LT"`, `"GT"`. Returns `None` for an
/// unrecognized relation, signalling the caller to treat the predicate as
/// `Unknown` rather than panicking on malformed input.
pub fn level(root: &DerivationTree, relation: &str, nonterminal: &str, a: NodeId, b: NodeId) -> Option<bool> {
  let la = nesting_level(root, &path_of(root, a), nonterminal);
  let lb = nesting_level(root, &path_of(root, b), nonterminal);
  match relation {
    "EQ" => Some(la == lb),
    "LE" => Some(la <= lb),
    "GE" => Some(la >= lb),
    "LT" => Some(la < lb),
    "GT" => Some(la > lb),
    _ => None,
  }
}

fn count_closed_occurrences(node: &DerivationTree, nonterminal: &str) -> usize {
  if node.is_open() {
    return 0;
  }
  let here = if node.symbol() == nonterminal { 1 } else { 0 };
  here + node.children().iter().map(|c| count_closed_occurrences(c, nonterminal)).sum::<usize>()
}

/// `count(tree, nonterminal, expected)`: counts occurrences of
/// `nonterminal` within `tree`. If more open leaves could still expand
/// into further occurrences, the result is `Unknown` until the tree has
/// grown enough to decide; `graph` is consulted to prune leaves that
/// could never reach `nonterminal`.
///
/// Callers must reject `nonterminal` up front if it is nullable in the
/// grammar (`Solver::new` does this, §12 Open Question ii) — a nullable
/// target can always "grow" by zero, which would make this predicate
/// never ready.
pub fn count(graph: &GrammarGraph, root: &DerivationTree, nonterminal: &str, expected: i64) -> PredicateOutcome {
  let occurrences = count_closed_occurrences(root, nonterminal) as i64;
  if occurrences > expected {
    return PredicateOutcome::Decided(false);
  }

  let could_grow = root.open_leaves().iter().any(|path| {
    let leaf = root.get_subtree(path).expect("open leaf path must resolve");
    leaf.symbol() == nonterminal || graph.reachable(leaf.symbol(), nonterminal)
  });

  if could_grow {
    PredicateOutcome::Unknown
  } else {
    PredicateOutcome::Decided(occurrences == expected)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::grammar::Grammar;

  fn leaf_pair() -> (DerivationTree, NodeId, NodeId) {
    let a = DerivationTree::leaf("a");
    let b = DerivationTree::leaf("b");
    let (a_id, b_id) = (a.id(), b.id());
    let tree = DerivationTree::closed("<s>", vec![a, b]);
    (tree, a_id, b_id)
  }

  #[test]
  fn before_holds_for_left_sibling() {
    let (tree, a, b) = leaf_pair();
    assert!(before(&tree, a, b));
    assert!(!before(&tree, b, a));
  }

  #[test]
  fn after_is_the_mirror_of_before() {
    let (tree, a, b) = leaf_pair();
    assert!(after(&tree, b, a));
  }

  #[test]
  fn level_counts_ancestor_occurrences() {
    let leaf = DerivationTree::leaf("x");
    let leaf_id = leaf.id();
    let inner = DerivationTree::closed("<block>", vec![leaf]);
    let outer = DerivationTree::closed("<block>", vec![inner]);
    let other_leaf = DerivationTree::leaf("y");
    let other_id = other_leaf.id();
    let root = DerivationTree::closed("<s>", vec![outer, other_leaf]);

    assert_eq!(level(&root, "GT", "<block>", leaf_id, other_id), Some(true));
    assert_eq!(level(&root, "EQ", "<block>", leaf_id, other_id), Some(false));
  }

  #[test]
  fn count_is_unknown_while_growth_remains_possible() {
    let g: Grammar = "<s> ::= <a><a>; <a> ::= x;".parse().unwrap();
    let graph = GrammarGraph::build(&g, false);
    let tree = DerivationTree::closed("<s>", vec![DerivationTree::leaf("x"), DerivationTree::open("<a>")]);
    assert_eq!(count(&graph, &tree, "<a>", 1), PredicateOutcome::Unknown);
  }

  #[test]
  fn count_decides_once_no_growth_remains() {
    let g: Grammar = "<s> ::= <a><a>; <a> ::= x;".parse().unwrap();
    let graph = GrammarGraph::build(&g, false);
    let tree = DerivationTree::closed(
      "<s>",
      vec![DerivationTree::closed("<a>", vec![DerivationTree::leaf("x")]), DerivationTree::closed("<a>", vec![DerivationTree::leaf("x")])],
    );
    assert_eq!(count(&graph, &tree, "<a>", 2), PredicateOutcome::Decided(true));
  }

  #[test]
  fn count_rejects_as_soon_as_it_exceeds_expected() {
    let g: Grammar = "<s> ::= <a><a><a>; <a> ::= x;".parse().unwrap();
    let graph = GrammarGraph::build(&g, false);
    let tree = DerivationTree::closed(
      "<s>",
      vec![
        DerivationTree::closed("<a>", vec![DerivationTree::leaf("x")]),
        DerivationTree::closed("<a>", vec![DerivationTree::leaf("x")]),
        DerivationTree::open("<a>"),
      ],
    );
    assert_eq!(count(&graph, &tree, "<a>", 1), PredicateOutcome::Decided(false));
  }
}
