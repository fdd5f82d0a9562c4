//! The quantifier matcher (4.D): finds which sub-derivations of a
//! quantifier's `in_var` tree a bound variable can bind to, honoring an
//! optional match expression and (for `ForAll`) the set of instances
//! already matched in a previous pass.

use crate::formula::MatchExpr;
use crate::tree::{DerivationTree, NodeId};

/// Every node of `in_tree` whose symbol is `nonterminal`, further
/// restricted by `match_expr` (when present, the node's parent must carry
/// that label — a simplified stand-in for the original's bind-expression
/// sub-position matching) and with `exclude` filtered out.
pub fn find_matches(in_tree: &DerivationTree, nonterminal: &str, match_expr: Option<&MatchExpr>, exclude: &[NodeId]) -> Vec<NodeId> {
  let mut out = Vec::new();
  collect_matches(in_tree, nonterminal, match_expr, exclude, &mut out);
  out
}

fn collect_matches(node: &DerivationTree, nonterminal: &str, match_expr: Option<&MatchExpr>, exclude: &[NodeId], out: &mut Vec<NodeId>) {
  for child in node.children() {
    if child.symbol() == nonterminal && !exclude.contains(&child.id()) {
      let parent_ok = match match_expr {
        None => true,
        Some(m) => node.symbol() == m.nonterminal.as_ref(),
      };
      if parent_ok {
        out.push(child.id());
      }
    }
    collect_matches(child, nonterminal, match_expr, exclude, out);
  }
}

/// The matches a fresh `Exists` should consider: every match not yet
/// tried in this search branch (existentials don't accumulate an
/// `already_matched` set on the formula itself, but the solver excludes
/// ids it already branched on to avoid re-deriving the same witness).
pub fn find_existential_candidates(in_tree: &DerivationTree, nonterminal: &str, match_expr: Option<&MatchExpr>, tried: &[NodeId]) -> Vec<NodeId> {
  find_matches(in_tree, nonterminal, match_expr, tried)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn finds_all_matching_nonterminals() {
    let a1 = DerivationTree::leaf("x");
    let a1_id = a1.id();
    let tree = DerivationTree::closed(
      "<s>",
      vec![DerivationTree::closed("<a>", vec![a1]), DerivationTree::closed("<a>", vec![DerivationTree::leaf("y")])],
    );
    let matches = find_matches(&tree, "<a>", None, &[]);
    assert_eq!(matches.len(), 2);
    assert!(matches.contains(&tree.children()[0].id()));
    let _ = a1_id;
  }

  #[test]
  fn excludes_already_matched_instances() {
    let inner = DerivationTree::closed("<a>", vec![DerivationTree::leaf("x")]);
    let already = inner.id();
    let tree = DerivationTree::closed("<s>", vec![inner, DerivationTree::closed("<a>", vec![DerivationTree::leaf("y")])]);
    let matches = find_matches(&tree, "<a>", None, &[already]);
    assert_eq!(matches.len(), 1);
  }

  #[test]
  fn match_expr_restricts_by_parent_label() {
    let wrapped = DerivationTree::closed("<wrap>", vec![DerivationTree::closed("<a>", vec![DerivationTree::leaf("x")])]);
    let bare = DerivationTree::closed("<a>", vec![DerivationTree::leaf("y")]);
    let tree = DerivationTree::closed("<s>", vec![wrapped, bare]);
    let m = crate::formula::MatchExpr { nonterminal: "<wrap>".into() };
    let matches = find_matches(&tree, "<a>", Some(&m), &[]);
    assert_eq!(matches.len(), 1);
  }
}
