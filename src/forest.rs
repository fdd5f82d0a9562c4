use std::fmt;
use std::rc::Rc;

use crate::earley::Chart;
use crate::grammar::Grammar;
use crate::rules::Rule;
use crate::tree::DerivationTree;
use crate::utils::combinations;

#[derive(Debug, Clone, PartialEq)]
pub struct ForestState {
  rule: Rc<Rule>,
  span: (usize, usize),
}

impl ForestState {
  pub fn new(rule: &Rc<Rule>, start: usize, end: usize) -> Self {
    Self { rule: rule.clone(), span: (start, end) }
  }
}

impl fmt::Display for ForestState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}..{}: {}", self.span.0, self.span.1, self.rule)
  }
}

/// A parse-internal packed tree: a completed constituent headed by `rule`,
/// or a leaf carrying one token of input. Ambiguity is resolved by
/// [`Forest::trees`] expanding every combination before this gets
/// converted to a [`DerivationTree`].
#[derive(Debug, Clone)]
enum PackedTree {
  Leaf(String),
  /// A constituent that may still need its children filled in by
  /// `extend_out` before it is complete. Carries its own span so
  /// `make_trees` can recover it without an identity lookup back into
  /// the forest (two occurrences of the same rule at different spans
  /// share the same `Rc<Rule>`, so pointer identity alone can't do it).
  Branch(Rc<Rule>, (usize, usize), Vec<PackedTree>),
}

impl PackedTree {
  fn is_complete(&self) -> bool {
    match self {
      Self::Leaf(_) => true,
      Self::Branch(rule, _, children) => rule.len() == children.len(),
    }
  }

  fn into_derivation_tree(self) -> DerivationTree {
    match self {
      Self::Leaf(text) => DerivationTree::leaf(text),
      Self::Branch(rule, _, children) => DerivationTree::closed(
        rule.symbol.name.clone(),
        children.into_iter().map(PackedTree::into_derivation_tree).collect(),
      ),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Forest(Vec<Vec<ForestState>>);

impl Forest {
  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Takes a rule and search span, and returns a vec of all possible
  /// sequences of trees that correspond to the rule's productions.
  fn extend_out(
    &self,
    rule: &Rule,
    prod_idx: usize,
    search_start: usize,
    search_end: usize,
  ) -> Vec<Vec<PackedTree>> {
    if prod_idx == rule.len() && search_start == search_end {
      return vec![Vec::new()];
    } else if prod_idx == rule.len() || search_start == search_end {
      return Vec::new();
    }

    let next_production = &rule.productions[prod_idx];
    if next_production.is_nonterminal() {
      let wanted_symbol = next_production.symbol_str();
      self.0[search_start]
        .iter()
        .filter(|s| s.span.1 <= search_end && s.rule.symbol.name == wanted_symbol)
        .flat_map(|state| {
          self
            .extend_out(rule, prod_idx + 1, state.span.1, search_end)
            .into_iter()
            .map(move |mut seq| {
              seq.insert(0, PackedTree::Branch(state.rule.clone(), state.span, Vec::new()));
              seq
            })
        })
        .collect()
    } else {
      let leaf = PackedTree::Leaf(next_production.symbol_str().to_string());
      self
        .extend_out(rule, prod_idx + 1, search_start + 1, search_end)
        .into_iter()
        .map(move |mut seq| {
          seq.insert(0, leaf.clone());
          seq
        })
        .collect()
    }
  }

  /// Takes a possibly-uncompleted tree, and returns all possible trees it
  /// describes.
  fn make_trees(&self, tree: PackedTree) -> Vec<PackedTree> {
    if tree.is_complete() {
      vec![tree]
    } else {
      let (rule, span) = match &tree {
        PackedTree::Branch(rule, span, _) => (rule.clone(), *span),
        PackedTree::Leaf(_) => unreachable!("leaves are always complete"),
      };
      self
        .extend_out(&rule, 0, span.0, span.1)
        .into_iter()
        .flat_map(|children| {
          let child_sets: Vec<Vec<PackedTree>> =
            children.into_iter().map(|child| self.make_trees(child)).collect();
          let rule = rule.clone();
          combinations(&child_sets).into_iter().map(move |set| PackedTree::Branch(rule.clone(), span, set))
        })
        .collect::<Vec<_>>()
    }
  }

  pub fn trees(&self, g: &Grammar) -> Vec<DerivationTree> {
    if self.is_empty() {
      return Vec::new();
    }

    let root_states = self.0[0]
      .iter()
      .filter(|state| state.span.1 == self.len() && state.rule.symbol.name == g.start)
      .map(|state| PackedTree::Branch(state.rule.clone(), state.span, Vec::new()));

    root_states
      .flat_map(|tree| self.make_trees(tree))
      .map(PackedTree::into_derivation_tree)
      .collect()
  }
}

impl From<Chart> for Forest {
  fn from(chart: Chart) -> Self {
    let mut v = vec![Vec::new(); chart.len() - 1];

    for (k, states) in chart.into_iter() {
      for state in states {
        if !state.lr0.is_active() {
          v.get_mut(state.origin)
            .expect("origin > input len")
            .push(ForestState::new(&state.lr0.rule, state.origin, k));
        }
      }
    }

    Self(v)
  }
}

impl fmt::Display for Forest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for k in 0..self.len() {
      writeln!(f, "Origin {}:", k)?;
      for fs in self.0[k].iter() {
        writeln!(f, "  {}", fs)?;
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_chart_matches_expected_states() {
    let g: Grammar = "<S> ::= x; <S> ::= <S><S>;".parse().unwrap();

    let get_rule_with_len = |len: usize| g.rules_for("<S>").iter().find(|r| r.len() == len).unwrap().clone();

    let rule1 = get_rule_with_len(1);
    let rule2 = get_rule_with_len(2);

    let forest: Forest = crate::earley::parse_chart(&g, "xxx").into();

    assert_eq!(
      forest,
      Forest(vec![
        vec![ForestState::new(&rule1, 0, 1), ForestState::new(&rule2, 0, 2), ForestState::new(&rule2, 0, 3),],
        vec![ForestState::new(&rule1, 1, 2), ForestState::new(&rule2, 1, 3)],
        vec![ForestState::new(&rule1, 2, 3)],
      ])
    );
  }

  #[test]
  fn ambiguous_grammar_yields_every_derivation() {
    // S -> x | S S: "x x x" has two distinct derivations: [x][xx] and [xx][x].
    let g: Grammar = "<S> ::= x; <S> ::= <S><S>;".parse().unwrap();

    let forest: Forest = crate::earley::parse_chart(&g, "xxx").into();
    let trees = forest.trees(&g);

    assert_eq!(trees.len(), 2);
    for tree in &trees {
      assert!(tree.is_complete());
      assert_eq!(tree.unparse(), "xxx");
    }
  }
}
