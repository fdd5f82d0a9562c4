//! Grammar-graph services (4.C): reachability, shortest distance,
//! per-nonterminal minimal expansion cost and k-path coverage, all built
//! on top of a `petgraph` digraph over the grammar's symbols. In the
//! original this is the externally supplied `grammar_graph.gg.GrammarGraph`
//! collaborator; here it is an internal module backing the same queries.

use std::collections::{HashMap, HashSet};

use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use regex::Regex;
use tracing::info;

use crate::grammar::Grammar;
use crate::rules::Production;

pub struct GrammarGraph {
  graph: DiGraph<String, ()>,
  index: HashMap<String, NodeIndex>,
  /// Populated only when `precompute_reachability` asks for it up front;
  /// otherwise reachability is computed on demand per query.
  reachability: Option<HashMap<(String, String), bool>>,
}

impl GrammarGraph {
  pub fn build(grammar: &Grammar, precompute_reachability: bool) -> Self {
    let mut graph = DiGraph::new();
    let mut index = HashMap::new();

    let mut symbol_id = |graph: &mut DiGraph<String, ()>, index: &mut HashMap<String, NodeIndex>, s: &str| -> NodeIndex {
      *index.entry(s.to_string()).or_insert_with(|| graph.add_node(s.to_string()))
    };

    for rules in grammar.rules.values() {
      for rule in rules.iter() {
        let head = symbol_id(&mut graph, &mut index, &rule.symbol.name);
        for p in &rule.productions {
          if let Production::Nonterminal(s) = p {
            let child = symbol_id(&mut graph, &mut index, &s.name);
            graph.add_edge(head, child, ());
          }
        }
      }
    }

    let mut this = Self { graph, index, reachability: None };

    if precompute_reachability {
      info!(nodes = this.index.len(), "precomputing grammar reachability");
      let mut table = HashMap::new();
      let nodes: Vec<_> = this.index.keys().cloned().collect();
      for from in &nodes {
        for to in &nodes {
          table.insert((from.clone(), to.clone()), this.reachable_uncached(from, to));
        }
      }
      this.reachability = Some(table);
    }

    this
  }

  fn reachable_uncached(&self, from: &str, to: &str) -> bool {
    match (self.index.get(from), self.index.get(to)) {
      (Some(&f), Some(&t)) => f == t || has_path_connecting(&self.graph, f, t, None),
      _ => false,
    }
  }

  /// True if some derivation of `from` can contain `to` as a sub-symbol.
  pub fn reachable(&self, from: &str, to: &str) -> bool {
    if let Some(table) = &self.reachability {
      return *table.get(&(from.to_string(), to.to_string())).unwrap_or(&false);
    }
    self.reachable_uncached(from, to)
  }

  /// Enumerates the distinct k-paths (sequences of k symbols connected by
  /// grammar-graph edges) reachable from every symbol, the coverage
  /// criterion 4.H's cost model rewards.
  pub fn k_paths(&self, k: usize) -> HashSet<Vec<String>> {
    let mut paths = HashSet::new();
    if k == 0 {
      return paths;
    }
    for &start in self.index.values() {
      let mut stack = vec![vec![start]];
      while let Some(path) = stack.pop() {
        if path.len() == k {
          paths.insert(path.iter().map(|&n| self.graph[n].clone()).collect());
          continue;
        }
        let last = *path.last().unwrap();
        let mut extended = false;
        for next in self.graph.neighbors_directed(last, Direction::Outgoing) {
          let mut extended_path = path.clone();
          extended_path.push(next);
          stack.push(extended_path);
          extended = true;
        }
        if !extended && path.len() > 1 {
          paths.insert(path.iter().map(|&n| self.graph[n].clone()).collect());
        }
      }
    }
    paths
  }

  /// The k-paths a tree's symbol sequence actually realizes, used to
  /// score a candidate tree against the global coverage target.
  pub fn covered_k_paths<'a>(&self, symbols: &[&'a str], k: usize) -> HashSet<Vec<String>> {
    symbols
      .windows(k)
      .map(|w| w.iter().map(|s| s.to_string()).collect())
      .collect()
  }
}

impl Grammar {
  /// The minimal number of expansion steps needed to close every open
  /// nonterminal into a tree of terminals, per symbol. Computed by a
  /// fixed-point relaxation: `cost(terminal) = 0`, `cost(nt) = 1 + min over
  /// alternatives of sum(cost(symbol))`, unreachable/left-recursive-only
  /// symbols converge to a large sentinel rather than looping forever.
  pub fn symbol_costs(&self) -> HashMap<String, usize> {
    const UNRESOLVED: usize = usize::MAX / 2;
    let mut costs: HashMap<String, usize> =
      self.nonterminals().map(|nt| (nt.clone(), UNRESOLVED)).collect();

    let mut changed = true;
    while changed {
      changed = false;
      for nt in self.nonterminals() {
        let mut best = costs[nt];
        for rule in self.rules_for(nt) {
          let mut sum = 0usize;
          let mut resolvable = true;
          for p in &rule.productions {
            match p {
              Production::Terminal(_) => {}
              Production::Nonterminal(s) => {
                let c = costs.get(&s.name).copied().unwrap_or(UNRESOLVED);
                if c >= UNRESOLVED {
                  resolvable = false;
                  break;
                }
                sum = sum.saturating_add(c);
              }
            }
          }
          if resolvable {
            best = best.min(1 + sum);
          }
        }
        if best < costs[nt] {
          costs.insert(nt.clone(), best);
          changed = true;
        }
      }
    }

    costs
  }

  /// Attempts to build a regular over-approximation of the language of
  /// `nt`, for use as an SMT atom abstraction (4.F). Returns `None` when
  /// the nonterminal's grammar is not regular enough to abstract this
  /// way (mutual recursion through more than one nonterminal, for
  /// instance) rather than guessing.
  pub fn extract_regex(&self, nt: &str) -> Option<Regex> {
    let mut seen = HashSet::new();
    let pattern = self.regex_pattern_for(nt, &mut seen)?;
    Regex::new(&format!("^(?:{})$", pattern)).ok()
  }

  fn regex_pattern_for(&self, nt: &str, seen: &mut HashSet<String>) -> Option<String> {
    if !seen.insert(nt.to_string()) {
      // recursive reference: bail rather than abstract incorrectly.
      return None;
    }
    let rules = self.rules_for(nt);
    if rules.is_empty() {
      return None;
    }
    let mut alts = Vec::with_capacity(rules.len());
    for rule in rules {
      let mut piece = String::new();
      for p in &rule.productions {
        match p {
          Production::Terminal(s) => piece.push_str(&regex::escape(s)),
          Production::Nonterminal(s) => {
            piece.push_str(&self.regex_pattern_for(&s.name, seen)?);
          }
        }
      }
      alts.push(piece);
    }
    seen.remove(nt);
    Some(format!("(?:{})", alts.join("|")))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn grammar(src: &str) -> Grammar {
    src.parse().unwrap()
  }

  #[test]
  fn reachable_follows_transitive_edges() {
    let g = grammar("<s> ::= <a>; <a> ::= <b>; <b> ::= x;");
    let graph = GrammarGraph::build(&g, false);
    assert!(graph.reachable("<s>", "<b>"));
    assert!(!graph.reachable("<b>", "<s>"));
  }

  #[test]
  fn precomputed_reachability_matches_lazy() {
    let g = grammar("<s> ::= <a>; <a> ::= x;");
    let lazy = GrammarGraph::build(&g, false);
    let eager = GrammarGraph::build(&g, true);
    assert_eq!(lazy.reachable("<s>", "<a>"), eager.reachable("<s>", "<a>"));
  }

  #[test]
  fn symbol_costs_prefer_shortest_alternative() {
    let g = grammar("<s> ::= <a> | x; <a> ::= <a>y | y;");
    let costs = g.symbol_costs();
    assert_eq!(costs["<s>"], 1);
  }

  #[test]
  fn extract_regex_handles_simple_alternation() {
    let g = grammar("<digit> ::= 0 | 1 | 2;");
    let re = g.extract_regex("<digit>").unwrap();
    assert!(re.is_match("1"));
    assert!(!re.is_match("3"));
  }

  #[test]
  fn extract_regex_bails_on_self_recursion() {
    let g = grammar("<a> ::= x<a> | x;");
    assert!(g.extract_regex("<a>").is_none());
  }
}
