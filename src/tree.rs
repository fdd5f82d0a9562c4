//! The derivation tree (4.A): a persistent, `Rc`-shared tree over grammar
//! symbols, each node carrying a [`NodeId`] stable across substitution so
//! quantifiers can refer back to a particular sub-derivation even after
//! the tree around it has grown.

use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
  fn fresh() -> Self {
    NodeId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
  }
}

impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

#[derive(Debug, Clone)]
enum Children {
  /// A nonterminal not yet expanded.
  Open,
  /// A terminal: leaf text, no children.
  Leaf,
  /// An expanded nonterminal.
  Closed(Rc<Vec<DerivationTree>>),
}

#[derive(Debug, Clone)]
pub struct DerivationTree {
  id: NodeId,
  symbol: Rc<str>,
  children: Children,
}

impl DerivationTree {
  pub fn open(symbol: impl Into<Rc<str>>) -> Self {
    Self { id: NodeId::fresh(), symbol: symbol.into(), children: Children::Open }
  }

  pub fn leaf(text: impl Into<Rc<str>>) -> Self {
    Self { id: NodeId::fresh(), symbol: text.into(), children: Children::Leaf }
  }

  pub fn closed(symbol: impl Into<Rc<str>>, children: Vec<DerivationTree>) -> Self {
    Self {
      id: NodeId::fresh(),
      symbol: symbol.into(),
      children: Children::Closed(Rc::new(children)),
    }
  }

  pub fn id(&self) -> NodeId {
    self.id
  }

  pub fn symbol(&self) -> &str {
    &self.symbol
  }

  pub fn is_open(&self) -> bool {
    matches!(self.children, Children::Open)
  }

  pub fn is_leaf(&self) -> bool {
    matches!(self.children, Children::Leaf)
  }

  pub fn children(&self) -> &[DerivationTree] {
    match &self.children {
      Children::Closed(c) => c.as_slice(),
      _ => &[],
    }
  }

  pub fn is_complete(&self) -> bool {
    match &self.children {
      Children::Open => false,
      Children::Leaf => true,
      Children::Closed(c) => c.iter().all(DerivationTree::is_complete),
    }
  }

  /// Paths (root-relative child index sequences) to every open leaf, in
  /// pre-order. The empty path refers to the root itself.
  pub fn open_leaves(&self) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    self.collect_open_leaves(&mut Vec::new(), &mut out);
    out
  }

  fn collect_open_leaves(&self, path: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
    match &self.children {
      Children::Open => out.push(path.clone()),
      Children::Leaf => {}
      Children::Closed(c) => {
        for (i, child) in c.iter().enumerate() {
          path.push(i);
          child.collect_open_leaves(path, out);
          path.pop();
        }
      }
    }
  }

  /// Every node in the tree paired with its path, pre-order.
  pub fn paths(&self) -> Vec<(Vec<usize>, &DerivationTree)> {
    let mut out = Vec::new();
    self.collect_paths(&mut Vec::new(), &mut out);
    out
  }

  fn collect_paths<'a>(&'a self, path: &mut Vec<usize>, out: &mut Vec<(Vec<usize>, &'a DerivationTree)>) {
    out.push((path.clone(), self));
    if let Children::Closed(c) = &self.children {
      for (i, child) in c.iter().enumerate() {
        path.push(i);
        child.collect_paths(path, out);
        path.pop();
      }
    }
  }

  pub fn get_subtree(&self, path: &[usize]) -> Option<&DerivationTree> {
    match path.split_first() {
      None => Some(self),
      Some((&i, rest)) => self.children().get(i).and_then(|c| c.get_subtree(rest)),
    }
  }

  pub fn find_node(&self, id: NodeId) -> Option<Vec<usize>> {
    self.paths().into_iter().find(|(_, n)| n.id == id).map(|(p, _)| p)
  }

  /// Rebuilds the spine down to `path`, replacing the node there with
  /// `new`; everything off the spine keeps its identity via `Rc` sharing.
  pub fn replace_path(&self, path: &[usize], new: DerivationTree) -> DerivationTree {
    match path.split_first() {
      None => new,
      Some((&i, rest)) => match &self.children {
        Children::Closed(c) => {
          let mut children = (**c).clone();
          children[i] = children[i].replace_path(rest, new);
          DerivationTree { id: self.id, symbol: self.symbol.clone(), children: Children::Closed(Rc::new(children)) }
        }
        _ => panic!("replace_path: path runs past a leaf or open node"),
      },
    }
  }

  /// Replaces the node with the given id, if present, wherever it occurs.
  pub fn substitute(&self, id: NodeId, new: DerivationTree) -> DerivationTree {
    match self.find_node(id) {
      Some(path) => self.replace_path(&path, new),
      None => self.clone(),
    }
  }

  /// A hash over shape and symbols only, independent of `NodeId`, so two
  /// trees built through unrelated substitutions but otherwise identical
  /// compare equal for `enforce_unique_trees_in_queue` deduplication.
  pub fn structural_hash(&self) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    self.hash_structure(&mut hasher);
    hasher.finish()
  }

  fn hash_structure<H: Hasher>(&self, hasher: &mut H) {
    self.symbol.hash(hasher);
    match &self.children {
      Children::Open => 0u8.hash(hasher),
      Children::Leaf => 1u8.hash(hasher),
      Children::Closed(c) => {
        2u8.hash(hasher);
        c.len().hash(hasher);
        for child in c.iter() {
          child.hash_structure(hasher);
        }
      }
    }
  }

  /// Concatenates leaf text left to right. Panics (via debug_assert) if
  /// any open nonterminal remains; callers should check `is_complete`
  /// first, as the solver's output stage always does.
  pub fn unparse(&self) -> String {
    let mut out = String::new();
    self.unparse_into(&mut out);
    out
  }

  fn unparse_into(&self, out: &mut String) {
    match &self.children {
      Children::Open => debug_assert!(false, "unparse called on a tree with open leaves"),
      Children::Leaf => out.push_str(&self.symbol),
      Children::Closed(c) => {
        for child in c.iter() {
          child.unparse_into(out);
        }
      }
    }
  }

  /// The length-k symbol paths this tree's own structure realizes, used
  /// to score local k-path coverage (4.H).
  pub fn k_paths(&self, k: usize) -> HashSet<Vec<String>> {
    let mut out = HashSet::new();
    for (path, _) in self.paths() {
      if path.len() + 1 < k {
        continue;
      }
      // Walk the spine down to this node, recording symbols along the way.
      let mut cur = self;
      let mut symbols = vec![cur.symbol.to_string()];
      for &i in &path {
        cur = &cur.children()[i];
        symbols.push(cur.symbol.to_string());
      }
      if symbols.len() >= k {
        out.insert(symbols[symbols.len() - k..].to_vec());
      }
    }
    out
  }
}

impl fmt::Display for DerivationTree {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.fmt_indented(f, 0)
  }
}

impl DerivationTree {
  fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    writeln!(f, "{}{}{}", "  ".repeat(depth), self.symbol, if self.is_open() { " (open)" } else { "" })?;
    for child in self.children() {
      child.fmt_indented(f, depth + 1)?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn open_leaves_finds_every_unexpanded_nonterminal() {
    let t = DerivationTree::closed(
      "<s>",
      vec![DerivationTree::open("<a>"), DerivationTree::leaf("x"), DerivationTree::open("<b>")],
    );
    assert_eq!(t.open_leaves(), vec![vec![0], vec![2]]);
    assert!(!t.is_complete());
  }

  #[test]
  fn replace_path_preserves_sibling_identity() {
    let sibling = DerivationTree::leaf("x");
    let sibling_id = sibling.id();
    let t = DerivationTree::closed("<s>", vec![DerivationTree::open("<a>"), sibling]);
    let replaced = t.replace_path(&[0], DerivationTree::leaf("a"));
    assert_eq!(replaced.children()[1].id(), sibling_id);
    assert!(replaced.is_complete());
    assert_eq!(replaced.unparse(), "ax");
  }

  #[test]
  fn substitute_finds_by_id_anywhere_in_tree() {
    let target = DerivationTree::open("<a>");
    let id = target.id();
    let t = DerivationTree::closed("<s>", vec![DerivationTree::leaf("x"), target]);
    let replaced = t.substitute(id, DerivationTree::leaf("y"));
    assert_eq!(replaced.unparse(), "xy");
  }

  #[test]
  fn structural_hash_ignores_node_identity() {
    let a = DerivationTree::closed("<s>", vec![DerivationTree::leaf("x")]);
    let b = DerivationTree::closed("<s>", vec![DerivationTree::leaf("x")]);
    assert_ne!(a.id(), b.id());
    assert_eq!(a.structural_hash(), b.structural_hash());
  }

  #[test]
  fn unparse_concatenates_leaves_in_order() {
    let t = DerivationTree::closed(
      "<s>",
      vec![DerivationTree::leaf("a"), DerivationTree::leaf("b"), DerivationTree::leaf("c")],
    );
    assert_eq!(t.unparse(), "abc");
  }
}
