//! The solver core (4.G): a priority-queue-driven generator that applies
//! one of eight instantiation rules to the cheapest open state on each
//! step, in strict priority order, the way `isla/solver.py`'s `solve()`
//! steps `SolutionState`s until one's tree is complete and its
//! constraint has collapsed to `true`. `check`/`repair` reuse the same
//! grammar/cost machinery to decide and fix concrete inputs.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::SolverConfig;
use crate::cost::{compute_cost, CostComponents};
use crate::error::{Error, Result};
use crate::formula::{top_constant, Binding, Formula, Variable, TOP_CONSTANT};
use crate::forest::Forest;
use crate::fuzzer;
use crate::grammar::Grammar;
use crate::graph::GrammarGraph;
use crate::insertion;
use crate::matcher;
use crate::predicates::{self, PredicateOutcome};
use crate::smt::{self, Atom, Solution};
use crate::tree::{DerivationTree, NodeId};
use crate::utils::combinations;

/// How many successor trees `step_expand` may branch into from a single
/// state before giving up on that leaf combination; distinct from
/// `insertion`'s own `FANOUT_CAP` since this caps a Cartesian product
/// over every open leaf at once rather than one insertion strategy.
const EXPAND_FANOUT_CAP: usize = 64;

/// One node of the search: a partially-expanded tree plus the remaining
/// constraint over it, and the environment binding each quantifier
/// variable currently in scope (including the reserved top constant) to
/// the node it has been matched against. `level` counts how many
/// quantifier/expansion steps produced this state, the "derivation
/// depth" cost component (4.H).
#[derive(Debug, Clone)]
pub struct SolutionState {
  pub constraint: Formula,
  pub tree: DerivationTree,
  pub level: usize,
  pub bindings: HashMap<Rc<str>, NodeId>,
}

struct QueueItem {
  cost: f64,
  seq: u64,
  state: SolutionState,
}

impl PartialEq for QueueItem {
  fn eq(&self, other: &Self) -> bool {
    self.cost == other.cost && self.seq == other.seq
  }
}
impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for QueueItem {
  /// `BinaryHeap` is a max-heap; reversing the cost comparison turns it
  /// into the min-heap the search wants (cheapest state first), with
  /// `seq` breaking ties so insertion order decides between equal costs.
  fn cmp(&self, other: &Self) -> Ordering {
    other
      .cost
      .partial_cmp(&self.cost)
      .unwrap_or(Ordering::Equal)
      .then_with(|| other.seq.cmp(&self.seq))
  }
}

/// Collapses a conjunct list back into a single formula, normalizing away
/// the cases `Formula::is_true`/`is_false` only recognize on the literal
/// `Bool` variant: any false conjunct makes the whole thing false, true
/// conjuncts drop out, and an empty or singleton result doesn't need an
/// `And` wrapper at all.
fn simplify_conjunction(fs: Vec<Formula>) -> Formula {
  if fs.iter().any(Formula::is_false) {
    return Formula::Bool(false);
  }
  let mut kept: Vec<Formula> = fs.into_iter().filter(|f| !f.is_true()).collect();
  match kept.len() {
    0 => Formula::Bool(true),
    1 => kept.pop().unwrap(),
    _ => Formula::And(kept),
  }
}

/// Resolves a quantifier's `in_var` to the sub-derivation it is
/// currently bound to: the reserved top constant resolves to the whole
/// tree, anything else looks the variable up in `bindings` and follows
/// it to a concrete node.
fn resolve_in_tree<'a>(root: &'a DerivationTree, bindings: &HashMap<Rc<str>, NodeId>, var: &Variable) -> Option<&'a DerivationTree> {
  if var.name.as_ref() == TOP_CONSTANT {
    return Some(root);
  }
  let id = bindings.get(&var.name)?;
  let path = root.find_node(*id)?;
  root.get_subtree(&path)
}

/// Resolves one predicate argument, whether it has already been
/// substituted with a concrete tree or still names a bound variable.
fn resolve_binding<'a>(root: &'a DerivationTree, bindings: &HashMap<Rc<str>, NodeId>, binding: &'a Binding) -> Option<&'a DerivationTree> {
  match binding {
    Binding::Tree(t) => {
      let path = root.find_node(t.id())?;
      root.get_subtree(&path)
    }
    Binding::Var(v) => resolve_in_tree(root, bindings, v),
    Binding::StringLiteral(_) | Binding::IntLiteral(_) => None,
  }
}

/// After a tree-growing step, every `Binding::Tree`/`Smt.substitutions`
/// snapshot still names the right `NodeId`s but may point at stale
/// (pre-growth) copies of those nodes' own content, since `replace_path`
/// only preserves identity for nodes off the rewritten spine. Re-resolve
/// every snapshot against `new_tree` so later steps see the grown tree.
fn refresh_tree_substitutions(formula: &Formula, new_tree: &DerivationTree) -> Formula {
  match formula {
    Formula::Smt { expr, substitutions } => {
      let refreshed = substitutions
        .iter()
        .map(|(k, v)| {
          let resolved = new_tree.find_node(v.id()).and_then(|p| new_tree.get_subtree(&p)).cloned().unwrap_or_else(|| v.clone());
          (k.clone(), resolved)
        })
        .collect();
      Formula::Smt { expr: expr.clone(), substitutions: refreshed }
    }
    Formula::Structural { name, args } => Formula::Structural { name: name.clone(), args: refresh_bindings(args, new_tree) },
    Formula::Semantic { name, args } => Formula::Semantic { name: name.clone(), args: refresh_bindings(args, new_tree) },
    Formula::ForAll { bound, match_expr, in_var, already_matched, body } => Formula::ForAll {
      bound: bound.clone(),
      match_expr: match_expr.clone(),
      in_var: in_var.clone(),
      already_matched: already_matched.clone(),
      body: Box::new(refresh_tree_substitutions(body, new_tree)),
    },
    Formula::Exists { bound, match_expr, in_var, body } => Formula::Exists {
      bound: bound.clone(),
      match_expr: match_expr.clone(),
      in_var: in_var.clone(),
      body: Box::new(refresh_tree_substitutions(body, new_tree)),
    },
    Formula::IntroduceNumeric { bound, body } => {
      Formula::IntroduceNumeric { bound: bound.clone(), body: Box::new(refresh_tree_substitutions(body, new_tree)) }
    }
    Formula::And(fs) => Formula::And(fs.iter().map(|f| refresh_tree_substitutions(f, new_tree)).collect()),
    Formula::Or(fs) => Formula::Or(fs.iter().map(|f| refresh_tree_substitutions(f, new_tree)).collect()),
    Formula::Not(f) => Formula::Not(Box::new(refresh_tree_substitutions(f, new_tree))),
    Formula::Bool(b) => Formula::Bool(*b),
  }
}

fn refresh_bindings(args: &[Binding], new_tree: &DerivationTree) -> Vec<Binding> {
  args
    .iter()
    .map(|a| match a {
      Binding::Tree(t) => {
        let resolved = new_tree.find_node(t.id()).and_then(|p| new_tree.get_subtree(&p)).cloned().unwrap_or_else(|| t.clone());
        Binding::Tree(resolved)
      }
      other => other.clone(),
    })
    .collect()
}

/// Walks the original (pre-substitution) constraint collecting the full
/// [`Variable`] (with its nonterminal/numeric type) for every quantifier
/// binder plus the top constant, since `Formula::collect_free_variables`
/// deliberately skips over variables mentioned only inside `Smt` atoms.
fn collect_variable_types(formula: &Formula, out: &mut HashMap<Rc<str>, Variable>) {
  match formula {
    Formula::ForAll { bound, body, .. } | Formula::Exists { bound, body, .. } => {
      out.insert(bound.name.clone(), bound.clone());
      collect_variable_types(body, out);
    }
    Formula::IntroduceNumeric { bound, body } => {
      out.insert(bound.name.clone(), bound.clone());
      collect_variable_types(body, out);
    }
    Formula::And(fs) | Formula::Or(fs) => {
      for f in fs {
        collect_variable_types(f, out);
      }
    }
    Formula::Not(f) => collect_variable_types(f, out),
    _ => {}
  }
}

/// Rejects a constraint up front if any `count` semantic predicate
/// targets a nullable nonterminal (§12 Open Question ii): such a target
/// can always "grow" by zero more occurrences, so `predicates::count`
/// would never report `Decided`.
fn reject_nullable_count_targets(grammar: &Grammar, formula: &Formula) -> Result<()> {
  match formula {
    Formula::Semantic { name, args } if name.as_ref() == "count" => {
      if let Some(Binding::StringLiteral(nt)) = args.first() {
        if grammar.is_nullable(nt) {
          return Err(Error::Syntax(format!("count predicate targets nullable nonterminal {}", nt)));
        }
      }
      Ok(())
    }
    Formula::ForAll { body, .. } | Formula::Exists { body, .. } => reject_nullable_count_targets(grammar, body),
    Formula::IntroduceNumeric { body, .. } => reject_nullable_count_targets(grammar, body),
    Formula::And(fs) | Formula::Or(fs) => {
      for f in fs {
        reject_nullable_count_targets(grammar, f)?;
      }
      Ok(())
    }
    Formula::Not(f) => reject_nullable_count_targets(grammar, f),
    _ => Ok(()),
  }
}

pub struct Solver {
  grammar: Grammar,
  graph: GrammarGraph,
  config: SolverConfig,
  symbol_costs: HashMap<String, usize>,
  queue: BinaryHeap<QueueItem>,
  seen_hashes: HashSet<u64>,
  next_seq: u64,
  states_processed: usize,
  global_k_paths: HashSet<Vec<String>>,
  rng: StdRng,
  proved_unsat: bool,
  fresh_numeric_counter: usize,
  var_types: HashMap<Rc<str>, Variable>,
  original_constraint: Formula,
}

impl Solver {
  pub fn new(grammar: Grammar, constraint: Formula, config: SolverConfig) -> Result<Self> {
    reject_nullable_count_targets(&grammar, &constraint)?;

    let graph = GrammarGraph::build(&grammar, config.precompute_reachability);
    let symbol_costs = grammar.symbol_costs();
    let global_k_paths = graph.k_paths(config.cost_settings.k);

    let top = top_constant(grammar.start.clone());
    let mut var_types = HashMap::new();
    var_types.insert(top.name.clone(), top.clone());
    collect_variable_types(&constraint, &mut var_types);

    let renamed = constraint.ensure_unique_bound_variables();
    let root = DerivationTree::open(grammar.start.clone());
    let instantiated = renamed.substitute_expressions(&top, &root);

    let mut bindings = HashMap::new();
    bindings.insert(top.name.clone(), root.id());

    let mut solver = Self {
      grammar,
      graph,
      config,
      symbol_costs,
      queue: BinaryHeap::new(),
      seen_hashes: HashSet::new(),
      next_seq: 0,
      states_processed: 0,
      global_k_paths,
      rng: StdRng::seed_from_u64(0xC0FFEE),
      proved_unsat: false,
      fresh_numeric_counter: 0,
      var_types,
      original_constraint: renamed,
    };

    let initial = SolutionState { constraint: instantiated, tree: root, level: 0, bindings };
    solver.push_single(initial);

    Ok(solver)
  }

  fn compute_components(&self, state: &SolutionState) -> CostComponents {
    let tree_closing_cost = insertion::tree_closing_cost(&state.tree, &self.symbol_costs) as f64;
    let constraint_cost = state.constraint.split_conjunction().len() as f64;
    let vacuous_penalty = if state.constraint.is_true() { 1.0 } else { 0.0 };
    let derivation_depth = state.level as f64;

    let symbols: Vec<&str> = state.tree.paths().into_iter().map(|(_, n)| n.symbol()).collect();
    let local_k = self.config.cost_settings.k;
    let local_paths = state.tree.k_paths(local_k);
    let covered = self.graph.covered_k_paths(&symbols, local_k);
    let local_k_coverage_deficit = local_paths.difference(&covered).count() as f64;

    let global_deficit = if self.global_k_paths.is_empty() {
      0.0
    } else {
      1.0 - (covered.intersection(&self.global_k_paths).count() as f64 / self.global_k_paths.len() as f64)
    };

    CostComponents {
      tree_closing_cost,
      vacuous_penalty,
      constraint_cost,
      derivation_depth,
      local_k_coverage_deficit,
      global_k_coverage_deficit: global_deficit.max(0.0),
    }
  }

  /// Whether the last exhausted `solve()` run proved the constraint has
  /// no solutions, as opposed to merely running out of queue budget
  /// (only tracked when `activate_unsat_support` is set).
  pub fn proved_unsat(&self) -> bool {
    self.proved_unsat
  }

  fn push_single(&mut self, state: SolutionState) {
    let weights = self.config.cost_settings.weight_vector_for(self.states_processed);
    let components = self.compute_components(&state);
    let cost = compute_cost(&components, weights);
    let seq = self.next_seq;
    self.next_seq += 1;
    self.queue.push(QueueItem { cost, seq, state });
  }

  /// Re-establishes DNF on a state's constraint before re-queueing it
  /// (the DNF-establishment post-processing step every rule application
  /// goes through), discarding any disjunct that collapsed to `false`
  /// and branching the search for the rest.
  fn enqueue(&mut self, state: SolutionState) {
    for disjunct in state.constraint.to_dnf() {
      if disjunct.is_false() {
        continue;
      }
      if self.config.enforce_unique_trees_in_queue {
        let hash = state.tree.structural_hash();
        if !self.seen_hashes.insert(hash) {
          continue;
        }
      }
      self.push_single(SolutionState { constraint: disjunct, tree: state.tree.clone(), level: state.level, bindings: state.bindings.clone() });
    }
  }

  // --- step a: structural predicate instantiation -----------------------

  fn step_structural(&self, state: &SolutionState) -> Option<Vec<SolutionState>> {
    let conjuncts = state.constraint.split_conjunction();
    for (i, f) in conjuncts.iter().enumerate() {
      if let Formula::Structural { name, args } = f {
        // the two node-valued arguments always come first; `level` then
        // carries its relation/nonterminal as trailing string literals.
        let Some(a) = args.first().and_then(|a| resolve_binding(&state.tree, &state.bindings, a)) else { continue };
        let Some(b) = args.get(1).and_then(|a| resolve_binding(&state.tree, &state.bindings, a)) else { continue };
        let (a, b) = (a.id(), b.id());

        let decided = match name.as_ref() {
          "before" => Some(predicates::before(&state.tree, a, b)),
          "after" => Some(predicates::after(&state.tree, a, b)),
          "level" => match (args.get(2), args.get(3)) {
            (Some(Binding::StringLiteral(relation)), Some(Binding::StringLiteral(nonterminal))) => {
              predicates::level(&state.tree, relation, nonterminal, a, b)
            }
            _ => None,
          },
          _ => None,
        };

        if let Some(b) = decided {
          let mut new_conjuncts: Vec<Formula> = conjuncts.iter().map(|f| (*f).clone()).collect();
          new_conjuncts[i] = Formula::Bool(b);
          return Some(vec![SolutionState {
            constraint: simplify_conjunction(new_conjuncts),
            tree: state.tree.clone(),
            level: state.level,
            bindings: state.bindings.clone(),
          }]);
        }
      }
    }
    None
  }

  // --- step b: numeric constant introduction -----------------------------

  fn step_numeric(&mut self, state: &SolutionState) -> Option<Vec<SolutionState>> {
    if let Formula::IntroduceNumeric { bound, body } = &state.constraint {
      self.fresh_numeric_counter += 1;
      let fresh = Variable { name: format!("{}~intro{}", bound.name, self.fresh_numeric_counter).into(), ..bound.clone() };
      self.var_types.insert(fresh.name.clone(), fresh.clone());
      let renamed_body = body.substitute_bound_variable(bound, &fresh);
      return Some(vec![SolutionState { constraint: *Box::new(renamed_body), tree: state.tree.clone(), level: state.level + 1, bindings: state.bindings.clone() }]);
    }
    None
  }

  // --- step c: universal formula matching --------------------------------

  fn step_universal(&self, state: &SolutionState) -> Option<Vec<SolutionState>> {
    let conjuncts = state.constraint.split_conjunction();
    for (i, f) in conjuncts.iter().enumerate() {
      if let Formula::ForAll { bound, match_expr, in_var, already_matched, body } = f {
        let in_tree = resolve_in_tree(&state.tree, &state.bindings, in_var)?;
        let candidates = matcher::find_matches(in_tree, bound.nonterminal.as_deref().unwrap_or(""), match_expr.as_ref(), already_matched);
        if candidates.is_empty() {
          continue;
        }

        let mut instances = Vec::new();
        for candidate in &candidates {
          let Some(sub) = state.tree.find_node(*candidate).and_then(|p| state.tree.get_subtree(&p)).cloned() else { continue };
          instances.push(body.substitute_expressions(bound, &sub));
        }

        let mut new_already_matched = already_matched.clone();
        new_already_matched.extend(candidates.iter().copied());
        let remaining_forall = Formula::ForAll {
          bound: bound.clone(),
          match_expr: match_expr.clone(),
          in_var: in_var.clone(),
          already_matched: new_already_matched,
          body: body.clone(),
        };

        let mut new_conjuncts: Vec<Formula> = conjuncts.iter().map(|f| (*f).clone()).collect();
        let mut all_instances = instances;
        all_instances.push(remaining_forall);
        new_conjuncts[i] = simplify_conjunction(all_instances);

        return Some(vec![SolutionState {
          constraint: simplify_conjunction(new_conjuncts),
          tree: state.tree.clone(),
          level: state.level + 1,
          bindings: state.bindings.clone(),
        }]);
      }
    }
    None
  }

  // --- step d: tree expansion --------------------------------------------

  fn step_expand(&self, state: &SolutionState) -> Option<Vec<SolutionState>> {
    let conjuncts = state.constraint.split_conjunction();
    let mut targets: HashSet<String> = HashSet::new();
    for f in &conjuncts {
      if let Formula::ForAll { bound, in_var, .. } = f {
        if let Some(nt) = &bound.nonterminal {
          if resolve_in_tree(&state.tree, &state.bindings, in_var).is_some() {
            targets.insert(nt.to_string());
          }
        }
      }
    }
    if targets.is_empty() {
      return None;
    }

    let open_leaves = state.tree.open_leaves();
    let mut expandable_paths = Vec::new();
    let mut per_leaf_options: Vec<Vec<DerivationTree>> = Vec::new();

    for path in &open_leaves {
      let leaf = state.tree.get_subtree(path).expect("open leaf path must resolve");
      let reaches_a_target = targets.iter().any(|t| leaf.symbol() == t.as_str() || self.graph.reachable(leaf.symbol(), t));
      if !reaches_a_target {
        continue;
      }
      let rules = self.grammar.rules_for(leaf.symbol());
      if rules.is_empty() {
        continue;
      }
      let options: Vec<DerivationTree> =
        rules.iter().map(|r| DerivationTree::closed(leaf.symbol().to_string(), insertion::fresh_children(&r.productions))).collect();
      expandable_paths.push(path.clone());
      per_leaf_options.push(options);
    }

    if expandable_paths.is_empty() {
      return None;
    }

    let combos = combinations(&per_leaf_options);
    let mut out = Vec::new();
    for combo in combos.into_iter().take(EXPAND_FANOUT_CAP) {
      let mut grown = state.tree.clone();
      for (path, replacement) in expandable_paths.iter().zip(combo.into_iter()) {
        grown = grown.replace_path(path, replacement);
      }
      let refreshed_constraint = refresh_tree_substitutions(&state.constraint, &grown);
      out.push(SolutionState { constraint: refreshed_constraint, tree: grown, level: state.level + 1, bindings: state.bindings.clone() });
    }

    Some(out)
  }

  // --- step e: SMT formula elimination ------------------------------------

  fn step_smt(&self, state: &SolutionState) -> Option<Vec<SolutionState>> {
    let conjuncts = state.constraint.split_conjunction();
    let smt_indices: Vec<usize> = conjuncts.iter().enumerate().filter(|(_, f)| matches!(f, Formula::Smt { .. })).map(|(i, _)| i).collect();
    if smt_indices.is_empty() {
      return None;
    }

    let atoms: Vec<Atom> = smt_indices
      .iter()
      .map(|&i| match conjuncts[i] {
        Formula::Smt { expr, substitutions } => Atom { expr: expr.clone(), substitutions: substitutions.clone() },
        _ => unreachable!(),
      })
      .collect();

    let clusters = smt::cluster_by_shared_variables(&atoms);
    let mut per_cluster_solutions: Vec<Vec<HashMap<Rc<str>, Solution>>> = Vec::new();

    for cluster in &clusters {
      let mut free_names: HashSet<Rc<str>> = HashSet::new();
      for &idx in cluster {
        let mut vars = Vec::new();
        atoms[idx].expr.free_variables(&mut vars);
        for v in vars {
          if !atoms[idx].substitutions.contains_key(&v) {
            free_names.insert(v);
          }
        }
      }
      let free_vars: Vec<Variable> = free_names.iter().filter_map(|n| self.var_types.get(n).cloned()).collect();
      let cluster_atoms: Vec<Atom> = cluster.iter().map(|&i| atoms[i].clone()).collect();

      match smt::solve_cluster(&self.grammar, &cluster_atoms, &free_vars, self.config.max_number_smt_instantiations) {
        Ok(solutions) if !solutions.is_empty() => per_cluster_solutions.push(solutions),
        Ok(_) => return Some(vec![]),
        Err(_) => return Some(vec![]),
      }
    }

    let combos = combinations(&per_cluster_solutions);
    let mut out = Vec::new();

    for combo in combos {
      let mut merged: HashMap<Rc<str>, Solution> = HashMap::new();
      for sols in combo {
        merged.extend(sols);
      }

      let mut grown = state.tree.clone();
      let mut bindings = state.bindings.clone();
      let mut ok = true;

      for (name, solution) in &merged {
        let Solution::Str(s) = solution else { continue };
        let Some(var) = self.var_types.get(name) else { continue };
        let Some(nt) = &var.nonterminal else { continue };

        let target_id = if name.as_ref() == TOP_CONSTANT {
          Some(grown.id())
        } else {
          bindings.get(name).copied()
        };
        let Some(target_id) = target_id else { continue };
        let Some(path) = grown.find_node(target_id) else { continue };

        let view = self.grammar.with_start(nt);
        let chart = crate::earley::parse_chart(&view, s);
        let forest = Forest::from(chart);
        let parsed = forest.trees(&view);
        let Some(parsed_tree) = parsed.into_iter().next() else {
          ok = false;
          break;
        };

        grown = grown.replace_path(&path, parsed_tree);
        if name.as_ref() != TOP_CONSTANT {
          if let Some(new_path) = grown.find_node(target_id) {
            if let Some(new_node) = grown.get_subtree(&new_path) {
              bindings.insert(name.clone(), new_node.id());
            }
          }
        }
      }

      if !ok {
        continue;
      }

      let new_conjuncts: Vec<Formula> = conjuncts
        .iter()
        .enumerate()
        .map(|(i, f)| if smt_indices.contains(&i) { Formula::Bool(true) } else { (*f).clone() })
        .collect();

      let refreshed = refresh_tree_substitutions(&simplify_conjunction(new_conjuncts), &grown);
      out.push(SolutionState { constraint: refreshed, tree: grown, level: state.level + 1, bindings });
    }

    Some(out)
  }

  // --- step f: ready semantic predicate elimination ----------------------

  fn step_semantic(&self, state: &SolutionState) -> Option<Vec<SolutionState>> {
    let conjuncts = state.constraint.split_conjunction();
    for (i, f) in conjuncts.iter().enumerate() {
      if let Formula::Semantic { name, args } = f {
        if name.as_ref() == "count" {
          if let (Some(Binding::StringLiteral(nt)), Some(Binding::IntLiteral(expected))) = (args.first(), args.get(1)) {
            let outcome = predicates::count(&self.graph, &state.tree, nt, *expected);
            if let PredicateOutcome::Decided(b) = outcome {
              let mut new_conjuncts: Vec<Formula> = conjuncts.iter().map(|f| (*f).clone()).collect();
              new_conjuncts[i] = Formula::Bool(b);
              return Some(vec![SolutionState {
                constraint: simplify_conjunction(new_conjuncts),
                tree: state.tree.clone(),
                level: state.level,
                bindings: state.bindings.clone(),
              }]);
            }
          }
        }
      }
    }
    None
  }

  // --- step g: existential formula elimination ----------------------------

  fn step_existential(&self, state: &SolutionState) -> Option<Vec<SolutionState>> {
    let conjuncts = state.constraint.split_conjunction();
    let (i, bound, match_expr, in_var, body) = conjuncts.iter().enumerate().find_map(|(i, f)| match f {
      Formula::Exists { bound, match_expr, in_var, body } => Some((i, bound.clone(), match_expr.clone(), in_var.clone(), body.clone())),
      _ => None,
    })?;

    let in_tree = resolve_in_tree(&state.tree, &state.bindings, &in_var)?;
    let nonterminal = bound.nonterminal.clone().unwrap_or_default();
    let direct_candidates = matcher::find_existential_candidates(in_tree, &nonterminal, match_expr.as_ref(), &[]);

    let mut out = Vec::new();

    if !direct_candidates.is_empty() {
      for candidate in direct_candidates {
        let Some(path) = state.tree.find_node(candidate) else { continue };
        let Some(sub) = state.tree.get_subtree(&path).cloned() else { continue };
        let instantiated = body.substitute_expressions(&bound, &sub);

        let mut new_conjuncts: Vec<Formula> = conjuncts.iter().map(|f| (*f).clone()).collect();
        new_conjuncts[i] = instantiated;

        let mut bindings = state.bindings.clone();
        bindings.insert(bound.name.clone(), candidate);

        out.push(SolutionState {
          constraint: simplify_conjunction(new_conjuncts),
          tree: state.tree.clone(),
          level: state.level + 1,
          bindings,
        });
      }
      return Some(out);
    }

    let in_path = state.tree.find_node(in_tree.id())?;
    let to_insert = DerivationTree::open(nonterminal.clone());
    let grown_targets = insertion::insert_tree(&self.grammar, &self.graph, &to_insert, in_tree, &self.config.tree_insertion_methods, 6);

    let mut ranked: Vec<(usize, DerivationTree)> = grown_targets.into_iter().map(|t| (insertion::tree_closing_cost(&t, &self.symbol_costs), t)).collect();
    ranked.sort_by_key(|(c, _)| *c);
    ranked.truncate(self.config.max_number_tree_insertion_results);

    for (_, grown_target) in ranked {
      let Some(witness_path) = grown_target.find_node(to_insert.id()) else { continue };
      let Some(witness) = grown_target.get_subtree(&witness_path) else { continue };
      let witness_id = witness.id();

      let grown_whole = state.tree.replace_path(&in_path, grown_target);
      // the witness is still open; bind it by id so later steps
      // (expansion, matching) see it once it grows.
      let witness_tree = grown_whole.get_subtree(&grown_whole.find_node(witness_id)?).cloned()?;

      let mut new_conjuncts: Vec<Formula> = conjuncts.iter().map(|f| (*f).clone()).collect();
      new_conjuncts[i] = body.substitute_expressions(&bound, &witness_tree);

      let mut bindings = state.bindings.clone();
      bindings.insert(bound.name.clone(), witness_id);

      let refreshed = refresh_tree_substitutions(&simplify_conjunction(new_conjuncts), &grown_whole);
      out.push(SolutionState { constraint: refreshed, tree: grown_whole, level: state.level + 1, bindings });
    }

    Some(out)
  }

  // --- step h: free-instantiation fallback --------------------------------

  fn step_free_fuzz(&mut self, state: &SolutionState) -> Option<Vec<SolutionState>> {
    if !state.constraint.is_true() || state.tree.is_complete() {
      return None;
    }

    let mut out = Vec::new();
    for _ in 0..self.config.max_number_free_instantiations {
      let expanded = fuzzer::free_expand(&mut self.rng, &self.grammar, &state.tree, 4, 10);
      out.push(SolutionState { constraint: Formula::Bool(true), tree: expanded, level: state.level + 1, bindings: state.bindings.clone() });
    }
    Some(out)
  }

  /// Tries each step in its fixed a-h priority order, returning the name
  /// of whichever rule fired along with its successors.
  fn advance(&mut self, state: &SolutionState) -> Option<(&'static str, Vec<SolutionState>)> {
    if let Some(s) = self.step_structural(state) {
      return Some(("structural", s));
    }
    if let Some(s) = self.step_numeric(state) {
      return Some(("numeric", s));
    }
    if let Some(s) = self.step_universal(state) {
      return Some(("universal", s));
    }
    if let Some(s) = self.step_expand(state) {
      return Some(("expand", s));
    }
    if let Some(s) = self.step_smt(state) {
      return Some(("smt", s));
    }
    if let Some(s) = self.step_semantic(state) {
      return Some(("semantic", s));
    }
    if let Some(s) = self.step_existential(state) {
      return Some(("existential", s));
    }
    if let Some(s) = self.step_free_fuzz(state) {
      return Some(("free_fuzz", s));
    }
    None
  }

  /// Advances `state` and logs the rule that fired along with the
  /// popped state's cost, matching the granularity of `isla/solver.py`'s
  /// `self.logger.debug` calls around its own queue pop.
  fn step_and_log(&mut self, cost: f64, state: &SolutionState) -> Option<Vec<SolutionState>> {
    let (rule, successors) = self.advance(state)?;
    tracing::debug!(cost, rule, level = state.level, successors = successors.len(), "solver rule applied");
    Some(successors)
  }

  /// Runs the search to completion (or exhaustion/timeout), returning an
  /// iterator that yields every complete, constraint-satisfying tree it
  /// finds, lazily.
  pub fn solve(&mut self) -> GeneratorIter<'_> {
    GeneratorIter { solver: self, pending: VecDeque::new(), started_at: Instant::now() }
  }

  /// Parses `input` against the grammar and decides whether it satisfies
  /// the original constraint, using a dedicated three-valued evaluator
  /// rather than the search-stepping machinery (stepping advances one
  /// state toward completion; deciding a fixed tree is a different, and
  /// simpler, recursive walk).
  pub fn check(&self, input: &str) -> Result<bool> {
    let chart = crate::earley::parse_chart(&self.grammar, input);
    let forest = Forest::from(chart);
    let tree = forest.trees(&self.grammar).into_iter().next().ok_or_else(|| Error::Syntax(input.to_string()))?;

    let top = top_constant(self.grammar.start.clone());
    let mut bindings = HashMap::new();
    bindings.insert(top.name.clone(), tree.id());

    match self.evaluate_formula(&self.original_constraint, &tree, &mut bindings)? {
      Some(b) => Ok(b),
      None => Err(Error::Unknown("constraint evaluation did not reach a decision".into())),
    }
  }

  fn evaluate_formula(&self, formula: &Formula, root: &DerivationTree, bindings: &mut HashMap<Rc<str>, NodeId>) -> Result<Option<bool>> {
    Ok(match formula {
      Formula::Bool(b) => Some(*b),
      Formula::Not(f) => self.evaluate_formula(f, root, bindings)?.map(|b| !b),
      Formula::And(fs) => {
        let mut result = Some(true);
        for f in fs {
          match self.evaluate_formula(f, root, bindings)? {
            Some(false) => return Ok(Some(false)),
            Some(true) => {}
            None => result = None,
          }
        }
        result
      }
      Formula::Or(fs) => {
        let mut result = Some(false);
        for f in fs {
          match self.evaluate_formula(f, root, bindings)? {
            Some(true) => return Ok(Some(true)),
            Some(false) => {}
            None => result = None,
          }
        }
        result
      }
      Formula::Smt { expr, substitutions } => {
        let mut subst = substitutions.clone();
        for (name, id) in bindings.iter() {
          if !subst.contains_key(name) {
            if let Some(path) = root.find_node(*id) {
              if let Some(node) = root.get_subtree(&path) {
                subst.insert(name.clone(), node.clone());
              }
            }
          }
        }
        Some(smt::evaluate_ground(&self.grammar, expr, &subst)?)
      }
      Formula::Structural { name, args } => {
        let Some(a) = args.first().and_then(|a| resolve_binding(root, bindings, a)).map(|t| t.id()) else { return Ok(None) };
        let Some(b) = args.get(1).and_then(|a| resolve_binding(root, bindings, a)).map(|t| t.id()) else { return Ok(None) };
        match name.as_ref() {
          "before" => Some(predicates::before(root, a, b)),
          "after" => Some(predicates::after(root, a, b)),
          "level" => match (args.get(2), args.get(3)) {
            (Some(Binding::StringLiteral(relation)), Some(Binding::StringLiteral(nonterminal))) => predicates::level(root, relation, nonterminal, a, b),
            _ => None,
          },
          _ => None,
        }
      }
      Formula::Semantic { name, args } => {
        if name.as_ref() == "count" {
          if let (Some(Binding::StringLiteral(nt)), Some(Binding::IntLiteral(expected))) = (args.first(), args.get(1)) {
            match predicates::count(&self.graph, root, nt, *expected) {
              PredicateOutcome::Decided(b) => Some(b),
              PredicateOutcome::Unknown => None,
            }
          } else {
            None
          }
        } else {
          None
        }
      }
      Formula::IntroduceNumeric { body, .. } => self.evaluate_formula(body, root, bindings)?,
      Formula::ForAll { bound, match_expr, in_var, body, .. } => {
        let Some(in_tree) = resolve_in_tree(root, bindings, in_var) else { return Ok(None) };
        let matches = matcher::find_matches(in_tree, bound.nonterminal.as_deref().unwrap_or(""), match_expr.as_ref(), &[]);
        let mut result = Some(true);
        for m in matches {
          bindings.insert(bound.name.clone(), m);
          match self.evaluate_formula(body, root, bindings)? {
            Some(false) => return Ok(Some(false)),
            Some(true) => {}
            None => result = None,
          }
        }
        result
      }
      Formula::Exists { bound, match_expr, in_var, body } => {
        let Some(in_tree) = resolve_in_tree(root, bindings, in_var) else { return Ok(None) };
        let matches = matcher::find_matches(in_tree, bound.nonterminal.as_deref().unwrap_or(""), match_expr.as_ref(), &[]);
        let mut result = Some(false);
        for m in matches {
          bindings.insert(bound.name.clone(), m);
          match self.evaluate_formula(body, root, bindings)? {
            Some(true) => return Ok(Some(true)),
            Some(false) => {}
            None => result = None,
          }
        }
        result
      }
    })
  }

  /// Parses `input`; if it already satisfies the constraint, returns it
  /// as-is. Otherwise tries reopening each non-leaf node one at a time
  /// and re-running a throwaway search from that partial tree, falling
  /// back to full regeneration if no single reopening succeeds. There is
  /// no dedicated `repair` collaborator in the retrieved sources to
  /// ground this against; it is a pragmatic, documented simplification
  /// (see DESIGN.md).
  pub fn repair(&mut self, input: &str) -> Result<DerivationTree> {
    let chart = crate::earley::parse_chart(&self.grammar, input);
    let forest = Forest::from(chart);
    let tree = forest.trees(&self.grammar).into_iter().next().ok_or_else(|| Error::Syntax(input.to_string()))?;

    if self.check(input).unwrap_or(false) {
      return Ok(tree);
    }

    for (path, node) in tree.paths() {
      if node.is_leaf() || node.is_open() {
        continue;
      }
      let reopened = tree.replace_path(&path, DerivationTree::open(node.symbol().to_string()));
      if let Some(fixed) = self.complete_from(reopened) {
        return Ok(fixed);
      }
    }

    self.complete_from(DerivationTree::open(self.grammar.start.clone())).ok_or(Error::Exhaustion { proved_unsat: false })
  }

  /// Runs a bounded, self-contained search from `seed`, snapshotting and
  /// restoring the live queue/dedup-set so a `repair()` call mid-`solve()`
  /// doesn't corrupt the caller's in-progress session.
  fn complete_from(&mut self, seed: DerivationTree) -> Option<DerivationTree> {
    let saved_queue = std::mem::take(&mut self.queue);
    let saved_seen = std::mem::take(&mut self.seen_hashes);
    let saved_seq = self.next_seq;

    let top = top_constant(self.grammar.start.clone());
    let mut bindings = HashMap::new();
    bindings.insert(top.name.clone(), seed.id());
    let instantiated = self.original_constraint.substitute_expressions(&top, &seed);

    self.push_single(SolutionState { constraint: instantiated, tree: seed, level: 0, bindings });

    let mut result = None;
    let mut budget = 2000usize;
    while budget > 0 {
      budget -= 1;
      let Some(item) = self.queue.pop() else { break };
      if item.state.tree.is_complete() && item.state.constraint.is_true() {
        result = Some(item.state.tree);
        break;
      }
      if let Some(successors) = self.step_and_log(item.cost, &item.state) {
        for s in successors {
          self.enqueue(s);
        }
      }
      self.states_processed += 1;
    }

    self.queue = saved_queue;
    self.seen_hashes = saved_seen;
    self.next_seq = saved_seq;

    result
  }
}

/// A lazy iterator over every complete, constraint-satisfying tree the
/// search can find, honoring the configured timeout and unique-tree
/// dedup policy. Mirrors `isla.solver.ISLaSolver.solve`'s generator
/// interface.
pub struct GeneratorIter<'a> {
  solver: &'a mut Solver,
  pending: VecDeque<DerivationTree>,
  started_at: Instant,
}

impl<'a> Iterator for GeneratorIter<'a> {
  type Item = DerivationTree;

  fn next(&mut self) -> Option<DerivationTree> {
    if let Some(tree) = self.pending.pop_front() {
      return Some(tree);
    }

    loop {
      if self.solver.config.timeout_seconds > 0 && self.started_at.elapsed().as_secs() >= self.solver.config.timeout_seconds {
        return None;
      }

      let Some(item) = self.solver.queue.pop() else {
        self.solver.proved_unsat = self.solver.config.activate_unsat_support;
        return None;
      };

      self.solver.states_processed += 1;

      if item.state.tree.is_complete() && item.state.constraint.is_true() {
        return Some(item.state.tree);
      }

      if let Some(successors) = self.solver.step_and_log(item.cost, &item.state) {
        let mut completed = Vec::new();
        let mut rest = Vec::new();
        for s in successors {
          if s.tree.is_complete() && s.constraint.is_true() {
            completed.push(s.tree);
          } else {
            rest.push(s);
          }
        }
        for s in rest {
          self.solver.enqueue(s);
        }
        if !completed.is_empty() {
          let mut iter = completed.into_iter();
          let first = iter.next();
          self.pending.extend(iter);
          return first;
        }
      }
      // a state with no applicable step is simply dropped: it is stuck
      // (e.g. a `Not(ForAll)`/`Not(Exists)` that `to_nnf` never rewrote).
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::formula::{top_constant, Binding, Formula, SmtExpr, Variable};

  fn var_grammar() -> Grammar {
    "<start> ::= <var>; <var> ::= a | b | c;".parse().unwrap()
  }

  #[test]
  fn solves_an_atomic_smt_constraint_over_the_top_constant() {
    let grammar = var_grammar();
    let top = top_constant(grammar.start.clone());
    let constraint = Formula::Smt {
      expr: SmtExpr::Eq(Box::new(SmtExpr::Var(top.name.clone())), Box::new(SmtExpr::StrLit("b".into()))),
      substitutions: HashMap::new(),
    };

    let mut solver = Solver::new(grammar, constraint, SolverConfig::default()).unwrap();
    let tree = solver.solve().next().expect("expected at least one solution");
    assert_eq!(tree.unparse(), "b");
  }

  #[test]
  fn rejects_count_predicates_over_nullable_nonterminals() {
    let grammar: Grammar = "<s> ::= <a><a>; <a> ::= x | ;".parse().unwrap();
    let constraint = Formula::Semantic {
      name: "count".into(),
      args: vec![Binding::StringLiteral("<a>".into()), Binding::IntLiteral(1)],
    };
    let err = Solver::new(grammar, constraint, SolverConfig::default()).unwrap_err();
    assert!(matches!(err, Error::Syntax(_)));
  }

  #[test]
  fn check_decides_a_satisfying_input() {
    let grammar = var_grammar();
    let top = top_constant(grammar.start.clone());
    let constraint = Formula::Smt {
      expr: SmtExpr::Eq(Box::new(SmtExpr::Var(top.name.clone())), Box::new(SmtExpr::StrLit("b".into()))),
      substitutions: HashMap::new(),
    };
    let solver = Solver::new(grammar, constraint, SolverConfig::default()).unwrap();
    assert!(solver.check("b").unwrap());
    assert!(!solver.check("a").unwrap());
  }

  #[test]
  fn repair_fixes_a_violating_input_by_reopening_a_node() {
    let grammar = var_grammar();
    let top = top_constant(grammar.start.clone());
    let constraint = Formula::Smt {
      expr: SmtExpr::Eq(Box::new(SmtExpr::Var(top.name.clone())), Box::new(SmtExpr::StrLit("b".into()))),
      substitutions: HashMap::new(),
    };
    let mut solver = Solver::new(grammar, constraint, SolverConfig::default()).unwrap();
    let fixed = solver.repair("a").unwrap();
    assert_eq!(fixed.unparse(), "b");
  }

  #[test]
  fn universal_quantifier_rejects_a_counterexample() {
    let grammar: Grammar = "<start> ::= <a><a>; <a> ::= x | y;".parse().unwrap();
    let top = top_constant(grammar.start.clone());
    let bound = Variable::nonterminal("e", "<a>");
    let constraint = Formula::ForAll {
      bound: bound.clone(),
      match_expr: None,
      in_var: top.clone(),
      already_matched: vec![],
      body: Box::new(Formula::Smt {
        expr: SmtExpr::Eq(Box::new(SmtExpr::Var(bound.name.clone())), Box::new(SmtExpr::StrLit("x".into()))),
        substitutions: HashMap::new(),
      }),
    };
    let solver = Solver::new(grammar, constraint, SolverConfig::default()).unwrap();
    assert!(solver.check("xx").unwrap());
    assert!(!solver.check("xy").unwrap());
  }
}
