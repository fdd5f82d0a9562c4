//! The SMT bridge (4.F): lowers quantifier-free [`SmtExpr`] atoms to Z3,
//! clusters atoms that share an unresolved free variable so each cluster
//! is solved independently, and enumerates distinct solution vectors per
//! cluster. Grounded on `logicaffeine_verify::solver::Encoder` for the
//! IR-to-Z3 lowering shape and on `isla/solver.py`'s
//! `solve_quantifier_free_formula` for the cluster-then-enumerate loop
//! (blocking each found solution out before re-checking for another).

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use z3::ast::{Ast, Bool, Dynamic, Int, Regex as Z3Regex, String as Z3String};
use z3::{Config, Context, SatResult, Solver as Z3Solver};

use crate::error::{Error, Result};
use crate::formula::{SmtExpr, VarType, Variable};
use crate::grammar::Grammar;
use crate::rules::Production;
use crate::tree::DerivationTree;

/// One quantifier-free SMT atom plus the tree substitutions already bound
/// for some of its variables (mirrors `isla.SMTFormula.substitutions`).
/// A variable mentioned by `expr` but absent from `substitutions` is free
/// and must be solved for.
#[derive(Debug, Clone)]
pub struct Atom {
  pub expr: SmtExpr,
  pub substitutions: HashMap<Rc<str>, DerivationTree>,
}

impl Atom {
  fn free_variables(&self) -> Vec<Rc<str>> {
    let mut vars = Vec::new();
    self.expr.free_variables(&mut vars);
    vars.retain(|v| !self.substitutions.contains_key(v));
    vars
  }
}

/// A value Z3 assigned to a free variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Solution {
  Str(String),
  Int(i64),
}

/// Groups atom indices into clusters that share at least one free
/// variable (transitively), or whose tree substitutions overlap — cover
/// the same node, or stand in an ancestor/descendant relationship —
/// so each cluster can be given to Z3 on its own rather than asserting
/// every atom in the formula at once. Merging on substitutions too is
/// required, not an optimization: two atoms can mention disjoint free
/// variables yet both constrain overlapping tree regions through their
/// substitutions, and solving them in separate clusters can produce
/// contradictory witnesses for that shared region.
pub fn cluster_by_shared_variables(atoms: &[Atom]) -> Vec<Vec<usize>> {
  let mut parent: Vec<usize> = (0..atoms.len()).collect();

  fn find(parent: &mut [usize], x: usize) -> usize {
    if parent[x] != x {
      parent[x] = find(parent, parent[x]);
    }
    parent[x]
  }

  fn union(parent: &mut [usize], a: usize, b: usize) {
    let (ra, rb) = (find(parent, a), find(parent, b));
    if ra != rb {
      parent[ra] = rb;
    }
  }

  let mut owner: HashMap<Rc<str>, usize> = HashMap::new();
  for (i, atom) in atoms.iter().enumerate() {
    for v in atom.free_variables() {
      match owner.get(&v) {
        Some(&j) => union(&mut parent, i, j),
        None => {
          owner.insert(v, i);
        }
      }
    }
  }

  for i in 0..atoms.len() {
    for j in (i + 1)..atoms.len() {
      if substitutions_overlap(&atoms[i].substitutions, &atoms[j].substitutions) {
        union(&mut parent, i, j);
      }
    }
  }

  let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
  for i in 0..atoms.len() {
    let root = find(&mut parent, i);
    groups.entry(root).or_default().push(i);
  }
  groups.into_values().collect()
}

/// True if some substitution tree in `a` shares a node with, or is an
/// ancestor/descendant of, some substitution tree in `b`.
fn substitutions_overlap(a: &HashMap<Rc<str>, DerivationTree>, b: &HashMap<Rc<str>, DerivationTree>) -> bool {
  a.values().any(|ta| b.values().any(|tb| ta.id() == tb.id() || ta.find_node(tb.id()).is_some() || tb.find_node(ta.id()).is_some()))
}

/// Builds a regular over-approximation of `nt`'s language directly as a
/// Z3 regex AST, the same recursive shape as `Grammar::extract_regex` but
/// targeting Z3 combinators instead of the `regex` crate's syntax (the
/// two dialects aren't compatible, so this can't just reuse the string
/// pattern `extract_regex` produces).
fn z3_regex_for<'ctx>(ctx: &'ctx Context, grammar: &Grammar, nt: &str, seen: &mut HashSet<String>) -> Option<Z3Regex<'ctx>> {
  if !seen.insert(nt.to_string()) {
    return None;
  }
  let rules = grammar.rules_for(nt);
  if rules.is_empty() {
    return None;
  }

  let mut alternatives = Vec::with_capacity(rules.len());
  for rule in rules {
    let mut pieces = Vec::with_capacity(rule.len());
    for p in &rule.productions {
      match p {
        Production::Terminal(s) => pieces.push(Z3Regex::literal(ctx, s)),
        Production::Nonterminal(s) => pieces.push(z3_regex_for(ctx, grammar, &s.name, seen)?),
      }
    }
    alternatives.push(match pieces.len() {
      1 => pieces.into_iter().next().unwrap(),
      _ => {
        let refs: Vec<&Z3Regex> = pieces.iter().collect();
        Z3Regex::concat(ctx, &refs)
      }
    });
  }
  seen.remove(nt);

  Some(match alternatives.len() {
    1 => alternatives.into_iter().next().unwrap(),
    _ => {
      let refs: Vec<&Z3Regex> = alternatives.iter().collect();
      Z3Regex::union(ctx, &refs)
    }
  })
}

fn lower<'ctx>(
  ctx: &'ctx Context,
  expr: &SmtExpr,
  subst: &HashMap<Rc<str>, DerivationTree>,
  free: &HashMap<Rc<str>, Dynamic<'ctx>>,
  grammar: &Grammar,
) -> Dynamic<'ctx> {
  match expr {
    SmtExpr::Var(name) => {
      if let Some(tree) = subst.get(name) {
        Dynamic::from_ast(&Z3String::from_str(ctx, &tree.unparse()))
      } else if let Some(d) = free.get(name) {
        d.clone()
      } else {
        Dynamic::from_ast(&Z3String::new_const(ctx, name.as_ref()))
      }
    }
    SmtExpr::StrLit(s) => Dynamic::from_ast(&Z3String::from_str(ctx, s)),
    SmtExpr::IntLit(n) => Dynamic::from_ast(&Int::from_i64(ctx, *n)),
    SmtExpr::Not(inner) => {
      let i = lower(ctx, inner, subst, free, grammar);
      Dynamic::from_ast(&i.as_bool().expect("Not expects a boolean operand").not())
    }
    SmtExpr::Eq(l, r) => {
      let l = lower(ctx, l, subst, free, grammar);
      let r = lower(ctx, r, subst, free, grammar);
      Dynamic::from_ast(&l._eq(&r))
    }
    SmtExpr::StrLen(inner) => {
      let s = lower(ctx, inner, subst, free, grammar).as_string().expect("StrLen expects a string operand");
      Dynamic::from_ast(&s.length())
    }
    SmtExpr::StrToInt(inner) => {
      let s = lower(ctx, inner, subst, free, grammar).as_string().expect("StrToInt expects a string operand");
      Dynamic::from_ast(&s.to_int())
    }
    SmtExpr::StrConcat(l, r) => {
      let l = lower(ctx, l, subst, free, grammar).as_string().expect("StrConcat expects string operands");
      let r = lower(ctx, r, subst, free, grammar).as_string().expect("StrConcat expects string operands");
      Dynamic::from_ast(&Z3String::concat(ctx, &[&l, &r]))
    }
    SmtExpr::Lt(l, r) => {
      let l = lower(ctx, l, subst, free, grammar).as_int().expect("Lt expects int operands");
      let r = lower(ctx, r, subst, free, grammar).as_int().expect("Lt expects int operands");
      Dynamic::from_ast(&l.lt(&r))
    }
    SmtExpr::Le(l, r) => {
      let l = lower(ctx, l, subst, free, grammar).as_int().expect("Le expects int operands");
      let r = lower(ctx, r, subst, free, grammar).as_int().expect("Le expects int operands");
      Dynamic::from_ast(&l.le(&r))
    }
    SmtExpr::Add(l, r) => {
      let l = lower(ctx, l, subst, free, grammar).as_int().expect("Add expects int operands");
      let r = lower(ctx, r, subst, free, grammar).as_int().expect("Add expects int operands");
      Dynamic::from_ast(&Int::add(ctx, &[&l, &r]))
    }
    SmtExpr::And(es) => {
      let bools: Vec<Bool> = es.iter().map(|e| lower(ctx, e, subst, free, grammar).as_bool().expect("And expects boolean operands")).collect();
      let refs: Vec<&Bool> = bools.iter().collect();
      Dynamic::from_ast(&Bool::and(ctx, &refs))
    }
    SmtExpr::Or(es) => {
      let bools: Vec<Bool> = es.iter().map(|e| lower(ctx, e, subst, free, grammar).as_bool().expect("Or expects boolean operands")).collect();
      let refs: Vec<&Bool> = bools.iter().collect();
      Dynamic::from_ast(&Bool::or(ctx, &refs))
    }
    SmtExpr::RegexMatch(inner, nt) => {
      let s = lower(ctx, inner, subst, free, grammar).as_string().expect("RegexMatch expects a string operand");
      let mut seen = HashSet::new();
      match z3_regex_for(ctx, grammar, nt, &mut seen) {
        Some(re) => Dynamic::from_ast(&s.regex_matches(&re)),
        None => {
          tracing::debug!(nonterminal = %nt, "no regular abstraction for this nonterminal; regex atom is unsatisfiable");
          Dynamic::from_ast(&Bool::from_bool(ctx, false))
        }
      }
    }
  }
}

/// Solves one cluster of atoms, returning up to `max_solutions` distinct
/// assignments to `free_vars`. Each solution blocks its own joint
/// assignment before the next `check()`, so repeated calls enumerate
/// genuinely different witnesses rather than the same one.
pub fn solve_cluster(grammar: &Grammar, atoms: &[Atom], free_vars: &[Variable], max_solutions: usize) -> Result<Vec<HashMap<Rc<str>, Solution>>> {
  let mut cfg = Config::new();
  cfg.set_param_value("timeout", "10000");
  let ctx = Context::new(&cfg);
  let solver = Z3Solver::new(&ctx);

  let mut free: HashMap<Rc<str>, Dynamic> = HashMap::new();
  for v in free_vars {
    match v.ty {
      VarType::Numeric => {
        free.insert(v.name.clone(), Dynamic::from_ast(&Int::new_const(&ctx, v.name.as_ref())));
      }
      VarType::Nonterminal => {
        let s = Z3String::new_const(&ctx, v.name.as_ref());
        if let Some(nt) = &v.nonterminal {
          let mut seen = HashSet::new();
          match z3_regex_for(&ctx, grammar, nt, &mut seen) {
            Some(re) => solver.assert(&s.regex_matches(&re)),
            None => tracing::debug!(nonterminal = %nt, "solving unconstrained, no regular abstraction available"),
          }
        }
        free.insert(v.name.clone(), Dynamic::from_ast(&s));
      }
    }
  }

  for atom in atoms {
    let lowered = lower(&ctx, &atom.expr, &atom.substitutions, &free, grammar);
    let assertion = lowered.as_bool().ok_or_else(|| Error::Semantic)?;
    solver.assert(&assertion);
  }

  let mut solutions = Vec::new();
  for _ in 0..max_solutions {
    match solver.check() {
      SatResult::Unsat => break,
      SatResult::Unknown => return Err(Error::Unknown("z3 returned unknown for an smt cluster".into())),
      SatResult::Sat => {
        let model = solver.get_model().expect("a sat result always has a model");
        let mut solution = HashMap::new();
        let mut equalities = Vec::new();

        for v in free_vars {
          let d = &free[&v.name];
          match v.ty {
            VarType::Numeric => {
              let as_int = d.as_int().expect("numeric variable lowered to a non-int sort");
              let val = model
                .eval(&as_int, true)
                .and_then(|i| i.as_i64())
                .ok_or_else(|| Error::Unknown("model left an integer variable unassigned".into()))?;
              equalities.push(as_int._eq(&Int::from_i64(&ctx, val)));
              solution.insert(v.name.clone(), Solution::Int(val));
            }
            VarType::Nonterminal => {
              let as_str = d.as_string().expect("nonterminal variable lowered to a non-string sort");
              let val = model
                .eval(&as_str, true)
                .and_then(|s| s.as_string())
                .ok_or_else(|| Error::Unknown("model left a string variable unassigned".into()))?;
              equalities.push(as_str._eq(&Z3String::from_str(&ctx, &val)));
              solution.insert(v.name.clone(), Solution::Str(val));
            }
          }
        }

        solutions.push(solution);
        let refs: Vec<&Bool> = equalities.iter().collect();
        solver.assert(&Bool::and(&ctx, &refs).not());
      }
    }
  }

  Ok(solutions)
}

/// Decides a fully-substituted (ground) SMT expression: every variable
/// `expr` mentions must have an entry in `substitutions`. Used by
/// [`crate::solver::Solver::check`] to evaluate an `Smt` atom against a
/// concrete parsed tree, where there is nothing left to solve for.
pub fn evaluate_ground(grammar: &Grammar, expr: &SmtExpr, substitutions: &HashMap<Rc<str>, DerivationTree>) -> Result<bool> {
  let cfg = Config::new();
  let ctx = Context::new(&cfg);
  let solver = Z3Solver::new(&ctx);

  let lowered = lower(&ctx, expr, substitutions, &HashMap::new(), grammar);
  let assertion = lowered.as_bool().ok_or(Error::Semantic)?;
  solver.assert(&assertion);

  match solver.check() {
    SatResult::Sat => Ok(true),
    SatResult::Unsat => Ok(false),
    SatResult::Unknown => Err(Error::Unknown("z3 returned unknown evaluating a ground smt atom".into())),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::formula::VarType;

  #[test]
  fn clusters_atoms_by_shared_variable() {
    let atoms = vec![
      Atom { expr: SmtExpr::Eq(Box::new(SmtExpr::Var("x".into())), Box::new(SmtExpr::StrLit("a".into()))), substitutions: HashMap::new() },
      Atom { expr: SmtExpr::Eq(Box::new(SmtExpr::Var("y".into())), Box::new(SmtExpr::StrLit("b".into()))), substitutions: HashMap::new() },
      Atom { expr: SmtExpr::Eq(Box::new(SmtExpr::Var("x".into())), Box::new(SmtExpr::Var("y".into()))), substitutions: HashMap::new() },
    ];
    let clusters = cluster_by_shared_variables(&atoms);
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].len(), 3);
  }

  #[test]
  fn clusters_atoms_sharing_a_tree_substitution_despite_disjoint_variables() {
    let leaf = DerivationTree::leaf("x".to_string());
    let wrapper = DerivationTree::closed("<var>".to_string(), vec![leaf.clone()]);

    let atoms = vec![
      Atom {
        expr: SmtExpr::Eq(Box::new(SmtExpr::Var("a".into())), Box::new(SmtExpr::StrLit("x".into()))),
        substitutions: HashMap::from([(Rc::from("a"), leaf.clone())]),
      },
      Atom {
        expr: SmtExpr::Eq(Box::new(SmtExpr::Var("b".into())), Box::new(SmtExpr::StrLit("x".into()))),
        substitutions: HashMap::from([(Rc::from("b"), wrapper)]),
      },
    ];

    let clusters = cluster_by_shared_variables(&atoms);
    assert_eq!(clusters.len(), 1, "atoms sharing a tree substitution node must land in the same cluster");
    assert_eq!(clusters[0].len(), 2);
  }

  #[test]
  fn solves_a_simple_string_equality() {
    let g: Grammar = "<var> ::= a | b | c;".parse().unwrap();
    let x = Variable { name: "x".into(), nonterminal: Some("<var>".into()), ty: VarType::Nonterminal };
    let atoms = vec![Atom {
      expr: SmtExpr::Eq(Box::new(SmtExpr::Var("x".into())), Box::new(SmtExpr::StrLit("b".into()))),
      substitutions: HashMap::new(),
    }];
    let solutions = solve_cluster(&g, &atoms, &[x], 5).unwrap();
    assert_eq!(solutions.len(), 1);
    assert_eq!(solutions[0][&Rc::from("x")], Solution::Str("b".into()));
  }

  #[test]
  fn enumerates_distinct_solutions_up_to_the_requested_count() {
    let g: Grammar = "<var> ::= a | b | c;".parse().unwrap();
    let x = Variable { name: "x".into(), nonterminal: Some("<var>".into()), ty: VarType::Nonterminal };
    let atoms = vec![];
    let solutions = solve_cluster(&g, &atoms, &[x], 2).unwrap();
    assert_eq!(solutions.len(), 2);
    assert_ne!(solutions[0][&Rc::from("x")], solutions[1][&Rc::from("x")]);
  }
}
