//! The constraint language (4.B): variables, SMT atoms and the formula
//! AST quantifiers/connectives are built from. Formulas are constructed
//! programmatically (the surface syntax parser is an external
//! collaborator, §6 Non-goals) through the [`crate::shortcuts`] helpers.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::tree::{DerivationTree, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarType {
  Nonterminal,
  Numeric,
}

/// The name reserved for the one free constant standing for the entire
/// derivation tree being solved for (spec's `top_constant`), typed as
/// the grammar's start nonterminal.
pub const TOP_CONSTANT: &str = "top";

pub fn top_constant(start_nonterminal: impl Into<Rc<str>>) -> Variable {
  Variable::nonterminal(TOP_CONSTANT, start_nonterminal)
}

/// A variable bound by a quantifier, or a free constant fixed to a
/// particular sub-derivation (the top-level constant being solved for).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Variable {
  pub name: Rc<str>,
  pub nonterminal: Option<Rc<str>>,
  pub ty: VarType,
}

impl Variable {
  pub fn nonterminal(name: impl Into<Rc<str>>, nonterminal: impl Into<Rc<str>>) -> Self {
    Self { name: name.into(), nonterminal: Some(nonterminal.into()), ty: VarType::Nonterminal }
  }

  pub fn numeric(name: impl Into<Rc<str>>) -> Self {
    Self { name: name.into(), nonterminal: None, ty: VarType::Numeric }
  }
}

impl fmt::Display for Variable {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.name)
  }
}

/// The value an SMT/structural/semantic predicate argument binds to once
/// a formula is instantiated against a concrete tree.
#[derive(Debug, Clone)]
pub enum Binding {
  Var(Variable),
  Tree(DerivationTree),
  StringLiteral(String),
  IntLiteral(i64),
}

/// An atomic SMT-level expression: the leaves that get lowered to z3 by
/// `crate::smt`.
#[derive(Debug, Clone, PartialEq)]
pub enum SmtExpr {
  Var(Rc<str>),
  StrLit(String),
  IntLit(i64),
  Not(Box<SmtExpr>),
  Eq(Box<SmtExpr>, Box<SmtExpr>),
  StrLen(Box<SmtExpr>),
  StrToInt(Box<SmtExpr>),
  StrConcat(Box<SmtExpr>, Box<SmtExpr>),
  Lt(Box<SmtExpr>, Box<SmtExpr>),
  Le(Box<SmtExpr>, Box<SmtExpr>),
  Add(Box<SmtExpr>, Box<SmtExpr>),
  And(Vec<SmtExpr>),
  Or(Vec<SmtExpr>),
  /// Membership of the operand's string value in the language of the
  /// named nonterminal, lowered by `crate::smt` via a regular
  /// over-approximation of that nonterminal's grammar.
  RegexMatch(Box<SmtExpr>, String),
}

impl SmtExpr {
  /// Every free variable name mentioned, used by the SMT bridge to
  /// cluster atoms that share variables (4.F).
  pub fn free_variables(&self, out: &mut Vec<Rc<str>>) {
    match self {
      Self::Var(v) => out.push(v.clone()),
      Self::StrLit(_) | Self::IntLit(_) => {}
      Self::Not(e) | Self::StrLen(e) | Self::StrToInt(e) => e.free_variables(out),
      Self::Eq(l, r) | Self::StrConcat(l, r) | Self::Lt(l, r) | Self::Le(l, r) | Self::Add(l, r) => {
        l.free_variables(out);
        r.free_variables(out);
      }
      Self::And(es) | Self::Or(es) => {
        for e in es {
          e.free_variables(out);
        }
      }
      Self::RegexMatch(e, _) => e.free_variables(out),
    }
  }
}

/// A match expression used by a quantifier to restrict which
/// sub-derivations satisfy it, e.g. "match the `<lhs>` of an `<assgn>`".
#[derive(Debug, Clone)]
pub struct MatchExpr {
  pub nonterminal: Rc<str>,
}

/// The constraint language's formula AST.
#[derive(Debug, Clone)]
pub enum Formula {
  Bool(bool),
  /// An SMT atom, with each free variable bound either to a quantified
  /// variable or a concrete sub-tree it has been substituted with.
  Smt { expr: SmtExpr, substitutions: HashMap<Rc<str>, DerivationTree> },
  /// A structural predicate (`before`, `after`, `level`, ...) applied to
  /// variables, evaluated purely from tree shape/position.
  Structural { name: Rc<str>, args: Vec<Binding> },
  /// A semantic predicate (`count`, ...) whose evaluation may rewrite
  /// the tree it is given, per 4.B.
  Semantic { name: Rc<str>, args: Vec<Binding> },
  ForAll {
    bound: Variable,
    match_expr: Option<MatchExpr>,
    in_var: Variable,
    /// Node ids of sub-derivations already matched, so repeated matching
    /// passes don't re-bind the same instance (spec.md §3 quantifier
    /// bookkeeping).
    already_matched: Vec<NodeId>,
    body: Box<Formula>,
  },
  Exists {
    bound: Variable,
    match_expr: Option<MatchExpr>,
    in_var: Variable,
    body: Box<Formula>,
  },
  IntroduceNumeric {
    bound: Variable,
    body: Box<Formula>,
  },
  And(Vec<Formula>),
  Or(Vec<Formula>),
  Not(Box<Formula>),
}

impl Formula {
  pub fn is_true(&self) -> bool {
    matches!(self, Self::Bool(true))
  }

  pub fn is_false(&self) -> bool {
    matches!(self, Self::Bool(false))
  }

  /// Every free variable a formula mentions (bound variables of
  /// quantifiers whose scope contains this sub-formula are excluded by
  /// construction since this walks only this formula's own shape).
  pub fn free_variables(&self) -> Vec<Variable> {
    let mut out = Vec::new();
    self.collect_free_variables(&mut out);
    out
  }

  fn collect_free_variables(&self, out: &mut Vec<Variable>) {
    match self {
      Self::Bool(_) => {}
      Self::Smt { .. } => {}
      Self::Structural { args, .. } | Self::Semantic { args, .. } => {
        for a in args {
          if let Binding::Var(v) = a {
            out.push(v.clone());
          }
        }
      }
      Self::ForAll { in_var, body, .. } | Self::Exists { in_var, body, .. } => {
        out.push(in_var.clone());
        body.collect_free_variables(out);
      }
      Self::IntroduceNumeric { body, .. } => body.collect_free_variables(out),
      Self::And(fs) | Self::Or(fs) => {
        for f in fs {
          f.collect_free_variables(out);
        }
      }
      Self::Not(f) => f.collect_free_variables(out),
    }
  }

  /// Splits a top-level conjunction into its conjuncts (a non-`And`
  /// formula is its own single conjunct).
  pub fn split_conjunction(&self) -> Vec<&Formula> {
    match self {
      Self::And(fs) => fs.iter().flat_map(Formula::split_conjunction).collect(),
      other => vec![other],
    }
  }

  pub fn split_disjunction(&self) -> Vec<&Formula> {
    match self {
      Self::Or(fs) => fs.iter().flat_map(Formula::split_disjunction).collect(),
      other => vec![other],
    }
  }

  /// Negation-normal form: pushes `Not` down to the leaves.
  pub fn to_nnf(&self) -> Formula {
    match self {
      Self::Not(inner) => match inner.as_ref() {
        Self::Bool(b) => Formula::Bool(!b),
        Self::Not(f) => f.to_nnf(),
        Self::And(fs) => Formula::Or(fs.iter().map(|f| Formula::Not(Box::new(f.clone())).to_nnf()).collect()),
        Self::Or(fs) => Formula::And(fs.iter().map(|f| Formula::Not(Box::new(f.clone())).to_nnf()).collect()),
        other => Formula::Not(Box::new(other.clone())),
      },
      Self::And(fs) => Formula::And(fs.iter().map(Formula::to_nnf).collect()),
      Self::Or(fs) => Formula::Or(fs.iter().map(Formula::to_nnf).collect()),
      other => other.clone(),
    }
  }

  /// Disjunctive normal form, distributing `And` over `Or`. The solver
  /// processes each disjunct of the result as an independent
  /// [`crate::solver::SolutionState`].
  pub fn to_dnf(&self) -> Vec<Formula> {
    match self.to_nnf() {
      Self::Or(fs) => fs.into_iter().flat_map(|f| f.to_dnf()).collect(),
      Self::And(fs) => {
        let per_conjunct: Vec<Vec<Formula>> = fs.iter().map(|f| f.to_dnf()).collect();
        crate::utils::combinations(&per_conjunct).into_iter().map(Formula::And).collect()
      }
      other => vec![other],
    }
  }

  /// Rewrites bound-variable names so that no two quantifiers in the
  /// whole formula share a name, letting the matcher (4.D) bind variables
  /// without risk of shadowing.
  pub fn ensure_unique_bound_variables(&self) -> Formula {
    let mut counter = 0usize;
    self.rename_bound(&mut counter)
  }

  fn rename_bound(&self, counter: &mut usize) -> Formula {
    match self {
      Self::ForAll { bound, match_expr, in_var, already_matched, body } => {
        *counter += 1;
        let fresh = Variable { name: format!("{}~{}", bound.name, counter).into(), ..bound.clone() };
        let renamed_body = substitute_variable(&body.rename_bound(counter), bound, &fresh);
        Formula::ForAll {
          bound: fresh,
          match_expr: match_expr.clone(),
          in_var: in_var.clone(),
          already_matched: already_matched.clone(),
          body: Box::new(renamed_body),
        }
      }
      Self::Exists { bound, match_expr, in_var, body } => {
        *counter += 1;
        let fresh = Variable { name: format!("{}~{}", bound.name, counter).into(), ..bound.clone() };
        let renamed_body = substitute_variable(&body.rename_bound(counter), bound, &fresh);
        Formula::Exists { bound: fresh, match_expr: match_expr.clone(), in_var: in_var.clone(), body: Box::new(renamed_body) }
      }
      Self::IntroduceNumeric { bound, body } => {
        *counter += 1;
        let fresh = Variable { name: format!("{}~{}", bound.name, counter).into(), ..bound.clone() };
        let renamed_body = substitute_variable(&body.rename_bound(counter), bound, &fresh);
        Formula::IntroduceNumeric { bound: fresh, body: Box::new(renamed_body) }
      }
      Self::And(fs) => Formula::And(fs.iter().map(|f| f.rename_bound(counter)).collect()),
      Self::Or(fs) => Formula::Or(fs.iter().map(|f| f.rename_bound(counter)).collect()),
      Self::Not(f) => Formula::Not(Box::new(f.rename_bound(counter))),
      other => other.clone(),
    }
  }

  /// Replaces every occurrence of `old` with `new` (by [`NodeId`]) in any
  /// tree substitution this formula or its sub-formulas carry, used when
  /// a quantified variable gets bound to a concrete sub-derivation.
  pub fn substitute_expressions(&self, var: &Variable, tree: &DerivationTree) -> Formula {
    match self {
      Self::Smt { expr, substitutions } => {
        let mut substitutions = substitutions.clone();
        substitutions.insert(var.name.clone(), tree.clone());
        Formula::Smt { expr: expr.clone(), substitutions }
      }
      Self::Structural { name, args } => {
        Formula::Structural { name: name.clone(), args: substitute_args(args, var, tree) }
      }
      Self::Semantic { name, args } => {
        Formula::Semantic { name: name.clone(), args: substitute_args(args, var, tree) }
      }
      Self::ForAll { bound, match_expr, in_var, already_matched, body } => Formula::ForAll {
        bound: bound.clone(),
        match_expr: match_expr.clone(),
        in_var: in_var.clone(),
        already_matched: already_matched.clone(),
        body: Box::new(body.substitute_expressions(var, tree)),
      },
      Self::Exists { bound, match_expr, in_var, body } => Formula::Exists {
        bound: bound.clone(),
        match_expr: match_expr.clone(),
        in_var: in_var.clone(),
        body: Box::new(body.substitute_expressions(var, tree)),
      },
      Self::IntroduceNumeric { bound, body } => {
        Formula::IntroduceNumeric { bound: bound.clone(), body: Box::new(body.substitute_expressions(var, tree)) }
      }
      Self::And(fs) => Formula::And(fs.iter().map(|f| f.substitute_expressions(var, tree)).collect()),
      Self::Or(fs) => Formula::Or(fs.iter().map(|f| f.substitute_expressions(var, tree)).collect()),
      Self::Not(f) => Formula::Not(Box::new(f.substitute_expressions(var, tree))),
      Self::Bool(b) => Formula::Bool(*b),
    }
  }

  /// Renames every free occurrence of `old` to `new` throughout the
  /// formula, including `in_var` references of nested quantifiers. Used
  /// by the solver to give a freshly introduced numeric constant
  /// (4.G step b) the name `IntroduceNumeric` reserved for its binder.
  pub fn substitute_bound_variable(&self, old: &Variable, new: &Variable) -> Formula {
    substitute_variable(self, old, new)
  }

  /// Replaces every sub-formula equal to `target` with `replacement`;
  /// used by the solver when a quantifier instantiation needs to swap one
  /// conjunct for its evaluated result.
  pub fn replace_subformula(&self, target_ptr: *const Formula, replacement: Formula) -> Formula {
    if std::ptr::eq(self, target_ptr) {
      return replacement;
    }
    match self {
      Self::And(fs) => Formula::And(fs.iter().map(|f| f.replace_subformula(target_ptr, replacement.clone())).collect()),
      Self::Or(fs) => Formula::Or(fs.iter().map(|f| f.replace_subformula(target_ptr, replacement.clone())).collect()),
      Self::Not(f) => Formula::Not(Box::new(f.replace_subformula(target_ptr, replacement))),
      other => other.clone(),
    }
  }
}

fn substitute_args(args: &[Binding], var: &Variable, tree: &DerivationTree) -> Vec<Binding> {
  args
    .iter()
    .map(|a| match a {
      Binding::Var(v) if v == var => Binding::Tree(tree.clone()),
      other => other.clone(),
    })
    .collect()
}

fn substitute_variable(formula: &Formula, old: &Variable, new: &Variable) -> Formula {
  match formula {
    Formula::Structural { name, args } => {
      Formula::Structural { name: name.clone(), args: rename_args(args, old, new) }
    }
    Formula::Semantic { name, args } => {
      Formula::Semantic { name: name.clone(), args: rename_args(args, old, new) }
    }
    Formula::ForAll { bound, match_expr, in_var, already_matched, body } => Formula::ForAll {
      bound: bound.clone(),
      match_expr: match_expr.clone(),
      in_var: if in_var == old { new.clone() } else { in_var.clone() },
      already_matched: already_matched.clone(),
      body: Box::new(substitute_variable(body, old, new)),
    },
    Formula::Exists { bound, match_expr, in_var, body } => Formula::Exists {
      bound: bound.clone(),
      match_expr: match_expr.clone(),
      in_var: if in_var == old { new.clone() } else { in_var.clone() },
      body: Box::new(substitute_variable(body, old, new)),
    },
    Formula::IntroduceNumeric { bound, body } => {
      Formula::IntroduceNumeric { bound: bound.clone(), body: Box::new(substitute_variable(body, old, new)) }
    }
    Formula::And(fs) => Formula::And(fs.iter().map(|f| substitute_variable(f, old, new)).collect()),
    Formula::Or(fs) => Formula::Or(fs.iter().map(|f| substitute_variable(f, old, new)).collect()),
    Formula::Not(f) => Formula::Not(Box::new(substitute_variable(f, old, new))),
    other => other.clone(),
  }
}

fn rename_args(args: &[Binding], old: &Variable, new: &Variable) -> Vec<Binding> {
  args
    .iter()
    .map(|a| match a {
      Binding::Var(v) if v == old => Binding::Var(new.clone()),
      other => other.clone(),
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn split_conjunction_flattens_nested_ands() {
    let f = Formula::And(vec![Formula::Bool(true), Formula::And(vec![Formula::Bool(false), Formula::Bool(true)])]);
    assert_eq!(f.split_conjunction().len(), 3);
  }

  #[test]
  fn to_nnf_pushes_not_through_and() {
    let f = Formula::Not(Box::new(Formula::And(vec![Formula::Bool(true), Formula::Bool(false)])));
    let nnf = f.to_nnf();
    match nnf {
      Formula::Or(fs) => {
        assert_eq!(fs.len(), 2);
        assert!(fs[0].is_false());
        assert!(fs[1].is_true());
      }
      _ => panic!("expected Or after pushing Not through And"),
    }
  }

  #[test]
  fn to_dnf_distributes_and_over_or() {
    let f = Formula::And(vec![
      Formula::Or(vec![Formula::Bool(true), Formula::Bool(false)]),
      Formula::Bool(true),
    ]);
    assert_eq!(f.to_dnf().len(), 2);
  }

  #[test]
  fn ensure_unique_bound_variables_renames_nested_quantifiers() {
    let inner = Variable::nonterminal("x", "<a>");
    let outer_in = Variable::nonterminal("root", "<start>");
    let f = Formula::ForAll {
      bound: inner.clone(),
      match_expr: None,
      in_var: outer_in.clone(),
      already_matched: vec![],
      body: Box::new(Formula::ForAll {
        bound: Variable::nonterminal("x", "<a>"),
        match_expr: None,
        in_var: inner.clone(),
        already_matched: vec![],
        body: Box::new(Formula::Bool(true)),
      }),
    };
    let renamed = f.ensure_unique_bound_variables();
    if let Formula::ForAll { bound: outer_bound, body, .. } = renamed {
      if let Formula::ForAll { bound: inner_bound, in_var, .. } = body.as_ref() {
        // the two quantifiers' bound variables must now be distinct...
        assert_ne!(outer_bound.name, inner_bound.name);
        // ...but the inner quantifier's `in_var` reference to the outer
        // variable must have been renamed right along with it.
        assert_eq!(outer_bound.name, in_var.name);
      } else {
        panic!("expected nested ForAll");
      }
    } else {
      panic!("expected ForAll");
    }
  }
}
