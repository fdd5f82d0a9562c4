//! Convenience constructors for building [`Formula`] trees by hand, the
//! way `isla_shortcuts` (`sc.forall`, `sc.true_`, ...) is used throughout
//! `solver.py`'s test suite in place of a surface parser (the parser
//! itself is an external collaborator, §6 Non-goals).

use crate::formula::{Binding, Formula, MatchExpr, SmtExpr, Variable};

pub fn true_() -> Formula {
  Formula::Bool(true)
}

pub fn false_() -> Formula {
  Formula::Bool(false)
}

pub fn and(fs: impl IntoIterator<Item = Formula>) -> Formula {
  Formula::And(fs.into_iter().collect())
}

pub fn or(fs: impl IntoIterator<Item = Formula>) -> Formula {
  Formula::Or(fs.into_iter().collect())
}

pub fn not(f: Formula) -> Formula {
  Formula::Not(Box::new(f))
}

pub fn forall(bound: Variable, in_var: Variable, body: Formula) -> Formula {
  Formula::ForAll { bound, match_expr: None, in_var, already_matched: Vec::new(), body: Box::new(body) }
}

pub fn forall_matching(bound: Variable, nonterminal: impl Into<std::rc::Rc<str>>, in_var: Variable, body: Formula) -> Formula {
  Formula::ForAll {
    bound,
    match_expr: Some(MatchExpr { nonterminal: nonterminal.into() }),
    in_var,
    already_matched: Vec::new(),
    body: Box::new(body),
  }
}

pub fn exists(bound: Variable, in_var: Variable, body: Formula) -> Formula {
  Formula::Exists { bound, match_expr: None, in_var, body: Box::new(body) }
}

pub fn introduce_numeric(bound: Variable, body: Formula) -> Formula {
  Formula::IntroduceNumeric { bound, body: Box::new(body) }
}

pub fn smt(expr: SmtExpr) -> Formula {
  Formula::Smt { expr, substitutions: Default::default() }
}

pub fn structural(name: impl Into<std::rc::Rc<str>>, args: Vec<Binding>) -> Formula {
  Formula::Structural { name: name.into(), args }
}

pub fn semantic(name: impl Into<std::rc::Rc<str>>, args: Vec<Binding>) -> Formula {
  Formula::Semantic { name: name.into(), args }
}

pub fn var(v: &Variable) -> Binding {
  Binding::Var(v.clone())
}

pub fn str_lit(s: impl Into<String>) -> Binding {
  Binding::StringLiteral(s.into())
}

pub fn int_lit(i: i64) -> Binding {
  Binding::IntLiteral(i)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builds_a_simple_universal_smt_constraint() {
    let x = Variable::nonterminal("x", "<var>");
    let start = Variable::nonterminal("start", "<start>");
    let f = forall(
      x.clone(),
      start,
      smt(SmtExpr::Eq(Box::new(SmtExpr::Var(x.name.clone())), Box::new(SmtExpr::StrLit("a".into())))),
    );
    match f {
      Formula::ForAll { .. } => {}
      _ => panic!("expected ForAll"),
    }
  }
}
