use criterion::{black_box, criterion_group, criterion_main, Criterion};

use gramforge::formula::{top_constant, SmtExpr};
use gramforge::{Formula, Grammar, Solver, SolverConfig};

const GRAMMAR_SRC: &str = "<start> ::= <word>; <word> ::= <word><letter> | <letter>; <letter> ::= a | b | c | d | e;";

fn first_solution(grammar: Grammar, constraint: Formula) -> usize {
  let mut solver = Solver::new(grammar, constraint, SolverConfig::default()).unwrap();
  solver.solve().next().map(|t| t.unparse().len()).unwrap_or(0)
}

fn criterion_benchmark(c: &mut Criterion) {
  let grammar: Grammar = GRAMMAR_SRC.parse().unwrap();
  let top = top_constant(grammar.start.clone());

  c.bench_function("solve unconstrained", |b| {
    b.iter(|| first_solution(black_box(grammar.clone()), black_box(Formula::Bool(true))))
  });

  c.bench_function("solve single smt atom", |b| {
    let constraint = Formula::Smt {
      expr: SmtExpr::Eq(Box::new(SmtExpr::StrLen(Box::new(SmtExpr::Var(top.name.clone())))), Box::new(SmtExpr::IntLit(3))),
      substitutions: Default::default(),
    };
    b.iter(|| first_solution(black_box(grammar.clone()), black_box(constraint.clone())))
  });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
