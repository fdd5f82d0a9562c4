//! A thin demo binary over `gramforge`: loads a grammar file and an
//! optional TOML config, and prints the first tree the solver finds for
//! the trivial always-true constraint. Evaluation/fuzzing harnesses over
//! this are an external collaborator's job (§6 Non-goals); this exists
//! so the crate has something runnable to poke at.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use gramforge::{Formula, Grammar, Solver, SolverConfig};

#[derive(Parser)]
#[command(name = "gramforge", about = "Generate a derivation tree from a grammar file")]
struct Args {
  /// Path to a plain-text grammar file (`<nt> ::= alt | alt ;` syntax).
  grammar: PathBuf,

  /// Optional path to a TOML solver configuration.
  #[arg(long)]
  config: Option<PathBuf>,

  /// How many solutions to print.
  #[arg(long, default_value_t = 1)]
  count: usize,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

  let args = Args::parse();

  let grammar_src = fs::read_to_string(&args.grammar).with_context(|| format!("reading {}", args.grammar.display()))?;
  let grammar: Grammar = grammar_src.parse()?;

  let config = match &args.config {
    Some(path) => {
      let s = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
      SolverConfig::from_toml_str(&s)?
    }
    None => SolverConfig::default(),
  };

  let mut solver = Solver::new(grammar, Formula::Bool(true), config)?;

  for tree in solver.solve().take(args.count) {
    println!("{}", tree.unparse());
  }

  Ok(())
}
