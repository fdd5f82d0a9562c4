use thiserror::Error;

/// The error kinds produced by this crate.
///
/// `Syntax` and `Semantic` mirror the two ways an input can fail to belong
/// to the language the solver generates: not parsing at all, or parsing
/// but violating the constraint. `Unknown` covers a semantic predicate or
/// SMT query that refuses to decide. `Timeout` and `Exhaustion` are the
/// two ways a generation run can end without (more) output.
#[derive(Debug, Error)]
pub enum Error {
  #[error("input does not parse against the grammar: {0}")]
  Syntax(String),

  #[error("input parses but violates the constraint")]
  Semantic,

  #[error("result is unknown: {0}")]
  Unknown(String),

  #[error("generation timed out after {0}s")]
  Timeout(u64),

  /// `proved_unsat` distinguishes a search that proved the constraint
  /// has no solutions from one that merely ran out of queue budget.
  #[error("search exhausted (proved_unsat = {proved_unsat})")]
  Exhaustion { proved_unsat: bool },

  #[error("invalid grammar: {0}")]
  Grammar(String),

  #[error("invalid configuration: {0}")]
  Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
