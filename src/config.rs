//! Solver configuration: every knob `isla/solver.py`'s
//! `ISLaSolver.__init__` exposes as a keyword argument, collected into one
//! `serde`-derived struct loadable from TOML.

use serde::{Deserialize, Serialize};

use crate::cost::CostSettings;
use crate::error::{Error, Result};
use crate::insertion::InsertionMethod;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
  /// How many trees the free-instantiation fuzzer produces per branch
  /// before the solver gives up on that branch (§4.G step h).
  pub max_number_free_instantiations: usize,
  /// How many distinct solutions an SMT cluster is asked to enumerate.
  pub max_number_smt_instantiations: usize,
  /// How many tree-insertion candidates (4.E) survive the cost-sorted
  /// truncation per existential elimination.
  pub max_number_tree_insertion_results: usize,
  /// Whether the search queue deduplicates states whose trees are
  /// structurally identical (`DerivationTree::structural_hash`).
  pub enforce_unique_trees_in_queue: bool,
  /// Whether `GrammarGraph::build` eagerly computes all-pairs
  /// reachability up front instead of lazily per query.
  pub precompute_reachability: bool,
  /// Wall-clock budget for one `solve()` run; `0` means unbounded.
  pub timeout_seconds: u64,
  pub cost_settings: CostSettings,
  pub tree_insertion_methods: Vec<InsertionMethod>,
  /// Whether the solver tracks and reports that it has proven a
  /// constraint unsatisfiable (as opposed to merely exhausting its
  /// queue budget), distinguishing `Error::Exhaustion`'s two cases.
  pub activate_unsat_support: bool,
}

impl Default for SolverConfig {
  fn default() -> Self {
    Self {
      max_number_free_instantiations: 10,
      max_number_smt_instantiations: 10,
      max_number_tree_insertion_results: 5,
      enforce_unique_trees_in_queue: true,
      precompute_reachability: false,
      timeout_seconds: 0,
      cost_settings: CostSettings::default(),
      tree_insertion_methods: InsertionMethod::all(),
      activate_unsat_support: false,
    }
  }
}

impl SolverConfig {
  pub fn from_toml_str(s: &str) -> Result<Self> {
    toml::from_str(s).map_err(|e| Error::Config(e.to_string()))
  }

  pub fn to_toml_string(&self) -> Result<String> {
    toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_config_round_trips_through_toml() {
    let config = SolverConfig::default();
    let s = config.to_toml_string().unwrap();
    let parsed = SolverConfig::from_toml_str(&s).unwrap();
    assert_eq!(parsed.max_number_free_instantiations, config.max_number_free_instantiations);
    assert_eq!(parsed.tree_insertion_methods.len(), config.tree_insertion_methods.len());
  }

  #[test]
  fn partial_toml_falls_back_to_defaults() {
    let config = SolverConfig::from_toml_str("timeout_seconds = 30\n").unwrap();
    assert_eq!(config.timeout_seconds, 30);
    assert_eq!(config.max_number_free_instantiations, SolverConfig::default().max_number_free_instantiations);
  }

  #[test]
  fn rejects_malformed_toml() {
    assert!(matches!(SolverConfig::from_toml_str("not valid toml = [").unwrap_err(), Error::Config(_)));
  }

  #[test]
  fn loads_a_config_written_to_a_file() {
    use std::io::Write;

    let mut config = SolverConfig::default();
    config.timeout_seconds = 45;
    config.max_number_tree_insertion_results = 7;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", config.to_toml_string().unwrap()).unwrap();

    let contents = std::fs::read_to_string(file.path()).unwrap();
    let loaded = SolverConfig::from_toml_str(&contents).unwrap();
    assert_eq!(loaded.timeout_seconds, 45);
    assert_eq!(loaded.max_number_tree_insertion_results, 7);
  }
}
