//! The cost model (4.H): a weighted geometric mean over six cost
//! components, with the weight vector rotating through phases over the
//! course of a search so the frontier doesn't collapse onto one strategy.
//! Defaults are `isla/solver.py`'s `STD_COST_SETTINGS` (§11).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostWeightVector {
  pub tree_closing_cost: f64,
  pub vacuous_penalty: f64,
  pub constraint_cost: f64,
  pub derivation_depth_penalty: f64,
  pub low_k_coverage_penalty: f64,
  pub low_global_k_path_coverage_penalty: f64,
}

impl Default for CostWeightVector {
  fn default() -> Self {
    Self {
      tree_closing_cost: 11.0,
      vacuous_penalty: 0.0,
      constraint_cost: 3.0,
      derivation_depth_penalty: 5.0,
      low_k_coverage_penalty: 20.0,
      low_global_k_path_coverage_penalty: 10.0,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostSettings {
  pub weight_vectors: Vec<CostWeightVector>,
  pub cost_phase_length: usize,
  pub k: usize,
}

impl Default for CostSettings {
  fn default() -> Self {
    Self { weight_vectors: vec![CostWeightVector::default()], cost_phase_length: 200, k: 3 }
  }
}

impl CostSettings {
  /// Which weight vector governs the phase `states_processed` falls
  /// into, rotating through `weight_vectors` every `cost_phase_length`
  /// states popped off the queue.
  pub fn weight_vector_for(&self, states_processed: usize) -> &CostWeightVector {
    let phase = (states_processed / self.cost_phase_length.max(1)) % self.weight_vectors.len();
    &self.weight_vectors[phase]
  }
}

/// The raw, un-weighted cost components for one candidate state, computed
/// by the solver before scoring (4.H): how many more expansion steps are
/// needed to close every open leaf, whether the constraint is vacuously
/// true, how many unsolved constraint conjuncts remain, how deep the
/// derivation already is, and how far the tree is from covering its
/// local/global k-path targets.
#[derive(Debug, Clone, Copy, Default)]
pub struct CostComponents {
  pub tree_closing_cost: f64,
  pub vacuous_penalty: f64,
  pub constraint_cost: f64,
  pub derivation_depth: f64,
  pub local_k_coverage_deficit: f64,
  pub global_k_coverage_deficit: f64,
}

/// Weighted geometric mean of the six components, each shifted by one so
/// a zero-valued component does not collapse the whole score to zero.
pub fn compute_cost(components: &CostComponents, weights: &CostWeightVector) -> f64 {
  let pairs = [
    (components.tree_closing_cost, weights.tree_closing_cost),
    (components.vacuous_penalty, weights.vacuous_penalty),
    (components.constraint_cost, weights.constraint_cost),
    (components.derivation_depth, weights.derivation_depth_penalty),
    (components.local_k_coverage_deficit, weights.low_k_coverage_penalty),
    (components.global_k_coverage_deficit, weights.low_global_k_path_coverage_penalty),
  ];

  let total_weight: f64 = pairs.iter().map(|(_, w)| w).sum();
  if total_weight <= 0.0 {
    return 0.0;
  }

  let weighted_log_sum: f64 = pairs.iter().map(|(v, w)| w * (v.max(0.0) + 1.0).ln()).sum();
  (weighted_log_sum / total_weight).exp() - 1.0
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn zero_components_score_to_zero() {
    let cost = compute_cost(&CostComponents::default(), &CostWeightVector::default());
    assert!((cost - 0.0).abs() < 1e-9);
  }

  #[test]
  fn higher_tree_closing_cost_scores_higher() {
    let weights = CostWeightVector::default();
    let cheap = compute_cost(&CostComponents { tree_closing_cost: 1.0, ..Default::default() }, &weights);
    let expensive = compute_cost(&CostComponents { tree_closing_cost: 10.0, ..Default::default() }, &weights);
    assert!(expensive > cheap);
  }

  #[test]
  fn phase_rotation_cycles_through_vectors() {
    let settings = CostSettings {
      weight_vectors: vec![
        CostWeightVector { tree_closing_cost: 1.0, ..CostWeightVector::default() },
        CostWeightVector { tree_closing_cost: 2.0, ..CostWeightVector::default() },
      ],
      cost_phase_length: 10,
      k: 3,
    };
    assert_eq!(settings.weight_vector_for(0).tree_closing_cost, 1.0);
    assert_eq!(settings.weight_vector_for(10).tree_closing_cost, 2.0);
    assert_eq!(settings.weight_vector_for(20).tree_closing_cost, 1.0);
  }
}
