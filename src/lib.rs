//! `gramforge`: constraint-driven grammar-based test input generation.
//! Builds a derivation tree for a context-free grammar that satisfies a
//! first-order constraint formula over its sub-derivations, mixing
//! Earley parsing, an SMT bridge and a cost-guided search the way
//! `isla`'s solver does, but as a from-scratch Rust crate rather than a
//! binding to it.

#[macro_use]
extern crate lazy_static;

pub mod config;
pub mod cost;
pub mod earley;
pub mod error;
pub mod forest;
pub mod formula;
pub mod fuzzer;
pub mod grammar;
pub mod graph;
pub mod insertion;
pub mod matcher;
pub mod predicates;
pub mod rules;
pub mod shortcuts;
pub mod smt;
pub mod solver;
pub mod tree;
pub mod utils;

pub use config::SolverConfig;
pub use error::{Error, Result};
pub use formula::Formula;
pub use grammar::Grammar;
pub use solver::{GeneratorIter, Solver, SolutionState};
pub use tree::DerivationTree;
