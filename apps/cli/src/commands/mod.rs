//! CLI command implementations.

pub mod hyperparams;
pub mod inspect;
pub mod metrics;
pub mod recipes;
pub mod run;
