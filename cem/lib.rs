#![deny(dead_code)]
#![deny(unused_imports)]

pub mod causal;
pub mod data;
pub mod estimate;
pub mod gaussian;
pub mod model;
pub mod predict;

#[cfg(test)]
mod test_fixtures;

pub use causal::{CausalCell, CausalType};
pub use data::{CemData, DataError};
pub use estimate::{EstimationError, train_model};
pub use model::{
    CemConfig, ConfigError, DegeneratePolicy, GaussianMixtureCem, IteFormula, MixtureParameters,
    ModelError, TrainedModel, UpliftStatistics,
};
pub use predict::CausalPredictions;
