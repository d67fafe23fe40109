use crate::causal::{CausalType, NUM_TYPES};
use crate::data::{self, DataError};
use crate::estimate::{self, EstimationError};
use crate::gaussian::GaussianError;
use ndarray::{Array1, Array2};
use polars::prelude::{DataFrame, PolarsError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::time::Duration;
use thiserror::Error;

// --- Public Data Structures ---
// These structs define the public, human-readable format of the trained model
// when serialized to a TOML file.

/// What to do when a causal type's responsibility mass collapses to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DegeneratePolicy {
    /// Keep the near-zero weight and carry the previous mean and covariance forward.
    #[default]
    Tolerate,
    /// Abort the fit with `EstimationError::DegenerateClass`.
    Error,
}

/// How posterior type probabilities are turned into an individual treatment effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IteFormula {
    /// `2 * (pT * (t0 + t2) - pC * (t2 + t3))`, scaled by the training arms' outcome rates.
    #[default]
    Proportional,
    /// `t0 - t3`: responder probability minus anti-responder probability.
    TypeDifference,
}

/// Hyperparameters of the causal EM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CemConfig {
    pub max_iterations: usize,
    /// Number of mixture components. The causal structure fixes this at 4.
    pub num_components: usize,
    /// Absolute log-likelihood change below which the loop stops.
    pub convergence_tolerance: f64,
    /// Added to every covariance diagonal after each M-step.
    pub covariance_ridge: f64,
    #[serde(default)]
    pub degenerate_policy: DegeneratePolicy,
    #[serde(default)]
    pub ite_formula: IteFormula,
}

impl Default for CemConfig {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            num_components: NUM_TYPES,
            convergence_tolerance: 1e-6,
            covariance_ridge: 1e-2,
            degenerate_policy: DegeneratePolicy::Tolerate,
            ite_formula: IteFormula::Proportional,
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error(
        "The causal mixture has exactly {expected} components (one per causal type), but {found} were requested."
    )]
    UnsupportedComponentCount { found: usize, expected: usize },
    #[error("max_iterations must be at least 2, got {0}.")]
    TooFewIterations(usize),
    #[error("convergence_tolerance must be finite and non-negative, got {0}.")]
    InvalidTolerance(f64),
    #[error("covariance_ridge must be finite and strictly positive, got {0}.")]
    InvalidRidge(f64),
}

impl CemConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_components != NUM_TYPES {
            return Err(ConfigError::UnsupportedComponentCount {
                found: self.num_components,
                expected: NUM_TYPES,
            });
        }
        if self.max_iterations < 2 {
            return Err(ConfigError::TooFewIterations(self.max_iterations));
        }
        if !self.convergence_tolerance.is_finite() || self.convergence_tolerance < 0.0 {
            return Err(ConfigError::InvalidTolerance(self.convergence_tolerance));
        }
        if !self.covariance_ridge.is_finite() || self.covariance_ridge <= 0.0 {
            return Err(ConfigError::InvalidRidge(self.covariance_ridge));
        }
        Ok(())
    }
}

/// Weights, means and covariances of the four causal components, indexed by
/// [`CausalType::index`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixtureParameters {
    pub weights: [f64; NUM_TYPES],
    pub means: [Array1<f64>; NUM_TYPES],
    pub covariances: [Array2<f64>; NUM_TYPES],
}

impl MixtureParameters {
    pub fn n_predictors(&self) -> usize {
        self.means[0].len()
    }

    pub fn weight(&self, ty: CausalType) -> f64 {
        self.weights[ty.index()]
    }
}

/// Outcome rates per arm over the training set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UpliftStatistics {
    /// P(outcome = 1 | treatment = 1).
    pub treated_outcome_rate: f64,
    /// P(outcome = 1 | treatment = 0).
    pub control_outcome_rate: f64,
}

/// Record of how the EM run went.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitDiagnostics {
    /// Expected complete-data log-likelihood after every iteration.
    pub log_likelihoods: Vec<f64>,
    pub iterations: usize,
    /// Whether the tolerance criterion stopped the loop (as opposed to the iteration cap).
    pub converged: bool,
    pub elapsed: Duration,
    /// Types whose responsibility mass collapsed at some iteration.
    #[serde(default)]
    pub degenerate_types: Vec<CausalType>,
}

/// The top-level, self-contained, trained model artifact.
/// This is the structure that gets saved to and loaded from a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainedModel {
    pub config: CemConfig,
    /// Predictor columns in training order. Prediction must name the same columns in this order.
    pub predictor_names: Vec<String>,
    pub uplift: UpliftStatistics,
    pub diagnostics: FitDiagnostics,
    pub parameters: MixtureParameters,
}

/// Custom error type for model loading, saving, and prediction.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid input data: {0}")]
    Data(#[from] DataError),
    #[error("Failed to attach prediction columns: {0}")]
    Polars(#[from] PolarsError),
    #[error("Density evaluation failed during prediction: {0}")]
    Gaussian(#[from] GaussianError),
    #[error("Model fitting failed: {0}")]
    Estimation(#[from] EstimationError),
    #[error(
        "Prediction data has {found} predictor columns, but the model was trained on {expected}."
    )]
    MismatchedPredictorCount { found: usize, expected: usize },
    #[error("Prediction predictors {found:?} do not match the trained predictors {expected:?}.")]
    MismatchedPredictorNames {
        found: Vec<String>,
        expected: Vec<String>,
    },
    #[error("Treatment vector has {found} entries, but there are {expected} subjects.")]
    MismatchedTreatmentLength { found: usize, expected: usize },
    #[error("The model has not been fitted yet. Call `fit` before `predict`.")]
    NotFitted,
}

impl TrainedModel {
    /// Mixing weights, one per causal type.
    pub fn weights(&self) -> &[f64; NUM_TYPES] {
        &self.parameters.weights
    }

    pub fn log_likelihoods(&self) -> &[f64] {
        &self.diagnostics.log_likelihoods
    }

    pub fn iterations(&self) -> usize {
        self.diagnostics.iterations
    }

    /// Saves the trained model to a file in a human-readable TOML format.
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads a trained model from a TOML file.
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model = toml::from_str(&toml_string)?;
        Ok(model)
    }
}

/// Frame-level estimator: configure, `fit` on a training table, then `predict` on any table.
#[derive(Debug, Clone, Default)]
pub struct GaussianMixtureCem {
    config: CemConfig,
    fitted: Option<TrainedModel>,
}

impl GaussianMixtureCem {
    pub fn new(config: CemConfig) -> Self {
        Self {
            config,
            fitted: None,
        }
    }

    pub fn config(&self) -> &CemConfig {
        &self.config
    }

    /// Fitted state, `None` before the first successful `fit`.
    pub fn model(&self) -> Option<&TrainedModel> {
        self.fitted.as_ref()
    }

    /// Runs the causal EM on `frame`. Requires `treatment`, `outcome` and every predictor column.
    /// A failed fit leaves any previously fitted state untouched.
    pub fn fit<S: AsRef<str>>(
        &mut self,
        frame: &DataFrame,
        predictors: &[S],
    ) -> Result<(), ModelError> {
        let training = data::training_data_from_frame(frame, predictors)?;
        let model = estimate::train_model(&training, &self.config)?;
        self.fitted = Some(model);
        Ok(())
    }

    /// Attaches `ITE`, `groupe`, `typePredict`, `z0..z3` and, when `treatment`
    /// is present, the outcome prediction columns to `frame`.
    pub fn predict<S: AsRef<str>>(
        &self,
        frame: &mut DataFrame,
        predictors: &[S],
    ) -> Result<(), ModelError> {
        let model = self.fitted.as_ref().ok_or(ModelError::NotFitted)?;
        model.predict_frame(frame, predictors)
    }

    /// Same as [`GaussianMixtureCem::predict`].
    pub fn predict_map<S: AsRef<str>>(
        &self,
        frame: &mut DataFrame,
        predictors: &[S],
    ) -> Result<(), ModelError> {
        self.predict(frame, predictors)
    }
}

impl From<TrainedModel> for GaussianMixtureCem {
    fn from(model: TrainedModel) -> Self {
        Self {
            config: model.config.clone(),
            fitted: Some(model),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::SyntheticCausalBuilder;
    use approx::assert_abs_diff_eq;
    use tempfile::NamedTempFile;

    #[test]
    fn default_config_is_valid() {
        let config = CemConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_iterations, 500);
        assert_abs_diff_eq!(config.convergence_tolerance, 1e-6, epsilon = 0.0);
        assert_abs_diff_eq!(config.covariance_ridge, 1e-2, epsilon = 0.0);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let cases = [
            (
                CemConfig {
                    num_components: 3,
                    ..CemConfig::default()
                },
                ConfigError::UnsupportedComponentCount {
                    found: 3,
                    expected: 4,
                },
            ),
            (
                CemConfig {
                    max_iterations: 1,
                    ..CemConfig::default()
                },
                ConfigError::TooFewIterations(1),
            ),
            (
                CemConfig {
                    convergence_tolerance: -1.0,
                    ..CemConfig::default()
                },
                ConfigError::InvalidTolerance(-1.0),
            ),
            (
                CemConfig {
                    covariance_ridge: 0.0,
                    ..CemConfig::default()
                },
                ConfigError::InvalidRidge(0.0),
            ),
        ];
        for (config, expected) in cases {
            assert_eq!(config.validate().unwrap_err(), expected);
        }
    }

    #[test]
    fn predict_before_fit_is_an_error() {
        let estimator = GaussianMixtureCem::default();
        let mut df = SyntheticCausalBuilder::new(8).build().to_frame();
        assert!(matches!(
            estimator.predict(&mut df, &["x1", "x2"]),
            Err(ModelError::NotFitted)
        ));
    }

    #[test]
    fn save_and_load_round_trip() {
        let data = SyntheticCausalBuilder::new(80).build().to_cem_data();
        let config = CemConfig {
            max_iterations: 20,
            ..CemConfig::default()
        };
        let model = estimate::train_model(&data, &config).unwrap();

        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        model.save(path).unwrap();
        let loaded = TrainedModel::load(path).unwrap();

        assert_eq!(loaded.config, model.config);
        assert_eq!(loaded.predictor_names, model.predictor_names);
        assert_eq!(loaded.diagnostics.iterations, model.diagnostics.iterations);
        for ty in CausalType::ALL {
            let j = ty.index();
            assert_abs_diff_eq!(loaded.weights()[j], model.weights()[j], epsilon = 1e-12);
            for (a, b) in loaded.parameters.means[j]
                .iter()
                .zip(model.parameters.means[j].iter())
            {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
            }
            for (a, b) in loaded.parameters.covariances[j]
                .iter()
                .zip(model.parameters.covariances[j].iter())
            {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
            }
        }
        assert_abs_diff_eq!(
            loaded.uplift.treated_outcome_rate,
            model.uplift.treated_outcome_rate,
            epsilon = 1e-12
        );
    }
}
