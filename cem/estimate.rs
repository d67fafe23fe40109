//! # Causal Expectation-Maximization
//!
//! Fits the four-type Gaussian mixture. Each iteration:
//!
//! 1.  **E-step:** log of `pi_j * N(x_i; mu_j, Sigma_j)` for every subject and
//!     type, from the previous M-step. The first iteration uses a flat 0.5
//!     per type instead.
//! 2.  **Causal mask:** only the two types admissible for the subject's
//!     observed `(treatment, outcome)` cell keep their mass (see
//!     [`crate::causal::ADMISSIBLE_TYPES`]); the pair is renormalized to one.
//! 3.  **M-step:** weights are column means of the responsibilities; means
//!     and covariances are responsibility-weighted moments, with a ridge
//!     added to every covariance diagonal.
//! 4.  **Log-likelihood:** `sum_ij t_ij * log(pi_j * N_j(x_i))` under the new
//!     parameters. The loop stops at the iteration cap or when two
//!     consecutive values differ by less than the tolerance.
//!
//! Densities are kept in log space throughout; the normalization of the
//! retained pair is a two-term log-sum-exp.

use crate::causal::{CausalCell, CausalType, NUM_TYPES};
use crate::data::CemData;
use crate::gaussian::{GaussianError, MultivariateNormal, add_ridge, log_sum_exp};
use crate::model::{
    CemConfig, ConfigError, DegeneratePolicy, FitDiagnostics, MixtureParameters, TrainedModel,
    UpliftStatistics,
};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::time::Instant;
use thiserror::Error;

/// Column mass at or below which a type counts as empty.
pub const DEGENERATE_MASS: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Density evaluation failed: {0}")]
    Gaussian(#[from] GaussianError),

    #[error("Training data must contain both 'treatment' and 'outcome'.")]
    MissingCausalColumns,

    #[error(
        "Training data is inconsistent: {predictors} predictor rows, {treatment} treatment values, {outcome} outcome values."
    )]
    InconsistentLengths {
        predictors: usize,
        treatment: usize,
        outcome: usize,
    },

    #[error(
        "The '{causal_type}' component received a total responsibility of {mass:.3e} at iteration {iteration}; its mean and covariance are undefined."
    )]
    DegenerateClass {
        causal_type: CausalType,
        iteration: usize,
        mass: f64,
    },
}

/// Runs the causal EM to convergence or to `config.max_iterations`.
pub fn train_model(data: &CemData, config: &CemConfig) -> Result<TrainedModel, EstimationError> {
    config.validate()?;
    let (treatment, outcome) = match (&data.treatment, &data.outcome) {
        (Some(t), Some(y)) => (t.view(), y.view()),
        _ => return Err(EstimationError::MissingCausalColumns),
    };
    let x = data.predictors.view();
    let (n, p) = x.dim();
    if treatment.len() != n || outcome.len() != n {
        return Err(EstimationError::InconsistentLengths {
            predictors: n,
            treatment: treatment.len(),
            outcome: outcome.len(),
        });
    }
    if n < p + 1 {
        log::warn!(
            "Only {n} subjects for {p} predictors; covariance estimates will lean on the ridge."
        );
    }
    let cells: Vec<CausalCell> = treatment
        .iter()
        .zip(outcome.iter())
        .map(|(&t, &y)| CausalCell::from_codes(t, y))
        .collect();

    log::info!(
        "Starting causal EM: {n} subjects, {p} predictors, at most {} iterations, tolerance {:.1e}.",
        config.max_iterations,
        config.convergence_tolerance
    );
    let start = Instant::now();

    let mut degenerate_types: Vec<CausalType> = Vec::new();
    let mut log_likelihoods: Vec<f64> = Vec::with_capacity(config.max_iterations);
    let mut converged = false;

    let mut state = internal::em_iteration(x, &cells, None, 1, config, &mut degenerate_types)?;
    log_likelihoods.push(state.log_likelihood);
    log::debug!("EM iteration 1: log-likelihood {:.6}", state.log_likelihood);

    while log_likelihoods.len() < config.max_iterations {
        let iteration = log_likelihoods.len() + 1;
        state = internal::em_iteration(
            x,
            &cells,
            Some(&state),
            iteration,
            config,
            &mut degenerate_types,
        )?;
        log_likelihoods.push(state.log_likelihood);
        log::debug!(
            "EM iteration {iteration}: log-likelihood {:.6} (change {:.3e})",
            state.log_likelihood,
            state.log_likelihood - log_likelihoods[iteration - 2]
        );
        if internal::has_converged(&log_likelihoods, config.convergence_tolerance) {
            converged = true;
            break;
        }
    }

    let uplift = internal::uplift_statistics(treatment, outcome);
    let elapsed = start.elapsed();
    let iterations = log_likelihoods.len();

    if converged {
        log::info!(
            "Causal EM converged after {iterations} iterations in {:.3}s. Final log-likelihood {:.6}.",
            elapsed.as_secs_f64(),
            state.log_likelihood
        );
    } else {
        log::warn!(
            "Causal EM stopped at the iteration cap ({iterations}) without meeting the tolerance."
        );
    }
    log::info!(
        "Mixing weights: responder {:.4}, doomed {:.4}, survivor {:.4}, anti-responder {:.4}",
        state.parameters.weights[0],
        state.parameters.weights[1],
        state.parameters.weights[2],
        state.parameters.weights[3]
    );

    Ok(TrainedModel {
        config: config.clone(),
        predictor_names: data.predictor_names.clone(),
        uplift,
        diagnostics: FitDiagnostics {
            log_likelihoods,
            iterations,
            converged,
            elapsed,
            degenerate_types,
        },
        parameters: state.parameters,
    })
}

/// Log of `pi_j * N(x_i; mu_j, Sigma_j)` for every row of `x` and every type. Shape `[n, 4]`.
/// A type with zero weight gets `-inf` throughout.
pub fn log_joint_densities(
    x: ArrayView2<f64>,
    parameters: &MixtureParameters,
) -> Result<Array2<f64>, GaussianError> {
    let mut log_joint = Array2::from_elem((x.nrows(), NUM_TYPES), f64::NEG_INFINITY);
    for ty in CausalType::ALL {
        let j = ty.index();
        let weight = parameters.weights[j];
        if weight <= 0.0 {
            continue;
        }
        let mvn = MultivariateNormal::new(
            parameters.means[j].view(),
            parameters.covariances[j].view(),
        )?;
        let log_pdf = mvn.log_pdf_rows(x)?;
        log_joint
            .column_mut(j)
            .assign(&log_pdf.mapv(|lp| weight.ln() + lp));
    }
    Ok(log_joint)
}

/// Internal module for estimation-specific implementation details.
mod internal {
    use super::*;

    /// Everything one EM iteration produces.
    pub(super) struct EmState {
        pub parameters: MixtureParameters,
        /// Log joint densities under `parameters`; the next E-step starts from these.
        pub log_joint: Array2<f64>,
        pub log_likelihood: f64,
    }

    pub(super) struct MStep {
        pub parameters: MixtureParameters,
        pub degenerate: Vec<(CausalType, f64)>,
    }

    pub(super) fn em_iteration(
        x: ArrayView2<f64>,
        cells: &[CausalCell],
        previous: Option<&EmState>,
        iteration: usize,
        config: &CemConfig,
        degenerate_types: &mut Vec<CausalType>,
    ) -> Result<EmState, EstimationError> {
        let responsibilities = match previous {
            Some(state) => constrained_responsibilities(state.log_joint.view(), cells),
            None => initial_responsibilities(cells),
        };

        let step = m_step(
            x,
            responsibilities.view(),
            previous.map(|s| &s.parameters),
            config.covariance_ridge,
        );
        for &(ty, mass) in &step.degenerate {
            if config.degenerate_policy == DegeneratePolicy::Error {
                return Err(EstimationError::DegenerateClass {
                    causal_type: ty,
                    iteration,
                    mass,
                });
            }
            if !degenerate_types.contains(&ty) {
                log::warn!(
                    "The '{ty}' component has total responsibility {mass:.3e}; keeping its previous mean and covariance."
                );
                degenerate_types.push(ty);
            }
        }

        let log_joint = log_joint_densities(x, &step.parameters)?;
        let log_likelihood = expected_log_likelihood(responsibilities.view(), log_joint.view());

        Ok(EmState {
            parameters: step.parameters,
            log_joint,
            log_likelihood,
        })
    }

    /// Flat 0.5 per type, masked and renormalized.
    pub(super) fn initial_responsibilities(cells: &[CausalCell]) -> Array2<f64> {
        let flat = Array2::from_elem((cells.len(), NUM_TYPES), 0.5_f64.ln());
        constrained_responsibilities(flat.view(), cells)
    }

    /// Keeps only the two admissible types of each row and rescales them to sum to one.
    /// A row whose admissible pair is all `-inf` falls back to 0.5 / 0.5.
    pub(super) fn constrained_responsibilities(
        log_scores: ArrayView2<f64>,
        cells: &[CausalCell],
    ) -> Array2<f64> {
        let mut t = Array2::zeros((cells.len(), NUM_TYPES));
        for (i, (mut row, cell)) in t.rows_mut().into_iter().zip(cells).enumerate() {
            let [a, b] = cell.admissible_types();
            let la = log_scores[[i, a.index()]];
            let lb = log_scores[[i, b.index()]];
            let norm = log_sum_exp([la, lb]);
            if norm.is_finite() {
                row[a.index()] = (la - norm).exp();
                row[b.index()] = (lb - norm).exp();
            } else {
                row[a.index()] = 0.5;
                row[b.index()] = 0.5;
            }
        }
        t
    }

    /// Responsibility-weighted mean and covariance of the rows of `x`, without ridge.
    fn weighted_moments(
        x: ArrayView2<f64>,
        weights: ArrayView1<f64>,
        mass: f64,
    ) -> (Array1<f64>, Array2<f64>) {
        let mean = x.t().dot(&weights) / mass;
        let centered = &x - &mean.view().insert_axis(Axis(0));
        let weighted = &centered * &weights.insert_axis(Axis(1));
        let cov = weighted.t().dot(&centered) / mass;
        // Exact symmetry; the two triangles accumulate in different orders.
        let cov = (&cov + &cov.t()) * 0.5;
        (mean, cov)
    }

    pub(super) fn m_step(
        x: ArrayView2<f64>,
        responsibilities: ArrayView2<f64>,
        previous: Option<&MixtureParameters>,
        ridge: f64,
    ) -> MStep {
        let n = x.nrows() as f64;
        let masses = responsibilities.sum_axis(Axis(0));

        let mut weights = [0.0; NUM_TYPES];
        let mut means: [Array1<f64>; NUM_TYPES] = Default::default();
        let mut covariances: [Array2<f64>; NUM_TYPES] = Default::default();
        let mut degenerate = Vec::new();

        for ty in CausalType::ALL {
            let j = ty.index();
            let mass = masses[j];
            weights[j] = mass / n;

            if mass > DEGENERATE_MASS {
                let (mean, mut cov) = weighted_moments(x, responsibilities.column(j), mass);
                add_ridge(&mut cov, ridge);
                means[j] = mean;
                covariances[j] = cov;
                continue;
            }

            degenerate.push((ty, mass));
            match previous {
                Some(prev) => {
                    means[j] = prev.means[j].clone();
                    covariances[j] = prev.covariances[j].clone();
                }
                None => {
                    let uniform = Array1::ones(x.nrows());
                    let (mean, mut cov) = weighted_moments(x, uniform.view(), n);
                    add_ridge(&mut cov, ridge);
                    means[j] = mean;
                    covariances[j] = cov;
                }
            }
        }

        MStep {
            parameters: MixtureParameters {
                weights,
                means,
                covariances,
            },
            degenerate,
        }
    }

    /// `sum_ij t_ij * log(pi_j * N_j(x_i))`; entries with `t_ij == 0` contribute nothing.
    pub(super) fn expected_log_likelihood(
        responsibilities: ArrayView2<f64>,
        log_joint: ArrayView2<f64>,
    ) -> f64 {
        responsibilities
            .iter()
            .zip(log_joint.iter())
            .filter(|&(&t, _)| t > 0.0)
            .map(|(&t, &lj)| t * lj)
            .sum()
    }

    /// At least two values, the previous one non-zero, and an absolute change below `tolerance`.
    pub(super) fn has_converged(log_likelihoods: &[f64], tolerance: f64) -> bool {
        match log_likelihoods {
            [.., previous, current] => {
                *previous != 0.0 && (current - previous).abs() < tolerance
            }
            _ => false,
        }
    }

    /// Empirical P(outcome = 1 | treatment = 1) and P(outcome = 1 | treatment = 0).
    /// An arm without subjects yields NaN.
    pub(super) fn uplift_statistics(
        treatment: ArrayView1<u8>,
        outcome: ArrayView1<u8>,
    ) -> UpliftStatistics {
        let mut counts = [[0usize; 2]; 2];
        for (&t, &y) in treatment.iter().zip(outcome.iter()) {
            counts[usize::from(t != 0)][usize::from(y != 0)] += 1;
        }
        let rate = |arm: usize, name: &str| {
            let total = counts[arm][0] + counts[arm][1];
            if total == 0 {
                log::warn!("The {name} arm has no subjects; its outcome rate is undefined.");
                f64::NAN
            } else {
                counts[arm][1] as f64 / total as f64
            }
        };
        UpliftStatistics {
            treated_outcome_rate: rate(1, "treated"),
            control_outcome_rate: rate(0, "control"),
        }
    }
}
