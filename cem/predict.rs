//! # Prediction
//!
//! Turns fitted mixture parameters into per-subject causal predictions.
//! Posteriors are unconstrained: treatment and outcome may be unknown at
//! prediction time, so all four types compete for every subject.

use crate::causal::{CausalType, NUM_TYPES};
use crate::data;
use crate::estimate::log_joint_densities;
use crate::gaussian::log_sum_exp;
use crate::model::{IteFormula, ModelError, TrainedModel, UpliftStatistics};
use itertools::izip;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use polars::prelude::*;

/// Outcomes implied by each subject's predicted type.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomePredictions {
    /// Outcome in the subject's actual arm.
    pub observed_arm: Array1<u8>,
    /// Outcome the subject would show if treated.
    pub if_treated: Array1<u8>,
    /// Outcome the subject would show under control.
    pub if_control: Array1<u8>,
}

/// Everything the prediction step produces for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct CausalPredictions {
    /// Posterior type probabilities, shape `[n, 4]`, rows summing to one.
    pub posteriors: Array2<f64>,
    pub ite: Array1<f64>,
    pub types: Vec<CausalType>,
    /// Present only when a treatment vector was supplied.
    pub outcomes: Option<OutcomePredictions>,
}

impl TrainedModel {
    /// Predicts from arrays. `predictors` must follow `self.predictor_names`.
    pub fn predict_arrays(
        &self,
        predictors: ArrayView2<f64>,
        treatment: Option<ArrayView1<u8>>,
    ) -> Result<CausalPredictions, ModelError> {
        let expected = self.parameters.n_predictors();
        if predictors.ncols() != expected {
            return Err(ModelError::MismatchedPredictorCount {
                found: predictors.ncols(),
                expected,
            });
        }
        if let Some(t) = treatment {
            if t.len() != predictors.nrows() {
                return Err(ModelError::MismatchedTreatmentLength {
                    found: t.len(),
                    expected: predictors.nrows(),
                });
            }
        }

        let log_joint = log_joint_densities(predictors, &self.parameters)?;
        let posteriors = posterior_probabilities(log_joint.view());
        let ite =
            individual_treatment_effect(posteriors.view(), &self.uplift, self.config.ite_formula);
        let types = most_likely_types(posteriors.view());
        let outcomes = treatment.map(|t| predict_outcomes(&types, t));

        log::debug!(
            "Predicted {} subjects; mean ITE {:.4}.",
            types.len(),
            ite.mean().unwrap_or(f64::NAN)
        );

        Ok(CausalPredictions {
            posteriors,
            ite,
            types,
            outcomes,
        })
    }

    /// Validates `frame`, predicts, and attaches the prediction columns to it.
    /// `predictors` must equal `self.predictor_names`, in the same order.
    /// Existing columns with the same names are replaced.
    pub fn predict_frame<S: AsRef<str>>(
        &self,
        frame: &mut DataFrame,
        predictors: &[S],
    ) -> Result<(), ModelError> {
        let names_match = predictors.len() == self.predictor_names.len()
            && predictors
                .iter()
                .zip(&self.predictor_names)
                .all(|(given, trained)| given.as_ref() == trained);
        if !names_match {
            return Err(ModelError::MismatchedPredictorNames {
                found: predictors.iter().map(|s| s.as_ref().to_string()).collect(),
                expected: self.predictor_names.clone(),
            });
        }
        let input = data::prediction_data_from_frame(frame, predictors)?;
        let treatment = input.treatment.as_ref().map(|t| t.view());
        let predictions = self.predict_arrays(input.predictors.view(), treatment)?;
        predictions.attach_to(frame)?;
        Ok(())
    }
}

impl CausalPredictions {
    /// Adds `ITE`, `groupe`, `typePredict`, `z0..z3` and, if outcomes were
    /// predicted, `outcomePredict`, `outcome1predict`, `outcome0predict`.
    pub fn attach_to(&self, df: &mut DataFrame) -> PolarsResult<()> {
        df.with_column(Series::new("ITE".into(), self.ite.to_vec()))?;
        let groups: Vec<i32> = self.types.iter().map(|ty| ty.index() as i32).collect();
        df.with_column(Series::new("groupe".into(), groups))?;
        let labels: Vec<&str> = self.types.iter().map(|ty| ty.label()).collect();
        df.with_column(Series::new("typePredict".into(), labels))?;
        for (j, column) in self.posteriors.axis_iter(Axis(1)).enumerate() {
            df.with_column(Series::new(format!("z{j}").into(), column.to_vec()))?;
        }

        if let Some(outcomes) = &self.outcomes {
            let columns = [
                ("outcomePredict", &outcomes.observed_arm),
                ("outcome1predict", &outcomes.if_treated),
                ("outcome0predict", &outcomes.if_control),
            ];
            for (name, values) in columns {
                let values: Vec<i32> = values.iter().map(|&v| i32::from(v)).collect();
                df.with_column(Series::new(name.into(), values))?;
            }
        }
        Ok(())
    }
}

/// Row-wise softmax of the log joint densities.
pub fn posterior_probabilities(log_joint: ArrayView2<f64>) -> Array2<f64> {
    let mut posteriors = Array2::zeros(log_joint.raw_dim());
    for (mut out, row) in posteriors.rows_mut().into_iter().zip(log_joint.rows()) {
        let norm = log_sum_exp(row.iter().copied());
        out.assign(&row.mapv(|v| (v - norm).exp()));
    }
    posteriors
}

/// ITE from posterior type probabilities `t0..t3`.
pub fn individual_treatment_effect(
    posteriors: ArrayView2<f64>,
    uplift: &UpliftStatistics,
    formula: IteFormula,
) -> Array1<f64> {
    let p_t = uplift.treated_outcome_rate;
    let p_c = uplift.control_outcome_rate;
    posteriors
        .rows()
        .into_iter()
        .map(|t| match formula {
            IteFormula::Proportional => 2.0 * (p_t * (t[0] + t[2]) - p_c * (t[2] + t[3])),
            IteFormula::TypeDifference => t[0] - t[3],
        })
        .collect()
}

/// Arg-max type per row. The first maximum wins on ties.
pub fn most_likely_types(posteriors: ArrayView2<f64>) -> Vec<CausalType> {
    posteriors
        .rows()
        .into_iter()
        .map(|row| {
            let mut best = 0;
            for j in 1..NUM_TYPES {
                if row[j] > row[best] {
                    best = j;
                }
            }
            CausalType::ALL[best]
        })
        .collect()
}

/// Factual and counterfactual outcomes implied by each type.
pub fn predict_outcomes(types: &[CausalType], treatment: ArrayView1<u8>) -> OutcomePredictions {
    let n = types.len();
    let mut observed_arm = Array1::zeros(n);
    let mut if_treated = Array1::zeros(n);
    let mut if_control = Array1::zeros(n);
    for (ty, &t, observed, treated, control) in izip!(
        types,
        treatment.iter(),
        observed_arm.iter_mut(),
        if_treated.iter_mut(),
        if_control.iter_mut()
    ) {
        *observed = u8::from(ty.outcome_under(t != 0));
        *treated = u8::from(ty.outcome_if_treated());
        *control = u8::from(ty.outcome_if_control());
    }
    OutcomePredictions {
        observed_arm,
        if_treated,
        if_control,
    }
}
