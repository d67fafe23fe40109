//! Synthetic data builders shared by the unit tests.
//!
//! Each subject is drawn from the Gaussian of its causal type, and its
//! observed outcome is the type's potential outcome in the assigned arm, so
//! the data always agrees with the identifiability mask.

use crate::causal::{CausalCell, CausalType};
use crate::data::CemData;
use ndarray::{Array1, Array2};
use polars::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

/// Synthetic subjects with their generating types.
#[derive(Clone)]
pub struct SyntheticCausalData {
    pub x: Array2<f64>,
    pub treatment: Array1<u8>,
    pub outcome: Array1<u8>,
    pub types: Vec<CausalType>,
}

impl SyntheticCausalData {
    pub fn to_cem_data(&self) -> CemData {
        CemData {
            predictors: self.x.clone(),
            treatment: Some(self.treatment.clone()),
            outcome: Some(self.outcome.clone()),
            predictor_names: vec!["x1".to_string(), "x2".to_string()],
        }
    }

    pub fn to_frame(&self) -> DataFrame {
        let as_i32 = |v: &Array1<u8>| v.iter().map(|&b| i32::from(b)).collect::<Vec<_>>();
        df!(
            "x1" => self.x.column(0).to_vec(),
            "x2" => self.x.column(1).to_vec(),
            "treatment" => as_i32(&self.treatment),
            "outcome" => as_i32(&self.outcome)
        )
        .expect("synthetic frame")
    }
}

/// Builder for two-predictor data with one well-separated cluster per type.
pub struct SyntheticCausalBuilder {
    n_samples: usize,
    separation: f64,
    seed: u64,
    single_cell: Option<CausalCell>,
}

impl SyntheticCausalBuilder {
    pub fn new(n_samples: usize) -> Self {
        Self {
            n_samples,
            separation: 6.0,
            seed: 42,
            single_cell: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Puts every subject in `cell`, alternating between its two admissible types.
    pub fn in_single_cell(mut self, cell: CausalCell) -> Self {
        self.single_cell = Some(cell);
        self
    }

    /// Cluster centre of a type: responder at the origin, the others on a square.
    pub fn center(&self, ty: CausalType) -> [f64; 2] {
        let s = self.separation;
        match ty {
            CausalType::Responder => [0.0, 0.0],
            CausalType::Doomed => [s, 0.0],
            CausalType::Survivor => [0.0, s],
            CausalType::AntiResponder => [s, s],
        }
    }

    pub fn build(self) -> SyntheticCausalData {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let noise = Normal::new(0.0, 1.0).expect("unit normal");
        let n = self.n_samples;

        let mut x = Array2::zeros((n, 2));
        let mut treatment = Array1::zeros(n);
        let mut outcome = Array1::zeros(n);
        let mut types = Vec::with_capacity(n);

        for i in 0..n {
            let (ty, treated) = match self.single_cell {
                Some(cell) => (cell.admissible_types()[i % 2], cell.treated),
                // Balanced: types cycle fastest, arms alternate every four subjects.
                None => (CausalType::ALL[i % 4], (i / 4) % 2 == 1),
            };
            let c = self.center(ty);
            x[[i, 0]] = c[0] + noise.sample(&mut rng);
            x[[i, 1]] = c[1] + noise.sample(&mut rng);
            treatment[i] = u8::from(treated);
            outcome[i] = u8::from(ty.outcome_under(treated));
            types.push(ty);
        }

        SyntheticCausalData {
            x,
            treatment,
            outcome,
            types,
        }
    }
}
