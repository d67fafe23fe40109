use approx::assert_abs_diff_eq;
use cem_uplift::causal::{CausalCell, CausalType};
use cem_uplift::data::DataError;
use cem_uplift::model::{CemConfig, GaussianMixtureCem, ModelError, TrainedModel};
use polars::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use tempfile::NamedTempFile;

const PREDICTORS: [&str; 2] = ["x1", "x2"];

/// Four unit-variance clusters on a square of side 6, one per causal type,
/// with balanced arms. Returns the frame and the generating types.
fn well_separated_frame(n: usize, seed: u64) -> (DataFrame, Vec<CausalType>) {
    let centers = [[-3.0, -3.0], [3.0, -3.0], [-3.0, 3.0], [3.0, 3.0]];
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 1.0).unwrap();

    let mut x1 = Vec::with_capacity(n);
    let mut x2 = Vec::with_capacity(n);
    let mut treatment = Vec::with_capacity(n);
    let mut outcome = Vec::with_capacity(n);
    let mut types = Vec::with_capacity(n);
    for i in 0..n {
        let ty = CausalType::ALL[i % 4];
        let treated = (i / 4) % 2 == 0;
        let c = centers[ty.index()];
        x1.push(c[0] + noise.sample(&mut rng));
        x2.push(c[1] + noise.sample(&mut rng));
        treatment.push(i32::from(treated));
        outcome.push(i32::from(ty.outcome_under(treated)));
        types.push(ty);
    }
    let df = df!(
        "x1" => x1,
        "x2" => x2,
        "treatment" => treatment,
        "outcome" => outcome
    )
    .unwrap();
    (df, types)
}

#[test]
fn recovers_balanced_causal_types() {
    let (train, types) = well_separated_frame(400, 2024);
    let mut estimator = GaussianMixtureCem::new(CemConfig {
        max_iterations: 500,
        convergence_tolerance: 1e-6,
        ..CemConfig::default()
    });
    estimator.fit(&train, &PREDICTORS).unwrap();
    let model = estimator.model().unwrap();

    assert!(model.diagnostics.converged);
    assert!(model.iterations() >= 2 && model.iterations() <= 500);
    assert_abs_diff_eq!(model.weights().iter().sum::<f64>(), 1.0, epsilon = 1e-10);
    for w in model.weights() {
        assert!((w - 0.25).abs() <= 0.1, "weight {w}");
    }

    let mut scored = train.clone();
    estimator.predict(&mut scored, &PREDICTORS).unwrap();
    let labels = scored.column("typePredict").unwrap().str().unwrap().clone();
    let correct = labels
        .into_iter()
        .zip(&types)
        .filter(|(label, ty)| *label == Some(ty.label()))
        .count();
    assert!(correct >= 360, "only {correct} of 400 classified correctly");

    let groups = scored.column("groupe").unwrap().i32().unwrap().clone();
    let z: Vec<Float64Chunked> = (0..4)
        .map(|j| scored.column(&format!("z{j}")).unwrap().f64().unwrap().clone())
        .collect();
    for i in 0..scored.height() {
        let probs: Vec<f64> = z.iter().map(|col| col.get(i).unwrap()).collect();
        assert_abs_diff_eq!(probs.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        let g = groups.get(i).unwrap() as usize;
        assert!(probs.iter().all(|&p| p <= probs[g]));
    }
}

#[test]
fn predict_map_matches_predict() {
    let (train, _) = well_separated_frame(200, 11);
    let mut estimator = GaussianMixtureCem::default();
    estimator.fit(&train, &PREDICTORS).unwrap();

    let mut a = train.clone();
    let mut b = train.clone();
    estimator.predict(&mut a, &PREDICTORS).unwrap();
    estimator.predict_map(&mut b, &PREDICTORS).unwrap();
    assert!(a.equals_missing(&b));
}

#[test]
fn single_cell_training_does_not_crash() {
    let (full, _) = well_separated_frame(160, 5);
    let train = full
        .lazy()
        .filter(col("treatment").eq(lit(1)).and(col("outcome").eq(lit(0))))
        .collect()
        .unwrap();
    let mut estimator = GaussianMixtureCem::default();
    estimator.fit(&train, &PREDICTORS).unwrap();
    let model = estimator.model().unwrap();

    let retained = CausalCell::new(true, false).admissible_types();
    for ty in CausalType::ALL {
        if !retained.contains(&ty) {
            assert!(model.parameters.weight(ty) < 1e-8);
        }
    }
    let mut scored = train.clone();
    estimator.predict(&mut scored, &PREDICTORS).unwrap();
    let z_survivor = scored.column("z2").unwrap().f64().unwrap().clone();
    assert!(z_survivor.into_no_null_iter().all(|p| p == 0.0));
}

#[test]
fn missing_columns_fail_before_fitting() {
    let (train, _) = well_separated_frame(40, 3);
    let train = train.drop("outcome").unwrap();
    let mut estimator = GaussianMixtureCem::default();
    match estimator.fit(&train, &PREDICTORS) {
        Err(ModelError::Data(DataError::ColumnNotFound(col))) => assert_eq!(col, "outcome"),
        other => panic!("Expected ColumnNotFound(outcome), got {:?}", other),
    }
    assert!(estimator.model().is_none());
}

#[test]
fn saved_model_predicts_identically() {
    let (train, _) = well_separated_frame(120, 9);
    let mut estimator = GaussianMixtureCem::default();
    estimator.fit(&train, &PREDICTORS).unwrap();

    let file = NamedTempFile::new().unwrap();
    let path = file.path().to_str().unwrap();
    estimator.model().unwrap().save(path).unwrap();
    let reloaded = GaussianMixtureCem::from(TrainedModel::load(path).unwrap());

    let mut a = train.clone().drop("treatment").unwrap();
    let mut b = a.clone();
    estimator.predict(&mut a, &PREDICTORS).unwrap();
    reloaded.predict(&mut b, &PREDICTORS).unwrap();

    let ite_a = a.column("ITE").unwrap().f64().unwrap().clone();
    let ite_b = b.column("ITE").unwrap().f64().unwrap().clone();
    for (x, y) in ite_a.into_no_null_iter().zip(ite_b.into_no_null_iter()) {
        assert_abs_diff_eq!(x, y, epsilon = 1e-9);
    }
    assert!(b.column("outcomePredict").is_err());
}
