//! # Data Loading and Validation Module
//!
//! Entry point for user-provided tables. A `polars::DataFrame` is validated
//! against the columns the causal EM needs and converted into the `ndarray`
//! structures the statistical core works on.
//!
//! - Fixed names for the causal columns: `treatment` and `outcome`, both coded 0/1.
//!   Predictor columns are chosen by the caller.
//! - All validation happens before any numeric work. Failures are assumed to
//!   be user-input errors and `DataError` says which column is at fault.

use ndarray::{Array1, Array2, ShapeBuilder};
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

use crate::causal::CausalCell;

pub const TREATMENT_COLUMN: &str = "treatment";
pub const OUTCOME_COLUMN: &str = "outcome";

/// Validated numeric data for the EM engines.
#[derive(Debug, Clone)]
pub struct CemData {
    /// Predictor matrix `X`. Shape: `[n_subjects, n_predictors]`.
    pub predictors: Array2<f64>,
    /// 0/1 treatment indicator. `None` when the table has no `treatment` column.
    pub treatment: Option<Array1<u8>>,
    /// 0/1 observed outcome. Loaded for training only.
    pub outcome: Option<Array1<u8>>,
    /// Predictor names in column order of `predictors`.
    pub predictor_names: Vec<String>,
}

impl CemData {
    pub fn n_subjects(&self) -> usize {
        self.predictors.nrows()
    }

    pub fn n_predictors(&self) -> usize {
        self.predictors.ncols()
    }

    /// Observed `(treatment, outcome)` cells, present only when both columns were loaded.
    pub fn cells(&self) -> Option<Vec<CausalCell>> {
        let treatment = self.treatment.as_ref()?;
        let outcome = self.outcome.as_ref()?;
        Some(
            treatment
                .iter()
                .zip(outcome.iter())
                .map(|(&t, &y)| CausalCell::from_codes(t, y))
                .collect(),
        )
    }
}

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input data. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing or null values were found in the column '{0}'. Complete data with no missing values is required."
    )]
    MissingValuesFound(String),
    #[error("Non-finite values (NaN or Infinity) were found in the column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("The column '{column_name}' must be coded 0/1, but row {row} holds {value}.")]
    NonBinaryValue {
        column_name: String,
        row: usize,
        value: f64,
    },
    #[error("At least one predictor column must be given.")]
    NoPredictors,
    #[error("The predictor column '{0}' was listed more than once.")]
    DuplicatePredictor(String),
    #[error("The input data contains no rows.")]
    Empty,
}

/// Extracts and validates training data: predictors, `treatment` and `outcome` are all required.
pub fn training_data_from_frame<S: AsRef<str>>(
    df: &DataFrame,
    predictors: &[S],
) -> Result<CemData, DataError> {
    internal::extract(df, predictors, true)
}

/// Extracts and validates prediction data. `treatment` is picked up when
/// present; `outcome` is never read.
pub fn prediction_data_from_frame<S: AsRef<str>>(
    df: &DataFrame,
    predictors: &[S],
) -> Result<CemData, DataError> {
    internal::extract(df, predictors, false)
}

/// Reads a tab-separated file with a header row.
pub fn load_tsv(path: &str) -> Result<DataFrame, DataError> {
    log::info!("Loading data from '{path}'");
    let df = CsvReader::new(File::open(Path::new(path))?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;
    log::info!("Loaded {} rows x {} columns.", df.height(), df.width());
    Ok(df)
}

/// Writes a frame as tab-separated text with a header row.
pub fn write_tsv(df: &mut DataFrame, path: &str) -> Result<(), DataError> {
    let mut file = File::create(Path::new(path))?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .with_separator(b'\t')
        .finish(df)?;
    Ok(())
}

mod internal {
    use super::*;

    pub(super) fn extract<S: AsRef<str>>(
        df: &DataFrame,
        predictors: &[S],
        require_causal_columns: bool,
    ) -> Result<CemData, DataError> {
        if predictors.is_empty() {
            return Err(DataError::NoPredictors);
        }
        let predictor_names: Vec<String> =
            predictors.iter().map(|s| s.as_ref().to_string()).collect();
        let mut seen = HashSet::with_capacity(predictor_names.len());
        for name in &predictor_names {
            if !seen.insert(name.as_str()) {
                return Err(DataError::DuplicatePredictor(name.clone()));
            }
        }

        // --- Verify all required columns exist before touching any values ---
        let columns_set: HashSet<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        let mut required: Vec<&str> = predictor_names.iter().map(|s| s.as_str()).collect();
        if require_causal_columns {
            required.push(TREATMENT_COLUMN);
            required.push(OUTCOME_COLUMN);
        }
        for col_name in &required {
            if !columns_set.contains(*col_name) {
                return Err(DataError::ColumnNotFound(col_name.to_string()));
            }
        }
        if df.height() == 0 {
            return Err(DataError::Empty);
        }

        let n = df.height();
        let p = predictor_names.len();
        let mut buffer = Vec::with_capacity(n * p);
        for name in &predictor_names {
            let mut column = extract_numeric_column(df, name)?;
            buffer.append(&mut column);
        }
        // Column-major buffer: one predictor after another.
        let x = Array2::from_shape_vec((n, p).f(), buffer).map_err(|_| {
            DataError::ColumnWrongType {
                column_name: predictor_names.join(","),
                expected_type: "equal-length numeric columns",
                found_type: "ragged columns".to_string(),
            }
        })?;

        let treatment = if columns_set.contains(TREATMENT_COLUMN) {
            Some(extract_binary_column(df, TREATMENT_COLUMN)?)
        } else {
            None
        };
        // Prediction never reads the outcome, which may be held out or unknown.
        let outcome = if require_causal_columns {
            Some(extract_binary_column(df, OUTCOME_COLUMN)?)
        } else {
            None
        };

        log::debug!(
            "Validated {n} rows with predictors {predictor_names:?} (treatment: {}, outcome: {}).",
            treatment.is_some(),
            outcome.is_some()
        );

        Ok(CemData {
            predictors: x.as_standard_layout().to_owned(),
            treatment,
            outcome,
            predictor_names,
        })
    }

    fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }

        let casted = series
            .cast(&DataType::Float64)
            .map_err(|_| DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            })?;
        // A failed string parse shows up as nulls after a non-strict cast.
        if casted.null_count() > 0 {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            });
        }

        let values: Vec<f64> = casted.f64()?.rechunk().into_no_null_iter().collect();
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(values)
    }

    fn extract_binary_column(df: &DataFrame, column_name: &str) -> Result<Array1<u8>, DataError> {
        let values = extract_numeric_column(df, column_name)?;
        values
            .iter()
            .enumerate()
            .map(|(row, &value)| {
                if value == 0.0 {
                    Ok(0)
                } else if value == 1.0 {
                    Ok(1)
                } else {
                    Err(DataError::NonBinaryValue {
                        column_name: column_name.to_string(),
                        row: row + 1,
                        value,
                    })
                }
            })
            .collect::<Result<Vec<u8>, _>>()
            .map(Array1::from_vec)
    }
}
