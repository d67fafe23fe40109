#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::process;

use cem_uplift::causal::CausalType;
use cem_uplift::data::{load_tsv, write_tsv};
use cem_uplift::model::{CemConfig, DegeneratePolicy, GaussianMixtureCem, IteFormula, TrainedModel};

#[derive(Parser)]
#[command(
    name = "cem-uplift",
    about = "Fit and apply a causal Gaussian mixture for uplift modeling",
    long_about = "Estimates a four-type (responder, doomed, survivor, anti-responder) Gaussian \
                  mixture with a causally constrained EM algorithm, then predicts individual \
                  treatment effects and causal types."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a model from training data
    #[command(about = "Fit the causal mixture (outputs: model.toml)")]
    Train(TrainArgs),

    /// Apply a fitted model to new data
    #[command(about = "Apply a fitted model to new data (outputs: predictions.tsv)")]
    Infer(InferArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// Path to a training TSV file with treatment, outcome and predictor columns
    training_data: String,

    /// Comma-separated predictor column names
    #[arg(long, value_delimiter = ',', required = true)]
    predictors: Vec<String>,

    /// Maximum number of EM iterations
    #[arg(long, default_value = "500")]
    max_iterations: usize,

    /// Absolute log-likelihood change below which EM stops
    #[arg(long, default_value = "1e-6")]
    tolerance: f64,

    /// Ridge added to every covariance diagonal
    #[arg(long, default_value = "1e-2")]
    ridge: f64,

    /// Fail instead of carrying on when a causal type receives no responsibility
    #[arg(long)]
    strict_degenerate: bool,

    /// Number of mixture components; the four causal types fix it at 4
    #[arg(long, default_value = "4")]
    num_components: usize,

    /// ITE formula stored in the model
    #[arg(long, value_enum, default_value = "proportional")]
    ite_formula: IteFormulaCli,

    /// Where to write the fitted model
    #[arg(long, default_value = "model.toml")]
    output: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum IteFormulaCli {
    Proportional,
    TypeDifference,
}

impl From<IteFormulaCli> for IteFormula {
    fn from(value: IteFormulaCli) -> Self {
        match value {
            IteFormulaCli::Proportional => IteFormula::Proportional,
            IteFormulaCli::TypeDifference => IteFormula::TypeDifference,
        }
    }
}

#[derive(Args)]
struct InferArgs {
    /// Path to a TSV file with the model's predictor columns (treatment optional)
    test_data: String,

    /// Path to a fitted model file (.toml)
    #[arg(long)]
    model: String,

    /// Override the ITE formula stored in the model
    #[arg(long, value_enum)]
    ite_formula: Option<IteFormulaCli>,

    /// Where to write the annotated table
    #[arg(long, default_value = "predictions.tsv")]
    output: String,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Train(args) => train_command(args),
        Commands::Infer(args) => infer_command(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn train_config(args: &TrainArgs) -> CemConfig {
    CemConfig {
        max_iterations: args.max_iterations,
        num_components: args.num_components,
        convergence_tolerance: args.tolerance,
        covariance_ridge: args.ridge,
        degenerate_policy: if args.strict_degenerate {
            DegeneratePolicy::Error
        } else {
            DegeneratePolicy::Tolerate
        },
        ite_formula: args.ite_formula.into(),
    }
}

fn train_command(args: TrainArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = train_config(&args);
    config.validate()?;

    println!("Loading training data from: {}", args.training_data);
    let frame = load_tsv(&args.training_data)?;
    println!(
        "Loaded {} subjects; predictors: {}",
        frame.height(),
        args.predictors.join(", ")
    );

    let mut estimator = GaussianMixtureCem::new(config);
    println!("Fitting causal mixture...");
    estimator.fit(&frame, &args.predictors)?;
    let model = estimator
        .model()
        .ok_or("fit returned without a fitted model")?;

    print_summary(model);
    model.save(&args.output)?;
    println!("Model saved to: {}", args.output);
    Ok(())
}

fn infer_command(args: InferArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading model from: {}", args.model);
    let mut model = TrainedModel::load(&args.model)?;
    if let Some(formula) = args.ite_formula {
        model.config.ite_formula = formula.into();
    }
    println!("Model expects predictors: {}", model.predictor_names.join(", "));

    println!("Loading test data from: {}", args.test_data);
    let mut frame = load_tsv(&args.test_data)?;
    let predictors = model.predictor_names.clone();

    println!("Generating predictions for {} subjects...", frame.height());
    let estimator = GaussianMixtureCem::from(model);
    estimator.predict(&mut frame, &predictors)?;

    write_tsv(&mut frame, &args.output)?;
    println!("Predictions saved to: {}", args.output);
    Ok(())
}

fn print_summary(model: &TrainedModel) {
    let diag = &model.diagnostics;
    println!(
        "{} after {} iterations ({:.3}s).",
        if diag.converged { "Converged" } else { "Stopped at the iteration cap" },
        diag.iterations,
        diag.elapsed.as_secs_f64()
    );
    if let Some(ll) = diag.log_likelihoods.last() {
        println!("Final log-likelihood: {ll:.6}");
    }
    for ty in CausalType::ALL {
        println!("  {:<15} weight {:.4}", ty.label(), model.parameters.weight(ty));
    }
    println!(
        "P(outcome=1 | treated) = {:.4}, P(outcome=1 | control) = {:.4}",
        model.uplift.treated_outcome_rate, model.uplift.control_outcome_rate
    );
    if !diag.degenerate_types.is_empty() {
        let names: Vec<&str> = diag.degenerate_types.iter().map(|ty| ty.label()).collect();
        println!("Warning: empty causal types during fitting: {}", names.join(", "));
    }
}
