#![deny(unused_variables)]
#![deny(dead_code)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use polars::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use multifactor::engine::CommandEngine;
use multifactor::ingest::{
    GroupAssignment, IngestInput, MatrixInput, SingleOmicsContainer, ingest_with_metadata,
    sample_union, view_matrix_from_wide_table,
};
use multifactor::metadata::{GROUP_COLUMN, SAMPLE_COLUMN};
use multifactor::model::{ModelObject, TrainedModel};
use multifactor::options::{ConvergenceMode, RunOptions};
use multifactor::results::Selection;
use multifactor::shared::files::{read_table, write_table_tsv};
use multifactor::{DataError, Likelihood};

#[derive(Args)]
pub struct PrepareArgs {
    /// One view as VIEW=PATH; the file has feature ids in its first column and one column per sample
    #[arg(long = "matrix", value_name = "VIEW=PATH")]
    pub matrices: Vec<String>,

    /// Two-column table (sample, group) assigning the samples of --matrix inputs to groups
    #[arg(long, value_name = "PATH", requires = "matrices")]
    pub groups: Option<PathBuf>,

    /// Long table with sample, feature, value and optional view, group columns
    #[arg(long, value_name = "PATH")]
    pub long_table: Option<PathBuf>,

    /// Single-assay matrix file (features in rows, samples in columns)
    #[arg(long, value_name = "PATH")]
    pub container: Option<PathBuf>,

    /// Per-sample annotations of --container, keyed by a 'sample' column
    #[arg(long, value_name = "PATH", requires = "container")]
    pub annotations: Option<PathBuf>,

    /// Annotation column holding the group of each --container sample
    #[arg(long, value_name = "NAME", requires = "annotations")]
    pub group_column: Option<String>,

    /// View name of the --container assay
    #[arg(long, default_value = "RNA")]
    pub assay: String,

    /// Sample descriptor table keyed by a 'sample' column
    #[arg(long, value_name = "PATH")]
    pub samples_metadata: Option<PathBuf>,

    /// Feature descriptor table keyed by a 'feature' column
    #[arg(long, value_name = "PATH")]
    pub features_metadata: Option<PathBuf>,

    /// Where to write the untrained model
    #[arg(long, short, default_value = "model.toml")]
    pub output: PathBuf,
}

#[derive(Args)]
pub struct TrainArgs {
    /// Untrained model file written by `prepare`
    pub model: PathBuf,

    /// External inference program; it receives the request manifest path as its last argument
    #[arg(long, value_name = "PROGRAM")]
    pub engine: String,

    /// Extra argument passed to the engine before the manifest path
    #[arg(long = "engine-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub engine_args: Vec<String>,

    /// Directory for the engine request and result (default: next to the output file)
    #[arg(long, value_name = "DIR")]
    pub workdir: Option<PathBuf>,

    /// TOML file with [data], [model], [training] and [stochastic] options
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Number of factors
    #[arg(long, short = 'k', value_name = "K")]
    pub factors: Option<usize>,

    /// One likelihood per view (gaussian, poisson, bernoulli); inferred when omitted
    #[arg(long, value_delimiter = ',')]
    pub likelihoods: Option<Vec<Likelihood>>,

    #[arg(long, value_name = "N")]
    pub max_iter: Option<usize>,

    /// fast, medium or slow
    #[arg(long)]
    pub convergence_mode: Option<ConvergenceMode>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Scale each view to unit variance
    #[arg(long)]
    pub scale_views: bool,

    /// Scale each group to unit variance
    #[arg(long)]
    pub scale_groups: bool,

    /// Use stochastic variational inference
    #[arg(long)]
    pub stochastic: bool,

    /// Ask the engine to run on a GPU
    #[arg(long)]
    pub gpu: bool,

    /// Where to write the trained model
    #[arg(long, short, default_value = "model_trained.toml")]
    pub output: PathBuf,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportKind {
    Factors,
    Weights,
    Variance,
    Data,
    All,
}

#[derive(Args)]
pub struct ExportArgs {
    /// Trained model file
    pub model: PathBuf,

    #[arg(long, value_enum, default_value_t = ExportKind::All)]
    pub what: ExportKind,

    /// Write one long table per kind instead of one matrix per view or group
    #[arg(long)]
    pub long: bool,

    #[arg(long, value_delimiter = ',')]
    pub views: Option<Vec<String>>,

    #[arg(long, value_delimiter = ',')]
    pub groups: Option<Vec<String>>,

    #[arg(long, value_delimiter = ',')]
    pub factors: Option<Vec<String>>,

    #[arg(long, default_value = ".")]
    pub out_dir: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "multifactor",
    about = "Data preparation and result access for multi-view, multi-group factor analysis",
    long_about = "Builds a validated multi-view, multi-group dataset from matrices, long tables \
                 or single-assay containers, runs an external factor-analysis engine on it and \
                 exports factors, weights and variance explained."
)]
struct Cli {
    /// Log debug messages
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Ingest and validate data (outputs: model.toml)")]
    Prepare(PrepareArgs),

    #[command(about = "Train a prepared model with an external engine (outputs: model_trained.toml)")]
    Train(TrainArgs),

    #[command(about = "Write factors, weights, variance explained or data as TSV")]
    Export(ExportArgs),

    #[command(about = "Print dimensions and convergence of a model file")]
    Summary {
        /// Model file
        model: PathBuf,
    },

    #[command(about = "Display version information")]
    Version,
}

fn main() {
    let cli = Cli::parse();
    let Cli { verbose, command } = cli;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if verbose { "debug" } else { "info" }),
    )
    .format_timestamp(None)
    .init();

    let result = match command {
        Some(Commands::Prepare(args)) => prepare(args),
        Some(Commands::Train(args)) => train(args),
        Some(Commands::Export(args)) => export(args),
        Some(Commands::Summary { model }) => summary(&model),
        Some(Commands::Version) => {
            println!("multifactor {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

// ========================================================================================
//                                        prepare
// ========================================================================================

fn invalid(message: String) -> Box<dyn std::error::Error> {
    Box::new(DataError::InvalidInput(message))
}

fn text_values(table: &DataFrame, column: &str) -> Result<Vec<Option<String>>, Box<dyn std::error::Error>> {
    let series = table
        .column(column)
        .map_err(|_| invalid(format!("table lacks a '{column}' column")))?
        .as_materialized_series()
        .cast(&DataType::String)?;
    Ok(series
        .str()?
        .into_iter()
        .map(|v| v.map(str::to_string))
        .collect())
}

fn read_matrices(args: &PrepareArgs) -> Result<IngestInput, Box<dyn std::error::Error>> {
    let mut views = Vec::with_capacity(args.matrices.len());
    for spec in &args.matrices {
        let (name, path) = spec
            .split_once('=')
            .ok_or_else(|| invalid(format!("--matrix expects VIEW=PATH, got '{spec}'")))?;
        println!("Loading view '{name}' from '{path}'");
        let table = read_table(Path::new(path))?;
        views.push(view_matrix_from_wide_table(Some(name.to_string()), &table)?);
    }

    let mut input = MatrixInput::new(views);
    if let Some(path) = &args.groups {
        let table = read_table(path)?;
        let samples = text_values(&table, SAMPLE_COLUMN)?;
        let groups = text_values(&table, GROUP_COLUMN)?;
        let assignment: std::collections::HashMap<String, String> = samples
            .into_iter()
            .zip(groups)
            .filter_map(|(s, g)| Some((s?, g?)))
            .collect();
        let labels = sample_union(&input.views)
            .iter()
            .map(|sample| {
                assignment
                    .get(sample)
                    .cloned()
                    .ok_or_else(|| invalid(format!("sample '{sample}' has no entry in '{}'", path.display())))
            })
            .collect::<Result<Vec<_>, _>>()?;
        input = input.with_groups(labels);
    }
    Ok(IngestInput::Matrices(input))
}

fn read_container(args: &PrepareArgs, path: &Path) -> Result<IngestInput, Box<dyn std::error::Error>> {
    println!("Loading assay '{}' from '{}'", args.assay, path.display());
    let table = read_table(path)?;
    let view = view_matrix_from_wide_table(Some(args.assay.clone()), &table)?;
    let features = view.features.unwrap_or_default();
    let samples = view.samples.unwrap_or_default();

    let annotations = match &args.annotations {
        Some(path) => Some(align_annotations(read_table(path)?, &samples)?),
        None => None,
    };
    let groups = match &args.group_column {
        Some(column) => GroupAssignment::Column(column.clone()),
        None => GroupAssignment::None,
    };

    let container = SingleOmicsContainer {
        assay: args.assay.clone(),
        counts: view.data,
        features,
        samples,
        annotations,
    };
    Ok(IngestInput::Container { container, groups })
}

/// Puts annotation rows in the container's sample order.
fn align_annotations(table: DataFrame, samples: &[String]) -> Result<DataFrame, Box<dyn std::error::Error>> {
    let keys = text_values(&table, SAMPLE_COLUMN)?;
    let rows: std::collections::HashMap<&str, usize> = keys
        .iter()
        .enumerate()
        .filter_map(|(row, key)| key.as_deref().map(|k| (k, row)))
        .collect();
    let mut order: Vec<IdxSize> = Vec::with_capacity(samples.len());
    for sample in samples {
        let row = rows
            .get(sample.as_str())
            .ok_or_else(|| invalid(format!("sample '{sample}' has no annotation row")))?;
        order.push(*row as IdxSize);
    }
    Ok(table.take(&IdxCa::from_vec("order".into(), order))?)
}

pub fn prepare(args: PrepareArgs) -> Result<(), Box<dyn std::error::Error>> {
    let sources = usize::from(!args.matrices.is_empty())
        + usize::from(args.long_table.is_some())
        + usize::from(args.container.is_some());
    if sources != 1 {
        return Err(invalid(
            "specify exactly one of --matrix, --long-table or --container".to_string(),
        ));
    }

    let input = if let Some(path) = &args.long_table {
        println!("Loading long table from '{}'", path.display());
        IngestInput::from_table(read_table(path)?)?
    } else if let Some(path) = &args.container {
        read_container(&args, path)?
    } else {
        read_matrices(&args)?
    };

    let samples_metadata = args.samples_metadata.as_deref().map(read_table).transpose()?;
    let features_metadata = args.features_metadata.as_deref().map(read_table).transpose()?;
    let ingested = ingest_with_metadata(input, samples_metadata, features_metadata)?;

    if !ingested.warnings.is_empty() {
        println!("{} warning(s) raised during ingestion (see log).", ingested.warnings.len());
    }
    println!("{}", ingested.dataset.dimensions());

    ModelObject::from(ingested.dataset).save(&args.output)?;
    println!("Untrained model written to '{}'", args.output.display());
    Ok(())
}

// ========================================================================================
//                                         train
// ========================================================================================

fn run_options(args: &TrainArgs) -> Result<RunOptions, Box<dyn std::error::Error>> {
    let mut options = match &args.config {
        Some(path) => {
            println!("Loading options from '{}'", path.display());
            RunOptions::load(path)?
        }
        None => RunOptions::default(),
    };
    if let Some(k) = args.factors {
        options.model.num_factors = Some(k);
    }
    if let Some(likelihoods) = &args.likelihoods {
        options.model.likelihoods = Some(likelihoods.clone());
    }
    if let Some(max_iter) = args.max_iter {
        options.training.max_iter = max_iter;
    }
    if let Some(mode) = args.convergence_mode {
        options.training.convergence_mode = mode;
    }
    if let Some(seed) = args.seed {
        options.training.seed = seed;
    }
    options.data.scale_views |= args.scale_views;
    options.data.scale_groups |= args.scale_groups;
    options.training.stochastic |= args.stochastic;
    options.training.gpu_mode |= args.gpu;
    Ok(options)
}

pub fn train(args: TrainArgs) -> Result<(), Box<dyn std::error::Error>> {
    let options = run_options(&args)?;
    println!("Loading model from '{}'", args.model.display());
    let object = ModelObject::load(&args.model)?;
    println!("{}", object.dimensions());

    let workdir = args.workdir.clone().unwrap_or_else(|| {
        let stem = args
            .output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());
        args.output.with_file_name(format!("{stem}_engine"))
    });
    let mut engine = args
        .engine_args
        .iter()
        .fold(CommandEngine::new(args.engine.clone(), &workdir), |engine, arg| {
            engine.arg(arg.clone())
        });

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")?
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "),
    );
    spinner.set_message(format!("Running inference engine '{}'", args.engine));
    spinner.enable_steady_tick(Duration::from_millis(100));
    let trained = object.train(&options, &mut engine);
    spinner.finish_and_clear();
    let trained = trained?;

    println!("{}", trained.summary());
    ModelObject::from(trained).save(&args.output)?;
    println!("Trained model written to '{}'", args.output.display());
    Ok(())
}

// ========================================================================================
//                                     export, summary
// ========================================================================================

/// File-name-safe version of a view, group or factor name.
fn file_label(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

fn load_trained(path: &Path) -> Result<TrainedModel, Box<dyn std::error::Error>> {
    println!("Loading model from '{}'", path.display());
    Ok(ModelObject::load(path)?.into_trained()?)
}

pub fn export(args: ExportArgs) -> Result<(), Box<dyn std::error::Error>> {
    let model = load_trained(&args.model)?;
    let selection = Selection {
        views: args.views.clone(),
        groups: args.groups.clone(),
        factors: args.factors.clone(),
    };
    fs::create_dir_all(&args.out_dir)?;
    let wants = |kind: ExportKind| args.what == kind || args.what == ExportKind::All;
    let mut written: Vec<PathBuf> = Vec::new();

    if wants(ExportKind::Factors) {
        if args.long {
            let path = args.out_dir.join("factors.tsv");
            write_table_tsv(&path, &model.factors_long(&selection)?)?;
            written.push(path);
        } else {
            for matrix in model.factors(&selection)? {
                let group = matrix.group.as_deref().unwrap_or_default();
                let path = args.out_dir.join(format!("factors_{}.tsv", file_label(group)));
                matrix.write_tsv(&path, SAMPLE_COLUMN)?;
                written.push(path);
            }
        }
    }

    if wants(ExportKind::Weights) {
        if args.long {
            let path = args.out_dir.join("weights.tsv");
            write_table_tsv(&path, &model.weights_long(&selection)?)?;
            written.push(path);
        } else {
            for matrix in model.weights(&selection)? {
                let view = matrix.view.as_deref().unwrap_or_default();
                let path = args.out_dir.join(format!("weights_{}.tsv", file_label(view)));
                matrix.write_tsv(&path, "feature")?;
                written.push(path);
            }
        }
    }

    if wants(ExportKind::Variance) {
        let variance = model.variance_explained(&selection)?;
        let totals = args.out_dir.join("variance_explained_total.tsv");
        write_table_tsv(&totals, &variance.totals_long()?)?;
        written.push(totals);
        if args.long {
            let path = args.out_dir.join("variance_explained.tsv");
            write_table_tsv(&path, &variance.to_long()?)?;
            written.push(path);
        } else {
            for (g, group) in variance.groups.iter().enumerate() {
                let path = args
                    .out_dir
                    .join(format!("variance_explained_{}.tsv", file_label(group)));
                variance.for_group(g).write_tsv(&path, "view")?;
                written.push(path);
            }
        }
    }

    if wants(ExportKind::Data) {
        if args.long {
            let path = args.out_dir.join("data.tsv");
            write_table_tsv(&path, &model.data_long(&selection)?)?;
            written.push(path);
        } else {
            for matrix in model.data(&selection)? {
                let path = args.out_dir.join(format!(
                    "data_{}_{}.tsv",
                    file_label(matrix.view.as_deref().unwrap_or_default()),
                    file_label(matrix.group.as_deref().unwrap_or_default())
                ));
                matrix.write_tsv(&path, "feature")?;
                written.push(path);
            }
        }
    }

    for path in &written {
        println!("Wrote '{}'", path.display());
    }
    Ok(())
}

fn summary(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let object = ModelObject::load(path)?;
    match object.trained() {
        Some(model) => println!("{}", model.summary()),
        None => {
            println!("Untrained model");
            println!("{}", object.dimensions());
            let dataset = object.dataset();
            println!("Views: {}", dataset.views().join(", "));
            println!("Groups: {}", dataset.groups().join(", "));
            println!("Missing cells: {}", dataset.missing_count());
        }
    }
    Ok(())
}
