//! # Model Lifecycle
//!
//! A [`ModelObject`] starts [`ModelObject::Untrained`], holding a validated
//! dataset. [`ModelObject::train`] consumes it, hands the dataset to an
//! inference engine and returns a [`TrainedModel`]. A trained object cannot
//! be trained again.
//!
//! Both states persist to one TOML file format distinguished by `status`.

use crate::engine::{EngineError, EngineRequest, InferenceEngine};
use crate::error::DataError;
use crate::metadata::attach_metadata;
use crate::options::RunOptions;
use crate::types::{Dataset, Dimensions, Likelihood, default_factor_name};
use crate::validate::validate;
use ahash::{AHashMap, AHashSet};
use ndarray::Array2;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error(
        "This model has already been trained. Prepare a new model from the data to train again."
    )]
    AlreadyTrained,
    #[error("The model has not been trained yet.")]
    NotTrained,
    #[error("{0}")]
    Data(#[from] DataError),
    #[error("Inference engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Invalid training options: {0}")]
    InvalidOptions(String),
    #[error("The engine result does not match the dataset: {0}")]
    ResultMismatch(String),
    #[error("The model file is inconsistent: {0}")]
    InvalidModelFile(String),
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

impl From<PolarsError> for ModelError {
    fn from(err: PolarsError) -> Self {
        Self::Data(DataError::Polars(err))
    }
}

// --- Engine Output ---

/// Variance explained in one (view, group) block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceBlock {
    pub view: String,
    pub group: String,
    /// R² of the full model in this block.
    pub total: f64,
    /// R² per factor, in factor order.
    pub per_factor: Vec<f64>,
}

/// One recorded iteration of the engine's convergence trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub iteration: usize,
    pub elbo: f64,
    /// Change from the previous recorded ELBO; NaN on the first entry.
    pub delta_elbo: f64,
    pub active_factors: usize,
}

/// The artifact an inference engine produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingResult {
    /// `Factor{k}` names are used when empty.
    #[serde(default)]
    pub factor_names: Vec<String>,
    /// Per group, samples × factors.
    pub factors: Vec<Array2<f64>>,
    /// Per view, features × factors.
    pub weights: Vec<Array2<f64>>,
    pub variance_explained: Vec<VarianceBlock>,
    #[serde(default)]
    pub trace: Vec<TraceEntry>,
}

impl TrainingResult {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let result = toml::from_str(&toml_string)?;
        Ok(result)
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Number of factors, read from the first factor matrix.
    pub fn num_factors(&self) -> usize {
        self.factors.first().map_or(0, |f| f.ncols())
    }

    /// Checks the artifact against the dataset it was trained on and fills
    /// in default factor names. Variance blocks are put in view-major order.
    fn conform(mut self, dataset: &Dataset) -> Result<Self, ModelError> {
        let mismatch = |msg: String| Err(ModelError::ResultMismatch(msg));
        let k = self.num_factors();
        if k == 0 {
            return mismatch("the result has no factors".to_string());
        }

        if self.factors.len() != dataset.groups().len() {
            return mismatch(format!(
                "{} factor matrices for {} groups",
                self.factors.len(),
                dataset.groups().len()
            ));
        }
        for (g, (group, factors)) in dataset.groups().iter().zip(&self.factors).enumerate() {
            if factors.dim() != (dataset.samples(g).len(), k) {
                return mismatch(format!(
                    "factors of group '{group}' are {} x {}, expected {} x {k}",
                    factors.nrows(),
                    factors.ncols(),
                    dataset.samples(g).len()
                ));
            }
        }

        if self.weights.len() != dataset.views().len() {
            return mismatch(format!(
                "{} weight matrices for {} views",
                self.weights.len(),
                dataset.views().len()
            ));
        }
        for (m, (view, weights)) in dataset.views().iter().zip(&self.weights).enumerate() {
            if weights.dim() != (dataset.features(m).len(), k) {
                return mismatch(format!(
                    "weights of view '{view}' are {} x {}, expected {} x {k}",
                    weights.nrows(),
                    weights.ncols(),
                    dataset.features(m).len()
                ));
            }
        }

        if self.factor_names.is_empty() {
            self.factor_names = (0..k).map(default_factor_name).collect();
        }
        if self.factor_names.len() != k {
            return mismatch(format!("{} factor names for {k} factors", self.factor_names.len()));
        }
        let unique: AHashSet<&str> = self.factor_names.iter().map(String::as_str).collect();
        if unique.len() != k {
            return mismatch("factor names are not unique".to_string());
        }

        let mut by_block: AHashMap<(String, String), VarianceBlock> = AHashMap::new();
        for block in self.variance_explained.drain(..) {
            if block.per_factor.len() != k {
                return mismatch(format!(
                    "variance explained in ({}, {}) has {} values for {k} factors",
                    block.view,
                    block.group,
                    block.per_factor.len()
                ));
            }
            let key = (block.view.clone(), block.group.clone());
            if by_block.insert(key, block).is_some() {
                return mismatch("variance explained lists a block twice".to_string());
            }
        }
        let mut ordered = Vec::with_capacity(dataset.views().len() * dataset.groups().len());
        for view in dataset.views() {
            for group in dataset.groups() {
                match by_block.remove(&(view.clone(), group.clone())) {
                    Some(block) => ordered.push(block),
                    None => {
                        return mismatch(format!(
                            "no variance explained for view '{view}' in group '{group}'"
                        ));
                    }
                }
            }
        }
        if let Some((view, group)) = by_block.into_keys().next() {
            return mismatch(format!(
                "variance explained for unknown block ('{view}', '{group}')"
            ));
        }
        self.variance_explained = ordered;
        Ok(self)
    }
}

// --- Trained Model ---

/// A dataset together with the options it was trained with and the engine's
/// result.
#[derive(Debug, Clone)]
pub struct TrainedModel {
    dataset: Dataset,
    options: RunOptions,
    result: TrainingResult,
}

impl TrainedModel {
    /// Pairs a dataset with an engine result, rejecting results that do not
    /// fit the dataset.
    pub fn new(
        dataset: Dataset,
        options: RunOptions,
        result: TrainingResult,
    ) -> Result<Self, ModelError> {
        let result = result.conform(&dataset)?;
        Ok(Self {
            dataset,
            options,
            result,
        })
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn result(&self) -> &TrainingResult {
        &self.result
    }

    pub fn likelihoods(&self) -> &[Likelihood] {
        self.options.likelihoods()
    }

    pub fn factor_names(&self) -> &[String] {
        &self.result.factor_names
    }

    pub fn num_factors(&self) -> usize {
        self.result.num_factors()
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            factors: self.num_factors(),
            ..self.dataset.dimensions()
        }
    }

    /// Last entry of the convergence trace.
    pub fn final_trace(&self) -> Option<&TraceEntry> {
        self.result.trace.last()
    }

    /// Human-readable overview of the model.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let dims = self.dimensions();
        let _ = writeln!(out, "Trained multi-view factor model");
        let _ = writeln!(out, "{dims}");
        let _ = writeln!(out, "Views:");
        for (m, view) in self.dataset.views().iter().enumerate() {
            let likelihood = self
                .likelihoods()
                .get(m)
                .map_or("unknown".to_string(), |l| l.to_string());
            let _ = writeln!(
                out,
                "  {view}: {} features, {likelihood} likelihood",
                dims.features[m]
            );
        }
        let _ = writeln!(out, "Groups:");
        for (g, group) in self.dataset.groups().iter().enumerate() {
            let _ = writeln!(out, "  {group}: {} samples", dims.samples[g]);
        }
        let _ = writeln!(out, "Factors: {}", self.factor_names().join(", "));
        match self.final_trace() {
            Some(last) => {
                let _ = write!(
                    out,
                    "Convergence: {} recorded iterations, last iteration {}, ELBO {:.4} (delta {:.4e}), {} active factors",
                    self.result.trace.len(),
                    last.iteration,
                    last.elbo,
                    last.delta_elbo,
                    last.active_factors
                );
            }
            None => {
                let _ = write!(out, "Convergence: no trace recorded");
            }
        }
        out
    }
}

// --- Model Object ---

/// Training status, persisted as the `status` field of a model file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Untrained,
    Trained,
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Untrained => f.write_str("untrained"),
            Self::Trained => f.write_str("trained"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ModelObject {
    Untrained(Dataset),
    Trained(Box<TrainedModel>),
}

impl From<Dataset> for ModelObject {
    fn from(dataset: Dataset) -> Self {
        Self::Untrained(dataset)
    }
}

impl From<TrainedModel> for ModelObject {
    fn from(model: TrainedModel) -> Self {
        Self::Trained(Box::new(model))
    }
}

impl ModelObject {
    pub fn status(&self) -> ModelStatus {
        match self {
            Self::Untrained(_) => ModelStatus::Untrained,
            Self::Trained(_) => ModelStatus::Trained,
        }
    }

    pub fn dataset(&self) -> &Dataset {
        match self {
            Self::Untrained(dataset) => dataset,
            Self::Trained(model) => model.dataset(),
        }
    }

    /// Dimensions with `factors == 0` until trained.
    pub fn dimensions(&self) -> Dimensions {
        match self {
            Self::Untrained(dataset) => dataset.dimensions(),
            Self::Trained(model) => model.dimensions(),
        }
    }

    pub fn trained(&self) -> Option<&TrainedModel> {
        match self {
            Self::Untrained(_) => None,
            Self::Trained(model) => Some(model.as_ref()),
        }
    }

    pub fn into_trained(self) -> Result<TrainedModel, ModelError> {
        match self {
            Self::Untrained(_) => Err(ModelError::NotTrained),
            Self::Trained(model) => Ok(*model),
        }
    }

    /// Trains the model. The object is consumed, so the dataset is owned by
    /// this call until it returns.
    pub fn train<E>(self, options: &RunOptions, engine: &mut E) -> Result<TrainedModel, ModelError>
    where
        E: InferenceEngine + ?Sized,
    {
        let dataset = match self {
            Self::Untrained(dataset) => dataset,
            Self::Trained(_) => return Err(ModelError::AlreadyTrained),
        };
        validate(&dataset)?;
        let options = options.resolve(&dataset)?;
        let request = EngineRequest::from_dataset(&dataset, &options);

        let artifact = engine.run(&request)?;
        log::info!("Loading engine result from '{}'.", artifact.display());
        let result = TrainingResult::load(&artifact)?;
        let model = TrainedModel::new(dataset, options, result)?;
        log::info!(
            "Training finished with {} factor(s).",
            model.num_factors()
        );
        Ok(model)
    }

    /// Saves the object to a TOML model file.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let file = ModelFile::from_object(self)?;
        let toml_string = toml::to_string_pretty(&file)?;
        let mut writer = BufWriter::new(fs::File::create(path)?);
        writer.write_all(toml_string.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    /// Loads a model file, re-validating the dataset and, for trained files,
    /// the stored result.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let file: ModelFile = toml::from_str(&toml_string)?;
        file.into_object()
    }
}

// --- Persistence ---

#[derive(Debug, Serialize, Deserialize)]
struct BlockRecord {
    view: String,
    group: String,
    values: Array2<f64>,
}

/// A metadata column stored as strings. `nulls` lists the missing rows.
#[derive(Debug, Serialize, Deserialize)]
struct MetadataColumn {
    name: String,
    values: Vec<String>,
    #[serde(default)]
    nulls: Vec<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ModelFile {
    status: ModelStatus,
    views: Vec<String>,
    groups: Vec<String>,
    features: Vec<Vec<String>>,
    samples: Vec<Vec<String>>,
    blocks: Vec<BlockRecord>,
    #[serde(default)]
    samples_metadata: Vec<MetadataColumn>,
    #[serde(default)]
    features_metadata: Vec<MetadataColumn>,
    options: Option<RunOptions>,
    result: Option<TrainingResult>,
}

fn table_to_columns(table: Option<&DataFrame>) -> Result<Vec<MetadataColumn>, ModelError> {
    let Some(table) = table else {
        return Ok(Vec::new());
    };
    let mut columns = Vec::with_capacity(table.width());
    for column in table.get_columns() {
        let text = column.as_materialized_series().cast(&DataType::String)?;
        let mut values = Vec::with_capacity(text.len());
        let mut nulls = Vec::new();
        for (row, value) in text.str()?.into_iter().enumerate() {
            match value {
                Some(v) => values.push(v.to_string()),
                None => {
                    values.push(String::new());
                    nulls.push(row);
                }
            }
        }
        columns.push(MetadataColumn {
            name: column.name().to_string(),
            values,
            nulls,
        });
    }
    Ok(columns)
}

fn columns_to_table(columns: Vec<MetadataColumn>) -> Result<Option<DataFrame>, ModelError> {
    if columns.is_empty() {
        return Ok(None);
    }
    let columns: Vec<Column> = columns
        .into_iter()
        .map(|column| {
            let nulls: AHashSet<usize> = column.nulls.into_iter().collect();
            let values: Vec<Option<String>> = column
                .values
                .into_iter()
                .enumerate()
                .map(|(row, v)| (!nulls.contains(&row)).then_some(v))
                .collect();
            Column::new(column.name.into(), values)
        })
        .collect();
    Ok(Some(DataFrame::new(columns)?))
}

impl ModelFile {
    fn from_object(object: &ModelObject) -> Result<Self, ModelError> {
        let dataset = object.dataset();
        let mut blocks = Vec::with_capacity(dataset.views().len() * dataset.groups().len());
        for (m, view) in dataset.views().iter().enumerate() {
            for (g, group) in dataset.groups().iter().enumerate() {
                blocks.push(BlockRecord {
                    view: view.clone(),
                    group: group.clone(),
                    values: dataset.block(m, g).clone(),
                });
            }
        }
        let (options, result) = match object {
            ModelObject::Untrained(_) => (None, None),
            ModelObject::Trained(model) => {
                (Some(model.options().clone()), Some(model.result().clone()))
            }
        };
        Ok(Self {
            status: object.status(),
            views: dataset.views().to_vec(),
            groups: dataset.groups().to_vec(),
            features: dataset.feature_sets().to_vec(),
            samples: dataset.sample_sets().to_vec(),
            blocks,
            samples_metadata: table_to_columns(dataset.samples_metadata())?,
            features_metadata: table_to_columns(dataset.features_metadata())?,
            options,
            result,
        })
    }

    fn into_object(self) -> Result<ModelObject, ModelError> {
        let n_groups = self.groups.len();
        if self.blocks.len() != self.views.len() * n_groups {
            return Err(ModelError::InvalidModelFile(format!(
                "{} blocks stored for {} views and {n_groups} groups",
                self.blocks.len(),
                self.views.len()
            )));
        }
        let mut blocks: Vec<Vec<Array2<f64>>> = Vec::with_capacity(self.views.len());
        let mut records = self.blocks.into_iter();
        for view in &self.views {
            let mut view_blocks = Vec::with_capacity(n_groups);
            for group in &self.groups {
                match records.next() {
                    Some(record) if &record.view == view && &record.group == group => {
                        view_blocks.push(record.values);
                    }
                    _ => {
                        return Err(ModelError::InvalidModelFile(format!(
                            "block ('{view}', '{group}') is missing or out of order"
                        )));
                    }
                }
            }
            blocks.push(view_blocks);
        }

        let dataset = Dataset::from_parts(self.views, self.groups, self.features, self.samples, blocks);
        validate(&dataset)?;
        let dataset = attach_metadata(
            dataset,
            columns_to_table(self.samples_metadata)?,
            columns_to_table(self.features_metadata)?,
        )?;

        match (self.status, self.result) {
            (ModelStatus::Untrained, _) => Ok(ModelObject::Untrained(dataset)),
            (ModelStatus::Trained, Some(result)) => {
                let options = self.options.unwrap_or_default();
                Ok(TrainedModel::new(dataset, options, result)?.into())
            }
            (ModelStatus::Trained, None) => Err(ModelError::InvalidModelFile(
                "status is 'trained' but no result is stored".to_string(),
            )),
        }
    }
}
