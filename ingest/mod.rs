//! # Ingestion Dispatcher
//!
//! Every supported input shape is one arm of [`IngestInput`]. [`ingest`]
//! matches it exhaustively, runs the matching ingestor, validates the result
//! and attaches metadata. Anything the caller could not classify arrives as
//! [`IngestInput::Unsupported`] and fails; nothing falls through.

pub mod container;
pub mod long_table;
pub mod matrices;

pub use container::{GroupAssignment, SingleOmicsContainer};
pub use long_table::VALUE_COLUMN;
pub use matrices::{MatrixData, MatrixInput, ViewMatrix, sample_union, view_matrix_from_wide_table};

use crate::error::DataError;
use crate::metadata::attach_metadata;
use crate::types::Dataset;
use crate::validate::validate;
use ahash::AHashMap;
use polars::prelude::*;
use std::fmt;

/// The closed set of input shapes the pipeline understands.
#[derive(Debug, Clone)]
pub enum IngestInput {
    /// One feature × sample matrix per view.
    Matrices(MatrixInput),
    /// Rows of `(sample, feature, [view], [group], value)`.
    LongTable(DataFrame),
    /// A single-assay container split by a group assignment.
    Container {
        container: SingleOmicsContainer,
        groups: GroupAssignment,
    },
    /// Something else, described for the error message.
    Unsupported(String),
}

impl IngestInput {
    /// Classifies an in-memory table. A table with `sample`, `feature` and
    /// `value` columns is a long table; a table with a textual first column
    /// and numeric remaining columns is a single-view wide matrix. A wide
    /// matrix whose contents cannot be read is an error, not an unsupported
    /// shape.
    pub fn from_table(table: DataFrame) -> Result<Self, DataError> {
        if long_table::has_long_table_columns(&table) {
            return Ok(Self::LongTable(table));
        }
        if is_wide_matrix(&table) {
            let view = view_matrix_from_wide_table(None, &table)?;
            return Ok(Self::Matrices(MatrixInput::new(vec![view])));
        }
        let columns: Vec<String> = table
            .get_column_names()
            .iter()
            .map(|c| c.to_string())
            .collect();
        Ok(Self::Unsupported(format!("table with columns {columns:?}")))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Matrices(_) => "matrices",
            Self::LongTable(_) => "long table",
            Self::Container { .. } => "single-omics container",
            Self::Unsupported(_) => "unsupported",
        }
    }
}

fn is_wide_matrix(table: &DataFrame) -> bool {
    let columns = table.get_columns();
    if columns.len() < 2 || table.height() == 0 {
        return false;
    }
    let textual_ids = matches!(columns[0].dtype(), DataType::String);
    let numeric_values = columns[1..].iter().all(|c| c.dtype().is_primitive_numeric());
    textual_ids && numeric_values
}

/// A non-fatal condition met while building a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestWarning {
    SynthesizedFeatureNames { view: String },
    SynthesizedSampleNames { view: String },
    /// No observation fell in this (view, group) pair.
    EmptyBlock { view: String, group: String },
    /// No group assignment was given, all samples share one group.
    ImplicitGroup,
    /// Feature names shared with other views were suffixed with the view name.
    FeatureNamesMadeUnique { view: String, renamed: usize },
}

impl fmt::Display for IngestWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SynthesizedFeatureNames { view } => write!(
                f,
                "View '{view}' has no feature names; using 'feature_<i>_{view}'."
            ),
            Self::SynthesizedSampleNames { view } => write!(
                f,
                "View '{view}' has no sample names; using 'sample_<i>'."
            ),
            Self::EmptyBlock { view, group } => write!(
                f,
                "View '{view}' has no observations in group '{group}'; its block is entirely missing."
            ),
            Self::ImplicitGroup => write!(
                f,
                "No group assignment given; all samples were placed in one group."
            ),
            Self::FeatureNamesMadeUnique { view, renamed } => write!(
                f,
                "{renamed} feature name(s) of view '{view}' also occur in other views and were suffixed with '_{view}'."
            ),
        }
    }
}

/// A validated dataset with metadata, plus every warning raised on the way.
#[derive(Debug, Clone)]
pub struct Ingested {
    pub dataset: Dataset,
    pub warnings: Vec<IngestWarning>,
}

/// Builds a dataset from any supported input, synthesizing default metadata.
pub fn ingest(input: IngestInput) -> Result<Ingested, DataError> {
    ingest_with_metadata(input, None, None)
}

/// Builds a dataset and attaches caller-supplied descriptor tables. Container
/// annotations serve as sample metadata when no table is supplied.
pub fn ingest_with_metadata(
    input: IngestInput,
    samples_metadata: Option<DataFrame>,
    features_metadata: Option<DataFrame>,
) -> Result<Ingested, DataError> {
    let kind = input.kind();
    let mut warnings = Vec::new();
    let (mut dataset, annotations) = match input {
        IngestInput::Matrices(matrices) => (matrices::ingest_matrices(matrices, &mut warnings)?, None),
        IngestInput::LongTable(table) => (long_table::ingest_long_table(&table, &mut warnings)?, None),
        IngestInput::Container { container, groups } => {
            container::ingest_container(container, &groups, &mut warnings)?
        }
        IngestInput::Unsupported(description) => {
            return Err(DataError::UnsupportedInputType(description));
        }
    };

    make_feature_names_unique(&mut dataset, &mut warnings);
    validate(&dataset)?;
    let dataset = attach_metadata(dataset, samples_metadata.or(annotations), features_metadata)?;

    for warning in &warnings {
        log::warn!("{warning}");
    }
    log::info!(
        "Ingested {kind}: {} view(s), {} group(s), {} samples, {} features, {} missing cells.",
        dataset.views().len(),
        dataset.groups().len(),
        dataset.sample_count(),
        dataset.feature_count(),
        dataset.missing_count()
    );
    Ok(Ingested { dataset, warnings })
}

/// Feature names must be unique across views. Names occurring in more than
/// one view get the view name appended in every view that uses them.
fn make_feature_names_unique(dataset: &mut Dataset, warnings: &mut Vec<IngestWarning>) {
    let mut occurrences: AHashMap<String, usize> = AHashMap::new();
    for features in dataset.feature_sets() {
        for feature in features {
            *occurrences.entry(feature.clone()).or_insert(0) += 1;
        }
    }
    if occurrences.values().all(|&count| count == 1) {
        return;
    }

    let views = dataset.views().to_vec();
    for (view, features) in views.iter().zip(dataset.feature_sets_mut()) {
        let mut renamed = 0;
        for feature in features.iter_mut() {
            if occurrences.get(feature.as_str()).copied().unwrap_or(0) > 1 {
                *feature = format!("{feature}_{view}");
                renamed += 1;
            }
        }
        if renamed > 0 {
            warnings.push(IngestWarning::FeatureNamesMadeUnique {
                view: view.clone(),
                renamed,
            });
        }
    }
}
