//! # Matrix Normalizer
//!
//! Takes one feature × sample matrix per view and puts every view on the union
//! of all sample names (first-seen order). Samples absent from a view become
//! all-NaN columns in that view's blocks. Sparse inputs are converted to CSC
//! before reindexing so column lookups are cheap; implicit sparse zeros stay
//! true zeros.

use super::IngestWarning;
use crate::error::DataError;
use crate::types::{
    DEFAULT_GROUP_NAME, Dataset, default_feature_name, default_sample_name, default_view_name,
};
use ahash::{AHashMap, AHashSet};
use itertools::Itertools;
use nalgebra_sparse::{CscMatrix, CsrMatrix};
use ndarray::{Array2, ArrayViewMut1};
use polars::prelude::*;

/// Minimum number of samples every pair of views must have in common.
pub const MIN_SHARED_SAMPLES: usize = 2;

/// Numeric payload of one view: features in rows, samples in columns.
#[derive(Debug, Clone)]
pub enum MatrixData {
    Dense(Array2<f64>),
    Csc(CscMatrix<f64>),
    Csr(CsrMatrix<f64>),
}

impl MatrixData {
    pub fn nrows(&self) -> usize {
        match self {
            Self::Dense(m) => m.nrows(),
            Self::Csc(m) => m.nrows(),
            Self::Csr(m) => m.nrows(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            Self::Dense(m) => m.ncols(),
            Self::Csc(m) => m.ncols(),
            Self::Csr(m) => m.ncols(),
        }
    }

    pub(super) fn normalize(self) -> NormalizedMatrix {
        match self {
            Self::Dense(m) => NormalizedMatrix::Dense(m),
            Self::Csc(m) => NormalizedMatrix::Sparse(m),
            Self::Csr(m) => NormalizedMatrix::Sparse(CscMatrix::from(&m)),
        }
    }
}

/// A matrix after sparse inputs have been brought to the CSC family.
pub(super) enum NormalizedMatrix {
    Dense(Array2<f64>),
    Sparse(CscMatrix<f64>),
}

impl NormalizedMatrix {
    pub(super) fn nrows(&self) -> usize {
        match self {
            Self::Dense(m) => m.nrows(),
            Self::Sparse(m) => m.nrows(),
        }
    }

    /// Infinite values cannot be represented in the likelihood; NaN is the
    /// missing marker and is accepted.
    pub(super) fn ensure_numeric(&self, view: &str) -> Result<(), DataError> {
        let infinite = match self {
            Self::Dense(m) => m.iter().any(|v| v.is_infinite()),
            Self::Sparse(m) => m.values().iter().any(|v| v.is_infinite()),
        };
        if infinite {
            return Err(DataError::InvalidInput(format!(
                "matrix of view '{view}' contains infinite values"
            )));
        }
        Ok(())
    }

    fn copy_column(&self, col: usize, mut target: ArrayViewMut1<f64>) {
        match self {
            Self::Dense(m) => target.assign(&m.column(col)),
            Self::Sparse(m) => {
                target.fill(0.0);
                let column = m.col(col);
                for (&row, &value) in column.row_indices().iter().zip(column.values()) {
                    target[row] = value;
                }
            }
        }
    }
}

/// Builds a block whose j-th column is source column `columns[j]`, or all-NaN
/// when the sample is absent from the source.
pub(super) fn gather_block(matrix: &NormalizedMatrix, columns: &[Option<usize>]) -> Array2<f64> {
    let mut block = Array2::from_elem((matrix.nrows(), columns.len()), f64::NAN);
    for (j, source) in columns.iter().enumerate() {
        if let Some(col) = source {
            matrix.copy_column(*col, block.column_mut(j));
        }
    }
    block
}

/// Splits positions by label, keeping labels and members in first-seen order.
pub(super) fn partition_by_label(labels: &[String]) -> (Vec<String>, Vec<Vec<usize>>) {
    let mut names: Vec<String> = Vec::new();
    let mut members: Vec<Vec<usize>> = Vec::new();
    let mut index: AHashMap<&str, usize> = AHashMap::new();
    for (position, label) in labels.iter().enumerate() {
        let slot = *index.entry(label.as_str()).or_insert_with(|| {
            names.push(label.clone());
            members.push(Vec::new());
            names.len() - 1
        });
        members[slot].push(position);
    }
    (names, members)
}

/// One view of a [`MatrixInput`].
#[derive(Debug, Clone)]
pub struct ViewMatrix {
    /// View name; `view_{m}` when absent.
    pub name: Option<String>,
    pub data: MatrixData,
    /// Row names; synthesized (with a warning) when absent.
    pub features: Option<Vec<String>>,
    /// Column names; synthesized (with a warning) when absent.
    pub samples: Option<Vec<String>>,
}

impl ViewMatrix {
    pub fn new(data: MatrixData) -> Self {
        Self {
            name: None,
            data,
            features: None,
            samples: None,
        }
    }

    pub fn dense(values: Array2<f64>) -> Self {
        Self::new(MatrixData::Dense(values))
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_features<S: Into<String>>(mut self, features: impl IntoIterator<Item = S>) -> Self {
        self.features = Some(features.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_samples<S: Into<String>>(mut self, samples: impl IntoIterator<Item = S>) -> Self {
        self.samples = Some(samples.into_iter().map(Into::into).collect());
        self
    }

    fn resolved_samples(&self) -> Vec<String> {
        match &self.samples {
            Some(samples) => samples.clone(),
            None => (0..self.data.ncols()).map(default_sample_name).collect(),
        }
    }
}

/// A collection of per-view matrices with an optional group label per sample.
#[derive(Debug, Clone, Default)]
pub struct MatrixInput {
    pub views: Vec<ViewMatrix>,
    /// One label per sample of [`sample_union`], in that order.
    pub groups: Option<Vec<String>>,
}

impl MatrixInput {
    pub fn new(views: Vec<ViewMatrix>) -> Self {
        Self { views, groups: None }
    }

    pub fn with_groups<S: Into<String>>(mut self, groups: impl IntoIterator<Item = S>) -> Self {
        self.groups = Some(groups.into_iter().map(Into::into).collect());
        self
    }
}

/// The union of all views' sample names in first-seen order. This is the
/// order in which [`MatrixInput::groups`] labels are read.
pub fn sample_union(views: &[ViewMatrix]) -> Vec<String> {
    let mut seen: AHashSet<String> = AHashSet::new();
    let mut union = Vec::new();
    for view in views {
        for sample in view.resolved_samples() {
            if seen.insert(sample.clone()) {
                union.push(sample);
            }
        }
    }
    union
}

/// Reads a wide table (feature ids in the first column, one numeric column per
/// sample) into a dense view matrix.
pub fn view_matrix_from_wide_table(
    name: Option<String>,
    table: &DataFrame,
) -> Result<ViewMatrix, DataError> {
    let columns = table.get_columns();
    if columns.len() < 2 {
        return Err(DataError::InvalidInput(format!(
            "a matrix table needs a feature column and at least one sample column, found {} column(s)",
            columns.len()
        )));
    }

    let feature_column = columns[0].as_materialized_series().cast(&DataType::String)?;
    let mut features = Vec::with_capacity(table.height());
    for (row, value) in feature_column.str()?.into_iter().enumerate() {
        match value {
            Some(v) => features.push(v.to_string()),
            None => {
                return Err(DataError::InvalidInput(format!(
                    "feature id missing at row {} of column '{}'",
                    row + 1,
                    columns[0].name()
                )));
            }
        }
    }

    let samples: Vec<String> = columns[1..].iter().map(|c| c.name().to_string()).collect();
    let mut values = Array2::from_elem((table.height(), samples.len()), f64::NAN);
    for (j, column) in columns[1..].iter().enumerate() {
        let series = column.as_materialized_series();
        let casted = series.cast(&DataType::Float64).map_err(|_| non_numeric(column.name()))?;
        if casted.null_count() > series.null_count() {
            return Err(non_numeric(column.name()));
        }
        for (i, value) in casted.f64()?.into_iter().enumerate() {
            values[[i, j]] = value.unwrap_or(f64::NAN);
        }
    }

    Ok(ViewMatrix {
        name,
        data: MatrixData::Dense(values),
        features: Some(features),
        samples: Some(samples),
    })
}

fn non_numeric(column: &str) -> DataError {
    DataError::InvalidInput(format!("column '{column}' contains non-numeric values"))
}

fn resolve_view_names(views: &[ViewMatrix]) -> Result<Vec<String>, DataError> {
    let names: Vec<String> = views
        .iter()
        .enumerate()
        .map(|(m, view)| view.name.clone().unwrap_or_else(|| default_view_name(m)))
        .collect();
    if let Some(empty) = names.iter().position(String::is_empty) {
        return Err(DataError::InvalidInput(format!(
            "view {} has an empty name",
            empty + 1
        )));
    }
    if let Some(duplicate) = names.iter().duplicates().next() {
        return Err(DataError::InvalidInput(format!(
            "view name '{duplicate}' is used more than once"
        )));
    }
    Ok(names)
}

fn resolve_axis_names(
    provided: Option<Vec<String>>,
    expected: usize,
    axis: &str,
    view: &str,
    synthesize: impl Fn(usize) -> String,
) -> Result<Option<Vec<String>>, DataError> {
    let Some(names) = provided else {
        return Ok(None);
    };
    if names.len() != expected {
        return Err(DataError::InvalidInput(format!(
            "view '{view}' has {expected} {axis}s but {} {axis} names",
            names.len()
        )));
    }
    if let Some(duplicate) = names.iter().duplicates().next() {
        return Err(DataError::InvalidInput(format!(
            "{axis} name '{duplicate}' occurs more than once in view '{view}'"
        )));
    }
    if names.iter().any(String::is_empty) {
        return Err(DataError::InvalidInput(format!(
            "view '{view}' has an empty {axis} name (expected e.g. '{}')",
            synthesize(0)
        )));
    }
    Ok(Some(names))
}

pub(super) fn ingest_matrices(
    input: MatrixInput,
    warnings: &mut Vec<IngestWarning>,
) -> Result<Dataset, DataError> {
    if input.views.is_empty() {
        return Err(DataError::InvalidInput(
            "no matrices were supplied".to_string(),
        ));
    }
    let view_names = resolve_view_names(&input.views)?;

    let mut features: Vec<Vec<String>> = Vec::with_capacity(view_names.len());
    let mut view_samples: Vec<Vec<String>> = Vec::with_capacity(view_names.len());
    let mut matrices: Vec<NormalizedMatrix> = Vec::with_capacity(view_names.len());

    for (view, input_view) in view_names.iter().zip(input.views) {
        let ViewMatrix {
            data,
            features: provided_features,
            samples: provided_samples,
            ..
        } = input_view;
        let (n_rows, n_cols) = (data.nrows(), data.ncols());
        if n_rows == 0 || n_cols == 0 {
            return Err(DataError::InvalidInput(format!(
                "matrix of view '{view}' is empty ({n_rows} x {n_cols})"
            )));
        }
        let matrix = data.normalize();
        matrix.ensure_numeric(view)?;

        let feature_names = match resolve_axis_names(provided_features, n_rows, "feature", view, |i| {
            default_feature_name(i, view)
        })? {
            Some(names) => names,
            None => {
                warnings.push(IngestWarning::SynthesizedFeatureNames { view: view.clone() });
                (0..n_rows).map(|i| default_feature_name(i, view)).collect()
            }
        };
        let sample_names =
            match resolve_axis_names(provided_samples, n_cols, "sample", view, default_sample_name)? {
                Some(names) => names,
                None => {
                    warnings.push(IngestWarning::SynthesizedSampleNames { view: view.clone() });
                    (0..n_cols).map(default_sample_name).collect()
                }
            };

        features.push(feature_names);
        view_samples.push(sample_names);
        matrices.push(matrix);
    }

    let mut union: Vec<String> = Vec::new();
    let mut union_index: AHashSet<&str> = AHashSet::new();
    for samples in &view_samples {
        for sample in samples {
            if union_index.insert(sample.as_str()) {
                union.push(sample.clone());
            }
        }
    }

    for (a, b) in (0..view_names.len()).tuple_combinations() {
        let in_a: AHashSet<&str> = view_samples[a].iter().map(String::as_str).collect();
        let shared = view_samples[b]
            .iter()
            .filter(|s| in_a.contains(s.as_str()))
            .count();
        if shared < MIN_SHARED_SAMPLES {
            return Err(DataError::InvalidInput(format!(
                "views '{}' and '{}' share {shared} sample(s); at least {MIN_SHARED_SAMPLES} shared samples are required. Check that sample names match across views.",
                view_names[a], view_names[b]
            )));
        }
    }

    let labels = match input.groups {
        Some(labels) => {
            if labels.len() != union.len() {
                return Err(DataError::InvalidInput(format!(
                    "{} group labels were supplied for {} samples",
                    labels.len(),
                    union.len()
                )));
            }
            if let Some(position) = labels.iter().position(String::is_empty) {
                return Err(DataError::InvalidInput(format!(
                    "sample '{}' has an empty group label",
                    union[position]
                )));
            }
            labels
        }
        None => {
            log::info!(
                "No group labels supplied; all {} samples form the single group '{DEFAULT_GROUP_NAME}'.",
                union.len()
            );
            vec![DEFAULT_GROUP_NAME.to_string(); union.len()]
        }
    };
    let (groups, members) = partition_by_label(&labels);
    let samples: Vec<Vec<String>> = members
        .iter()
        .map(|positions| positions.iter().map(|&p| union[p].clone()).collect())
        .collect();

    let mut blocks: Vec<Vec<Array2<f64>>> = Vec::with_capacity(view_names.len());
    for ((view, matrix), names) in view_names.iter().zip(&matrices).zip(&view_samples) {
        let column_of: AHashMap<&str, usize> = names
            .iter()
            .enumerate()
            .map(|(col, name)| (name.as_str(), col))
            .collect();
        let mut view_blocks = Vec::with_capacity(groups.len());
        for (group, group_samples) in groups.iter().zip(&samples) {
            let columns: Vec<Option<usize>> = group_samples
                .iter()
                .map(|s| column_of.get(s.as_str()).copied())
                .collect();
            // The view measured none of this group's samples.
            if columns.iter().all(Option::is_none) {
                warnings.push(IngestWarning::EmptyBlock {
                    view: view.clone(),
                    group: group.clone(),
                });
            }
            view_blocks.push(gather_block(matrix, &columns));
        }
        blocks.push(view_blocks);
    }

    Ok(Dataset::from_parts(
        view_names, groups, features, samples, blocks,
    ))
}
