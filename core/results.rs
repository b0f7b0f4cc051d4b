//! # Result Accessor Layer
//!
//! Uniform extraction of factors, weights, data and variance explained from a
//! trained model, either as labelled matrices or as long tables. Variance
//! explained is stored precomputed by the engine and is only sliced here.
//!
//! Long tables list cells view-major, then group, then feature (or factor),
//! then sample. Missing cells are dropped from long data tables.

use crate::error::DataError;
use crate::ingest::VALUE_COLUMN;
use crate::metadata::{FEATURE_COLUMN, GROUP_COLUMN, SAMPLE_COLUMN, VIEW_COLUMN};
use crate::model::TrainedModel;
use crate::shared::files::write_matrix_tsv;
use crate::types::Dataset;
use ndarray::{Array2, Array3, Axis};
use polars::prelude::*;
use std::io;
use std::path::Path;

pub const FACTOR_COLUMN: &str = "factor";

/// Restricts extraction to named views, groups and factors. `None` keeps
/// every entry of that axis, in model order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub views: Option<Vec<String>>,
    pub groups: Option<Vec<String>>,
    pub factors: Option<Vec<String>>,
}

impl Selection {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_views<S: Into<String>>(mut self, views: impl IntoIterator<Item = S>) -> Self {
        self.views = Some(views.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_groups<S: Into<String>>(mut self, groups: impl IntoIterator<Item = S>) -> Self {
        self.groups = Some(groups.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_factors<S: Into<String>>(mut self, factors: impl IntoIterator<Item = S>) -> Self {
        self.factors = Some(factors.into_iter().map(Into::into).collect());
        self
    }
}

/// Positions selected along one axis, in the order the caller named them.
fn pick(axis: &str, available: &[String], wanted: Option<&Vec<String>>) -> Result<Vec<usize>, DataError> {
    let Some(wanted) = wanted else {
        return Ok((0..available.len()).collect());
    };
    if wanted.is_empty() {
        return Err(DataError::InvalidInput(format!("empty {axis} selection")));
    }
    wanted
        .iter()
        .map(|name| {
            available.iter().position(|a| a == name).ok_or_else(|| {
                DataError::InvalidInput(format!(
                    "unknown {axis} '{name}' (available: {})",
                    available.join(", ")
                ))
            })
        })
        .collect()
}

/// A matrix with named rows and columns, tagged with the view and/or group
/// it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledMatrix {
    pub view: Option<String>,
    pub group: Option<String>,
    pub rows: Vec<String>,
    pub columns: Vec<String>,
    pub values: Array2<f64>,
}

impl LabeledMatrix {
    /// Writes the matrix as TSV; `corner` names the row-name column.
    pub fn write_tsv(&self, path: &Path, corner: &str) -> io::Result<()> {
        write_matrix_tsv(path, corner, &self.rows, &self.columns, self.values.view())
    }
}

/// Variance explained sliced to a selection.
#[derive(Debug, Clone, PartialEq)]
pub struct VarianceExplained {
    pub views: Vec<String>,
    pub groups: Vec<String>,
    pub factors: Vec<String>,
    /// `[view, group, factor]`.
    pub per_factor: Array3<f64>,
    /// `[view, group]`, full-model R² as reported by the engine.
    pub total: Array2<f64>,
}

impl VarianceExplained {
    /// Per-factor values as `view, group, factor, value` rows.
    pub fn to_long(&self) -> Result<DataFrame, DataError> {
        let capacity = self.per_factor.len();
        let mut views = Vec::with_capacity(capacity);
        let mut groups = Vec::with_capacity(capacity);
        let mut factors = Vec::with_capacity(capacity);
        let mut values = Vec::with_capacity(capacity);
        for ((m, g, k), &value) in self.per_factor.indexed_iter() {
            views.push(self.views[m].as_str());
            groups.push(self.groups[g].as_str());
            factors.push(self.factors[k].as_str());
            values.push(value);
        }
        Ok(DataFrame::new(vec![
            Column::new(VIEW_COLUMN.into(), views),
            Column::new(GROUP_COLUMN.into(), groups),
            Column::new(FACTOR_COLUMN.into(), factors),
            Column::new(VALUE_COLUMN.into(), values),
        ])?)
    }

    /// Totals as `view, group, value` rows.
    pub fn totals_long(&self) -> Result<DataFrame, DataError> {
        let mut views = Vec::with_capacity(self.total.len());
        let mut groups = Vec::with_capacity(self.total.len());
        let mut values = Vec::with_capacity(self.total.len());
        for ((m, g), &value) in self.total.indexed_iter() {
            views.push(self.views[m].as_str());
            groups.push(self.groups[g].as_str());
            values.push(value);
        }
        Ok(DataFrame::new(vec![
            Column::new(VIEW_COLUMN.into(), views),
            Column::new(GROUP_COLUMN.into(), groups),
            Column::new(VALUE_COLUMN.into(), values),
        ])?)
    }

    /// Per-factor values of one group as a view × factor matrix.
    pub fn for_group(&self, g: usize) -> LabeledMatrix {
        LabeledMatrix {
            view: None,
            group: Some(self.groups[g].clone()),
            rows: self.views.clone(),
            columns: self.factors.clone(),
            values: self.per_factor.index_axis(Axis(1), g).to_owned(),
        }
    }
}

impl Dataset {
    /// Flattens every block into `sample, feature, view, group, value` rows.
    ///
    /// Rows run view, group, feature, sample in canonical order and every cell
    /// is emitted, missing ones with a null `value`. Pivoting the table back
    /// therefore sees each axis in its original order, including features or
    /// samples that were never observed.
    pub fn to_long_table(&self) -> Result<DataFrame, DataError> {
        let views: Vec<usize> = (0..self.views().len()).collect();
        let groups: Vec<usize> = (0..self.groups().len()).collect();
        self.long_table_for(&views, &groups)
    }

    fn long_table_for(&self, views: &[usize], groups: &[usize]) -> Result<DataFrame, DataError> {
        let mut samples: Vec<&str> = Vec::new();
        let mut features: Vec<&str> = Vec::new();
        let mut view_tags: Vec<&str> = Vec::new();
        let mut group_tags: Vec<&str> = Vec::new();
        let mut values: Vec<Option<f64>> = Vec::new();
        for &m in views {
            for &g in groups {
                let block = self.block(m, g);
                for (d, row) in block.outer_iter().enumerate() {
                    for (n, &value) in row.iter().enumerate() {
                        samples.push(self.samples(g)[n].as_str());
                        features.push(self.features(m)[d].as_str());
                        view_tags.push(self.views()[m].as_str());
                        group_tags.push(self.groups()[g].as_str());
                        values.push((!value.is_nan()).then_some(value));
                    }
                }
            }
        }
        Ok(DataFrame::new(vec![
            Column::new(SAMPLE_COLUMN.into(), samples),
            Column::new(FEATURE_COLUMN.into(), features),
            Column::new(VIEW_COLUMN.into(), view_tags),
            Column::new(GROUP_COLUMN.into(), group_tags),
            Column::new(VALUE_COLUMN.into(), values),
        ])?)
    }
}

impl TrainedModel {
    /// Factor values per selected group: samples × selected factors.
    pub fn factors(&self, selection: &Selection) -> Result<Vec<LabeledMatrix>, DataError> {
        let dataset = self.dataset();
        let groups = pick("group", dataset.groups(), selection.groups.as_ref())?;
        let factors = pick("factor", self.factor_names(), selection.factors.as_ref())?;
        Ok(groups
            .iter()
            .map(|&g| LabeledMatrix {
                view: None,
                group: Some(dataset.groups()[g].clone()),
                rows: dataset.samples(g).to_vec(),
                columns: factors.iter().map(|&k| self.factor_names()[k].clone()).collect(),
                values: self.result().factors[g].select(Axis(1), &factors),
            })
            .collect())
    }

    /// Weights per selected view: features × selected factors.
    pub fn weights(&self, selection: &Selection) -> Result<Vec<LabeledMatrix>, DataError> {
        let dataset = self.dataset();
        let views = pick("view", dataset.views(), selection.views.as_ref())?;
        let factors = pick("factor", self.factor_names(), selection.factors.as_ref())?;
        Ok(views
            .iter()
            .map(|&m| LabeledMatrix {
                view: Some(dataset.views()[m].clone()),
                group: None,
                rows: dataset.features(m).to_vec(),
                columns: factors.iter().map(|&k| self.factor_names()[k].clone()).collect(),
                values: self.result().weights[m].select(Axis(1), &factors),
            })
            .collect())
    }

    /// Training data per selected (view, group): features × samples.
    pub fn data(&self, selection: &Selection) -> Result<Vec<LabeledMatrix>, DataError> {
        let dataset = self.dataset();
        let views = pick("view", dataset.views(), selection.views.as_ref())?;
        let groups = pick("group", dataset.groups(), selection.groups.as_ref())?;
        let mut blocks = Vec::with_capacity(views.len() * groups.len());
        for &m in &views {
            for &g in &groups {
                blocks.push(LabeledMatrix {
                    view: Some(dataset.views()[m].clone()),
                    group: Some(dataset.groups()[g].clone()),
                    rows: dataset.features(m).to_vec(),
                    columns: dataset.samples(g).to_vec(),
                    values: dataset.block(m, g).clone(),
                });
            }
        }
        Ok(blocks)
    }

    /// Factors as `sample, group, factor, value` rows.
    pub fn factors_long(&self, selection: &Selection) -> Result<DataFrame, DataError> {
        let matrices = self.factors(selection)?;
        long_from_matrices(&matrices, SAMPLE_COLUMN, GROUP_COLUMN)
    }

    /// Weights as `feature, view, factor, value` rows.
    pub fn weights_long(&self, selection: &Selection) -> Result<DataFrame, DataError> {
        let matrices = self.weights(selection)?;
        long_from_matrices(&matrices, FEATURE_COLUMN, VIEW_COLUMN)
    }

    /// Training data as `sample, feature, view, group, value` rows; missing
    /// cells have a null `value`.
    pub fn data_long(&self, selection: &Selection) -> Result<DataFrame, DataError> {
        let dataset = self.dataset();
        let views = pick("view", dataset.views(), selection.views.as_ref())?;
        let groups = pick("group", dataset.groups(), selection.groups.as_ref())?;
        dataset.long_table_for(&views, &groups)
    }

    /// Precomputed variance explained restricted to the selection.
    pub fn variance_explained(&self, selection: &Selection) -> Result<VarianceExplained, DataError> {
        let dataset = self.dataset();
        let views = pick("view", dataset.views(), selection.views.as_ref())?;
        let groups = pick("group", dataset.groups(), selection.groups.as_ref())?;
        let factors = pick("factor", self.factor_names(), selection.factors.as_ref())?;

        let n_groups = dataset.groups().len();
        let blocks = &self.result().variance_explained;
        let mut per_factor = Array3::zeros((views.len(), groups.len(), factors.len()));
        let mut total = Array2::zeros((views.len(), groups.len()));
        for (i, &m) in views.iter().enumerate() {
            for (j, &g) in groups.iter().enumerate() {
                let block = &blocks[m * n_groups + g];
                total[[i, j]] = block.total;
                for (l, &k) in factors.iter().enumerate() {
                    per_factor[[i, j, l]] = block.per_factor[k];
                }
            }
        }
        Ok(VarianceExplained {
            views: views.iter().map(|&m| dataset.views()[m].clone()).collect(),
            groups: groups.iter().map(|&g| dataset.groups()[g].clone()).collect(),
            factors: factors.iter().map(|&k| self.factor_names()[k].clone()).collect(),
            per_factor,
            total,
        })
    }
}

/// Rows are `row, tag, factor, value`, where the tag is the matrix's group
/// (factors) or view (weights).
fn long_from_matrices(
    matrices: &[LabeledMatrix],
    row_column: &str,
    tag_column: &str,
) -> Result<DataFrame, DataError> {
    let capacity: usize = matrices.iter().map(|m| m.values.len()).sum();
    let mut rows = Vec::with_capacity(capacity);
    let mut tags = Vec::with_capacity(capacity);
    let mut factors = Vec::with_capacity(capacity);
    let mut values = Vec::with_capacity(capacity);
    for matrix in matrices {
        let tag = matrix
            .group
            .as_deref()
            .or(matrix.view.as_deref())
            .unwrap_or_default();
        for ((r, k), &value) in matrix.values.indexed_iter() {
            rows.push(matrix.rows[r].as_str());
            tags.push(tag);
            factors.push(matrix.columns[k].as_str());
            values.push(value);
        }
    }
    Ok(DataFrame::new(vec![
        Column::new(row_column.into(), rows),
        Column::new(tag_column.into(), tags),
        Column::new(FACTOR_COLUMN.into(), factors),
        Column::new(VALUE_COLUMN.into(), values),
    ])?)
}
