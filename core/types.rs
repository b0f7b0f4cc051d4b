//! The canonical data contract: a grid of feature × sample blocks indexed by
//! (view, group), plus the names along every axis.
//!
//! Missing cells hold `f64::NAN`. A true zero is an observation; NaN is not.

use crate::error::DataError;
use crate::validate::validate;
use ahash::AHashMap;
use ndarray::Array2;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of the implicit group used when no group assignment is supplied.
pub const DEFAULT_GROUP_NAME: &str = "group1";
/// Group label assigned to samples whose group is missing or undefined.
pub const MISSING_GROUP_LABEL: &str = "NA";

pub fn default_view_name(index: usize) -> String {
    format!("view_{}", index + 1)
}

pub fn default_sample_name(index: usize) -> String {
    format!("sample_{}", index + 1)
}

pub fn default_feature_name(index: usize, view: &str) -> String {
    format!("feature_{}_{view}", index + 1)
}

pub fn default_factor_name(index: usize) -> String {
    format!("Factor{}", index + 1)
}

/// Observation model of a view, forwarded verbatim to the inference engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Likelihood {
    /// Continuous data.
    Gaussian,
    /// Non-negative count data.
    Poisson,
    /// Binary data.
    Bernoulli,
}

impl Likelihood {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gaussian => "gaussian",
            Self::Poisson => "poisson",
            Self::Bernoulli => "bernoulli",
        }
    }

    /// Guesses the observation model from the observed (non-NaN) values:
    /// all 0/1 is binary, all non-negative integers is count data, anything
    /// else (including no observation at all) is continuous.
    pub fn infer<I>(values: I) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        let mut observed = false;
        let mut binary = true;
        let mut count = true;
        for value in values {
            if value.is_nan() {
                continue;
            }
            observed = true;
            if value != 0.0 && value != 1.0 {
                binary = false;
            }
            if value < 0.0 || value.fract() != 0.0 {
                count = false;
            }
            if !binary && !count {
                break;
            }
        }

        match (observed, binary, count) {
            (false, _, _) => Self::Gaussian,
            (true, true, _) => Self::Bernoulli,
            (true, false, true) => Self::Poisson,
            _ => Self::Gaussian,
        }
    }
}

impl fmt::Display for Likelihood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Likelihood {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gaussian" | "continuous" => Ok(Self::Gaussian),
            "poisson" | "count" => Ok(Self::Poisson),
            "bernoulli" | "binary" => Ok(Self::Bernoulli),
            other => Err(format!(
                "unknown likelihood '{other}' (expected gaussian, poisson or bernoulli)"
            )),
        }
    }
}

/// Sizes along every axis. `factors` is 0 until the model is trained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimensions {
    /// M
    pub views: usize,
    /// G
    pub groups: usize,
    /// D[m]
    pub features: Vec<usize>,
    /// N[g]
    pub samples: Vec<usize>,
    /// K
    pub factors: usize,
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "M (views): {}", self.views)?;
        writeln!(f, "G (groups): {}", self.groups)?;
        writeln!(f, "D (features per view): {:?}", self.features)?;
        writeln!(f, "N (samples per group): {:?}", self.samples)?;
        write!(f, "K (factors): {}", self.factors)
    }
}

/// The validated, rectangular multi-view / multi-group data structure.
///
/// `blocks[m][g]` has one row per feature of view `m` and one column per sample
/// of group `g`. A `Dataset` is built once by [`crate::ingest`]; afterwards it
/// only changes by attaching metadata or renaming axes, each of which returns
/// a new value.
#[derive(Debug, Clone)]
pub struct Dataset {
    views: Vec<String>,
    groups: Vec<String>,
    features: Vec<Vec<String>>,
    samples: Vec<Vec<String>>,
    blocks: Vec<Vec<Array2<f64>>>,
    samples_metadata: Option<DataFrame>,
    features_metadata: Option<DataFrame>,
}

impl Dataset {
    /// Assembles a dataset from its parts without checking any invariant.
    /// Run [`crate::validate::validate`] before relying on the result.
    pub fn from_parts(
        views: Vec<String>,
        groups: Vec<String>,
        features: Vec<Vec<String>>,
        samples: Vec<Vec<String>>,
        blocks: Vec<Vec<Array2<f64>>>,
    ) -> Self {
        Self {
            views,
            groups,
            features,
            samples,
            blocks,
            samples_metadata: None,
            features_metadata: None,
        }
    }

    pub fn views(&self) -> &[String] {
        &self.views
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Feature names of view `m`.
    pub fn features(&self, m: usize) -> &[String] {
        &self.features[m]
    }

    /// Sample names of group `g`.
    pub fn samples(&self, g: usize) -> &[String] {
        &self.samples[g]
    }

    pub fn feature_sets(&self) -> &[Vec<String>] {
        &self.features
    }

    pub fn sample_sets(&self) -> &[Vec<String>] {
        &self.samples
    }

    /// The feature × sample block of view `m` and group `g`.
    pub fn block(&self, m: usize, g: usize) -> &Array2<f64> {
        &self.blocks[m][g]
    }

    pub fn blocks(&self) -> &[Vec<Array2<f64>>] {
        &self.blocks
    }

    pub fn view_index(&self, name: &str) -> Option<usize> {
        self.views.iter().position(|v| v == name)
    }

    pub fn group_index(&self, name: &str) -> Option<usize> {
        self.groups.iter().position(|g| g == name)
    }

    /// Total number of samples summed over groups.
    pub fn sample_count(&self) -> usize {
        self.samples.iter().map(Vec::len).sum()
    }

    /// Total number of features summed over views.
    pub fn feature_count(&self) -> usize {
        self.features.iter().map(Vec::len).sum()
    }

    /// Samples in canonical order (group-major), each tagged with its group.
    pub fn samples_with_groups(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.groups.iter().zip(&self.samples).flat_map(|(group, samples)| {
            samples.iter().map(move |s| (s.as_str(), group.as_str()))
        })
    }

    /// Features in canonical order (view-major), each tagged with its view.
    pub fn features_with_views(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.views.iter().zip(&self.features).flat_map(|(view, features)| {
            features.iter().map(move |f| (f.as_str(), view.as_str()))
        })
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            views: self.views.len(),
            groups: self.groups.len(),
            features: self.features.iter().map(Vec::len).collect(),
            samples: self.samples.iter().map(Vec::len).collect(),
            factors: 0,
        }
    }

    /// Number of missing (NaN) cells across all blocks.
    pub fn missing_count(&self) -> usize {
        self.blocks
            .iter()
            .flatten()
            .map(|block| block.iter().filter(|v| v.is_nan()).count())
            .sum()
    }

    pub fn samples_metadata(&self) -> Option<&DataFrame> {
        self.samples_metadata.as_ref()
    }

    pub fn features_metadata(&self) -> Option<&DataFrame> {
        self.features_metadata.as_ref()
    }

    pub(crate) fn with_metadata(mut self, samples: DataFrame, features: DataFrame) -> Self {
        self.samples_metadata = Some(samples);
        self.features_metadata = Some(features);
        self
    }

    pub(crate) fn feature_sets_mut(&mut self) -> &mut [Vec<String>] {
        &mut self.features
    }

    /// One likelihood per view, guessed from the observed values of that view.
    pub fn infer_likelihoods(&self) -> Vec<Likelihood> {
        self.blocks
            .iter()
            .map(|view_blocks| {
                Likelihood::infer(view_blocks.iter().flat_map(|block| block.iter().copied()))
            })
            .collect()
    }

    /// Returns a copy with new view names. The metadata `view` column follows
    /// the rename only when it holds the synthesized tags; a caller-supplied
    /// column is left as it is.
    pub fn rename_views(&self, names: Vec<String>) -> Result<Self, DataError> {
        rename_mapping("view", &self.views, &names)?;
        let old_tags: Vec<String> = self.features_with_views().map(|(_, v)| v.to_string()).collect();
        let mut renamed = self.clone();
        renamed.views = names;
        let new_tags: Vec<String> = renamed.features_with_views().map(|(_, v)| v.to_string()).collect();
        if let Some(table) = renamed.features_metadata.take() {
            renamed.features_metadata = Some(retag_if_synthesized(
                table,
                crate::metadata::VIEW_COLUMN,
                &old_tags,
                new_tags,
            )?);
        }
        validate(&renamed)?;
        Ok(renamed)
    }

    /// Returns a copy with new group names. The metadata `group` column
    /// follows the rename only when it holds the synthesized tags.
    pub fn rename_groups(&self, names: Vec<String>) -> Result<Self, DataError> {
        rename_mapping("group", &self.groups, &names)?;
        let old_tags: Vec<String> = self.samples_with_groups().map(|(_, g)| g.to_string()).collect();
        let mut renamed = self.clone();
        renamed.groups = names;
        let new_tags: Vec<String> = renamed.samples_with_groups().map(|(_, g)| g.to_string()).collect();
        if let Some(table) = renamed.samples_metadata.take() {
            renamed.samples_metadata = Some(retag_if_synthesized(
                table,
                crate::metadata::GROUP_COLUMN,
                &old_tags,
                new_tags,
            )?);
        }
        validate(&renamed)?;
        Ok(renamed)
    }

    /// Returns a copy with new sample names, one list per group.
    pub fn rename_samples(&self, names: Vec<Vec<String>>) -> Result<Self, DataError> {
        let mapping = rename_nested_mapping("sample", &self.samples, &names)?;
        let mut renamed = self.clone();
        renamed.samples = names;
        if let Some(table) = renamed.samples_metadata.take() {
            renamed.samples_metadata = Some(rename_column_values(
                table,
                crate::metadata::SAMPLE_COLUMN,
                &mapping,
            )?);
        }
        validate(&renamed)?;
        Ok(renamed)
    }

    /// Returns a copy with new feature names, one list per view.
    pub fn rename_features(&self, names: Vec<Vec<String>>) -> Result<Self, DataError> {
        let mapping = rename_nested_mapping("feature", &self.features, &names)?;
        let mut renamed = self.clone();
        renamed.features = names;
        if let Some(table) = renamed.features_metadata.take() {
            renamed.features_metadata = Some(rename_column_values(
                table,
                crate::metadata::FEATURE_COLUMN,
                &mapping,
            )?);
        }
        validate(&renamed)?;
        Ok(renamed)
    }
}

fn rename_mapping(
    axis: &str,
    old: &[String],
    new: &[String],
) -> Result<AHashMap<String, String>, DataError> {
    if old.len() != new.len() {
        return Err(DataError::InvalidInput(format!(
            "expected {} {axis} names, got {}",
            old.len(),
            new.len()
        )));
    }
    Ok(old.iter().cloned().zip(new.iter().cloned()).collect())
}

fn rename_nested_mapping(
    axis: &str,
    old: &[Vec<String>],
    new: &[Vec<String>],
) -> Result<AHashMap<String, String>, DataError> {
    if old.len() != new.len() {
        return Err(DataError::InvalidInput(format!(
            "expected {} lists of {axis} names, got {}",
            old.len(),
            new.len()
        )));
    }
    let mut mapping = AHashMap::new();
    for (old_names, new_names) in old.iter().zip(new) {
        mapping.extend(rename_mapping(axis, old_names, new_names)?);
    }
    Ok(mapping)
}

/// Replaces a tag column with `new_tags` when its rows are exactly
/// `old_tags`, i.e. when the column was synthesized. Any other column, or a
/// table without it, is returned unchanged.
fn retag_if_synthesized(
    mut table: DataFrame,
    column: &str,
    old_tags: &[String],
    new_tags: Vec<String>,
) -> Result<DataFrame, DataError> {
    if !table.get_column_names().iter().any(|c| c.as_str() == column) {
        return Ok(table);
    }
    let values = table
        .column(column)?
        .as_materialized_series()
        .cast(&DataType::String)?;
    let synthesized = values.len() == old_tags.len()
        && values
            .str()?
            .into_iter()
            .zip(old_tags)
            .all(|(value, tag)| value == Some(tag.as_str()));
    if synthesized {
        table.with_column(Column::new(column.into(), new_tags))?;
    }
    Ok(table)
}

/// Rewrites the values of a string column through `mapping`; values without
/// an entry are kept. Tables lacking the column are returned unchanged.
fn rename_column_values(
    mut table: DataFrame,
    column: &str,
    mapping: &AHashMap<String, String>,
) -> Result<DataFrame, DataError> {
    if !table.get_column_names().iter().any(|c| c.as_str() == column) {
        return Ok(table);
    }
    let values = table
        .column(column)?
        .as_materialized_series()
        .cast(&DataType::String)?;
    let renamed: Vec<Option<String>> = values
        .str()?
        .into_iter()
        .map(|value| {
            value.map(|v| mapping.get(v).cloned().unwrap_or_else(|| v.to_string()))
        })
        .collect();
    table.with_column(Column::new(column.into(), renamed))?;
    Ok(table)
}
