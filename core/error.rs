//! # Ingestion and Validation Errors
//!
//! Every failure raised while turning user input into a [`crate::Dataset`] is a
//! `DataError`. Failures are assumed to be user-input errors, so each message
//! names the offending column, view, group or invariant.
//!
//! Errors are fatal to the ingestion call that raised them: no partial dataset
//! is ever returned alongside an error. Non-fatal conditions travel as
//! [`crate::IngestWarning`] values instead.

use polars::prelude::PolarsError;
use std::fmt;
use thiserror::Error;

/// The structural invariants a [`crate::Dataset`] must satisfy before it is
/// handed to the inference engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Invariant {
    /// At least one view, one group, one feature per view and one sample per group.
    NonEmptyAxes,
    /// View, group, sample and feature names are non-empty and unique.
    UniqueNames,
    /// The block grid holds exactly one matrix per (view, group) pair.
    CompleteBlockGrid,
    /// Every block of a view has one row per feature of that view.
    FeatureSetPerView,
    /// Every block of a group has one column per sample of that group.
    SampleSetPerGroup,
    /// Every view has at least one non-missing observation.
    ObservedView,
    /// Metadata tables have one row per sample (resp. feature).
    MetadataRowCount,
    /// Metadata keys are unique and match the dataset names.
    MetadataKeys,
}

impl Invariant {
    pub fn describe(self) -> &'static str {
        match self {
            Self::NonEmptyAxes => "non-empty views, groups, features and samples",
            Self::UniqueNames => "unique non-empty names",
            Self::CompleteBlockGrid => "one block per view and group",
            Self::FeatureSetPerView => "feature set consistent within view",
            Self::SampleSetPerGroup => "sample set consistent within group",
            Self::ObservedView => "every view observed at least once",
            Self::MetadataRowCount => "metadata row count",
            Self::MetadataKeys => "metadata keys",
        }
    }
}

impl fmt::Display for Invariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// A comprehensive error type for all data ingestion and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error(
        "Unsupported input type: {0}. Expected a collection of matrices, a long table, or a single-omics container."
    )]
    UnsupportedInputType(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(
        "Conflicting duplicate observations for sample '{sample}', feature '{feature}' (view '{view}', group '{group}'): {first} vs {second}. Remove one of the rows."
    )]
    DuplicateObservation {
        sample: String,
        feature: String,
        view: String,
        group: String,
        first: f64,
        second: f64,
    },

    #[error("Invalid dataset, violated invariant '{invariant}': {detail}")]
    InvalidDataset { invariant: Invariant, detail: String },

    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DataError {
    pub(crate) fn invalid_dataset(invariant: Invariant, detail: impl Into<String>) -> Self {
        Self::InvalidDataset {
            invariant,
            detail: detail.into(),
        }
    }

    /// The violated invariant, when this is an [`DataError::InvalidDataset`].
    pub fn invariant(&self) -> Option<Invariant> {
        match self {
            Self::InvalidDataset { invariant, .. } => Some(*invariant),
            _ => None,
        }
    }
}
