//! # External-Container Adapter
//!
//! A single-omics container is one feature × sample matrix (for example a
//! gene × cell expression matrix) with optional per-sample annotations. It
//! becomes a dataset with exactly one view, split into one group per
//! distinct group label.

use super::IngestWarning;
use super::matrices::{MatrixData, gather_block, partition_by_label};
use crate::error::DataError;
use crate::metadata::SAMPLE_COLUMN;
use crate::types::{DEFAULT_GROUP_NAME, Dataset, MISSING_GROUP_LABEL};
use ndarray::Array2;
use polars::prelude::*;

/// A single-assay container: one matrix plus per-sample annotations.
#[derive(Debug, Clone)]
pub struct SingleOmicsContainer {
    /// Assay name, used as the name of the only view.
    pub assay: String,
    /// Features in rows, samples in columns.
    pub counts: MatrixData,
    pub features: Vec<String>,
    pub samples: Vec<String>,
    /// One row per sample, in the order of `samples`.
    pub annotations: Option<DataFrame>,
}

/// How the container's samples are split into groups.
#[derive(Debug, Clone, Default)]
pub enum GroupAssignment {
    /// Every sample in one implicit group.
    #[default]
    None,
    /// Look the labels up in this annotation column.
    Column(String),
    /// One label per sample; `None` is an undefined label.
    Labels(Vec<Option<String>>),
}

impl SingleOmicsContainer {
    fn group_labels(
        &self,
        assignment: &GroupAssignment,
        warnings: &mut Vec<IngestWarning>,
    ) -> Result<Vec<String>, DataError> {
        let labels: Vec<Option<String>> = match assignment {
            GroupAssignment::None => {
                log::info!(
                    "No group assignment given for assay '{}'; all samples form the group '{DEFAULT_GROUP_NAME}'.",
                    self.assay
                );
                warnings.push(IngestWarning::ImplicitGroup);
                return Ok(vec![DEFAULT_GROUP_NAME.to_string(); self.samples.len()]);
            }
            GroupAssignment::Column(name) => {
                let annotations = self.annotations.as_ref().ok_or_else(|| {
                    DataError::InvalidInput(format!(
                        "group column '{name}' requested but assay '{}' has no sample annotations",
                        self.assay
                    ))
                })?;
                if !annotations
                    .get_column_names()
                    .iter()
                    .any(|c| c.as_str() == name)
                {
                    return Err(DataError::InvalidInput(format!(
                        "group column '{name}' not found in the sample annotations of assay '{}'",
                        self.assay
                    )));
                }
                let column = annotations
                    .column(name)?
                    .as_materialized_series()
                    .cast(&DataType::String)?;
                column
                    .str()?
                    .into_iter()
                    .map(|v| v.map(str::to_string))
                    .collect()
            }
            GroupAssignment::Labels(labels) => labels.clone(),
        };

        if labels.len() != self.samples.len() {
            return Err(DataError::InvalidInput(format!(
                "{} group labels for {} samples in assay '{}'",
                labels.len(),
                self.samples.len(),
                self.assay
            )));
        }
        Ok(labels
            .into_iter()
            .map(|label| match label {
                Some(l) if !l.is_empty() => l,
                _ => MISSING_GROUP_LABEL.to_string(),
            })
            .collect())
    }
}

/// Splits the container into per-group blocks. Annotations, when present,
/// come back keyed by sample so they can serve as sample metadata.
pub(super) fn ingest_container(
    container: SingleOmicsContainer,
    assignment: &GroupAssignment,
    warnings: &mut Vec<IngestWarning>,
) -> Result<(Dataset, Option<DataFrame>), DataError> {
    if container.assay.is_empty() {
        return Err(DataError::InvalidInput("the container's assay has no name".to_string()));
    }
    let (n_rows, n_cols) = (container.counts.nrows(), container.counts.ncols());
    if n_rows != container.features.len() || n_cols != container.samples.len() {
        return Err(DataError::InvalidInput(format!(
            "assay '{}' is {n_rows} x {n_cols} but names {} features and {} samples",
            container.assay,
            container.features.len(),
            container.samples.len()
        )));
    }
    if n_rows == 0 || n_cols == 0 {
        return Err(DataError::InvalidInput(format!(
            "assay '{}' is empty",
            container.assay
        )));
    }
    if let Some(annotations) = &container.annotations {
        if annotations.height() != n_cols {
            return Err(DataError::InvalidInput(format!(
                "assay '{}' has {n_cols} samples but {} annotation rows",
                container.assay,
                annotations.height()
            )));
        }
    }

    let labels = container.group_labels(assignment, warnings)?;
    let (groups, members) = partition_by_label(&labels);

    let SingleOmicsContainer {
        assay,
        counts,
        features,
        samples,
        annotations,
    } = container;
    let matrix = counts.normalize();
    matrix.ensure_numeric(&assay)?;

    let blocks: Vec<Array2<f64>> = members
        .iter()
        .map(|positions| {
            let columns: Vec<Option<usize>> = positions.iter().map(|&p| Some(p)).collect();
            gather_block(&matrix, &columns)
        })
        .collect();
    let group_samples: Vec<Vec<String>> = members
        .iter()
        .map(|positions| positions.iter().map(|&p| samples[p].clone()).collect())
        .collect();

    let sample_table = match annotations {
        Some(mut table) => {
            if !table
                .get_column_names()
                .iter()
                .any(|c| c.as_str() == SAMPLE_COLUMN)
            {
                table.with_column(Column::new(SAMPLE_COLUMN.into(), samples.clone()))?;
            }
            Some(table)
        }
        None => None,
    };

    let dataset = Dataset::from_parts(
        vec![assay],
        groups,
        vec![features],
        group_samples,
        vec![blocks],
    );
    Ok((dataset, sample_table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn container(annotations: Option<DataFrame>) -> SingleOmicsContainer {
        SingleOmicsContainer {
            assay: "RNA".to_string(),
            counts: MatrixData::Dense(array![[1.0, 0.0, 3.0, 4.0], [0.0, 2.0, 0.0, 1.0]]),
            features: vec!["CD3E".to_string(), "MS4A1".to_string()],
            samples: ["c1", "c2", "c3", "c4"].map(String::from).to_vec(),
            annotations,
        }
    }

    fn annotations() -> DataFrame {
        DataFrame::new(vec![
            Column::new("batch".into(), vec![Some("b1"), Some("b2"), None, Some("b1")]),
            Column::new("depth".into(), vec![100i64, 200, 300, 400]),
        ])
        .unwrap()
    }

    #[test]
    fn splits_by_annotation_column_with_na_group() {
        let mut warnings = Vec::new();
        let (dataset, table) = ingest_container(
            container(Some(annotations())),
            &GroupAssignment::Column("batch".to_string()),
            &mut warnings,
        )
        .unwrap();
        assert!(warnings.is_empty());
        assert_eq!(dataset.views(), &["RNA".to_string()]);
        assert_eq!(
            dataset.groups(),
            &["b1".to_string(), "b2".to_string(), MISSING_GROUP_LABEL.to_string()]
        );
        assert_eq!(dataset.samples(0), &["c1".to_string(), "c4".to_string()]);
        assert_eq!(dataset.block(0, 0), &array![[1.0, 4.0], [0.0, 1.0]]);
        assert_eq!(dataset.block(0, 2), &array![[3.0], [0.0]]);

        let table = table.unwrap();
        assert!(table.column(SAMPLE_COLUMN).is_ok());
        assert_eq!(table.height(), 4);
    }

    #[test]
    fn missing_column_is_invalid_input() {
        let mut warnings = Vec::new();
        let err = ingest_container(
            container(Some(annotations())),
            &GroupAssignment::Column("condition".to_string()),
            &mut warnings,
        )
        .unwrap_err();
        assert!(matches!(err, DataError::InvalidInput(msg) if msg.contains("condition")));
    }

    #[test]
    fn no_assignment_gives_one_implicit_group() {
        let mut warnings = Vec::new();
        let (dataset, table) =
            ingest_container(container(None), &GroupAssignment::None, &mut warnings).unwrap();
        assert_eq!(dataset.groups(), &[DEFAULT_GROUP_NAME.to_string()]);
        assert_eq!(dataset.samples(0).len(), 4);
        assert_eq!(warnings, vec![IngestWarning::ImplicitGroup]);
        assert!(table.is_none());
    }

    #[test]
    fn explicit_labels_must_cover_every_sample() {
        let mut warnings = Vec::new();
        let labels = GroupAssignment::Labels(vec![Some("a".to_string()), None]);
        assert!(matches!(
            ingest_container(container(None), &labels, &mut warnings),
            Err(DataError::InvalidInput(_))
        ));

        let labels = GroupAssignment::Labels(vec![
            Some("a".to_string()),
            None,
            Some("a".to_string()),
            Some(String::new()),
        ]);
        let (dataset, _) = ingest_container(container(None), &labels, &mut warnings).unwrap();
        assert_eq!(dataset.groups(), &["a".to_string(), MISSING_GROUP_LABEL.to_string()]);
        assert_eq!(dataset.samples(1), &["c2".to_string(), "c4".to_string()]);
    }
}
