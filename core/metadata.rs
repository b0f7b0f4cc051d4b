//! # Metadata Synthesizer
//!
//! Builds the per-sample and per-feature descriptor tables of a dataset.
//! Without caller input, the tables hold exactly the name and its originating
//! group (resp. view). Caller tables are checked against the dataset, put in
//! canonical row order, and completed with the tag column when it is absent;
//! caller columns are never overwritten.

use crate::error::{DataError, Invariant};
use crate::types::Dataset;
use ahash::AHashMap;
use polars::prelude::*;

pub const SAMPLE_COLUMN: &str = "sample";
pub const GROUP_COLUMN: &str = "group";
pub const FEATURE_COLUMN: &str = "feature";
pub const VIEW_COLUMN: &str = "view";

/// `sample`, `group` in canonical sample order.
pub fn default_samples_metadata(dataset: &Dataset) -> Result<DataFrame, DataError> {
    let (samples, groups): (Vec<&str>, Vec<&str>) = dataset.samples_with_groups().unzip();
    Ok(DataFrame::new(vec![
        Column::new(SAMPLE_COLUMN.into(), samples),
        Column::new(GROUP_COLUMN.into(), groups),
    ])?)
}

/// `feature`, `view` in canonical feature order.
pub fn default_features_metadata(dataset: &Dataset) -> Result<DataFrame, DataError> {
    let (features, views): (Vec<&str>, Vec<&str>) = dataset.features_with_views().unzip();
    Ok(DataFrame::new(vec![
        Column::new(FEATURE_COLUMN.into(), features),
        Column::new(VIEW_COLUMN.into(), views),
    ])?)
}

/// Attaches descriptor tables to a validated dataset, synthesizing whichever
/// table the caller did not supply.
pub fn attach_metadata(
    dataset: Dataset,
    samples: Option<DataFrame>,
    features: Option<DataFrame>,
) -> Result<Dataset, DataError> {
    let samples_table = match samples {
        Some(table) => {
            let (keys, tags): (Vec<&str>, Vec<&str>) = dataset.samples_with_groups().unzip();
            conform_table("samples", table, SAMPLE_COLUMN, GROUP_COLUMN, &keys, &tags)?
        }
        None => default_samples_metadata(&dataset)?,
    };
    let features_table = match features {
        Some(table) => {
            let (keys, tags): (Vec<&str>, Vec<&str>) = dataset.features_with_views().unzip();
            conform_table("features", table, FEATURE_COLUMN, VIEW_COLUMN, &keys, &tags)?
        }
        None => default_features_metadata(&dataset)?,
    };
    Ok(dataset.with_metadata(samples_table, features_table))
}

fn conform_table(
    label: &str,
    mut table: DataFrame,
    key: &str,
    tag: &str,
    keys: &[&str],
    tags: &[&str],
) -> Result<DataFrame, DataError> {
    let columns: Vec<String> = table
        .get_column_names()
        .iter()
        .map(|c| c.to_string())
        .collect();
    if !columns.iter().any(|c| c == key) {
        return Err(DataError::InvalidInput(format!(
            "{label} metadata lacks the required '{key}' column (found: {columns:?})"
        )));
    }
    if table.height() != keys.len() {
        return Err(DataError::invalid_dataset(
            Invariant::MetadataRowCount,
            format!(
                "{label} metadata has {} rows but the dataset has {}",
                table.height(),
                keys.len()
            ),
        ));
    }

    let key_values = table
        .column(key)?
        .as_materialized_series()
        .cast(&DataType::String)?;
    let mut rows: AHashMap<&str, usize> = AHashMap::with_capacity(keys.len());
    for (row, value) in key_values.str()?.into_iter().enumerate() {
        let Some(value) = value else {
            return Err(DataError::invalid_dataset(
                Invariant::MetadataKeys,
                format!("{label} metadata row {} has no '{key}' value", row + 1),
            ));
        };
        if rows.insert(value, row).is_some() {
            return Err(DataError::invalid_dataset(
                Invariant::MetadataKeys,
                format!("{label} metadata repeats the key '{value}'"),
            ));
        }
    }

    let mut order: Vec<IdxSize> = Vec::with_capacity(keys.len());
    for wanted in keys {
        let row = rows.get(wanted).ok_or_else(|| {
            DataError::invalid_dataset(
                Invariant::MetadataKeys,
                format!("{label} metadata has no row for '{wanted}'"),
            )
        })?;
        order.push(*row as IdxSize);
    }
    let order = IdxCa::from_vec("order".into(), order);
    table = table.take(&order)?;

    if !columns.iter().any(|c| c == tag) {
        table.with_column(Column::new(tag.into(), tags.to_vec()))?;
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::validate;
    use ndarray::array;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn dataset() -> Dataset {
        Dataset::from_parts(
            names(&["rna", "methylation"]),
            names(&["young", "old"]),
            vec![names(&["g1"]), names(&["cpg1", "cpg2"])],
            vec![names(&["s1", "s2"]), names(&["s3"])],
            vec![
                vec![array![[1.0, 2.0]], array![[3.0]]],
                vec![array![[0.1, 0.2], [0.3, 0.4]], array![[0.5], [0.6]]],
            ],
        )
    }

    fn strings(table: &DataFrame, column: &str) -> Vec<String> {
        table
            .column(column)
            .unwrap()
            .as_materialized_series()
            .cast(&DataType::String)
            .unwrap()
            .str()
            .unwrap()
            .into_iter()
            .map(|v| v.unwrap_or("").to_string())
            .collect()
    }

    #[test]
    fn default_tables_follow_canonical_order() {
        let dataset = attach_metadata(dataset(), None, None).unwrap();
        let samples = dataset.samples_metadata().unwrap();
        assert_eq!(samples.height(), 3);
        assert_eq!(samples.width(), 2);
        assert_eq!(strings(samples, SAMPLE_COLUMN), names(&["s1", "s2", "s3"]));
        assert_eq!(strings(samples, GROUP_COLUMN), names(&["young", "young", "old"]));

        let features = dataset.features_metadata().unwrap();
        assert_eq!(features.height(), 3);
        assert_eq!(strings(features, FEATURE_COLUMN), names(&["g1", "cpg1", "cpg2"]));
        assert_eq!(strings(features, VIEW_COLUMN), names(&["rna", "methylation", "methylation"]));
        validate(&dataset).unwrap();
    }

    #[test]
    fn caller_table_is_reordered_and_completed() {
        let table = DataFrame::new(vec![
            Column::new(SAMPLE_COLUMN.into(), vec!["s3", "s1", "s2"]),
            Column::new("age".into(), vec![71i64, 23, 30]),
        ])
        .unwrap();
        let dataset = attach_metadata(dataset(), Some(table), None).unwrap();
        let samples = dataset.samples_metadata().unwrap();
        assert_eq!(strings(samples, SAMPLE_COLUMN), names(&["s1", "s2", "s3"]));
        assert_eq!(strings(samples, "age"), names(&["23", "30", "71"]));
        assert_eq!(strings(samples, GROUP_COLUMN), names(&["young", "young", "old"]));
    }

    #[test]
    fn caller_tag_column_is_not_overwritten() {
        let table = DataFrame::new(vec![
            Column::new(SAMPLE_COLUMN.into(), vec!["s1", "s2", "s3"]),
            Column::new(GROUP_COLUMN.into(), vec!["batchA", "batchA", "batchB"]),
        ])
        .unwrap();
        let dataset = attach_metadata(dataset(), Some(table), None).unwrap();
        let samples = dataset.samples_metadata().unwrap();
        assert_eq!(strings(samples, GROUP_COLUMN), names(&["batchA", "batchA", "batchB"]));
    }

    #[test]
    fn row_count_mismatch_is_reported() {
        let table = DataFrame::new(vec![Column::new(SAMPLE_COLUMN.into(), vec!["s1", "s2"])]).unwrap();
        let err = attach_metadata(dataset(), Some(table), None).unwrap_err();
        assert_eq!(err.invariant(), Some(Invariant::MetadataRowCount));
    }

    #[test]
    fn duplicate_keys_are_reported() {
        let table = DataFrame::new(vec![Column::new(
            FEATURE_COLUMN.into(),
            vec!["g1", "g1", "cpg2"],
        )])
        .unwrap();
        let err = attach_metadata(dataset(), None, Some(table)).unwrap_err();
        assert_eq!(err.invariant(), Some(Invariant::MetadataKeys));
    }

    #[test]
    fn unknown_key_is_reported() {
        let table = DataFrame::new(vec![Column::new(
            FEATURE_COLUMN.into(),
            vec!["g1", "cpg1", "cpg9"],
        )])
        .unwrap();
        let err = attach_metadata(dataset(), None, Some(table)).unwrap_err();
        assert_eq!(err.invariant(), Some(Invariant::MetadataKeys));
    }

    #[test]
    fn missing_key_column_is_invalid_input() {
        let table = DataFrame::new(vec![Column::new("id".into(), vec!["s1", "s2", "s3"])]).unwrap();
        let err = attach_metadata(dataset(), Some(table), None).unwrap_err();
        assert!(matches!(err, DataError::InvalidInput(_)));
    }
}
