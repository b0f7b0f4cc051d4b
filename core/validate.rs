//! # Dataset Validator
//!
//! Checks every structural invariant of a [`Dataset`] before metadata synthesis
//! and before any handoff to the inference engine. Validation only reads the
//! dataset, so running it twice on a valid dataset is a no-op.

use crate::error::{DataError, Invariant};
use crate::metadata::{FEATURE_COLUMN, SAMPLE_COLUMN};
use crate::types::Dataset;
use ahash::AHashSet;
use polars::prelude::*;

/// Checks all invariants, reporting the first violation found.
pub fn validate(dataset: &Dataset) -> Result<(), DataError> {
    check_non_empty(dataset)?;
    check_unique_names(dataset)?;
    check_block_shapes(dataset)?;
    check_observed_views(dataset)?;
    check_metadata(dataset)?;
    Ok(())
}

fn check_non_empty(dataset: &Dataset) -> Result<(), DataError> {
    if dataset.views().is_empty() {
        return Err(DataError::invalid_dataset(
            Invariant::NonEmptyAxes,
            "the dataset has no views",
        ));
    }
    if dataset.groups().is_empty() {
        return Err(DataError::invalid_dataset(
            Invariant::NonEmptyAxes,
            "the dataset has no groups",
        ));
    }
    if dataset.feature_sets().len() != dataset.views().len() {
        return Err(DataError::invalid_dataset(
            Invariant::CompleteBlockGrid,
            format!(
                "{} views but {} feature lists",
                dataset.views().len(),
                dataset.feature_sets().len()
            ),
        ));
    }
    if dataset.sample_sets().len() != dataset.groups().len() {
        return Err(DataError::invalid_dataset(
            Invariant::CompleteBlockGrid,
            format!(
                "{} groups but {} sample lists",
                dataset.groups().len(),
                dataset.sample_sets().len()
            ),
        ));
    }
    for (view, features) in dataset.views().iter().zip(dataset.feature_sets()) {
        if features.is_empty() {
            return Err(DataError::invalid_dataset(
                Invariant::NonEmptyAxes,
                format!("view '{view}' has no features"),
            ));
        }
    }
    for (group, samples) in dataset.groups().iter().zip(dataset.sample_sets()) {
        if samples.is_empty() {
            return Err(DataError::invalid_dataset(
                Invariant::NonEmptyAxes,
                format!("group '{group}' has no samples"),
            ));
        }
    }
    Ok(())
}

fn check_unique_names(dataset: &Dataset) -> Result<(), DataError> {
    ensure_unique("view", dataset.views().iter())?;
    ensure_unique("group", dataset.groups().iter())?;
    ensure_unique("sample", dataset.sample_sets().iter().flatten())?;
    ensure_unique("feature", dataset.feature_sets().iter().flatten())?;
    Ok(())
}

fn ensure_unique<'a, I>(axis: &str, names: I) -> Result<(), DataError>
where
    I: Iterator<Item = &'a String>,
{
    let mut seen = AHashSet::new();
    for name in names {
        if name.is_empty() {
            return Err(DataError::invalid_dataset(
                Invariant::UniqueNames,
                format!("empty {axis} name"),
            ));
        }
        if !seen.insert(name.as_str()) {
            return Err(DataError::invalid_dataset(
                Invariant::UniqueNames,
                format!("{axis} name '{name}' occurs more than once"),
            ));
        }
    }
    Ok(())
}

fn check_block_shapes(dataset: &Dataset) -> Result<(), DataError> {
    let blocks = dataset.blocks();
    if blocks.len() != dataset.views().len() {
        return Err(DataError::invalid_dataset(
            Invariant::CompleteBlockGrid,
            format!(
                "{} views but {} rows of blocks",
                dataset.views().len(),
                blocks.len()
            ),
        ));
    }
    for (m, view) in dataset.views().iter().enumerate() {
        if blocks[m].len() != dataset.groups().len() {
            return Err(DataError::invalid_dataset(
                Invariant::CompleteBlockGrid,
                format!(
                    "view '{view}' has {} blocks for {} groups",
                    blocks[m].len(),
                    dataset.groups().len()
                ),
            ));
        }
        let n_features = dataset.features(m).len();
        for (g, group) in dataset.groups().iter().enumerate() {
            let block = &blocks[m][g];
            if block.nrows() != n_features {
                return Err(DataError::invalid_dataset(
                    Invariant::FeatureSetPerView,
                    format!(
                        "block ({view}, {group}) has {} rows but view '{view}' has {n_features} features",
                        block.nrows()
                    ),
                ));
            }
            let n_samples = dataset.samples(g).len();
            if block.ncols() != n_samples {
                return Err(DataError::invalid_dataset(
                    Invariant::SampleSetPerGroup,
                    format!(
                        "block ({view}, {group}) has {} columns but group '{group}' has {n_samples} samples",
                        block.ncols()
                    ),
                ));
            }
        }
    }
    Ok(())
}

fn check_observed_views(dataset: &Dataset) -> Result<(), DataError> {
    for (view, view_blocks) in dataset.views().iter().zip(dataset.blocks()) {
        let observed = view_blocks
            .iter()
            .any(|block| block.iter().any(|v| !v.is_nan()));
        if !observed {
            return Err(DataError::invalid_dataset(
                Invariant::ObservedView,
                format!("view '{view}' has no observed value in any group"),
            ));
        }
    }
    Ok(())
}

fn check_metadata(dataset: &Dataset) -> Result<(), DataError> {
    if let Some(table) = dataset.samples_metadata() {
        let expected: Vec<&str> = dataset.samples_with_groups().map(|(s, _)| s).collect();
        check_metadata_table("samples", table, SAMPLE_COLUMN, &expected)?;
    }
    if let Some(table) = dataset.features_metadata() {
        let expected: Vec<&str> = dataset.features_with_views().map(|(f, _)| f).collect();
        check_metadata_table("features", table, FEATURE_COLUMN, &expected)?;
    }
    Ok(())
}

fn check_metadata_table(
    label: &str,
    table: &DataFrame,
    key: &str,
    expected: &[&str],
) -> Result<(), DataError> {
    if table.height() != expected.len() {
        return Err(DataError::invalid_dataset(
            Invariant::MetadataRowCount,
            format!(
                "{label} metadata has {} rows, expected {}",
                table.height(),
                expected.len()
            ),
        ));
    }
    let keys = table
        .column(key)
        .map_err(|_| {
            DataError::invalid_dataset(
                Invariant::MetadataKeys,
                format!("{label} metadata has no '{key}' column"),
            )
        })?
        .as_materialized_series()
        .cast(&DataType::String)?;
    for (row, (found, wanted)) in keys.str()?.into_iter().zip(expected).enumerate() {
        if found != Some(*wanted) {
            return Err(DataError::invalid_dataset(
                Invariant::MetadataKeys,
                format!(
                    "{label} metadata row {} is keyed '{}', expected '{wanted}'",
                    row + 1,
                    found.unwrap_or("<missing>")
                ),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn valid_dataset() -> Dataset {
        Dataset::from_parts(
            names(&["rna", "protein"]),
            names(&["ctrl", "treated"]),
            vec![names(&["g1", "g2"]), names(&["p1"])],
            vec![names(&["s1", "s2"]), names(&["s3"])],
            vec![
                vec![array![[1.0, 2.0], [3.0, 4.0]], array![[5.0], [6.0]]],
                vec![array![[0.5, f64::NAN]], Array2::from_elem((1, 1), f64::NAN)],
            ],
        )
    }

    #[test]
    fn valid_dataset_passes_twice() {
        let dataset = valid_dataset();
        validate(&dataset).unwrap();
        validate(&dataset).unwrap();
        assert_eq!(dataset.block(0, 0), &array![[1.0, 2.0], [3.0, 4.0]]);
    }

    #[test]
    fn ragged_block_is_rejected() {
        let mut blocks = valid_dataset().blocks().to_vec();
        blocks[0][1] = array![[5.0], [6.0], [7.0]];
        let dataset = Dataset::from_parts(
            names(&["rna", "protein"]),
            names(&["ctrl", "treated"]),
            vec![names(&["g1", "g2"]), names(&["p1"])],
            vec![names(&["s1", "s2"]), names(&["s3"])],
            blocks,
        );
        let err = validate(&dataset).unwrap_err();
        assert_eq!(err.invariant(), Some(Invariant::FeatureSetPerView));
    }

    #[test]
    fn column_mismatch_is_reported_per_group() {
        let mut blocks = valid_dataset().blocks().to_vec();
        blocks[1][0] = array![[0.5]];
        let dataset = Dataset::from_parts(
            names(&["rna", "protein"]),
            names(&["ctrl", "treated"]),
            vec![names(&["g1", "g2"]), names(&["p1"])],
            vec![names(&["s1", "s2"]), names(&["s3"])],
            blocks,
        );
        let err = validate(&dataset).unwrap_err();
        assert_eq!(err.invariant(), Some(Invariant::SampleSetPerGroup));
    }

    #[test]
    fn sample_shared_between_groups_is_rejected() {
        let dataset = Dataset::from_parts(
            names(&["rna"]),
            names(&["a", "b"]),
            vec![names(&["g1"])],
            vec![names(&["s1"]), names(&["s1"])],
            vec![vec![array![[1.0]], array![[2.0]]]],
        );
        let err = validate(&dataset).unwrap_err();
        assert_eq!(err.invariant(), Some(Invariant::UniqueNames));
    }

    #[test]
    fn unobserved_view_is_rejected() {
        let dataset = Dataset::from_parts(
            names(&["rna"]),
            names(&["a"]),
            vec![names(&["g1"])],
            vec![names(&["s1", "s2"])],
            vec![vec![Array2::from_elem((1, 2), f64::NAN)]],
        );
        let err = validate(&dataset).unwrap_err();
        assert_eq!(err.invariant(), Some(Invariant::ObservedView));
    }

    #[test]
    fn empty_view_list_is_rejected() {
        let dataset = Dataset::from_parts(vec![], names(&["a"]), vec![], vec![names(&["s1"])], vec![]);
        let err = validate(&dataset).unwrap_err();
        assert_eq!(err.invariant(), Some(Invariant::NonEmptyAxes));
    }

    #[test]
    fn missing_block_row_is_rejected() {
        let dataset = Dataset::from_parts(
            names(&["rna"]),
            names(&["a", "b"]),
            vec![names(&["g1"])],
            vec![names(&["s1"]), names(&["s2"])],
            vec![vec![array![[1.0]]]],
        );
        let err = validate(&dataset).unwrap_err();
        assert_eq!(err.invariant(), Some(Invariant::CompleteBlockGrid));
    }
}
