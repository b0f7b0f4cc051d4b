//! # Long-Table Ingestor
//!
//! Pivots a table of `(sample, feature, view, group, value)` rows into one
//! dense feature × sample block per (view, group). The feature set of a view
//! is the union over every row tagged with that view, and the sample set of a
//! group is the union over every row tagged with that group, so a view with
//! no rows in some group still gets a fully missing block there.
//!
//! Axis order is first-seen order in the table.

use super::IngestWarning;
use crate::error::DataError;
use crate::metadata::{FEATURE_COLUMN, GROUP_COLUMN, SAMPLE_COLUMN, VIEW_COLUMN};
use crate::types::{DEFAULT_GROUP_NAME, Dataset, default_view_name};
use ahash::AHashMap;
use ndarray::Array2;
use polars::prelude::*;

pub const VALUE_COLUMN: &str = "value";

/// Columns a long table must carry. `view` and `group` are optional.
pub const REQUIRED_COLUMNS: [&str; 3] = [SAMPLE_COLUMN, FEATURE_COLUMN, VALUE_COLUMN];

/// First-seen positions of names along one axis.
#[derive(Default)]
struct AxisIndex {
    names: Vec<String>,
    lookup: AHashMap<String, usize>,
}

impl AxisIndex {
    fn position(&mut self, name: &str) -> usize {
        if let Some(&index) = self.lookup.get(name) {
            return index;
        }
        let index = self.names.len();
        self.names.push(name.to_string());
        self.lookup.insert(name.to_string(), index);
        index
    }

    fn len(&self) -> usize {
        self.names.len()
    }
}

/// Coordinates of one row: view, group, feature within view, sample within group.
#[derive(Clone, Copy)]
struct Cell {
    view: usize,
    group: usize,
    feature: usize,
    sample: usize,
}

pub fn has_long_table_columns(table: &DataFrame) -> bool {
    let names = table.get_column_names();
    REQUIRED_COLUMNS
        .iter()
        .all(|required| names.iter().any(|c| c.as_str() == *required))
}

fn text_column(table: &DataFrame, name: &str) -> Result<Series, DataError> {
    Ok(table
        .column(name)?
        .as_materialized_series()
        .cast(&DataType::String)?)
}

fn value_column(table: &DataFrame) -> Result<Vec<f64>, DataError> {
    let series = table.column(VALUE_COLUMN)?.as_materialized_series();
    let casted = series.cast(&DataType::Float64).map_err(|_| {
        DataError::InvalidInput(format!(
            "column '{VALUE_COLUMN}' has type {} and cannot be read as numbers",
            series.dtype()
        ))
    })?;
    if casted.null_count() > series.null_count() {
        return Err(DataError::InvalidInput(format!(
            "column '{VALUE_COLUMN}' contains {} non-numeric value(s)",
            casted.null_count() - series.null_count()
        )));
    }
    let values: Vec<f64> = casted
        .f64()?
        .into_iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect();
    if let Some(row) = values.iter().position(|v| v.is_infinite()) {
        return Err(DataError::InvalidInput(format!(
            "column '{VALUE_COLUMN}' holds an infinite value at row {}",
            row + 1
        )));
    }
    Ok(values)
}

fn required<'a>(value: Option<&'a str>, column: &str, row: usize) -> Result<&'a str, DataError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(DataError::InvalidInput(format!(
            "row {} has no '{column}' value",
            row + 1
        ))),
    }
}

pub(super) fn ingest_long_table(
    table: &DataFrame,
    warnings: &mut Vec<IngestWarning>,
) -> Result<Dataset, DataError> {
    if !has_long_table_columns(table) {
        let found: Vec<String> = table
            .get_column_names()
            .iter()
            .map(|c| c.to_string())
            .collect();
        return Err(DataError::InvalidInput(format!(
            "a long table needs the columns {REQUIRED_COLUMNS:?} (found: {found:?})"
        )));
    }
    if table.height() == 0 {
        return Err(DataError::InvalidInput("the long table has no rows".to_string()));
    }
    let n_rows = table.height();

    let sample_column = text_column(table, SAMPLE_COLUMN)?;
    let feature_column = text_column(table, FEATURE_COLUMN)?;
    let has_column = |name: &str| table.get_column_names().iter().any(|c| c.as_str() == name);
    let view_column = if has_column(VIEW_COLUMN) {
        Some(text_column(table, VIEW_COLUMN)?)
    } else {
        None
    };
    let group_column = if has_column(GROUP_COLUMN) {
        Some(text_column(table, GROUP_COLUMN)?)
    } else {
        None
    };
    let values = value_column(table)?;

    let default_view = default_view_name(0);
    let sample_values: Vec<Option<&str>> = sample_column.str()?.into_iter().collect();
    let feature_values: Vec<Option<&str>> = feature_column.str()?.into_iter().collect();
    let view_values: Vec<Option<&str>> = match &view_column {
        Some(series) => series.str()?.into_iter().collect(),
        None => vec![Some(default_view.as_str()); n_rows],
    };
    let group_values: Vec<Option<&str>> = match &group_column {
        Some(series) => series.str()?.into_iter().collect(),
        None => {
            log::info!("Long table has no '{GROUP_COLUMN}' column; using the single group '{DEFAULT_GROUP_NAME}'.");
            vec![Some(DEFAULT_GROUP_NAME); n_rows]
        }
    };

    // Pass 1: axis discovery.
    let mut views = AxisIndex::default();
    let mut groups = AxisIndex::default();
    let mut features: Vec<AxisIndex> = Vec::new();
    let mut samples: Vec<AxisIndex> = Vec::new();
    let mut sample_group: AHashMap<String, usize> = AHashMap::new();
    let mut cells: Vec<Cell> = Vec::with_capacity(n_rows);

    for row in 0..n_rows {
        let sample = required(sample_values[row], SAMPLE_COLUMN, row)?;
        let feature = required(feature_values[row], FEATURE_COLUMN, row)?;
        let view_name = required(view_values[row], VIEW_COLUMN, row)?;
        let group_name = required(group_values[row], GROUP_COLUMN, row)?;

        let view = views.position(view_name);
        if view == features.len() {
            features.push(AxisIndex::default());
        }
        let group = groups.position(group_name);
        if group == samples.len() {
            samples.push(AxisIndex::default());
        }

        match sample_group.get(sample) {
            Some(&owner) if owner != group => {
                return Err(DataError::InvalidInput(format!(
                    "sample '{sample}' is tagged with both group '{}' and group '{group_name}'",
                    groups.names[owner]
                )));
            }
            Some(_) => {}
            None => {
                sample_group.insert(sample.to_string(), group);
            }
        }

        cells.push(Cell {
            view,
            group,
            feature: features[view].position(feature),
            sample: samples[group].position(sample),
        });
    }

    // Pass 2: fill blocks.
    let mut blocks: Vec<Vec<Array2<f64>>> = features
        .iter()
        .map(|f| {
            samples
                .iter()
                .map(|s| Array2::from_elem((f.len(), s.len()), f64::NAN))
                .collect()
        })
        .collect();
    let mut assigned: Vec<Vec<Array2<bool>>> = features
        .iter()
        .map(|f| {
            samples
                .iter()
                .map(|s| Array2::from_elem((f.len(), s.len()), false))
                .collect()
        })
        .collect();
    let mut rows_per_block = vec![vec![0usize; groups.len()]; views.len()];
    let mut repeated = 0usize;

    for (cell, &value) in cells.iter().zip(&values) {
        let Cell {
            view,
            group,
            feature,
            sample,
        } = *cell;
        rows_per_block[view][group] += 1;
        let at = [feature, sample];
        if assigned[view][group][at] {
            let first = blocks[view][group][at];
            if first.to_bits() == value.to_bits() || (first.is_nan() && value.is_nan()) {
                repeated += 1;
                continue;
            }
            return Err(DataError::DuplicateObservation {
                sample: samples[group].names[sample].clone(),
                feature: features[view].names[feature].clone(),
                view: views.names[view].clone(),
                group: groups.names[group].clone(),
                first,
                second: value,
            });
        }
        assigned[view][group][at] = true;
        blocks[view][group][at] = value;
    }
    if repeated > 0 {
        log::debug!("Ignored {repeated} repeated long-table row(s) carrying identical values.");
    }

    for (m, view) in views.names.iter().enumerate() {
        for (g, group) in groups.names.iter().enumerate() {
            if rows_per_block[m][g] == 0 {
                warnings.push(IngestWarning::EmptyBlock {
                    view: view.clone(),
                    group: group.clone(),
                });
            }
        }
    }

    Ok(Dataset::from_parts(
        views.names,
        groups.names,
        features.into_iter().map(|f| f.names).collect(),
        samples.into_iter().map(|s| s.names).collect(),
        blocks,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn pivot(table: &DataFrame) -> Result<(Dataset, Vec<IngestWarning>), DataError> {
        let mut warnings = Vec::new();
        let dataset = ingest_long_table(table, &mut warnings)?;
        Ok((dataset, warnings))
    }

    fn long_table(rows: &[(&str, &str, &str, &str, f64)]) -> DataFrame {
        DataFrame::new(vec![
            Column::new(SAMPLE_COLUMN.into(), rows.iter().map(|r| r.0).collect::<Vec<_>>()),
            Column::new(FEATURE_COLUMN.into(), rows.iter().map(|r| r.1).collect::<Vec<_>>()),
            Column::new(VIEW_COLUMN.into(), rows.iter().map(|r| r.2).collect::<Vec<_>>()),
            Column::new(GROUP_COLUMN.into(), rows.iter().map(|r| r.3).collect::<Vec<_>>()),
            Column::new(VALUE_COLUMN.into(), rows.iter().map(|r| r.4).collect::<Vec<_>>()),
        ])
        .unwrap()
    }

    #[test]
    fn pivots_each_view_and_group() {
        let table = long_table(&[
            ("s1", "g1", "rna", "a", 1.0),
            ("s2", "g1", "rna", "a", 2.0),
            ("s1", "g2", "rna", "a", 3.0),
            ("s3", "g1", "rna", "b", 4.0),
            ("s1", "p1", "protein", "a", 5.0),
            ("s3", "p1", "protein", "b", 6.0),
        ]);
        let (dataset, warnings) = pivot(&table).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(dataset.views(), &["rna".to_string(), "protein".to_string()]);
        assert_eq!(dataset.groups(), &["a".to_string(), "b".to_string()]);
        assert_eq!(dataset.features(0), &["g1".to_string(), "g2".to_string()]);
        assert_eq!(dataset.samples(0), &["s1".to_string(), "s2".to_string()]);

        let rna_a = dataset.block(0, 0);
        assert_abs_diff_eq!(rna_a[[0, 0]], 1.0);
        assert_abs_diff_eq!(rna_a[[0, 1]], 2.0);
        assert_abs_diff_eq!(rna_a[[1, 0]], 3.0);
        assert!(rna_a[[1, 1]].is_nan());

        let protein_a = dataset.block(1, 0);
        assert_eq!(protein_a.dim(), (1, 2));
        assert!(protein_a[[0, 1]].is_nan());
    }

    #[test]
    fn absent_view_group_pair_is_fully_missing_with_warning() {
        let table = long_table(&[
            ("s1", "f1", "v1", "g1", 1.0),
            ("s2", "f1", "v1", "g1", 2.0),
            ("s1", "h1", "v2", "g1", 0.5),
            ("s3", "h1", "v2", "g2", 0.7),
        ]);
        let (dataset, warnings) = pivot(&table).unwrap();
        let block = dataset.block(0, 1);
        assert_eq!(block.dim(), (1, 1));
        assert!(block.iter().all(|v| v.is_nan()));
        assert_eq!(
            warnings,
            vec![IngestWarning::EmptyBlock {
                view: "v1".to_string(),
                group: "g2".to_string()
            }]
        );
    }

    #[test]
    fn conflicting_duplicates_are_rejected() {
        let table = long_table(&[
            ("s1", "f1", "v1", "g1", 1.0),
            ("s1", "f1", "v1", "g1", 2.0),
        ]);
        match pivot(&table) {
            Err(DataError::DuplicateObservation {
                sample,
                feature,
                first,
                second,
                ..
            }) => {
                assert_eq!(sample, "s1");
                assert_eq!(feature, "f1");
                assert_abs_diff_eq!(first, 1.0);
                assert_abs_diff_eq!(second, 2.0);
            }
            other => panic!("expected a duplicate observation error, got {other:?}"),
        }
    }

    #[test]
    fn identical_duplicates_are_collapsed() {
        let table = long_table(&[
            ("s1", "f1", "v1", "g1", 1.0),
            ("s2", "f1", "v1", "g1", 4.0),
            ("s1", "f1", "v1", "g1", 1.0),
        ]);
        let (dataset, _) = pivot(&table).unwrap();
        assert_eq!(dataset.block(0, 0).dim(), (1, 2));
        assert_abs_diff_eq!(dataset.block(0, 0)[[0, 0]], 1.0);
    }

    #[test]
    fn view_and_group_columns_are_optional() {
        let table = DataFrame::new(vec![
            Column::new(SAMPLE_COLUMN.into(), vec!["s1", "s2"]),
            Column::new(FEATURE_COLUMN.into(), vec!["f1", "f1"]),
            Column::new(VALUE_COLUMN.into(), vec![Some(0.5), None]),
        ])
        .unwrap();
        let (dataset, _) = pivot(&table).unwrap();
        assert_eq!(dataset.views(), &["view_1".to_string()]);
        assert_eq!(dataset.groups(), &[DEFAULT_GROUP_NAME.to_string()]);
        assert!(dataset.block(0, 0)[[0, 1]].is_nan());
    }

    #[test]
    fn text_values_are_invalid_input() {
        let table = DataFrame::new(vec![
            Column::new(SAMPLE_COLUMN.into(), vec!["s1", "s2"]),
            Column::new(FEATURE_COLUMN.into(), vec!["f1", "f1"]),
            Column::new(VALUE_COLUMN.into(), vec!["1.5", "high"]),
        ])
        .unwrap();
        assert!(matches!(pivot(&table), Err(DataError::InvalidInput(msg)) if msg.contains("non-numeric")));
    }

    #[test]
    fn missing_required_column_is_invalid_input() {
        let table = DataFrame::new(vec![
            Column::new(SAMPLE_COLUMN.into(), vec!["s1"]),
            Column::new(VALUE_COLUMN.into(), vec![1.0]),
        ])
        .unwrap();
        assert!(!has_long_table_columns(&table));
        assert!(matches!(pivot(&table), Err(DataError::InvalidInput(msg)) if msg.contains("feature")));
    }

    #[test]
    fn sample_in_two_groups_is_rejected() {
        let table = long_table(&[
            ("s1", "f1", "v1", "g1", 1.0),
            ("s1", "f2", "v1", "g2", 2.0),
        ]);
        assert!(matches!(pivot(&table), Err(DataError::InvalidInput(msg)) if msg.contains("s1")));
    }
}
