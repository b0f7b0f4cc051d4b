use std::fs;

use multifactor::ingest::{
    GroupAssignment, IngestInput, MatrixData, MatrixInput, SingleOmicsContainer, ViewMatrix,
    ingest_with_metadata, sample_union, view_matrix_from_wide_table,
};
use multifactor::shared::files::read_table;
use multifactor::validate::validate;
use multifactor::{DataError, Dataset, IngestWarning, ingest};
use ndarray::{Array2, array};
use polars::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

fn names(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn long_table(rows: &[(&str, &str, &str, &str, f64)]) -> DataFrame {
    DataFrame::new(vec![
        Column::new("sample".into(), rows.iter().map(|r| r.0).collect::<Vec<_>>()),
        Column::new("feature".into(), rows.iter().map(|r| r.1).collect::<Vec<_>>()),
        Column::new("view".into(), rows.iter().map(|r| r.2).collect::<Vec<_>>()),
        Column::new("group".into(), rows.iter().map(|r| r.3).collect::<Vec<_>>()),
        Column::new("value".into(), rows.iter().map(|r| r.4).collect::<Vec<_>>()),
    ])
    .expect("long table")
}

fn assert_same_blocks(left: &Dataset, right: &Dataset) {
    assert_eq!(left.views(), right.views());
    assert_eq!(left.groups(), right.groups());
    assert_eq!(left.feature_sets(), right.feature_sets());
    assert_eq!(left.sample_sets(), right.sample_sets());
    for m in 0..left.views().len() {
        for g in 0..left.groups().len() {
            let (a, b) = (left.block(m, g), right.block(m, g));
            assert_eq!(a.dim(), b.dim());
            for (x, y) in a.iter().zip(b.iter()) {
                assert!(
                    (x.is_nan() && y.is_nan()) || x == y,
                    "block ({m}, {g}) differs: {x} vs {y}"
                );
            }
        }
    }
}

#[test]
fn two_views_share_the_union_of_their_samples() {
    let a = ViewMatrix::dense(array![[1.0, 2.0, 3.0]])
        .named("A")
        .with_features(["a1"])
        .with_samples(["s1", "s2", "s3"]);
    let b = ViewMatrix::dense(array![[4.0, 5.0, 6.0], [7.0, 8.0, 9.0]])
        .named("B")
        .with_features(["b1", "b2"])
        .with_samples(["s2", "s3", "s4"]);

    let ingested = ingest(IngestInput::Matrices(MatrixInput::new(vec![a, b]))).expect("ingest");
    let dataset = ingested.dataset;
    assert_eq!(dataset.samples(0), names(&["s1", "s2", "s3", "s4"]).as_slice());

    let s4 = 3;
    let s1 = 0;
    assert!(dataset.block(0, 0).column(s4).iter().all(|v| v.is_nan()));
    assert!(dataset.block(1, 0).column(s1).iter().all(|v| v.is_nan()));
    assert_eq!(dataset.block(1, 0).column(s4).to_vec(), vec![6.0, 9.0]);
    assert_eq!(dataset.samples_metadata().map(|md| md.height()), Some(4));
    assert_eq!(dataset.features_metadata().map(|md| md.height()), Some(3));
}

#[test]
fn unobserved_view_group_pair_becomes_an_empty_block() {
    let table = long_table(&[
        ("s1", "f1", "v1", "g1", 1.0),
        ("s2", "f1", "v1", "g1", 2.0),
        ("s1", "p1", "v2", "g1", 3.0),
        ("s3", "p1", "v2", "g2", 4.0),
        ("s4", "p1", "v2", "g2", 5.0),
    ]);
    let ingested = ingest(IngestInput::from_table(table).expect("classify")).expect("ingest");
    let dataset = &ingested.dataset;

    assert_eq!(dataset.groups(), names(&["g1", "g2"]).as_slice());
    let v1 = dataset.view_index("v1").expect("v1");
    let g2 = dataset.group_index("g2").expect("g2");
    let empty = dataset.block(v1, g2);
    assert_eq!(empty.dim(), (1, 2));
    assert!(empty.iter().all(|v| v.is_nan()));
    assert!(ingested.warnings.contains(&IngestWarning::EmptyBlock {
        view: "v1".to_string(),
        group: "g2".to_string(),
    }));
}

#[test]
fn random_views_always_cover_the_sample_union() {
    let mut rng = StdRng::seed_from_u64(17);
    let pool: Vec<String> = (1..=30).map(|i| format!("s{i}")).collect();

    for _ in 0..20 {
        let n_views = rng.gen_range(2..5);
        let mut views = Vec::with_capacity(n_views);
        // A shared core keeps every pair of views overlapping.
        let core: Vec<String> = pool[..3].to_vec();
        for m in 0..n_views {
            let mut samples = core.clone();
            let mut rest = pool[3..].to_vec();
            rest.shuffle(&mut rng);
            samples.extend(rest.into_iter().take(rng.gen_range(0..10)));
            samples.shuffle(&mut rng);
            let n_features = rng.gen_range(1..4);
            let values = Array2::from_shape_fn((n_features, samples.len()), |_| rng.gen_range(-1.0..1.0));
            views.push(
                ViewMatrix::dense(values)
                    .named(format!("view{m}"))
                    .with_features((0..n_features).map(|d| format!("v{m}_f{d}")))
                    .with_samples(samples),
            );
        }

        let expected = sample_union(&views);
        let observed: Vec<Vec<String>> = views.iter().map(|v| v.samples.clone().unwrap_or_default()).collect();
        let dataset = ingest(IngestInput::Matrices(MatrixInput::new(views)))
            .expect("ingest")
            .dataset;

        assert_eq!(dataset.samples(0), expected.as_slice());
        let absent_cells: usize = observed
            .iter()
            .enumerate()
            .map(|(m, view_samples)| dataset.features(m).len() * (expected.len() - view_samples.len()))
            .sum();
        assert_eq!(dataset.missing_count(), absent_cells);
        for (m, view_samples) in observed.iter().enumerate() {
            let block = dataset.block(m, 0);
            assert_eq!(block.ncols(), expected.len());
            for (n, sample) in expected.iter().enumerate() {
                let present = view_samples.contains(sample);
                assert_eq!(block.column(n).iter().all(|v| !v.is_nan()), present);
                assert_eq!(block.column(n).iter().all(|v| v.is_nan()), !present);
            }
        }
    }
}

#[test]
fn long_table_round_trip_reconstructs_the_blocks() {
    let rna = ViewMatrix::dense(array![[1.0, 2.0, 3.0, 4.0], [5.0, f64::NAN, 7.0, 8.0]])
        .named("rna")
        .with_features(["g1", "g2"])
        .with_samples(["s1", "s2", "s3", "s4"]);
    let met = ViewMatrix::dense(array![[0.1, 0.2, 0.3, 0.4]])
        .named("met")
        .with_features(["m1"])
        .with_samples(["s1", "s2", "s3", "s4"]);
    let input = MatrixInput::new(vec![rna, met]).with_groups(["a", "a", "b", "b"]);
    let original = ingest(IngestInput::Matrices(input)).expect("ingest").dataset;

    let table = original.to_long_table().expect("flatten");
    assert_eq!(table.height(), 12);
    let input = IngestInput::from_table(table).expect("classify");
    assert_eq!(input.kind(), "long table");
    let rebuilt = ingest(input).expect("re-ingest").dataset;

    assert_same_blocks(&original, &rebuilt);
}

fn round_trip(original: &Dataset) -> Dataset {
    let table = original.to_long_table().expect("flatten");
    ingest(IngestInput::from_table(table).expect("classify"))
        .expect("re-ingest")
        .dataset
}

#[test]
fn missing_first_cell_keeps_the_sample_order() {
    let rna = ViewMatrix::dense(array![[f64::NAN, 2.0, 3.0], [5.0, 6.0, 7.0]])
        .named("rna")
        .with_features(["g1", "g2"])
        .with_samples(["s1", "s2", "s3"]);
    let met = ViewMatrix::dense(array![[0.1, 0.2, 0.3]])
        .named("met")
        .with_features(["m1"])
        .with_samples(["s1", "s2", "s3"]);
    let original = ingest(IngestInput::Matrices(MatrixInput::new(vec![rna, met])))
        .expect("ingest")
        .dataset;

    let rebuilt = round_trip(&original);
    assert_eq!(rebuilt.samples(0), &names(&["s1", "s2", "s3"]));
    assert_same_blocks(&original, &rebuilt);
}

#[test]
fn fully_missing_feature_survives_the_round_trip() {
    let rna = ViewMatrix::dense(array![[1.0, 2.0, 3.0], [f64::NAN, f64::NAN, f64::NAN]])
        .named("rna")
        .with_features(["g1", "g2"])
        .with_samples(["s1", "s2", "s3"]);
    let original = ingest(IngestInput::Matrices(MatrixInput::new(vec![rna])))
        .expect("ingest")
        .dataset;

    let rebuilt = round_trip(&original);
    assert_eq!(rebuilt.features(0), &names(&["g1", "g2"]));
    assert_eq!(rebuilt.block(0, 0).dim(), (2, 3));
    assert_same_blocks(&original, &rebuilt);
}

#[test]
fn conflicting_duplicates_fail_and_identical_ones_collapse() {
    let conflicting = long_table(&[
        ("s1", "f1", "v1", "g1", 1.0),
        ("s2", "f1", "v1", "g1", 2.0),
        ("s1", "f1", "v1", "g1", 3.0),
    ]);
    let err = ingest(IngestInput::from_table(conflicting).expect("classify")).unwrap_err();
    match err {
        DataError::DuplicateObservation { sample, feature, first, second, .. } => {
            assert_eq!((sample.as_str(), feature.as_str()), ("s1", "f1"));
            assert_eq!((first, second), (1.0, 3.0));
        }
        other => panic!("unexpected error: {other}"),
    }

    let repeated = long_table(&[
        ("s1", "f1", "v1", "g1", 1.0),
        ("s2", "f1", "v1", "g1", 2.0),
        ("s1", "f1", "v1", "g1", 1.0),
    ]);
    let dataset = ingest(IngestInput::from_table(repeated).expect("classify"))
        .expect("ingest")
        .dataset;
    assert_eq!(dataset.block(0, 0), &array![[1.0, 2.0]]);
}

#[test]
fn unclassifiable_tables_are_rejected() {
    let table = DataFrame::new(vec![
        Column::new("x".into(), vec![1.0, 2.0]),
        Column::new("y".into(), vec![3.0, 4.0]),
    ])
    .expect("table");
    let input = IngestInput::from_table(table).expect("classify");
    assert_eq!(input.kind(), "unsupported");
    assert!(matches!(ingest(input), Err(DataError::UnsupportedInputType(_))));

    let explicit = IngestInput::Unsupported("a bag of numbers".to_string());
    let message = ingest(explicit).unwrap_err().to_string();
    assert!(message.contains("a bag of numbers"));
}

#[test]
fn validation_is_idempotent_on_ingested_datasets() {
    let table = long_table(&[
        ("s1", "f1", "v1", "g1", 1.0),
        ("s2", "f1", "v1", "g2", 2.0),
        ("s2", "p1", "v2", "g2", 3.0),
    ]);
    let dataset = ingest(IngestInput::from_table(table).expect("classify"))
        .expect("ingest")
        .dataset;
    assert!(validate(&dataset).is_ok());
    assert!(validate(&dataset).is_ok());
}

#[test]
fn container_groups_follow_the_annotation_column() {
    let annotations = DataFrame::new(vec![
        Column::new("sample".into(), vec!["c1", "c2", "c3"]),
        Column::new("batch".into(), vec![Some("x"), None, Some("x")]),
    ])
    .expect("annotations");
    let container = SingleOmicsContainer {
        assay: "RNA".to_string(),
        counts: MatrixData::Dense(array![[1.0, 0.0, 3.0], [0.0, 2.0, 1.0]]),
        features: names(&["gene1", "gene2"]),
        samples: names(&["c1", "c2", "c3"]),
        annotations: Some(annotations),
    };
    let input = IngestInput::Container {
        container,
        groups: GroupAssignment::Column("batch".to_string()),
    };
    let dataset = ingest(input).expect("ingest").dataset;
    assert_eq!(dataset.views(), names(&["RNA"]).as_slice());
    assert_eq!(dataset.groups(), names(&["x", "NA"]).as_slice());
    assert_eq!(dataset.samples(0), names(&["c1", "c3"]).as_slice());
    assert_eq!(dataset.block(0, 1), &array![[0.0], [2.0]]);
    assert_eq!(dataset.samples_metadata().map(|md| md.height()), Some(3));
}

#[test]
fn wide_files_on_disk_become_views() {
    let dir = tempdir().expect("temporary directory");
    let rna_path = dir.path().join("rna.tsv");
    let prot_path = dir.path().join("protein.csv");
    fs::write(&rna_path, "feature\ts1\ts2\ts3\ng1\t1.5\t2.5\t3.5\ng2\t0.5\t0.0\t1.0\n").expect("write rna");
    fs::write(&prot_path, "feature,s2,s3,s4\np1,10,11,12\n").expect("write protein");

    let views = vec![
        view_matrix_from_wide_table(Some("rna".to_string()), &read_table(&rna_path).expect("read rna"))
            .expect("rna view"),
        view_matrix_from_wide_table(Some("protein".to_string()), &read_table(&prot_path).expect("read protein"))
            .expect("protein view"),
    ];
    let features_metadata = DataFrame::new(vec![
        Column::new("feature".into(), vec!["g1", "g2", "p1"]),
        Column::new("chromosome".into(), vec!["1", "2", "X"]),
    ])
    .expect("features metadata");

    let ingested = ingest_with_metadata(
        IngestInput::Matrices(MatrixInput::new(views)),
        None,
        Some(features_metadata),
    )
    .expect("ingest");
    let dataset = ingested.dataset;
    assert_eq!(dataset.samples(0), names(&["s1", "s2", "s3", "s4"]).as_slice());
    assert_eq!(dataset.block(1, 0)[[0, 3]], 12.0);
    let md = dataset.features_metadata().expect("features metadata");
    assert!(md.get_column_names().iter().any(|c| c.as_str() == "chromosome"));
}
