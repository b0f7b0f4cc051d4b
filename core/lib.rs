// ========================================================================================
//
//                      MULTIFACTOR: DATA CONTRACT FOR MULTI-VIEW FACTOR ANALYSIS
//
// ========================================================================================
//
// This crate turns heterogeneous user inputs (per-view matrices, long tables, single-omics
// containers) into one validated, rectangular view × group block structure, hands that
// structure to an external variational-inference engine, and exposes the trained result.
//
// Control flow: ingest::ingest -> (one ingestor) -> validate -> metadata -> Dataset.
// A Dataset is trained exactly once through model::ModelObject::train, producing a
// model::TrainedModel that results.rs slices for downstream consumers.

pub mod engine;
pub mod error;
pub mod metadata;
pub mod model;
pub mod options;
pub mod results;
pub mod types;
pub mod validate;

#[path = "../ingest/mod.rs"]
pub mod ingest;

#[path = "../shared/files.rs"]
pub mod shared_files;
pub mod shared {
    pub use super::shared_files as files;
}

pub use engine::{CommandEngine, EngineError, EngineRequest, InferenceEngine};
pub use error::{DataError, Invariant};
pub use ingest::{IngestInput, IngestWarning, Ingested, ingest};
pub use model::{ModelError, ModelObject, TrainedModel, TrainingResult};
pub use options::RunOptions;
pub use results::{LabeledMatrix, Selection, VarianceExplained};
pub use types::{Dataset, Dimensions, Likelihood};
