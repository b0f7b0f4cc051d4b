//! # Inference-Engine Boundary
//!
//! The variational inference itself runs outside this crate. This module
//! defines what crosses the boundary: an [`EngineRequest`] going out
//! (sample-major blocks, likelihoods, names, options) and the path of a
//! result artifact coming back. An engine is anything implementing
//! [`InferenceEngine`]; [`CommandEngine`] drives an external program.
//!
//! The call blocks until the engine returns. There is no timeout and no
//! retry here; failures are passed through as they were reported.

use crate::options::RunOptions;
use crate::shared::files::write_matrix_tsv;
use crate::types::{Dataset, Likelihood};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// File name of the request manifest inside the engine's working directory.
pub const REQUEST_FILE: &str = "request.toml";
/// Artifact name expected when the engine does not print one.
pub const RESULT_FILE: &str = "result.toml";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to prepare the engine request: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize the engine request: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Could not start the inference engine '{program}': {source}")]
    Launch {
        program: String,
        source: std::io::Error,
    },

    #[error("The inference engine failed ({status}):\n{stderr}")]
    Failed { status: String, stderr: String },

    #[error("The inference engine finished but no result artifact was found at '{0}'")]
    MissingArtifact(PathBuf),

    /// Any other failure reported by an engine implementation.
    #[error("{0}")]
    Other(String),
}

/// One (view, group) block, transposed: samples in rows, features in columns.
#[derive(Debug, Clone)]
pub struct EngineBlock {
    pub view: String,
    pub group: String,
    pub values: Array2<f64>,
}

/// Everything the engine needs for one training run.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub views: Vec<String>,
    pub groups: Vec<String>,
    /// Sample names per group.
    pub samples: Vec<Vec<String>>,
    /// Feature names per view.
    pub features: Vec<Vec<String>>,
    pub likelihoods: Vec<Likelihood>,
    /// View-major: block `(m, g)` is at `m * groups.len() + g`.
    pub blocks: Vec<EngineBlock>,
    pub options: RunOptions,
}

impl EngineRequest {
    /// Builds the request from a validated dataset and resolved options.
    pub fn from_dataset(dataset: &Dataset, options: &RunOptions) -> Self {
        let mut blocks = Vec::with_capacity(dataset.views().len() * dataset.groups().len());
        for (m, view) in dataset.views().iter().enumerate() {
            for (g, group) in dataset.groups().iter().enumerate() {
                blocks.push(EngineBlock {
                    view: view.clone(),
                    group: group.clone(),
                    values: dataset.block(m, g).t().to_owned(),
                });
            }
        }
        Self {
            views: dataset.views().to_vec(),
            groups: dataset.groups().to_vec(),
            samples: dataset.sample_sets().to_vec(),
            features: dataset.feature_sets().to_vec(),
            likelihoods: options.likelihoods().to_vec(),
            blocks,
            options: options.clone(),
        }
    }

    pub fn block(&self, m: usize, g: usize) -> &EngineBlock {
        &self.blocks[m * self.groups.len() + g]
    }

    /// Number of factors requested, 0 when unset.
    pub fn num_factors(&self) -> usize {
        self.options.model.num_factors.unwrap_or(0)
    }
}

/// Anything that turns a request into a result artifact on disk.
pub trait InferenceEngine {
    /// Runs inference to completion and returns the artifact path.
    fn run(&mut self, request: &EngineRequest) -> Result<PathBuf, EngineError>;
}

/// Block file entry of a [`RequestManifest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockFile {
    pub view: String,
    pub group: String,
    /// TSV relative to the manifest: samples in rows, features in columns.
    pub path: String,
}

/// On-disk form of an [`EngineRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestManifest {
    /// Where the engine must write its [`crate::TrainingResult`].
    pub output: String,
    pub views: Vec<String>,
    pub groups: Vec<String>,
    pub likelihoods: Vec<Likelihood>,
    pub samples: Vec<Vec<String>>,
    pub features: Vec<Vec<String>>,
    pub blocks: Vec<BlockFile>,
    pub options: RunOptions,
}

fn block_file_name(m: usize, g: usize) -> String {
    format!("block_v{}_g{}.tsv", m + 1, g + 1)
}

/// Writes the manifest and one TSV per block into `dir`, returning the
/// manifest path.
pub fn write_request(dir: &Path, request: &EngineRequest) -> Result<PathBuf, EngineError> {
    fs::create_dir_all(dir)?;
    // The engine runs inside `dir`, so every path handed to it is absolute.
    let dir = &fs::canonicalize(dir)?;
    let mut block_files = Vec::with_capacity(request.blocks.len());
    for (m, view_features) in request.features.iter().enumerate() {
        for (g, group_samples) in request.samples.iter().enumerate() {
            let block = request.block(m, g);
            let name = block_file_name(m, g);
            write_matrix_tsv(
                &dir.join(&name),
                "sample",
                group_samples,
                view_features,
                block.values.view(),
            )?;
            block_files.push(BlockFile {
                view: block.view.clone(),
                group: block.group.clone(),
                path: name,
            });
        }
    }

    let manifest = RequestManifest {
        output: dir.join(RESULT_FILE).to_string_lossy().into_owned(),
        views: request.views.clone(),
        groups: request.groups.clone(),
        likelihoods: request.likelihoods.clone(),
        samples: request.samples.clone(),
        features: request.features.clone(),
        blocks: block_files,
        options: request.options.clone(),
    };
    let path = dir.join(REQUEST_FILE);
    let mut file = BufWriter::new(fs::File::create(&path)?);
    file.write_all(toml::to_string_pretty(&manifest)?.as_bytes())?;
    file.flush()?;
    Ok(path)
}

/// Runs an external program as the engine. The program receives the request
/// manifest path as its last argument and either prints the artifact path as
/// the last line of its output or writes `result.toml` next to the manifest.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
    workdir: PathBuf,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: workdir.into(),
        }
    }

    /// Adds an argument passed before the manifest path.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }
}

impl InferenceEngine for CommandEngine {
    fn run(&mut self, request: &EngineRequest) -> Result<PathBuf, EngineError> {
        let manifest = write_request(&self.workdir, request)?;
        log::info!(
            "Running '{}' on {} block(s) with {} factor(s).",
            self.program,
            request.blocks.len(),
            request.num_factors()
        );

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&manifest)
            .current_dir(&self.workdir)
            .output()
            .map_err(|source| EngineError::Launch {
                program: self.program.clone(),
                source,
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(EngineError::Failed {
                status: output.status.to_string(),
                stderr,
            });
        }
        if !stderr.trim().is_empty() {
            log::debug!("Engine stderr:\n{stderr}");
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let printed = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(|line| self.workdir.join(line))
            .filter(|path| path.is_file());
        let artifact = printed.unwrap_or_else(|| self.workdir.join(RESULT_FILE));
        if !artifact.is_file() {
            return Err(EngineError::MissingArtifact(artifact));
        }
        Ok(artifact)
    }
}
