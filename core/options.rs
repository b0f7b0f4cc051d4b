//! Option blocks forwarded to the inference engine.
//!
//! These are pass-through configuration: nothing in this crate interprets
//! them beyond range checks and filling in data-dependent defaults. Every
//! field has a default, so a TOML file only needs to name what it changes.

use crate::model::ModelError;
use crate::types::{Dataset, Likelihood};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

/// How strictly the engine decides that the ELBO has converged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvergenceMode {
    #[default]
    Fast,
    Medium,
    Slow,
}

impl ConvergenceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Medium => "medium",
            Self::Slow => "slow",
        }
    }
}

impl fmt::Display for ConvergenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConvergenceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "medium" => Ok(Self::Medium),
            "slow" => Ok(Self::Slow),
            other => Err(format!(
                "unknown convergence mode '{other}' (expected fast, medium or slow)"
            )),
        }
    }
}

/// Preprocessing switches applied by the engine before inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataOptions {
    /// Scale each view to unit variance.
    pub scale_views: bool,
    /// Scale each group to unit variance.
    pub scale_groups: bool,
    /// Center features per group.
    pub center_groups: bool,
    pub use_float32: bool,
}

impl Default for DataOptions {
    fn default() -> Self {
        Self {
            scale_views: false,
            scale_groups: false,
            center_groups: true,
            use_float32: false,
        }
    }
}

/// Model structure: factor count, likelihoods and priors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    /// Number of factors. Training refuses to start while this is unset.
    pub num_factors: Option<usize>,
    /// One likelihood per view; inferred from the data when unset.
    pub likelihoods: Option<Vec<Likelihood>>,
    pub spikeslab_factors: bool,
    pub spikeslab_weights: bool,
    /// ARD prior on factors; defaults to on when there is more than one group.
    pub ard_factors: Option<bool>,
    pub ard_weights: bool,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            num_factors: None,
            likelihoods: None,
            spikeslab_factors: false,
            spikeslab_weights: true,
            ard_factors: None,
            ard_weights: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingOptions {
    pub max_iter: usize,
    pub convergence_mode: ConvergenceMode,
    /// Minimum fraction of variance a factor must explain to be kept;
    /// negative disables factor dropping.
    pub drop_factor_threshold: f64,
    /// First iteration at which the ELBO is computed.
    pub start_elbo: usize,
    /// ELBO is computed every `freq_elbo` iterations.
    pub freq_elbo: usize,
    pub seed: u64,
    pub gpu_mode: bool,
    pub stochastic: bool,
    pub verbose: bool,
    pub weight_views: bool,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            max_iter: 1000,
            convergence_mode: ConvergenceMode::Fast,
            drop_factor_threshold: -1.0,
            start_elbo: 1,
            freq_elbo: 1,
            seed: 42,
            gpu_mode: false,
            stochastic: false,
            verbose: false,
            weight_views: false,
        }
    }
}

/// Only read by the engine when `TrainingOptions::stochastic` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StochasticOptions {
    /// Fraction of samples per mini-batch, in (0, 1].
    pub batch_size: f64,
    pub learning_rate: f64,
    /// In (0, 1].
    pub forgetting_rate: f64,
    /// Iteration at which stochastic updates start.
    pub start_stochastic: usize,
}

impl Default for StochasticOptions {
    fn default() -> Self {
        Self {
            batch_size: 0.5,
            learning_rate: 1.0,
            forgetting_rate: 0.5,
            start_stochastic: 1,
        }
    }
}

/// Every option block of one training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    pub data: DataOptions,
    pub model: ModelOptions,
    pub training: TrainingOptions,
    pub stochastic: StochasticOptions,
}

fn invalid(message: impl Into<String>) -> ModelError {
    ModelError::InvalidOptions(message.into())
}

impl RunOptions {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let options = toml::from_str(&toml_string)?;
        Ok(options)
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Range checks that do not depend on the data.
    pub fn validate(&self) -> Result<(), ModelError> {
        match self.model.num_factors {
            None => {
                return Err(invalid(
                    "the number of factors is not set (model.num_factors / --factors)",
                ));
            }
            Some(0) => return Err(invalid("the number of factors must be at least 1")),
            Some(_) => {}
        }

        let training = &self.training;
        if training.max_iter == 0 {
            return Err(invalid("max_iter must be at least 1"));
        }
        if training.start_elbo == 0 || training.freq_elbo == 0 {
            return Err(invalid("start_elbo and freq_elbo must be at least 1"));
        }
        if training.start_elbo > training.max_iter {
            return Err(invalid(format!(
                "start_elbo ({}) is beyond max_iter ({})",
                training.start_elbo, training.max_iter
            )));
        }
        if !training.drop_factor_threshold.is_finite() || training.drop_factor_threshold >= 1.0 {
            return Err(invalid(format!(
                "drop_factor_threshold must be below 1 (negative disables it), got {}",
                training.drop_factor_threshold
            )));
        }

        if training.stochastic {
            let stochastic = &self.stochastic;
            if !(stochastic.batch_size > 0.0 && stochastic.batch_size <= 1.0) {
                return Err(invalid(format!(
                    "batch_size must be a fraction in (0, 1], got {}",
                    stochastic.batch_size
                )));
            }
            if !(stochastic.forgetting_rate > 0.0 && stochastic.forgetting_rate <= 1.0) {
                return Err(invalid(format!(
                    "forgetting_rate must be in (0, 1], got {}",
                    stochastic.forgetting_rate
                )));
            }
            if !(stochastic.learning_rate > 0.0 && stochastic.learning_rate.is_finite()) {
                return Err(invalid(format!(
                    "learning_rate must be positive, got {}",
                    stochastic.learning_rate
                )));
            }
            if stochastic.start_stochastic == 0 {
                return Err(invalid("start_stochastic must be at least 1"));
            }
        }
        Ok(())
    }

    /// Validates the options and fills in every default that depends on the
    /// dataset: likelihoods are inferred per view and `ard_factors` follows
    /// the group count.
    pub fn resolve(&self, dataset: &Dataset) -> Result<Self, ModelError> {
        self.validate()?;
        let mut resolved = self.clone();

        let n_views = dataset.views().len();
        match &self.model.likelihoods {
            Some(likelihoods) if likelihoods.len() != n_views => {
                return Err(invalid(format!(
                    "{} likelihoods given for {n_views} views",
                    likelihoods.len()
                )));
            }
            Some(_) => {}
            None => {
                let inferred = dataset.infer_likelihoods();
                for (view, likelihood) in dataset.views().iter().zip(&inferred) {
                    log::info!("View '{view}': using the {likelihood} likelihood.");
                }
                resolved.model.likelihoods = Some(inferred);
            }
        }

        if self.model.ard_factors.is_none() {
            resolved.model.ard_factors = Some(dataset.groups().len() > 1);
        }

        if let Some(k) = self.model.num_factors {
            let smallest_group = dataset.sample_sets().iter().map(Vec::len).min().unwrap_or(0);
            if k > smallest_group {
                log::warn!(
                    "{k} factors requested but the smallest group has {smallest_group} samples; the engine may drop factors."
                );
            }
        }
        Ok(resolved)
    }

    /// Likelihoods after [`RunOptions::resolve`]; empty before.
    pub fn likelihoods(&self) -> &[Likelihood] {
        self.model.likelihoods.as_deref().unwrap_or(&[])
    }
}
