//! ML scorer.
//!
//! Runs a pre-built tree-ensemble artifact over the 15-feature vector.
//! The artifact and the monotonic calibration map are loaded once at
//! startup and held immutable behind an `ArcSwap`; a SIGHUP can swap in a
//! new pair without stopping request admission. A missing artifact is
//! fatal; a missing calibrator only degrades to raw == calibrated.

use crate::models::{FeatureContribution, MlScore};
use crate::pipeline::features::{FeatureVector, FEATURE_NAMES};
use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const N_FEATURES: usize = 15;
const TOP_FEATURES: usize = 3;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum NodeSpec {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct TreeSpec {
    nodes: Vec<NodeSpec>,
}

/// Per-feature attribution entry: contribution is `weight * (x - baseline)`.
#[derive(Debug, Clone, Deserialize)]
pub struct AttributionEntry {
    pub baseline: f64,
    pub weight: f64,
}

/// The tree-ensemble artifact, as serialized by the training pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelArtifact {
    pub version: u32,
    pub n_features: usize,
    pub base_score: f64,
    trees: Vec<TreeSpec>,
    attributions: Vec<AttributionEntry>,
}

impl ModelArtifact {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model artifact at {}", path))?;
        let artifact: ModelArtifact = serde_json::from_str(&raw)
            .with_context(|| format!("Malformed model artifact at {}", path))?;
        artifact.validate()?;
        Ok(artifact)
    }

    fn validate(&self) -> Result<()> {
        if self.n_features != N_FEATURES {
            bail!(
                "model expects {} features, this pipeline produces {}",
                self.n_features,
                N_FEATURES
            );
        }
        if self.trees.is_empty() {
            bail!("model artifact contains no trees");
        }
        if self.attributions.len() != N_FEATURES {
            bail!(
                "attribution table has {} entries, expected {}",
                self.attributions.len(),
                N_FEATURES
            );
        }
        for (t, tree) in self.trees.iter().enumerate() {
            if tree.nodes.is_empty() {
                bail!("tree {} is empty", t);
            }
            for (i, node) in tree.nodes.iter().enumerate() {
                if let NodeSpec::Split {
                    feature,
                    left,
                    right,
                    ..
                } = node
                {
                    if *feature >= N_FEATURES {
                        bail!("tree {} node {} splits on unknown feature {}", t, i, feature);
                    }
                    // Children must point forward so traversal always terminates.
                    if *left <= i || *right <= i || *left >= tree.nodes.len() || *right >= tree.nodes.len()
                    {
                        bail!("tree {} node {} has invalid child indices", t, i);
                    }
                }
            }
        }
        Ok(())
    }

    /// Raw fraud probability: sigmoid over the summed leaf values.
    fn predict(&self, x: &[f64; N_FEATURES]) -> f64 {
        let mut logit = self.base_score;
        for tree in &self.trees {
            let mut idx = 0usize;
            loop {
                match &tree.nodes[idx] {
                    NodeSpec::Split {
                        feature,
                        threshold,
                        left,
                        right,
                    } => {
                        idx = if x[*feature] < *threshold { *left } else { *right };
                    }
                    NodeSpec::Leaf { value } => {
                        logit += value;
                        break;
                    }
                }
            }
        }
        1.0 / (1.0 + (-logit).exp())
    }
}

/// Monotonic piecewise-linear map from raw to calibrated probability.
#[derive(Debug, Clone, Deserialize)]
pub struct Calibration {
    /// Sorted (raw, calibrated) pairs covering [0, 1].
    knots: Vec<[f64; 2]>,
}

impl Calibration {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read calibration map at {}", path))?;
        let calibration: Calibration = serde_json::from_str(&raw)
            .with_context(|| format!("Malformed calibration map at {}", path))?;
        calibration.validate()?;
        Ok(calibration)
    }

    fn validate(&self) -> Result<()> {
        if self.knots.len() < 2 {
            bail!("calibration map needs at least two knots");
        }
        for pair in self.knots.windows(2) {
            if pair[1][0] <= pair[0][0] || pair[1][1] < pair[0][1] {
                bail!("calibration knots must be strictly increasing in raw and non-decreasing in calibrated");
            }
        }
        Ok(())
    }

    pub fn apply(&self, raw: f64) -> f64 {
        let raw = raw.clamp(0.0, 1.0);
        let first = self.knots[0];
        if raw <= first[0] {
            return first[1];
        }
        for pair in self.knots.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if raw <= b[0] {
                let t = (raw - a[0]) / (b[0] - a[0]);
                return a[1] + t * (b[1] - a[1]);
            }
        }
        self.knots[self.knots.len() - 1][1]
    }
}

struct ModelBundle {
    model: ModelArtifact,
    calibration: Option<Calibration>,
}

/// Shared scorer handle. Cheap to call from every worker.
pub struct MlScorer {
    bundle: ArcSwap<ModelBundle>,
    model_path: String,
    calibration_path: String,
}

impl MlScorer {
    /// Load both artifacts. The model is required; the calibrator is not.
    pub fn load(model_path: &str, calibration_path: &str) -> Result<Self> {
        let model = ModelArtifact::from_file(model_path)?;
        info!(
            version = model.version,
            trees = model.trees.len(),
            "🌲 Model artifact loaded from {}",
            model_path
        );

        let calibration = if Path::new(calibration_path).exists() {
            let c = Calibration::from_file(calibration_path)?;
            info!(knots = c.knots.len(), "📐 Calibration map loaded");
            Some(c)
        } else {
            warn!(
                "calibration map missing at {}, running degraded (raw == calibrated)",
                calibration_path
            );
            None
        };

        Ok(Self {
            bundle: ArcSwap::from_pointee(ModelBundle { model, calibration }),
            model_path: model_path.to_string(),
            calibration_path: calibration_path.to_string(),
        })
    }

    /// Build from in-memory parts. Used by tests and embedders.
    pub fn from_parts(model: ModelArtifact, calibration: Option<Calibration>) -> Result<Self> {
        model.validate()?;
        if let Some(c) = &calibration {
            c.validate()?;
        }
        Ok(Self {
            bundle: ArcSwap::from_pointee(ModelBundle { model, calibration }),
            model_path: String::new(),
            calibration_path: String::new(),
        })
    }

    /// Re-read artifacts from disk and swap them in. A bad file leaves the
    /// previous bundle active.
    pub fn reload(&self) -> Result<()> {
        if self.model_path.is_empty() {
            return Ok(());
        }
        let model = ModelArtifact::from_file(&self.model_path)?;
        let calibration = if Path::new(&self.calibration_path).exists() {
            Some(Calibration::from_file(&self.calibration_path)?)
        } else {
            None
        };
        self.bundle.store(Arc::new(ModelBundle { model, calibration }));
        info!("🔄 Model bundle reloaded");
        Ok(())
    }

    pub fn score(&self, features: &FeatureVector) -> Result<MlScore> {
        let bundle = self.bundle.load();
        let x = features.values();

        let raw = bundle.model.predict(x);
        let calibrated = match &bundle.calibration {
            Some(c) => c.apply(raw),
            None => raw,
        };

        // Attribution: |weight * (x - baseline)| per feature, top three.
        let mut ranked: [(usize, f64); N_FEATURES] = [(0, 0.0); N_FEATURES];
        for (i, entry) in bundle.model.attributions.iter().enumerate() {
            ranked[i] = (i, (entry.weight * (x[i] - entry.baseline)).abs());
        }
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let top_features = ranked
            .iter()
            .take(TOP_FEATURES)
            .map(|(i, contribution)| FeatureContribution {
                name: FEATURE_NAMES[*i],
                value: x[*i],
                contribution: *contribution,
            })
            .collect();

        Ok(MlScore {
            raw,
            calibrated,
            top_features,
        })
    }
}
