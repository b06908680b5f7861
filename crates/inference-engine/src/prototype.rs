//! Prototype colour-histogram models
//!
//! A model is a set of labels, each with a reference colour histogram. A frame
//! is scored by cosine similarity of its histogram against every prototype and
//! the similarities are turned into confidences with a temperature softmax.
//!
//! Source artifacts are JSON. Compiled artifacts are `PMC1`, the SHA-256 of the
//! payload, then the payload: the validated source with unit-length prototypes.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use common::error::CompileError;

use crate::frame::Frame;
use crate::runtime::InstantiateError;

/// Leading bytes of a compiled artifact
pub const COMPILED_MAGIC: &[u8; 4] = b"PMC1";

/// Largest supported number of buckets per channel
pub const MAX_BINS: usize = 16;

const DIGEST_LEN: usize = 32;

fn default_temperature() -> f32 {
    0.1
}

/// One label of a prototype model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrototypeLabel {
    /// Identifier of the class
    pub name: String,
    /// Name shown to users, when it differs from `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Reference histogram with `bins³` entries
    pub prototype: Vec<f32>,
}

impl PrototypeLabel {
    /// Gets the name shown to users
    pub fn display(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

/// Uncompiled prototype model definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrototypeModelSource {
    /// Model name
    pub name: String,
    /// Histogram buckets per channel
    pub bins: usize,
    /// Softmax temperature; lower values sharpen confidences
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Classes
    pub labels: Vec<PrototypeLabel>,
}

impl PrototypeModelSource {
    /// Parses a JSON source artifact
    pub fn from_json(bytes: &[u8]) -> Result<Self, CompileError> {
        serde_json::from_slice(bytes).map_err(|e| CompileError::Malformed(e.to_string()))
    }

    /// Serializes the source artifact as pretty JSON
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Builds a model from labelled example frames
    ///
    /// Each label's prototype is the mean histogram of its examples. Labels
    /// keep the order in which they first appear.
    pub fn from_examples<'a>(
        name: impl Into<String>,
        bins: usize,
        examples: impl IntoIterator<Item = (&'a str, &'a Frame)>,
    ) -> Self {
        let mut order: Vec<String> = Vec::new();
        let mut sums: BTreeMap<String, (Vec<f32>, usize)> = BTreeMap::new();

        for (label, frame) in examples {
            let histogram = frame.color_histogram(bins);
            let entry = sums.entry(label.to_string()).or_insert_with(|| {
                order.push(label.to_string());
                (vec![0.0; histogram.len()], 0)
            });
            for (acc, value) in entry.0.iter_mut().zip(histogram) {
                *acc += value;
            }
            entry.1 += 1;
        }

        let labels = order
            .into_iter()
            .filter_map(|label| {
                let (sum, count) = sums.remove(&label)?;
                let prototype = sum.into_iter().map(|v| v / count as f32).collect();
                Some(PrototypeLabel {
                    name: label,
                    display_name: None,
                    prototype,
                })
            })
            .collect();

        Self {
            name: name.into(),
            bins,
            temperature: default_temperature(),
            labels,
        }
    }

    /// Checks that the definition describes a usable model
    pub fn validate(&self) -> Result<(), CompileError> {
        if self.bins == 0 || self.bins > MAX_BINS {
            return Err(CompileError::Invalid(format!(
                "bins must be within 1..={}, got {}",
                MAX_BINS, self.bins
            )));
        }

        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(CompileError::Invalid(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }

        if self.labels.is_empty() {
            return Err(CompileError::Invalid("model has no labels".to_string()));
        }

        let dimensions = self.bins.pow(3);
        let mut seen = HashSet::new();

        for label in &self.labels {
            if label.name.is_empty() {
                return Err(CompileError::Invalid("label with empty name".to_string()));
            }
            if !seen.insert(label.name.as_str()) {
                return Err(CompileError::Invalid(format!("duplicate label {}", label.name)));
            }
            if label.prototype.len() != dimensions {
                return Err(CompileError::Invalid(format!(
                    "label {} has {} prototype entries, expected {}",
                    label.name,
                    label.prototype.len(),
                    dimensions
                )));
            }
            if label.prototype.iter().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(CompileError::Invalid(format!(
                    "label {} has a negative or non-finite prototype entry",
                    label.name
                )));
            }
            if l2_norm(&label.prototype) == 0.0 {
                return Err(CompileError::Invalid(format!("label {} has an all-zero prototype", label.name)));
            }
        }

        Ok(())
    }

    /// Compiles the definition into the backend-ready format
    pub fn compile(&self) -> Result<Vec<u8>, CompileError> {
        self.validate()?;

        let mut normalized = self.clone();
        for label in normalized.labels.iter_mut() {
            let norm = l2_norm(&label.prototype);
            for value in label.prototype.iter_mut() {
                *value /= norm;
            }
        }

        let payload = serde_json::to_vec(&normalized).map_err(|e| CompileError::Malformed(e.to_string()))?;
        let digest = Sha256::digest(&payload);

        let mut compiled = Vec::with_capacity(COMPILED_MAGIC.len() + DIGEST_LEN + payload.len());
        compiled.extend_from_slice(COMPILED_MAGIC);
        compiled.extend_from_slice(&digest);
        compiled.extend_from_slice(&payload);

        Ok(compiled)
    }
}

/// A compiled, ready-to-classify prototype model
#[derive(Debug, Clone)]
pub struct PrototypeModel {
    definition: PrototypeModelSource,
}

impl PrototypeModel {
    /// Verifies and loads a compiled artifact
    pub fn from_compiled(bytes: &[u8]) -> Result<Self, InstantiateError> {
        let header = COMPILED_MAGIC.len() + DIGEST_LEN;

        if bytes.len() < header {
            return Err(InstantiateError::Corrupt(format!("artifact too short ({} bytes)", bytes.len())));
        }

        if &bytes[..COMPILED_MAGIC.len()] != COMPILED_MAGIC {
            return Err(InstantiateError::Corrupt("bad magic".to_string()));
        }

        let expected = &bytes[COMPILED_MAGIC.len()..header];
        let payload = &bytes[header..];
        let actual = Sha256::digest(payload);

        if actual.as_slice() != expected {
            return Err(InstantiateError::Corrupt(format!(
                "payload digest {} does not match header {}",
                hex::encode(actual),
                hex::encode(expected)
            )));
        }

        let definition: PrototypeModelSource =
            serde_json::from_slice(payload).map_err(|e| InstantiateError::Corrupt(e.to_string()))?;
        definition
            .validate()
            .map_err(|e| InstantiateError::Corrupt(e.to_string()))?;

        Ok(Self { definition })
    }

    /// Gets the model name
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Gets the labels in definition order
    pub fn labels(&self) -> &[PrototypeLabel] {
        &self.definition.labels
    }

    /// Scores a frame against every label
    ///
    /// Returns `(display name, confidence)` pairs sorted by descending
    /// confidence; confidences sum to one.
    pub fn classify(&self, frame: &Frame) -> Vec<(String, f32)> {
        let histogram = frame.color_histogram(self.definition.bins);
        let norm = l2_norm(&histogram);

        let similarities: Vec<f32> = self
            .definition
            .labels
            .iter()
            .map(|label| {
                if norm == 0.0 {
                    0.0
                } else {
                    dot(&histogram, &label.prototype) / norm
                }
            })
            .collect();

        let temperature = self.definition.temperature;
        let max = similarities.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = similarities
            .iter()
            .map(|s| ((s - max) / temperature).exp())
            .collect();
        let total: f32 = exps.iter().sum();

        let mut scored: Vec<(String, f32)> = self
            .definition
            .labels
            .iter()
            .zip(exps)
            .map(|(label, e)| (label.display().to_string(), (e / total).clamp(0.0, 1.0)))
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn l2_norm(values: &[f32]) -> f32 {
    dot(values, values).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flowers() -> PrototypeModelSource {
        let red = Frame::solid(4, 4, [230, 20, 20]);
        let yellow = Frame::solid(4, 4, [240, 220, 30]);
        let blue = Frame::solid(4, 4, [20, 30, 220]);

        let mut source = PrototypeModelSource::from_examples(
            "flowers",
            4,
            [("rose", &red), ("sunflower", &yellow), ("cornflower", &blue)],
        );
        source.labels[0].display_name = Some("Rose".to_string());
        source
    }

    #[test]
    fn test_compile_and_classify() {
        let compiled = flowers().compile().unwrap();
        assert_eq!(&compiled[..4], COMPILED_MAGIC);

        let model = PrototypeModel::from_compiled(&compiled).unwrap();
        assert_eq!(model.name(), "flowers");
        assert_eq!(model.labels().len(), 3);

        let scores = model.classify(&Frame::solid(8, 8, [220, 10, 30]));
        assert_eq!(scores[0].0, "Rose");
        assert!(scores[0].1 > 0.99, "confidence was {}", scores[0].1);

        let total: f32 = scores.iter().map(|(_, c)| c).sum();
        assert!((total - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_source_json_round_trip_compiles_identically() {
        let source = flowers();
        let parsed = PrototypeModelSource::from_json(&source.to_json().unwrap()).unwrap();
        assert_eq!(parsed.compile().unwrap(), source.compile().unwrap());
    }

    #[test]
    fn test_rejects_invalid_sources() {
        let mut source = flowers();
        source.labels[1].prototype.pop();
        assert!(matches!(source.compile(), Err(CompileError::Invalid(_))));

        let mut source = flowers();
        source.labels[2].name = "rose".to_string();
        assert!(matches!(source.compile(), Err(CompileError::Invalid(_))));

        let mut source = flowers();
        source.temperature = 0.0;
        assert!(matches!(source.compile(), Err(CompileError::Invalid(_))));

        assert!(matches!(
            PrototypeModelSource::from_json(b"not json"),
            Err(CompileError::Malformed(_))
        ));
    }

    #[test]
    fn test_rejects_corrupt_compiled_artifacts() {
        assert!(PrototypeModel::from_compiled(b"garbage").is_err());

        let mut compiled = flowers().compile().unwrap();
        let last = compiled.len() - 2;
        compiled[last] ^= 0x55;
        assert!(matches!(
            PrototypeModel::from_compiled(&compiled),
            Err(InstantiateError::Corrupt(_))
        ));

        let mut compiled = flowers().compile().unwrap();
        compiled[0] = b'X';
        assert!(PrototypeModel::from_compiled(&compiled).is_err());
    }
}
