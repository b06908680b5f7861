//! Local model runtime contract
//!
//! The lifecycle manager drives a runtime through two steps: `compile` turns a
//! source artifact into the compiled form that gets cached, `instantiate` turns
//! a compiled artifact into a ready model. Both are synchronous and may be slow;
//! callers run them on a blocking worker.

use std::sync::Arc;

use thiserror::Error;

use common::error::{CompileError, InferError};
use common::{ArtifactKind, ModelArtifact};

use crate::frame::Frame;
use crate::prototype::{PrototypeModel, PrototypeModelSource};

/// Errors raised while instantiating a compiled artifact
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstantiateError {
    /// The artifact failed validation and must be discarded
    #[error("corrupt compiled artifact: {0}")]
    Corrupt(String),
}

/// A ready-to-infer local model
pub trait LocalModel: Send + Sync {
    /// Gets the model name
    fn name(&self) -> &str;

    /// Scores one frame, returning `(label, confidence)` pairs
    fn classify(&self, frame: &Frame) -> Result<Vec<(String, f32)>, InferError>;
}

/// Backend-specific compile and instantiate steps
pub trait LocalModelRuntime: Send + Sync {
    /// Compiles a source artifact, consuming it
    fn compile(&self, source: ModelArtifact) -> Result<Vec<u8>, CompileError>;

    /// Instantiates a compiled artifact
    fn instantiate(&self, compiled: &[u8]) -> Result<Arc<dyn LocalModel>, InstantiateError>;
}

/// Runtime for prototype colour-histogram models
#[derive(Debug, Default, Clone, Copy)]
pub struct PrototypeRuntime;

impl LocalModelRuntime for PrototypeRuntime {
    fn compile(&self, source: ModelArtifact) -> Result<Vec<u8>, CompileError> {
        if source.kind != ArtifactKind::Source {
            return Err(CompileError::Invalid(format!("cannot compile a {} artifact", source.kind)));
        }
        PrototypeModelSource::from_json(&source.bytes)?.compile()
    }

    fn instantiate(&self, compiled: &[u8]) -> Result<Arc<dyn LocalModel>, InstantiateError> {
        Ok(Arc::new(PrototypeModel::from_compiled(compiled)?))
    }
}

impl LocalModel for PrototypeModel {
    fn name(&self) -> &str {
        PrototypeModel::name(self)
    }

    fn classify(&self, frame: &Frame) -> Result<Vec<(String, f32)>, InferError> {
        Ok(PrototypeModel::classify(self, frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_compiles_and_instantiates() {
        let green = Frame::solid(2, 2, [10, 200, 10]);
        let grey = Frame::solid(2, 2, [128, 128, 128]);
        let source = PrototypeModelSource::from_examples("leaves", 2, [("leaf", &green), ("stone", &grey)])
            .to_json()
            .unwrap();

        let runtime = PrototypeRuntime;
        let compiled = runtime.compile(ModelArtifact::new(ArtifactKind::Source, source)).unwrap();
        let model = runtime.instantiate(&compiled).unwrap();

        assert_eq!(model.name(), "leaves");
        let scores = model.classify(&green).unwrap();
        assert_eq!(scores[0].0, "leaf");
    }

    #[test]
    fn test_runtime_surfaces_errors() {
        let runtime = PrototypeRuntime;
        assert!(matches!(
            runtime.compile(ModelArtifact::new(ArtifactKind::Source, b"{}".to_vec())),
            Err(CompileError::Malformed(_))
        ));
        assert!(matches!(
            runtime.compile(ModelArtifact::new(ArtifactKind::Compiled, b"PMC1".to_vec())),
            Err(CompileError::Invalid(_))
        ));
        assert!(matches!(runtime.instantiate(b"PMC1"), Err(InstantiateError::Corrupt(_))));
    }
}
