//! Pipelines and the registry that selects them
//!
//! A pipeline is the ordered step list one side runs for one protocol. The
//! registry maps `(ProtocolName, Side)` to a pipeline; the default registry
//! gives every protocol the same signed two-message exchange.

use std::collections::HashMap;
use std::sync::Arc;
use tandem_core::ProtocolName;

use crate::action::Side;
use crate::error::ProtocolError;
use crate::middleware::{
    AwaitCounterSignature, ComputeCommitment, SendCounterSignature, SendProposal,
    SignCommitment, StageTransition, Step, VerifyCounterSignature, VerifyProposerSignature,
};

/// Ordered steps of one protocol side
pub struct Pipeline {
    name: String,
    steps: Vec<Arc<dyn Step>>,
}

impl Pipeline {
    /// Pipeline name, used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Step at `index`, `None` once the pipeline is complete
    pub fn step(&self, index: usize) -> Option<&dyn Step> {
        self.steps.get(index).map(|step| step.as_ref())
    }

    /// Number of steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the pipeline has no steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step names in order
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    /// Initiator side: stage, sign, send, then wait for the counter-signature
    pub fn initiator(protocol: ProtocolName) -> Self {
        PipelineBuilder::new(format!("{protocol}/initiator"))
            .with_step(Arc::new(StageTransition))
            .with_step(Arc::new(ComputeCommitment))
            .with_step(Arc::new(SignCommitment))
            .with_step(Arc::new(SendProposal))
            .with_step(Arc::new(AwaitCounterSignature))
            .with_step(Arc::new(VerifyCounterSignature))
            .build()
    }

    /// Responder side: stage independently, verify, counter-sign and reply
    pub fn responder(protocol: ProtocolName) -> Self {
        PipelineBuilder::new(format!("{protocol}/responder"))
            .with_step(Arc::new(StageTransition))
            .with_step(Arc::new(ComputeCommitment))
            .with_step(Arc::new(VerifyProposerSignature))
            .with_step(Arc::new(SignCommitment))
            .with_step(Arc::new(SendCounterSignature))
            .build()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("steps", &self.step_names())
            .finish()
    }
}

/// Builder for constructing pipelines
pub struct PipelineBuilder {
    name: String,
    steps: Vec<Arc<dyn Step>>,
}

impl PipelineBuilder {
    /// Create a builder for a named pipeline
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step
    pub fn with_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Build the pipeline
    pub fn build(self) -> Pipeline {
        Pipeline {
            name: self.name,
            steps: self.steps,
        }
    }
}

/// Pipelines keyed by protocol and side
#[derive(Debug)]
pub struct PipelineRegistry {
    pipelines: HashMap<(ProtocolName, Side), Arc<Pipeline>>,
}

impl PipelineRegistry {
    /// Registry with nothing registered
    pub fn empty() -> Self {
        Self {
            pipelines: HashMap::new(),
        }
    }

    /// Register or replace the pipeline for one protocol side
    pub fn register(&mut self, protocol: ProtocolName, side: Side, pipeline: Pipeline) {
        self.pipelines.insert((protocol, side), Arc::new(pipeline));
    }

    /// Pipeline for one protocol side
    pub fn get(&self, protocol: ProtocolName, side: Side) -> Result<Arc<Pipeline>, ProtocolError> {
        self.pipelines
            .get(&(protocol, side))
            .cloned()
            .ok_or(ProtocolError::UnknownPipeline { protocol, side })
    }
}

impl Default for PipelineRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for protocol in ProtocolName::ALL {
            registry.register(protocol, Side::Initiator, Pipeline::initiator(protocol));
            registry.register(protocol, Side::Responder, Pipeline::responder(protocol));
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_registry_covers_every_protocol() {
        let registry = PipelineRegistry::default();
        for protocol in ProtocolName::ALL {
            assert_eq!(registry.get(protocol, Side::Initiator).unwrap().len(), 6);
            assert_eq!(registry.get(protocol, Side::Responder).unwrap().len(), 5);
        }
    }

    #[test]
    fn test_initiator_awaits_exactly_one_reply() {
        let pipeline = Pipeline::initiator(ProtocolName::Update);
        let awaiting: Vec<_> = (0..pipeline.len())
            .filter_map(|i| pipeline.step(i).and_then(|step| step.awaits()))
            .collect();
        assert_eq!(awaiting, vec![1]);
        assert_eq!(pipeline.name(), "update/initiator");
        assert!(pipeline.step(pipeline.len()).is_none());
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = PipelineRegistry::empty();
        assert_matches!(
            registry.get(ProtocolName::Setup, Side::Initiator),
            Err(ProtocolError::UnknownPipeline { .. })
        );

        registry.register(
            ProtocolName::Setup,
            Side::Initiator,
            PipelineBuilder::new("setup/local-only")
                .with_step(Arc::new(StageTransition))
                .build(),
        );
        let pipeline = registry.get(ProtocolName::Setup, Side::Initiator).unwrap();
        assert_eq!(pipeline.step_names(), vec!["stage_transition"]);
    }
}
