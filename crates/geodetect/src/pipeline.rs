use crate::batch::{BoxDetectionBatch, DetectionBatchProcessor, RawDetectionBatch};
use crate::config::PipelineConfig;
use crate::device::ComputeDevice;
use crate::error::Result;
use crate::feature::{FeatureAssembler, FeatureCollection, ModelMetadata};

/// Raw model outputs in, feature collection out.
///
/// Holds the worker pool for the lifetime of the service; the device handle
/// is supplied per call by the owner of the model.
pub struct DetectionPipeline {
    processor: DetectionBatchProcessor,
    assembler: FeatureAssembler,
    metadata: ModelMetadata,
    default_label: String,
}

impl DetectionPipeline {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            processor: DetectionBatchProcessor::new(config)?,
            assembler: FeatureAssembler::new(),
            metadata: ModelMetadata {
                model_name: config.model_name.clone(),
                ontology_name: config.default_text_prompt.clone(),
                ontology_version: config.ontology_version.clone(),
            },
            default_label: config.default_text_prompt.clone(),
        })
    }

    /// Attached to every feature; the ontology is the configured prompt,
    /// whatever label a request asks for.
    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    fn label<'a>(&'a self, class_label: Option<&'a str>) -> &'a str {
        class_label
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(self.default_label.as_str())
    }

    /// Uses the configured default prompt when `class_label` is `None` or blank.
    pub fn run(
        &self,
        device: &dyn ComputeDevice,
        batch: RawDetectionBatch,
        class_label: Option<&str>,
    ) -> Result<FeatureCollection> {
        let label = self.label(class_label);

        let normalized = self.processor.process(device, batch)?;
        if let Some(degradation) = &normalized.degradation {
            tracing::warn!(
                reason = %degradation.reason,
                "Detections processed without device filtering"
            );
        }

        let collection = self.assembler.assemble(&normalized, label, &self.metadata);

        tracing::info!(
            features = collection.len(),
            label,
            degraded = normalized.is_degraded(),
            "Detection batch complete"
        );

        Ok(collection)
    }

    /// Box-only detectors: every feature gets the fallback point geometry.
    pub fn run_boxes(
        &self,
        batch: BoxDetectionBatch,
        class_label: Option<&str>,
    ) -> Result<FeatureCollection> {
        let label = self.label(class_label);
        let collection = self.assembler.assemble_boxes(&batch, label, &self.metadata)?;

        tracing::info!(features = collection.len(), label, "Box detection batch complete");

        Ok(collection)
    }
}
