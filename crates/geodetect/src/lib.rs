pub mod batch;
pub mod config;
mod decode;
pub mod device;
pub mod error;
pub mod fault;
pub mod feature;
pub mod geometry;
pub mod normalize;
pub mod pipeline;
pub mod raster;

pub use batch::{
    BoxDetectionBatch, DetectionBatchProcessor, DeviceFilterDegradation, MaskLayout,
    NormalizedDetectionBatch, RawDetectionBatch,
};
pub use config::PipelineConfig;
pub use device::{ComputeDevice, CpuDevice, DeviceTensors, Residency};
pub use error::{FailureCategory, GeodetectError, GeometryError, Result, ShapeError};
pub use fault::{FaultBehavior, FaultResponse, dominant_color};
pub use feature::{Feature, FeatureAssembler, FeatureCollection, Geometry, ModelMetadata};
pub use geometry::{MaskGeometryExtractor, MaskValue, Polygon};
pub use normalize::BandNormalizer;
pub use pipeline::DetectionPipeline;
pub use raster::{CanonicalImage, DataType, RasterData, RasterGrid};
