use thiserror::Error;

pub type Result<T> = std::result::Result<T, GeodetectError>;

/// How a hosting service should classify a failure when reporting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    /// The request payload itself cannot be processed.
    ClientInput,
    /// The payload was acceptable but the pipeline failed.
    Internal,
}

#[derive(Error, Debug)]
pub enum GeodetectError {
    #[error("Unsupported number of bands: {bands}")]
    UnsupportedBandCount { bands: usize },

    #[error("Invalid raster: {0}")]
    InvalidRaster(String),

    #[error("All pixels in the image tile are set to 0.")]
    BlankTile,

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error("Mask geometry extraction failed for detection {index}: {source}")]
    ExtractionWorkerFailure {
        index: usize,
        #[source]
        source: GeometryError,
    },

    #[error("Failed to build extraction worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Device transfer failed: {0:#}")]
    Device(anyhow::Error),

    #[error("Failed to serialize feature collection: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GeodetectError {
    pub fn category(&self) -> FailureCategory {
        match self {
            GeodetectError::UnsupportedBandCount { .. }
            | GeodetectError::InvalidRaster(_)
            | GeodetectError::BlankTile => FailureCategory::ClientInput,
            GeodetectError::Shape(shape) => shape.category(),
            GeodetectError::ExtractionWorkerFailure { .. }
            | GeodetectError::WorkerPool(_)
            | GeodetectError::Device(_)
            | GeodetectError::Serialization(_) => FailureCategory::Internal,
        }
    }
}

/// Raised when detection tensors cannot be reconciled to `[N, H, W]` masks
/// with `N` boxes and `N` scores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("Cannot process masks with shape {shape:?}")]
    UnexpectedRank { shape: Vec<usize> },

    #[error("Cannot salvage 4D mask shape {shape:?}, expected (N, 1, H, W)")]
    UnsalvageableRank4 { shape: Vec<usize> },

    #[error("Boolean mask shape mismatch: ({got},) vs expected ({expected},)")]
    KeepMaskLength { got: usize, expected: usize },

    #[error("Detection length mismatch: {masks} masks, {boxes} boxes, {scores} scores")]
    LengthMismatch {
        masks: usize,
        boxes: usize,
        scores: usize,
    },

    #[error("Boxes must have 4 columns, got {columns}")]
    BoxWidth { columns: usize },

    #[error("Detection length mismatch: {boxes} boxes, {scores} scores")]
    BoxScoreMismatch { boxes: usize, scores: usize },
}

impl ShapeError {
    /// Keep-mask mismatches come from our own reduction, not from the payload.
    pub fn category(&self) -> FailureCategory {
        match self {
            ShapeError::KeepMaskLength { .. } => FailureCategory::Internal,
            _ => FailureCategory::ClientInput,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("Mask dimensions {height}x{width} exceed the supported raster size")]
    MaskTooLarge { height: usize, width: usize },

    #[error("Extraction worker panicked: {message}")]
    WorkerPanic { message: String },
}
