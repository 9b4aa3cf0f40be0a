use crate::config::PipelineConfig;
use crate::device::{ComputeDevice, DeviceTensors, Residency};
use crate::error::{GeodetectError, GeometryError, Result, ShapeError};
use crate::geometry::{MaskGeometryExtractor, Polygon};
use ndarray::{Array1, Array2, Array3, ArrayD, ArrayView2, Axis, Ix3};
use rayon::prelude::*;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Batches larger than this are fanned out across the worker pool.
const PARALLEL_EXTRACTION_THRESHOLD: usize = 2;

/// Model outputs as returned by inference, before any shape checks.
///
/// `masks` may be `[H, W]`, `[N, H, W]` or `[N, C, H, W]`; `boxes` is
/// `[N, 4]` as `x0, y0, x1, y1` and `scores` is `[N]`.
#[derive(Debug, Clone)]
pub struct RawDetectionBatch {
    pub masks: ArrayD<f32>,
    pub boxes: Array2<f32>,
    pub scores: Array1<f32>,
}

/// Outputs of a box-only detector, which produces no masks.
#[derive(Debug, Clone)]
pub struct BoxDetectionBatch {
    pub boxes: Array2<f32>,
    pub scores: Array1<f32>,
}

impl BoxDetectionBatch {
    /// Number of detections once boxes and scores agree.
    pub fn validate(&self) -> std::result::Result<usize, ShapeError> {
        if self.boxes.ncols() != 4 {
            return Err(ShapeError::BoxWidth {
                columns: self.boxes.ncols(),
            });
        }
        if self.boxes.nrows() != self.scores.len() {
            return Err(ShapeError::BoxScoreMismatch {
                boxes: self.boxes.nrows(),
                scores: self.scores.len(),
            });
        }
        Ok(self.scores.len())
    }
}

/// How the mask tensor was brought to `[N, H, W]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskLayout {
    /// Already `[N, H, W]`.
    Planar,
    /// `[N, 1, H, W]` with the channel dimension dropped.
    Squeezed,
    /// `[N, C, H, W]` with square planes; only the first channel was kept.
    Salvaged,
    /// A single `[H, W]` mask given a batch dimension.
    Promoted,
}

/// On-device empty-mask filtering failed and every detection was kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFilterDegradation {
    pub reason: String,
}

/// Which detections survive empty-mask filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
enum KeepDecision {
    All,
    Subset(Vec<usize>),
    Degraded(DeviceFilterDegradation),
}

/// Host-resident detections with co-indexed masks, boxes, scores and
/// extracted geometry.
#[derive(Debug, Clone)]
pub struct NormalizedDetectionBatch {
    pub masks: Array3<bool>,
    pub boxes: Array2<f32>,
    pub scores: Array1<f32>,
    pub geometries: Vec<Option<Polygon>>,
    pub layout: MaskLayout,
    pub degradation: Option<DeviceFilterDegradation>,
}

impl NormalizedDetectionBatch {
    fn empty(height: usize, width: usize, layout: MaskLayout) -> Self {
        Self {
            masks: Array3::from_elem((0, height, width), false),
            boxes: Array2::zeros((0, 4)),
            scores: Array1::zeros(0),
            geometries: Vec::new(),
            layout,
            degradation: None,
        }
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn is_degraded(&self) -> bool {
        self.degradation.is_some()
    }
}

/// Brings raw detection tensors to a consistent shape, drops empty masks and
/// extracts one polygon per surviving mask.
pub struct DetectionBatchProcessor {
    extractor: MaskGeometryExtractor,
    pool: rayon::ThreadPool,
}

impl DetectionBatchProcessor {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        Self::with_workers(config.workers)
    }

    /// `workers` is clamped to the supported pool size.
    pub fn with_workers(workers: usize) -> Result<Self> {
        let workers = PipelineConfig::clamp_workers(workers);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("mask-polygon-{i}"))
            .build()?;

        tracing::debug!(workers, "Mask polygon worker pool ready");

        Ok(Self {
            extractor: MaskGeometryExtractor::new(),
            pool,
        })
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    #[tracing::instrument(skip(self, device, batch), fields(device = device.name()))]
    pub fn process(
        &self,
        device: &dyn ComputeDevice,
        batch: RawDetectionBatch,
    ) -> Result<NormalizedDetectionBatch> {
        let RawDetectionBatch {
            masks,
            boxes,
            scores,
        } = batch;

        let (masks, layout) = reconcile_masks(masks)?;
        let count = validate_lengths(&masks, &boxes, &scores)?;
        let (_, height, width) = masks.dim();

        if count == 0 {
            tracing::debug!("No detections in batch");
            return Ok(NormalizedDetectionBatch::empty(height, width, layout));
        }

        let keep = match device.residency() {
            Residency::Device => filter_on_device(device, &masks, count)?,
            Residency::Host => KeepDecision::All,
        };

        let (tensors, degradation) = match keep {
            KeepDecision::All => (DeviceTensors { masks, boxes, scores }, None),
            KeepDecision::Degraded(degradation) => {
                (DeviceTensors { masks, boxes, scores }, Some(degradation))
            }
            KeepDecision::Subset(indices) if indices.is_empty() => {
                tracing::debug!(count, "All masks empty, skipping transfer and extraction");
                return Ok(NormalizedDetectionBatch::empty(height, width, layout));
            }
            KeepDecision::Subset(indices) => {
                tracing::trace!(count, kept = indices.len(), "Filtered empty masks on device");
                let tensors = if indices.len() == count {
                    DeviceTensors { masks, boxes, scores }
                } else {
                    DeviceTensors {
                        masks: masks.select(Axis(0), &indices),
                        boxes: boxes.select(Axis(0), &indices),
                        scores: scores.select(Axis(0), &indices),
                    }
                };
                (tensors, None)
            }
        };

        let host = {
            let _s = common::span_debug!("transfer_to_host");
            device
                .transfer_to_host(tensors)
                .map_err(GeodetectError::Device)?
        };

        let masks = host.masks.mapv(|v| v > 0.0);
        let geometries = self.extract_geometries(&masks)?;

        Ok(NormalizedDetectionBatch {
            masks,
            boxes: host.boxes,
            scores: host.scores,
            geometries,
            layout,
            degradation,
        })
    }

    fn extract_geometries(&self, masks: &Array3<bool>) -> Result<Vec<Option<Polygon>>> {
        self.extract_with(masks, |_, mask| self.extractor.extract(mask.into_dyn()))
    }

    /// Results are returned in mask order regardless of which worker finishes
    /// first. Any failure discards the whole batch; a panic while extracting
    /// one mask is reported as that detection's failure.
    pub(crate) fn extract_with<F>(
        &self,
        masks: &Array3<bool>,
        extract: F,
    ) -> Result<Vec<Option<Polygon>>>
    where
        F: Fn(usize, ArrayView2<'_, bool>) -> std::result::Result<Option<Polygon>, GeometryError>
            + Sync,
    {
        let _s = common::span!("extract_geometries");
        let count = masks.len_of(Axis(0));

        let run = |(index, mask): (usize, ArrayView2<'_, bool>)| {
            panic::catch_unwind(AssertUnwindSafe(|| extract(index, mask)))
                .unwrap_or_else(|payload| {
                    Err(GeometryError::WorkerPanic {
                        message: panic_message(payload.as_ref()),
                    })
                })
                .map_err(|source| {
                    tracing::error!(index, error = %source, "Mask polygon extraction failed");
                    GeodetectError::ExtractionWorkerFailure { index, source }
                })
        };

        if count > PARALLEL_EXTRACTION_THRESHOLD {
            tracing::debug!(count, workers = self.workers(), "Extracting polygons in parallel");
            self.pool.install(|| {
                masks
                    .axis_iter(Axis(0))
                    .into_par_iter()
                    .enumerate()
                    .map(run)
                    .collect()
            })
        } else {
            tracing::debug!(count, "Extracting polygons sequentially");
            masks.axis_iter(Axis(0)).enumerate().map(run).collect()
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Reshapes the raw mask tensor to `[N, H, W]`.
pub fn reconcile_masks(
    masks: ArrayD<f32>,
) -> std::result::Result<(Array3<f32>, MaskLayout), ShapeError> {
    let shape = masks.shape().to_vec();

    let (masks, layout) = match masks.ndim() {
        4 if shape[1] == 1 => (masks.index_axis_move(Axis(1), 0), MaskLayout::Squeezed),
        4 => {
            tracing::warn!(shape = ?shape, "Unexpected 4D mask shape, expected (N, 1, H, W)");
            if shape[2] != shape[3] {
                tracing::error!(shape = ?shape, "Cannot salvage mask shape with non-square planes");
                return Err(ShapeError::UnsalvageableRank4 { shape });
            }
            (masks.index_axis_move(Axis(1), 0), MaskLayout::Salvaged)
        }
        3 => (masks, MaskLayout::Planar),
        2 => (masks.insert_axis(Axis(0)), MaskLayout::Promoted),
        _ => {
            tracing::error!(
                shape = ?shape,
                "Unexpected mask shape, expected (N, H, W) or (N, 1, H, W)"
            );
            return Err(ShapeError::UnexpectedRank { shape });
        }
    };

    let masks = masks
        .into_dimensionality::<Ix3>()
        .map_err(|_| ShapeError::UnexpectedRank { shape })?;

    Ok((masks, layout))
}

fn validate_lengths(
    masks: &Array3<f32>,
    boxes: &Array2<f32>,
    scores: &Array1<f32>,
) -> std::result::Result<usize, ShapeError> {
    if boxes.ncols() != 4 {
        return Err(ShapeError::BoxWidth {
            columns: boxes.ncols(),
        });
    }
    let count = scores.len();
    if masks.len_of(Axis(0)) != count || boxes.nrows() != count {
        return Err(ShapeError::LengthMismatch {
            masks: masks.len_of(Axis(0)),
            boxes: boxes.nrows(),
            scores: count,
        });
    }
    Ok(count)
}

/// A keep-mask of the wrong length is fatal; any other device failure
/// degrades to keeping every detection.
fn filter_on_device(
    device: &dyn ComputeDevice,
    masks: &Array3<f32>,
    count: usize,
) -> Result<KeepDecision> {
    let _s = common::span_debug!("filter_on_device");

    match device.mask_population(masks) {
        Ok(population) if population.len() != count => {
            tracing::error!(
                got = population.len(),
                expected = count,
                "Shape mismatch: keep mask length differs from detection count"
            );
            Err(ShapeError::KeepMaskLength {
                got: population.len(),
                expected: count,
            }
            .into())
        }
        Ok(population) => Ok(KeepDecision::Subset(
            population
                .iter()
                .enumerate()
                .filter(|&(_, &pixels)| pixels > 0)
                .map(|(i, _)| i)
                .collect(),
        )),
        Err(e) => {
            tracing::error!(
                error = %e,
                shape = ?masks.shape(),
                num_detections = count,
                "Device filtering failed"
            );
            tracing::warn!("Falling back to host processing due to device filtering error");
            Ok(KeepDecision::Degraded(DeviceFilterDegradation {
                reason: format!("{e:#}"),
            }))
        }
    }
}
