use ndarray::{Array1, Array2, Array3, Axis};

/// Where a device keeps the tensors it hands back from inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Host,
    Device,
}

/// Detection tensors moved between device and host as one unit.
#[derive(Debug, Clone)]
pub struct DeviceTensors {
    pub masks: Array3<f32>,
    pub boxes: Array2<f32>,
    pub scores: Array1<f32>,
}

/// Handle to the accelerator that produced a detection batch.
///
/// Owned by the hosting service and shared immutably across requests.
pub trait ComputeDevice: Send + Sync {
    fn name(&self) -> &str;

    fn residency(&self) -> Residency;

    /// Number of positive pixels in every mask of `masks` (`[N, H, W]`),
    /// reduced where the tensors live.
    fn mask_population(&self, masks: &Array3<f32>) -> anyhow::Result<Vec<usize>>;

    /// Blocks until all queued device work has completed.
    fn synchronize(&self) -> anyhow::Result<()>;

    /// Moves masks, boxes and scores to host memory together, behind a single
    /// synchronization barrier.
    fn transfer_to_host(&self, tensors: DeviceTensors) -> anyhow::Result<DeviceTensors> {
        self.synchronize()?;
        Ok(tensors)
    }
}

/// Tensors already in host memory; nothing to filter on device or transfer.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuDevice;

impl ComputeDevice for CpuDevice {
    fn name(&self) -> &str {
        "cpu"
    }

    fn residency(&self) -> Residency {
        Residency::Host
    }

    fn mask_population(&self, masks: &Array3<f32>) -> anyhow::Result<Vec<usize>> {
        Ok(masks
            .axis_iter(Axis(0))
            .map(|mask| mask.iter().filter(|&&v| v > 0.0).count())
            .collect())
    }

    fn synchronize(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
