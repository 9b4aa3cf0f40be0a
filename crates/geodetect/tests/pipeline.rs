use geodetect::{
    BandNormalizer, ComputeDevice, CpuDevice, DetectionPipeline, DeviceTensors, FailureCategory,
    FaultBehavior, GeodetectError, PipelineConfig, RasterData, RasterGrid, RawDetectionBatch,
    Residency, ShapeError, dominant_color,
};
use image::{DynamicImage, Rgb, RgbImage};
use ndarray::{Array1, Array2, Array3, Array4, ArrayD, IxDyn, s};
use serde_json::Value;

fn pipeline() -> DetectionPipeline {
    let config = PipelineConfig::from_lookup(|key| match key {
        "MASK_POLYGON_WORKERS" => Some("4".to_string()),
        _ => None,
    });
    DetectionPipeline::new(&config).unwrap()
}

/// Rectangles of increasing width, so every feature can be told apart by
/// its polygon extent.
fn rectangles(n: usize) -> Array3<f32> {
    let mut masks = Array3::zeros((n, 32, 32));
    for i in 0..n {
        masks.slice_mut(s![i, 4..12, 2..4 + i]).fill(1.0);
    }
    masks
}

fn raw(masks: ArrayD<f32>, n: usize) -> RawDetectionBatch {
    RawDetectionBatch {
        masks,
        boxes: Array2::from_shape_fn((n, 4), |(i, j)| (i * 4 + j) as f32),
        scores: Array1::from_shape_fn(n, |i| (i as f32 + 1.0) / 100.0),
    }
}

fn max_x(feature: &Value) -> f64 {
    feature["geometry"]["coordinates"][0]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v[0].as_f64().unwrap())
        .fold(f64::MIN, f64::max)
}

/// Holds tensors "on device" and records transfers.
struct AcceleratorStub;

impl ComputeDevice for AcceleratorStub {
    fn name(&self) -> &str {
        "stub"
    }

    fn residency(&self) -> Residency {
        Residency::Device
    }

    fn mask_population(&self, masks: &Array3<f32>) -> anyhow::Result<Vec<usize>> {
        CpuDevice.mask_population(masks)
    }

    fn synchronize(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct BrokenTransfer;

impl ComputeDevice for BrokenTransfer {
    fn name(&self) -> &str {
        "broken"
    }

    fn residency(&self) -> Residency {
        Residency::Device
    }

    fn mask_population(&self, masks: &Array3<f32>) -> anyhow::Result<Vec<usize>> {
        CpuDevice.mask_population(masks)
    }

    fn synchronize(&self) -> anyhow::Result<()> {
        anyhow::bail!("stream synchronization failed")
    }

    fn transfer_to_host(&self, _tensors: DeviceTensors) -> anyhow::Result<DeviceTensors> {
        self.synchronize()?;
        anyhow::bail!("unreachable")
    }
}

#[test]
fn feature_order_matches_detection_order() {
    let n = 10;
    let collection = pipeline()
        .run(&CpuDevice, raw(rectangles(n).into_dyn(), n), Some("building"))
        .unwrap();
    let value: Value = serde_json::from_str(&collection.to_json().unwrap()).unwrap();
    let features = value["features"].as_array().unwrap();

    assert_eq!(features.len(), n);
    for (i, feature) in features.iter().enumerate() {
        assert_eq!(max_x(feature), (3 + i) as f64 + 0.5, "Feature {i} out of order");
        assert_eq!(
            feature["properties"]["imageBBox"][0].as_f64().unwrap(),
            (i * 4) as f64
        );
    }
}

#[test]
fn device_filtering_preserves_relative_order() {
    let mut masks = rectangles(6);
    masks.slice_mut(s![1, .., ..]).fill(0.0);
    masks.slice_mut(s![4, .., ..]).fill(0.0);

    let collection = pipeline()
        .run(&AcceleratorStub, raw(masks.into_dyn(), 6), None)
        .unwrap();
    let scores: Vec<f64> = collection
        .features
        .iter()
        .map(|f| f.properties.feature_classes[0].score)
        .collect();

    assert_eq!(scores.len(), 4);
    let expected = [0.01f32, 0.03, 0.04, 0.06].map(f64::from);
    assert_eq!(scores, expected);
}

#[test]
fn singleton_channel_masks_are_accepted() {
    let masks = rectangles(3).insert_axis(ndarray::Axis(1));
    assert_eq!(masks.shape(), &[3, 1, 32, 32]);
    let collection = pipeline().run(&CpuDevice, raw(masks.into_dyn(), 3), None).unwrap();
    assert_eq!(collection.len(), 3);
}

#[test]
fn unsalvageable_masks_are_rejected() {
    let masks = Array4::<f32>::zeros((3, 2, 64, 32));
    let err = pipeline()
        .run(&CpuDevice, raw(masks.into_dyn(), 3), None)
        .unwrap_err();
    assert!(matches!(err, GeodetectError::Shape(ShapeError::UnsalvageableRank4 { .. })));
    assert_eq!(err.category(), FailureCategory::ClientInput);

    let masks = ArrayD::<f32>::zeros(IxDyn(&[1, 1, 3, 8, 8]));
    let err = pipeline().run(&CpuDevice, raw(masks, 1), None).unwrap_err();
    assert!(matches!(err, GeodetectError::Shape(ShapeError::UnexpectedRank { .. })));
}

#[test]
fn transfer_failure_is_fatal() {
    let err = pipeline()
        .run(&BrokenTransfer, raw(rectangles(2).into_dyn(), 2), None)
        .unwrap_err();
    assert!(matches!(err, GeodetectError::Device(_)));
    assert_eq!(err.category(), FailureCategory::Internal);
    assert!(err.to_string().contains("stream synchronization failed"));
}

#[test]
fn decoded_image_flows_through_normalizer() {
    let img = RgbImage::from_pixel(8, 8, Rgb([0, 230, 10]));
    let grid = RasterGrid::from_dynamic_image(&DynamicImage::ImageRgb8(img)).unwrap();
    let behavior = FaultBehavior::from_color(dominant_color(&grid));
    assert_eq!(behavior, FaultBehavior::MalformedBody);

    let canonical = BandNormalizer::new().normalize(grid).unwrap();
    assert_eq!(canonical.height(), 8);
    assert_eq!(canonical.as_bytes().len(), 8 * 8 * 3);
}

#[test]
fn float_nodata_pixels_are_black() {
    let mut data = Array3::<f32>::from_elem((3, 4, 4), 1000.0);
    data.slice_mut(s![.., 0, 0]).fill(-9999.0);
    data[[0, 3, 3]] = 2000.0;
    let grid = RasterGrid::new(RasterData::F32(data))
        .with_nodata(vec![Some(-9999.0); 3])
        .unwrap();

    let image = BandNormalizer::new().normalize(grid).unwrap();
    assert_eq!(image.pixel(0, 0), [0, 0, 0]);
    assert_eq!(image.pixel(3, 3)[0], 255);
}

#[test]
fn masks_clipped_by_tile_edge_keep_polygons() {
    let mut masks = Array3::<f32>::zeros((3, 16, 16));
    masks.slice_mut(s![0, .., ..]).fill(1.0);
    masks.slice_mut(s![1, 0..5, 0..5]).fill(1.0);
    masks.slice_mut(s![2, 6..10, 10..16]).fill(1.0);

    let collection = pipeline().run(&CpuDevice, raw(masks.into_dyn(), 3), None).unwrap();
    assert!(
        collection.features.iter().all(|f| !f.geometry.is_fallback()),
        "Edge-touching masks must not fall back to points"
    );
}
