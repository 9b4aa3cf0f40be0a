use crate::batch::{BoxDetectionBatch, NormalizedDetectionBatch};
use crate::error::Result;
use crate::geometry::Polygon;
use ndarray::{ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Coordinates used when a detection has no usable mask boundary.
pub const FALLBACK_POINT: [f64; 2] = [0.0, 0.0];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Polygon(Vec<Vec<[f64; 2]>>),
    Point([f64; 2]),
}

impl Geometry {
    pub fn from_polygon(polygon: &Polygon) -> Self {
        let ring = polygon
            .vertices()
            .iter()
            .map(|&[x, y]| [f64::from(x), f64::from(y)])
            .collect();
        Geometry::Polygon(vec![ring])
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Geometry::Point(_))
    }
}

impl From<Option<&Polygon>> for Geometry {
    fn from(polygon: Option<&Polygon>) -> Self {
        polygon
            .map(Geometry::from_polygon)
            .unwrap_or(Geometry::Point(FALLBACK_POINT))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetadata {
    pub model_name: String,
    pub ontology_name: String,
    pub ontology_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureClass {
    pub iri: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureProperties {
    #[serde(rename = "imageBBox")]
    pub image_bbox: [f32; 4],
    pub feature_classes: Vec<FeatureClass>,
    pub model_metadata: ModelMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub struct Feature {
    pub geometry: Geometry,
    pub id: String,
    pub properties: FeatureProperties,
}

impl Feature {
    /// Builds a feature with a freshly generated id.
    pub fn new(
        geometry: Geometry,
        image_bbox: [f32; 4],
        class_label: &str,
        score: f64,
        metadata: ModelMetadata,
    ) -> Self {
        Self {
            geometry,
            id: generate_id(),
            properties: FeatureProperties {
                image_bbox,
                feature_classes: vec![FeatureClass {
                    iri: class_label.to_string(),
                    score,
                }],
                model_metadata: metadata,
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub struct FeatureCollection {
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// 128 random bits rendered as 32 lowercase hex digits.
fn generate_id() -> String {
    format!("{:032x}", fastrand::u128(..))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureAssembler;

impl FeatureAssembler {
    pub fn new() -> Self {
        Self
    }

    /// One feature per detection, in batch order.
    pub fn assemble(
        &self,
        batch: &NormalizedDetectionBatch,
        class_label: &str,
        metadata: &ModelMetadata,
    ) -> FeatureCollection {
        let _s = common::span!("assemble_features");

        let geometries = batch.geometries.iter().map(|p| Geometry::from(p.as_ref()));
        let collection = self.build(
            batch.boxes.view(),
            batch.scores.view(),
            geometries,
            class_label,
            metadata,
        );

        let fallbacks = collection
            .features
            .iter()
            .filter(|f| f.geometry.is_fallback())
            .count();
        if fallbacks > 0 {
            tracing::debug!(fallbacks, total = collection.len(), "Features using point geometry");
        }

        collection
    }

    /// Detections without masks all get the fallback point geometry.
    pub fn assemble_boxes(
        &self,
        batch: &BoxDetectionBatch,
        class_label: &str,
        metadata: &ModelMetadata,
    ) -> Result<FeatureCollection> {
        let _s = common::span!("assemble_box_features");
        let count = batch.validate()?;
        if count == 0 {
            tracing::debug!("No features found");
        }

        let geometries = std::iter::repeat_n(Geometry::Point(FALLBACK_POINT), count);
        Ok(self.build(
            batch.boxes.view(),
            batch.scores.view(),
            geometries,
            class_label,
            metadata,
        ))
    }

    fn build(
        &self,
        boxes: ArrayView2<'_, f32>,
        scores: ArrayView1<'_, f32>,
        geometries: impl Iterator<Item = Geometry>,
        class_label: &str,
        metadata: &ModelMetadata,
    ) -> FeatureCollection {
        let features = boxes
            .axis_iter(Axis(0))
            .zip(scores.iter())
            .zip(geometries)
            .map(|((bbox, &score), geometry)| {
                Feature::new(
                    geometry,
                    [bbox[0], bbox[1], bbox[2], bbox[3]],
                    class_label,
                    f64::from(score),
                    metadata.clone(),
                )
            })
            .collect();

        FeatureCollection { features }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::DetectionBatchProcessor;
    use crate::batch::RawDetectionBatch;
    use crate::device::CpuDevice;
    use ndarray::{Array1, Array2, Array3};
    use serde_json::{Value, json};
    use std::collections::HashSet;

    fn metadata() -> ModelMetadata {
        ModelMetadata {
            model_name: "sam3".to_string(),
            ontology_name: "building".to_string(),
            ontology_version: "1.0.0".to_string(),
        }
    }

    /// Detection 0 has a square mask, detection 1 is empty.
    fn normalized() -> NormalizedDetectionBatch {
        let mut masks = Array3::<f32>::zeros((2, 8, 8));
        for y in 2..5 {
            for x in 2..5 {
                masks[[0, y, x]] = 1.0;
            }
        }
        let raw = RawDetectionBatch {
            masks: masks.into_dyn(),
            boxes: Array2::from_shape_vec((2, 4), vec![1.5, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0])
                .unwrap(),
            scores: Array1::from_vec(vec![0.25, 0.75]),
        };
        DetectionBatchProcessor::with_workers(2)
            .unwrap()
            .process(&CpuDevice, raw)
            .unwrap()
    }

    #[test]
    fn test_empty_collection_exact_json() {
        let json = FeatureCollection::default().to_json().unwrap();
        assert_eq!(json, r#"{"type":"FeatureCollection","features":[]}"#);
    }

    #[test]
    fn test_feature_schema() {
        let collection = FeatureAssembler::new().assemble(&normalized(), "building", &metadata());
        let value: Value = serde_json::from_str(&collection.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "FeatureCollection");
        let features = value["features"].as_array().unwrap();
        assert_eq!(features.len(), 2);

        let first = &features[0];
        assert_eq!(first["type"], "Feature");
        assert_eq!(first["geometry"]["type"], "Polygon");
        let ring = first["geometry"]["coordinates"][0].as_array().unwrap();
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.first(), ring.last(), "Ring must be closed");
        for corner in [json!([2.5, 2.5]), json!([2.5, 4.5]), json!([4.5, 4.5]), json!([4.5, 2.5])] {
            assert!(ring.contains(&corner), "Missing corner {corner}");
        }
        assert_eq!(first["properties"]["imageBBox"], json!([1.5, 2.0, 3.0, 4.0]));
        assert_eq!(
            first["properties"]["featureClasses"],
            json!([{"iri": "building", "score": 0.25}])
        );
        assert_eq!(
            first["properties"]["modelMetadata"],
            json!({"modelName": "sam3", "ontologyName": "building", "ontologyVersion": "1.0.0"})
        );

        let second = &features[1];
        assert_eq!(
            second["geometry"],
            json!({"type": "Point", "coordinates": [0.0, 0.0]}),
            "Empty mask falls back to a point"
        );
        assert_eq!(second["properties"]["featureClasses"][0]["score"], 0.75);
    }

    #[test]
    fn test_order_follows_detections_not_scores() {
        let collection = FeatureAssembler::new().assemble(&normalized(), "building", &metadata());
        let scores: Vec<f64> = collection
            .features
            .iter()
            .map(|f| f.properties.feature_classes[0].score)
            .collect();
        assert_eq!(scores, vec![0.25, 0.75]);
    }

    #[test]
    fn test_box_only_detections_use_point_geometry() {
        let batch = BoxDetectionBatch {
            boxes: Array2::from_shape_vec((2, 4), vec![10.0, 20.0, 30.0, 40.0, 1.0, 2.0, 3.0, 4.0])
                .unwrap(),
            scores: Array1::from_vec(vec![0.5, 0.25]),
        };
        let collection = FeatureAssembler::new()
            .assemble_boxes(&batch, "ship", &metadata())
            .unwrap();

        assert_eq!(collection.len(), 2);
        assert!(collection.features.iter().all(|f| f.geometry.is_fallback()));
        assert_eq!(collection.features[0].properties.image_bbox, [10.0, 20.0, 30.0, 40.0]);
        assert_eq!(collection.features[1].properties.feature_classes[0].score, 0.25);
        assert_eq!(collection.features[1].properties.feature_classes[0].iri, "ship");
        assert_ne!(collection.features[0].id, collection.features[1].id);
    }

    #[test]
    fn test_box_only_length_mismatch_rejected() {
        let batch = BoxDetectionBatch {
            boxes: Array2::zeros((2, 4)),
            scores: Array1::zeros(3),
        };
        assert!(matches!(
            FeatureAssembler::new().assemble_boxes(&batch, "ship", &metadata()),
            Err(crate::error::GeodetectError::Shape(
                crate::error::ShapeError::BoxScoreMismatch { boxes: 2, scores: 3 }
            ))
        ));
    }

    #[test]
    fn test_ids_unique_and_hex() {
        let ids: HashSet<String> = (0..256).map(|_| generate_id()).collect();
        assert_eq!(ids.len(), 256);
        for id in &ids {
            assert_eq!(id.len(), 32);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn test_collection_round_trips_through_json() {
        let collection = FeatureAssembler::new().assemble(&normalized(), "building", &metadata());
        let parsed: FeatureCollection =
            serde_json::from_str(&collection.to_json().unwrap()).unwrap();
        assert_eq!(parsed, collection);
    }
}
