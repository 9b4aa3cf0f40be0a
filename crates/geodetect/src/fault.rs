//! Color-triggered failure model used to exercise error handling in callers.
//!
//! The dominant color of an image selects one of a fixed set of responses.

use crate::error::Result;
use crate::feature::{FALLBACK_POINT, Feature, FeatureCollection, Geometry, ModelMetadata};
use crate::normalize::Sample;
use crate::raster::{RasterData, RasterGrid};
use ndarray::Array3;
use std::time::Duration;

pub const TIMEOUT_DELAY: Duration = Duration::from_secs(5);

const HIGH: i64 = 200;
const LOW: i64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultBehavior {
    Ok,
    ServerError,
    MalformedBody,
    SchemaViolation,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultResponse {
    pub status: u16,
    pub body: String,
    /// How long the caller should stall before answering.
    pub delay: Option<Duration>,
}

impl FaultResponse {
    fn immediate(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            delay: None,
        }
    }
}

impl FaultBehavior {
    /// First matching rule wins: red, green, purple, blue, then `Ok`.
    pub fn from_color((r, g, b): (i64, i64, i64)) -> Self {
        if r > HIGH && g < LOW && b < LOW {
            FaultBehavior::ServerError
        } else if g > HIGH && r < LOW && b < LOW {
            FaultBehavior::MalformedBody
        } else if r > HIGH && b > HIGH && g < LOW {
            FaultBehavior::SchemaViolation
        } else if b > HIGH && r < LOW && g < LOW {
            FaultBehavior::Timeout
        } else {
            FaultBehavior::Ok
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FaultBehavior::Ok => "ok",
            FaultBehavior::ServerError => "server-error",
            FaultBehavior::MalformedBody => "malformed-body",
            FaultBehavior::SchemaViolation => "schema-violation",
            FaultBehavior::Timeout => "timeout",
        }
    }

    pub fn response(&self) -> Result<FaultResponse> {
        let response = match self {
            FaultBehavior::ServerError => {
                FaultResponse::immediate(500, "Unable to process request.")
            }
            FaultBehavior::MalformedBody => FaultResponse::immediate(
                200,
                r#"{"type": "FeatureCollection", "features": [invalid}"#,
            ),
            FaultBehavior::SchemaViolation => {
                let mut feature = serde_json::to_value(test_feature())?;
                feature["geometry"] = serde_json::Value::Null;
                let body = serde_json::json!({
                    "type": "FeatureCollection",
                    "invalid_key": [feature],
                });
                FaultResponse::immediate(200, serde_json::to_string(&body)?)
            }
            FaultBehavior::Timeout => FaultResponse {
                status: 408,
                body: "Request timeout".to_string(),
                delay: Some(TIMEOUT_DELAY),
            },
            FaultBehavior::Ok => {
                let collection = FeatureCollection {
                    features: vec![test_feature()],
                };
                FaultResponse::immediate(200, collection.to_json()?)
            }
        };
        tracing::debug!(behavior = self.as_str(), status = response.status, "Fault response");
        Ok(response)
    }
}

fn test_feature() -> Feature {
    Feature::new(
        Geometry::Point(FALLBACK_POINT),
        [100.0, 100.0, 200.0, 200.0],
        "test_object",
        1.0,
        ModelMetadata {
            model_name: "failure".to_string(),
            ontology_name: "test_object".to_string(),
            ontology_version: "1.0.0".to_string(),
        },
    )
}

/// Per-band mean of the decoded samples, truncated toward zero.
///
/// Samples are not rescaled, so 16-bit and float rasters compare their raw
/// values against the thresholds. Rasters with fewer than three bands use
/// the first band's mean for every channel.
pub fn dominant_color(grid: &RasterGrid) -> (i64, i64, i64) {
    if grid.height() * grid.width() == 0 {
        return (0, 0, 0);
    }

    let means = match grid.data() {
        RasterData::U8(a) => band_means(a),
        RasterData::U16(a) => band_means(a),
        RasterData::I16(a) => band_means(a),
        RasterData::U32(a) => band_means(a),
        RasterData::I32(a) => band_means(a),
        RasterData::F32(a) => band_means(a),
        RasterData::F64(a) => band_means(a),
    };
    tracing::trace!(means = ?means, "Average band values");

    match means.as_slice() {
        [r, g, b, ..] => (*r as i64, *g as i64, *b as i64),
        [gray, ..] => (*gray as i64, *gray as i64, *gray as i64),
        [] => (0, 0, 0),
    }
}

fn band_means<T: Sample>(data: &Array3<T>) -> Vec<f64> {
    data.outer_iter()
        .map(|band| band.iter().map(|v| v.to_f64()).sum::<f64>() / band.len() as f64)
        .collect()
}
