use crate::config::PipelineConfig;
use crate::error::{GeodetectError, Result};
use crate::raster::{CanonicalImage, RasterData, RasterGrid};
use common::span;
use ndarray::{Array3, Axis, Zip};

const NODATA_RTOL: f64 = 1e-5;
const NODATA_ATOL: f64 = 1e-8;

/// A raster sample type with its NoData comparison rule.
pub trait Sample: Copy + Default + Send + Sync {
    fn to_f64(self) -> f64;

    /// Integers match their sentinel exactly.
    fn is_nodata(self, sentinel: f64) -> bool {
        self.to_f64() == sentinel
    }
}

macro_rules! integer_sample {
    ($($t:ty),*) => {
        $(impl Sample for $t {
            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }
        })*
    };
}

integer_sample!(u8, u16, i16, u32, i32);

impl Sample for f32 {
    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    fn is_nodata(self, sentinel: f64) -> bool {
        is_close(self as f64, sentinel)
    }
}

impl Sample for f64 {
    #[inline]
    fn to_f64(self) -> f64 {
        self
    }

    fn is_nodata(self, sentinel: f64) -> bool {
        is_close(self, sentinel)
    }
}

#[inline]
fn is_close(value: f64, sentinel: f64) -> bool {
    (value - sentinel).abs() <= NODATA_ATOL + NODATA_RTOL * sentinel.abs()
}

/// How floating point input is mapped onto `[0, 255]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatRange {
    /// Every value in `[0, 1]`, scaled by 255.
    Normalized,
    /// Every value in `[0, 255]`, clamped and cast.
    Bounded,
    /// Anything else, stretched per channel from its own min/max.
    Raw,
}

impl FloatRange {
    pub fn classify(min: f64, max: f64) -> Self {
        if max <= 1.0 && min >= 0.0 {
            FloatRange::Normalized
        } else if max <= 255.0 && min >= 0.0 {
            FloatRange::Bounded
        } else {
            FloatRange::Raw
        }
    }
}

/// The three output channels, as indices into the source bands.
fn select_bands(bands: usize) -> Result<[usize; 3]> {
    match bands {
        1 => Ok([0, 0, 0]),
        n if n >= 3 => Ok([0, 1, 2]),
        n => Err(GeodetectError::UnsupportedBandCount { bands: n }),
    }
}

/// Selected channel planes `[3, H, W]` with NoData pixels zeroed, plus the
/// mask of the pixels that were zeroed.
struct Planes<T> {
    values: Array3<T>,
    nodata: Array3<bool>,
}

impl<T: Sample> Planes<T> {
    fn gather(data: &Array3<T>, selection: [usize; 3], sentinels: [Option<f64>; 3]) -> Self {
        let (_, height, width) = data.dim();
        let mut values = Array3::from_elem((3, height, width), T::default());
        let mut nodata = Array3::from_elem((3, height, width), false);

        for (channel, (&band, sentinel)) in selection.iter().zip(sentinels).enumerate() {
            let source = data.index_axis(Axis(0), band);
            let mut plane = values.index_axis_mut(Axis(0), channel);
            let mut mask = nodata.index_axis_mut(Axis(0), channel);
            Zip::from(&mut plane)
                .and(&mut mask)
                .and(&source)
                .for_each(|out, masked, &value| match sentinel {
                    Some(s) if value.is_nodata(s) => {
                        *out = T::default();
                        *masked = true;
                    }
                    _ => *out = value,
                });
        }

        Self { values, nodata }
    }

    fn map(&self, f: impl Fn(T) -> u8) -> Array3<u8> {
        self.values.mapv(f)
    }

    fn min_max(&self) -> (f64, f64) {
        min_max(self.values.iter().map(|v| v.to_f64()))
    }
}

/// NaN samples are ignored.
fn min_max(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    })
}

#[inline]
fn scale_u16(value: f32, type_max: f32) -> u8 {
    (value / type_max * 255.0).clamp(0.0, 255.0) as u8
}

fn scale_float<T: Sample>(planes: &Planes<T>) -> Array3<u8> {
    let (min, max) = planes.min_max();
    let range = FloatRange::classify(min, max);
    tracing::trace!(min, max, range = ?range, "Classified floating point raster");

    match range {
        FloatRange::Normalized => planes.map(|v| (v.to_f64() * 255.0).clamp(0.0, 255.0) as u8),
        FloatRange::Bounded => planes.map(|v| v.to_f64().clamp(0.0, 255.0) as u8),
        FloatRange::Raw => {
            let mut out = Array3::zeros(planes.values.raw_dim());
            for (source, mut target) in planes
                .values
                .outer_iter()
                .zip(out.outer_iter_mut())
            {
                let (lo, hi) = min_max(source.iter().map(|v| v.to_f64()));
                if hi > lo {
                    let extent = hi - lo;
                    Zip::from(&mut target).and(&source).for_each(|t, &v| {
                        *t = ((v.to_f64() - lo) / extent * 255.0).clamp(0.0, 255.0) as u8;
                    });
                }
            }
            out
        }
    }
}

/// Converts decoded rasters of any supported band count and sample type into
/// 3-channel 8-bit imagery.
#[derive(Debug, Clone, Copy, Default)]
pub struct BandNormalizer {
    reject_blank_tiles: bool,
}

impl BandNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new().with_blank_tile_rejection(config.enable_fault_detection)
    }

    /// When enabled, a raster whose every sample is zero is rejected with
    /// `BlankTile` instead of producing a black image.
    pub fn with_blank_tile_rejection(mut self, enabled: bool) -> Self {
        self.reject_blank_tiles = enabled;
        self
    }

    pub fn normalize(&self, grid: RasterGrid) -> Result<CanonicalImage> {
        let _s = span!("normalize_bands");

        if self.reject_blank_tiles && is_blank(grid.data()) {
            tracing::error!(dim = ?grid.data().dim(), "All pixels in the image tile are set to 0.");
            return Err(GeodetectError::BlankTile);
        }

        let selection = select_bands(grid.bands())?;
        let dtype = grid.dtype();
        let (data, nodata) = grid.into_parts();
        let sentinels = selection.map(|band| nodata.get(band).copied().flatten());

        tracing::trace!(
            dtype = ?dtype,
            dim = ?data.dim(),
            sentinels = ?sentinels,
            "Normalizing raster bands"
        );

        let (planes, mask) = match data {
            RasterData::U8(a) => {
                let Planes { values, nodata } = Planes::gather(&a, selection, sentinels);
                (values, nodata)
            }
            RasterData::U16(a) => {
                let p = Planes::gather(&a, selection, sentinels);
                let max = u16::MAX as f32;
                (p.map(|v| scale_u16(v as f32, max)), p.nodata)
            }
            RasterData::I16(a) => {
                let p = Planes::gather(&a, selection, sentinels);
                let min = i16::MIN as f32;
                let max = i16::MAX as f32;
                (p.map(|v| scale_u16(v as f32 - min, max)), p.nodata)
            }
            RasterData::F32(a) => {
                let p = Planes::gather(&a, selection, sentinels);
                (scale_float(&p), p.nodata)
            }
            RasterData::F64(a) => {
                let p = Planes::gather(&a, selection, sentinels);
                (scale_float(&p), p.nodata)
            }
            RasterData::U32(a) => {
                tracing::warn!(
                    dtype = ?dtype,
                    "Unknown data type, attempting direct cast to uint8"
                );
                let p = Planes::gather(&a, selection, sentinels);
                (p.map(|v| v as u8), p.nodata)
            }
            RasterData::I32(a) => {
                tracing::warn!(
                    dtype = ?dtype,
                    "Unknown data type, attempting direct cast to uint8"
                );
                let p = Planes::gather(&a, selection, sentinels);
                (p.map(|v| v as u8), p.nodata)
            }
        };

        Ok(to_channel_last(apply_mask(planes, &mask)))
    }
}

/// Every sample, across all bands, within tolerance of zero.
fn is_blank(data: &RasterData) -> bool {
    fn all_zero<T: Sample>(a: &Array3<T>) -> bool {
        a.iter().all(|v| is_close(v.to_f64(), 0.0))
    }

    match data {
        RasterData::U8(a) => all_zero(a),
        RasterData::U16(a) => all_zero(a),
        RasterData::I16(a) => all_zero(a),
        RasterData::U32(a) => all_zero(a),
        RasterData::I32(a) => all_zero(a),
        RasterData::F32(a) => all_zero(a),
        RasterData::F64(a) => all_zero(a),
    }
}

/// Scaling can move a zeroed sample off zero (signed shift, min-max stretch);
/// NoData pixels always come out black.
fn apply_mask(mut planes: Array3<u8>, mask: &Array3<bool>) -> Array3<u8> {
    Zip::from(&mut planes).and(mask).for_each(|v, &masked| {
        if masked {
            *v = 0;
        }
    });
    planes
}

fn to_channel_last(planes: Array3<u8>) -> CanonicalImage {
    let pixels = planes
        .permuted_axes([1, 2, 0])
        .as_standard_layout()
        .into_owned();
    CanonicalImage::from_standard_layout(pixels)
}
