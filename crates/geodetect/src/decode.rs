use crate::error::{GeodetectError, Result};
use crate::raster::{RasterData, RasterGrid};
use image::{DynamicImage, ImageBuffer, Pixel};
use ndarray::Array3;

impl RasterGrid {
    /// Converts a decoded image into a band-major grid without NoData.
    ///
    /// Pixel formats the normalizer has no direct path for are converted to
    /// 8-bit RGB first.
    pub fn from_dynamic_image(image: &DynamicImage) -> Result<Self> {
        let data = match image {
            DynamicImage::ImageLuma8(buf) => RasterData::U8(band_major(buf)?),
            DynamicImage::ImageLumaA8(buf) => RasterData::U8(band_major(buf)?),
            DynamicImage::ImageRgb8(buf) => RasterData::U8(band_major(buf)?),
            DynamicImage::ImageRgba8(buf) => RasterData::U8(band_major(buf)?),
            DynamicImage::ImageLuma16(buf) => RasterData::U16(band_major(buf)?),
            DynamicImage::ImageLumaA16(buf) => RasterData::U16(band_major(buf)?),
            DynamicImage::ImageRgb16(buf) => RasterData::U16(band_major(buf)?),
            DynamicImage::ImageRgba16(buf) => RasterData::U16(band_major(buf)?),
            DynamicImage::ImageRgb32F(buf) => RasterData::F32(band_major(buf)?),
            DynamicImage::ImageRgba32F(buf) => RasterData::F32(band_major(buf)?),
            other => {
                tracing::warn!(
                    color = ?other.color(),
                    "Unrecognized pixel layout, converting to RGB8"
                );
                RasterData::U8(band_major(&other.to_rgb8())?)
            }
        };

        Ok(RasterGrid::new(data))
    }
}

/// Interleaved `[H, W, C]` samples to `[C, H, W]`.
fn band_major<P: Pixel>(buf: &ImageBuffer<P, Vec<P::Subpixel>>) -> Result<Array3<P::Subpixel>> {
    let (width, height) = buf.dimensions();
    let shape = (height as usize, width as usize, usize::from(P::CHANNEL_COUNT));
    let interleaved = Array3::from_shape_vec(shape, buf.as_raw().clone()).map_err(|e| {
        GeodetectError::InvalidRaster(format!("pixel buffer does not match dimensions: {e}"))
    })?;
    Ok(interleaved
        .permuted_axes([2, 0, 1])
        .as_standard_layout()
        .into_owned())
}
