use crate::error::{GeodetectError, Result};
use ndarray::{Array3, ArrayView3};

/// Numeric type of the samples in a [`RasterGrid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    U8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl DataType {
    pub fn is_floating(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }
}

/// Band-major sample storage, `[bands, height, width]`.
#[derive(Debug, Clone)]
pub enum RasterData {
    U8(Array3<u8>),
    U16(Array3<u16>),
    I16(Array3<i16>),
    U32(Array3<u32>),
    I32(Array3<i32>),
    F32(Array3<f32>),
    F64(Array3<f64>),
}

impl RasterData {
    pub fn dtype(&self) -> DataType {
        match self {
            RasterData::U8(_) => DataType::U8,
            RasterData::U16(_) => DataType::U16,
            RasterData::I16(_) => DataType::I16,
            RasterData::U32(_) => DataType::U32,
            RasterData::I32(_) => DataType::I32,
            RasterData::F32(_) => DataType::F32,
            RasterData::F64(_) => DataType::F64,
        }
    }

    /// `(bands, height, width)`
    pub fn dim(&self) -> (usize, usize, usize) {
        match self {
            RasterData::U8(a) => a.dim(),
            RasterData::U16(a) => a.dim(),
            RasterData::I16(a) => a.dim(),
            RasterData::U32(a) => a.dim(),
            RasterData::I32(a) => a.dim(),
            RasterData::F32(a) => a.dim(),
            RasterData::F64(a) => a.dim(),
        }
    }
}

/// Decoded multi-band imagery with an optional NoData sentinel per band.
#[derive(Debug, Clone)]
pub struct RasterGrid {
    data: RasterData,
    nodata: Vec<Option<f64>>,
}

impl RasterGrid {
    pub fn new(data: RasterData) -> Self {
        let bands = data.dim().0;
        Self {
            data,
            nodata: vec![None; bands],
        }
    }

    /// Attach one sentinel slot per band. Bands without a sentinel use `None`.
    pub fn with_nodata(mut self, nodata: Vec<Option<f64>>) -> Result<Self> {
        if nodata.len() != self.bands() {
            return Err(GeodetectError::InvalidRaster(format!(
                "{} NoData entries for {} bands",
                nodata.len(),
                self.bands()
            )));
        }
        self.nodata = nodata;
        Ok(self)
    }

    pub fn bands(&self) -> usize {
        self.data.dim().0
    }

    pub fn height(&self) -> usize {
        self.data.dim().1
    }

    pub fn width(&self) -> usize {
        self.data.dim().2
    }

    pub fn dtype(&self) -> DataType {
        self.data.dtype()
    }

    pub fn nodata(&self, band: usize) -> Option<f64> {
        self.nodata.get(band).copied().flatten()
    }

    pub fn data(&self) -> &RasterData {
        &self.data
    }

    pub(crate) fn into_parts(self) -> (RasterData, Vec<Option<f64>>) {
        (self.data, self.nodata)
    }
}

/// Normalized `height x width x 3` RGB pixels, contiguous and channel-last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalImage {
    pixels: Array3<u8>,
}

impl CanonicalImage {
    pub(crate) fn from_standard_layout(pixels: Array3<u8>) -> Self {
        debug_assert_eq!(pixels.dim().2, 3);
        debug_assert!(pixels.is_standard_layout());
        Self { pixels }
    }

    pub fn height(&self) -> usize {
        self.pixels.dim().0
    }

    pub fn width(&self) -> usize {
        self.pixels.dim().1
    }

    pub fn pixel(&self, y: usize, x: usize) -> [u8; 3] {
        [
            self.pixels[[y, x, 0]],
            self.pixels[[y, x, 1]],
            self.pixels[[y, x, 2]],
        ]
    }

    pub fn view(&self) -> ArrayView3<'_, u8> {
        self.pixels.view()
    }

    /// Row-major `RGBRGB...` bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.pixels.as_slice().unwrap_or(&[])
    }

    pub fn into_raw(self) -> Vec<u8> {
        let (raw, _offset) = self.pixels.into_raw_vec_and_offset();
        raw
    }

    pub fn to_rgb_image(&self) -> Option<image::RgbImage> {
        let width = u32::try_from(self.width()).ok()?;
        let height = u32::try_from(self.height()).ok()?;
        image::RgbImage::from_raw(width, height, self.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_grid_has_no_nodata() {
        let grid = RasterGrid::new(RasterData::U8(Array3::zeros((3, 2, 2))));
        assert_eq!(grid.bands(), 3);
        assert_eq!(grid.dtype(), DataType::U8);
        assert!((0..3).all(|b| grid.nodata(b).is_none()));
        assert!(grid.nodata(7).is_none(), "Out of range band has no sentinel");
    }

    #[test]
    fn with_nodata_rejects_wrong_length() {
        let grid = RasterGrid::new(RasterData::F32(Array3::zeros((3, 2, 2))));
        let result = grid.with_nodata(vec![Some(0.0)]);
        assert!(matches!(result, Err(GeodetectError::InvalidRaster(_))));
    }

    #[test]
    fn canonical_image_converts_to_rgb_image() {
        let mut pixels = Array3::zeros((2, 3, 3));
        pixels[[1, 2, 0]] = 10;
        pixels[[1, 2, 1]] = 20;
        pixels[[1, 2, 2]] = 30;
        let canonical = CanonicalImage::from_standard_layout(pixels);

        let rgb = canonical.to_rgb_image().unwrap();
        assert_eq!(rgb.width(), 3);
        assert_eq!(rgb.height(), 2);
        assert_eq!(rgb.get_pixel(2, 1).0, [10, 20, 30]);
        assert_eq!(canonical.as_bytes().len(), 18);
    }
}
