use crate::error::GeometryError;
use image::{GrayImage, Luma};
use imageproc::contours::{BorderType, Contour, find_contours};
use imageproc::point::Point;
use ndarray::{ArrayView2, ArrayViewD, Axis, Ix2};

/// Pixel indices address corners; polygon vertices sit on pixel centers.
const PIXEL_CENTER_OFFSET: f32 = 0.5;

/// Zero border added around the mask so components touching the tile edge
/// are still traced.
const BORDER_PADDING: u32 = 1;

/// Boundaries with this many vertices or fewer are not treated as polygons.
const MIN_CONTOUR_VERTICES: usize = 3;

/// A mask sample that can be interpreted as foreground or background.
pub trait MaskValue: Copy + Send + Sync {
    fn is_foreground(self) -> bool;
}

impl MaskValue for bool {
    #[inline]
    fn is_foreground(self) -> bool {
        self
    }
}

impl MaskValue for u8 {
    #[inline]
    fn is_foreground(self) -> bool {
        self > 0
    }
}

impl MaskValue for f32 {
    #[inline]
    fn is_foreground(self) -> bool {
        self > 0.0
    }
}

/// Closed ring of `(x, y)` vertices in pixel-center image coordinates.
///
/// Always holds at least three vertices and its first vertex equals its last.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    ring: Vec<[f32; 2]>,
}

impl Polygon {
    /// Closes the ring if needed. `None` when fewer than three vertices remain.
    pub fn from_vertices(mut vertices: Vec<[f32; 2]>) -> Option<Self> {
        match (vertices.first(), vertices.last()) {
            (Some(&first), Some(&last)) if first != last => vertices.push(first),
            _ => {}
        }
        (vertices.len() >= MIN_CONTOUR_VERTICES).then_some(Self { ring: vertices })
    }

    pub fn vertices(&self) -> &[[f32; 2]] {
        &self.ring
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.ring.first() == self.ring.last()
    }
}

/// Converts a single detection mask into its outer boundary polygon.
///
/// Stateless, so one extractor can be shared by any number of workers.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaskGeometryExtractor;

impl MaskGeometryExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Returns `Ok(None)` for masks that are empty, not two dimensional after
    /// squeezing, or whose largest boundary is too small to form a polygon.
    pub fn extract<T: MaskValue>(
        &self,
        mask: ArrayViewD<'_, T>,
    ) -> Result<Option<Polygon>, GeometryError> {
        let mut mask = mask;
        while mask.ndim() > 2 && mask.shape()[0] == 1 {
            mask = mask.index_axis_move(Axis(0), 0);
        }
        let Ok(mask) = mask.into_dimensionality::<Ix2>() else {
            return Ok(None);
        };
        if !mask.iter().any(|v| v.is_foreground()) {
            return Ok(None);
        }

        let binary = binarize(mask)?;
        let Some(boundary) = largest_external_boundary(find_contours::<i32>(&binary)) else {
            return Ok(None);
        };
        if boundary.len() <= MIN_CONTOUR_VERTICES {
            return Ok(None);
        }

        let vertices = boundary
            .iter()
            .map(|p| {
                let (x, y) = (p.x - BORDER_PADDING as i32, p.y - BORDER_PADDING as i32);
                [
                    x as f32 + PIXEL_CENTER_OFFSET,
                    y as f32 + PIXEL_CENTER_OFFSET,
                ]
            })
            .collect();

        Ok(Polygon::from_vertices(vertices))
    }
}

/// Foreground becomes 255 inside a zero border of `BORDER_PADDING` pixels.
fn binarize<T: MaskValue>(mask: ArrayView2<'_, T>) -> Result<GrayImage, GeometryError> {
    let (height, width) = mask.dim();
    let too_large = || GeometryError::MaskTooLarge { height, width };
    let padded = |n: usize| {
        u32::try_from(n)
            .ok()
            .and_then(|n| n.checked_add(2 * BORDER_PADDING))
            .ok_or_else(too_large)
    };
    let (w, h) = (padded(width)?, padded(height)?);

    let mut image = GrayImage::new(w, h);
    for ((y, x), &value) in mask.indexed_iter() {
        if value.is_foreground() {
            let (x, y) = (x as u32 + BORDER_PADDING, y as u32 + BORDER_PADDING);
            image.put_pixel(x, y, Luma([255u8]));
        }
    }
    Ok(image)
}

/// Picks the outermost boundary enclosing the largest area, compressed to its
/// corner vertices. Equal areas keep the first boundary found in raster order.
fn largest_external_boundary(contours: Vec<Contour<i32>>) -> Option<Vec<Point<i32>>> {
    let mut best: Option<(f64, Vec<Point<i32>>)> = None;

    for contour in contours {
        if contour.border_type != BorderType::Outer || contour.parent.is_some() {
            continue;
        }
        let points = compress_straight_runs(&contour.points);
        let area = enclosed_area(&points);
        match &best {
            Some((best_area, _)) if area <= *best_area => {}
            _ => best = Some((area, points)),
        }
    }

    best.map(|(_, points)| points)
}

/// Drops points that sit in the middle of a horizontal, vertical or diagonal
/// run, keeping only the points where the boundary changes direction.
fn compress_straight_runs(points: &[Point<i32>]) -> Vec<Point<i32>> {
    let n = points.len();
    if n <= 2 {
        return points.to_vec();
    }

    let direction =
        |from: Point<i32>, to: Point<i32>| ((to.x - from.x).signum(), (to.y - from.y).signum());

    let compressed: Vec<_> = (0..n)
        .filter(|&i| {
            let prev = points[(i + n - 1) % n];
            let curr = points[i];
            let next = points[(i + 1) % n];
            direction(prev, curr) != direction(curr, next)
        })
        .map(|i| points[i])
        .collect();

    if compressed.is_empty() {
        points.to_vec()
    } else {
        compressed
    }
}

/// Shoelace area of the closed boundary.
fn enclosed_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice: i64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64)
        .sum();
    twice.abs() as f64 / 2.0
}
