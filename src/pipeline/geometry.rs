//! Receipt isolation: photograph + foreground mask → upright receipt image.
//!
//! ## Steps
//!
//! 1. Binarise the mask (`> mask_threshold`) and trace external contours,
//!    with the outside of the frame treated as background.
//! 2. Keep the contour with the largest enclosed area (first one wins ties).
//! 3. Below `min_contour_area` the detection is treated as noise.
//! 4. Simplify the contour with closed-curve Douglas–Peucker at
//!    `approx_epsilon_ratio × perimeter`.
//! 5. Four vertices: perspective-rectify that quadrilateral. Otherwise apply
//!    [`ShapePolicy`]: warp the minimum-area rotated rectangle, or crop the
//!    padded bounding box.
//! 6. Landscape results get one quarter turn.
//!
//! Detection misses never fail: without a usable contour the photograph is
//! returned pixel-for-pixel. Everything here is a pure function of
//! `(image, mask, GeometryConfig)` and CPU-bound; async callers wrap
//! [`extract`] in `spawn_blocking`.

use crate::config::{GeometryConfig, RotationDirection, ShapePolicy};
use image::{imageops, GrayImage, Luma, Rgb, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use serde::Serialize;
use std::cmp::Ordering;
use tracing::{debug, info};

/// A 2-D point in pixel coordinates (x right, y down).
pub type Pt = (f64, f64);

/// How the receipt image was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// The mask had no foreground; photograph passed through.
    NoContour,
    /// The dominant region was below the noise threshold; photograph passed through.
    ContourTooSmall,
    /// The region simplified to four corners, which were rectified.
    Quadrilateral,
    /// The minimum-area rectangle around the region was rectified.
    MinAreaRect,
    /// The padded bounding box was cropped without warping.
    BoundingBox,
}

impl ExtractionMethod {
    /// Whether a receipt region was found at all.
    pub fn detected(&self) -> bool {
        !matches!(self, ExtractionMethod::NoContour | ExtractionMethod::ContourTooSmall)
    }
}

/// Result of [`extract`].
#[derive(Debug, Clone)]
pub struct ExtractedImage {
    pub image: RgbImage,
    pub method: ExtractionMethod,
    pub rotated: bool,
    pub contour_area: Option<f64>,
    pub vertices: Option<usize>,
}

impl ExtractedImage {
    fn passthrough(raw: &RgbImage, method: ExtractionMethod, contour_area: Option<f64>) -> Self {
        Self {
            image: raw.clone(),
            method,
            rotated: false,
            contour_area,
            vertices: None,
        }
    }
}

/// Isolate the receipt in `raw` using `mask`.
///
/// A mask whose dimensions differ from the photograph is resized to match
/// (nearest-neighbour).
pub fn extract(raw: &RgbImage, mask: &GrayImage, config: &GeometryConfig) -> ExtractedImage {
    let (width, height) = raw.dimensions();
    let resized;
    let mask = if mask.dimensions() == (width, height) {
        mask
    } else {
        resized = imageops::resize(mask, width, height, imageops::FilterType::Nearest);
        &resized
    };

    let binary = GrayImage::from_fn(width, height, |x, y| {
        if mask.get_pixel(x, y)[0] > config.mask_threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    });

    // ── Dominant external contour ────────────────────────────────────────
    // Regions touching the frame edge are only traced as outer borders when
    // the outside of the image reads as background.
    let mut padded = GrayImage::new(width + 2, height + 2);
    imageops::replace(&mut padded, &binary, 1, 1);
    let contours = find_contours::<i32>(&padded);
    let mut best: Option<(f64, Vec<Pt>)> = None;
    for contour in contours
        .iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
    {
        let points: Vec<Pt> = contour
            .points
            .iter()
            .map(|p| ((p.x - 1) as f64, (p.y - 1) as f64))
            .collect();
        let area = polygon_area(&points);
        if best.as_ref().map_or(true, |(a, _)| area > *a) {
            best = Some((area, points));
        }
    }

    let Some((area, points)) = best else {
        debug!("No foreground contour; passing photograph through");
        return ExtractedImage::passthrough(raw, ExtractionMethod::NoContour, None);
    };
    if area < config.min_contour_area {
        debug!(
            area,
            min = config.min_contour_area,
            "Dominant contour below noise threshold; passing photograph through"
        );
        return ExtractedImage::passthrough(raw, ExtractionMethod::ContourTooSmall, Some(area));
    }

    // ── Simplify and choose a strategy ───────────────────────────────────
    let epsilon = config.approx_epsilon_ratio * arc_length(&points);
    let polygon = approximate_polygon(&points, epsilon);
    let vertices = polygon.len();
    debug!(area, vertices, epsilon, "Contour simplified");

    let (image, method) = if vertices == 4 {
        let quad = order_points([polygon[0], polygon[1], polygon[2], polygon[3]]);
        match rectify(raw, &quad) {
            Some(img) => (img, ExtractionMethod::Quadrilateral),
            None => (crop_bounding_box(raw, &points, config.crop_padding), ExtractionMethod::BoundingBox),
        }
    } else {
        match config.shape_policy {
            ShapePolicy::RectifyPerspective => {
                let rect = min_area_rect(&points);
                match rectify(raw, &order_points(rect)) {
                    Some(img) => (img, ExtractionMethod::MinAreaRect),
                    None => (
                        crop_bounding_box(raw, &points, config.crop_padding),
                        ExtractionMethod::BoundingBox,
                    ),
                }
            }
            ShapePolicy::CropBoundingBox => (
                crop_bounding_box(raw, &points, config.crop_padding),
                ExtractionMethod::BoundingBox,
            ),
        }
    };

    // ── Portrait orientation ─────────────────────────────────────────────
    let (image, rotated) = make_portrait(image, config.rotation);

    info!(
        method = ?method,
        area,
        vertices,
        rotated,
        width = image.width(),
        height = image.height(),
        "Receipt extracted"
    );

    ExtractedImage {
        image,
        method,
        rotated,
        contour_area: Some(area),
        vertices: Some(vertices),
    }
}

/// Rotate a landscape image a quarter turn; portrait and square images are
/// returned as-is.
pub fn make_portrait(image: RgbImage, direction: RotationDirection) -> (RgbImage, bool) {
    if image.width() <= image.height() {
        return (image, false);
    }
    let turned = match direction {
        RotationDirection::Clockwise => imageops::rotate90(&image),
        RotationDirection::CounterClockwise => imageops::rotate270(&image),
    };
    (turned, true)
}

// ── Point ordering ───────────────────────────────────────────────────────

/// Order four corners as (top-left, top-right, bottom-right, bottom-left).
///
/// Top-left has the smallest `x + y`, bottom-right the largest; top-right has
/// the smallest `y − x`, bottom-left the largest. Ties are broken on the
/// coordinates, so the result depends only on the set of points. When the
/// sums assign one point to two corners (a square turned exactly 45°, or a
/// strongly skewed quadrilateral), the points are instead ordered clockwise
/// around their centroid starting from the top-left candidate.
pub fn order_points(points: [Pt; 4]) -> [Pt; 4] {
    let sum = |p: &Pt| p.0 + p.1;
    let diff = |p: &Pt| p.1 - p.0;
    let by = |key: &dyn Fn(&Pt) -> f64, a: &Pt, b: &Pt| -> Ordering {
        key(a)
            .total_cmp(&key(b))
            .then(a.0.total_cmp(&b.0))
            .then(a.1.total_cmp(&b.1))
    };

    let pick_min = |key: &dyn Fn(&Pt) -> f64| -> Pt {
        let mut best = points[0];
        for p in &points[1..] {
            if by(key, p, &best) == Ordering::Less {
                best = *p;
            }
        }
        best
    };
    let pick_max = |key: &dyn Fn(&Pt) -> f64| -> Pt {
        let mut best = points[0];
        for p in &points[1..] {
            if by(key, p, &best) == Ordering::Greater {
                best = *p;
            }
        }
        best
    };

    let ordered = [pick_min(&sum), pick_min(&diff), pick_max(&sum), pick_max(&diff)];
    let distinct = (0..4).all(|i| ((i + 1)..4).all(|j| ordered[i] != ordered[j]));
    if distinct {
        return ordered;
    }
    order_clockwise(points)
}

fn order_clockwise(points: [Pt; 4]) -> [Pt; 4] {
    let cx = points.iter().map(|p| p.0).sum::<f64>() / 4.0;
    let cy = points.iter().map(|p| p.1).sum::<f64>() / 4.0;

    // Start from the smallest x + y (smaller y on ties).
    let mut start = points[0];
    for p in &points[1..] {
        let ord = (p.0 + p.1)
            .total_cmp(&(start.0 + start.1))
            .then(p.1.total_cmp(&start.1))
            .then(p.0.total_cmp(&start.0));
        if ord == Ordering::Less {
            start = *p;
        }
    }
    let base = (start.1 - cy).atan2(start.0 - cx);
    let tau = std::f64::consts::TAU;
    // With y pointing down, increasing atan2 sweeps clockwise on screen.
    let rel = |p: &Pt| {
        let a = ((p.1 - cy).atan2(p.0 - cx) - base).rem_euclid(tau);
        if *p == start {
            0.0
        } else {
            a
        }
    };

    let mut sorted = points;
    sorted.sort_by(|a, b| {
        rel(a)
            .total_cmp(&rel(b))
            .then(a.0.total_cmp(&b.0))
            .then(a.1.total_cmp(&b.1))
    });
    sorted
}

// ── Warping and cropping ─────────────────────────────────────────────────

/// Warp the ordered quadrilateral `quad` to an upright rectangle.
///
/// Output width is the longer of the top and bottom edges, height the longer
/// of the left and right edges (both truncated to whole pixels). Returns
/// `None` for degenerate quadrilaterals (an output side under 2 px or a
/// singular transform).
pub fn rectify(raw: &RgbImage, quad: &[Pt; 4]) -> Option<RgbImage> {
    let [tl, tr, br, bl] = *quad;
    let width = distance(br, bl).trunc().max(distance(tr, tl).trunc());
    let height = distance(tr, br).trunc().max(distance(tl, bl).trunc());
    if !(width >= 2.0 && height >= 2.0) {
        debug!(width, height, "Degenerate quadrilateral");
        return None;
    }
    let (w, h) = (width as u32, height as u32);

    let from = quad.map(|(x, y)| (x as f32, y as f32));
    let to = [
        (0.0, 0.0),
        ((w - 1) as f32, 0.0),
        ((w - 1) as f32, (h - 1) as f32),
        (0.0, (h - 1) as f32),
    ];
    let projection = Projection::from_control_points(from, to)?;

    let mut out = RgbImage::new(w, h);
    warp_into(raw, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut out);
    Some(out)
}

/// Crop the axis-aligned bounding box of `points`, grown by `padding` on each
/// side and clamped to the image.
pub fn crop_bounding_box(raw: &RgbImage, points: &[Pt], padding: u32) -> RgbImage {
    let (w, h) = raw.dimensions();
    if points.is_empty() || w == 0 || h == 0 {
        return raw.clone();
    }
    let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
    let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
    for &(x, y) in points {
        min_x = min_x.min(x);
        min_y = min_y.min(y);
        max_x = max_x.max(x);
        max_y = max_y.max(y);
    }
    let pad = padding as f64;
    let x0 = (min_x - pad).max(0.0) as u32;
    let y0 = (min_y - pad).max(0.0) as u32;
    let x1 = ((max_x + pad).max(0.0) as u32).min(w - 1);
    let y1 = ((max_y + pad).max(0.0) as u32).min(h - 1);
    if x1 < x0 || y1 < y0 {
        return raw.clone();
    }
    imageops::crop_imm(raw, x0, y0, x1 - x0 + 1, y1 - y0 + 1).to_image()
}

// ── Polygon helpers ──────────────────────────────────────────────────────

fn distance(a: Pt, b: Pt) -> f64 {
    (a.0 - b.0).hypot(a.1 - b.1)
}

/// Enclosed area of a closed polygon (shoelace formula).
pub fn polygon_area(points: &[Pt]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice = 0.0;
    for i in 0..points.len() {
        let (x1, y1) = points[i];
        let (x2, y2) = points[(i + 1) % points.len()];
        twice += x1 * y2 - x2 * y1;
    }
    twice.abs() / 2.0
}

/// Perimeter of a closed polygon.
pub fn arc_length(points: &[Pt]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    (0..points.len())
        .map(|i| distance(points[i], points[(i + 1) % points.len()]))
        .sum()
}

/// Douglas–Peucker simplification of a closed contour.
///
/// The curve is split at two mutually distant points (the point farthest
/// from the first one, then the point farthest from that), and each half is
/// simplified as an open chain. Those two anchors and every vertex farther
/// than `epsilon` from its chord survive, so convex extremities are kept.
pub fn approximate_polygon(points: &[Pt], epsilon: f64) -> Vec<Pt> {
    let n = points.len();
    if n < 3 {
        return points.to_vec();
    }
    let farthest_from = |origin: Pt| -> usize {
        let mut best = 0;
        let mut best_d = -1.0;
        for (i, p) in points.iter().enumerate() {
            let d = distance(origin, *p);
            if d > best_d {
                best_d = d;
                best = i;
            }
        }
        best
    };
    let a = farthest_from(points[0]);
    let b = farthest_from(points[a]);
    if a == b {
        return vec![points[a]];
    }

    let chain = |from: usize, to: usize| -> Vec<Pt> {
        let mut out = Vec::new();
        let mut i = from;
        loop {
            out.push(points[i]);
            if i == to {
                break;
            }
            i = (i + 1) % n;
        }
        out
    };

    let first = simplify_open(&chain(a, b), epsilon);
    let second = simplify_open(&chain(b, a), epsilon);

    let mut polygon = first;
    // `second` starts at b (already the last vertex) and ends at a (the first).
    polygon.extend_from_slice(&second[1..second.len() - 1]);
    polygon.dedup();
    polygon
}

/// Douglas–Peucker on an open chain; both endpoints are always kept.
fn simplify_open(chain: &[Pt], epsilon: f64) -> Vec<Pt> {
    let n = chain.len();
    if n <= 2 {
        return chain.to_vec();
    }
    let mut keep = vec![false; n];
    keep[0] = true;
    keep[n - 1] = true;

    let mut stack = vec![(0usize, n - 1)];
    while let Some((start, end)) = stack.pop() {
        if end <= start + 1 {
            continue;
        }
        let mut max_d = -1.0;
        let mut index = start;
        for i in (start + 1)..end {
            let d = point_line_distance(chain[i], chain[start], chain[end]);
            if d > max_d {
                max_d = d;
                index = i;
            }
        }
        if max_d > epsilon {
            keep[index] = true;
            stack.push((start, index));
            stack.push((index, end));
        }
    }

    chain
        .iter()
        .zip(keep)
        .filter_map(|(p, k)| k.then_some(*p))
        .collect()
}

fn point_line_distance(p: Pt, a: Pt, b: Pt) -> f64 {
    let len = distance(a, b);
    if len == 0.0 {
        return distance(p, a);
    }
    ((b.0 - a.0) * (a.1 - p.1) - (a.0 - p.0) * (b.1 - a.1)).abs() / len
}

/// Convex hull (Andrew's monotone chain), counter-clockwise in y-up terms.
pub fn convex_hull(points: &[Pt]) -> Vec<Pt> {
    let mut pts = points.to_vec();
    pts.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));
    pts.dedup();
    if pts.len() < 3 {
        return pts;
    }
    let cross = |o: Pt, a: Pt, b: Pt| (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0);

    let mut lower: Vec<Pt> = Vec::new();
    for &p in &pts {
        while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0.0 {
            lower.pop();
        }
        lower.push(p);
    }
    let mut upper: Vec<Pt> = Vec::new();
    for &p in pts.iter().rev() {
        while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0.0 {
            upper.pop();
        }
        upper.push(p);
    }
    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

/// Corners of the minimum-area rotated rectangle enclosing `points`
/// (rotating calipers over the convex hull). Unordered.
pub fn min_area_rect(points: &[Pt]) -> [Pt; 4] {
    let hull = convex_hull(points);
    if hull.len() < 3 {
        return axis_aligned_corners(points);
    }

    let mut best: Option<(f64, [Pt; 4])> = None;
    for i in 0..hull.len() {
        let p = hull[i];
        let q = hull[(i + 1) % hull.len()];
        let len = distance(p, q);
        if len == 0.0 {
            continue;
        }
        let u = ((q.0 - p.0) / len, (q.1 - p.1) / len);
        let v = (-u.1, u.0);

        let (mut min_u, mut max_u) = (f64::INFINITY, f64::NEG_INFINITY);
        let (mut min_v, mut max_v) = (f64::INFINITY, f64::NEG_INFINITY);
        for h in &hull {
            let du = (h.0 - p.0) * u.0 + (h.1 - p.1) * u.1;
            let dv = (h.0 - p.0) * v.0 + (h.1 - p.1) * v.1;
            min_u = min_u.min(du);
            max_u = max_u.max(du);
            min_v = min_v.min(dv);
            max_v = max_v.max(dv);
        }
        let area = (max_u - min_u) * (max_v - min_v);
        if best.as_ref().map_or(true, |(a, _)| area < *a) {
            let corner = |su: f64, sv: f64| (p.0 + u.0 * su + v.0 * sv, p.1 + u.1 * su + v.1 * sv);
            best = Some((
                area,
                [
                    corner(min_u, min_v),
                    corner(max_u, min_v),
                    corner(max_u, max_v),
                    corner(min_u, max_v),
                ],
            ));
        }
    }
    best.map(|(_, rect)| rect)
        .unwrap_or_else(|| axis_aligned_corners(points))
}

fn axis_aligned_corners(points: &[Pt]) -> [Pt; 4] {
    let min_x = points.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
    let min_y = points.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
    let max_x = points.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
    let max_y = points.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);
    [(min_x, min_y), (max_x, min_y), (max_x, max_y), (min_x, max_y)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn photo(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8]))
    }

    fn mask_with_rect(w: u32, h: u32, x0: u32, y0: u32, x1: u32, y1: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            if x >= x0 && x <= x1 && y >= y0 && y <= y1 {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }

    fn permutations(p: [Pt; 4]) -> Vec<[Pt; 4]> {
        let mut out = Vec::new();
        for a in 0..4 {
            for b in 0..4 {
                for c in 0..4 {
                    for d in 0..4 {
                        let idx = [a, b, c, d];
                        let distinct = (0..4).all(|i| ((i + 1)..4).all(|j| idx[i] != idx[j]));
                        if distinct {
                            out.push([p[a], p[b], p[c], p[d]]);
                        }
                    }
                }
            }
        }
        out
    }

    #[test]
    fn empty_mask_passes_photo_through_unchanged() {
        let raw = photo(300, 120);
        let mask = GrayImage::new(300, 120);
        let out = extract(&raw, &mask, &GeometryConfig::default());
        assert_eq!(out.method, ExtractionMethod::NoContour);
        assert!(!out.rotated);
        assert_eq!(out.image, raw);
    }

    #[test]
    fn tiny_blob_passes_photo_through_unchanged() {
        let raw = photo(200, 200);
        let mask = mask_with_rect(200, 200, 50, 50, 60, 60);
        let out = extract(&raw, &mask, &GeometryConfig::default());
        assert_eq!(out.method, ExtractionMethod::ContourTooSmall);
        assert_eq!(out.image, raw);
        assert!(out.contour_area.unwrap() < 2000.0);
    }

    #[test]
    fn below_threshold_mask_values_are_background() {
        let raw = photo(200, 200);
        let mask = GrayImage::from_pixel(200, 200, Luma([100]));
        let config = GeometryConfig {
            mask_threshold: 128,
            ..GeometryConfig::default()
        };
        let out = extract(&raw, &mask, &config);
        assert_eq!(out.method, ExtractionMethod::NoContour);
    }

    #[test]
    fn upright_rectangle_is_an_identity_sized_crop() {
        let raw = photo(130, 230);
        let mask = mask_with_rect(130, 230, 10, 10, 110, 210);
        let out = extract(&raw, &mask, &GeometryConfig::default());
        assert_eq!(out.method, ExtractionMethod::Quadrilateral);
        assert_eq!(out.vertices, Some(4));
        assert_eq!(out.image.dimensions(), (100, 200));
        assert!(!out.rotated);
    }

    #[test]
    fn rectify_axis_aligned_quad_keeps_size() {
        let raw = photo(120, 220);
        let quad = order_points([(0.0, 0.0), (100.0, 0.0), (100.0, 200.0), (0.0, 200.0)]);
        let out = rectify(&raw, &quad).unwrap();
        assert_eq!(out.dimensions(), (100, 200));
    }

    #[test]
    fn landscape_region_is_rotated_exactly_once() {
        let raw = photo(260, 150);
        let mask = mask_with_rect(260, 150, 20, 20, 220, 120);
        let out = extract(&raw, &mask, &GeometryConfig::default());
        assert!(out.rotated);
        assert_eq!(out.image.dimensions(), (100, 200));
    }

    #[test]
    fn rotation_direction_is_configurable() {
        let mut img = RgbImage::new(4, 2);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        let (cw, _) = make_portrait(img.clone(), RotationDirection::Clockwise);
        let (ccw, _) = make_portrait(img, RotationDirection::CounterClockwise);
        assert_eq!(cw.dimensions(), (2, 4));
        // Clockwise moves the top-left pixel to the top-right corner.
        assert_eq!(cw.get_pixel(1, 0)[0], 255);
        assert_eq!(ccw.get_pixel(0, 3)[0], 255);
    }

    #[test]
    fn portrait_images_are_not_rotated() {
        let (out, rotated) = make_portrait(RgbImage::new(5, 5), RotationDirection::Clockwise);
        assert!(!rotated);
        assert_eq!(out.dimensions(), (5, 5));
    }

    #[test]
    fn largest_region_wins() {
        let raw = photo(400, 400);
        let mut mask = mask_with_rect(400, 400, 10, 10, 60, 60);
        for y in 100..=350 {
            for x in 150..=300 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        let out = extract(&raw, &mask, &GeometryConfig::default());
        assert_eq!(out.method, ExtractionMethod::Quadrilateral);
        assert_eq!(out.image.dimensions(), (150, 250));
    }

    #[test]
    fn irregular_region_uses_shape_policy() {
        // An L-shaped region never simplifies to four corners.
        let raw = photo(300, 300);
        let mut mask = mask_with_rect(300, 300, 20, 20, 120, 260);
        for y in 180..=260 {
            for x in 120..=250 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }

        let crop = extract(&raw, &mask, &GeometryConfig::default());
        assert_eq!(crop.method, ExtractionMethod::BoundingBox);
        assert_ne!(crop.vertices, Some(4));
        // Bounding box 20..=250 × 20..=260 plus 10 px padding.
        assert_eq!(crop.image.dimensions(), (251, 261));

        let config = GeometryConfig {
            shape_policy: ShapePolicy::RectifyPerspective,
            ..GeometryConfig::default()
        };
        let warped = extract(&raw, &mask, &config);
        assert_eq!(warped.method, ExtractionMethod::MinAreaRect);
        assert!(warped.image.height() >= warped.image.width());
    }

    #[test]
    fn region_touching_left_edge_is_detected() {
        let raw = photo(200, 300);
        for mask in [
            mask_with_rect(200, 300, 0, 0, 150, 250),
            mask_with_rect(200, 300, 0, 30, 150, 250),
        ] {
            let out = extract(&raw, &mask, &GeometryConfig::default());
            assert_eq!(out.method, ExtractionMethod::Quadrilateral);
            assert_eq!(out.vertices, Some(4));
            assert!(out.contour_area.unwrap() > 30_000.0);
        }
    }

    #[test]
    fn edge_contour_points_map_back_to_image_coordinates() {
        let raw = photo(200, 300);
        let mask = mask_with_rect(200, 300, 0, 0, 150, 250);
        let out = extract(&raw, &mask, &GeometryConfig::default());
        assert_eq!(out.image.dimensions(), (150, 250));
        assert_eq!(out.contour_area, Some(150.0 * 250.0));
    }

    #[test]
    fn full_frame_landscape_mask_is_rotated_to_portrait() {
        let raw = photo(300, 200);
        let mask = GrayImage::from_pixel(300, 200, Luma([255]));
        let out = extract(&raw, &mask, &GeometryConfig::default());
        assert_eq!(out.method, ExtractionMethod::Quadrilateral);
        assert!(out.rotated);
        assert!(out.image.height() >= out.image.width());
        assert_eq!(out.image.dimensions(), (199, 299));
    }

    #[test]
    fn bounding_box_is_clamped_to_image() {
        let raw = photo(50, 80);
        let out = crop_bounding_box(&raw, &[(2.0, 3.0), (45.0, 78.0)], 10);
        assert_eq!(out.dimensions(), (50, 80));
    }

    #[test]
    fn mismatched_mask_is_resized() {
        let raw = photo(260, 460);
        let mask = mask_with_rect(130, 230, 10, 10, 110, 210);
        let out = extract(&raw, &mask, &GeometryConfig::default());
        assert!(out.method.detected());
        assert!(out.image.width() < 260 && out.image.height() < 460);
    }

    #[test]
    fn order_points_is_permutation_invariant() {
        let quads = [
            [(10.0, 12.0), (210.0, 30.0), (190.0, 400.0), (5.0, 380.0)],
            [(50.0, 0.0), (100.0, 50.0), (50.0, 100.0), (0.0, 50.0)],
            [(0.0, 0.0), (100.0, 10.0), (50.0, 20.0), (10.0, 100.0)],
        ];
        for quad in quads {
            let expected = order_points(quad);
            for perm in permutations(quad) {
                assert_eq!(order_points(perm), expected, "quad {quad:?}");
            }
        }
    }

    #[test]
    fn order_points_assigns_corners() {
        let ordered = order_points([(190.0, 400.0), (10.0, 12.0), (5.0, 380.0), (210.0, 30.0)]);
        assert_eq!(
            ordered,
            [(10.0, 12.0), (210.0, 30.0), (190.0, 400.0), (5.0, 380.0)]
        );
    }

    #[test]
    fn order_points_resolves_double_assignment_clockwise() {
        // (100, 10) has both the smallest y − x and the largest x + y.
        let ordered = order_points([(10.0, 100.0), (50.0, 20.0), (0.0, 0.0), (100.0, 10.0)]);
        assert_eq!(
            ordered,
            [(0.0, 0.0), (50.0, 20.0), (100.0, 10.0), (10.0, 100.0)]
        );
    }

    #[test]
    fn approximate_polygon_reduces_rectangle_outline_to_corners() {
        let mut outline = Vec::new();
        for x in 0..=100 {
            outline.push((x as f64, 0.0));
        }
        for y in 1..=200 {
            outline.push((100.0, y as f64));
        }
        for x in (0..100).rev() {
            outline.push((x as f64, 200.0));
        }
        for y in (1..200).rev() {
            outline.push((0.0, y as f64));
        }
        let eps = 0.02 * arc_length(&outline);
        let poly = approximate_polygon(&outline, eps);
        assert_eq!(poly.len(), 4);
        for corner in [(0.0, 0.0), (100.0, 0.0), (100.0, 200.0), (0.0, 200.0)] {
            assert!(poly.contains(&corner), "missing {corner:?} in {poly:?}");
        }
    }

    #[test]
    fn approximate_polygon_is_monotonic_in_tolerance() {
        let circle: Vec<Pt> = (0..360)
            .map(|d| {
                let t = (d as f64).to_radians();
                (100.0 + 80.0 * t.cos(), 100.0 + 80.0 * t.sin())
            })
            .collect();
        let fine = approximate_polygon(&circle, 0.5).len();
        let coarse = approximate_polygon(&circle, 5.0).len();
        let coarser = approximate_polygon(&circle, 20.0).len();
        assert!(fine >= coarse && coarse >= coarser);
        assert_eq!(approximate_polygon(&circle, 5.0), approximate_polygon(&circle, 5.0));
    }

    #[test]
    fn min_area_rect_of_rotated_square() {
        let diamond = [(50.0, 0.0), (100.0, 50.0), (50.0, 100.0), (0.0, 50.0)];
        let rect = min_area_rect(&diamond);
        let area = polygon_area(&order_points(rect));
        assert!((area - 5000.0).abs() < 1e-6, "area {area}");
    }

    #[test]
    fn polygon_area_and_perimeter() {
        let square = [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        assert_eq!(polygon_area(&square), 100.0);
        assert_eq!(arc_length(&square), 40.0);
        assert_eq!(polygon_area(&square[..2]), 0.0);
    }
}
