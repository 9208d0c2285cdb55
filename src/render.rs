//! A self-contained raster renderer: maps are drawn into an RGBA buffer and
//! written out as PNG.
//!
//! Layers are drawn in order, each style in the order the layer names it, and
//! within a style every symbolizer of every rule is applied to one feature before
//! moving on to the next. Only the projections [`Transform`] knows how to convert
//! between can be mixed in one map.
use crate::config::ConnectionParams;
use crate::datasource::{Datasource, PostGisDatasource};
use crate::geometry::Envelope;
use crate::map::{AspectFixMode, Layer, Map, Viewport};
use crate::postgis;
use crate::projection::Transform;
use crate::style::{Color, PointSymbolizer, Symbolizer};
use crate::{Error, Renderer};

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;

use geo_types::{Coord, Geometry, LineString, Polygon};
use image::{ImageFormat, Rgba, RgbaImage};
use sqlx::PgPool;
use tracing::{debug, info, warn};

/// Upper bound on either side of a canvas.
pub const MAX_CANVAS_SIZE: u32 = 16_384;

/// Renders maps to PNG, keeping one pool per database for datasources that
/// ask for a persistent connection.
#[derive(Debug, Default)]
pub struct RasterRenderer {
    pools: Mutex<HashMap<ConnectionParams, PgPool>>,
}

impl RasterRenderer {
    pub fn new() -> RasterRenderer {
        RasterRenderer::default()
    }

    fn lock_pools(&self) -> MutexGuard<'_, HashMap<ConnectionParams, PgPool>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cached_pool(&self, params: &ConnectionParams) -> Option<PgPool> {
        self.lock_pools().get(params).cloned()
    }

    async fn pool_for(&self, ds: &PostGisDatasource) -> Result<PgPool, Error> {
        if ds.persist_connection {
            if let Some(pool) = self.cached_pool(&ds.connection) {
                return Ok(pool);
            }
        }

        debug!(dbname = %ds.connection.dbname, "Connecting to PostGIS");
        let pool = postgis::connect(&ds.connection).await?;
        if ds.persist_connection {
            self.lock_pools().insert(ds.connection.clone(), pool.clone());
        }
        Ok(pool)
    }

    async fn release(&self, ds: &PostGisDatasource, pool: PgPool) {
        if !ds.persist_connection {
            pool.close().await;
        }
    }

    async fn layer_extent(&self, layer: &Layer) -> Result<Option<Envelope>, Error> {
        match &layer.datasource {
            Datasource::Memory(ds) => Ok(ds.envelope()),
            Datasource::PostGis(ds) => {
                let pool = self.pool_for(ds).await?;
                let extent = postgis::fetch_extent(&pool, ds).await;
                self.release(ds, pool).await;
                extent
            }
        }
    }

    async fn layer_geometries<'a>(
        &self,
        layer: &'a Layer,
        bbox: &Envelope,
    ) -> Result<Vec<Cow<'a, Geometry<f64>>>, Error> {
        match &layer.datasource {
            Datasource::Memory(ds) => Ok(ds
                .features()
                .iter()
                .map(|f| Cow::Borrowed(f.geometry()))
                .collect()),
            Datasource::PostGis(ds) => {
                let pool = self.pool_for(ds).await?;
                let geometries = postgis::fetch_geometries(&pool, ds, Some(bbox)).await;
                self.release(ds, pool).await;
                Ok(geometries?.into_iter().map(Cow::Owned).collect())
            }
        }
    }

    /// Combined extent of every layer, in map coordinates.
    async fn combined_extent(
        &self,
        layers: &[(&Layer, Transform)],
    ) -> Result<Option<Envelope>, Error> {
        let mut combined: Option<Envelope> = None;
        for (layer, transform) in layers {
            if let Some(extent) = self.layer_extent(layer).await? {
                let extent = transform.apply_envelope(&extent);
                combined = Some(match combined {
                    Some(c) => c.merge(&extent),
                    None => extent,
                });
            }
        }
        Ok(combined)
    }
}

#[async_trait]
impl Renderer for RasterRenderer {
    async fn render_to_file(&self, map: &Map, path: &Path) -> Result<(), Error> {
        let start = Instant::now();
        map.validate()?;

        let mut layers = Vec::with_capacity(map.layers().len());
        for layer in map.layers() {
            layers.push((layer, Transform::between(&layer.srs, &map.srs)?));
        }

        let extent = match map.viewport() {
            Viewport::Extent(extent) => Some(extent),
            Viewport::All => self.combined_extent(&layers).await?,
            Viewport::Unset => None,
        };
        let frame = match extent {
            Some(extent) => Some(Frame::fit(
                map.width,
                map.height,
                extent,
                map.aspect_fix_mode,
            )),
            None => {
                warn!("Map has no extent; rendering the background only");
                None
            }
        };

        let (width, height) = frame.map_or((map.width, map.height), |f| (f.width, f.height));
        let mut canvas = Canvas::new(width, height, map.background);

        if let Some(frame) = frame {
            let query_box = frame.buffered(map.buffer_size);
            for (layer, transform) in &layers {
                let layer_box = transform.inverse().apply_envelope(&query_box);
                let geometries = self.layer_geometries(layer, &layer_box).await?;
                let projector = Projector {
                    frame,
                    transform: *transform,
                };

                for name in &layer.styles {
                    let style = map
                        .style(name)
                        .ok_or_else(|| Error::UndefinedStyle(name.clone()))?;
                    for geometry in &geometries {
                        for rule in &style.rules {
                            for symbolizer in &rule.symbolizers {
                                canvas.draw(geometry, symbolizer, &projector);
                            }
                        }
                    }
                }
                debug!(layer = %layer.name, features = geometries.len(), "Drew layer");
            }
        }

        canvas.save(path)?;
        info!(
            path = %path.display(),
            width,
            height,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Rendered map"
        );
        Ok(())
    }
}

/// The extent being drawn and the pixel size it is drawn at.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Frame {
    width: u32,
    height: u32,
    extent: Envelope,
}

impl Frame {
    fn fit(width: u32, height: u32, extent: Envelope, mode: AspectFixMode) -> Frame {
        let width = canvas_side(width);
        let height = canvas_side(height);
        let extent = pad_degenerate(extent);
        let canvas_ratio = width as f64 / height as f64;
        let extent_ratio = extent.width() / extent.height();

        match mode {
            AspectFixMode::GrowBbox => {
                let extent = if extent_ratio > canvas_ratio {
                    let grow = extent.width() / canvas_ratio - extent.height();
                    extent.buffered(0.0, grow / 2.0)
                } else {
                    let grow = extent.height() * canvas_ratio - extent.width();
                    extent.buffered(grow / 2.0, 0.0)
                };
                Frame {
                    width,
                    height,
                    extent,
                }
            }
            AspectFixMode::GrowCanvas => {
                let (width, height) = if extent_ratio > canvas_ratio {
                    (grown(height as f64 * extent_ratio), height)
                } else {
                    (width, grown(width as f64 / extent_ratio))
                };
                Frame {
                    width,
                    height,
                    extent,
                }
            }
        }
    }

    fn to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let e = &self.extent;
        (
            (x - e.min_x) * self.width as f64 / e.width(),
            (e.max_y - y) * self.height as f64 / e.height(),
        )
    }

    /// The extent widened by `pixels` on every side.
    fn buffered(&self, pixels: u32) -> Envelope {
        let dx = pixels as f64 * self.extent.width() / self.width as f64;
        let dy = pixels as f64 * self.extent.height() / self.height as f64;
        self.extent.buffered(dx, dy)
    }
}

/// Keeps a requested canvas side within what can be allocated.
fn canvas_side(size: u32) -> u32 {
    size.clamp(1, MAX_CANVAS_SIZE)
}

fn grown(size: f64) -> u32 {
    size.round().clamp(1.0, MAX_CANVAS_SIZE as f64) as u32
}

/// Gives zero-width or zero-height extents (a single point, a straight line) some area.
fn pad_degenerate(extent: Envelope) -> Envelope {
    let (w, h) = (extent.width(), extent.height());
    match (w > 0.0, h > 0.0) {
        (true, true) => extent,
        (true, false) => extent.buffered(0.0, w / 2.0),
        (false, true) => extent.buffered(h / 2.0, 0.0),
        (false, false) => extent.buffered(1.0, 1.0),
    }
}

#[derive(Clone, Copy, Debug)]
struct Projector {
    frame: Frame,
    transform: Transform,
}

impl Projector {
    fn project(&self, c: Coord<f64>) -> (f64, f64) {
        let (x, y) = self.transform.apply(c.x, c.y);
        self.frame.to_pixel(x, y)
    }

    fn project_all(&self, coords: &[Coord<f64>]) -> Vec<(f64, f64)> {
        coords.iter().map(|c| self.project(*c)).collect()
    }
}

struct Canvas {
    image: RgbaImage,
    /// Pixel boxes of markers placed so far, for collision checks.
    placed: Vec<[f64; 4]>,
}

impl Canvas {
    fn new(width: u32, height: u32, background: Color) -> Canvas {
        Canvas {
            image: RgbaImage::from_pixel(
                canvas_side(width),
                canvas_side(height),
                Rgba([background.r, background.g, background.b, background.a]),
            ),
            placed: Vec::new(),
        }
    }

    fn save(&self, path: &Path) -> Result<(), Error> {
        self.image.save_with_format(path, ImageFormat::Png)?;
        Ok(())
    }

    fn draw(&mut self, geometry: &Geometry<f64>, symbolizer: &Symbolizer, projector: &Projector) {
        match geometry {
            Geometry::Point(p) => self.draw_point(p.0, symbolizer, projector),
            Geometry::MultiPoint(mp) => {
                for p in &mp.0 {
                    self.draw_point(p.0, symbolizer, projector);
                }
            }
            Geometry::Line(l) => self.draw_path(&[l.start, l.end], symbolizer, projector),
            Geometry::LineString(ls) => self.draw_path(&ls.0, symbolizer, projector),
            Geometry::MultiLineString(mls) => {
                for ls in &mls.0 {
                    self.draw_path(&ls.0, symbolizer, projector);
                }
            }
            Geometry::Polygon(p) => self.draw_polygon(p, symbolizer, projector),
            Geometry::MultiPolygon(mp) => {
                for p in &mp.0 {
                    self.draw_polygon(p, symbolizer, projector);
                }
            }
            Geometry::GeometryCollection(gc) => {
                for g in &gc.0 {
                    self.draw(g, symbolizer, projector);
                }
            }
            Geometry::Rect(r) => self.draw_polygon(&r.to_polygon(), symbolizer, projector),
            Geometry::Triangle(t) => self.draw_polygon(&t.to_polygon(), symbolizer, projector),
        }
    }

    fn draw_point(&mut self, c: Coord<f64>, symbolizer: &Symbolizer, projector: &Projector) {
        if let Symbolizer::Point(sym) = symbolizer {
            let (x, y) = projector.project(c);
            self.marker(x, y, sym);
        }
    }

    fn draw_path(&mut self, coords: &[Coord<f64>], symbolizer: &Symbolizer, projector: &Projector) {
        let points = projector.project_all(coords);
        match symbolizer {
            Symbolizer::Line(sym) => self.stroke(&points, sym.stroke, sym.width),
            Symbolizer::Point(sym) => {
                if let Some((x, y)) = middle(&points) {
                    self.marker(x, y, sym);
                }
            }
            Symbolizer::Polygon(_) => {}
        }
    }

    fn draw_polygon(&mut self, polygon: &Polygon<f64>, symbolizer: &Symbolizer, projector: &Projector) {
        let rings: Vec<Vec<(f64, f64)>> = std::iter::once(polygon.exterior())
            .chain(polygon.interiors())
            .map(|ring: &LineString<f64>| projector.project_all(&ring.0))
            .collect();

        match symbolizer {
            Symbolizer::Polygon(sym) => self.fill(&rings, sym.fill),
            Symbolizer::Line(sym) => {
                for ring in &rings {
                    self.stroke(ring, sym.stroke, sym.width);
                }
            }
            Symbolizer::Point(sym) => {
                if let Some((x, y)) = middle(&rings[0]) {
                    self.marker(x, y, sym);
                }
            }
        }
    }

    /// Source-over blend of one pixel; out-of-bounds pixels are ignored.
    fn blend(&mut self, x: i64, y: i64, color: Color) {
        if x < 0 || y < 0 || x >= self.image.width() as i64 || y >= self.image.height() as i64 {
            return;
        }
        let dst = self.image.get_pixel_mut(x as u32, y as u32);
        let sa = color.a as f64 / 255.0;
        let da = dst[3] as f64 / 255.0;
        let out_a = sa + da * (1.0 - sa);
        if out_a <= 0.0 {
            *dst = Rgba([0, 0, 0, 0]);
            return;
        }

        let mix = |s: u8, d: u8| {
            ((s as f64 * sa + d as f64 * da * (1.0 - sa)) / out_a)
                .round()
                .clamp(0.0, 255.0) as u8
        };
        *dst = Rgba([
            mix(color.r, dst[0]),
            mix(color.g, dst[1]),
            mix(color.b, dst[2]),
            (out_a * 255.0).round() as u8,
        ]);
    }

    /// Even-odd scanline fill, sampling pixel centers.
    fn fill(&mut self, rings: &[Vec<(f64, f64)>], color: Color) {
        let (width, height) = self.image.dimensions();
        let ys = rings.iter().flatten().map(|p| p.1);
        let top = ys.clone().fold(f64::INFINITY, f64::min).floor().max(0.0) as u32;
        let bottom = ys.fold(f64::NEG_INFINITY, f64::max).ceil().min(height as f64) as u32;

        let mut crossings = Vec::new();
        for py in top..bottom {
            let yc = py as f64 + 0.5;
            crossings.clear();
            for ring in rings {
                for (&(x0, y0), &(x1, y1)) in ring.iter().zip(ring.iter().cycle().skip(1)) {
                    if (y0 <= yc) != (y1 <= yc) {
                        crossings.push(x0 + (yc - y0) / (y1 - y0) * (x1 - x0));
                    }
                }
            }
            crossings.sort_by(f64::total_cmp);

            for span in crossings.chunks_exact(2) {
                let start = (span[0] - 0.5).ceil().max(0.0) as i64;
                let end = (span[1] - 0.5).ceil().min(width as f64) as i64;
                for px in start..end {
                    self.blend(px, py as i64, color);
                }
            }
        }
    }

    /// Strokes a polyline by stamping discs along it. Every covered pixel is
    /// blended once, so translucent strokes don't darken where stamps overlap.
    fn stroke(&mut self, points: &[(f64, f64)], color: Color, width: f64) {
        let radius = (width / 2.0).max(0.5);
        let reach = radius.ceil() as i64 + 1;
        let bounds = (
            -radius,
            -radius,
            self.image.width() as f64 + radius,
            self.image.height() as f64 + radius,
        );

        let mut covered = HashSet::new();
        for segment in points.windows(2) {
            let Some(((x0, y0), (x1, y1))) = clip_segment(segment[0], segment[1], bounds) else {
                continue;
            };
            let length = (x1 - x0).hypot(y1 - y0);
            let steps = (length * 2.0).ceil().max(1.0) as usize;
            for i in 0..=steps {
                let t = i as f64 / steps as f64;
                let (cx, cy) = (x0 + t * (x1 - x0), y0 + t * (y1 - y0));
                let (px, py) = (cx.floor() as i64, cy.floor() as i64);
                covered.insert((px, py));
                for dy in -reach..=reach {
                    for dx in -reach..=reach {
                        let (qx, qy) = (px + dx, py + dy);
                        let (mx, my) = (qx as f64 + 0.5 - cx, qy as f64 + 0.5 - cy);
                        if mx * mx + my * my <= radius * radius {
                            covered.insert((qx, qy));
                        }
                    }
                }
            }
        }

        for (x, y) in covered {
            self.blend(x, y, color);
        }
    }

    /// Draws a square marker unless it collides with one already placed and
    /// overlap isn't allowed.
    fn marker(&mut self, x: f64, y: f64, sym: &PointSymbolizer) {
        let half = sym.size / 2.0;
        let bbox = [x - half, y - half, x + half, y + half];
        if !sym.allow_overlap && self.placed.iter().any(|p| intersects(p, &bbox)) {
            return;
        }
        self.placed.push(bbox);

        let (width, height) = self.image.dimensions();
        let x_start = (bbox[0] - 0.5).ceil().max(0.0) as i64;
        let x_end = (bbox[2] - 0.5).ceil().min(width as f64) as i64;
        let y_start = (bbox[1] - 0.5).ceil().max(0.0) as i64;
        let y_end = (bbox[3] - 0.5).ceil().min(height as f64) as i64;
        for py in y_start..y_end {
            for px in x_start..x_end {
                self.blend(px, py, sym.fill);
            }
        }
    }
}

fn intersects(a: &[f64; 4], b: &[f64; 4]) -> bool {
    a[0] < b[2] && b[0] < a[2] && a[1] < b[3] && b[1] < a[3]
}

/// Center of the points' bounding box.
fn middle(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    let (&(x0, y0), rest) = points.split_first()?;
    let (min_x, min_y, max_x, max_y) = rest.iter().fold((x0, y0, x0, y0), |b, &(x, y)| {
        (b.0.min(x), b.1.min(y), b.2.max(x), b.3.max(y))
    });
    Some(((min_x + max_x) / 2.0, (min_y + max_y) / 2.0))
}

/// Liang-Barsky clipping of a segment to `(min_x, min_y, max_x, max_y)`.
fn clip_segment(
    a: (f64, f64),
    b: (f64, f64),
    bounds: (f64, f64, f64, f64),
) -> Option<((f64, f64), (f64, f64))> {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let checks = [
        (-dx, a.0 - bounds.0),
        (dx, bounds.2 - a.0),
        (-dy, a.1 - bounds.1),
        (dy, bounds.3 - a.1),
    ];

    let (mut t0, mut t1) = (0.0_f64, 1.0_f64);
    for (p, q) in checks {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
        } else {
            let t = q / p;
            if p < 0.0 {
                t0 = t0.max(t);
            } else {
                t1 = t1.min(t);
            }
        }
    }

    if t0 > t1 {
        return None;
    }
    Some((
        (a.0 + t0 * dx, a.1 + t0 * dy),
        (a.0 + t1 * dx, a.1 + t1 * dy),
    ))
}
