//! Maps: canvas, projection, styles and layers, assembled before a render.
use crate::datasource::Datasource;
use crate::geometry::Envelope;
use crate::projection::lonlat_to_mercator;
use crate::style::{Color, NamedStyle, Style};
use crate::Error;

use indexmap::IndexMap;

pub const DEFAULT_SRS: &str = "+init=epsg:4326";

#[derive(Clone, Debug)]
pub struct Layer {
    pub name: String,
    pub srs: String,
    pub datasource: Datasource,
    /// Names of map styles to apply, in order.
    pub styles: Vec<String>,
}

/// How the map reconciles an extent whose aspect ratio differs from the canvas.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AspectFixMode {
    /// Widen the extent to the canvas ratio.
    #[default]
    GrowBbox,
    /// Widen the canvas to the extent ratio.
    GrowCanvas,
}

/// What the map will be framed on when rendered.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Viewport {
    #[default]
    Unset,
    Extent(Envelope),
    /// The combined extent of every layer, computed at render time.
    All,
}

#[derive(Clone, Debug)]
pub struct Map {
    pub width: u32,
    pub height: u32,
    pub srs: String,
    pub background: Color,
    /// Extra margin, in pixels, fetched beyond the canvas edge.
    pub buffer_size: u32,
    pub aspect_fix_mode: AspectFixMode,
    styles: IndexMap<String, Style>,
    layers: Vec<Layer>,
    viewport: Viewport,
}

impl Map {
    pub fn new<S: Into<String>>(width: u32, height: u32, srs: S) -> Map {
        Map {
            width,
            height,
            srs: srs.into(),
            background: Color::TRANSPARENT,
            buffer_size: 0,
            aspect_fix_mode: AspectFixMode::default(),
            styles: IndexMap::new(),
            layers: Vec::new(),
            viewport: Viewport::default(),
        }
    }

    /// Builds a map from finished layers and the styles they refer to.
    pub fn assemble(
        layers: Vec<Layer>,
        styles: Vec<NamedStyle>,
        width: u32,
        height: u32,
        srs: &str,
        background: Option<Color>,
        buffer_size: Option<u32>,
    ) -> Map {
        let mut map = Map::new(width, height, srs);
        if let Some(background) = background {
            map.background = background;
        }
        if let Some(buffer_size) = buffer_size {
            map.buffer_size = buffer_size;
        }
        for s in styles {
            map.append_style(s.name, s.style);
        }
        for layer in layers {
            map.add_layer(layer);
        }
        map
    }

    /// Registers a style, replacing any earlier one with the same name.
    pub fn append_style<S: Into<String>>(&mut self, name: S, style: Style) {
        self.styles.insert(name.into(), style);
    }

    pub fn add_layer(&mut self, layer: Layer) {
        self.layers.push(layer);
    }

    pub fn style(&self, name: &str) -> Option<&Style> {
        self.styles.get(name)
    }

    pub fn styles(&self) -> impl Iterator<Item = (&str, &Style)> {
        self.styles.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    /// Frames the map on every layer, overriding any explicit extent.
    pub fn zoom_all(&mut self) {
        self.viewport = Viewport::All;
    }

    pub fn zoom_to_box(&mut self, envelope: Envelope) {
        self.viewport = Viewport::Extent(envelope);
    }

    /// Frames the map on a slippy map tile. Assumes the map is in web mercator.
    pub fn zoom_to_tile(&mut self, zoom: u8, x: u32, y: u32) {
        self.viewport = Viewport::Extent(tile_envelope(zoom, x, y));
    }

    /// Checks that every style a layer names is registered.
    pub fn validate(&self) -> Result<(), Error> {
        for layer in &self.layers {
            for name in &layer.styles {
                if !self.styles.contains_key(name) {
                    return Err(Error::UndefinedStyle(name.clone()));
                }
            }
        }
        Ok(())
    }
}

/// EPSG:3857 bounds of a tile in XYZ addressing.
pub fn tile_envelope(zoom: u8, x: u32, y: u32) -> Envelope {
    let (west, north) = slippy_map_tilenames::tile2lonlat(x, y, zoom);
    let (east, south) = slippy_map_tilenames::tile2lonlat(x + 1, y + 1, zoom);
    let (min_x, max_y) = lonlat_to_mercator(west, north);
    let (max_x, min_y) = lonlat_to_mercator(east, south);
    Envelope::new(min_x, min_y, max_x, max_y)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::datasource::MemoryDatasource;
    use crate::style::default_style;

    use assert_approx_eq::assert_approx_eq;

    fn layer(name: &str, styles: &[&str]) -> Layer {
        Layer {
            name: name.to_string(),
            srs: String::from(DEFAULT_SRS),
            datasource: Datasource::Memory(MemoryDatasource::default()),
            styles: styles.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_assemble_defaults() {
        let map = Map::assemble(
            vec![layer("cities", &["points"])],
            vec![NamedStyle::new("points", default_style("point"))],
            600,
            400,
            DEFAULT_SRS,
            None,
            None,
        );

        assert_eq!((600, 400), (map.width, map.height));
        assert_eq!(Color::TRANSPARENT, map.background);
        assert_eq!(0, map.buffer_size);
        assert_eq!(1, map.layers().len());
        assert!(map.style("points").is_some());
        assert_eq!(Viewport::Unset, map.viewport());
        assert!(map.validate().is_ok());
    }

    #[test]
    fn test_assemble_overrides_and_order() {
        let map = Map::assemble(
            vec![layer("land", &["fill"]), layer("roads", &["stroke"])],
            vec![
                NamedStyle::new("stroke", default_style("line")),
                NamedStyle::new("fill", default_style("polygon")),
            ],
            256,
            256,
            "+init=epsg:3857",
            Some(Color::WHITE),
            Some(64),
        );

        assert_eq!(Color::WHITE, map.background);
        assert_eq!(64, map.buffer_size);
        let names: Vec<&str> = map.layers().iter().map(|l| l.name.as_str()).collect();
        assert_eq!(vec!["land", "roads"], names);
        let styles: Vec<&str> = map.styles().map(|(name, _)| name).collect();
        assert_eq!(vec!["stroke", "fill"], styles);
    }

    #[test]
    fn test_undefined_style_is_caught() {
        let mut map = Map::new(100, 100, DEFAULT_SRS);
        map.add_layer(layer("cities", &["missing"]));

        assert!(matches!(map.validate(), Err(Error::UndefinedStyle(name)) if name == "missing"));
    }

    #[test]
    fn test_zoom_all_overrides_explicit_box() {
        let mut map = Map::new(100, 100, DEFAULT_SRS);
        map.zoom_to_box(Envelope::new(0.0, 0.0, 1.0, 1.0));
        map.zoom_all();

        assert_eq!(Viewport::All, map.viewport());
    }

    #[test]
    fn test_tile_envelope() {
        let world = tile_envelope(0, 0, 0);
        assert_approx_eq!(-20_037_508.342_789_244, world.min_x, 1e-3);
        assert_approx_eq!(20_037_508.342_789_244, world.max_y, 1e-3);

        let quadrant = tile_envelope(1, 1, 0);
        assert_approx_eq!(0.0, quadrant.min_x, 1e-3);
        assert_approx_eq!(0.0, quadrant.min_y, 1e-3);
        assert_approx_eq!(world.max_x, quadrant.max_x, 1e-3);
    }
}
