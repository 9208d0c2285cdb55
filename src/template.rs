//! A template filter turning a query set into an `<img>` tag.
//!
//! The hosting application calls [`MapGraphics::init`] once at startup; every
//! render then writes a fresh PNG under `<media_root>/mapgraphics` and returns a
//! tag pointing at it under the media URL.
use crate::adapter::{LayerAdapter, Strategy};
use crate::config::Settings;
use crate::display::DEFAULT_STYLE_NAME;
use crate::map::{AspectFixMode, Layer, Map};
use crate::query::{GeometryFieldSelector, QuerySet};
use crate::render::MAX_CANVAS_SIZE;
use crate::style::{Color, Style};
use crate::{Error, Renderer};

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

/// Directory under the media root that rendered graphics are written to.
pub const GRAPHICS_DIR: &str = "mapgraphics";

pub const DEFAULT_SIZE: u32 = 600;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderOptions {
    pub width: u32,
    pub height: u32,
}

impl Default for RenderOptions {
    fn default() -> Self {
        RenderOptions {
            width: DEFAULT_SIZE,
            height: DEFAULT_SIZE,
        }
    }
}

impl RenderOptions {
    /// Parses `key:value;key:value`. Items without a `:` and unknown keys are ignored.
    /// Sizes must be between 1 and [`MAX_CANVAS_SIZE`].
    pub fn parse(options: &str) -> Result<RenderOptions, Error> {
        let mut parsed = RenderOptions::default();
        for item in options.split(';') {
            let Some((key, value)) = item.split_once(':') else {
                continue;
            };
            let target = match key.trim() {
                "width" => &mut parsed.width,
                "height" => &mut parsed.height,
                _ => continue,
            };
            *target = value
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|size| (1..=MAX_CANVAS_SIZE).contains(size))
                .ok_or_else(|| Error::InvalidOption(item.to_string()))?;
        }
        Ok(parsed)
    }
}

/// A rendered graphic: the map that was drawn, where it was written and the tag
/// referencing it.
#[derive(Debug)]
pub struct MapGraphic {
    pub map: Map,
    pub path: PathBuf,
    pub tag: String,
}

#[derive(Clone, Debug)]
pub struct MapGraphics {
    settings: Settings,
    dir: PathBuf,
}

impl MapGraphics {
    /// Creates the graphics directory if needed.
    pub fn init(settings: &Settings) -> Result<MapGraphics, Error> {
        let dir = settings.media_root.join(GRAPHICS_DIR);
        fs::create_dir_all(&dir)?;
        Ok(MapGraphics {
            settings: settings.clone(),
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Renders `qs` from its PostGIS database and returns the `<img>` tag.
    pub async fn render<R: Renderer + ?Sized>(
        &self,
        qs: &dyn QuerySet,
        options: &str,
        renderer: &R,
    ) -> Result<String, Error> {
        let strategy = Strategy::PostGis(self.settings.connection_params(qs.using())?);
        self.render_with(qs, options, &strategy, renderer).await
    }

    pub async fn render_with<R: Renderer + ?Sized>(
        &self,
        qs: &dyn QuerySet,
        options: &str,
        strategy: &Strategy,
        renderer: &R,
    ) -> Result<String, Error> {
        let options = RenderOptions::parse(options)?;
        Ok(self.render_graphic(qs, &options, strategy, renderer).await?.tag)
    }

    pub async fn render_graphic<R: Renderer + ?Sized>(
        &self,
        qs: &dyn QuerySet,
        options: &RenderOptions,
        strategy: &Strategy,
        renderer: &R,
    ) -> Result<MapGraphic, Error> {
        let adapter = LayerAdapter::new(qs, &GeometryFieldSelector::Infer)?;
        let layer = adapter.to_layer(strategy).await?;
        let map = build_map(layer, adapter.default_style(), options);

        let path = self.graphic_path(&qs.meta().name, options)?;
        if let Err(e) = renderer.render_to_file(&map, &path).await {
            if let Err(remove) = fs::remove_file(&path) {
                warn!("Unable to remove {}: {}", path.display(), remove);
            }
            return Err(e);
        }

        let tag = img_tag(&self.url_for(&path));
        info!(model = %qs.meta().name, path = %path.display(), "Rendered map graphic");
        Ok(MapGraphic { map, path, tag })
    }

    /// Reserves `<model>_<width>_<height>_<random>.png` in the graphics directory.
    fn graphic_path(&self, model: &str, options: &RenderOptions) -> Result<PathBuf, Error> {
        let prefix = format!("{}_{}_{}_", model, options.width, options.height);
        let file = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".png")
            .tempfile_in(&self.dir)?;
        let (_, path) = file.keep().map_err(|e| e.error)?;
        Ok(path)
    }

    fn url_for(&self, path: &Path) -> String {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let base = self.settings.media_url.trim_end_matches('/');
        if base.is_empty() && !self.settings.media_url.starts_with('/') {
            format!("{}/{}", GRAPHICS_DIR, name)
        } else {
            format!("{}/{}/{}", base, GRAPHICS_DIR, name)
        }
    }
}

/// A map framed on the whole layer, growing the canvas to the layer's shape.
pub fn build_map(mut layer: Layer, style: Style, options: &RenderOptions) -> Map {
    let mut map = Map::new(options.width, options.height, layer.srs.clone());
    map.aspect_fix_mode = AspectFixMode::GrowCanvas;
    map.background = Color::TRANSPARENT;
    layer.styles.push(DEFAULT_STYLE_NAME.to_string());
    map.append_style(DEFAULT_STYLE_NAME, style);
    map.add_layer(layer);
    map.zoom_all();
    map
}

fn img_tag(url: &str) -> String {
    let mut escaped = String::with_capacity(url.len());
    for c in url.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    format!("<img src=\"{}\" />", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::geometry::{encode_wkb, GeometryKind};
    use crate::map::Viewport;
    use crate::query::{Field, FieldType, MemoryQuerySet, ModelMeta, Row, Value};
    use crate::render::RasterRenderer;

    use std::collections::HashMap;

    use geo_types::{point, Geometry};

    fn settings(media_root: &Path) -> Settings {
        Settings {
            media_root: media_root.to_path_buf(),
            media_url: String::from("/media/"),
            databases: HashMap::new(),
        }
    }

    fn cities() -> MemoryQuerySet {
        let meta = ModelMeta {
            name: String::from("city"),
            table: String::from("geo_city"),
            fields: vec![
                Field::new("name", FieldType::Text),
                Field::geometry("point", GeometryKind::Point, 4326),
            ],
        };
        let rows = [("Paris", 2.35, 48.85), ("Oslo", 10.75, 59.91), ("Rome", 12.5, 41.9)]
            .iter()
            .map(|&(name, x, y)| {
                let wkb = encode_wkb(&Geometry::Point(point!(x: x, y: y))).unwrap();
                Row(vec![Value::from(name), Value::Bytes(wkb)])
            })
            .collect();
        MemoryQuerySet::new(meta, rows)
    }

    #[test]
    fn test_parse_options() {
        assert_eq!(RenderOptions::default(), RenderOptions::parse("").unwrap());
        assert_eq!(
            RenderOptions {
                width: 300,
                height: 200
            },
            RenderOptions::parse("width:300;height:200").unwrap()
        );
        assert_eq!(
            RenderOptions {
                width: 250,
                height: DEFAULT_SIZE
            },
            RenderOptions::parse("width:250").unwrap()
        );
        assert_eq!(
            RenderOptions::default(),
            RenderOptions::parse("color:red;bogus").unwrap()
        );
        assert!(matches!(
            RenderOptions::parse("width:wide"),
            Err(Error::InvalidOption(_))
        ));
    }

    #[test]
    fn test_parse_rejects_unrenderable_sizes() {
        for options in ["width:0", "height:0", "width:16385", "width:4294967295;height:4294967295"] {
            assert!(matches!(
                RenderOptions::parse(options),
                Err(Error::InvalidOption(_))
            ));
        }
        assert_eq!(
            MAX_CANVAS_SIZE,
            RenderOptions::parse("height:16384").unwrap().height
        );
    }

    #[tokio::test]
    async fn test_oversized_options_fail_before_rendering() {
        let root = tempfile::tempdir().unwrap();
        let graphics = MapGraphics::init(&settings(root.path())).unwrap();
        let empty = MemoryQuerySet::new(cities().meta().clone(), vec![]);

        assert!(matches!(
            graphics
                .render_with(
                    &empty,
                    "width:4294967295;height:4294967295",
                    &Strategy::Memory,
                    &RasterRenderer::new()
                )
                .await,
            Err(Error::InvalidOption(_))
        ));
        assert_eq!(0, fs::read_dir(graphics.dir()).unwrap().count());
    }

    #[test]
    fn test_url_for_relative_media_url() {
        let root = tempfile::tempdir().unwrap();
        let mut relative = settings(root.path());
        relative.media_url = String::new();
        let graphics = MapGraphics::init(&relative).unwrap();

        assert_eq!(
            "mapgraphics/city_1.png",
            graphics.url_for(Path::new("/srv/media/mapgraphics/city_1.png"))
        );

        relative.media_url = String::from("/");
        let graphics = MapGraphics::init(&relative).unwrap();
        assert_eq!(
            "/mapgraphics/city_1.png",
            graphics.url_for(Path::new("city_1.png"))
        );
    }

    #[test]
    fn test_init_creates_graphics_dir() {
        let root = tempfile::tempdir().unwrap();
        let graphics = MapGraphics::init(&settings(root.path())).unwrap();

        assert_eq!(root.path().join(GRAPHICS_DIR), graphics.dir());
        assert!(graphics.dir().is_dir());
    }

    #[tokio::test]
    async fn test_render_three_points() {
        let root = tempfile::tempdir().unwrap();
        let graphics = MapGraphics::init(&settings(root.path())).unwrap();
        let qs = cities();

        let graphic = graphics
            .render_graphic(&qs, &RenderOptions::default(), &Strategy::Memory, &RasterRenderer::new())
            .await
            .unwrap();

        let map = &graphic.map;
        assert_eq!(1, map.layers().len());
        assert_eq!(vec![DEFAULT_STYLE_NAME], map.layers()[0].styles);
        assert_eq!((600, 600), (map.width, map.height));
        assert_eq!(Color::TRANSPARENT, map.background);
        assert_eq!(AspectFixMode::GrowCanvas, map.aspect_fix_mode);
        assert_eq!(Viewport::All, map.viewport());
        assert!(fs::metadata(&graphic.path).unwrap().len() > 0);

        let name = graphic.path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("city_600_600_"));
        assert!(name.ends_with(".png"));
        assert_eq!(format!("<img src=\"/media/mapgraphics/{}\" />", name), graphic.tag);
    }

    #[tokio::test]
    async fn test_render_needs_a_postgis_database() {
        let root = tempfile::tempdir().unwrap();
        let graphics = MapGraphics::init(&settings(root.path())).unwrap();

        assert!(matches!(
            graphics.render(&cities(), "", &RasterRenderer::new()).await,
            Err(Error::UnknownDatabase(_))
        ));
        assert_eq!(0, fs::read_dir(graphics.dir()).unwrap().count());
    }

    #[test]
    fn test_img_tag_escapes_url() {
        assert_eq!(
            "<img src=\"/media/a&amp;b&quot;.png\" />",
            img_tag("/media/a&b\".png")
        );
    }
}
