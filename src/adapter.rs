//! Turns a query set into a renderable [`Layer`].
use crate::config::ConnectionParams;
use crate::datasource::{Datasource, MemoryDatasource, PostGisDatasource};
use crate::display::{self, ShowOptions, SystemLauncher};
use crate::map::{Layer, Map};
use crate::projection::{init_srs, proj4_literal};
use crate::query::{GeometryField, GeometryFieldSelector, QuerySet};
use crate::style::{default_style, NamedStyle, Style};
use crate::{Error, Renderer};

use std::path::PathBuf;

/// Name given to layers built without one. Maps holding several such layers
/// will have colliding names.
pub const DEFAULT_LAYER_NAME: &str = "name";

/// Side of the square maps built by [`query_to_map`].
pub const TILE_SIZE: u32 = 256;
pub const TILE_SRS: &str = "+init=epsg:900913";
pub const TILE_BUFFER_SIZE: u32 = 128;

/// Where a layer's features come from.
#[derive(Clone, Debug, PartialEq)]
pub enum Strategy {
    /// A live subquery against PostGIS; rows are fetched by the renderer.
    PostGis(ConnectionParams),
    /// Every row pulled into memory before rendering.
    Memory,
}

pub struct LayerAdapter<'a> {
    qs: &'a dyn QuerySet,
    geometry_field: GeometryField,
    name: Option<String>,
    styles: Vec<String>,
    use_proj4_literal: bool,
    persist_connection: bool,
}

impl<'a> LayerAdapter<'a> {
    /// Resolves the geometry field up front; a query set without a usable one is
    /// rejected here, before any database or render call.
    pub fn new(
        qs: &'a dyn QuerySet,
        selector: &GeometryFieldSelector,
    ) -> Result<LayerAdapter<'a>, Error> {
        let geometry_field = selector.resolve(qs.meta())?;
        Ok(LayerAdapter {
            qs,
            geometry_field,
            name: None,
            styles: Vec::new(),
            use_proj4_literal: false,
            persist_connection: true,
        })
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_styles<I, S>(mut self, styles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.styles = styles.into_iter().map(Into::into).collect();
        self
    }

    /// Use a full proj4 definition instead of `+init=epsg:<srid>`.
    pub fn use_proj4_literal(mut self, literal: bool) -> Self {
        self.use_proj4_literal = literal;
        self
    }

    /// Ask the renderer to keep its database connection open between renders.
    pub fn persist_connection(mut self, persist: bool) -> Self {
        self.persist_connection = persist;
        self
    }

    pub fn geometry_field(&self) -> &GeometryField {
        &self.geometry_field
    }

    pub fn default_style(&self) -> Style {
        default_style(self.geometry_field.kind.as_str())
    }

    pub fn srs(&self) -> Result<String, Error> {
        if self.use_proj4_literal {
            proj4_literal(self.geometry_field.srid).map(String::from)
        } else {
            Ok(init_srs(self.geometry_field.srid))
        }
    }

    pub async fn datasource(&self, strategy: &Strategy) -> Result<Datasource, Error> {
        match strategy {
            Strategy::PostGis(connection) => Ok(Datasource::PostGis(PostGisDatasource::from_query(
                self.qs,
                &self.geometry_field,
                connection.clone(),
                self.persist_connection,
            )?)),
            Strategy::Memory => Ok(Datasource::Memory(
                MemoryDatasource::from_query(self.qs, &self.geometry_field).await?,
            )),
        }
    }

    pub async fn to_layer(&self, strategy: &Strategy) -> Result<Layer, Error> {
        let srs = self.srs()?;
        let datasource = self.datasource(strategy).await?;

        Ok(Layer {
            name: self
                .name
                .clone()
                .unwrap_or_else(|| DEFAULT_LAYER_NAME.to_string()),
            srs,
            datasource,
            styles: self.styles.clone(),
        })
    }

    /// Renders the layer with its default style and opens the image in a viewer.
    pub async fn show<R: Renderer + ?Sized>(
        &self,
        strategy: &Strategy,
        renderer: &R,
        options: &ShowOptions,
    ) -> Result<(Map, PathBuf), Error> {
        let layer = self.to_layer(strategy).await?;
        display::show(layer, self.default_style(), options, renderer, &SystemLauncher).await
    }
}

/// Builds a tile-sized map holding a single layer for `qs`, drawn with `styles`.
///
/// `srs` defaults to [`TILE_SRS`] and `buffer_size` to [`TILE_BUFFER_SIZE`].
pub async fn query_to_map(
    qs: &dyn QuerySet,
    styles: Vec<NamedStyle>,
    srs: Option<&str>,
    buffer_size: Option<u32>,
    strategy: &Strategy,
) -> Result<Map, Error> {
    let layer = LayerAdapter::new(qs, &GeometryFieldSelector::Infer)?
        .with_styles(styles.iter().map(|s| s.name.clone()))
        .to_layer(strategy)
        .await?;

    Ok(Map::assemble(
        vec![layer],
        styles,
        TILE_SIZE,
        TILE_SIZE,
        srs.unwrap_or(TILE_SRS),
        None,
        Some(buffer_size.unwrap_or(TILE_BUFFER_SIZE)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::geometry::GeometryKind;
    use crate::query::{CompiledQuery, Field, FieldType, MemoryQuerySet, ModelMeta, Row};
    use crate::style::Symbolizer;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    /// Counts every call that would reach the database.
    struct Tripwire {
        meta: ModelMeta,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl QuerySet for Tripwire {
        fn meta(&self) -> &ModelMeta {
            &self.meta
        }

        fn compile(&self) -> Result<CompiledQuery, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CompiledQuery::new("SELECT 1"))
        }

        async fn fetch_rows(&self) -> Result<Vec<Row>, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![])
        }
    }

    fn roads() -> ModelMeta {
        ModelMeta {
            name: String::from("road"),
            table: String::from("geo_road"),
            fields: vec![
                Field::new("id", FieldType::Int),
                Field::geometry("path", GeometryKind::MultiLineString, 2154),
            ],
        }
    }

    #[test]
    fn test_missing_geometry_fails_before_touching_the_database() {
        let qs = Tripwire {
            meta: ModelMeta {
                name: String::from("note"),
                table: String::from("geo_note"),
                fields: vec![Field::new("body", FieldType::Text)],
            },
            calls: AtomicUsize::new(0),
        };

        assert!(matches!(
            LayerAdapter::new(&qs, &GeometryFieldSelector::Infer),
            Err(Error::NoGeometryField(_))
        ));
        assert_eq!(0, qs.calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_default_layer() {
        let qs = MemoryQuerySet::new(roads(), vec![]);
        let adapter = LayerAdapter::new(&qs, &GeometryFieldSelector::Infer).unwrap();

        let layer = adapter.to_layer(&Strategy::Memory).await.unwrap();
        assert_eq!(DEFAULT_LAYER_NAME, layer.name);
        assert_eq!("+init=epsg:2154", layer.srs);
        assert!(layer.styles.is_empty());
        assert!(matches!(layer.datasource, Datasource::Memory(_)));
    }

    #[tokio::test]
    async fn test_named_layer_with_styles_and_literal_projection() {
        let qs = MemoryQuerySet::new(roads(), vec![]);
        let adapter = LayerAdapter::new(&qs, &GeometryFieldSelector::Explicit(String::from("path")))
            .unwrap()
            .with_name("roads")
            .with_styles(["casing", "centerline"])
            .use_proj4_literal(true);

        let layer = adapter.to_layer(&Strategy::Memory).await.unwrap();
        assert_eq!("roads", layer.name);
        assert!(layer.srs.starts_with("+proj=lcc"));
        assert_eq!(vec!["casing", "centerline"], layer.styles);
    }

    #[tokio::test]
    async fn test_unknown_srid_fails_literal_projection() {
        let mut meta = roads();
        meta.fields[1] = Field::geometry("path", GeometryKind::LineString, 999_999);
        let qs = MemoryQuerySet::new(meta, vec![]);
        let adapter = LayerAdapter::new(&qs, &GeometryFieldSelector::Infer)
            .unwrap()
            .use_proj4_literal(true);

        assert!(matches!(
            adapter.to_layer(&Strategy::Memory).await,
            Err(Error::UnknownSrid(999_999))
        ));
    }

    #[tokio::test]
    async fn test_query_to_map() {
        let qs = MemoryQuerySet::new(roads(), vec![]);
        let styles = vec![
            NamedStyle::new("casing", default_style("line")),
            NamedStyle::new("centerline", default_style("line")),
        ];

        let map = query_to_map(&qs, styles, None, None, &Strategy::Memory)
            .await
            .unwrap();
        assert_eq!((TILE_SIZE, TILE_SIZE), (map.width, map.height));
        assert_eq!(TILE_SRS, map.srs);
        assert_eq!(TILE_BUFFER_SIZE, map.buffer_size);
        assert_eq!(vec!["casing", "centerline"], map.layers()[0].styles);
        assert!(map.validate().is_ok());

        let map = query_to_map(&qs, vec![], Some("+init=epsg:4326"), Some(0), &Strategy::Memory)
            .await
            .unwrap();
        assert_eq!("+init=epsg:4326", map.srs);
        assert_eq!(0, map.buffer_size);
    }

    #[test]
    fn test_default_style_follows_geometry_kind() {
        let qs = MemoryQuerySet::new(roads(), vec![]);
        let adapter = LayerAdapter::new(&qs, &GeometryFieldSelector::Infer).unwrap();

        let style = adapter.default_style();
        assert!(matches!(
            style.rules[0].symbolizers.as_slice(),
            [Symbolizer::Line(_)]
        ));
    }
}
