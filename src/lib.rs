//! # GeoQuery Layers
//!
//! Turns spatial database queries into renderable map layers.
//!
//! ## Current features
//!
//! Given a query set over a table with a geometry column, this crate will build a
//! map layer for it, either as a live PostGIS subquery (filtering stays in the
//! database) or as an in-memory feature collection. Layers can be assembled into
//! maps with styles, rendered to PNG, opened in an image viewer for debugging, or
//! written under a media directory for display in web pages.
//!
//! ## Known Limitations
//!
//! The built-in [`render::RasterRenderer`] only reprojects between EPSG:4326 and
//! web mercator; any other pairing of layer and map projections is an error.
//! Labels, filters and zoom-dependent rules are not supported.
//!
//! The trait-based design allows other query layers and rendering backends to be
//! plugged in through [`query::QuerySet`] and [`Renderer`].

// TODO: remove once async fn in traits become stable
use async_trait::async_trait;

use std::path::Path;

use crate::map::Map;

mod error;
pub use error::Error;

pub mod adapter;
pub mod config;
pub mod datasource;
pub mod display;
pub mod geometry;
pub mod map;
pub mod postgis;
pub mod projection;
pub mod query;
pub mod render;
pub mod sql;
pub mod style;
pub mod template;

/// A rendering backend. Draws every layer of a map and writes the image to `path`.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render_to_file(&self, map: &Map, path: &Path) -> Result<(), Error>;
}
