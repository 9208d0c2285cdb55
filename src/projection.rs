//! Spatial reference strings and the small amount of reprojection the raster
//! backend needs.
use crate::geometry::Envelope;
use crate::Error;

use std::collections::HashMap;
use std::f64::consts::PI;

use once_cell::sync::Lazy;

/// WGS84 semi-major axis, in meters.
const EARTH_RADIUS: f64 = 6_378_137.0;

/// Latitude at which web mercator becomes square.
const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;

pub const WGS84_PROJ4: &str = "+proj=longlat +ellps=WGS84 +datum=WGS84 +no_defs";
pub const MERCATOR_PROJ4: &str = "+proj=merc +a=6378137 +b=6378137 +lat_ts=0.0 +lon_0=0.0 \
     +x_0=0.0 +y_0=0 +k=1.0 +units=m +nadgrids=@null +wktext +no_defs";

static PROJ4_DEFS: Lazy<HashMap<i32, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (4326, WGS84_PROJ4),
        (3857, MERCATOR_PROJ4),
        (900913, MERCATOR_PROJ4),
        (3785, MERCATOR_PROJ4),
        (102113, MERCATOR_PROJ4),
        (4269, "+proj=longlat +ellps=GRS80 +datum=NAD83 +no_defs"),
        (4258, "+proj=longlat +ellps=GRS80 +no_defs"),
        (
            2154,
            "+proj=lcc +lat_1=49 +lat_2=44 +lat_0=46.5 +lon_0=3 +x_0=700000 \
             +y_0=6600000 +ellps=GRS80 +towgs84=0,0,0,0,0,0,0 +units=m +no_defs",
        ),
        (
            27700,
            "+proj=tmerc +lat_0=49 +lon_0=-2 +k=0.9996012717 +x_0=400000 \
             +y_0=-100000 +ellps=airy +datum=OSGB36 +units=m +no_defs",
        ),
        (
            2163,
            "+proj=laea +lat_0=45 +lon_0=-100 +x_0=0 +y_0=0 +a=6370997 \
             +b=6370997 +units=m +no_defs",
        ),
    ])
});

/// `+init=epsg:<srid>`
pub fn init_srs(srid: i32) -> String {
    format!("+init=epsg:{}", srid)
}

/// Full proj4 definition for an SRID.
pub fn proj4_literal(srid: i32) -> Result<&'static str, Error> {
    PROJ4_DEFS
        .get(&srid)
        .copied()
        .ok_or(Error::UnknownSrid(srid))
}

/// The families of spatial reference the raster backend can reproject between.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Projection {
    Geographic,
    WebMercator,
    /// Anything else, keyed by its normalized srs string.
    Other(String),
}

impl Projection {
    pub fn from_srs(srs: &str) -> Projection {
        let normalized = srs.split_whitespace().collect::<Vec<_>>().join(" ");
        let lower = normalized.to_lowercase();

        if let Some(code) = lower.strip_prefix("+init=epsg:") {
            return match code.trim().parse::<i32>() {
                Ok(4326) => Projection::Geographic,
                Ok(3857) | Ok(900913) | Ok(3785) | Ok(102113) => Projection::WebMercator,
                _ => Projection::Other(lower),
            };
        }

        if lower.contains("+proj=longlat") && lower.contains("wgs84") {
            Projection::Geographic
        } else if lower.contains("+proj=merc") && lower.contains("+a=6378137") {
            Projection::WebMercator
        } else {
            Projection::Other(lower)
        }
    }
}

/// Maps coordinates from a layer's projection into the map's.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transform {
    Identity,
    GeographicToMercator,
    MercatorToGeographic,
}

impl Transform {
    pub fn between(source: &str, target: &str) -> Result<Transform, Error> {
        match (Projection::from_srs(source), Projection::from_srs(target)) {
            (a, b) if a == b => Ok(Transform::Identity),
            (Projection::Geographic, Projection::WebMercator) => {
                Ok(Transform::GeographicToMercator)
            }
            (Projection::WebMercator, Projection::Geographic) => {
                Ok(Transform::MercatorToGeographic)
            }
            _ => Err(Error::UnsupportedProjection(format!(
                "{} -> {}",
                source, target
            ))),
        }
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        match self {
            Transform::Identity => (x, y),
            Transform::GeographicToMercator => lonlat_to_mercator(x, y),
            Transform::MercatorToGeographic => mercator_to_lonlat(x, y),
        }
    }

    pub fn inverse(&self) -> Transform {
        match self {
            Transform::Identity => Transform::Identity,
            Transform::GeographicToMercator => Transform::MercatorToGeographic,
            Transform::MercatorToGeographic => Transform::GeographicToMercator,
        }
    }

    /// Transforms a box by its corners.
    pub fn apply_envelope(&self, envelope: &Envelope) -> Envelope {
        let corners = envelope.corners().map(|(x, y)| self.apply(x, y));
        let (x0, y0) = corners[0];
        corners[1..]
            .iter()
            .fold(Envelope::new(x0, y0, x0, y0), |mut e, &(x, y)| {
                e.expand_to_include(x, y);
                e
            })
    }
}

pub fn lonlat_to_mercator(lon: f64, lat: f64) -> (f64, f64) {
    let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
    let x = EARTH_RADIUS * lon.to_radians();
    let y = EARTH_RADIUS * (PI / 4.0 + lat.to_radians() / 2.0).tan().ln();
    (x, y)
}

pub fn mercator_to_lonlat(x: f64, y: f64) -> (f64, f64) {
    let lon = (x / EARTH_RADIUS).to_degrees();
    let lat = (2.0 * (y / EARTH_RADIUS).exp().atan() - PI / 2.0).to_degrees();
    (lon, lat)
}
