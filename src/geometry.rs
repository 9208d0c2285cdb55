//! Geometry plumbing: geometry kinds, WKB/EWKB codecs and bounding envelopes.
use crate::Error;

use std::borrow::Cow;
use std::fmt;

use geo_traits::to_geo::ToGeoGeometry;
use geo_types::{Coord, Geometry, Polygon};

const EWKB_SRID_FLAG: u32 = 0x2000_0000;

/// The declared kind of a geometry column, as PostGIS reports it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeometryKind {
    Point,
    LineString,
    Polygon,
    MultiPoint,
    MultiLineString,
    MultiPolygon,
    GeometryCollection,
    Geometry,
}

impl GeometryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeometryKind::Point => "POINT",
            GeometryKind::LineString => "LINESTRING",
            GeometryKind::Polygon => "POLYGON",
            GeometryKind::MultiPoint => "MULTIPOINT",
            GeometryKind::MultiLineString => "MULTILINESTRING",
            GeometryKind::MultiPolygon => "MULTIPOLYGON",
            GeometryKind::GeometryCollection => "GEOMETRYCOLLECTION",
            GeometryKind::Geometry => "GEOMETRY",
        }
    }
}

impl fmt::Display for GeometryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decodes a WKB (or top-level EWKB) blob into a geometry.
pub fn decode_wkb(bytes: &[u8]) -> Result<Geometry<f64>, Error> {
    let plain = strip_srid(bytes)?;
    let wkb = wkb::reader::read_wkb(&plain).map_err(|e| Error::InvalidWkb(e.to_string()))?;
    Ok(wkb.to_geometry())
}

/// Encodes a geometry as little endian WKB.
pub fn encode_wkb(geometry: &Geometry<f64>) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    wkb::writer::write_geometry(&mut buf, geometry, &Default::default())
        .map_err(|e| Error::InvalidWkb(e.to_string()))?;
    Ok(buf)
}

/// Tags a WKB blob with an SRID, producing PostGIS extended WKB.
pub fn to_ewkb(wkb: &[u8], srid: i32) -> Result<Vec<u8>, Error> {
    let (little_endian, geometry_type) = read_header(wkb)?;
    let tagged = geometry_type | EWKB_SRID_FLAG;

    let mut out = Vec::with_capacity(wkb.len() + 4);
    out.push(wkb[0]);
    if little_endian {
        out.extend_from_slice(&tagged.to_le_bytes());
        out.extend_from_slice(&srid.to_le_bytes());
    } else {
        out.extend_from_slice(&tagged.to_be_bytes());
        out.extend_from_slice(&srid.to_be_bytes());
    }
    out.extend_from_slice(&wkb[5..]);
    Ok(out)
}

/// Upper case hex, the form PostGIS prints EWKB in.
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

fn read_header(wkb: &[u8]) -> Result<(bool, u32), Error> {
    if wkb.len() < 5 {
        return Err(Error::InvalidWkb(format!("{} bytes is too short", wkb.len())));
    }
    let little_endian = match wkb[0] {
        0 => false,
        1 => true,
        other => return Err(Error::InvalidWkb(format!("bad byte order marker {}", other))),
    };
    let raw = [wkb[1], wkb[2], wkb[3], wkb[4]];
    let geometry_type = if little_endian {
        u32::from_le_bytes(raw)
    } else {
        u32::from_be_bytes(raw)
    };
    Ok((little_endian, geometry_type))
}

fn strip_srid(bytes: &[u8]) -> Result<Cow<'_, [u8]>, Error> {
    let (little_endian, geometry_type) = read_header(bytes)?;
    if geometry_type & EWKB_SRID_FLAG == 0 {
        return Ok(Cow::Borrowed(bytes));
    }
    if bytes.len() < 9 {
        return Err(Error::InvalidWkb(String::from("truncated SRID")));
    }

    let untagged = geometry_type & !EWKB_SRID_FLAG;
    let mut out = Vec::with_capacity(bytes.len() - 4);
    out.push(bytes[0]);
    if little_endian {
        out.extend_from_slice(&untagged.to_le_bytes());
    } else {
        out.extend_from_slice(&untagged.to_be_bytes());
    }
    out.extend_from_slice(&bytes[9..]);
    Ok(Cow::Owned(out))
}

/// An axis aligned bounding box in some spatial reference.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Envelope {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Envelope {
        Envelope {
            min_x: min_x.min(max_x),
            min_y: min_y.min(max_y),
            max_x: min_x.max(max_x),
            max_y: min_y.max(max_y),
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    pub fn expand_to_include(&mut self, x: f64, y: f64) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }

    pub fn merge(&self, other: &Envelope) -> Envelope {
        Envelope {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Grows the box by `dx` horizontally and `dy` vertically on each side.
    pub fn buffered(&self, dx: f64, dy: f64) -> Envelope {
        Envelope {
            min_x: self.min_x - dx,
            min_y: self.min_y - dy,
            max_x: self.max_x + dx,
            max_y: self.max_y + dy,
        }
    }

    pub fn corners(&self) -> [(f64, f64); 4] {
        [
            (self.min_x, self.min_y),
            (self.min_x, self.max_y),
            (self.max_x, self.min_y),
            (self.max_x, self.max_y),
        ]
    }

    pub fn of_geometry(geometry: &Geometry<f64>) -> Option<Envelope> {
        let mut envelope: Option<Envelope> = None;
        visit_coords(geometry, &mut |c| {
            envelope = Some(match envelope {
                Some(mut e) => {
                    e.expand_to_include(c.x, c.y);
                    e
                }
                None => Envelope::new(c.x, c.y, c.x, c.y),
            });
        });
        envelope
    }

    pub fn of_all<'a, I>(geometries: I) -> Option<Envelope>
    where
        I: IntoIterator<Item = &'a Geometry<f64>>,
    {
        geometries
            .into_iter()
            .filter_map(Envelope::of_geometry)
            .reduce(|a, b| a.merge(&b))
    }
}

/// Calls `f` for every vertex of the geometry, recursing into collections.
pub fn visit_coords<F: FnMut(Coord<f64>)>(geometry: &Geometry<f64>, f: &mut F) {
    match geometry {
        Geometry::Point(p) => f(p.0),
        Geometry::Line(l) => {
            f(l.start);
            f(l.end);
        }
        Geometry::LineString(ls) => ls.0.iter().copied().for_each(&mut *f),
        Geometry::Polygon(p) => visit_polygon(p, f),
        Geometry::MultiPoint(mp) => mp.0.iter().for_each(|p| f(p.0)),
        Geometry::MultiLineString(mls) => {
            for ls in &mls.0 {
                ls.0.iter().copied().for_each(&mut *f);
            }
        }
        Geometry::MultiPolygon(mp) => {
            for p in &mp.0 {
                visit_polygon(p, f);
            }
        }
        Geometry::GeometryCollection(gc) => {
            for g in &gc.0 {
                visit_coords(g, f);
            }
        }
        Geometry::Rect(r) => visit_polygon(&r.to_polygon(), f),
        Geometry::Triangle(t) => visit_polygon(&t.to_polygon(), f),
    }
}

fn visit_polygon<F: FnMut(Coord<f64>)>(polygon: &Polygon<f64>, f: &mut F) {
    polygon.exterior().0.iter().copied().for_each(&mut *f);
    for ring in polygon.interiors() {
        ring.0.iter().copied().for_each(&mut *f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use geo_types::{line_string, point, polygon};

    #[test]
    fn test_wkb_polygon_survives_encoding() {
        let original = Geometry::Polygon(polygon![
            (x: 0.0, y: 0.0),
            (x: 10.0, y: 0.0),
            (x: 10.0, y: 10.0),
            (x: 0.0, y: 0.0),
        ]);

        let wkb = encode_wkb(&original).unwrap();
        assert_eq!(original, decode_wkb(&wkb).unwrap());
    }

    #[test]
    fn test_ewkb_is_tagged_and_stripped() {
        let original = Geometry::Point(point!(x: 1.5, y: -2.25));
        let wkb = encode_wkb(&original).unwrap();
        let ewkb = to_ewkb(&wkb, 4326).unwrap();

        assert_eq!(wkb.len() + 4, ewkb.len());
        // SRID flag lands in the high byte of the little endian type word
        assert_eq!(0x20, ewkb[4]);
        assert_eq!(&4326i32.to_le_bytes(), &ewkb[5..9]);
        assert_eq!(original, decode_wkb(&ewkb).unwrap());
    }

    #[test]
    fn test_garbage_is_not_wkb() {
        assert!(matches!(decode_wkb(&[]), Err(Error::InvalidWkb(_))));
        assert!(matches!(
            decode_wkb(&[7, 1, 0, 0, 0]),
            Err(Error::InvalidWkb(_))
        ));
        assert!(decode_wkb(&[1, 1, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_hex() {
        assert_eq!("00FF1A", to_hex(&[0x00, 0xff, 0x1a]));
    }

    #[test]
    fn test_envelope_of_geometries() {
        let geometries = vec![
            Geometry::Point(point!(x: -3.0, y: 4.0)),
            Geometry::LineString(line_string![(x: 1.0, y: 1.0), (x: 5.0, y: -2.0)]),
        ];

        let envelope = Envelope::of_all(&geometries).unwrap();
        assert_eq!(Envelope::new(-3.0, -2.0, 5.0, 4.0), envelope);
        assert_eq!(8.0, envelope.width());
        assert_eq!(6.0, envelope.height());
        assert_eq!((1.0, 1.0), envelope.center());
        assert!(Envelope::of_all(&Vec::<Geometry<f64>>::new()).is_none());
    }
}
