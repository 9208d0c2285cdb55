//! Cartographic styles: colors, symbolizers, rules and the canned defaults.
use crate::Error;

use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const TRANSPARENT: Color = Color::rgba(0, 0, 0, 0);
    pub const BLACK: Color = Color::rgb(0, 0, 0);
    pub const WHITE: Color = Color::rgb(255, 255, 255);
    pub const STEELBLUE: Color = Color::rgb(70, 130, 180);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Color {
        Color { r, g, b, a: 255 }
    }

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Color {
        Color { r, g, b, a }
    }
}

impl FromStr for Color {
    type Err = Error;

    /// Accepts a handful of CSS names and `#rgb`, `#rrggbb` or `#rrggbbaa`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        let named = match name.as_str() {
            "transparent" => Some(Color::TRANSPARENT),
            "black" => Some(Color::BLACK),
            "white" => Some(Color::WHITE),
            "steelblue" => Some(Color::STEELBLUE),
            "red" => Some(Color::rgb(255, 0, 0)),
            "green" => Some(Color::rgb(0, 128, 0)),
            "blue" => Some(Color::rgb(0, 0, 255)),
            "gray" | "grey" => Some(Color::rgb(128, 128, 128)),
            _ => None,
        };
        if let Some(color) = named {
            return Ok(color);
        }

        let invalid = || Error::InvalidColor(s.to_string());
        let hex = name.strip_prefix('#').ok_or_else(invalid)?;
        if !hex.is_ascii() {
            return Err(invalid());
        }
        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&hex[range], 16).map_err(|_| invalid())
        };

        match hex.len() {
            3 => {
                let short = |i: usize| channel(i..i + 1).map(|v| v * 17);
                Ok(Color::rgb(short(0)?, short(1)?, short(2)?))
            }
            6 => Ok(Color::rgb(channel(0..2)?, channel(2..4)?, channel(4..6)?)),
            8 => Ok(Color::rgba(
                channel(0..2)?,
                channel(2..4)?,
                channel(4..6)?,
                channel(6..8)?,
            )),
            _ => Err(invalid()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PolygonSymbolizer {
    pub fill: Color,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LineSymbolizer {
    pub stroke: Color,
    pub width: f64,
}

/// A square marker, `size` pixels on a side.
#[derive(Clone, Debug, PartialEq)]
pub struct PointSymbolizer {
    pub fill: Color,
    pub size: f64,
    /// Draw even when the marker collides with one already placed.
    pub allow_overlap: bool,
}

impl Default for PointSymbolizer {
    fn default() -> Self {
        PointSymbolizer {
            fill: Color::BLACK,
            size: 4.0,
            allow_overlap: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Symbolizer {
    Polygon(PolygonSymbolizer),
    Line(LineSymbolizer),
    Point(PointSymbolizer),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Rule {
    pub symbolizers: Vec<Symbolizer>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Style {
    pub rules: Vec<Rule>,
}

/// A style paired with the name layers refer to it by.
#[derive(Clone, Debug, PartialEq)]
pub struct NamedStyle {
    pub name: String,
    pub style: Style,
}

impl NamedStyle {
    pub fn new<S: Into<String>>(name: S, style: Style) -> NamedStyle {
        NamedStyle {
            name: name.into(),
            style,
        }
    }
}

/// Ultra simple default style for quick setup or debugging.
///
/// Anything that doesn't look like a polygon or a line gets point markers.
pub fn default_style(geometry_type: &str) -> Style {
    let kind = geometry_type.to_lowercase();
    let symbolizers = if kind.contains("poly") {
        vec![
            Symbolizer::Polygon(PolygonSymbolizer {
                fill: Color::STEELBLUE,
            }),
            Symbolizer::Line(LineSymbolizer {
                stroke: Color::STEELBLUE,
                width: 0.5,
            }),
        ]
    } else if kind.contains("line") {
        vec![Symbolizer::Line(LineSymbolizer {
            stroke: Color::STEELBLUE,
            width: 1.5,
        })]
    } else {
        vec![Symbolizer::Point(PointSymbolizer {
            allow_overlap: true,
            ..PointSymbolizer::default()
        })]
    };

    Style {
        rules: vec![Rule { symbolizers }],
    }
}
