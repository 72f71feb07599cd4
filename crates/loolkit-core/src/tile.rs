//! Tile descriptors: the `tile` and `tilecombine` request/reply grammar.
//!
//! A tile identifies a fixed-pixel-size rendering of a rectangular region
//! of one document part. Requests arrive as `name=value` tokens; replies
//! echo the same tokens (plus `imgsize` once the PNG size is known) ahead
//! of the encoded pixels.

use std::fmt::Write as _;
use std::str::FromStr;

use crate::rect::Rect;

/// Errors from tile token parsing.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TileError {
    /// A required token was absent.
    #[error("missing token '{name}'")]
    MissingToken {
        /// Token name.
        name: &'static str,
    },

    /// A token value did not parse or was out of range.
    #[error("invalid value '{value}' for token '{name}'")]
    InvalidToken {
        /// Token name.
        name: &'static str,
        /// Offending value.
        value: String,
    },

    /// A combined request carried no positions.
    #[error("combined tile request with no positions")]
    EmptyBatch,

    /// The position lists of a combined request differ in length.
    #[error("combined tile position lists differ: {xs} x-positions, {ys} y-positions")]
    CountMismatch {
        /// Number of x positions.
        xs: usize,
        /// Number of y positions.
        ys: usize,
    },

    /// A position does not lie on the tile grid; the mosaic division in
    /// the renderer would truncate.
    #[error("tile position {position} off the {axis} grid of {grid}")]
    Misaligned {
        /// `"x"` or `"y"`.
        axis: &'static str,
        /// Offending position in twips.
        position: i32,
        /// Grid pitch in twips.
        grid: i32,
    },
}

fn required<T: FromStr>(tokens: &[&str], name: &'static str) -> Result<T, TileError> {
    let value =
        crate::protocol::token_value(tokens, name).ok_or(TileError::MissingToken { name })?;
    value.parse().map_err(|_| TileError::InvalidToken {
        name,
        value: value.to_string(),
    })
}

fn optional<T: FromStr>(tokens: &[&str], name: &'static str, default: T) -> Result<T, TileError> {
    match crate::protocol::token_value(tokens, name) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| TileError::InvalidToken {
            name,
            value: value.to_string(),
        }),
    }
}

fn positive(name: &'static str, value: i32) -> Result<i32, TileError> {
    if value > 0 {
        Ok(value)
    } else {
        Err(TileError::InvalidToken {
            name,
            value: value.to_string(),
        })
    }
}

/// One tile: pixel size, twip position, and twip extent within a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileDesc {
    /// Document part (sheet, slide, page block).
    pub part: i32,
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
    /// Left edge in twips.
    pub tile_pos_x: i32,
    /// Top edge in twips.
    pub tile_pos_y: i32,
    /// Horizontal extent in twips.
    pub tile_width: i32,
    /// Vertical extent in twips.
    pub tile_height: i32,
    /// Client tile version; `-1` when the request carried none.
    pub version: i32,
    /// Encoded PNG size in bytes; `0` until rendered.
    pub img_size: usize,
}

impl TileDesc {
    /// Parses a tile from its `name=value` tokens (command token excluded).
    ///
    /// # Errors
    ///
    /// Returns [`TileError`] when a required token is missing or a value is
    /// not a positive number where one is required.
    pub fn parse(tokens: &[&str]) -> Result<Self, TileError> {
        Ok(Self {
            part: required(tokens, "part")?,
            width: required(tokens, "width")?,
            height: required(tokens, "height")?,
            tile_pos_x: required(tokens, "tileposx")?,
            tile_pos_y: required(tokens, "tileposy")?,
            tile_width: positive("tilewidth", required(tokens, "tilewidth")?)?,
            tile_height: positive("tileheight", required(tokens, "tileheight")?)?,
            version: optional(tokens, "ver", -1)?,
            img_size: optional(tokens, "imgsize", 0)?,
        })
    }

    /// Serializes the tile behind `prefix` (e.g. `"tile:"`).
    #[must_use]
    pub fn serialize(&self, prefix: &str) -> String {
        let mut out = format!(
            "{prefix} part={} width={} height={} tileposx={} tileposy={} tilewidth={} tileheight={}",
            self.part,
            self.width,
            self.height,
            self.tile_pos_x,
            self.tile_pos_y,
            self.tile_width,
            self.tile_height,
        );
        if self.img_size > 0 {
            let _ = write!(out, " imgsize={}", self.img_size);
        }
        if self.version >= 0 {
            let _ = write!(out, " ver={}", self.version);
        }
        out
    }

    /// The twip-space rectangle this tile covers.
    #[must_use]
    pub const fn rect(&self) -> Rect {
        Rect::new(
            self.tile_pos_x,
            self.tile_pos_y,
            self.tile_width,
            self.tile_height,
        )
    }
}

/// A homogeneous batch of tiles rendered through one engine paint.
///
/// All tiles share `part`, pixel size, and twip extent; only positions
/// vary. Positions must lie on the grid spanned by the minimum position
/// and the twip extent, so the renderer's mosaic division is exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileCombined {
    /// Document part.
    pub part: i32,
    /// Per-tile output width in pixels.
    pub width: u32,
    /// Per-tile output height in pixels.
    pub height: u32,
    /// Per-tile horizontal extent in twips.
    pub tile_width: i32,
    /// Per-tile vertical extent in twips.
    pub tile_height: i32,
    /// Client tile version; `-1` when the request carried none.
    pub version: i32,
    /// The individual tiles, in request order.
    pub tiles: Vec<TileDesc>,
}

fn parse_list(tokens: &[&str], name: &'static str) -> Result<Vec<i32>, TileError> {
    let value =
        crate::protocol::token_value(tokens, name).ok_or(TileError::MissingToken { name })?;
    value
        .split(',')
        .filter(|piece| !piece.is_empty())
        .map(|piece| {
            piece.parse().map_err(|_| TileError::InvalidToken {
                name,
                value: piece.to_string(),
            })
        })
        .collect()
}

impl TileCombined {
    /// Parses a combined request from its `name=value` tokens.
    ///
    /// # Errors
    ///
    /// Returns [`TileError`] for missing/invalid tokens, mismatched
    /// position lists, an empty batch, or off-grid positions.
    pub fn parse(tokens: &[&str]) -> Result<Self, TileError> {
        let part = required(tokens, "part")?;
        let width: u32 = required(tokens, "width")?;
        let height: u32 = required(tokens, "height")?;
        let tile_width = positive("tilewidth", required(tokens, "tilewidth")?)?;
        let tile_height = positive("tileheight", required(tokens, "tileheight")?)?;
        let version = optional(tokens, "ver", -1)?;

        let xs = parse_list(tokens, "tileposx")?;
        let ys = parse_list(tokens, "tileposy")?;
        if xs.len() != ys.len() {
            return Err(TileError::CountMismatch {
                xs: xs.len(),
                ys: ys.len(),
            });
        }
        if xs.is_empty() {
            return Err(TileError::EmptyBatch);
        }
        let sizes = match crate::protocol::token_value(tokens, "imgsize") {
            None => vec![0usize; xs.len()],
            Some(_) => {
                let sizes = parse_list(tokens, "imgsize")?;
                if sizes.len() != xs.len() {
                    return Err(TileError::CountMismatch {
                        xs: xs.len(),
                        ys: sizes.len(),
                    });
                }
                sizes.into_iter().map(|s| s.max(0) as usize).collect()
            }
        };

        let min_x = xs.iter().copied().min().unwrap_or(0);
        let min_y = ys.iter().copied().min().unwrap_or(0);
        for &x in &xs {
            if (x - min_x) % tile_width != 0 {
                return Err(TileError::Misaligned {
                    axis: "x",
                    position: x,
                    grid: tile_width,
                });
            }
        }
        for &y in &ys {
            if (y - min_y) % tile_height != 0 {
                return Err(TileError::Misaligned {
                    axis: "y",
                    position: y,
                    grid: tile_height,
                });
            }
        }

        let tiles = xs
            .iter()
            .zip(&ys)
            .zip(&sizes)
            .map(|((&x, &y), &img_size)| TileDesc {
                part,
                width,
                height,
                tile_pos_x: x,
                tile_pos_y: y,
                tile_width,
                tile_height,
                version,
                img_size,
            })
            .collect();

        Ok(Self {
            part,
            width,
            height,
            tile_width,
            tile_height,
            version,
            tiles,
        })
    }

    /// Serializes the batch behind `prefix` (e.g. `"tilecombine:"`).
    #[must_use]
    pub fn serialize(&self, prefix: &str) -> String {
        let join = |f: &dyn Fn(&TileDesc) -> String| {
            self.tiles
                .iter()
                .map(|t| f(t))
                .collect::<Vec<_>>()
                .join(",")
        };
        let mut out = format!(
            "{prefix} part={} width={} height={} tileposx={} tileposy={}",
            self.part,
            self.width,
            self.height,
            join(&|t| t.tile_pos_x.to_string()),
            join(&|t| t.tile_pos_y.to_string()),
        );
        if self.tiles.iter().any(|t| t.img_size > 0) {
            let _ = write!(out, " imgsize={}", join(&|t| t.img_size.to_string()));
        }
        let _ = write!(out, " tilewidth={} tileheight={}", self.tile_width, self.tile_height);
        if self.version >= 0 {
            let _ = write!(out, " ver={}", self.version);
        }
        out
    }

    /// Bounding twip rectangle over all tiles in the batch.
    #[must_use]
    pub fn render_area(&self) -> Rect {
        let mut area = Rect::default();
        for (index, tile) in self.tiles.iter().enumerate() {
            if index == 0 {
                area = tile.rect();
            } else {
                area.extend(&tile.rect());
            }
        }
        area
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tokenize;

    #[test]
    fn test_tile_round_trip() {
        let message = "part=0 width=256 height=256 tileposx=3840 tileposy=7680 \
                       tilewidth=3840 tileheight=3840 ver=7";
        let tile = TileDesc::parse(&tokenize(message)).unwrap();
        let echoed = TileDesc::parse(&tokenize(&tile.serialize("tile:")[5..])).unwrap();
        assert_eq!(tile, echoed);
        assert_eq!(tile.version, 7);
        assert_eq!(tile.img_size, 0);
    }

    #[test]
    fn test_tile_version_defaults() {
        let message = "part=2 width=256 height=256 tileposx=0 tileposy=0 \
                       tilewidth=3840 tileheight=3840";
        let tile = TileDesc::parse(&tokenize(message)).unwrap();
        assert_eq!(tile.version, -1);
        assert!(!tile.serialize("tile:").contains("ver="));
    }

    #[test]
    fn test_tile_missing_token() {
        let message = "part=0 width=256 tileposx=0 tileposy=0 tilewidth=3840 tileheight=3840";
        assert_eq!(
            TileDesc::parse(&tokenize(message)),
            Err(TileError::MissingToken { name: "height" })
        );
    }

    #[test]
    fn test_tile_rejects_zero_extent() {
        let message = "part=0 width=256 height=256 tileposx=0 tileposy=0 \
                       tilewidth=0 tileheight=3840";
        assert!(matches!(
            TileDesc::parse(&tokenize(message)),
            Err(TileError::InvalidToken {
                name: "tilewidth",
                ..
            })
        ));
    }

    #[test]
    fn test_combined_parse_and_area() {
        let message = "part=0 width=256 height=256 tileposx=0,3840,0,3840 \
                       tileposy=0,0,3840,3840 tilewidth=3840 tileheight=3840 ver=1";
        let combined = TileCombined::parse(&tokenize(message)).unwrap();
        assert_eq!(combined.tiles.len(), 4);
        assert_eq!(combined.render_area(), Rect::new(0, 0, 7680, 7680));
        assert_eq!(combined.tiles[3].tile_pos_y, 3840);
    }

    #[test]
    fn test_combined_serialize_with_sizes() {
        let message = "part=0 width=256 height=256 tileposx=0,3840 tileposy=0,0 \
                       tilewidth=3840 tileheight=3840";
        let mut combined = TileCombined::parse(&tokenize(message)).unwrap();
        combined.tiles[0].img_size = 120;
        combined.tiles[1].img_size = 98;
        let line = combined.serialize("tilecombine:");
        assert!(line.contains("imgsize=120,98"));
        let reparsed = TileCombined::parse(&tokenize(&line[12..])).unwrap();
        assert_eq!(reparsed.tiles[1].img_size, 98);
    }

    #[test]
    fn test_combined_count_mismatch() {
        let message = "part=0 width=256 height=256 tileposx=0,3840 tileposy=0 \
                       tilewidth=3840 tileheight=3840";
        assert_eq!(
            TileCombined::parse(&tokenize(message)),
            Err(TileError::CountMismatch { xs: 2, ys: 1 })
        );
    }

    #[test]
    fn test_combined_rejects_off_grid() {
        let message = "part=0 width=256 height=256 tileposx=0,1000 tileposy=0,0 \
                       tilewidth=3840 tileheight=3840";
        assert!(matches!(
            TileCombined::parse(&tokenize(message)),
            Err(TileError::Misaligned {
                axis: "x",
                position: 1000,
                ..
            })
        ));
    }

    #[test]
    fn test_combined_empty_batch() {
        let message = "part=0 width=256 height=256 tileposx= tileposy= \
                       tilewidth=3840 tileheight=3840";
        assert_eq!(
            TileCombined::parse(&tokenize(message)),
            Err(TileError::EmptyBatch)
        );
    }
}
