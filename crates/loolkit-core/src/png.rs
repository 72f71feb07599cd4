//! PNG encoding of engine pixmaps.
//!
//! The engine paints 32-bit pixels in either RGBA or BGRA order; replies
//! always carry RGBA PNGs. Combined renders paint one mosaic pixmap and
//! encode each tile from a sub-rectangle of it.

/// Pixel channel order of an engine pixmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileMode {
    /// Red, green, blue, alpha.
    Rgba,
    /// Blue, green, red, alpha; swizzled during encoding.
    Bgra,
}

impl TileMode {
    /// Maps the engine's numeric tile mode; unknown values fall back to
    /// RGBA.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Self {
        match raw {
            1 => Self::Bgra,
            _ => Self::Rgba,
        }
    }
}

/// Errors from pixmap encoding.
#[derive(Debug, thiserror::Error)]
pub enum PngError {
    /// The requested region does not fit inside the pixmap.
    #[error(
        "region {width}x{height}+{off_x}+{off_y} outside pixmap of {stride}x{rows} pixels"
    )]
    Region {
        /// Region width in pixels.
        width: u32,
        /// Region height in pixels.
        height: u32,
        /// Region left offset in pixels.
        off_x: u32,
        /// Region top offset in pixels.
        off_y: u32,
        /// Pixmap row pitch in pixels.
        stride: u32,
        /// Pixmap row count.
        rows: u32,
    },

    /// The PNG encoder failed.
    #[error("png encoding failed: {0}")]
    Encode(#[from] ::png::EncodingError),
}

/// Encodes a whole `width`x`height` pixmap, appending the PNG to `out`.
///
/// # Errors
///
/// Returns [`PngError`] when the pixmap is too small for the stated
/// dimensions or the encoder fails.
pub fn encode_buffer(
    pixmap: &[u8],
    width: u32,
    height: u32,
    mode: TileMode,
    out: &mut Vec<u8>,
) -> Result<(), PngError> {
    encode_sub_buffer(pixmap, width, 0, 0, width, height, mode, out)
}

/// Encodes the `width`x`height` region at `(off_x, off_y)` of a pixmap
/// whose rows are `stride` pixels wide, appending the PNG to `out`.
///
/// # Errors
///
/// Returns [`PngError`] when the region falls outside the pixmap or the
/// encoder fails.
#[allow(clippy::too_many_arguments)]
pub fn encode_sub_buffer(
    pixmap: &[u8],
    stride: u32,
    off_x: u32,
    off_y: u32,
    width: u32,
    height: u32,
    mode: TileMode,
    out: &mut Vec<u8>,
) -> Result<(), PngError> {
    let rows = if stride == 0 {
        0
    } else {
        (pixmap.len() / 4 / stride as usize) as u32
    };
    let fits = width > 0
        && height > 0
        && off_x.checked_add(width).is_some_and(|right| right <= stride)
        && off_y.checked_add(height).is_some_and(|bottom| bottom <= rows);
    if !fits {
        return Err(PngError::Region {
            width,
            height,
            off_x,
            off_y,
            stride,
            rows,
        });
    }

    let mut region = Vec::with_capacity(width as usize * height as usize * 4);
    for row in 0..height as usize {
        let start = ((off_y as usize + row) * stride as usize + off_x as usize) * 4;
        let line = &pixmap[start..start + width as usize * 4];
        match mode {
            TileMode::Rgba => region.extend_from_slice(line),
            TileMode::Bgra => {
                for pixel in line.chunks_exact(4) {
                    region.extend_from_slice(&[pixel[2], pixel[1], pixel[0], pixel[3]]);
                }
            }
        }
    }

    let mut encoder = ::png::Encoder::new(&mut *out, width, height);
    encoder.set_color(::png::ColorType::Rgba);
    encoder.set_depth(::png::BitDepth::Eight);
    let mut writer = encoder.write_header()?;
    writer.write_image_data(&region)?;
    writer.finish()?;
    Ok(())
}
