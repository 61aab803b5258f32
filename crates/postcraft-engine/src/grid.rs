use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView};
use postcraft_contracts::session::GridLayout;

pub const PANEL_JPEG_QUALITY: u8 = 90;

/// What happens to the pixels left over when the image size is not an exact
/// multiple of the grid shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RemainderPolicy {
    /// Every panel is `floor(W/cols) x floor(H/rows)`; the trailing strip is discarded.
    #[default]
    Drop,
    /// The last column and last row extend to the image boundary.
    StretchLast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Crop boxes in row-major reading order.
pub fn panel_rects(
    width: u32,
    height: u32,
    rows: u32,
    cols: u32,
    policy: RemainderPolicy,
) -> Result<Vec<PanelRect>> {
    if rows == 0 || cols == 0 {
        bail!("grid must have at least one row and one column (got {rows}x{cols})");
    }
    let panel_width = width / cols;
    let panel_height = height / rows;
    if panel_width == 0 || panel_height == 0 {
        bail!("image {width}x{height} is too small for a {rows}x{cols} grid");
    }

    let mut rects = Vec::with_capacity((rows * cols) as usize);
    for row in 0..rows {
        for col in 0..cols {
            let x = col * panel_width;
            let y = row * panel_height;
            let (w, h) = match policy {
                RemainderPolicy::Drop => (panel_width, panel_height),
                RemainderPolicy::StretchLast => (
                    if col + 1 == cols { width - x } else { panel_width },
                    if row + 1 == rows { height - y } else { panel_height },
                ),
            };
            rects.push(PanelRect {
                x,
                y,
                width: w,
                height: h,
            });
        }
    }
    Ok(rects)
}

pub fn split_grid(image_bytes: &[u8], rows: u32, cols: u32) -> Result<Vec<Vec<u8>>> {
    split_grid_with(image_bytes, rows, cols, RemainderPolicy::Drop)
}

pub fn split_layout(image_bytes: &[u8], layout: GridLayout) -> Result<Vec<Vec<u8>>> {
    split_grid(image_bytes, layout.rows(), layout.cols())
}

/// Splits a composite into `rows*cols` JPEG panels. Any decode or encode
/// failure fails the whole call.
pub fn split_grid_with(
    image_bytes: &[u8],
    rows: u32,
    cols: u32,
    policy: RemainderPolicy,
) -> Result<Vec<Vec<u8>>> {
    let image = image::load_from_memory(image_bytes).context("failed to decode composite image")?;
    let (width, height) = image.dimensions();
    let rects = panel_rects(width, height, rows, cols, policy)?;

    let mut panels = Vec::with_capacity(rects.len());
    for (idx, rect) in rects.iter().enumerate() {
        let panel = image
            .crop_imm(rect.x, rect.y, rect.width, rect.height)
            .to_rgb8();
        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut bytes, PANEL_JPEG_QUALITY)
            .encode_image(&DynamicImage::ImageRgb8(panel))
            .with_context(|| format!("failed to encode panel {}", idx + 1))?;
        panels.push(bytes);
    }
    tracing::debug!(rows, cols, panels = panels.len(), "split composite grid");
    Ok(panels)
}
