//! Raw V4L2 buffer → RGB conversion (YUYV, RGB3, GREY, MJPG).

use image::{ImageFormat, RgbImage};

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("invalid {format} buffer length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("MJPG decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

fn check_len(format: &'static str, buf: &[u8], expected: usize) -> Result<(), ConversionError> {
    if buf.len() < expected {
        return Err(ConversionError::InvalidLength {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Convert packed YUYV (4:2:2) to RGB using BT.601 limited-range coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, ConversionError> {
    let pixels = (width * height) as usize;
    check_len("YUYV", yuyv, pixels * 2)?;

    let mut rgb = Vec::with_capacity(pixels * 3);
    for chunk in yuyv[..pixels * 2].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    // Odd widths leave a trailing half pair.
    rgb.resize(pixels * 3, 0);

    into_image("YUYV", width, height, rgb)
}

fn into_image(format: &'static str, width: u32, height: u32, rgb: Vec<u8>) -> Result<RgbImage, ConversionError> {
    let actual = rgb.len();
    RgbImage::from_raw(width, height, rgb).ok_or(ConversionError::InvalidLength {
        format,
        expected: (width * height * 3) as usize,
        actual,
    })
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (y as f32 - 16.0) * 1.164;
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;
    [
        (c + 1.596 * e).round().clamp(0.0, 255.0) as u8,
        (c - 0.392 * d - 0.813 * e).round().clamp(0.0, 255.0) as u8,
        (c + 2.017 * d).round().clamp(0.0, 255.0) as u8,
    ]
}

/// Replicate an 8-bit grey plane into three channels.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<RgbImage, ConversionError> {
    let pixels = (width * height) as usize;
    check_len("GREY", grey, pixels)?;
    let rgb = grey[..pixels].iter().flat_map(|&g| [g, g, g]).collect();
    into_image("GREY", width, height, rgb)
}

/// Packed 24-bit RGB, copied as-is.
pub fn rgb3_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, ConversionError> {
    let bytes = (width * height * 3) as usize;
    check_len("RGB3", buf, bytes)?;
    into_image("RGB3", width, height, buf[..bytes].to_vec())
}

/// Decode a Motion-JPEG frame.
pub fn mjpg_to_rgb(buf: &[u8]) -> Result<RgbImage, ConversionError> {
    Ok(image::load_from_memory_with_format(buf, ImageFormat::Jpeg)?.to_rgb8())
}
