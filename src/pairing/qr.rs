//! Pairing payload to base64 PNG.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::{DynamicImage, ImageBuffer, ImageFormat, Luma};
use qrcode::{Color, EcLevel, QrCode};

use crate::error::GatewayError;
use crate::Result;

/// Light modules around the symbol.
const QUIET_ZONE: u32 = 4;

/// Minimum edge length of the rendered image in pixels.
const MIN_SIZE: u32 = 256;

/// Render `payload` as a QR code PNG and base64-encode it.
pub fn render_base64_png(payload: &str) -> Result<String> {
    let png = render_png(payload)?;
    Ok(STANDARD.encode(png))
}

/// Render `payload` as a QR code PNG.
pub fn render_png(payload: &str) -> Result<Vec<u8>> {
    let code = QrCode::with_error_correction_level(payload.as_bytes(), EcLevel::M)
        .map_err(|e| GatewayError::Qr(e.to_string()))?;

    let width = code.width() as u32;
    let colors = code.to_colors();
    let modules = width + 2 * QUIET_ZONE;
    let scale = MIN_SIZE.div_ceil(modules).max(1);
    let size = modules * scale;

    let image = ImageBuffer::from_fn(size, size, |x, y| {
        let mx = x / scale;
        let my = y / scale;
        let dark = mx >= QUIET_ZONE
            && my >= QUIET_ZONE
            && mx < QUIET_ZONE + width
            && my < QUIET_ZONE + width
            && colors[((my - QUIET_ZONE) * width + (mx - QUIET_ZONE)) as usize] == Color::Dark;
        Luma([if dark { 0u8 } else { 255u8 }])
    });

    let mut bytes = Vec::new();
    DynamicImage::ImageLuma8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|e| GatewayError::Qr(e.to_string()))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

    #[test]
    fn test_renders_png() {
        let png = render_png("2@abc,def,ghi").unwrap();
        assert!(png.starts_with(PNG_MAGIC));
    }

    #[test]
    fn test_base64_decodes_to_png() {
        let encoded = render_base64_png("2@abc,def,ghi").unwrap();
        let decoded = STANDARD.decode(encoded).unwrap();
        assert!(decoded.starts_with(PNG_MAGIC));
    }

    #[test]
    fn test_image_is_at_least_min_size() {
        let png = render_png("x").unwrap();
        let img = image::load_from_memory_with_format(&png, ImageFormat::Png).unwrap();
        assert!(img.width() >= MIN_SIZE);
        assert_eq!(img.width(), img.height());
    }

    #[test]
    fn test_oversized_payload_is_error() {
        let payload = "x".repeat(5000);
        assert!(matches!(render_png(&payload), Err(GatewayError::Qr(_))));
    }
}
