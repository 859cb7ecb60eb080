//! ESC/POS command builder
//!
//! Provides a fluent API for building ESC/POS print data.

use crate::encoding::{TextEncoding, encode_escpos};

/// ESC/POS command builder
///
/// Builds ESC/POS byte sequences for thermal printers. Text is written as
/// UTF-8 and converted to the printer code page in [`EscPosBuilder::build`].
pub struct EscPosBuilder {
    buf: Vec<u8>,
    encoding: TextEncoding,
}

impl EscPosBuilder {
    /// Create a new builder that encodes text with `encoding`
    pub fn new(encoding: TextEncoding) -> Self {
        let mut buf = Vec::with_capacity(2048);
        // Initialize printer (ESC @)
        buf.extend_from_slice(&[0x1B, 0x40]);
        Self { buf, encoding }
    }

    // === Text Output ===

    /// Write raw text
    pub fn text(&mut self, s: &str) -> &mut Self {
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    /// Write text followed by newline
    pub fn line(&mut self, s: &str) -> &mut Self {
        self.text(s);
        self.buf.push(b'\n');
        self
    }

    /// Write empty line
    pub fn newline(&mut self) -> &mut Self {
        self.buf.push(b'\n');
        self
    }

    /// Print and feed n lines (ESC d n)
    pub fn feed(&mut self, lines: u8) -> &mut Self {
        self.buf.extend_from_slice(&[0x1B, 0x64, lines]);
        self
    }

    // === Alignment ===

    pub fn center(&mut self) -> &mut Self {
        self.buf.extend_from_slice(&[0x1B, 0x61, 0x01]);
        self
    }

    pub fn left(&mut self) -> &mut Self {
        self.buf.extend_from_slice(&[0x1B, 0x61, 0x00]);
        self
    }

    pub fn right(&mut self) -> &mut Self {
        self.buf.extend_from_slice(&[0x1B, 0x61, 0x02]);
        self
    }

    // === Text Style ===

    pub fn bold(&mut self) -> &mut Self {
        self.buf.extend_from_slice(&[0x1B, 0x45, 0x01]);
        self
    }

    pub fn bold_off(&mut self) -> &mut Self {
        self.buf.extend_from_slice(&[0x1B, 0x45, 0x00]);
        self
    }

    /// Double width and height
    pub fn double_size(&mut self) -> &mut Self {
        self.buf.extend_from_slice(&[0x1D, 0x21, 0x11]);
        self
    }

    /// Double height only
    pub fn double_height(&mut self) -> &mut Self {
        self.buf.extend_from_slice(&[0x1D, 0x21, 0x01]);
        self
    }

    /// Reset to normal size
    pub fn reset_size(&mut self) -> &mut Self {
        self.buf.extend_from_slice(&[0x1D, 0x21, 0x00]);
        self
    }

    // === Paper Control ===

    /// Full cut with feed: GS V 66 n
    ///
    /// Lets the printer manage the cutter-to-head distance, so the next
    /// ticket starts without a large top margin.
    pub fn cut_feed(&mut self, lines: u8) -> &mut Self {
        self.buf.extend_from_slice(&[0x1D, 0x56, 0x42, lines]);
        self
    }

    // === Raw Commands ===

    /// Write raw bytes directly (e.g. raster image data)
    ///
    /// Bytes >= 0x80 inside raw data would be re-encoded by `build`, so
    /// binary blobs must go through [`EscPosBuilder::build_with_raster`].
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    // === Build ===

    /// Build the final byte buffer, converting text to the printer code page
    pub fn build(self) -> Vec<u8> {
        encode_escpos(&self.buf, self.encoding)
    }

    /// Build with a binary raster block placed before the text content
    pub fn build_with_raster(self, raster: &[u8]) -> Vec<u8> {
        let body = encode_escpos(&self.buf, self.encoding);
        let mut out = Vec::with_capacity(raster.len() + body.len() + 2);
        // ESC @ first so the raster prints from a known state
        out.extend_from_slice(&[0x1B, 0x40]);
        out.extend_from_slice(raster);
        out.extend_from_slice(&body);
        out
    }

    /// Build without code page conversion (for debugging or ASCII-only content)
    pub fn build_raw(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for EscPosBuilder {
    fn default() -> Self {
        Self::new(TextEncoding::default())
    }
}

// ============================================================================
// Image Processing
// ============================================================================

/// Process an image file and return ESC/POS raster data
///
/// The image will be:
/// - Resized to fit `max_dots` (384 for 58mm, 576 for 80mm)
/// - Converted to 1-bit monochrome
/// - Encoded as GS v 0 raster graphics
#[cfg(feature = "image")]
#[tracing::instrument]
pub fn process_logo(path: &str, max_dots: u32) -> crate::PrintResult<Vec<u8>> {
    use image::GenericImageView;

    let img = image::open(path)
        .map_err(|e| crate::PrintError::InvalidConfig(format!("logo {path}: {e}")))?;
    let (w, h) = img.dimensions();
    tracing::info!(width = w, height = h, "logo image opened");

    let (new_w, new_h) = if w > max_dots {
        let ratio = max_dots as f64 / w as f64;
        (max_dots, ((h as f64 * ratio) as u32).max(1))
    } else {
        (w, h)
    };

    let resized = img.resize_exact(new_w, new_h, image::imageops::FilterType::Nearest);
    let rgba = resized.to_rgba8();
    let x_bytes = new_w.div_ceil(8);

    let mut data = Vec::with_capacity((x_bytes * new_h) as usize + 16);

    // Center align for image
    data.extend_from_slice(&[0x1B, 0x61, 0x01]);

    // GS v 0 m xL xH yL yH
    data.extend_from_slice(&[0x1D, 0x76, 0x30, 0x00]);
    data.push(x_bytes as u8);
    data.push((x_bytes >> 8) as u8);
    data.push(new_h as u8);
    data.push((new_h >> 8) as u8);

    for y in 0..new_h {
        for x_byte in 0..x_bytes {
            let mut byte = 0u8;
            for bit in 0..8 {
                let x = x_byte * 8 + bit;
                if x >= new_w {
                    continue;
                }
                let pixel = rgba.get_pixel(x, y);
                // Transparent pixels stay white
                if pixel[3] < 128 {
                    continue;
                }
                let luma = (0.299 * pixel[0] as f32
                    + 0.587 * pixel[1] as f32
                    + 0.114 * pixel[2] as f32) as u8;
                if luma < 128 {
                    byte |= 1 << (7 - bit);
                }
            }
            data.push(byte);
        }
    }

    // Newline after image, back to left alignment
    data.push(0x0A);
    data.extend_from_slice(&[0x1B, 0x61, 0x00]);

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_starts_with_init() {
        let b = EscPosBuilder::new(TextEncoding::Latin);
        assert_eq!(b.build_raw(), vec![0x1B, 0x40]);
    }

    #[test]
    fn test_builder_styles() {
        let mut b = EscPosBuilder::new(TextEncoding::Latin);
        b.center().double_size().line("TITLE").reset_size().left();

        let data = b.build_raw();
        let s = String::from_utf8_lossy(&data);
        assert!(s.contains("TITLE\n"));
        assert!(data.windows(3).any(|w| w == [0x1D, 0x21, 0x11]));
        assert!(data.windows(3).any(|w| w == [0x1B, 0x61, 0x01]));
    }

    #[test]
    fn test_cut_feed_is_last() {
        let mut b = EscPosBuilder::new(TextEncoding::Latin);
        b.line("x").cut_feed(4);
        let data = b.build();
        assert_eq!(&data[data.len() - 4..], &[0x1D, 0x56, 0x42, 4]);
    }

    #[test]
    fn test_build_with_raster_keeps_binary() {
        let mut b = EscPosBuilder::new(TextEncoding::Latin);
        b.line("ok");
        let raster = [0x1D, 0x76, 0x30, 0x00, 0xFF, 0x80];
        let data = b.build_with_raster(&raster);
        assert_eq!(&data[2..8], &raster);
    }

    #[cfg(feature = "image")]
    #[test]
    fn test_process_logo_missing_file() {
        assert!(process_logo("/nonexistent/logo.png", 384).is_err());
    }
}
