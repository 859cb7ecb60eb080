//! Code page utilities for thermal printers
//!
//! Receipt printers do not understand UTF-8. Text has to be converted to the
//! code page the printer is switched into. Two are supported:
//! - Windows-1252 (WPC1252, `ESC t 16`) for Latin menus
//! - GBK (`FS &` Chinese mode) for Chinese printers
//!
//! This module provides utilities for:
//! - Calculating printed string widths
//! - Truncating/padding strings to printed widths
//! - Converting UTF-8 to the code page while preserving ESC/POS commands

use std::borrow::Cow;
use std::str::FromStr;

use encoding_rs::{Encoding, GBK, WINDOWS_1252};
use tracing::instrument;

/// Printer text encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextEncoding {
    /// Windows-1252 (ESC t 16)
    #[default]
    Latin,
    /// GBK, double-byte for CJK characters
    Gbk,
}

impl TextEncoding {
    fn codec(self) -> &'static Encoding {
        match self {
            TextEncoding::Latin => WINDOWS_1252,
            TextEncoding::Gbk => GBK,
        }
    }

    /// Commands that switch the printer into this code page
    fn enter(self) -> &'static [u8] {
        match self {
            // ESC t 16 - Select WPC1252
            TextEncoding::Latin => &[0x1B, 0x74, 16],
            // FS & - Enable Chinese mode, FS C 1 - Select GBK
            TextEncoding::Gbk => &[0x1C, 0x26, 0x1C, 0x43, 0x01],
        }
    }

    /// Commands that leave the code page at the end of a job
    fn exit(self) -> &'static [u8] {
        match self {
            TextEncoding::Latin => &[],
            // FS . - Cancel Chinese mode
            TextEncoding::Gbk => &[0x1C, 0x2E],
        }
    }
}

impl FromStr for TextEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "latin" | "cp1252" | "windows-1252" => Ok(TextEncoding::Latin),
            "gbk" | "chinese" => Ok(TextEncoding::Gbk),
            other => Err(format!("unknown printer encoding: {other}")),
        }
    }
}

/// Encode a single character, replacing unmappable ones with '?'
///
/// encoding_rs would emit an HTML numeric reference for unmappable
/// characters, which is never what a receipt should show.
fn encode_char(c: char, encoding: TextEncoding) -> Cow<'static, [u8]> {
    let mut tmp = [0u8; 4];
    let s = c.encode_utf8(&mut tmp);
    let (bytes, _, had_errors) = encoding.codec().encode(s);
    if had_errors {
        Cow::Borrowed(b"?")
    } else {
        Cow::Owned(bytes.into_owned())
    }
}

/// Get the printed width of a string (one column per encoded byte)
pub fn text_width(s: &str, encoding: TextEncoding) -> usize {
    s.chars().map(|c| encode_char(c, encoding).len()).sum()
}

/// Truncate a string to fit within a printed width
pub fn truncate_to_width(s: &str, max_width: usize, encoding: TextEncoding) -> String {
    let mut width = 0;
    let mut result = String::new();
    for c in s.chars() {
        let char_len = encode_char(c, encoding).len();
        if width + char_len > max_width {
            break;
        }
        result.push(c);
        width += char_len;
    }
    result
}

/// Pad a string to a specific printed width
///
/// If the string is longer than the width, it will be truncated.
pub fn pad_to_width(s: &str, width: usize, align_right: bool, encoding: TextEncoding) -> String {
    let current_width = text_width(s, encoding);
    if current_width >= width {
        return truncate_to_width(s, width, encoding);
    }
    let spaces = width - current_width;
    if align_right {
        format!("{}{}", " ".repeat(spaces), s)
    } else {
        format!("{}{}", s, " ".repeat(spaces))
    }
}

/// Convert mixed UTF-8 content (with ESC/POS commands) to the printer code page
///
/// ASCII bytes (0x00-0x7F) are kept exactly as is, which protects ESC/POS
/// commands from being corrupted. Only bytes >= 0x80 are treated as UTF-8
/// sequences and converted.
///
/// The code page is selected at the start and re-selected after every
/// INIT command (ESC @), which resets the printer.
#[instrument(skip(bytes), fields(len = bytes.len()))]
pub fn encode_escpos(bytes: &[u8], encoding: TextEncoding) -> Vec<u8> {
    let mut result = Vec::with_capacity(bytes.len() * 2);
    result.extend_from_slice(encoding.enter());

    let mut buffer = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];

        if b == 0x1B && i + 1 < bytes.len() && bytes[i + 1] == 0x40 {
            flush_buffer(&mut buffer, &mut result, encoding);
            result.extend_from_slice(&[0x1B, 0x40]);
            result.extend_from_slice(encoding.enter());
            i += 2;
            continue;
        }

        if b < 128 {
            flush_buffer(&mut buffer, &mut result, encoding);
            result.push(b);
        } else {
            buffer.push(b);
        }
        i += 1;
    }

    flush_buffer(&mut buffer, &mut result, encoding);
    result.extend_from_slice(encoding.exit());

    result
}

/// Flush the non-ASCII buffer, converting UTF-8 to the target code page
fn flush_buffer(buffer: &mut Vec<u8>, result: &mut Vec<u8>, encoding: TextEncoding) {
    if buffer.is_empty() {
        return;
    }

    let s = String::from_utf8_lossy(buffer);
    for c in s.chars() {
        if c == '€' && encoding == TextEncoding::Gbk {
            // GBK has no euro sign: leave Chinese mode, print it from PC858, re-enter
            result.extend_from_slice(&[0x1C, 0x2E, 0x1B, 0x74, 19, 0xD5, 0x1C, 0x26]);
            continue;
        }
        result.extend_from_slice(&encode_char(c, encoding));
    }
    buffer.clear();
}
