//! # ticket-printer
//!
//! ESC/POS thermal printer library - low-level printing capabilities only.
//!
//! ## Scope
//!
//! This crate handles HOW to print:
//! - ESC/POS command building
//! - Code page conversion (Windows-1252 / GBK)
//! - Network printing (TCP port 9100)
//! - Windows driver printing
//! - Console / file output for running without hardware
//! - Logo rasterisation (feature `image`)
//!
//! WHAT to print (kitchen ticket layout) lives in `order-bridge`.
//!
//! ## Example
//!
//! ```ignore
//! use ticket_printer::{EscPosBuilder, NetworkPrinter, Printer, TextEncoding};
//!
//! let mut builder = EscPosBuilder::new(TextEncoding::Latin);
//! builder.center().double_size().line("KITCHEN").reset_size().left();
//! builder.line("Burger x1");
//! builder.cut_feed(4);
//!
//! let printer = NetworkPrinter::from_addr("192.168.1.100:9100")?;
//! printer.print(&builder.build()).await?;
//! ```

mod encoding;
mod error;
mod escpos;
mod printer;

// Re-exports
pub use encoding::{TextEncoding, encode_escpos, pad_to_width, text_width, truncate_to_width};
pub use error::{PrintError, PrintResult};
pub use escpos::EscPosBuilder;
pub use printer::{AnyPrinter, ConsolePrinter, DEFAULT_PORT, FilePrinter, NetworkPrinter, Printer};

#[cfg(feature = "image")]
pub use escpos::process_logo;

#[cfg(windows)]
pub use printer::WindowsPrinter;
