//! Kitchen ticket formatter
//!
//! Turns an [`Order`] into a [`PrintJob`]: a list of fixed-width lines with
//! alignment and emphasis. The job renders to plain text for mock sinks and
//! to ESC/POS bytes for real printers. Formatting never looks at the clock,
//! so the same order always produces the same job.

use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ticket_printer::{EscPosBuilder, TextEncoding, pad_to_width, text_width, truncate_to_width};

use crate::order::{LineItem, Order};
use crate::tracker::{DeliveryKey, TicketKind};

const CURRENCY: &str = "$";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Align {
    Left,
    Center,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emphasis {
    Normal,
    Bold,
    /// Double height
    Tall,
    /// Double width and height, bold
    Large,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketLine {
    pub text: String,
    pub align: Align,
    pub emphasis: Emphasis,
}

/// A formatted ticket, ready for a sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintJob {
    pub key: DeliveryKey,
    pub width: usize,
    pub lines: Vec<TicketLine>,
}

impl PrintJob {
    pub fn order_id(&self) -> &str {
        &self.key.order_id
    }

    /// Fixed-width text, one ticket line per text line
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line.align {
                Align::Left => out.push_str(line.text.trim_end()),
                Align::Center => {
                    let len = line.text.chars().count();
                    let pad = self.width.saturating_sub(len) / 2;
                    out.push_str(&" ".repeat(pad));
                    out.push_str(&line.text);
                }
            }
            out.push('\n');
        }
        out
    }

    /// Printer bytes: code page conversion, styles, feed and cut
    pub fn to_escpos(&self, encoding: TextEncoding, logo: Option<&[u8]>) -> Vec<u8> {
        let mut b = EscPosBuilder::new(encoding);

        for line in &self.lines {
            match line.align {
                Align::Left => b.left(),
                Align::Center => b.center(),
            };
            match line.emphasis {
                Emphasis::Normal => {}
                Emphasis::Bold => {
                    b.bold();
                }
                Emphasis::Tall => {
                    b.double_height();
                }
                Emphasis::Large => {
                    b.double_size().bold();
                }
            }
            b.line(&line.text);
            if line.emphasis != Emphasis::Normal {
                b.bold_off().reset_size();
            }
        }

        b.left().feed(3).cut_feed(0);

        match logo {
            Some(raster) if !raster.is_empty() => b.build_with_raster(raster),
            _ => b.build(),
        }
    }
}

/// Kitchen ticket formatter
///
/// Common widths:
/// - 58mm paper: 32 characters
/// - 80mm paper: 48 characters
#[derive(Debug, Clone)]
pub struct TicketFormatter {
    width: usize,
    encoding: TextEncoding,
    title: String,
    timezone: Tz,
}

impl TicketFormatter {
    pub fn new(width: usize, encoding: TextEncoding, title: impl Into<String>, timezone: Tz) -> Self {
        Self {
            width: width.max(16),
            encoding,
            title: title.into(),
            timezone,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Format `order` as a ticket of the given kind
    pub fn format(&self, order: &Order, kind: TicketKind) -> PrintJob {
        let hash = match kind {
            TicketKind::Void => String::new(),
            _ => order.content_hash(),
        };
        let mut lines = Vec::new();

        self.render_header(&mut lines, order, kind);
        self.render_details(&mut lines, order);
        self.render_items(&mut lines, &order.items);
        self.render_footer(&mut lines, order, kind, &hash);

        PrintJob {
            key: DeliveryKey::new(&order.order_id, kind, hash),
            width: self.width,
            lines,
        }
    }

    fn render_header(&self, lines: &mut Vec<TicketLine>, order: &Order, kind: TicketKind) {
        // Double size halves the characters per line
        let title = truncate_to_width(&self.title, self.width / 2, self.encoding);
        lines.push(self.line(title, Align::Center, Emphasis::Large));

        let banner = match kind {
            TicketKind::New => "NEW ORDER",
            TicketKind::Update => "UPDATED ORDER",
            TicketKind::Void => "*** VOID ***",
        };
        lines.push(self.line(banner, Align::Center, Emphasis::Bold));
        lines.push(self.separator('='));

        let id = format!("Order #{}", short_id(&order.order_id));
        lines.push(self.line(id, Align::Left, Emphasis::Bold));

        let time = order
            .ticket_time()
            .with_timezone(&self.timezone)
            .format(TIME_FORMAT);
        lines.push(self.line(format!("Time: {}", time), Align::Left, Emphasis::Normal));
    }

    fn render_details(&self, lines: &mut Vec<TicketLine>, order: &Order) {
        let d = &order.details;
        let fields = [
            ("Customer", &d.customer_name),
            ("Phone", &d.customer_phone),
            ("Location", &d.location),
            ("Payment", &d.payment_method),
        ];
        for (label, value) in fields {
            if let Some(value) = value {
                lines.push(self.line(format!("{}: {}", label, value), Align::Left, Emphasis::Normal));
            }
        }
    }

    fn render_items(&self, lines: &mut Vec<TicketLine>, items: &[LineItem]) {
        if items.is_empty() {
            return;
        }
        lines.push(self.separator('-'));

        for item in items {
            let left = format!("{} x{}", item.name, item.quantity);
            let right = item.line_total().map(money).unwrap_or_default();
            lines.push(TicketLine {
                text: self.columns(&left, &right),
                align: Align::Left,
                emphasis: Emphasis::Tall,
            });
            for note in &item.notes {
                lines.push(self.line(format!("   + {}", note), Align::Left, Emphasis::Normal));
            }
        }
    }

    fn render_footer(&self, lines: &mut Vec<TicketLine>, order: &Order, kind: TicketKind, hash: &str) {
        lines.push(self.separator('-'));

        if let Some(total) = order.details.total {
            lines.push(TicketLine {
                text: self.columns("TOTAL", &money(total)),
                align: Align::Left,
                emphasis: Emphasis::Bold,
            });
        }
        if let Some(notes) = &order.details.notes {
            lines.push(self.line(format!("NOTES: {}", notes), Align::Left, Emphasis::Bold));
        }
        if kind == TicketKind::Void {
            lines.push(self.line("CANCELLED - DO NOT PREPARE", Align::Center, Emphasis::Bold));
        }
        if !hash.is_empty() {
            lines.push(self.line(format!("ref {}", hash), Align::Center, Emphasis::Normal));
        }
    }

    fn line(&self, text: impl AsRef<str>, align: Align, emphasis: Emphasis) -> TicketLine {
        TicketLine {
            text: truncate_to_width(&printable(text.as_ref()), self.width, self.encoding),
            align,
            emphasis,
        }
    }

    fn separator(&self, c: char) -> TicketLine {
        TicketLine {
            text: c.to_string().repeat(self.width),
            align: Align::Left,
            emphasis: Emphasis::Normal,
        }
    }

    /// `left` padded (or truncated) so that `right` ends at the last column
    fn columns(&self, left: &str, right: &str) -> String {
        let (left, right) = (printable(left), printable(right));
        let (left, right) = (left.as_str(), right.as_str());
        let right_width = text_width(right, self.encoding);
        if right_width == 0 {
            return truncate_to_width(left, self.width, self.encoding);
        }
        let left_width = self.width.saturating_sub(right_width + 1);
        format!(
            "{} {}",
            pad_to_width(left, left_width, false, self.encoding),
            right
        )
    }
}

impl Default for TicketFormatter {
    fn default() -> Self {
        Self::new(48, TextEncoding::Latin, "KITCHEN TICKET", Tz::UTC)
    }
}

/// Last 8 characters of the order id
fn short_id(id: &str) -> &str {
    match id.char_indices().rev().nth(7) {
        Some((idx, _)) => &id[idx..],
        None => id,
    }
}

/// Row text minus control characters, which the printer would execute
fn printable(text: &str) -> String {
    text.chars().filter(|c| !c.is_control()).collect()
}

fn money(amount: Decimal) -> String {
    format!("{}{:.2}", CURRENCY, amount)
}
