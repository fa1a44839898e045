// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Receipt rendering: structured payload to printer bytes.
//
// Rendering is a pure function of the payload and the printer profile, so a
// retry transmits exactly the bytes of the failed attempt.  Every error here
// is permanent: the same payload on the same printer will fail the same way.

pub mod commands;
pub mod encoding;

use thiserror::Error;

use tillprint_core::config::{MIN_COLUMNS, PrinterSettings, TextEncoding};
use tillprint_core::error::TillprintError;
use tillprint_core::types::{PrinterProtocol, PrinterTarget, ReceiptPayload};

use commands::{Align, Commands, LF};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("line width {columns} is below the minimum of {min} columns", min = MIN_COLUMNS)]
    ColumnsTooNarrow { columns: usize },

    #[error("amount overflow: {0}")]
    AmountOverflow(String),

    #[error("character {ch:?} cannot be encoded for this printer")]
    Unencodable { ch: char },
}

impl From<RenderError> for TillprintError {
    fn from(err: RenderError) -> Self {
        TillprintError::PermanentRender(err.to_string())
    }
}

/// How a particular printer wants its receipts laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrinterProfile {
    /// Characters per line.
    pub columns: usize,
    pub encoding: TextEncoding,
    pub protocol: PrinterProtocol,
    /// Cut the paper after the receipt.
    pub cut: bool,
    /// Blank lines fed before cutting.
    pub feed_lines: u8,
}

impl PrinterProfile {
    pub fn for_target(settings: &PrinterSettings, target: &PrinterTarget) -> Self {
        Self {
            columns: settings.columns,
            encoding: settings.encoding,
            protocol: target.protocol,
            cut: true,
            feed_lines: 3,
        }
    }
}

impl Default for PrinterProfile {
    fn default() -> Self {
        Self::for_target(
            &PrinterSettings::default(),
            &PrinterTarget::new("localhost", tillprint_core::DEFAULT_PRINTER_PORT, PrinterProtocol::EscPos),
        )
    }
}

/// Render `payload` into the byte stream for a printer matching `profile`.
pub fn render(payload: &ReceiptPayload, profile: &PrinterProfile) -> Result<Vec<u8>, RenderError> {
    if profile.columns < MIN_COLUMNS {
        return Err(RenderError::ColumnsTooNarrow {
            columns: profile.columns,
        });
    }

    let mut r = Receipt {
        out: Vec::with_capacity(1024),
        commands: Commands(profile.protocol),
        encoding: profile.encoding,
        width: profile.columns,
    };
    let c = r.commands;

    // Header
    r.cmd(c.init());
    r.cmd(c.align(Align::Center));
    r.cmd(c.bold(true));
    r.wrapped(&payload.merchant.name)?;
    r.cmd(c.bold(false));
    for line in &payload.merchant.address {
        r.wrapped(line)?;
    }
    if let Some(phone) = &payload.merchant.phone {
        r.wrapped(&format!("Tel: {phone}"))?;
    }
    if let Some(tax_id) = &payload.merchant.tax_id {
        r.wrapped(&format!("Tax ID: {tax_id}"))?;
    }
    r.cmd(c.align(Align::Left));
    r.line("")?;
    r.wrapped(&format!("Order: {}", payload.order_reference))?;
    if let Some(issued_at) = payload.issued_at {
        r.line(&issued_at.format("%Y-%m-%d %H:%M").to_string())?;
    }
    r.divider()?;

    // Items
    for item in &payload.items {
        let total = item.line_total().ok_or_else(|| {
            RenderError::AmountOverflow(format!("{} x {}", item.quantity, item.name))
        })?;
        r.row(&format!("{} x {}", item.quantity, item.name), &amount(total)?)?;
    }
    r.divider()?;

    // Totals
    r.row("Subtotal", &amount(payload.subtotal)?)?;
    for tax in &payload.taxes {
        r.row(&tax.label, &amount(tax.amount)?)?;
    }
    r.cmd(c.bold(true));
    r.row(
        "TOTAL",
        &format!("{} {}", payload.currency, amount(payload.total)?),
    )?;
    r.cmd(c.bold(false));
    if let Some(method) = &payload.payment_method {
        r.text_row("Paid by", method)?;
    }

    if let Some(footer) = &payload.footer {
        r.line("")?;
        r.cmd(c.align(Align::Center));
        r.wrapped(footer)?;
        r.cmd(c.align(Align::Left));
    }

    r.cmd(c.feed(profile.feed_lines));
    if profile.cut {
        r.cmd(c.cut());
    }
    Ok(r.out)
}

/// Format minor units as `123.45`.
fn amount(minor: i64) -> Result<String, RenderError> {
    let abs = minor
        .checked_abs()
        .ok_or_else(|| RenderError::AmountOverflow(minor.to_string()))?;
    let sign = if minor < 0 { "-" } else { "" };
    Ok(format!("{sign}{}.{:02}", abs / 100, abs % 100))
}

/// Output buffer for one receipt.
struct Receipt {
    out: Vec<u8>,
    commands: Commands,
    encoding: TextEncoding,
    width: usize,
}

impl Receipt {
    fn cmd(&mut self, bytes: Vec<u8>) {
        self.out.extend(bytes);
    }

    fn line(&mut self, text: &str) -> Result<(), RenderError> {
        self.out.extend(encoding::encode(text, self.encoding)?);
        self.out.push(LF);
        Ok(())
    }

    fn wrapped(&mut self, text: &str) -> Result<(), RenderError> {
        for line in wrap(text, self.width) {
            self.line(&line)?;
        }
        Ok(())
    }

    fn divider(&mut self) -> Result<(), RenderError> {
        self.line(&"-".repeat(self.width))
    }

    fn row(&mut self, left: &str, right: &str) -> Result<(), RenderError> {
        let line = row(left, right, self.width)?;
        self.line(&line)
    }

    /// Like `row`, but `right` is free text and is cut to fit.
    fn text_row(&mut self, left: &str, right: &str) -> Result<(), RenderError> {
        let right: String = right.chars().take(self.width.saturating_sub(2)).collect();
        self.row(left, &right)
    }
}

/// `left` and `right` on one line, left truncated to make room.
fn row(left: &str, right: &str, width: usize) -> Result<String, RenderError> {
    let right_len = right.chars().count();
    // Keep at least one character of the label plus a separating space.
    if right_len + 2 > width {
        return Err(RenderError::AmountOverflow(format!(
            "{right:?} does not fit in {width} columns"
        )));
    }
    let left: String = left.chars().take(width - right_len - 1).collect();
    let gap = width - right_len - left.chars().count();
    Ok(format!("{left}{}{right}", " ".repeat(gap)))
}

/// Greedy word wrap; words longer than `width` are split.
fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        while word.len() > width {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            let rest = word.split_off(width);
            lines.push(word.into_iter().collect());
            word = rest;
        }

        let used = current.chars().count();
        if used > 0 && used + 1 + word.len() > width {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.extend(word);
    }
    if !current.is_empty() || lines.is_empty() {
        lines.push(current);
    }
    lines
}
