// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Control sequences for the two supported printer command languages.
//
// ESC/POS (Epson and clones) and StarPRNT (Star Micronics) share `ESC @`
// but diverge on almost everything else: Star uses `ESC E`/`ESC F` for
// emphasis, `ESC GS a` for alignment and `ESC d` for cutting, while ESC/POS
// uses `ESC E n`, `ESC a n` and `GS V`.

use tillprint_core::types::PrinterProtocol;

pub const ESC: u8 = 0x1B;
pub const GS: u8 = 0x1D;
pub const LF: u8 = 0x0A;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left = 0,
    Center = 1,
    Right = 2,
}

/// Command generator for one printer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commands(pub PrinterProtocol);

impl Commands {
    /// Reset to power-on defaults and select code page 437.
    pub fn init(&self) -> Vec<u8> {
        match self.0 {
            // ESC @, ESC t 0
            PrinterProtocol::EscPos => vec![ESC, b'@', ESC, b't', 0],
            // ESC @, ESC GS t 1
            PrinterProtocol::StarPrnt => vec![ESC, b'@', ESC, GS, b't', 1],
        }
    }

    pub fn bold(&self, on: bool) -> Vec<u8> {
        match self.0 {
            PrinterProtocol::EscPos => vec![ESC, b'E', u8::from(on)],
            PrinterProtocol::StarPrnt if on => vec![ESC, b'E'],
            PrinterProtocol::StarPrnt => vec![ESC, b'F'],
        }
    }

    pub fn align(&self, align: Align) -> Vec<u8> {
        match self.0 {
            PrinterProtocol::EscPos => vec![ESC, b'a', align as u8],
            PrinterProtocol::StarPrnt => vec![ESC, GS, b'a', align as u8],
        }
    }

    /// Advance `lines` blank lines.
    pub fn feed(&self, lines: u8) -> Vec<u8> {
        match self.0 {
            // ESC d n
            PrinterProtocol::EscPos => vec![ESC, b'd', lines],
            // ESC a n
            PrinterProtocol::StarPrnt => vec![ESC, b'a', lines],
        }
    }

    /// Feed to the cutter and partial-cut.
    pub fn cut(&self) -> Vec<u8> {
        match self.0 {
            // GS V 66 0
            PrinterProtocol::EscPos => vec![GS, b'V', 66, 0],
            // ESC d 3
            PrinterProtocol::StarPrnt => vec![ESC, b'd', 3],
        }
    }
}
