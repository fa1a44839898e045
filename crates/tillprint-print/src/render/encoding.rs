// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Text to printer bytes.
//
// Receipt text never reaches the printer as control bytes: anything below
// 0x20 (and DEL) would be read as a command, so it is replaced or refused
// like any other character the code page lacks.

use tillprint_core::config::TextEncoding;

use super::RenderError;

/// Encode one line of receipt text.
///
/// `Cp437` substitutes `?` for characters the code page lacks; `Ascii`
/// refuses them.
pub fn encode(text: &str, encoding: TextEncoding) -> Result<Vec<u8>, RenderError> {
    let mut out = Vec::with_capacity(text.len());
    for ch in text.chars() {
        let byte = match (printable_ascii(ch), encoding) {
            (Some(byte), _) => byte,
            (None, TextEncoding::Cp437) => cp437(ch).unwrap_or(b'?'),
            (None, TextEncoding::Ascii) => return Err(RenderError::Unencodable { ch }),
        };
        out.push(byte);
    }
    Ok(out)
}

fn printable_ascii(ch: char) -> Option<u8> {
    match ch {
        ' '..='~' => Some(ch as u8),
        _ => None,
    }
}

/// Upper half of code page 437, restricted to the letters, currency signs
/// and punctuation that show up on receipts.
fn cp437(ch: char) -> Option<u8> {
    let byte = match ch {
        'Ç' => 0x80,
        'ü' => 0x81,
        'é' => 0x82,
        'â' => 0x83,
        'ä' => 0x84,
        'à' => 0x85,
        'å' => 0x86,
        'ç' => 0x87,
        'ê' => 0x88,
        'ë' => 0x89,
        'è' => 0x8A,
        'ï' => 0x8B,
        'î' => 0x8C,
        'ì' => 0x8D,
        'Ä' => 0x8E,
        'Å' => 0x8F,
        'É' => 0x90,
        'æ' => 0x91,
        'Æ' => 0x92,
        'ô' => 0x93,
        'ö' => 0x94,
        'ò' => 0x95,
        'û' => 0x96,
        'ù' => 0x97,
        'ÿ' => 0x98,
        'Ö' => 0x99,
        'Ü' => 0x9A,
        '¢' => 0x9B,
        '£' => 0x9C,
        '¥' => 0x9D,
        'á' => 0xA0,
        'í' => 0xA1,
        'ó' => 0xA2,
        'ú' => 0xA3,
        'ñ' => 0xA4,
        'Ñ' => 0xA5,
        'ª' => 0xA6,
        'º' => 0xA7,
        '¿' => 0xA8,
        '½' => 0xAB,
        '¼' => 0xAC,
        '¡' => 0xAD,
        '«' => 0xAE,
        '»' => 0xAF,
        'ß' => 0xE1,
        'µ' => 0xE6,
        '±' => 0xF1,
        '°' => 0xF8,
        '·' => 0xFA,
        '²' => 0xFD,
        _ => return None,
    };
    Some(byte)
}
