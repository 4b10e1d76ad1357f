//! Decoding of JSON payloads that kernels return as printed string values.
//!
//! The inspection scripts return JSON as a string object, so an IPython
//! kernel's `text/plain` repr looks like `'[{"varName": "x", ...}]'`: the JSON
//! is wrapped in quotes with repr escapes applied. Kernels that print the JSON
//! unquoted (IRkernel renders `jsonlite` output as-is) pass through untouched.

use serde::de::DeserializeOwned;

use crate::error::DecodeError;

/// Strip a leading string quote and undo repr escaping.
///
/// Text that does not start with `'` or `"` is returned unchanged.
pub fn unwrap_text(raw: &str) -> Result<String, DecodeError> {
    let trimmed = raw.trim();
    let Some(quote) = trimmed.chars().next().filter(|c| *c == '\'' || *c == '"') else {
        return Ok(trimmed.to_string());
    };

    let body = &trimmed[1..];
    let body = body.strip_suffix(quote).unwrap_or(body);
    unescape(body)
}

/// Decode a quoted or bare JSON reply into `T`.
pub fn decode_json<T: DeserializeOwned>(raw: &str) -> Result<T, DecodeError> {
    let text = unwrap_text(raw)?;
    Ok(serde_json::from_str(&text)?)
}

fn unescape(body: &str) -> Result<String, DecodeError> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.char_indices();

    while let Some((pos, c)) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some((_, escaped)) = chars.next() else {
            return Err(DecodeError::InvalidEscape(pos));
        };
        match escaped {
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '0' => out.push('\0'),
            'x' => out.push(hex_char(&mut chars, 2, pos)?),
            'u' => out.push(hex_char(&mut chars, 4, pos)?),
            'U' => out.push(hex_char(&mut chars, 8, pos)?),
            other => {
                // Not a repr escape; keep it literally.
                out.push('\\');
                out.push(other);
            }
        }
    }

    Ok(out)
}

fn hex_char(
    chars: &mut std::str::CharIndices<'_>,
    digits: usize,
    pos: usize,
) -> Result<char, DecodeError> {
    let hex: String = chars.by_ref().take(digits).map(|(_, c)| c).collect();
    if hex.len() != digits {
        return Err(DecodeError::InvalidEscape(pos));
    }
    u32::from_str_radix(&hex, 16)
        .ok()
        .and_then(char::from_u32)
        .ok_or(DecodeError::InvalidEscape(pos))
}
