//! Small shared helpers: wall-clock timestamps, rounding, dependency-free
//! randomness, and HTML entity unescaping for policy replies.

use chrono::Utc;

/// Current wall-clock time as unix seconds with sub-second precision.
///
/// Event payloads carry unix floats on the wire, matching what the worker
/// cohort and dashboard overlays expect.
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Round to two decimal places for latency fields in outbound payloads.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Pseudo-random value in `[0, 1)`.
///
/// Uses RandomState to get a random value without adding a dependency;
/// good enough for dashboard jitter and initial latency seeding.
pub fn rand_unit() -> f64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let raw = RandomState::new().build_hasher().finish();
    (raw >> 11) as f64 / (1u64 << 53) as f64
}

/// Pseudo-random value in `[lo, hi)`.
pub fn rand_range(lo: f64, hi: f64) -> f64 {
    lo + rand_unit() * (hi - lo)
}

/// Truncate a string to at most `max_chars` characters, respecting
/// character boundaries.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Decode the HTML entities that show up in policy worker replies.
///
/// Handles the common named entities (`&amp;` `&lt;` `&gt;` `&quot;`
/// `&apos;`) plus decimal and hex numeric references. Unknown entities are
/// passed through verbatim.
pub fn unescape_html(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];

        let Some(end) = rest.find(';') else {
            // No terminating semicolon anywhere; nothing left to decode.
            out.push_str(rest);
            return out;
        };
        let entity = &rest[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix('#')
                .and_then(|num| {
                    if let Some(hex) = num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
                        u32::from_str_radix(hex, 16).ok()
                    } else {
                        num.parse::<u32>().ok()
                    }
                })
                .and_then(char::from_u32),
        };
        match decoded {
            Some(ch) => {
                out.push(ch);
                rest = &rest[end + 1..];
            }
            None => {
                // Not a recognised entity; emit the ampersand and move on.
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
