//! ISO-8601 duration parsing for the `contentDetails.duration` field.

use crate::error::{MirrorError, MirrorResult};

/// Duration the API omits for some uploads (still processing, live).
pub const ZERO_DURATION: &str = "PT0S";

/// Parses `P[nD][T[nH][nM][nS]]` into total seconds.
///
/// Only the day/time designators YouTube emits are accepted; weeks, months
/// and years have no fixed length in seconds and are rejected, as is any
/// component appearing twice or out of order. Fractional seconds are
/// truncated. Totals that do not fit in an `i64` are malformed.
pub fn parse_iso8601_duration(raw: &str) -> MirrorResult<i64> {
    let malformed = || MirrorError::MalformedDuration(raw.to_owned());
    let body = raw.trim().strip_prefix('P').ok_or_else(malformed)?;
    if body.is_empty() {
        return Err(malformed());
    }

    let (date_part, time_part) = match body.split_once('T') {
        Some((date, time)) => {
            if time.is_empty() {
                return Err(malformed());
            }
            (date, Some(time))
        }
        None => (body, None),
    };

    let mut total: i64 = 0;
    if !date_part.is_empty() {
        let days = date_part.strip_suffix('D').ok_or_else(malformed)?;
        total = parse_component(days)
            .and_then(|days| days.checked_mul(86_400))
            .ok_or_else(malformed)?;
    }

    if let Some(time) = time_part {
        // Designators must appear in H, M, S order, each at most once.
        let mut rank = 0;
        let mut number = String::new();
        for ch in time.chars() {
            if ch.is_ascii_digit() || ch == '.' {
                number.push(ch);
                continue;
            }
            let (next_rank, unit) = match ch {
                'H' => (1, 3_600),
                'M' => (2, 60),
                'S' => (3, 1),
                _ => return Err(malformed()),
            };
            if next_rank <= rank || number.is_empty() {
                return Err(malformed());
            }
            let value = if unit == 1 {
                parse_seconds(&number).ok_or_else(malformed)?
            } else {
                parse_component(&number).ok_or_else(malformed)?
            };
            total = value
                .checked_mul(unit)
                .and_then(|seconds| total.checked_add(seconds))
                .ok_or_else(malformed)?;
            rank = next_rank;
            number.clear();
        }
        if !number.is_empty() {
            return Err(malformed());
        }
    }

    Ok(total)
}

fn parse_component(value: &str) -> Option<i64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

fn parse_seconds(value: &str) -> Option<i64> {
    match value.split_once('.') {
        Some((whole, fraction)) => {
            if fraction.is_empty() || !fraction.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            parse_component(whole)
        }
        None => parse_component(value),
    }
}
