// src/headers.rs
//
// Post-parsers for structured header values: byte ranges, Accept-style
// quality lists, and parameterised values (options, Content-Disposition).

use std::collections::HashMap;

use crate::error::{VersoError, VersoResult};
use crate::http;

/// Parses a `Range` header against a known content length into a sorted list
/// of closed, pairwise non-overlapping, non-adjacent intervals.
///
/// Returns `Ok(None)` when the range unit is not `bytes` (the header is then
/// ignored), `RequestedRangeNotSatisfiable` when every specifier misses the
/// content, and `BadRequest` on syntax errors.
pub fn parse_range(range: &str, content_length: u64) -> VersoResult<Option<Vec<[u64; 2]>>> {
    let Some(rest) = range.strip_prefix("bytes=") else {
        return Ok(None);
    };

    let bad = VersoError::Status(http::BAD_REQUEST);
    let bytes = rest.as_bytes();
    let mut intervals: Vec<[u64; 2]> = Vec::new();
    let mut index = 0;

    loop {
        // Skip whitespace before a specifier.
        while index < bytes.len() && bytes[index].is_ascii_whitespace() {
            index += 1;
        }
        if index >= bytes.len() {
            return Err(bad);
        }

        let from;
        let mut to;
        if bytes[index] == b'-' {
            // Suffix form: the last `suffix` bytes.
            index += 1;
            let suffix = parse_number(bytes, &mut index).ok_or(bad)?;
            // A zero suffix leaves from == content_length, which no
            // content position satisfies.
            from = content_length.saturating_sub(suffix);
            to = content_length.wrapping_sub(1);
        } else if bytes[index].is_ascii_digit() {
            from = parse_number(bytes, &mut index).ok_or(bad)?;
            if index >= bytes.len() || bytes[index] != b'-' {
                return Err(bad);
            }
            index += 1;
            if index < bytes.len() && bytes[index].is_ascii_digit() {
                to = parse_number(bytes, &mut index).ok_or(bad)?;
            } else {
                to = content_length.wrapping_sub(1);
            }
        } else {
            return Err(bad);
        }

        // Keep the specifier only if it intersects [0, content_length).
        if from <= to && from < content_length {
            let to = to.min(content_length - 1);
            interval_insert(&mut intervals, from, to);
        }

        while index < bytes.len() && bytes[index].is_ascii_whitespace() {
            index += 1;
        }
        if index >= bytes.len() {
            break;
        }
        if bytes[index] != b',' {
            return Err(bad);
        }
        index += 1;
    }

    if intervals.is_empty() {
        return Err(VersoError::Status(http::RANGE_NOT_SATISFIABLE));
    }
    Ok(Some(intervals))
}

fn parse_number(bytes: &[u8], index: &mut usize) -> Option<u64> {
    let start = *index;
    let mut value: u64 = 0;
    while *index < bytes.len() && bytes[*index].is_ascii_digit() {
        value = value
            .checked_mul(10)?
            .checked_add((bytes[*index] - b'0') as u64)?;
        *index += 1;
    }
    if *index == start {
        return None;
    }
    Some(value)
}

// Inserts [low, high] into the sorted interval list, merging every interval
// whose union with it is contiguous (overlapping or directly adjacent).
fn interval_insert(intervals: &mut Vec<[u64; 2]>, mut low: u64, mut high: u64) {
    let mut position = 0;
    while position < intervals.len() && intervals[position][1] + 1 < low {
        position += 1;
    }
    let mut end = position;
    while end < intervals.len() && intervals[end][0] <= high.saturating_add(1) {
        low = low.min(intervals[end][0]);
        high = high.max(intervals[end][1]);
        end += 1;
    }
    intervals.splice(position..end, [[low, high]]);
}

/// Accept-style header parsed into a quality-ordered allow list and a deny
/// list of items the client refuses outright (`q=0`).
#[derive(Debug, Default, PartialEq)]
pub struct AcceptList {
    /// Items with positive quality, sorted descending; ties keep their
    /// original order.
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

/// Splits a comma-separated header into items with optional `;q=` quality in
/// [0.000, 1.000] with up to three decimals.
pub fn parse_accept(header: &str) -> VersoResult<AcceptList> {
    let bad = VersoError::Status(http::BAD_REQUEST);
    let mut list = AcceptList::default();
    let mut priorities: Vec<u32> = Vec::new();

    for segment in header.split(',') {
        let item = segment.trim();
        if item.is_empty() {
            continue;
        }
        let (name, priority) = match item.split_once(';') {
            Some((name, parameters)) => {
                let name = name.trim_end();
                if name.is_empty() || name.contains(char::is_whitespace) {
                    return Err(bad);
                }
                (name, parse_quality(parameters.trim_start()).ok_or(bad)?)
            }
            None => {
                if item.contains(char::is_whitespace) {
                    return Err(bad);
                }
                (item, 1000)
            }
        };

        if priority == 0 {
            list.deny.push(name.to_string());
            continue;
        }

        // Insert sorted by priority, after any run of equal priorities.
        let mut last = list.allow.len();
        while last > 0 && priorities[last - 1] < priority {
            last -= 1;
        }
        list.allow.insert(last, name.to_string());
        priorities.insert(last, priority);
    }

    Ok(list)
}

// /q=(0(\.\d{0,3})?|1(\.0{0,3})?)/ scaled to thousandths.
fn parse_quality(data: &str) -> Option<u32> {
    let bytes = data.as_bytes();
    if bytes.len() < 3 || bytes.len() > 7 || bytes[0] != b'q' || bytes[1] != b'=' {
        return None;
    }
    if !bytes[2].is_ascii_digit() {
        return None;
    }
    let mut result = (bytes[2] - b'0') as u32 * 1000;
    if result > 1000 {
        return None;
    }
    if bytes.len() == 3 {
        return Some(result);
    }
    if bytes[3] != b'.' {
        return None;
    }
    let mut scale = 100;
    for &digit in &bytes[4..] {
        if !digit.is_ascii_digit() {
            return None;
        }
        result += (digit - b'0') as u32 * scale;
        scale /= 10;
    }
    if result > 1000 {
        return None;
    }
    Some(result)
}

fn option_key_char(c: u8) -> bool {
    if c.is_ascii_control() {
        return false;
    }
    !matches!(
        c,
        b' ' | b'('
            | b')'
            | b'<'
            | b'>'
            | b'@'
            | b','
            | b';'
            | b':'
            | b'\\'
            | b'"'
            | b'/'
            | b'['
            | b']'
            | b'?'
            | b'{'
            | b'}'
    )
}

/// Parses `key=value; key=value` option strings. Values are url-decoded.
pub fn parse_options(input: &str) -> VersoResult<HashMap<String, String>> {
    let bad = VersoError::Status(http::BAD_REQUEST);
    let bytes = input.as_bytes();
    let mut options = HashMap::new();
    let mut index = 0;

    loop {
        // Key runs up to '='.
        let name_start = index;
        if index >= bytes.len() || bytes[index] == b'=' {
            return Err(bad);
        }
        while index < bytes.len() && bytes[index] != b'=' {
            if !option_key_char(bytes[index]) {
                return Err(bad);
            }
            index += 1;
        }
        if index >= bytes.len() {
            return Err(bad);
        }
        let name = &input[name_start..index];
        index += 1;

        // Value runs up to ';' or the end of the string.
        let value_start = index;
        let mut last = false;
        loop {
            if index >= bytes.len() {
                last = true;
                break;
            }
            match bytes[index] {
                b';' => break,
                b' ' | b'"' | b',' | b'\\' => return Err(bad),
                c if c.is_ascii_control() => return Err(bad),
                _ => index += 1,
            }
        }

        let raw = &bytes[value_start..index];
        let value = if raw.is_empty() {
            String::new()
        } else {
            let decoded = http::url_decode(raw).ok_or(bad)?;
            String::from_utf8(decoded).map_err(|_| bad)?
        };
        options.insert(name.to_string(), value);

        if last {
            break;
        }

        // A single space separates options.
        index += 1;
        if index >= bytes.len() || bytes[index] != b' ' {
            return Err(bad);
        }
        index += 1;
    }

    Ok(options)
}

const DISPOSITION_TOKEN_MAX: usize = 64;

/// Parses the arguments of a `Content-Disposition` header, skipping the
/// leading disposition token. Values must be quoted and are url-decoded.
pub fn parse_content_disposition(input: &str) -> VersoResult<HashMap<String, String>> {
    let bad = VersoError::Status(http::BAD_REQUEST);
    let bytes = input.as_bytes();
    let mut options = HashMap::new();
    let mut index = 0;

    while index < bytes.len() && bytes[index] != b';' {
        index += 1;
        if index == DISPOSITION_TOKEN_MAX {
            return Err(VersoError::Status(http::UNSUPPORTED_MEDIA_TYPE));
        }
    }
    if index + 2 >= bytes.len() {
        return Err(bad);
    }
    index += 1;
    if bytes[index] != b' ' {
        return Err(bad);
    }
    index += 1;

    loop {
        let name_start = index;
        if index >= bytes.len() || bytes[index] == b'=' {
            return Err(bad);
        }
        while index < bytes.len() && bytes[index] != b'=' {
            if !option_key_char(bytes[index]) {
                return Err(bad);
            }
            index += 1;
        }
        if index >= bytes.len() {
            return Err(bad);
        }
        let name = &input[name_start..index];
        index += 1;

        if index >= bytes.len() || bytes[index] != b'"' {
            return Err(bad);
        }
        index += 1;
        let value_start = index;
        loop {
            if index >= bytes.len() {
                return Err(bad);
            }
            if bytes[index] == b'"' {
                break;
            }
            if bytes[index].is_ascii_control() {
                return Err(bad);
            }
            index += 1;
        }

        let raw = &bytes[value_start..index];
        let value = if raw.is_empty() {
            String::new()
        } else {
            let decoded = http::url_decode(raw).ok_or(bad)?;
            String::from_utf8(decoded).map_err(|_| bad)?
        };
        options.insert(name.to_string(), value);

        index += 1;
        if index >= bytes.len() {
            break;
        }
        if bytes[index] != b';' {
            return Err(bad);
        }
        index += 1;
        if index >= bytes.len() || bytes[index] != b' ' {
            return Err(bad);
        }
        index += 1;
    }

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_range_forms() {
        assert_eq!(
            parse_range("bytes=10-19", 100).unwrap().unwrap(),
            vec![[10, 19]]
        );
        // Open-ended range runs to the last byte.
        assert_eq!(
            parse_range("bytes=0-", 100).unwrap().unwrap(),
            vec![[0, 99]]
        );
        // Suffix form selects the final bytes.
        assert_eq!(
            parse_range("bytes=-25", 100).unwrap().unwrap(),
            vec![[75, 99]]
        );
        // An end past the content is clamped.
        assert_eq!(
            parse_range("bytes=90-200", 100).unwrap().unwrap(),
            vec![[90, 99]]
        );
    }

    #[test]
    fn overlapping_and_adjacent_ranges_merge() {
        assert_eq!(
            parse_range("bytes=10-19,15-25", 100).unwrap().unwrap(),
            vec![[10, 25]]
        );
        // Adjacent intervals merge too.
        assert_eq!(
            parse_range("bytes=0-4,5-9", 100).unwrap().unwrap(),
            vec![[0, 9]]
        );
        assert_eq!(
            parse_range("bytes=30-40, 0-5, 10-20", 100).unwrap().unwrap(),
            vec![[0, 5], [10, 20], [30, 40]]
        );
        // A later specifier can bridge earlier ones.
        assert_eq!(
            parse_range("bytes=0-5,20-30,4-21", 100).unwrap().unwrap(),
            vec![[0, 30]]
        );
    }

    #[test]
    fn parsed_intervals_are_canonical() {
        let intervals = parse_range("bytes=50-60,0-3,10-20,5-8,15-30", 100)
            .unwrap()
            .unwrap();
        for window in intervals.windows(2) {
            // Sorted, non-overlapping, non-adjacent.
            assert!(window[0][1] + 1 < window[1][0]);
        }
        for interval in &intervals {
            assert!(interval[0] <= interval[1]);
            assert!(interval[1] < 100);
        }
    }

    #[test]
    fn unsatisfiable_ranges() {
        assert_eq!(
            parse_range("bytes=200-300", 100),
            Err(VersoError::Status(http::RANGE_NOT_SATISFIABLE))
        );
        assert_eq!(
            parse_range("bytes=-0", 100),
            Err(VersoError::Status(http::RANGE_NOT_SATISFIABLE))
        );
    }

    #[test]
    fn range_syntax_errors() {
        assert_eq!(
            parse_range("bytes=abc", 100),
            Err(VersoError::Status(http::BAD_REQUEST))
        );
        assert_eq!(
            parse_range("bytes=5", 100),
            Err(VersoError::Status(http::BAD_REQUEST))
        );
        assert_eq!(
            parse_range("bytes=", 100),
            Err(VersoError::Status(http::BAD_REQUEST))
        );
    }

    #[test]
    fn unknown_unit_is_ignored() {
        assert_eq!(parse_range("items=0-4", 100).unwrap(), None);
    }

    #[test]
    fn accept_sorts_by_quality() {
        let list =
            parse_accept("text/html;q=0.8, application/json, image/png;q=0.9, */*;q=0").unwrap();
        assert_eq!(list.allow, vec!["application/json", "image/png", "text/html"]);
        assert_eq!(list.deny, vec!["*/*"]);
    }

    #[test]
    fn accept_equal_quality_is_stable() {
        let list = parse_accept("a;q=0.5, b;q=0.5, c;q=1").unwrap();
        assert_eq!(list.allow, vec!["c", "a", "b"]);
    }

    #[test]
    fn accept_quality_bounds() {
        assert!(parse_accept("x;q=1.000").is_ok());
        assert!(parse_accept("x;q=0.123").is_ok());
        assert!(parse_accept("x;q=1.5").is_err());
        assert!(parse_accept("x;q=2").is_err());
        assert!(parse_accept("x;q=abc").is_err());
    }

    #[test]
    fn options_parse_and_decode() {
        let options = parse_options("charset=utf-8; boundary=a%20b").unwrap();
        assert_eq!(options["charset"], "utf-8");
        assert_eq!(options["boundary"], "a b");
    }

    #[test]
    fn options_reject_malformed_input() {
        assert!(parse_options("=x").is_err());
        assert!(parse_options("k=v;no-space=y").is_err());
        assert!(parse_options("k v=x").is_err());
    }

    #[test]
    fn content_disposition_arguments() {
        let options =
            parse_content_disposition("attachment; filename=\"report%20final.pdf\"").unwrap();
        assert_eq!(options["filename"], "report final.pdf");
    }

    #[test]
    fn content_disposition_requires_quoted_values() {
        assert!(parse_content_disposition("attachment; filename=plain").is_err());
        assert!(parse_content_disposition("attachment").is_err());
    }
}
