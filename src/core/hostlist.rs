// src/core/hostlist.rs

//! Host-range expression handling.
//!
//! Compact strings of the form `prefix[01-04,07,10-12]` expand to a stable,
//! de-duplicated list of hostnames. The expansion is shared by node lines,
//! partition node-lists and administrative RPCs (`update-node` takes a
//! range expression). `fold` is the inverse, used when serialising node
//! sets back into config-style strings.

use crate::core::ControllerError;

/// Expands a comma-separated list of names and range expressions.
///
/// Duplicates are dropped while preserving first-occurrence order, so the
/// result is usable as a node-table construction order.
pub fn expand(expr: &str) -> Result<Vec<String>, ControllerError> {
    let mut out: Vec<String> = Vec::new();
    for item in split_outside_brackets(expr)? {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        for name in expand_one(item)? {
            if !out.contains(&name) {
                out.push(name);
            }
        }
    }
    Ok(out)
}

/// Folds a list of hostnames back into a compact range expression.
/// Names that do not share a `prefixNN` shape are emitted verbatim.
pub fn fold(names: &[String]) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut i = 0;
    while i < names.len() {
        let Some((prefix, num, width)) = split_numeric_suffix(&names[i]) else {
            out.push(names[i].clone());
            i += 1;
            continue;
        };
        // Extend the run while consecutive entries share prefix/width.
        let mut end = num;
        let mut j = i + 1;
        while j < names.len() {
            match split_numeric_suffix(&names[j]) {
                Some((p, n, w)) if p == prefix && w == width && n == end + 1 => {
                    end = n;
                    j += 1;
                }
                _ => break,
            }
        }
        if j - i == 1 {
            out.push(names[i].clone());
        } else {
            out.push(format!(
                "{prefix}[{:0width$}-{:0width$}]",
                num,
                end,
                width = width
            ));
        }
        i = j;
    }
    out.join(",")
}

fn split_numeric_suffix(name: &str) -> Option<(&str, u64, usize)> {
    let digits = name.len() - name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    let (prefix, suffix) = name.split_at(name.len() - digits);
    suffix.parse::<u64>().ok().map(|n| (prefix, n, digits))
}

/// Splits on commas that are not inside a bracket expression.
fn split_outside_brackets(expr: &str) -> Result<Vec<&str>, ControllerError> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in expr.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    ControllerError::Protocol(format!("unbalanced ']' in host expression '{expr}'"))
                })?;
            }
            ',' if depth == 0 => {
                parts.push(&expr[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(ControllerError::Protocol(format!(
            "unbalanced '[' in host expression '{expr}'"
        )));
    }
    parts.push(&expr[start..]);
    Ok(parts)
}

fn expand_one(item: &str) -> Result<Vec<String>, ControllerError> {
    let Some(open) = item.find('[') else {
        return Ok(vec![item.to_string()]);
    };
    let close = item.rfind(']').ok_or_else(|| {
        ControllerError::Protocol(format!("missing ']' in host expression '{item}'"))
    })?;
    if close < open {
        return Err(ControllerError::Protocol(format!(
            "malformed host expression '{item}'"
        )));
    }
    let prefix = &item[..open];
    let suffix = &item[close + 1..];
    let mut names = Vec::new();
    for range in item[open + 1..close].split(',') {
        let range = range.trim();
        let (lo_str, hi_str) = match range.split_once('-') {
            Some((lo, hi)) => (lo.trim(), hi.trim()),
            None => (range, range),
        };
        let width = if lo_str.starts_with('0') && lo_str.len() > 1 {
            lo_str.len()
        } else {
            0
        };
        let lo: u64 = lo_str.parse().map_err(|_| {
            ControllerError::Protocol(format!("bad range start '{lo_str}' in '{item}'"))
        })?;
        let hi: u64 = hi_str.parse().map_err(|_| {
            ControllerError::Protocol(format!("bad range end '{hi_str}' in '{item}'"))
        })?;
        if hi < lo {
            return Err(ControllerError::Protocol(format!(
                "descending range '{range}' in '{item}'"
            )));
        }
        // An absurd range is almost always a typo; refuse before allocating.
        if hi - lo > 64 * 1024 {
            return Err(ControllerError::Protocol(format!(
                "range '{range}' in '{item}' is too large"
            )));
        }
        for n in lo..=hi {
            names.push(format!("{prefix}{:0width$}{suffix}", n, width = width));
        }
    }
    Ok(names)
}
