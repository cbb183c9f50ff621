//! Keyword definition files.
//!
//! One seed per line: `blob_name,x,y,w,h,value`. A value is positive when
//! it is a non-zero number or `true`. Blank lines and lines starting with
//! `#` are skipped.

use kaizen_core::{Blob, Error, Result};

/// One parsed definition row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedRow {
    pub blob_name: String,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub value: bool,
}

fn parse_value(field: &str) -> Option<bool> {
    match field.to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        other => other.parse::<f64>().ok().map(|v| v != 0.0),
    }
}

/// Parse a definition file. Errors name the offending line.
pub fn parse_definition(text: &str) -> Result<Vec<SeedRow>> {
    let mut rows = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let bad = |why: &str| Error::InvalidInput(format!("definition line {}: {}", n + 1, why));
        if fields.len() != 6 {
            return Err(bad(&format!("expected 6 fields, found {}", fields.len())));
        }
        let int = |i: usize| {
            fields[i]
                .parse::<i32>()
                .map_err(|_| bad(&format!("'{}' is not an integer", fields[i])))
        };
        rows.push(SeedRow {
            blob_name: fields[0].to_string(),
            x: int(1)?,
            y: int(2)?,
            width: int(3)?,
            height: int(4)?,
            value: parse_value(fields[5])
                .ok_or_else(|| bad(&format!("'{}' is not a value", fields[5])))?,
        });
    }
    Ok(rows)
}

/// First blob (in the given order) whose location contains `name`.
pub fn find_blob<'a>(blobs: &'a [Blob], name: &str) -> Option<&'a Blob> {
    blobs.iter().find(|b| b.location.contains(name))
}
