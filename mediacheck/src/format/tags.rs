// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::str;

/// One `key = value` entry from the application data area. Tags without a `=`
/// keep an empty value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// Trim trailing spaces and NUL padding and reject anything that is not
/// printable ASCII. Returns `None` if the data cannot be a metadata string.
pub fn sanitize_info(data: &[u8]) -> Option<String> {
    let mut end = data.len();
    while end > 0 && (data[end - 1] == 0 || data[end - 1] == b' ') {
        end -= 1;
    }

    let data = &data[..end];
    if data.iter().any(|b| *b < 0x20 || *b >= 0x80) {
        return None;
    }

    // All bytes are printable ASCII at this point.
    str::from_utf8(data).ok().map(|s| s.to_owned())
}

/// Split the metadata blob into an ordered tag list. Entries are separated by
/// `;`; a `=` belonging to a later entry does not produce a value for an
/// earlier one because entries are split first.
pub fn parse(blob: &str) -> Vec<Tag> {
    let mut result = Vec::new();

    for item in blob.split(';') {
        let (key, value) = match item.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => (item.trim(), ""),
        };

        if key.is_empty() && value.is_empty() {
            continue;
        }

        result.push(Tag {
            key: key.to_owned(),
            value: value.to_owned(),
        });
    }

    result
}
