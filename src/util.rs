use chrono::{Local, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use std::io::{self, Read};
use std::path::Path;

/// Current UTC time as RFC 3339 with microseconds and a trailing `Z`.
pub fn utc_now_iso_z() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Local wall-clock stamp used in file names (`20250101_093000`).
pub fn file_stamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

pub fn display_path(path: &Path, base: Option<&Path>) -> String {
    if let Some(base) = base {
        if let Ok(relative) = path.strip_prefix(base) {
            return relative.display().to_string();
        }
    }
    path.display().to_string()
}

pub fn truncate_bytes(bytes: &[u8], max_bytes: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    truncate_string(&text, max_bytes)
}

pub fn truncate_string(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut truncated = String::new();
    for ch in text.chars() {
        if truncated.len() + ch.len_utf8() > max_bytes {
            break;
        }
        truncated.push(ch);
    }
    truncated
}

/// Stream `reader` through sha256, returning the hex digest and byte count.
pub fn sha256_reader(mut reader: impl Read) -> io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let size = io::copy(&mut reader, &mut hasher)?;
    Ok((format!("{:x}", hasher.finalize()), size))
}

/// Keep only `[A-Za-z0-9_-]`, mapping everything else to `_`.
pub fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "snapshot".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_string_respects_char_boundaries() {
        assert_eq!(truncate_string("héllo", 2), "h");
        assert_eq!(truncate_string("abc", 10), "abc");
    }

    #[test]
    fn utc_timestamps_end_with_z() {
        assert!(utc_now_iso_z().ends_with('Z'));
    }

    #[test]
    fn sanitize_label_replaces_separators() {
        assert_eq!(sanitize_label("pre ingest/2024"), "pre_ingest_2024");
        assert_eq!(sanitize_label("  "), "snapshot");
    }

    #[test]
    fn sha256_reader_matches_known_digest() {
        let (digest, size) = sha256_reader(&b"abc"[..]).expect("hash");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(size, 3);
    }
}
