use crate::{DocumentId, InfostoreError, InfostoreResult};
use std::time::{SystemTime, UNIX_EPOCH};

const ILLEGAL_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];
const MAX_FILENAME_LEN: usize = 255;

pub fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn etag(id: DocumentId, version: i32, last_modified: i64) -> String {
    format!("{}-{}-{}", id, version, last_modified)
}

pub fn validate_filename(name: &str) -> InfostoreResult<()> {
    let invalid = |reason: &str| InfostoreError::InvalidFilename(name.to_string(), reason.to_string());
    if name.trim().is_empty() {
        return Err(invalid("empty"));
    }
    if name.len() > MAX_FILENAME_LEN {
        return Err(invalid("too long"));
    }
    if name == "." || name == ".." {
        return Err(invalid("reserved name"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(invalid("contains a path separator"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| ILLEGAL_FILENAME_CHARS.contains(c) || c.is_control())
    {
        return Err(invalid(&format!("illegal character {:?}", c)));
    }
    if name.ends_with(' ') || name.ends_with('.') {
        return Err(invalid("trailing space or dot"));
    }
    Ok(())
}

/// `report.txt` → `report (n).txt`; names without extension get the counter appended.
pub fn enumerate_filename(name: &str, n: u32) -> String {
    match name.rfind('.') {
        Some(pos) if pos > 0 => format!("{} ({}){}", &name[..pos], n, &name[pos..]),
        _ => format!("{} ({})", name, n),
    }
}

/// Key under which names are compared for in-folder uniqueness.
pub fn filename_key(name: &str) -> String {
    name.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumerate_filename() {
        assert_eq!(enumerate_filename("report.txt", 1), "report (1).txt");
        assert_eq!(enumerate_filename("archive.tar.gz", 2), "archive.tar (2).gz");
        assert_eq!(enumerate_filename("README", 3), "README (3)");
        assert_eq!(enumerate_filename(".profile", 1), ".profile (1)");
    }

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("report.txt").is_ok());
        assert!(validate_filename("a/b.txt").is_err());
        assert!(validate_filename("a\\b.txt").is_err());
        assert!(validate_filename("what?.txt").is_err());
        assert!(validate_filename("   ").is_err());
        assert!(validate_filename("..").is_err());
        assert!(validate_filename("tab\there").is_err());
    }
}
