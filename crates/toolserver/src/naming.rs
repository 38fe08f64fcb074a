//! Name validation shared by every component that maps caller-supplied names onto paths.

use std::{cmp::Ordering, path::Path};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid name {0:?}")]
pub struct InvalidName(pub String);

/// Accepts a single path component: non-empty, no separators, not `.`/`..`.
pub fn validate_name(name: &str) -> Result<&str, InvalidName> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(InvalidName(name.to_string()));
    }
    Ok(name)
}

/// Turns a client filename into something safe to store under the uploads dir.
///
/// Separators are stripped. Anything still outside `[A-Za-z0-9_ ().-]`, or a
/// name that would hide among the service's dot-directories, is replaced by a
/// random UUID that keeps the original extension.
pub fn sanitize_filename(name: &str) -> String {
    let stripped: String = name.chars().filter(|c| *c != '/' && *c != '\\').collect();
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | ' ' | '(' | ')' | '.' | '-');

    if !stripped.is_empty() && !stripped.starts_with('.') && stripped.chars().all(allowed) {
        return stripped;
    }

    let ext = Path::new(&stripped)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    format!("{}{ext}", Uuid::new_v4())
}

/// `name (n).ext` for the n-th collision candidate.
pub fn numbered_variant(name: &str, n: u32) -> String {
    let path = Path::new(name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem} ({n}).{ext}"),
        None => format!("{stem} ({n})"),
    }
}

/// Orders by the first run of digits numerically, falling back to plain string order.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    match (first_number(a), first_number(b)) {
        (Some(na), Some(nb)) if na != nb => na.cmp(&nb),
        _ => a.cmp(b),
    }
}

fn first_number(s: &str) -> Option<u128> {
    let start = s.find(|c: char| c.is_ascii_digit())?;
    let digits: String = s[start..].chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_traversal() {
        assert!(validate_name("clip.mp4").is_ok());
        for bad in ["", ".", "..", "a/b", "a\\b", "../x"] {
            assert_eq!(validate_name(bad), Err(InvalidName(bad.to_string())));
        }
    }

    #[test]
    fn sanitize_keeps_plain_names() {
        assert_eq!(sanitize_filename("drive (2).mp4"), "drive (2).mp4");
        assert_eq!(sanitize_filename("dir/clip.mov"), "dirclip.mov");
    }

    #[test]
    fn sanitize_replaces_exotic_names_keeping_extension() {
        let out = sanitize_filename("völkerball$.mkv");
        assert!(out.ends_with(".mkv"));
        assert_eq!(out.len(), 36 + 4);

        let hidden = sanitize_filename(".chunks");
        assert!(!hidden.starts_with('.'));
    }

    #[test]
    fn numbered_variants() {
        assert_eq!(numbered_variant("trip.mp4", 1), "trip (1).mp4");
        assert_eq!(numbered_variant("README", 3), "README (3)");
    }

    #[test]
    fn natural_order_compares_numbers() {
        let mut names = vec!["frame-10.jpg", "frame-2.jpg", "frame-1.jpg", "b.jpg", "a.jpg"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, ["frame-1.jpg", "frame-2.jpg", "frame-10.jpg", "a.jpg", "b.jpg"]);
    }
}
