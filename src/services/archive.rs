//! ZIP batch expansion.
//!
//! Pulls convertible entries out of an uploaded archive, skipping directory
//! entries, OS junk and anything that is clearly not a source asset, and
//! sanitizing entry names so nothing escapes into a path.

use std::io::{Cursor, Read};

/// Source extensions accepted for conversion, single uploads included.
pub const ALLOWED_IMAGE_EXTENSIONS: &[&str] = &["psd", "png", "jpg", "jpeg", "webp"];

/// Entries smaller than this are skipped as junk rather than surfaced as
/// per-item decode failures.
const MIN_ENTRY_BYTES: u64 = 16;

/// One convertible asset pulled out of a submission.
#[derive(Debug, Clone)]
pub struct ArchiveItem {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Expand a ZIP payload into its convertible entries, in archive order.
///
/// A single unreadable entry is skipped with a warning; only a structurally
/// bad archive or an empty/oversized batch fails the whole expansion.
pub fn expand_archive(bytes: &[u8], max_entries: usize) -> Result<Vec<ArchiveItem>, ArchiveError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ArchiveError::BadArchive {
            detail: e.to_string(),
        })?;

    let mut items = Vec::new();
    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(index, error = %e, "skipping unreadable archive entry");
                continue;
            }
        };

        if !is_convertible_entry(entry.name(), entry.is_dir(), entry.size()) {
            continue;
        }

        if items.len() >= max_entries {
            return Err(ArchiveError::TooManyEntries { max: max_entries });
        }

        let mut bytes = Vec::with_capacity(entry.size() as usize);
        if let Err(e) = entry.read_to_end(&mut bytes) {
            tracing::warn!(entry = entry.name(), error = %e, "skipping corrupt archive entry");
            continue;
        }

        items.push(ArchiveItem {
            name: sanitize_entry_name(entry.name(), index),
            bytes,
        });
    }

    if items.is_empty() {
        return Err(ArchiveError::NoConvertibleEntries);
    }

    tracing::debug!(count = items.len(), "expanded archive");
    Ok(items)
}

fn is_convertible_entry(name: &str, is_dir: bool, size: u64) -> bool {
    if is_dir || size < MIN_ENTRY_BYTES {
        return false;
    }

    // OS metadata and hidden files.
    let basename = name.rsplit(['/', '\\']).next().unwrap_or(name);
    if name.starts_with("__MACOSX/")
        || basename.starts_with('.')
        || basename.eq_ignore_ascii_case("Thumbs.db")
        || basename.eq_ignore_ascii_case(".DS_Store")
    {
        return false;
    }

    match basename.rsplit_once('.') {
        Some((_, ext)) => ALLOWED_IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()),
        None => false,
    }
}

/// Basename only, with filesystem-hostile characters replaced.
fn sanitize_entry_name(name: &str, index: usize) -> String {
    let basename = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let safe: String = basename
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c => c,
        })
        .collect();

    if safe.trim_start_matches('_').is_empty() {
        format!("entry_{index}")
    } else {
        safe
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("invalid ZIP archive: {detail}")]
    BadArchive { detail: String },

    #[error("archive contains no convertible entries")]
    NoConvertibleEntries,

    #[error("archive exceeds the {max}-entry limit")]
    TooManyEntries { max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, bytes) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    const PAYLOAD: &[u8] = &[0xAB; 64];

    #[test]
    fn expands_entries_in_archive_order() {
        let zip = build_zip(&[("a.png", PAYLOAD), ("b.jpg", PAYLOAD), ("c.psd", PAYLOAD)]);
        let items = expand_archive(&zip, 50).unwrap();
        let names: Vec<&str> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a.png", "b.jpg", "c.psd"]);
        assert_eq!(items[0].bytes, PAYLOAD);
    }

    #[test]
    fn skips_junk_and_non_image_entries() {
        let zip = build_zip(&[
            ("__MACOSX/a.png", PAYLOAD),
            (".hidden.png", PAYLOAD),
            ("notes.txt", PAYLOAD),
            ("Thumbs.db", PAYLOAD),
            ("sub/.DS_Store", PAYLOAD),
            ("real.webp", PAYLOAD),
        ]);
        let items = expand_archive(&zip, 50).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "real.webp");
    }

    #[test]
    fn flattens_nested_paths_to_basenames() {
        let zip = build_zip(&[("deep/nested/dir/asset.png", PAYLOAD)]);
        let items = expand_archive(&zip, 50).unwrap();
        assert_eq!(items[0].name, "asset.png");
    }

    #[test]
    fn rejects_archive_without_convertible_entries() {
        let zip = build_zip(&[("readme.md", PAYLOAD)]);
        assert!(matches!(
            expand_archive(&zip, 50),
            Err(ArchiveError::NoConvertibleEntries)
        ));
    }

    #[test]
    fn enforces_entry_cap() {
        let zip = build_zip(&[("a.png", PAYLOAD), ("b.png", PAYLOAD), ("c.png", PAYLOAD)]);
        assert!(matches!(
            expand_archive(&zip, 2),
            Err(ArchiveError::TooManyEntries { max: 2 })
        ));
    }

    #[test]
    fn rejects_non_zip_bytes() {
        assert!(matches!(
            expand_archive(b"not a zip at all", 50),
            Err(ArchiveError::BadArchive { .. })
        ));
    }

    #[test]
    fn skips_tiny_entries() {
        let zip = build_zip(&[("tiny.png", &[1, 2, 3]), ("ok.png", PAYLOAD)]);
        let items = expand_archive(&zip, 50).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "ok.png");
    }
}
