//! Atomic report persistence: temp file in the output directory, 0644,
//! rename onto the final path. An interrupted writer never leaves a
//! partially written `scan_report_*.md`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, ScanError};

pub struct FileStorage {
    out_dir: PathBuf,
}

impl FileStorage {
    pub fn new(out_dir: &Path) -> Self {
        let out_dir = if out_dir.as_os_str().is_empty() {
            PathBuf::from("reports")
        } else {
            out_dir.to_path_buf()
        };
        Self { out_dir }
    }

    pub fn save(&self, mode: &str, content: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.out_dir)?;

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let filename = format!(
            "scan_report_{}_{nanos}.md",
            sanitize_filename_component(mode)
        );
        let final_path = self.out_dir.join(&filename);

        let mut tmp = tempfile::Builder::new()
            .prefix(&format!("{filename}.tmp-"))
            .tempfile_in(&self.out_dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.flush()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o644))?;
        }
        tmp.persist(&final_path)
            .map_err(|e| ScanError::Io(e.error))?;
        Ok(final_path)
    }
}

/// Filenames carry only `[A-Za-z0-9._-]`, with leading and trailing
/// punctuation trimmed.
pub fn sanitize_filename_component(s: &str) -> String {
    let s = s.trim();
    if s.is_empty() {
        return "unknown".to_string();
    }
    let mapped: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = mapped.trim_matches(|c| c == '.' || c == '_' || c == '-');
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename_component() {
        assert_eq!(sanitize_filename_component("mode1"), "mode1");
        assert_eq!(sanitize_filename_component("mo de/1"), "mo_de_1");
        assert_eq!(sanitize_filename_component("..weird.."), "weird");
        assert_eq!(sanitize_filename_component("///"), "unknown");
        assert_eq!(sanitize_filename_component(""), "unknown");
    }

    #[test]
    fn test_save_writes_final_file_and_cleans_temp() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let path = storage.save("mode1", "# report body").unwrap();

        assert!(path.exists());
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("scan_report_mode1_"));
        assert!(name.ends_with(".md"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# report body");

        // Only the final file remains in the directory.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_filename_matches_report_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let path = storage.save("mode2", "x").unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        let re = regex::Regex::new(r"^scan_report_mode2_\d+\.md$").unwrap();
        assert!(re.is_match(name));
    }
}
