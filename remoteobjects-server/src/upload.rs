use std::path::{Path, PathBuf};

use chrono::Local;
use dashmap::DashMap;
use regex::Regex;
use tracing::{debug, warn};

use remoteobjects_core::Error;

/// Staging area for the file-argument side channel.
///
/// Uploaded files land under a server-local directory with a sanitized,
/// timestamp-prefixed filename; the mapping from caller file key to staged
/// path is kept so a later delete (or a re-upload under the same key) can
/// remove the file.
pub struct UploadStaging {
    directory: PathBuf,
    allowed_extension: Regex,
    staged: DashMap<String, PathBuf>,
}

impl std::fmt::Debug for UploadStaging {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadStaging")
            .field("directory", &self.directory)
            .field("allowed_extension", &self.allowed_extension.as_str())
            .field("staged", &self.staged.len())
            .finish()
    }
}

impl UploadStaging {
    pub fn new(
        directory: impl Into<PathBuf>,
        allowed_extension_regex: &str,
    ) -> Result<Self, regex::Error> {
        Ok(UploadStaging {
            directory: directory.into(),
            allowed_extension: Regex::new(allowed_extension_regex)?,
            staged: DashMap::new(),
        })
    }

    /// Whether a filename passes the extension allow-list. The regex is
    /// matched against the lowercased extension including its dot.
    pub fn allowed(&self, filename: &str) -> bool {
        self.allowed_extension.is_match(&extension_of(filename))
    }

    /// Write the uploaded bytes under the staging directory and record the
    /// file key. Rejects filenames failing the allow-list before touching
    /// the filesystem.
    pub fn stage(&self, file_key: &str, filename: &str, data: &[u8]) -> Result<PathBuf, Error> {
        if !self.allowed(filename) {
            return Err(Error::UploadRejected(format!(
                "allowed extension regex `{}` not met by `{filename}`",
                self.allowed_extension.as_str()
            )));
        }
        let stamped = format!(
            "{}{}",
            Local::now().format("%Y-%m-%d_%Hh%Mm%S_"),
            sanitize_filename(filename)
        );
        let path = self.directory.join(stamped);
        std::fs::write(&path, data)
            .map_err(|err| Error::Transport(format!("failed to stage `{filename}`: {err}")))?;
        debug!(file_key, path = %path.display(), "staged uploaded file");
        self.staged.insert(file_key.to_string(), path.clone());
        Ok(path)
    }

    /// Remove a previously staged file. Unknown keys are ignored and
    /// reported as `None`.
    pub fn remove(&self, file_key: &str) -> Result<Option<PathBuf>, Error> {
        let Some((_, path)) = self.staged.remove(file_key) else {
            return Ok(None);
        };
        if let Err(err) = std::fs::remove_file(&path) {
            warn!(file_key, path = %path.display(), %err, "failed to remove staged file");
            return Err(Error::Transport(format!(
                "failed to remove `{}`: {err}",
                path.display()
            )));
        }
        Ok(Some(path))
    }

    pub fn staged_path(&self, file_key: &str) -> Option<PathBuf> {
        self.staged.get(file_key).map(|entry| entry.clone())
    }
}

/// Strip directory components and anything outside a conservative
/// character set, so an uploaded filename cannot escape the staging
/// directory.
fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename)
        .trim_start_matches('.');
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

/// Lowercased extension including the dot; empty when there is none.
fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitization_strips_traversal() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("report (final).csv"), "report__final_.csv");
        assert_eq!(sanitize_filename("..."), "unnamed");
    }

    #[test]
    fn extension_allow_list() {
        let staging = UploadStaging::new("/tmp", r"^\.(txt|csv)$").unwrap();
        assert!(staging.allowed("data.TXT"));
        assert!(staging.allowed("data.csv"));
        assert!(!staging.allowed("data.bin"));
        assert!(!staging.allowed("no_extension"));
    }

    #[test]
    fn stage_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let staging = UploadStaging::new(dir.path(), r".*").unwrap();

        let path = staging.stage("config", "settings.txt", b"key=value").unwrap();
        assert!(path.exists());
        assert_eq!(staging.staged_path("config"), Some(path.clone()));
        assert_eq!(std::fs::read(&path).unwrap(), b"key=value");

        let removed = staging.remove("config").unwrap();
        assert_eq!(removed, Some(path.clone()));
        assert!(!path.exists());
        assert_eq!(staging.remove("config").unwrap(), None);
    }

    #[test]
    fn rejected_extension_stages_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let staging = UploadStaging::new(dir.path(), r"^\.txt$").unwrap();
        let err = staging.stage("blob", "payload.exe", b"MZ").unwrap_err();
        assert!(matches!(err, Error::UploadRejected(_)));
        assert!(staging.staged_path("blob").is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
