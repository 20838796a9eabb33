//! Durable storage of uploaded artifact bytes.
//!
//! Files land at `<root>/<prefix><name>.<sha256>.<pid>-<seq><suffix>`. The
//! store never deduplicates; the result cache decides whether a store happens.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use mal2_core::{IoFailure, Mal2Result, ValidationError};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

/// Where and how an artifact was persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Filesystem-backed content store.
#[derive(Debug)]
pub struct ContentStore {
    root: PathBuf,
    suffix: String,
    date_prefix: bool,
    sequence: AtomicU64,
}

impl ContentStore {
    /// Create a store rooted at `root`, appending `suffix` (e.g. `.apk`) to every file.
    pub fn new(root: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            suffix: suffix.into(),
            date_prefix: false,
            sequence: AtomicU64::new(0),
        }
    }

    /// Prefix file names with the upload date (`YYYY-MM-DD_`) unless the caller supplies one.
    pub fn with_date_prefix(mut self, enabled: bool) -> Self {
        self.date_prefix = enabled;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if needed.
    pub async fn ensure_root(&self) -> Mal2Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| IoFailure::new("create upload directory", &self.root, &e))?;
        Ok(())
    }

    /// Compute a fresh, never-before-issued destination path.
    pub fn path_for(&self, original_name: &str, sha256: &str, prefix: Option<&str>) -> PathBuf {
        let prefix = match prefix {
            Some(p) => p.to_string(),
            None if self.date_prefix => Utc::now().format("%Y-%m-%d_").to_string(),
            None => String::new(),
        };
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let file_name = format!(
            "{}{}.{}.{}-{}{}",
            truncate_ascii(&sanitize_component(&prefix), MAX_PREFIX_BYTES),
            sanitize_file_name(original_name),
            sha256,
            std::process::id(),
            seq,
            self.suffix
        );
        self.root.join(file_name)
    }

    /// Copy the spooled upload at `source` into the store in one pass.
    pub async fn store_file(
        &self,
        source: &Path,
        original_name: &str,
        sha256: &str,
        prefix: Option<&str>,
    ) -> Mal2Result<StoredArtifact> {
        if !mal2_core::is_sha256_hex(sha256) {
            return Err(ValidationError::InvalidValue {
                field: "sha256".to_string(),
                reason: "expected 64 lowercase hex characters".to_string(),
            }
            .into());
        }

        let dest = self.path_for(original_name, sha256, prefix);
        let mut src = File::open(source)
            .await
            .map_err(|e| IoFailure::new("open spooled upload", source, &e))?;
        let out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&dest)
            .await
            .map_err(|e| IoFailure::new("create stored artifact", &dest, &e))?;

        let mut writer = BufWriter::new(out);
        let size_bytes = tokio::io::copy(&mut src, &mut writer)
            .await
            .map_err(|e| IoFailure::new("copy artifact", &dest, &e))?;
        writer
            .flush()
            .await
            .map_err(|e| IoFailure::new("flush artifact", &dest, &e))?;
        writer
            .into_inner()
            .sync_all()
            .await
            .map_err(|e| IoFailure::new("sync artifact", &dest, &e))?;

        tracing::info!(
            original_name,
            path = %dest.display(),
            size_bytes,
            "Stored artifact"
        );

        Ok(StoredArtifact {
            path: dest,
            size_bytes,
        })
    }

    /// Best-effort removal of a stored copy whose analysis did not complete.
    /// Paths outside the store root are left alone.
    pub async fn discard(&self, path: &Path) {
        if !path.starts_with(&self.root) {
            tracing::warn!(path = %path.display(), "Refusing to discard a path outside the store");
            return;
        }
        match fs::remove_file(path).await {
            Ok(()) => tracing::debug!(path = %path.display(), "Discarded stored artifact"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to discard stored artifact"),
        }
    }
}

/// Longest name portion kept in a stored file name.
///
/// Together with the digest, pid-seq token, prefix cap and suffix this keeps the
/// final component under NAME_MAX (255 bytes).
pub const MAX_NAME_BYTES: usize = 96;

/// Longest caller-supplied prefix kept in a stored file name.
pub const MAX_PREFIX_BYTES: usize = 32;

/// Longest extension preserved when a name is truncated.
const MAX_EXTENSION_BYTES: usize = 16;

/// Reduce an uploaded file name to a safe final path component of at most
/// [`MAX_NAME_BYTES`] bytes, keeping a short extension when truncating.
pub fn sanitize_file_name(name: &str) -> String {
    let last = name
        .rsplit(|c| c == '/' || c == '\\')
        .find(|s| !s.is_empty())
        .unwrap_or("");
    let cleaned = sanitize_component(last);
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        return "upload".to_string();
    }
    if trimmed.len() <= MAX_NAME_BYTES {
        return trimmed.to_string();
    }

    // Sanitized names are pure ASCII, so byte offsets are char boundaries.
    let (stem, ext) = match trimmed.rfind('.') {
        Some(dot) if trimmed.len() - dot <= MAX_EXTENSION_BYTES => trimmed.split_at(dot),
        _ => (trimmed, ""),
    };
    let keep = MAX_NAME_BYTES - ext.len();
    format!("{}{}", &stem[..keep.min(stem.len())], ext)
}

fn truncate_ascii(value: &str, max: usize) -> &str {
    &value[..value.len().min(max)]
}

fn sanitize_component(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mal2_core::hash_bytes;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_sanitized_name_is_single_safe_component(name in ".{0,300}") {
            let clean = sanitize_file_name(&name);
            prop_assert!(!clean.is_empty());
            prop_assert!(clean.len() <= MAX_NAME_BYTES);
            prop_assert!(!clean.starts_with('.'));
            prop_assert!(clean
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')));
        }
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("BAWAG.apk"), "BAWAG.apk");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\app v2.apk"), "app_v2.apk");
        assert_eq!(sanitize_file_name(""), "upload");
        assert_eq!(sanitize_file_name(".."), "upload");
        assert_eq!(sanitize_file_name("dir/"), "dir");
    }

    #[test]
    fn test_paths_are_unique_and_follow_layout() {
        let store = ContentStore::new("/srv/uploads", ".apk");
        let sha = hash_bytes(b"x").sha256;
        let a = store.path_for("app.apk", &sha, Some("2024-01-01_"));
        let b = store.path_for("app.apk", &sha, Some("2024-01-01_"));
        assert_ne!(a, b);

        let name = a.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        assert!(name.starts_with("2024-01-01_app.apk."));
        assert!(name.contains(&sha));
        assert!(name.contains(&std::process::id().to_string()));
        assert!(name.ends_with(".apk"));
        assert_eq!(a.parent(), Some(Path::new("/srv/uploads")));
    }

    #[test]
    fn test_date_prefix_applied_when_enabled() {
        let store = ContentStore::new("/srv", "").with_date_prefix(true);
        let sha = hash_bytes(b"y").sha256;
        let path = store.path_for("a.apk", &sha, None);
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let today = Utc::now().format("%Y-%m-%d_").to_string();
        assert!(name.starts_with(&today));
    }

    #[tokio::test]
    async fn test_store_file_copies_bytes() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let spool = dir.path().join("spool");
        std::fs::write(&spool, b"dex\n035")?;

        let store = ContentStore::new(dir.path().join("uploads"), ".apk");
        store.ensure_root().await?;
        let sha = hash_bytes(b"dex\n035").sha256;
        let stored = store.store_file(&spool, "app.apk", &sha, None).await?;

        assert_eq!(stored.size_bytes, 7);
        assert_eq!(std::fs::read(&stored.path)?, b"dex\n035");
        Ok(())
    }

    #[test]
    fn test_long_names_truncated_keeping_extension() {
        let long = format!("{}.apk", "a".repeat(200));
        let clean = sanitize_file_name(&long);
        assert_eq!(clean.len(), MAX_NAME_BYTES);
        assert!(clean.ends_with(".apk"));

        let no_ext = "b".repeat(300);
        assert_eq!(sanitize_file_name(&no_ext).len(), MAX_NAME_BYTES);

        let store = ContentStore::new("/srv", ".apk");
        let sha = hash_bytes(b"long").sha256;
        let path = store.path_for(&long, &sha, Some(&"p".repeat(100)));
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        assert!(name.len() <= 255, "component is {} bytes", name.len());
    }

    #[tokio::test]
    async fn test_store_file_accepts_overlong_name() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let spool = dir.path().join("spool");
        std::fs::write(&spool, b"payload")?;

        let store = ContentStore::new(dir.path().join("uploads"), ".apk");
        store.ensure_root().await?;
        let sha = hash_bytes(b"payload").sha256;
        let name = format!("{}.apk", "a".repeat(200));
        let first = store.store_file(&spool, &name, &sha, None).await?;
        let second = store.store_file(&spool, &name, &sha, None).await?;

        assert_ne!(first.path, second.path);
        assert_eq!(std::fs::read(&second.path)?, b"payload");
        Ok(())
    }

    #[tokio::test]
    async fn test_discard_removes_only_files_under_root() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let spool = dir.path().join("spool");
        std::fs::write(&spool, b"gone")?;

        let store = ContentStore::new(dir.path().join("uploads"), "");
        store.ensure_root().await?;
        let sha = hash_bytes(b"gone").sha256;
        let stored = store.store_file(&spool, "a", &sha, None).await?;

        store.discard(&stored.path).await;
        assert!(!stored.path.exists());

        store.discard(&spool).await;
        assert!(spool.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_store_file_rejects_bad_digest() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let store = ContentStore::new(dir.path(), "");
        let err = store
            .store_file(&dir.path().join("missing"), "a", "../../x", None)
            .await
            .unwrap_err();
        assert!(matches!(err, mal2_core::Mal2Error::Validation(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_store_file_missing_source_is_io_failure() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let store = ContentStore::new(dir.path(), "");
        let sha = hash_bytes(b"z").sha256;
        let err = store
            .store_file(&dir.path().join("missing"), "a", &sha, None)
            .await
            .unwrap_err();
        assert!(matches!(err, mal2_core::Mal2Error::Io(_)));
        Ok(())
    }
}
