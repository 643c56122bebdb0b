use crate::config::BuiltinSettings;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Extensions accepted for text file writes.
pub const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "json", "csv", "yaml", "yml", "xml", "html", "log", "py", "js", "ts", "rs",
];

/// Extensions accepted for binary writes (content must arrive as base64).
pub const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "pdf", "zip", "xlsx", "docx", "pptx",
];

/// Per-user scratch space for built-in tools.
///
/// Files are transient: anything older than the configured TTL is removed
/// opportunistically whenever a workspace is resolved.
pub struct Workspace {
    root: PathBuf,
    ttl: Duration,
}

impl Workspace {
    pub fn new(settings: &BuiltinSettings) -> Self {
        let root = settings.workspace_root.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(".toolgate")
                .join("workspaces")
        });
        Self {
            root,
            ttl: Duration::from_secs(settings.workspace_ttl_hours * 3600),
        }
    }

    /// Resolve (and create) the directory for one user, sweeping expired
    /// files as a side effect.
    pub fn user_dir(&self, user_id: &str) -> anyhow::Result<PathBuf> {
        let dir = self.root.join(sanitize_component(user_id));
        std::fs::create_dir_all(&dir)?;
        self.sweep_expired(&dir);
        Ok(dir)
    }

    /// Resolve a filename inside the user's workspace. Rejects traversal:
    /// only a bare file name survives sanitization.
    pub fn resolve_file(&self, user_id: &str, filename: &str) -> anyhow::Result<PathBuf> {
        let safe = sanitize_filename(filename)?;
        Ok(self.user_dir(user_id)?.join(safe))
    }

    fn sweep_expired(&self, dir: &Path) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        let now = SystemTime::now();
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let expired = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > self.ttl);
            if expired {
                debug!("sweeping expired workspace file {:?}", entry.path());
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    warn!("failed to remove expired file {:?}: {}", entry.path(), e);
                }
            }
        }
    }
}

/// Keep only the final path component and verify it is a plain file name.
pub fn sanitize_filename(filename: &str) -> anyhow::Result<String> {
    let trimmed = filename.trim();
    if trimmed.is_empty() {
        anyhow::bail!("filename is empty");
    }
    if trimmed.contains("..") || trimmed.contains('/') || trimmed.contains('\\') {
        anyhow::bail!("filename must not contain path separators or '..'");
    }
    if trimmed.starts_with('.') {
        anyhow::bail!("hidden files are not allowed");
    }
    Ok(trimmed.to_string())
}

fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Extension (lowercased) of a file name.
pub fn extension(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
}
