//! Session Recorder — Text Mode (C2): a banner/footer-wrapped byte log for SSH sessions.
//!
//! Input is never written here — only target→client bytes. The PTY's local echo already shows
//! up in that stream, so recording input too would duplicate every keystroke on replay.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// An open text recording. One per active SSH session; writes are serialized by the caller (the
/// SSH proxy holds the only reference to a given session's sink).
pub struct TextRecording {
    file: File,
    session_id: uuid::Uuid,
    started_at: chrono::DateTime<chrono::Utc>,
    path: PathBuf,
}

impl TextRecording {
    /// Create `<sessionID>-<UTC yyyymmdd-hhmmss>.log` under `dir` (created with mode 0750 if
    /// missing) and write the opening banner.
    pub async fn start(dir: &Path, session_id: uuid::Uuid) -> std::io::Result<Self> {
        ensure_dir(dir).await?;
        let started_at = chrono::Utc::now();
        let path = dir.join(file_name(session_id, started_at, "log"));
        let mut file = File::create(&path).await?;
        let banner = format!(
            "=== SSH Session Recording ===\nSession: {session_id}\nStart: {}\n{}\n",
            started_at.to_rfc3339(),
            "-".repeat(40),
        );
        file.write_all(banner.as_bytes()).await?;
        Ok(Self { file, session_id, started_at, path })
    }

    /// The file this recording is writing to, for threading into the audit record.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append raw target→client bytes.
    pub async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.file.write_all(data).await
    }

    /// Write the footer and close the file.
    pub async fn stop(mut self) -> std::io::Result<()> {
        let ended_at = chrono::Utc::now();
        let duration = ended_at - self.started_at;
        let footer = format!(
            "\n{}\nEnd: {}\nDuration: {}s\n",
            "-".repeat(40),
            ended_at.to_rfc3339(),
            duration.num_seconds(),
        );
        self.file.write_all(footer.as_bytes()).await?;
        self.file.flush().await?;
        let _ = self.session_id;
        Ok(())
    }
}

async fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o750);
        tokio::fs::set_permissions(dir, perms).await?;
    }
    Ok(())
}

fn file_name(session_id: uuid::Uuid, at: chrono::DateTime<chrono::Utc>, ext: &str) -> PathBuf {
    PathBuf::from(format!("{session_id}-{}.{ext}", at.format("%Y%m%d-%H%M%S")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_write_stop_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let session_id = uuid::Uuid::new_v4();
        let mut rec = TextRecording::start(dir.path(), session_id).await.unwrap();
        rec.write(b"file1\n").await.unwrap();
        rec.stop().await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let entry = entries.next_entry().await.unwrap().unwrap();
        let contents = tokio::fs::read_to_string(entry.path()).await.unwrap();
        assert!(contents.contains("=== SSH Session Recording ==="));
        assert!(contents.contains(&session_id.to_string()));
        assert!(contents.contains("file1\n"));
        assert!(contents.contains("Duration:"));
    }
}
