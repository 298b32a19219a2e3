//! Session Recorder — Framed Mode (C3): a timestamped Guacamole instruction log for RDP
//! sessions, with idle gaps capped so replay never stalls more than [`IDLE_CAP`].

use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::guac::Instruction;

/// Idle-gap cap in milliseconds: the virtual clock never advances by more than this between two
/// adjacent recorded events, regardless of the real-world gap.
pub const IDLE_CAP_MS: u64 = 5000;

/// Flush the buffered writer after this many instructions.
const FLUSH_EVERY: u64 = 100;

/// An open framed recording. One per active RDP session.
///
/// Invariant: `virtual_time_ms` is monotonic nondecreasing; the delta added per instruction is
/// `min(real_delta, IDLE_CAP_MS)`.
pub struct FramedRecording {
    writer: BufWriter<File>,
    virtual_time_ms: u64,
    anchor: Instant,
    count: u64,
    path: PathBuf,
}

impl FramedRecording {
    /// Create `<sessionID>-<UTC yyyymmdd-hhmmss>.guac` under `dir`, wrapped in a 64 KiB buffered
    /// writer; virtual time starts at 0.
    pub async fn start(dir: &Path, session_id: uuid::Uuid) -> std::io::Result<Self> {
        ensure_dir(dir).await?;
        let started_at = chrono::Utc::now();
        let path = dir.join(format!("{session_id}-{}.guac", started_at.format("%Y%m%d-%H%M%S")));
        let file = File::create(&path).await?;
        Ok(Self {
            writer: BufWriter::with_capacity(64 * 1024, file),
            virtual_time_ms: 0,
            anchor: Instant::now(),
            count: 0,
            path,
        })
    }

    /// The file this recording is writing to, for threading into the audit record.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an instruction: advance the virtual clock by `min(real_delta, IDLE_CAP_MS)`, then
    /// emit `<virtualMs>,<encoded-instruction>\n`. Flushes every [`FLUSH_EVERY`] instructions.
    pub async fn write_instruction(&mut self, inst: &Instruction) -> std::io::Result<()> {
        self.write_raw(&inst.encode()).await
    }

    /// Append raw bytes (e.g. a monitor banner rather than a decoded instruction) under the same
    /// virtual-clock bookkeeping as [`write_instruction`].
    pub async fn write_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let now = Instant::now();
        let real_delta_ms = now.duration_since(self.anchor).as_millis() as u64;
        self.anchor = now;
        self.virtual_time_ms += real_delta_ms.min(IDLE_CAP_MS);

        let mut line = format!("{},", self.virtual_time_ms).into_bytes();
        line.extend_from_slice(bytes);
        line.push(b'\n');
        self.writer.write_all(&line).await?;

        self.count += 1;
        if self.count % FLUSH_EVERY == 0 {
            self.writer.flush().await?;
        }
        Ok(())
    }

    /// Flush and close.
    pub async fn stop(mut self) -> std::io::Result<()> {
        self.writer.flush().await?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guac::Instruction;

    #[tokio::test]
    async fn virtual_time_is_monotonic_and_idle_capped() {
        let dir = tempfile::tempdir().unwrap();
        let session_id = uuid::Uuid::new_v4();
        let mut rec = FramedRecording::start(dir.path(), session_id).await.unwrap();

        rec.write_instruction(&Instruction::with_str_args("nop", &[])).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        rec.write_instruction(&Instruction::with_str_args("nop", &[])).await.unwrap();
        rec.stop().await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let entry = entries.next_entry().await.unwrap().unwrap();
        let contents = tokio::fs::read_to_string(entry.path()).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let t1: u64 = lines[0].split(',').next().unwrap().parse().unwrap();
        let t2: u64 = lines[1].split(',').next().unwrap().parse().unwrap();
        assert!(t1 <= t2);
        assert!(t2 - t1 <= IDLE_CAP_MS);
    }

    #[tokio::test]
    async fn path_points_at_the_created_file() {
        let dir = tempfile::tempdir().unwrap();
        let session_id = uuid::Uuid::new_v4();
        let rec = FramedRecording::start(dir.path(), session_id).await.unwrap();

        assert!(rec.path().starts_with(dir.path()));
        assert!(rec.path().extension().is_some_and(|e| e == "guac"));
        assert!(rec.path().exists());
    }
}
