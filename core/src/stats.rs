//! Byte counters (and the recording file, if any) a proxy hands back so the dispatcher (C7) can
//! finalize the audit record (spec §3, "bytes sent (client→target), bytes received
//! (target→client)").
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Path of the session's recording file, if recording was enabled.
    pub recording_path: Option<String>,
}
