//! RDP/Guacamole Proxy (C6): handshake with the rendering daemon, negotiate connection
//! parameters, shuttle Guacamole instructions in both directions, record, broadcast, keep alive.
//!
//! Same worker-fan and single-close-guard shape as [`crate::ssh_proxy`], generalized from
//! byte-oriented shuttling to instruction-oriented shuttling using the codec (C1). The
//! recorder/broadcaster decoupling via a bounded, drop-on-overflow queue mirrors the monitor
//! bus's own drop-on-full policy (C4), applied here to a queue of decoded instructions instead of
//! raw bytes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::guac::{self, Instruction};
use crate::model::{AuditRecord, ResolvedCredential, Target};
use crate::monitor::MonitorBus;
use crate::recording::FramedRecording;
use crate::stats::SessionStats;
use crate::ws::{WsMessage, WsReceiver, WsSender};

/// Capacity of the recorder/broadcaster decoupling queue (spec §4.6 step 9).
const RECORDER_QUEUE_CAPACITY: usize = 500;
/// Keep-alive cadence to the rendering daemon (spec §4.6 step 12).
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
/// Coarse, documented-as-approximate per-instruction byte charge (spec §4.6, "byte counters"):
/// the RDP path does not decode instruction payloads to count their exact size.
const BYTES_PER_INSTRUCTION_APPROX: u64 = 256;

pub struct RdpProxy {
    monitor: MonitorBus,
    recordings_dir: Option<PathBuf>,
    daemon_addr: String,
}

impl RdpProxy {
    pub fn new(monitor: MonitorBus, recordings_dir: Option<PathBuf>, daemon_addr: String) -> Self {
        Self { monitor, recordings_dir, daemon_addr }
    }

    /// `Handle(ctx, ws, target, resolvedCred, auditRecord, width, height) → error` (spec §4.6).
    pub async fn handle(
        &self,
        cancel: CancellationToken,
        ws_tx: Box<dyn WsSender>,
        ws_rx: Box<dyn WsReceiver>,
        target: &Target,
        cred: &ResolvedCredential,
        audit: &AuditRecord,
        width: u32,
        height: u32,
    ) -> Result<SessionStats> {
        let session_id = audit.id;
        let stream = TcpStream::connect(&self.daemon_addr)
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable(format!("dial rendering daemon {}: {e}", self.daemon_addr)))?;
        let (read_half, write_half) = stream.into_split();
        let mut daemon_rx = BufReader::new(read_half);
        let daemon_tx = Arc::new(Mutex::new(write_half));

        // Phase A: handshake.
        send(&daemon_tx, "select", &["rdp"]).await?;
        let args_inst = guac::decode(&mut daemon_rx).await?;
        if args_inst.opcode != "args" {
            return Err(GatewayError::HandshakeViolation(format!(
                "expected 'args' instruction, got '{}'",
                args_inst.opcode
            )));
        }
        let param_names: Vec<String> =
            args_inst.args.iter().map(|a| String::from_utf8_lossy(a).into_owned()).collect();

        // The 4-arg `size` sent to the daemon (`0, width, height, dpi`) is the same instruction
        // recorded, broadcast, and replayed as the session header — built once, below, and reused
        // for the handshake send so the wire form the daemon sees can never drift from the form
        // everything else in this session agrees on.
        let size_inst = Instruction::with_str_args("size", &["0", &width.to_string(), &height.to_string(), "96"]);
        let size_args: Vec<String> = size_inst.args.iter().map(|a| String::from_utf8_lossy(a).into_owned()).collect();
        let size_args_refs: Vec<&str> = size_args.iter().map(String::as_str).collect();
        send(&daemon_tx, "size", &size_args_refs).await?;
        send(&daemon_tx, "audio", &["audio/L16", "rate=44100", "channels=2"]).await?;
        send(&daemon_tx, "video", &["image/jpeg", "image/png", "image/webp"]).await?;
        send(&daemon_tx, "image", &["image/png", "image/jpeg"]).await?;

        let table = connect_param_table(target, cred, width, height);
        let connect_args: Vec<String> = param_names
            .iter()
            .map(|name| table.get(name.as_str()).cloned().unwrap_or_default())
            .collect();
        let connect_args_refs: Vec<&str> = connect_args.iter().map(String::as_str).collect();
        send(&daemon_tx, "connect", &connect_args_refs).await?;

        let ready_inst = guac::decode(&mut daemon_rx).await?;
        if ready_inst.opcode != "ready" {
            return Err(GatewayError::HandshakeViolation(format!(
                "expected 'ready' instruction, got '{}'",
                ready_inst.opcode
            )));
        }

        // Phase B: session header for replay/late observers.
        let mut recorder = match &self.recordings_dir {
            Some(dir) => Some(
                FramedRecording::start(dir, session_id)
                    .await
                    .map_err(|e| GatewayError::UpstreamUnavailable(format!("recorder start failed: {e}")))?,
            ),
            None => None,
        };
        if let Some(rec) = recorder.as_mut() {
            let _ = rec.write_instruction(&size_inst).await;
            let _ = rec.write_instruction(&ready_inst).await;
        }

        let mut header = size_inst.encode();
        header.extend_from_slice(&ready_inst.encode());
        self.monitor.set_header(session_id, Bytes::from(header)).await;
        self.monitor.broadcast(session_id, Bytes::from(size_inst.encode())).await;
        self.monitor.broadcast(session_id, Bytes::from(ready_inst.encode())).await;

        // Step 8 forwards a 3-arg `size,0,<w>,<h>` to the client — distinct from the 4-arg form
        // recorded/broadcast/replayed above, which also carries the dpi the daemon needs.
        let client_size_inst = Instruction::with_str_args("size", &["0", &width.to_string(), &height.to_string()]);

        let ws_tx = Arc::new(Mutex::new(ws_tx));
        {
            let mut guard = ws_tx.lock().await;
            let ready_text = String::from_utf8_lossy(&ready_inst.encode()).into_owned();
            let size_text = String::from_utf8_lossy(&client_size_inst.encode()).into_owned();
            let _ = guard.send_text(ready_text).await;
            let _ = guard.send_text(size_text).await;
        }

        let recording_path = recorder.as_ref().map(|r| r.path().to_string_lossy().into_owned());
        let (banner_tx, banner_rx) = mpsc::unbounded_channel::<Bytes>();
        self.monitor.set_recorder_sink(session_id, banner_tx).await;

        // Phase C: proxy loop.
        let closed_once = Arc::new(AtomicBool::new(false));
        let bytes_sent = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let (record_tx, record_rx) = mpsc::channel::<Instruction>(RECORDER_QUEUE_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel::<Result<()>>();

        let recorder_task = tokio::spawn(recorder_broadcaster(
            record_rx,
            banner_rx,
            recorder,
            self.monitor.clone(),
            session_id,
        ));
        let d2c_task = tokio::spawn(daemon_to_client(
            daemon_rx,
            ws_tx.clone(),
            record_tx.clone(),
            bytes_received.clone(),
            done_tx,
        ));
        let (c2d_done_tx, c2d_done_rx) = oneshot::channel::<Result<()>>();
        let c2d_task = tokio::spawn(client_to_daemon(ws_rx, daemon_tx.clone(), ws_tx.clone(), bytes_sent.clone(), c2d_done_tx));
        let keepalive_task = tokio::spawn(keepalive(daemon_tx.clone(), closed_once.clone()));

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                closed_once.store(true, Ordering::SeqCst);
                let mut guard = ws_tx.lock().await;
                let _ = guard.close().await;
                Err(GatewayError::Cancelled("request context cancelled".into()))
            }
            result = done_rx => {
                closed_once.store(true, Ordering::SeqCst);
                let mut guard = ws_tx.lock().await;
                let _ = guard.close().await;
                result.unwrap_or_else(|_| Err(GatewayError::transport(std::io::Error::new(std::io::ErrorKind::Other, "daemon worker dropped"))))
            }
            result = c2d_done_rx => {
                closed_once.store(true, Ordering::SeqCst);
                let mut guard = ws_tx.lock().await;
                let _ = guard.close().await;
                result.unwrap_or_else(|_| Err(GatewayError::transport(std::io::Error::new(std::io::ErrorKind::Other, "client worker dropped"))))
            }
        };

        keepalive_task.abort();
        d2c_task.abort();
        c2d_task.abort();
        drop(record_tx);
        let _ = recorder_task.await;

        let stats = SessionStats {
            bytes_sent: bytes_sent.load(Ordering::Relaxed),
            bytes_received: bytes_received.load(Ordering::Relaxed),
            recording_path,
        };
        outcome.map(|()| stats)
    }
}

/// The fixed connect-parameter table (spec §4.6 step 4). Absent keys map to empty string.
fn connect_param_table(
    target: &Target,
    cred: &ResolvedCredential,
    width: u32,
    height: u32,
) -> HashMap<&'static str, String> {
    let mut table = HashMap::new();
    table.insert("hostname", target.hostname.clone());
    table.insert("port", target.port.to_string());
    table.insert("username", cred.username.clone());
    table.insert("password", cred.password.clone().unwrap_or_default());
    table.insert("ignore-cert", "true".to_string());
    table.insert("security", "any".to_string());
    table.insert("disable-bitmap-caching", "false".to_string());
    table.insert("enable-wallpaper", "false".to_string());
    table.insert("enable-theming", "true".to_string());
    table.insert("enable-menu-animations", "false".to_string());
    table.insert("enable-font-smoothing", "false".to_string());
    table.insert("enable-desktop-composition", "false".to_string());
    table.insert("color-depth", "24".to_string());
    table.insert("width", width.to_string());
    table.insert("height", height.to_string());
    table.insert("dpi", "96".to_string());
    table.insert("resize-method", "display-update".to_string());
    table
}

async fn send(daemon_tx: &Arc<Mutex<tokio::net::tcp::OwnedWriteHalf>>, opcode: &str, args: &[&str]) -> Result<()> {
    use tokio::io::AsyncWriteExt;
    let wire = guac::encode(opcode, args.iter().map(|a| a.as_bytes()));
    let mut guard = daemon_tx.lock().await;
    guard
        .write_all(&wire)
        .await
        .map_err(|e| GatewayError::UpstreamUnavailable(format!("write to rendering daemon failed: {e}")))
}

/// Recorder/broadcaster worker (spec §4.6 step 9): decoupled from the forwarding path so a slow
/// disk never stalls the live stream. The channel itself is the drop-on-overflow boundary — the
/// daemon→client worker uses `try_send`, never `send`, into `record_tx`. Also drains `banner_rx`,
/// the monitor bus's recorder sink for this session, so observer start/end banners land in the
/// recording file too (spec §6).
async fn recorder_broadcaster(
    mut queue: mpsc::Receiver<Instruction>,
    mut banner_rx: mpsc::UnboundedReceiver<Bytes>,
    mut recorder: Option<FramedRecording>,
    monitor: MonitorBus,
    session_id: Uuid,
) {
    let mut banners_done = false;
    loop {
        tokio::select! {
            inst = queue.recv() => {
                match inst {
                    Some(inst) => {
                        if let Some(rec) = recorder.as_mut() {
                            let _ = rec.write_instruction(&inst).await;
                        }
                        monitor.broadcast(session_id, Bytes::from(inst.encode())).await;
                    }
                    None => break,
                }
            }
            banner = banner_rx.recv(), if !banners_done => {
                match banner {
                    Some(bytes) => {
                        if let Some(rec) = recorder.as_mut() {
                            let _ = rec.write_raw(&bytes).await;
                        }
                    }
                    None => banners_done = true,
                }
            }
        }
    }
    if let Some(rec) = recorder {
        let _ = rec.stop().await;
    }
}

/// Daemon→client worker (spec §4.6 step 10).
async fn daemon_to_client(
    mut daemon_rx: BufReader<tokio::net::tcp::OwnedReadHalf>,
    ws_tx: Arc<Mutex<Box<dyn WsSender>>>,
    record_tx: mpsc::Sender<Instruction>,
    bytes_received: Arc<AtomicU64>,
    done: oneshot::Sender<Result<()>>,
) {
    loop {
        match guac::decode(&mut daemon_rx).await {
            Ok(inst) => {
                bytes_received.fetch_add(BYTES_PER_INSTRUCTION_APPROX, Ordering::Relaxed);
                let wire = inst.encode();
                let _ = record_tx.try_send(inst);
                let mut guard = ws_tx.lock().await;
                let text = String::from_utf8_lossy(&wire).into_owned();
                if guard.send_text(text).await.is_err() {
                    let _ = done.send(Err(GatewayError::transport(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "websocket send failed",
                    ))));
                    return;
                }
            }
            Err(e) => {
                let _ = done.send(Err(e));
                return;
            }
        }
    }
}

/// Client→daemon worker (spec §4.6 step 11): a client text message may concatenate several
/// instructions; decode zero or more from it. An empty opcode is a client keep-alive.
async fn client_to_daemon(
    mut ws_rx: Box<dyn WsReceiver>,
    daemon_tx: Arc<Mutex<tokio::net::tcp::OwnedWriteHalf>>,
    ws_tx: Arc<Mutex<Box<dyn WsSender>>>,
    bytes_sent: Arc<AtomicU64>,
    done: oneshot::Sender<Result<()>>,
) {
    while let Some(msg) = ws_rx.recv().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                let _ = done.send(Err(e));
                return;
            }
        };
        let text = match msg {
            WsMessage::Close => {
                let _ = done.send(Ok(()));
                return;
            }
            WsMessage::Text(t) => t,
            WsMessage::Binary(b) => String::from_utf8_lossy(&b).into_owned(),
        };
        bytes_sent.fetch_add(text.len() as u64, Ordering::Relaxed);

        let mut cursor = std::io::Cursor::new(text.into_bytes());
        loop {
            if cursor.position() as usize >= cursor.get_ref().len() {
                break;
            }
            match guac::decode(&mut cursor).await {
                Ok(inst) if inst.opcode.is_empty() => {
                    let mut guard = ws_tx.lock().await;
                    let _ = guard.send_text(String::from_utf8_lossy(&Instruction::new("nop", vec![]).encode()).into_owned()).await;
                }
                Ok(inst) => {
                    let wire = inst.encode();
                    use tokio::io::AsyncWriteExt;
                    let mut guard = daemon_tx.lock().await;
                    if guard.write_all(&wire).await.is_err() {
                        let _ = done.send(Err(GatewayError::transport(std::io::Error::new(
                            std::io::ErrorKind::BrokenPipe,
                            "write to rendering daemon failed",
                        ))));
                        return;
                    }
                }
                Err(e) => {
                    let _ = done.send(Err(e));
                    return;
                }
            }
        }
    }
    let _ = done.send(Ok(()));
}

/// Keep-alive worker (spec §4.6 step 12): sends `nop` to the daemon every
/// [`KEEPALIVE_INTERVAL`] until the session ends.
async fn keepalive(daemon_tx: Arc<Mutex<tokio::net::tcp::OwnedWriteHalf>>, closed: Arc<AtomicBool>) {
    let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
    loop {
        ticker.tick().await;
        if closed.load(Ordering::SeqCst) {
            return;
        }
        if send(&daemon_tx, "nop", &[]).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A fake rendering daemon that speaks just enough of the handshake (spec §4.6 Phase A) to
    /// let the proxy complete the connect sequence, then echoes a single `nop` before closing.
    async fn spawn_fake_daemon() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.split();
            let mut reader = BufReader::new(read_half);

            let _select = guac::decode(&mut reader).await.unwrap();
            write_half
                .write_all(&guac::encode("args", [b"hostname".as_slice(), b"port".as_slice()]))
                .await
                .unwrap();

            for _ in 0..4 {
                let _ = guac::decode(&mut reader).await.unwrap();
            }
            let _connect = guac::decode(&mut reader).await.unwrap();
            write_half.write_all(&guac::encode("ready", [b"abc123".as_slice()])).await.unwrap();

            let mut buf = [0u8; 1];
            let _ = reader.read(&mut buf).await;
        });
        addr
    }

    #[tokio::test]
    async fn handshake_completes_against_fake_daemon() {
        let addr = spawn_fake_daemon().await;
        let mut stream = TcpStream::connect(&addr).await.unwrap();
        let (read_half, mut write_half) = stream.split();
        let mut reader = BufReader::new(read_half);

        write_half.write_all(&guac::encode("select", [b"rdp".as_slice()])).await.unwrap();
        let args = guac::decode(&mut reader).await.unwrap();
        assert_eq!(args.opcode, "args");

        write_half.write_all(&guac::encode("size", [b"1024".as_slice(), b"768".as_slice(), b"96".as_slice()])).await.unwrap();
        write_half.write_all(&guac::encode("audio", [b"audio/L16".as_slice()])).await.unwrap();
        write_half.write_all(&guac::encode("video", [b"image/jpeg".as_slice()])).await.unwrap();
        write_half.write_all(&guac::encode("image", [b"image/png".as_slice()])).await.unwrap();
        write_half.write_all(&guac::encode("connect", [b"host".as_slice(), b"3389".as_slice()])).await.unwrap();

        let ready = guac::decode(&mut reader).await.unwrap();
        assert_eq!(ready.opcode, "ready");
        assert_eq!(ready.arg_str(0).unwrap(), "abc123");
    }

    #[test]
    fn connect_param_table_fills_fixed_values() {
        let target = Target {
            id: Uuid::new_v4(),
            name: "t".into(),
            hostname: "10.0.0.5".into(),
            port: 3389,
            protocol: crate::model::Protocol::Rdp,
            enabled: true,
        };
        let cred = ResolvedCredential { username: "alice".into(), password: Some("hunter2".into()), private_key: None };
        let table = connect_param_table(&target, &cred, 1024, 768);
        assert_eq!(table.get("hostname").unwrap(), "10.0.0.5");
        assert_eq!(table.get("security").unwrap(), "any");
        assert_eq!(table.get("width").unwrap(), "1024");
    }

    #[test]
    fn daemon_facing_size_is_the_4_arg_form_with_dpi() {
        let size_inst = Instruction::with_str_args("size", &["0", "1024", "768", "96"]);
        assert_eq!(size_inst.encode(), b"4.size,1.0,4.1024,3.768,2.96;");
    }

    #[test]
    fn client_facing_size_is_the_3_arg_form_without_dpi() {
        let client_size_inst = Instruction::with_str_args("size", &["0", "1024", "768"]);
        assert_eq!(client_size_inst.encode(), b"4.size,1.0,4.1024,3.768;");
    }
}
