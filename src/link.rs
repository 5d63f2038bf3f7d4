//! Secure link service to the remote lab
//!
//! Sits on top of the message queue → fragmenter → frame codec → crypto
//! stack and presents typed messages to the rest of the bench. The radio
//! itself is a UART-attached modem speaking one JSON line per fragment:
//!
//! ```text
//! → {"cmd":"LORA_SEND","data":"<base64 fragment>"}
//! ← {"event":"LORA_RX","data":"<base64 fragment>"}
//! ```
//!
//! The service owns three tasks: the queue dispatcher (inside
//! [`MessageQueue`]), the receive loop, and a 30 s heartbeat producer.
//!
//! Auto-ACK policy: a START_TEST is answered with START_TEST_ACK and an
//! EMERGENCY_STOP with EMERGENCY_ACK **before** the registered user
//! handler runs. No other message type is auto-acknowledged.
//!
//! Health: `Stopped`, `Offline`, `Degraded` (link up but no heartbeat
//! sent within 3× the heartbeat interval), `Online`. A 200-entry circular
//! history records TX/RX with short human summaries for the UI.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::protocol::{self, Fragment, Frame, Reassembler};
use crate::queue::{MessageQueue, MessageStatus, OutboundMessage};
use crate::report::{PointResult, RunSummary};

/// Heartbeat cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// TX/RX history depth.
pub const HISTORY_LEN: usize = 200;

// ===============================================================================================
// Wire types
// ===============================================================================================

#[derive(Serialize)]
struct RadioSend<'a> {
    cmd: &'static str,
    data: &'a str,
}

#[derive(Deserialize)]
struct RadioLine {
    #[serde(default)]
    cmd: Option<String>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    data: Option<String>,
}

/// Typed inbound messages from the lab.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum LabMessage {
    #[serde(rename = "START_TEST")]
    StartTest {
        test_id: u64,
        #[serde(default)]
        meter_serial: Option<String>,
        #[serde(default)]
        meter_size: Option<String>,
        #[serde(default)]
        test_class: Option<String>,
        #[serde(default)]
        dut_mode: Option<String>,
    },
    #[serde(rename = "EMERGENCY_STOP")]
    EmergencyStop {
        #[serde(default)]
        reason: String,
    },
    #[serde(rename = "RESULT_REQUEST")]
    ResultRequest { test_id: u64 },
    #[serde(rename = "APPROVAL_STATUS")]
    ApprovalStatus {
        test_id: u64,
        #[serde(default)]
        approved: bool,
    },
}

/// Link health as reported to the UI and the lab.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkHealth {
    Stopped,
    Offline,
    Degraded,
    Online,
}

/// Direction tag for the history buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Tx,
    Rx,
}

/// One history line.
#[derive(Clone, Debug, Serialize)]
pub struct HistoryEntry {
    pub direction: Direction,
    pub summary: String,
    pub at_unix: f64,
}

/// A synchronous send that did not resolve.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("no ACK for message {msg_id} within {timeout:?}")]
    LinkTimeout { msg_id: u64, timeout: Duration },
    #[error("message {msg_id} failed after retries")]
    Failed { msg_id: u64 },
}

/// Handler signature for typed inbound messages.
pub type LabHandler = Box<dyn Fn(&LabMessage) + Send + Sync>;

struct Handlers {
    start_test: Vec<LabHandler>,
    emergency_stop: Vec<LabHandler>,
    result_request: Vec<LabHandler>,
    approval_status: Vec<LabHandler>,
}

// ===============================================================================================
// Service
// ===============================================================================================

/// The bench side of the bench↔lab radio link.
pub struct LinkService {
    device_id: u32,
    queue: Arc<MessageQueue>,
    handlers: Mutex<Handlers>,
    history: Mutex<VecDeque<HistoryEntry>>,
    running: AtomicBool,
    heartbeat_interval: Option<Duration>,
    last_heartbeat: Mutex<Option<Instant>>,
    frag_counter: AtomicU32,
    radio_tx: mpsc::Sender<String>,
}

impl LinkService {
    /// Build and start the service over a line-based radio transport.
    ///
    /// `radio_tx`/`radio_rx` carry raw modem lines; `serial_radio` opens a
    /// real UART pair, tests wire channels directly. `heartbeat` of `None`
    /// disables the producer.
    pub fn start(
        device_id: u32,
        aes_key: Vec<u8>,
        hmac_key: Vec<u8>,
        radio_tx: mpsc::Sender<String>,
        radio_rx: mpsc::Receiver<String>,
        initially_online: bool,
        heartbeat: Option<Duration>,
    ) -> Arc<Self> {
        let service = Arc::new_cyclic(|weak: &Weak<LinkService>| {
            let tx_for_transmit = radio_tx.clone();
            let weak_for_transmit = weak.clone();
            let transmit: crate::queue::TransmitFn = Arc::new(move |frame: &[u8]| {
                let Some(service) = weak_for_transmit.upgrade() else {
                    return false;
                };
                service.transmit_frame(&tx_for_transmit, frame)
            });

            let queue = MessageQueue::new(device_id, aes_key, hmac_key, transmit);
            let weak_for_receive = weak.clone();
            queue.set_receive_handler(Arc::new(move |frame: Frame| {
                if let Some(service) = weak_for_receive.upgrade() {
                    service.dispatch_incoming(frame);
                }
            }));

            LinkService {
                device_id,
                queue,
                handlers: Mutex::new(Handlers {
                    start_test: Vec::new(),
                    emergency_stop: Vec::new(),
                    result_request: Vec::new(),
                    approval_status: Vec::new(),
                }),
                history: Mutex::new(VecDeque::with_capacity(HISTORY_LEN)),
                running: AtomicBool::new(true),
                heartbeat_interval: heartbeat,
                last_heartbeat: Mutex::new(None),
                frag_counter: AtomicU32::new(0),
                radio_tx,
            }
        });

        service.queue.set_link_online(initially_online);
        service.queue.start();
        service.spawn_receive_loop(radio_rx);
        if let Some(interval) = heartbeat {
            service.spawn_heartbeat(interval);
        }
        info!(
            online = initially_online,
            "link service started (device 0x{device_id:04X})"
        );
        service
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.queue.stop();
        info!("link service stopped");
    }

    /// Mark the radio link up or down; a rising edge flushes the queue's
    /// offline buffer.
    pub fn set_link_online(&self, online: bool) {
        self.queue.set_link_online(online);
    }

    pub fn health(&self) -> LinkHealth {
        if !self.running.load(Ordering::SeqCst) {
            return LinkHealth::Stopped;
        }
        if !self.queue.link_online() {
            return LinkHealth::Offline;
        }
        let interval = self.heartbeat_interval.unwrap_or(HEARTBEAT_INTERVAL);
        let fresh = self
            .last_heartbeat
            .lock()
            .unwrap()
            .is_some_and(|t| t.elapsed() <= interval * 3);
        if fresh {
            LinkHealth::Online
        } else {
            LinkHealth::Degraded
        }
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().unwrap().iter().cloned().collect()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.queue_depth()
    }

    // -------------------------------------------------------------------------------------------
    // Outbound: bench → lab
    // -------------------------------------------------------------------------------------------

    /// Periodic test status during an active run.
    pub fn send_test_status(
        &self,
        test_id: u64,
        q_point: &str,
        state: &str,
        flow_lph: f64,
        pressure_bar: f64,
        temp_c: f64,
    ) -> OutboundMessage {
        self.send_logged(
            serde_json::json!({
                "command": "TEST_STATUS",
                "test_id": test_id,
                "q_point": q_point,
                "state": state,
                "flow_rate_lph": round1(flow_lph),
                "pressure_up_bar": round2(pressure_bar),
                "temperature_c": round1(temp_c),
            }),
            format!("TEST_STATUS #{test_id} {q_point} {state}"),
        )
    }

    /// One Q-point result after CALCULATE.
    pub fn send_test_result(&self, test_id: u64, point: &PointResult) -> OutboundMessage {
        let mut payload = serde_json::to_value(point).unwrap_or_default();
        if let Some(map) = payload.as_object_mut() {
            map.insert("command".into(), "TEST_RESULT".into());
            map.insert("test_id".into(), test_id.into());
        }
        self.send_logged(
            payload,
            format!("TEST_RESULT #{test_id} {}", point.q_point),
        )
    }

    /// Completion summary with the overall verdict.
    pub fn send_test_complete(&self, summary: &RunSummary) -> OutboundMessage {
        let mut payload = serde_json::to_value(summary).unwrap_or_default();
        if let Some(map) = payload.as_object_mut() {
            map.insert("command".into(), "TEST_COMPLETE".into());
            // The lab keeps its own per-point records from TEST_RESULT.
            map.remove("points");
        }
        self.send_logged(
            payload,
            format!("TEST_COMPLETE #{}", summary.test_id),
        )
    }

    fn send_start_test_ack(&self, test_id: u64, ack_seq: u16) -> OutboundMessage {
        self.send_logged(
            serde_json::json!({
                "command": "START_TEST_ACK",
                "test_id": test_id,
                "status": "acknowledged",
                "ack_seq": ack_seq,
            }),
            format!("START_TEST_ACK #{test_id}"),
        )
    }

    fn send_emergency_ack(&self, reason: &str, ack_seq: u16) -> OutboundMessage {
        self.send_logged(
            serde_json::json!({
                "command": "EMERGENCY_ACK",
                "status": "aborted",
                "reason": reason,
                "ack_seq": ack_seq,
            }),
            "EMERGENCY_ACK".to_string(),
        )
    }

    /// Liveness beacon; also timestamps the health calculation.
    pub fn send_heartbeat(&self) -> OutboundMessage {
        *self.last_heartbeat.lock().unwrap() = Some(Instant::now());
        self.send_logged(
            serde_json::json!({
                "command": "HEARTBEAT",
                "device_id": self.device_id,
                "status": "online",
            }),
            "HEARTBEAT".to_string(),
        )
    }

    /// Enqueue an arbitrary payload and wait for its ACK.
    pub async fn send_and_wait(
        &self,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<(), LinkError> {
        let summary = payload
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("?")
            .to_string();
        let msg = self.send_logged(payload, summary);
        if msg.wait(timeout).await {
            return Ok(());
        }
        match msg.status() {
            MessageStatus::Failed => Err(LinkError::Failed { msg_id: msg.msg_id() }),
            _ => Err(LinkError::LinkTimeout {
                msg_id: msg.msg_id(),
                timeout,
            }),
        }
    }

    fn send_logged(&self, payload: serde_json::Value, summary: String) -> OutboundMessage {
        self.push_history(Direction::Tx, summary);
        self.queue.send(payload)
    }

    // -------------------------------------------------------------------------------------------
    // Inbound: lab → bench
    // -------------------------------------------------------------------------------------------

    pub fn on_start_test(&self, handler: LabHandler) {
        self.handlers.lock().unwrap().start_test.push(handler);
    }

    pub fn on_emergency_stop(&self, handler: LabHandler) {
        self.handlers.lock().unwrap().emergency_stop.push(handler);
    }

    pub fn on_result_request(&self, handler: LabHandler) {
        self.handlers.lock().unwrap().result_request.push(handler);
    }

    pub fn on_approval_status(&self, handler: LabHandler) {
        self.handlers.lock().unwrap().approval_status.push(handler);
    }

    fn dispatch_incoming(&self, frame: Frame) {
        let message: LabMessage = match serde_json::from_value(frame.payload.clone()) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, payload = %frame.payload, "unhandled lab message");
                return;
            }
        };
        self.push_history(Direction::Rx, summarize_lab(&message));

        // Auto-ACK precedes user dispatch for the two commands that
        // require it.
        match &message {
            LabMessage::StartTest { test_id, .. } => {
                self.send_start_test_ack(*test_id, frame.seq);
            }
            LabMessage::EmergencyStop { reason } => {
                self.send_emergency_ack(reason, frame.seq);
            }
            _ => {}
        }

        let handlers = self.handlers.lock().unwrap();
        let list = match &message {
            LabMessage::StartTest { .. } => &handlers.start_test,
            LabMessage::EmergencyStop { .. } => &handlers.emergency_stop,
            LabMessage::ResultRequest { .. } => &handlers.result_request,
            LabMessage::ApprovalStatus { .. } => &handlers.approval_status,
        };
        for handler in list {
            handler(&message);
        }
    }

    // -------------------------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------------------------

    /// Fragment a frame and push each piece to the modem as one line.
    fn transmit_frame(&self, tx: &mpsc::Sender<String>, frame: &[u8]) -> bool {
        let group = (self.frag_counter.fetch_add(1, Ordering::SeqCst) & 0xFF) as u8;
        for frag in protocol::fragment(frame, group) {
            let data = BASE64.encode(frag.to_bytes());
            let line = serde_json::to_string(&RadioSend {
                cmd: "LORA_SEND",
                data: &data,
            })
            .expect("radio line serializes");
            if tx.try_send(line).is_err() {
                debug!("radio transmit channel full or closed");
                return false;
            }
        }
        true
    }

    fn spawn_receive_loop(self: &Arc<Self>, mut radio_rx: mpsc::Receiver<String>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut reassembler = Reassembler::new();
            while let Some(line) = radio_rx.recv().await {
                if !service.running.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(parsed) = serde_json::from_str::<RadioLine>(&line) else {
                    continue;
                };
                let is_rx = parsed.event.as_deref() == Some("LORA_RX")
                    || parsed.cmd.as_deref() == Some("LORA_RX");
                let Some(data) = parsed.data.filter(|_| is_rx) else {
                    continue;
                };
                let Ok(raw) = BASE64.decode(data.as_bytes()) else {
                    debug!("undecodable radio payload");
                    continue;
                };
                match Fragment::from_bytes(&raw) {
                    Ok(frag) => {
                        if let Some(frame) = reassembler.add(frag) {
                            service.queue.receive_frame(&frame);
                        }
                    }
                    Err(e) => debug!(error = %e, "bad fragment"),
                }
                reassembler.sweep();
            }
        });
    }

    fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            while service.running.load(Ordering::SeqCst) {
                tick.tick().await;
                service.send_heartbeat();
            }
        });
    }

    fn push_history(&self, direction: Direction, summary: String) {
        let mut history = self.history.lock().unwrap();
        if history.len() == HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(HistoryEntry {
            direction,
            summary,
            at_unix: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        });
    }
}

fn summarize_lab(message: &LabMessage) -> String {
    match message {
        LabMessage::StartTest { test_id, .. } => format!("START_TEST #{test_id}"),
        LabMessage::EmergencyStop { reason } => format!("EMERGENCY_STOP {reason}"),
        LabMessage::ResultRequest { test_id } => format!("RESULT_REQUEST #{test_id}"),
        LabMessage::ApprovalStatus { test_id, approved } => {
            format!("APPROVAL_STATUS #{test_id} approved={approved}")
        }
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Open the radio UART and pump it into line channels.
///
/// Returns `(tx, rx)` halves suitable for [`LinkService::start`]. Each
/// direction runs in its own task; dropped channels end the tasks.
pub fn serial_radio(
    port: &str,
    baud: u32,
) -> std::io::Result<(mpsc::Sender<String>, mpsc::Receiver<String>)> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio_serial::SerialPortBuilderExt;

    let stream = tokio_serial::new(port, baud)
        .open_native_async()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    let (read_half, mut write_half) = tokio::io::split(stream);

    let (tx_out, mut rx_out) = mpsc::channel::<String>(64);
    tokio::spawn(async move {
        while let Some(mut line) = rx_out.recv().await {
            line.push('\n');
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let (tx_in, rx_in) = mpsc::channel::<String>(64);
    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx_in.send(line).await.is_err() {
                break;
            }
        }
    });

    Ok((tx_out, rx_in))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DEVICE_BENCH, DEVICE_LAB};

    const AES_KEY: [u8; 32] = [0x33; 32];
    const HMAC_KEY: [u8; 32] = [0x44; 32];

    struct LabSide {
        link: Arc<LinkService>,
        /// Lines the bench pushed toward the modem.
        from_bench: mpsc::Receiver<String>,
        /// Feed lines into the bench as if the modem received them.
        to_bench: mpsc::Sender<String>,
        lab_seq: u16,
    }

    fn harness(online: bool) -> LabSide {
        let (bench_tx, from_bench) = mpsc::channel(64);
        let (to_bench, bench_rx) = mpsc::channel(64);
        let link = LinkService::start(
            DEVICE_BENCH,
            AES_KEY.to_vec(),
            HMAC_KEY.to_vec(),
            bench_tx,
            bench_rx,
            online,
            None,
        );
        LabSide {
            link,
            from_bench,
            to_bench,
            lab_seq: 0,
        }
    }

    impl LabSide {
        fn decode_line(line: &str) -> Frame {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(parsed["cmd"], "LORA_SEND");
            let raw = BASE64
                .decode(parsed["data"].as_str().unwrap().as_bytes())
                .unwrap();
            let frag = Fragment::from_bytes(&raw).unwrap();
            assert_eq!(frag.total, 1);
            protocol::decode(&frag.data, &AES_KEY, &HMAC_KEY).unwrap()
        }

        async fn push_from_lab(&mut self, payload: serde_json::Value) {
            self.lab_seq += 1;
            let frame = protocol::encode(
                &payload,
                DEVICE_LAB,
                self.lab_seq,
                chrono::Utc::now().timestamp() as u32,
                &AES_KEY,
                &HMAC_KEY,
            )
            .unwrap();
            for frag in protocol::fragment(&frame, 1) {
                let line = serde_json::json!({
                    "event": "LORA_RX",
                    "data": BASE64.encode(frag.to_bytes()),
                })
                .to_string();
                self.to_bench.send(line).await.unwrap();
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn typed_send_reaches_the_wire() {
        let mut lab = harness(true);
        lab.link.send_test_status(7, "Q2", "MEASURE", 999.96, 3.456, 21.04);
        tokio::time::advance(Duration::from_millis(300)).await;

        let line = lab.from_bench.try_recv().unwrap();
        let frame = LabSide::decode_line(&line);
        assert_eq!(frame.device_id, DEVICE_BENCH);
        assert_eq!(frame.payload["command"], "TEST_STATUS");
        assert_eq!(frame.payload["q_point"], "Q2");
        assert_eq!(frame.payload["flow_rate_lph"], 1000.0);
        assert_eq!(frame.payload["pressure_up_bar"], 3.46);

        let history = lab.link.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].direction, Direction::Tx);
        assert!(history[0].summary.contains("TEST_STATUS"));
    }

    #[tokio::test(start_paused = true)]
    async fn start_test_is_acked_before_user_dispatch() {
        let mut lab = harness(true);
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        lab.link.on_start_test(Box::new(move |message| {
            assert!(matches!(message, LabMessage::StartTest { test_id: 42, .. }));
            seen.lock().unwrap().push("handler");
        }));

        lab.push_from_lab(serde_json::json!({
            "command": "START_TEST",
            "test_id": 42,
            "meter_serial": "WM-1001",
            "meter_size": "DN15",
            "test_class": "B",
        }))
        .await;
        tokio::time::advance(Duration::from_millis(300)).await;

        // The ACK was enqueued by dispatch (before the handler ran) and
        // carries the lab frame's sequence.
        let line = lab.from_bench.try_recv().unwrap();
        let frame = LabSide::decode_line(&line);
        assert_eq!(frame.payload["command"], "START_TEST_ACK");
        assert_eq!(frame.payload["ack_seq"], 1);
        assert_eq!(order.lock().unwrap().as_slice(), ["handler"]);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_stop_autoacks_and_dispatches() {
        let mut lab = harness(true);
        let hit = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&hit);
        lab.link.on_emergency_stop(Box::new(move |message| {
            if let LabMessage::EmergencyStop { reason } = message {
                assert_eq!(reason, "lab operator");
                flag.store(true, Ordering::SeqCst);
            }
        }));

        lab.push_from_lab(serde_json::json!({
            "command": "EMERGENCY_STOP",
            "reason": "lab operator",
        }))
        .await;
        tokio::time::advance(Duration::from_millis(300)).await;

        assert!(hit.load(Ordering::SeqCst));
        let line = lab.from_bench.try_recv().unwrap();
        let frame = LabSide::decode_line(&line);
        assert_eq!(frame.payload["command"], "EMERGENCY_ACK");
        assert_eq!(frame.payload["reason"], "lab operator");
    }

    #[tokio::test(start_paused = true)]
    async fn health_tracks_link_and_heartbeat() {
        let lab = harness(false);
        assert_eq!(lab.link.health(), LinkHealth::Offline);

        lab.link.set_link_online(true);
        // Link up, but no heartbeat has ever been sent.
        assert_eq!(lab.link.health(), LinkHealth::Degraded);

        lab.link.send_heartbeat();
        assert_eq!(lab.link.health(), LinkHealth::Online);

        // Silence for more than 3× the interval degrades the link.
        tokio::time::advance(HEARTBEAT_INTERVAL * 3 + Duration::from_secs(1)).await;
        assert_eq!(lab.link.health(), LinkHealth::Degraded);

        lab.link.stop();
        assert_eq!(lab.link.health(), LinkHealth::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_send_resolves_into_typed_errors() {
        let lab = harness(true);
        // Transmitted but never acknowledged inside the wait window.
        let err = lab
            .link
            .send_and_wait(
                serde_json::json!({ "command": "TEST_RESULT", "test_id": 1 }),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::LinkTimeout { .. }));

        // Waiting past the full retry schedule yields the terminal error.
        let err = lab
            .link
            .send_and_wait(
                serde_json::json!({ "command": "TEST_RESULT", "test_id": 2 }),
                Duration::from_secs(30),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Failed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn large_payloads_fragment_and_reassemble() {
        let mut lab = harness(true);
        // A payload fat enough to exceed one radio packet after padding.
        let blob: String = "x".repeat(600);
        lab.push_from_lab(serde_json::json!({
            "command": "APPROVAL_STATUS",
            "test_id": 9,
            "approved": true,
            "note": blob,
        }))
        .await;

        let hit = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&hit);
        lab.link.on_approval_status(Box::new(move |message| {
            assert!(matches!(
                message,
                LabMessage::ApprovalStatus { test_id: 9, approved: true }
            ));
            flag.store(true, Ordering::SeqCst);
        }));

        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(hit.load(Ordering::SeqCst));
    }
}
