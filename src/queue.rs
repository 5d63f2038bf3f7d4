//! Outbound message queue with ACK tracking, retries, and offline buffering
//!
//! Sits between the typed link service and the frame codec. Every outbound
//! payload becomes an [`OutboundMessage`] record: monotonically numbered,
//! status-tracked (`Pending → Sent → Acked`, or `Failed`, or
//! `QueuedOffline`), with a completion signal awaitable by callers that
//! need synchronous delivery.
//!
//! The dispatch task runs at 100 ms cadence:
//!
//! 1. link online and queue non-empty → pop head, assign the next fresh
//!    sequence, encode, transmit, register in the pending-ACK map;
//! 2. pending entries older than `ACK_TIMEOUT` are requeued at the head
//!    with `retries + 1`; at `MAX_RETRIES` the record fails and its
//!    completion signal fires;
//! 3. while the link is offline new sends land in a separate offline
//!    buffer; `set_link_online(true)` drains it back with retries reset.
//!
//! A retransmission always uses a fresh sequence number; a prior sequence
//! is never reused.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::protocol::{self, Frame, SequenceCounter};

/// How long a transmitted message waits for its ACK before a retry.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(3);
/// Total transmit attempts before a message is failed.
pub const MAX_RETRIES: u32 = 3;
/// Dispatch loop cadence.
pub const DISPATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle of an outbound record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageStatus {
    Pending,
    Sent,
    Acked,
    Failed,
    QueuedOffline,
}

impl MessageStatus {
    fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Acked | MessageStatus::Failed)
    }
}

/// Shared handle to one outbound record.
#[derive(Clone)]
pub struct OutboundMessage {
    inner: Arc<OutboundInner>,
}

struct OutboundInner {
    msg_id: u64,
    payload: serde_json::Value,
    state: Mutex<OutboundState>,
    done: Notify,
}

#[derive(Clone, Copy, Debug)]
struct OutboundState {
    status: MessageStatus,
    seq: u16,
    retries: u32,
    sent_at: Option<Instant>,
    first_sent_unix: Option<u32>,
}

impl OutboundMessage {
    fn new(msg_id: u64, payload: serde_json::Value) -> Self {
        Self {
            inner: Arc::new(OutboundInner {
                msg_id,
                payload,
                state: Mutex::new(OutboundState {
                    status: MessageStatus::Pending,
                    seq: 0,
                    retries: 0,
                    sent_at: None,
                    first_sent_unix: None,
                }),
                done: Notify::new(),
            }),
        }
    }

    pub fn msg_id(&self) -> u64 {
        self.inner.msg_id
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.inner.payload
    }

    pub fn status(&self) -> MessageStatus {
        self.inner.state.lock().unwrap().status
    }

    /// Sequence assigned on the most recent transmission.
    pub fn seq(&self) -> u16 {
        self.inner.state.lock().unwrap().seq
    }

    pub fn retries(&self) -> u32 {
        self.inner.state.lock().unwrap().retries
    }

    fn set_status(&self, status: MessageStatus) {
        self.inner.state.lock().unwrap().status = status;
        if status.is_terminal() {
            self.inner.done.notify_waiters();
        }
    }

    /// Wait until the record reaches a terminal state or `timeout` elapses.
    /// Returns true iff the message was ACKed.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.done.notified();
            tokio::pin!(notified);
            // Register before the status check so a completion landing in
            // between cannot be missed.
            notified.as_mut().enable();
            let status = self.status();
            if status.is_terminal() {
                return status == MessageStatus::Acked;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }
}

/// Callback that puts encoded frame bytes on the radio. Returns false when
/// the transmit could not be attempted.
pub type TransmitFn = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;
/// Callback for decoded, replay-checked inbound frames that are not ACKs.
pub type ReceiveFn = Arc<dyn Fn(Frame) + Send + Sync>;

/// The outbound queue and inbound ACK matcher.
pub struct MessageQueue {
    device_id: u32,
    aes_key: Vec<u8>,
    hmac_key: Vec<u8>,
    seq: SequenceCounter,
    transmit: TransmitFn,
    on_receive: Mutex<Option<ReceiveFn>>,
    state: Mutex<QueueState>,
    link_online: AtomicBool,
    running: AtomicBool,
    msg_counter: AtomicU64,
}

#[derive(Default)]
struct QueueState {
    outbound: VecDeque<OutboundMessage>,
    pending_acks: HashMap<u16, OutboundMessage>,
    offline: VecDeque<OutboundMessage>,
}

impl MessageQueue {
    pub fn new(device_id: u32, aes_key: Vec<u8>, hmac_key: Vec<u8>, transmit: TransmitFn) -> Arc<Self> {
        Arc::new(Self {
            device_id,
            aes_key,
            hmac_key,
            seq: SequenceCounter::new(),
            transmit,
            on_receive: Mutex::new(None),
            state: Mutex::new(QueueState::default()),
            link_online: AtomicBool::new(false),
            running: AtomicBool::new(false),
            msg_counter: AtomicU64::new(0),
        })
    }

    /// Register the upstream handler for non-ACK inbound frames.
    pub fn set_receive_handler(&self, handler: ReceiveFn) {
        *self.on_receive.lock().unwrap() = Some(handler);
    }

    /// Spawn the dispatch task. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(DISPATCH_INTERVAL);
            while queue.running.load(Ordering::SeqCst) {
                tick.tick().await;
                queue.dispatch_one();
                queue.check_timeouts();
            }
        });
        info!("message queue started (device 0x{:04X})", self.device_id);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    // -------------------------------------------------------------------------------------------
    // Send API
    // -------------------------------------------------------------------------------------------

    /// Enqueue a payload and return its tracking record.
    ///
    /// While the link is offline the record is parked in the offline buffer
    /// with status `QueuedOffline` instead of entering the outbound queue.
    pub fn send(&self, payload: serde_json::Value) -> OutboundMessage {
        let msg_id = self.msg_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let msg = OutboundMessage::new(msg_id, payload);

        let mut state = self.state.lock().unwrap();
        if self.link_online.load(Ordering::SeqCst) {
            state.outbound.push_back(msg.clone());
            debug!(msg_id, command = %command_of(msg.payload()), "queued outbound message");
        } else {
            msg.set_status(MessageStatus::QueuedOffline);
            state.offline.push_back(msg.clone());
            debug!(msg_id, "link offline, message parked");
        }
        msg
    }

    /// Enqueue and block until the record resolves or `timeout` elapses.
    /// Returns true iff ACKed.
    pub async fn send_and_wait(&self, payload: serde_json::Value, timeout: Duration) -> bool {
        let msg = self.send(payload);
        msg.wait(timeout).await
    }

    // -------------------------------------------------------------------------------------------
    // Link status
    // -------------------------------------------------------------------------------------------

    /// Update the link-online flag; a rising edge drains the offline buffer
    /// back into the outbound queue with retries reset.
    pub fn set_link_online(&self, online: bool) {
        let was = self.link_online.swap(online, Ordering::SeqCst);
        if online && !was {
            let mut state = self.state.lock().unwrap();
            let drained = state.offline.len();
            while let Some(msg) = state.offline.pop_front() {
                {
                    let mut s = msg.inner.state.lock().unwrap();
                    s.status = MessageStatus::Pending;
                    s.retries = 0;
                }
                state.outbound.push_back(msg);
            }
            if drained > 0 {
                info!(drained, "link online, offline buffer flushed");
            }
        }
    }

    pub fn link_online(&self) -> bool {
        self.link_online.load(Ordering::SeqCst)
    }

    /// Messages waiting to go out (active + offline).
    pub fn queue_depth(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.outbound.len() + state.offline.len()
    }

    pub fn pending_ack_count(&self) -> usize {
        self.state.lock().unwrap().pending_acks.len()
    }

    // -------------------------------------------------------------------------------------------
    // Receive path
    // -------------------------------------------------------------------------------------------

    /// Process raw inbound frame bytes: decode, replay-check, match ACKs,
    /// and hand everything else to the upstream handler.
    ///
    /// Decode and replay failures are logged and swallowed; a bad frame
    /// never propagates further up.
    pub fn receive_frame(&self, raw: &[u8]) {
        let frame = match protocol::decode(raw, &self.aes_key, &self.hmac_key) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "discarding undecodable frame");
                return;
            }
        };

        let now_unix = chrono::Utc::now().timestamp() as u32;
        if let Err(e) = self
            .seq
            .check_and_update(frame.device_id, frame.seq, frame.timestamp, now_unix)
        {
            warn!(error = %e, "discarding replayed frame");
            return;
        }

        let command = command_of(&frame.payload);
        let ack_seq = frame.payload.get("ack_seq").and_then(|v| v.as_u64());
        if command.ends_with("_ACK") || ack_seq.is_some() {
            if let Some(seq) = ack_seq {
                self.handle_ack(seq as u16);
            }
            return;
        }

        let handler = self.on_receive.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(frame);
        }
    }

    fn handle_ack(&self, ack_seq: u16) {
        let msg = self.state.lock().unwrap().pending_acks.remove(&ack_seq);
        if let Some(msg) = msg {
            debug!(ack_seq, msg_id = msg.msg_id(), "ACK received");
            msg.set_status(MessageStatus::Acked);
        }
    }

    // -------------------------------------------------------------------------------------------
    // Dispatch internals
    // -------------------------------------------------------------------------------------------

    fn dispatch_one(&self) {
        if !self.link_online.load(Ordering::SeqCst) {
            // Anything still sitting in the outbound queue when the link
            // drops gets parked rather than burned through retries.
            let mut state = self.state.lock().unwrap();
            while let Some(msg) = state.outbound.pop_front() {
                msg.set_status(MessageStatus::QueuedOffline);
                state.offline.push_back(msg);
            }
            return;
        }

        let msg = {
            let mut state = self.state.lock().unwrap();
            state.outbound.pop_front()
        };
        let Some(msg) = msg else { return };

        let seq = self.seq.next();
        let now_unix = chrono::Utc::now().timestamp() as u32;
        let frame = match protocol::encode(
            msg.payload(),
            self.device_id,
            seq,
            now_unix,
            &self.aes_key,
            &self.hmac_key,
        ) {
            Ok(f) => f,
            Err(e) => {
                warn!(msg_id = msg.msg_id(), error = %e, "failed to encode message");
                msg.set_status(MessageStatus::Failed);
                return;
            }
        };

        let ok = (self.transmit)(&frame);
        if ok {
            {
                let mut s = msg.inner.state.lock().unwrap();
                s.status = MessageStatus::Sent;
                s.seq = seq;
                s.sent_at = Some(Instant::now());
                s.first_sent_unix.get_or_insert(now_unix);
            }
            // ACK replies and heartbeats are fire-and-forget; the peer
            // never acknowledges them, so tracking them would only burn
            // retries.
            let command = command_of(msg.payload());
            if command.ends_with("_ACK") || command == "HEARTBEAT" {
                msg.set_status(MessageStatus::Acked);
            } else {
                self.state.lock().unwrap().pending_acks.insert(seq, msg.clone());
            }
            debug!(msg_id = msg.msg_id(), seq, "message transmitted");
        } else {
            self.retry_or_fail(msg, "transmit failed");
        }
    }

    fn check_timeouts(&self) {
        let now = Instant::now();
        let timed_out: Vec<(u16, OutboundMessage)> = {
            let state = self.state.lock().unwrap();
            state
                .pending_acks
                .iter()
                .filter(|(_, m)| {
                    m.inner
                        .state
                        .lock()
                        .unwrap()
                        .sent_at
                        .is_some_and(|t| now.duration_since(t) > ACK_TIMEOUT)
                })
                .map(|(seq, m)| (*seq, m.clone()))
                .collect()
        };

        // Requeue lowest message id first so original enqueue order holds.
        let mut timed_out = timed_out;
        timed_out.sort_by_key(|(_, m)| std::cmp::Reverse(m.msg_id()));
        for (seq, msg) in timed_out {
            self.state.lock().unwrap().pending_acks.remove(&seq);
            self.retry_or_fail(msg, "ACK timeout");
        }
    }

    fn retry_or_fail(&self, msg: OutboundMessage, why: &str) {
        let retries = {
            let mut s = msg.inner.state.lock().unwrap();
            s.retries += 1;
            s.retries
        };
        if retries < MAX_RETRIES {
            debug!(msg_id = msg.msg_id(), retries, why, "requeueing message");
            self.state.lock().unwrap().outbound.push_front(msg);
        } else {
            warn!(msg_id = msg.msg_id(), why, "message failed after {MAX_RETRIES} attempts");
            msg.set_status(MessageStatus::Failed);
        }
    }
}

fn command_of(payload: &serde_json::Value) -> &str {
    payload.get("command").and_then(|v| v.as_str()).unwrap_or("?")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DEVICE_BENCH, DEVICE_LAB};
    use serde_json::json;

    const AES_KEY: [u8; 32] = [0x11; 32];
    const HMAC_KEY: [u8; 32] = [0x22; 32];

    fn capture_queue() -> (Arc<MessageQueue>, Arc<Mutex<Vec<Vec<u8>>>>) {
        let captured: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        let transmit: TransmitFn = Arc::new(move |frame: &[u8]| {
            sink.lock().unwrap().push(frame.to_vec());
            true
        });
        let queue = MessageQueue::new(DEVICE_BENCH, AES_KEY.to_vec(), HMAC_KEY.to_vec(), transmit);
        (queue, captured)
    }

    fn lab_ack(seq_to_ack: u16, lab_seq: u16) -> Vec<u8> {
        let payload = json!({ "command": "TEST_STATUS_ACK", "ack_seq": seq_to_ack });
        protocol::encode(
            &payload,
            DEVICE_LAB,
            lab_seq,
            chrono::Utc::now().timestamp() as u32,
            &AES_KEY,
            &HMAC_KEY,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn offline_sends_queue_then_flush_in_order() {
        let (queue, captured) = capture_queue();
        queue.start();

        let msgs: Vec<OutboundMessage> = (0..5)
            .map(|i| queue.send(json!({ "command": "TEST_STATUS", "n": i })))
            .collect();

        tokio::time::advance(Duration::from_millis(500)).await;
        for m in &msgs {
            assert_eq!(m.status(), MessageStatus::QueuedOffline);
        }
        assert!(captured.lock().unwrap().is_empty());
        assert_eq!(queue.queue_depth(), 5);

        queue.set_link_online(true);
        tokio::time::advance(Duration::from_secs(1)).await;

        // All five transmitted, in original enqueue order.
        let frames = captured.lock().unwrap().clone();
        assert_eq!(frames.len(), 5);
        for (i, raw) in frames.iter().enumerate() {
            let frame = protocol::decode(raw, &AES_KEY, &HMAC_KEY).unwrap();
            assert_eq!(frame.payload["n"], i as u64);
        }

        // ACK each one and watch the records resolve.
        for (i, m) in msgs.iter().enumerate() {
            queue.receive_frame(&lab_ack(m.seq(), i as u16));
            assert_eq!(m.status(), MessageStatus::Acked);
        }
        assert_eq!(queue.pending_ack_count(), 0);
        queue.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_message_retries_then_fails() {
        let (queue, captured) = capture_queue();
        queue.set_link_online(true);
        queue.start();

        let msg = queue.send(json!({ "command": "TEST_RESULT", "test_id": 1 }));
        // 3 attempts, 3 s apart, then failure.
        let acked = msg.wait(Duration::from_secs(15)).await;
        assert!(!acked);
        assert_eq!(msg.status(), MessageStatus::Failed);
        assert_eq!(msg.retries(), MAX_RETRIES);
        assert_eq!(captured.lock().unwrap().len(), 3);

        // Each retransmission used a fresh sequence.
        let seqs: Vec<u16> = captured
            .lock()
            .unwrap()
            .iter()
            .map(|raw| protocol::decode(raw, &AES_KEY, &HMAC_KEY).unwrap().seq)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        queue.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn send_and_wait_resolves_on_ack() {
        let (queue, captured) = capture_queue();
        queue.set_link_online(true);
        queue.start();

        let q2 = Arc::clone(&queue);
        let cap = Arc::clone(&captured);
        let acker = tokio::spawn(async move {
            loop {
                let raw = cap.lock().unwrap().first().cloned();
                if let Some(raw) = raw {
                    let frame = protocol::decode(&raw, &AES_KEY, &HMAC_KEY).unwrap();
                    q2.receive_frame(&lab_ack(frame.seq, 0));
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

        let ok = queue
            .send_and_wait(json!({ "command": "TEST_COMPLETE" }), Duration::from_secs(10))
            .await;
        assert!(ok);
        acker.await.unwrap();
        queue.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn non_ack_frames_reach_the_handler_once() {
        let (queue, _captured) = capture_queue();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        queue.set_receive_handler(Arc::new(move |frame: Frame| {
            sink.lock()
                .unwrap()
                .push(frame.payload["command"].as_str().unwrap().to_string());
        }));

        let payload = json!({ "command": "START_TEST", "test_id": 9 });
        let raw = protocol::encode(
            &payload,
            DEVICE_LAB,
            5,
            chrono::Utc::now().timestamp() as u32,
            &AES_KEY,
            &HMAC_KEY,
        )
        .unwrap();

        queue.receive_frame(&raw);
        // Duplicate delivery is replay-rejected.
        queue.receive_frame(&raw);
        assert_eq!(seen.lock().unwrap().as_slice(), ["START_TEST"]);
    }
}
