/* Queued device I/O.
 *
 * One logical serial port per device: every operation runs through a
 * single FIFO lock so no two I/Os are ever in flight simultaneously and
 * a planned multi-command sequence can never be interleaved with an
 * ad-hoc read. Failures propagate to the caller; the queue itself is
 * never poisoned; the next waiter simply acquires the lock.
 *
 * Report lengths come from the HID descriptor when it enumerates them,
 * otherwise from probing a candidate set; both paths are kept because
 * host HID stacks differ in what they report. */

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::command::{AckMatcher, Command};
use crate::error::{MouseError, Result};
use crate::features::{GateSpec, KeepaliveFn};
use crate::hid::{self, HidDevice};

/* Probed when the descriptor does not declare a length for the report
 * id. The payload's own length is always tried first. */
pub const REPORT_LEN_CANDIDATES: &[usize] = &[6, 7, 8, 19, 20, 32, 64, 128];

#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub send_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub drain_timeout_ms: u64,
    pub drain_reads: u8,
    pub ack_retry_count: u8,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 1200,
            ack_timeout_ms: 350,
            drain_timeout_ms: 140,
            drain_reads: 2,
            ack_retry_count: 1,
        }
    }
}

pub struct Transport {
    dev: Arc<dyn HidDevice>,
    cfg: TransportConfig,
    keepalive: Option<KeepaliveFn>,
    /* The SendQueue: a fair mutex is a FIFO by arrival order. */
    lock: Mutex<()>,
    /* Resolved report lengths, from the descriptor or a past probe. */
    report_lens: StdMutex<HashMap<u8, usize>>,
}

impl Transport {
    pub fn new(dev: Arc<dyn HidDevice>, cfg: TransportConfig, keepalive: Option<KeepaliveFn>) -> Self {
        Self {
            dev,
            cfg,
            keepalive,
            lock: Mutex::new(()),
            report_lens: StdMutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.cfg
    }

    pub fn device(&self) -> &Arc<dyn HidDevice> {
        &self.dev
    }

    /* ------------------------------------------------------------- */
    /* Public operations (each takes the queue for its duration)      */
    /* ------------------------------------------------------------- */

    pub async fn send(&self, report_id: u8, bytes: &[u8]) -> Result<()> {
        let _queue = self.lock.lock().await;
        self.send_raw(report_id, bytes).await
    }

    pub async fn send_and_recv_feature(
        &self,
        report_id: u8,
        bytes: &[u8],
        feature_report_id: u8,
        wait_ms: u16,
    ) -> Result<Vec<u8>> {
        let _queue = self.lock.lock().await;
        self.send_raw(report_id, bytes).await?;
        sleep(Duration::from_millis(u64::from(wait_ms))).await;
        self.recv_feature_raw(feature_report_id).await
    }

    /* Send, read the named feature report, parse. When the parse fails
     * with `CmdMismatch` the device has re-emitted a stale frame: up to
     * `drain_reads` further reads are attempted with a short timeout
     * and the first parse that succeeds wins. The original mismatch is
     * surfaced if none does. */
    pub async fn request_feature<T>(
        &self,
        report_id: u8,
        bytes: &[u8],
        feature_report_id: u8,
        wait_ms: u16,
        parse: impl Fn(&[u8]) -> Result<T>,
    ) -> Result<T> {
        let _queue = self.lock.lock().await;
        self.request_feature_raw(report_id, bytes, feature_report_id, wait_ms, parse, true)
            .await
    }

    /* Strict variant: a stale frame fails immediately, no drain. */
    pub async fn request_feature_strict<T>(
        &self,
        report_id: u8,
        bytes: &[u8],
        feature_report_id: u8,
        wait_ms: u16,
        parse: impl Fn(&[u8]) -> Result<T>,
    ) -> Result<T> {
        let _queue = self.lock.lock().await;
        self.request_feature_raw(report_id, bytes, feature_report_id, wait_ms, parse, false)
            .await
    }

    pub async fn send_and_wait(
        &self,
        report_id: u8,
        bytes: &[u8],
        ack: &AckMatcher,
    ) -> Result<Vec<u8>> {
        let _queue = self.lock.lock().await;
        self.send_and_wait_raw(report_id, bytes, ack).await
    }

    /* Send the vendor's secure unlock or lock payload. */
    pub async fn send_gate(&self, gate: &GateSpec, unlock: bool) -> Result<()> {
        let _queue = self.lock.lock().await;
        self.send_gate_raw(gate, unlock).await
    }

    /* Run a planned command sequence in order, holding the queue for
     * the whole run. Contiguous `profile_stream` commands form a group:
     * an ack timeout inside the group retries the entire group from its
     * first command (the device's internal chunk counter cannot be
     * rewound). Non-stream commands retry individually only when
     * `retry_on_ack_timeout` is set. */
    pub async fn run_sequence(&self, cmds: &[Command]) -> Result<()> {
        let _queue = self.lock.lock().await;

        let mut executed = 0usize;
        let result = self.run_sequence_raw(cmds, &mut executed).await;

        if let Err(err) = result {
            /* If the unlock gate went out but the lock epilogue never
             * ran, attempt it anyway so the device is not left open.
             * Best effort only; the original error is what surfaces. */
            let unlock_sent = cmds[..executed].iter().any(|c| c.secure_gate);
            if unlock_sent {
                if let Some(lock_cmd) = cmds[executed..].iter().rev().find(|c| c.secure_gate) {
                    warn!("sequence failed mid-gate; attempting lock epilogue");
                    if let Err(lock_err) = self.run_one_raw(lock_cmd).await {
                        warn!("lock epilogue failed: {lock_err}");
                    }
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /* ------------------------------------------------------------- */
    /* Internals (queue already held)                                 */
    /* ------------------------------------------------------------- */

    async fn run_sequence_raw(&self, cmds: &[Command], executed: &mut usize) -> Result<()> {
        let mut i = 0;
        while i < cmds.len() {
            if cmds[i].profile_stream {
                let end = cmds[i..]
                    .iter()
                    .position(|c| !c.profile_stream)
                    .map(|off| i + off)
                    .unwrap_or(cmds.len());
                self.run_stream_group(&cmds[i..end]).await?;
                *executed = end;
                i = end;
            } else {
                self.run_with_retry(&cmds[i]).await?;
                i += 1;
                *executed = i;
            }
        }
        Ok(())
    }

    async fn run_with_retry(&self, cmd: &Command) -> Result<()> {
        let attempts = if cmd.retry_on_ack_timeout {
            1 + u32::from(self.cfg.ack_retry_count)
        } else {
            1
        };
        let mut last = None;
        for attempt in 0..attempts {
            match self.run_one_raw(cmd).await {
                Ok(()) => return Ok(()),
                Err(err @ MouseError::IoAckTimeout(_)) if attempt + 1 < attempts => {
                    warn!(opcode = cmd.opcode, attempt, "ack timeout, retrying command");
                    last = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or(MouseError::IoAckTimeout(self.cfg.ack_timeout_ms)))
    }

    async fn run_stream_group(&self, group: &[Command]) -> Result<()> {
        let attempts = 1 + u32::from(self.cfg.ack_retry_count);
        let mut last = None;
        for attempt in 0..attempts {
            match self.run_group_once(group).await {
                Ok(()) => return Ok(()),
                Err(err @ MouseError::IoAckTimeout(_)) if attempt + 1 < attempts => {
                    warn!(attempt, "ack timeout inside profile stream, retrying whole stream");
                    last = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or(MouseError::IoAckTimeout(self.cfg.ack_timeout_ms)))
    }

    async fn run_group_once(&self, group: &[Command]) -> Result<()> {
        for cmd in group {
            self.run_one_raw(cmd).await?;
        }
        Ok(())
    }

    async fn run_one_raw(&self, cmd: &Command) -> Result<()> {
        if cmd.wait_ms > 0 {
            sleep(Duration::from_millis(u64::from(cmd.wait_ms))).await;
        }
        match &cmd.ack {
            Some(ack) => {
                self.send_and_wait_raw(cmd.report_id, &cmd.payload, ack)
                    .await?;
            }
            None => self.send_raw(cmd.report_id, &cmd.payload).await?,
        }
        Ok(())
    }

    async fn send_gate_raw(&self, gate: &GateSpec, unlock: bool) -> Result<()> {
        let payload = if unlock {
            gate.unlock_payload
        } else {
            gate.lock_payload
        };
        self.send_raw(gate.report_id, payload).await?;
        if gate.wait_ms > 0 {
            sleep(Duration::from_millis(u64::from(gate.wait_ms))).await;
        }
        Ok(())
    }

    async fn request_feature_raw<T>(
        &self,
        report_id: u8,
        bytes: &[u8],
        feature_report_id: u8,
        wait_ms: u16,
        parse: impl Fn(&[u8]) -> Result<T>,
        drain: bool,
    ) -> Result<T> {
        self.send_raw(report_id, bytes).await?;
        sleep(Duration::from_millis(u64::from(wait_ms))).await;

        let reply = self.recv_feature_raw(feature_report_id).await?;
        let first = match parse(&reply) {
            Ok(parsed) => return Ok(parsed),
            Err(err @ MouseError::CmdMismatch { .. }) if drain => err,
            Err(err) => return Err(err),
        };

        /* Stale-frame drain: the device re-emitted an earlier response.
         * A short window of extra reads usually yields the real one. */
        for attempt in 0..self.cfg.drain_reads {
            debug!(attempt, "stale frame, draining");
            let reply = match timeout(
                Duration::from_millis(self.cfg.drain_timeout_ms),
                self.dev.receive_feature_report(feature_report_id),
            )
            .await
            {
                Ok(Ok(data)) => data,
                Ok(Err(_)) | Err(_) => break,
            };
            if let Ok(parsed) = parse(&reply) {
                return Ok(parsed);
            }
        }
        Err(first)
    }

    async fn send_and_wait_raw(
        &self,
        report_id: u8,
        bytes: &[u8],
        ack: &AckMatcher,
    ) -> Result<Vec<u8>> {
        /* Subscribe before sending so the ack can never race the
         * subscription. */
        let mut rx = self.dev.input_reports();
        self.send_raw(report_id, bytes).await?;

        let deadline = Instant::now() + Duration::from_millis(self.cfg.ack_timeout_ms);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(MouseError::IoAckTimeout(self.cfg.ack_timeout_ms));
            }
            match timeout(remaining, rx.recv()).await {
                Ok(Ok(report)) => {
                    if self.keepalive.map(|ka| ka(&report.data)).unwrap_or(false) {
                        continue;
                    }
                    if ack.matches(report.report_id, &report.data) {
                        return Ok(report.data);
                    }
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!(skipped, "input report subscriber lagged");
                }
                Ok(Err(RecvError::Closed)) => {
                    return Err(MouseError::IoReadFail(
                        "input report stream closed".to_string(),
                    ));
                }
                Err(_) => return Err(MouseError::IoAckTimeout(self.cfg.ack_timeout_ms)),
            }
        }
    }

    async fn recv_feature_raw(&self, feature_report_id: u8) -> Result<Vec<u8>> {
        let data = match timeout(
            Duration::from_millis(self.cfg.send_timeout_ms),
            self.dev.receive_feature_report(feature_report_id),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(MouseError::IoTimeout(self.cfg.send_timeout_ms)),
        };
        if data.is_empty() {
            return Err(MouseError::IoReadFail("empty feature report".to_string()));
        }
        debug!(report_id = feature_report_id, len = data.len(), "RX {data:02x?}");
        Ok(data)
    }

    async fn send_raw(&self, report_id: u8, bytes: &[u8]) -> Result<()> {
        if let Some(len) = self.known_len(report_id) {
            let buf = pad_or_truncate(bytes, len);
            return self.try_send_once(report_id, &buf).await;
        }

        /* Probe: the payload's own length, then the candidate set. */
        let mut tried = Vec::new();
        let candidates = std::iter::once(bytes.len())
            .chain(REPORT_LEN_CANDIDATES.iter().copied())
            .filter(|len| *len > 0);
        for len in candidates {
            if tried.contains(&len) {
                continue;
            }
            tried.push(len);
            let buf = pad_or_truncate(bytes, len);
            match self.try_send_once(report_id, &buf).await {
                Ok(()) => {
                    self.report_lens.lock().unwrap_or_else(|e| e.into_inner()).insert(report_id, len);
                    return Ok(());
                }
                Err(err @ MouseError::IoTimeout(_)) => return Err(err),
                Err(_) => continue,
            }
        }
        Err(MouseError::IoWriteFail(format!(
            "all report length candidates exhausted for report {report_id:#04x}"
        )))
    }

    fn known_len(&self, report_id: u8) -> Option<usize> {
        if let Some(len) = self.report_lens.lock().unwrap_or_else(|e| e.into_inner()).get(&report_id) {
            return Some(*len);
        }
        let len = hid::output_report_len(&self.dev.collections(), report_id)?;
        self.report_lens.lock().unwrap_or_else(|e| e.into_inner()).insert(report_id, len);
        Some(len)
    }

    /* One delivery attempt: output report first, feature report as the
     * fallback, each under the send timeout. */
    async fn try_send_once(&self, report_id: u8, buf: &[u8]) -> Result<()> {
        debug!(report_id, len = buf.len(), "TX {buf:02x?}");
        let send_timeout = Duration::from_millis(self.cfg.send_timeout_ms);

        match timeout(send_timeout, self.dev.send_report(report_id, buf)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(output_err)) => {
                debug!("output report failed ({output_err}), trying feature report");
            }
            Err(_) => return Err(MouseError::IoTimeout(self.cfg.send_timeout_ms)),
        }

        match timeout(send_timeout, self.dev.send_feature_report(report_id, buf)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(MouseError::IoWriteFail(err.to_string())),
            Err(_) => Err(MouseError::IoTimeout(self.cfg.send_timeout_ms)),
        }
    }
}

fn pad_or_truncate(bytes: &[u8], len: usize) -> Vec<u8> {
    let mut buf = bytes.to_vec();
    buf.resize(len, 0x00);
    buf
}
