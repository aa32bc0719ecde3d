/* Planner output unit: one wire write, plus everything the transport
 * needs to deliver it (inter-command delay, ack matching, stream and
 * retry semantics). Commands are produced by the planner and consumed
 * exactly once by the transport. */

use std::fmt;
use std::sync::Arc;

/* Predicate against incoming input reports; the transport holds it until
 * a matching report arrives or the ack window expires. */
#[derive(Clone)]
pub struct AckMatcher {
    pub report_id: u8,
    pub predicate: Arc<dyn Fn(&[u8]) -> bool + Send + Sync>,
}

impl AckMatcher {
    pub fn new(report_id: u8, predicate: impl Fn(&[u8]) -> bool + Send + Sync + 'static) -> Self {
        Self {
            report_id,
            predicate: Arc::new(predicate),
        }
    }

    pub fn matches(&self, report_id: u8, data: &[u8]) -> bool {
        report_id == self.report_id && (self.predicate)(data)
    }
}

impl fmt::Debug for AckMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckMatcher")
            .field("report_id", &self.report_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct Command {
    pub report_id: u8,
    pub payload: Vec<u8>,
    /* Semantic opcode of the write, used for dedup keys and logging.
     * Usually equal to payload[0] but not required to be (HID++ keeps
     * the function id at payload[2]). */
    pub opcode: u8,
    /* Delay before this command is sent. Inter-write delays (e.g. the
     * rapoo dual-bank DPI write) live on the second command. */
    pub wait_ms: u16,
    /* Sensitive writes must run inside the vendor's secure gate. */
    pub sensitive: bool,
    pub ack: Option<AckMatcher>,
    /* Part of a contiguous profile-stream group: an ack timeout retries
     * the whole group from its first command, never this one alone. */
    pub profile_stream: bool,
    pub retry_on_ack_timeout: bool,
    /* Marks the secure unlock/lock bracket commands themselves, so the
     * transport can attempt the lock epilogue after a mid-body failure. */
    pub secure_gate: bool,
}

impl Command {
    pub fn new(report_id: u8, opcode: u8, payload: Vec<u8>) -> Self {
        Self {
            report_id,
            payload,
            opcode,
            wait_ms: 0,
            sensitive: false,
            ack: None,
            profile_stream: false,
            retry_on_ack_timeout: false,
            secure_gate: false,
        }
    }

    pub fn wait_ms(mut self, ms: u16) -> Self {
        self.wait_ms = ms;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn ack(mut self, matcher: AckMatcher) -> Self {
        self.ack = Some(matcher);
        self
    }

    pub fn profile_stream(mut self) -> Self {
        self.profile_stream = true;
        self
    }

    pub fn retry_on_ack_timeout(mut self) -> Self {
        self.retry_on_ack_timeout = true;
        self
    }

    pub fn gate_marker(mut self) -> Self {
        self.secure_gate = true;
        self
    }
}

/* Encoder output for Direct/Compound feature entries, before the vendor
 * codec frames it into a `Command`. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSpec {
    pub opcode: u8,
    pub len_or_idx: u8,
    pub data: Vec<u8>,
    pub sensitive: bool,
    pub wait_ms: u16,
}

impl WriteSpec {
    pub fn new(opcode: u8, len_or_idx: u8, data: Vec<u8>) -> Self {
        Self {
            opcode,
            len_or_idx,
            data,
            sensitive: false,
            wait_ms: 0,
        }
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn wait_ms(mut self, ms: u16) -> Self {
        self.wait_ms = ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_matcher_requires_report_id_and_predicate() {
        let m = AckMatcher::new(0x11, |d| d.first() == Some(&0x01));
        assert!(m.matches(0x11, &[0x01, 0x02]));
        assert!(!m.matches(0x10, &[0x01, 0x02]));
        assert!(!m.matches(0x11, &[0x02]));
    }

    #[test]
    fn command_builder_flags() {
        let c = Command::new(0x05, 0x03, vec![0x03, 0x00])
            .wait_ms(25)
            .sensitive()
            .retry_on_ack_timeout();
        assert_eq!(c.wait_ms, 25);
        assert!(c.sensitive);
        assert!(c.retry_on_ack_timeout);
        assert!(!c.profile_stream);
    }
}
