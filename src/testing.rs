/* Scripted synthetic device for exercising the engine without hardware.
 *
 * `MockDevice` implements `HidDevice` with a send log, a queue of
 * feature-report replies, and programmable reactions that fire on every
 * send, enough to script ack flows, stale reads and failure injection
 * for transport, planner and façade tests. */

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{MouseError, Result};
use crate::hid::{Collection, HidDevice, InputReport};

/* What a scripted reaction makes the device do in response to a send. */
#[derive(Debug, Clone)]
pub enum MockReaction {
    /* Emit an input report (e.g. an ack frame). */
    Input(u8, Vec<u8>),
    /* Queue a feature-report reply. */
    FeatureReply(u8, Vec<u8>),
    /* Fail this write. */
    FailWrite,
}

type SendHook = Box<dyn FnMut(u8, &[u8]) -> Vec<MockReaction> + Send>;

pub struct MockDevice {
    vendor_id: u16,
    product_id: u16,
    product_name: String,
    collections: Vec<Collection>,
    opened: AtomicBool,
    fail_open: AtomicBool,
    sent: Mutex<Vec<(u8, Vec<u8>)>>,
    feature_replies: Mutex<VecDeque<(u8, Vec<u8>)>>,
    on_send: Mutex<Option<SendHook>>,
    /* When set, writes whose padded length is not in the list fail;
     * exercises the report-length probing path. */
    accepted_lens: Mutex<Option<Vec<usize>>>,
    input_tx: broadcast::Sender<InputReport>,
}

impl MockDevice {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        let (input_tx, _) = broadcast::channel(256);
        Self {
            vendor_id,
            product_id,
            product_name: "Mock Mouse".to_string(),
            collections: Vec::new(),
            opened: AtomicBool::new(false),
            fail_open: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            feature_replies: Mutex::new(VecDeque::new()),
            on_send: Mutex::new(None),
            accepted_lens: Mutex::new(None),
            input_tx,
        }
    }

    pub fn with_collections(mut self, collections: Vec<Collection>) -> Self {
        self.collections = collections;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.product_name = name.to_string();
        self
    }

    pub fn fail_next_open(&self) {
        self.fail_open.store(true, Ordering::SeqCst);
    }

    /* Restrict which padded write lengths succeed. */
    pub fn accept_lens(&self, lens: &[usize]) {
        *self.accepted_lens.lock().unwrap() = Some(lens.to_vec());
    }

    pub fn push_feature_reply(&self, report_id: u8, data: Vec<u8>) {
        self.feature_replies
            .lock()
            .unwrap()
            .push_back((report_id, data));
    }

    pub fn emit_input(&self, report_id: u8, data: Vec<u8>) {
        let _ = self.input_tx.send(InputReport { report_id, data });
    }

    pub fn set_on_send(&self, hook: impl FnMut(u8, &[u8]) -> Vec<MockReaction> + Send + 'static) {
        *self.on_send.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn sent(&self) -> Vec<(u8, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    fn record_send(&self, report_id: u8, data: &[u8]) -> Result<()> {
        if let Some(accepted) = self.accepted_lens.lock().unwrap().as_ref() {
            if !accepted.contains(&data.len()) {
                return Err(MouseError::IoWriteFail(format!(
                    "mock rejects length {}",
                    data.len()
                )));
            }
        }

        let reactions = {
            let mut hook = self.on_send.lock().unwrap();
            hook.as_mut().map(|h| h(report_id, data)).unwrap_or_default()
        };

        let mut fail = false;
        for reaction in reactions {
            match reaction {
                MockReaction::Input(rid, bytes) => self.emit_input(rid, bytes),
                MockReaction::FeatureReply(rid, bytes) => self.push_feature_reply(rid, bytes),
                MockReaction::FailWrite => fail = true,
            }
        }
        if fail {
            return Err(MouseError::IoWriteFail("mock write failure".to_string()));
        }

        self.sent.lock().unwrap().push((report_id, data.to_vec()));
        Ok(())
    }
}

#[async_trait]
impl HidDevice for MockDevice {
    fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.product_id
    }

    fn product_name(&self) -> String {
        self.product_name.clone()
    }

    fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    fn collections(&self) -> Vec<Collection> {
        self.collections.clone()
    }

    async fn open(&self) -> Result<()> {
        if self.fail_open.swap(false, Ordering::SeqCst) {
            return Err(MouseError::OpenFail("mock open failure".to_string()));
        }
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.opened.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send_report(&self, report_id: u8, data: &[u8]) -> Result<()> {
        self.record_send(report_id, data)
    }

    async fn send_feature_report(&self, report_id: u8, data: &[u8]) -> Result<()> {
        self.record_send(report_id, data)
    }

    async fn receive_feature_report(&self, report_id: u8) -> Result<Vec<u8>> {
        let mut queue = self.feature_replies.lock().unwrap();
        let pos = queue.iter().position(|(rid, _)| *rid == report_id);
        match pos {
            Some(i) => Ok(queue.remove(i).map(|(_, data)| data).unwrap_or_default()),
            None => Err(MouseError::IoReadFail(format!(
                "no scripted reply for feature report {report_id:#04x}"
            ))),
        }
    }

    fn input_reports(&self) -> broadcast::Receiver<InputReport> {
        self.input_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_replies_pop_in_order() {
        let dev = MockDevice::new(0x1915, 0x0001);
        dev.push_feature_reply(0x05, vec![0x01]);
        dev.push_feature_reply(0x05, vec![0x02]);
        assert_eq!(dev.receive_feature_report(0x05).await.unwrap(), vec![0x01]);
        assert_eq!(dev.receive_feature_report(0x05).await.unwrap(), vec![0x02]);
        assert!(dev.receive_feature_report(0x05).await.is_err());
    }

    #[tokio::test]
    async fn on_send_reactions_fire() {
        let dev = MockDevice::new(0x1915, 0x0001);
        dev.set_on_send(|_, _| vec![MockReaction::FeatureReply(0x06, vec![0xAA])]);
        dev.send_report(0x05, &[0x01]).await.unwrap();
        assert_eq!(dev.receive_feature_report(0x06).await.unwrap(), vec![0xAA]);
        assert_eq!(dev.sent_count(), 1);
    }

    #[tokio::test]
    async fn rejected_lengths_fail_the_write() {
        let dev = MockDevice::new(0x24AE, 0x0001);
        dev.accept_lens(&[20]);
        assert!(dev.send_report(0x07, &[0u8; 8]).await.is_err());
        assert!(dev.send_report(0x07, &[0u8; 20]).await.is_ok());
    }
}
