/* The outward-facing device façade.
 *
 * `MouseApi` owns the cached snapshot, the operation queue, the
 * transport and the input-report demultiplexer for one device. User
 * operations (`apply`, `request_config`, `request_battery`) run one at
 * a time through the OpQueue; the transport's own queue serialises the
 * individual round-trips inside each operation. The cache moves only
 * on successful command execution or successful input-report parsing,
 * and every mutation is broadcast to subscribers. */

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::config::{BatteryState, Capabilities, MouseConfig};
use crate::error::{MouseError, Result};
use crate::features::Protocol;
use crate::hid::{HidDevice, InputReport};
use crate::patch::Patch;
use crate::planner;
use crate::protocol::{InputEvent, Vendor};
use crate::transport::{Transport, TransportConfig};

/* Gap between close and reopen when the device was already open. */
const REOPEN_GAP_MS: u64 = 80;

type ConfigCallback = Arc<dyn Fn(&MouseConfig) + Send + Sync>;
type BatteryCallback = Arc<dyn Fn(&BatteryState) + Send + Sync>;
type RawCallback = Arc<dyn Fn(&InputReport) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    config: Vec<(u64, ConfigCallback)>,
    battery: Vec<(u64, BatteryCallback)>,
    raw: Vec<(u64, RawCallback)>,
}

struct Shared {
    vendor: Vendor,
    proto: &'static Protocol,
    caps: &'static Capabilities,
    dev: Arc<dyn HidDevice>,
    transport: Transport,
    state: RwLock<MouseConfig>,
    op_lock: tokio::sync::Mutex<()>,
    opened: AtomicBool,
    sub_seq: AtomicU64,
    subs: StdMutex<Subscribers>,
    config_tx: broadcast::Sender<MouseConfig>,
    battery_tx: broadcast::Sender<BatteryState>,
    demux: StdMutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn snapshot(&self) -> MouseConfig {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /* Snapshot the callback list before iterating so a callback that
     * unsubscribes itself cannot invalidate the loop. */
    fn notify_config(&self) {
        let snapshot = self.snapshot();
        let callbacks: Vec<ConfigCallback> = {
            let subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
            subs.config.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for cb in callbacks {
            cb(&snapshot);
        }
        let _ = self.config_tx.send(snapshot);
    }

    fn notify_battery(&self, battery: &BatteryState) {
        let callbacks: Vec<BatteryCallback> = {
            let subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
            subs.battery.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for cb in callbacks {
            cb(battery);
        }
        let _ = self.battery_tx.send(*battery);
    }

    fn notify_raw(&self, report: &InputReport) {
        let callbacks: Vec<RawCallback> = {
            let subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
            subs.raw.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for cb in callbacks {
            cb(report);
        }
    }

    fn handle_input(&self, report: &InputReport) {
        if let Some(event) = self.vendor.parse_input(report) {
            match event {
                InputEvent::Battery(battery) => {
                    debug!(percent = battery.percent, "battery push");
                    self.state.write().unwrap_or_else(|e| e.into_inner()).battery = Some(battery);
                    self.notify_battery(&battery);
                    self.notify_config();
                }
                InputEvent::Config(push) => {
                    debug!("config push");
                    push.apply_to(&mut self.state.write().unwrap_or_else(|e| e.into_inner()));
                    self.notify_config();
                }
            }
        }
        self.notify_raw(report);
    }
}

#[derive(Clone, Copy, Debug)]
enum SubKind {
    Config,
    Battery,
    Raw,
}

/* Handle returned by the subscription methods; dropping it does not
 * unsubscribe, calling `unsubscribe` does. */
pub struct Subscription {
    id: u64,
    kind: SubKind,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut subs = shared.subs.lock().unwrap_or_else(|e| e.into_inner());
            match self.kind {
                SubKind::Config => subs.config.retain(|(id, _)| *id != self.id),
                SubKind::Battery => subs.battery.retain(|(id, _)| *id != self.id),
                SubKind::Raw => subs.raw.retain(|(id, _)| *id != self.id),
            }
        }
    }
}

pub struct MouseApi {
    shared: Arc<Shared>,
}

impl MouseApi {
    pub fn new(vendor: Vendor, dev: Arc<dyn HidDevice>) -> Self {
        Self::with_transport_config(vendor, dev, TransportConfig::default())
    }

    pub fn with_transport_config(
        vendor: Vendor,
        dev: Arc<dyn HidDevice>,
        transport_config: TransportConfig,
    ) -> Self {
        let proto = vendor.protocol();
        let transport = Transport::new(dev.clone(), transport_config, proto.keepalive);
        let (config_tx, _) = broadcast::channel(16);
        let (battery_tx, _) = broadcast::channel(16);
        Self {
            shared: Arc::new(Shared {
                vendor,
                proto,
                caps: vendor.capabilities(),
                dev,
                transport,
                state: RwLock::new(vendor.default_config()),
                op_lock: tokio::sync::Mutex::new(()),
                opened: AtomicBool::new(false),
                sub_seq: AtomicU64::new(1),
                subs: StdMutex::new(Subscribers::default()),
                config_tx,
                battery_tx,
                demux: StdMutex::new(None),
            }),
        }
    }

    pub fn vendor(&self) -> Vendor {
        self.shared.vendor
    }

    pub fn capabilities(&self) -> &'static Capabilities {
        self.shared.caps
    }

    pub fn cached_config(&self) -> MouseConfig {
        self.shared.snapshot()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.opened.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MouseError::NotOpen)
        }
    }

    /* Open the device. An already-open device is closed and reopened
     * after a short gap; the secure handshake (where the family has
     * one) runs either way. */
    pub async fn open(&self) -> Result<()> {
        let _op = self.shared.op_lock.lock().await;

        if self.shared.dev.is_open() {
            info!("device already open, cycling");
            self.shared.dev.close().await.ok();
            sleep(Duration::from_millis(REOPEN_GAP_MS)).await;
        }
        self.shared
            .dev
            .open()
            .await
            .map_err(|e| MouseError::OpenFail(e.to_string()))?;

        self.install_demux();

        /* Prove the secure channel before the first real operation;
         * the device ends locked either way. */
        if let Some(gate) = self.shared.proto.gate {
            self.shared.transport.send_gate(gate, true).await?;
            self.shared.transport.send_gate(gate, false).await?;
        }

        self.shared.opened.store(true, Ordering::SeqCst);
        info!(vendor = self.shared.vendor.name(), "device open");
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        let _op = self.shared.op_lock.lock().await;
        if let Some(task) = self.shared.demux.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        self.shared.dev.close().await?;
        self.shared.opened.store(false, Ordering::SeqCst);
        info!("device closed");
        Ok(())
    }

    /* Release everything. The façade is unusable afterwards. */
    pub async fn dispose(&self) {
        if let Err(err) = self.close().await {
            warn!("close during dispose failed: {err}");
        }
        let mut subs = self.shared.subs.lock().unwrap_or_else(|e| e.into_inner());
        subs.config.clear();
        subs.battery.clear();
        subs.raw.clear();
    }

    fn install_demux(&self) {
        let shared = Arc::downgrade(&self.shared);
        let mut rx = self.shared.dev.input_reports();
        let keepalive = self.shared.proto.keepalive;
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(report) => {
                        if keepalive.map(|ka| ka(&report.data)).unwrap_or(false) {
                            continue;
                        }
                        let Some(shared) = shared.upgrade() else { break };
                        shared.handle_input(&report);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "input demux lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(old) = self
            .shared
            .demux
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task)
        {
            old.abort();
        }
    }

    /* ------------------------------------------------------------- */
    /* Reads                                                          */
    /* ------------------------------------------------------------- */

    /* Rebuild the full snapshot from hardware and merge it over the
     * cache. */
    pub async fn request_config(&self) -> Result<MouseConfig> {
        self.ensure_open()?;
        let _op = self.shared.op_lock.lock().await;

        let fresh = self.shared.vendor.read_config(&self.shared.transport).await?;
        {
            let mut state = self.shared.state.write().unwrap_or_else(|e| e.into_inner());
            merge_config(&mut state, fresh);
        }
        self.shared.notify_config();
        Ok(self.shared.snapshot())
    }

    pub async fn request_battery(&self) -> Result<BatteryState> {
        self.ensure_open()?;
        let _op = self.shared.op_lock.lock().await;

        let battery = self.shared.vendor.read_battery(&self.shared.transport).await?;
        self.shared.state.write().unwrap_or_else(|e| e.into_inner()).battery = Some(battery);
        self.shared.notify_battery(&battery);
        self.shared.notify_config();
        Ok(battery)
    }

    /* ------------------------------------------------------------- */
    /* Writes                                                         */
    /* ------------------------------------------------------------- */

    /* Plan and execute a semantic patch. All-or-nothing with respect
     * to the cache: a transport failure leaves the previous snapshot
     * in place. */
    pub async fn apply(&self, patch: &Patch) -> Result<MouseConfig> {
        self.ensure_open()?;
        let _op = self.shared.op_lock.lock().await;

        let prev = self.shared.snapshot();
        let plan = planner::plan(self.shared.proto, self.shared.caps, &prev, patch)?;

        if !plan.commands.is_empty() {
            self.shared.transport.run_sequence(&plan.commands).await?;
        }

        *self.shared.state.write().unwrap_or_else(|e| e.into_inner()) = plan.next.clone();
        self.shared.notify_config();
        Ok(plan.next)
    }

    pub async fn set_feature(&self, key: &str, value: impl Into<serde_json::Value>) -> Result<MouseConfig> {
        self.apply(&Patch::new().set(key, value)).await
    }

    pub async fn set_batch_features(&self, patch: &Patch) -> Result<MouseConfig> {
        self.apply(patch).await
    }

    /* Sugar: one DPI slot (1-based), optionally selecting it. */
    pub async fn set_dpi(&self, slot: u8, dpi: u16, select: bool) -> Result<MouseConfig> {
        self.apply(&Patch::new().set(
            "dpiSlot",
            json!({"slot": slot, "dpi": dpi, "select": select}),
        ))
        .await
    }

    pub async fn set_dpi_slot_count(&self, count: u8) -> Result<MouseConfig> {
        self.apply(&Patch::new().set("dpiSlotCount", count)).await
    }

    pub async fn set_active_dpi_slot(&self, index: u8) -> Result<MouseConfig> {
        self.apply(&Patch::new().set("currentDpiIndex", index)).await
    }

    pub async fn set_button_mapping(&self, slot: u8, label: &str) -> Result<MouseConfig> {
        self.apply(&Patch::new().set(
            "buttonMapping",
            json!({"slot": slot, "label": label}),
        ))
        .await
    }

    /* ------------------------------------------------------------- */
    /* Subscriptions                                                  */
    /* ------------------------------------------------------------- */

    /* Subscribe to snapshot changes. With `replay` the callback fires
     * immediately with the current cache. */
    pub fn on_config(
        &self,
        callback: impl Fn(&MouseConfig) + Send + Sync + 'static,
        replay: bool,
    ) -> Subscription {
        let cb: ConfigCallback = Arc::new(callback);
        if replay {
            cb(&self.shared.snapshot());
        }
        let id = self.shared.sub_seq.fetch_add(1, Ordering::SeqCst);
        self.shared
            .subs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .config
            .push((id, cb));
        Subscription {
            id,
            kind: SubKind::Config,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn on_battery(
        &self,
        callback: impl Fn(&BatteryState) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.shared.sub_seq.fetch_add(1, Ordering::SeqCst);
        self.shared
            .subs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .battery
            .push((id, Arc::new(callback)));
        Subscription {
            id,
            kind: SubKind::Battery,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn on_raw_report(
        &self,
        callback: impl Fn(&InputReport) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.shared.sub_seq.fetch_add(1, Ordering::SeqCst);
        self.shared
            .subs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .raw
            .push((id, Arc::new(callback)));
        Subscription {
            id,
            kind: SubKind::Raw,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /* One-shot await of the next cache mutation. */
    pub async fn wait_for_next_config(&self, ms: u64) -> Result<MouseConfig> {
        let mut rx = self.shared.config_tx.subscribe();
        match timeout(Duration::from_millis(ms), rx.recv()).await {
            Ok(Ok(config)) => Ok(config),
            Ok(Err(_)) => Err(MouseError::Unknown("config channel closed".to_string())),
            Err(_) => Err(MouseError::IoTimeout(ms)),
        }
    }

    pub async fn wait_for_next_battery(&self, ms: u64) -> Result<BatteryState> {
        let mut rx = self.shared.battery_tx.subscribe();
        match timeout(Duration::from_millis(ms), rx.recv()).await {
            Ok(Ok(battery)) => Ok(battery),
            Ok(Err(_)) => Err(MouseError::Unknown("battery channel closed".to_string())),
            Err(_) => Err(MouseError::IoTimeout(ms)),
        }
    }

    /* Stream views over the same broadcasts. */
    pub fn config_stream(&self) -> BroadcastStream<MouseConfig> {
        BroadcastStream::new(self.shared.config_tx.subscribe())
    }

    pub fn battery_stream(&self) -> BroadcastStream<BatteryState> {
        BroadcastStream::new(self.shared.battery_tx.subscribe())
    }
}

/* Merge a freshly read snapshot over the cache: only fields the read
 * actually produced move. */
fn merge_config(cache: &mut MouseConfig, fresh: MouseConfig) {
    macro_rules! merge {
        ($($field:ident),* $(,)?) => {
            $(if fresh.$field.is_some() {
                cache.$field = fresh.$field;
            })*
        };
    }
    merge!(
        polling_hz,
        performance_mode,
        lod,
        debounce_level,
        debounce_ms,
        motion_sync,
        linear_correction,
        ripple_control,
        glass_mode,
        hyperclick,
        burst_delay_ms,
        sensor_angle,
        sensor_feel,
        sleep_seconds,
        dpi_slot_count,
        current_dpi_index,
        dpi_slots_x,
        dpi_slots_y,
        buttons,
        led,
        battery,
        firmware,
        device_name,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::nordic;
    use crate::testing::MockDevice;
    use std::sync::atomic::AtomicU32;

    fn fast_transport() -> TransportConfig {
        TransportConfig {
            send_timeout_ms: 200,
            ack_timeout_ms: 40,
            drain_timeout_ms: 40,
            drain_reads: 2,
            ack_retry_count: 1,
        }
    }

    fn nordic_api() -> (Arc<MockDevice>, MouseApi) {
        let dev = Arc::new(MockDevice::new(0x1915, 0xAE11));
        let api = MouseApi::with_transport_config(Vendor::Nordic, dev.clone(), fast_transport());
        (dev, api)
    }

    #[tokio::test]
    async fn operations_require_open() {
        let (_dev, api) = nordic_api();
        let err = api.apply(&Patch::new().set("pollingHz", 1000)).await.unwrap_err();
        assert!(matches!(err, MouseError::NotOpen));
        let err = api.request_battery().await.unwrap_err();
        assert!(matches!(err, MouseError::NotOpen));
    }

    #[tokio::test]
    async fn open_sends_the_secure_handshake() {
        let (dev, api) = nordic_api();
        api.open().await.unwrap();
        let sent = dev.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, nordic::SECURE_REPORT_ID);
        assert_eq!(sent[0].1[0], nordic::OP_UNLOCK);
        assert_eq!(sent[1].1[0], nordic::OP_LOCK);
    }

    #[tokio::test]
    async fn open_cycles_an_already_open_device() {
        let (dev, api) = nordic_api();
        dev.open().await.unwrap();
        assert!(dev.is_open());
        api.open().await.unwrap();
        assert!(dev.is_open());
    }

    #[tokio::test]
    async fn apply_commits_and_notifies() {
        let (_dev, api) = nordic_api();
        api.open().await.unwrap();

        let seen = Arc::new(AtomicU32::new(0));
        let seen_cb = seen.clone();
        let _sub = api.on_config(
            move |config| {
                if config.polling_hz == Some(4000) {
                    seen_cb.fetch_add(1, Ordering::SeqCst);
                }
            },
            false,
        );

        let next = api.apply(&Patch::new().set("pollingHz", 4000)).await.unwrap();
        assert_eq!(next.polling_hz, Some(4000));
        assert_eq!(api.cached_config().polling_hz, Some(4000));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_apply_leaves_the_cache_untouched() {
        let (dev, api) = nordic_api();
        api.open().await.unwrap();
        let before = api.cached_config();

        dev.set_on_send(|_, data| {
            if data.first() == Some(&nordic::OP_POLLING) {
                vec![crate::testing::MockReaction::FailWrite]
            } else {
                vec![]
            }
        });

        let err = api.apply(&Patch::new().set("pollingHz", 2000)).await.unwrap_err();
        assert!(matches!(err, MouseError::IoWriteFail(_)));
        assert_eq!(api.cached_config(), before);
    }

    #[tokio::test]
    async fn validation_failure_sends_nothing() {
        let (dev, api) = nordic_api();
        api.open().await.unwrap();
        dev.clear_sent();

        let err = api.apply(&Patch::new().set("pollingHz", 333)).await.unwrap_err();
        assert!(matches!(err, MouseError::BadParam { .. }));
        assert_eq!(dev.sent_count(), 0);
    }

    #[tokio::test]
    async fn set_dpi_goes_through_the_gate() {
        let (dev, api) = nordic_api();
        api.open().await.unwrap();
        dev.clear_sent();

        api.set_dpi(1, 800, false).await.unwrap();
        let sent = dev.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].1[0], nordic::OP_UNLOCK);
        assert_eq!(sent[1].1[0], nordic::OP_DPI_VALUE);
        assert_eq!(&sent[1].1[7..10], &[0x00, 0x20, 0x03]);
        assert_eq!(sent[2].1[0], nordic::OP_LOCK);
    }

    #[tokio::test]
    async fn battery_push_updates_cache_and_subscribers() {
        let (dev, api) = nordic_api();
        api.open().await.unwrap();

        let wait = api.wait_for_next_battery(500);
        dev.emit_input(nordic::INPUT_REPORT_ID, vec![0x03, 66, 0x00]);
        let battery = wait.await.unwrap();
        assert_eq!(battery.percent, 66);
        assert!(!battery.charging);
        assert_eq!(api.cached_config().battery, Some(battery));
    }

    #[tokio::test]
    async fn config_push_updates_active_slot() {
        let (dev, api) = nordic_api();
        api.open().await.unwrap();

        let wait = api.wait_for_next_config(500);
        dev.emit_input(nordic::INPUT_REPORT_ID, vec![0x02, 0x03, 0x05, 0x01]);
        let config = wait.await.unwrap();
        assert_eq!(config.current_dpi_index, Some(3));
        assert_eq!(config.polling_hz, Some(1000));
    }

    #[tokio::test]
    async fn raw_reports_are_forwarded() {
        let (dev, api) = nordic_api();
        api.open().await.unwrap();

        let count = Arc::new(AtomicU32::new(0));
        let count_cb = count.clone();
        let _sub = api.on_raw_report(move |_| {
            count_cb.fetch_add(1, Ordering::SeqCst);
        });

        let wait = api.wait_for_next_config(500);
        dev.emit_input(nordic::INPUT_REPORT_ID, vec![0x02, 0x01, 0x05, 0x01]);
        wait.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn replay_fires_immediately() {
        let (_dev, api) = nordic_api();
        let fired = Arc::new(AtomicU32::new(0));
        let fired_cb = fired.clone();
        let _sub = api.on_config(
            move |_| {
                fired_cb.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let (_dev, api) = nordic_api();
        api.open().await.unwrap();

        let fired = Arc::new(AtomicU32::new(0));
        let fired_cb = fired.clone();
        let sub = api.on_config(
            move |_| {
                fired_cb.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        sub.unsubscribe();

        api.apply(&Patch::new().set("pollingHz", 500)).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn request_battery_polls_the_register() {
        let (dev, api) = nordic_api();
        api.open().await.unwrap();
        dev.set_on_send(|_, data| {
            if data.first() == Some(&nordic::OP_BATTERY) {
                vec![crate::testing::MockReaction::FeatureReply(
                    nordic::REPORT_ID,
                    vec![nordic::OP_BATTERY, 0x02, 91, 0x01],
                )]
            } else {
                vec![]
            }
        });
        let battery = api.request_battery().await.unwrap();
        assert_eq!(battery.percent, 91);
        assert!(battery.charging);
        assert_eq!(api.cached_config().battery, Some(battery));
    }
}
