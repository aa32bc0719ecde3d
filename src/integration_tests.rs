/* End-to-end flows against scripted devices: registry identification,
 * the façade lifecycle, and the full plan → transport → ack pipeline
 * for the streaming and register families. */

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Arc;

    use crate::config::MouseConfig;
    use crate::hid::{Collection, ReportInfo};
    use crate::patch::Patch;
    use crate::protocol::{hidpp, nordic, Vendor};
    use crate::registry;
    use crate::testing::{MockDevice, MockReaction};
    use crate::transport::TransportConfig;
    use crate::MouseApi;

    /* Honours RUST_LOG so a failing flow can be replayed with the TX/RX
     * byte dumps visible. */
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn fast_transport() -> TransportConfig {
        init_tracing();
        TransportConfig {
            send_timeout_ms: 200,
            ack_timeout_ms: 60,
            drain_timeout_ms: 40,
            drain_reads: 2,
            ack_retry_count: 1,
        }
    }

    fn vendor_collection(page: u16, usage: u16) -> Collection {
        Collection {
            usage_page: page,
            usage,
            input_reports: vec![ReportInfo { id: 0x11, byte_len: 19 }],
            output_reports: vec![],
            feature_reports: vec![],
        }
    }

    /* Ack every onboard-profile command the way a real receiver does,
     * echoing the function byte and a running chunk counter. */
    fn ack_profile_stream(dev: &Arc<MockDevice>) {
        let chunk_counter = Arc::new(AtomicU8::new(0));
        dev.set_on_send(move |rid, data| {
            if rid != hidpp::REPORT_ID_LONG || data.len() < 3 {
                return vec![];
            }
            let func = data[2];
            match func {
                hidpp::FUNC_START | hidpp::FUNC_HEADER | hidpp::FUNC_COMMIT => {
                    if func == hidpp::FUNC_START {
                        chunk_counter.store(0, Ordering::SeqCst);
                    }
                    vec![MockReaction::Input(
                        hidpp::REPORT_ID_LONG,
                        vec![0x01, hidpp::FEATURE_ONBOARD, func, 0x00],
                    )]
                }
                hidpp::FUNC_CHUNK => {
                    let index = chunk_counter.fetch_add(1, Ordering::SeqCst);
                    vec![MockReaction::Input(
                        hidpp::REPORT_ID_LONG,
                        vec![0x01, hidpp::FEATURE_ONBOARD, func, index],
                    )]
                }
                _ => vec![],
            }
        });
    }

    #[tokio::test]
    async fn hidpp_profile_rewrite_end_to_end() {
        let dev = Arc::new(
            MockDevice::new(0x046D, 0xC539)
                .with_collections(vec![vendor_collection(0xFF00, 0x01)]),
        );
        assert_eq!(registry::identify(dev.as_ref()), Some(Vendor::Hidpp));

        ack_profile_stream(&dev);
        let api = MouseApi::with_transport_config(Vendor::Hidpp, dev.clone(), fast_transport());
        api.open().await.unwrap();
        dev.clear_sent();

        let next = api
            .apply(
                &Patch::new()
                    .set("dpiSlots", serde_json::json!([800, 1600, 3200, 3200, 3200]))
                    .set("dpiSlotCount", 3)
                    .set("defaultDpiSlotIndex", 0),
            )
            .await
            .unwrap();

        assert_eq!(next.dpi_slot_count, Some(3));

        /* Exactly Start + Header + 16 chunks + Commit on the wire. */
        let sent = dev.sent();
        assert_eq!(sent.len(), 20);
        assert_eq!(sent[0].1[2], hidpp::FUNC_START);
        assert_eq!(sent[1].1[2], hidpp::FUNC_HEADER);
        assert_eq!(sent[19].1[2], hidpp::FUNC_COMMIT);

        /* Reassemble the image from the chunk payloads and check the
         * trailing CRC covers bytes 0..252. */
        let mut image = Vec::new();
        for (_, payload) in &sent[2..18] {
            image.extend_from_slice(&payload[3..19]);
        }
        assert_eq!(image.len(), 256);
        let crc = hidpp::compute_ccitt_crc(&image[..253]);
        assert_eq!(u16::from_be_bytes([image[253], image[254]]), crc);
    }

    #[tokio::test]
    async fn hidpp_keepalives_do_not_satisfy_stream_acks() {
        let dev = Arc::new(MockDevice::new(0x046D, 0xC539));
        /* Only keep-alive frames come back: every ack wait must expire
         * and the whole apply must fail with an ack timeout. */
        dev.set_on_send(|rid, _| {
            if rid == hidpp::REPORT_ID_LONG {
                vec![MockReaction::Input(
                    hidpp::REPORT_ID_LONG,
                    vec![0x01, 0x0D, 0x2F, 0x00],
                )]
            } else {
                vec![]
            }
        });
        let api = MouseApi::with_transport_config(Vendor::Hidpp, dev.clone(), fast_transport());
        api.open().await.unwrap();

        let err = api
            .apply(&Patch::new().set("pollingHz", 500))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::MouseError::IoAckTimeout(_)));
        /* The cache still shows the previous polling rate. */
        assert_eq!(api.cached_config().polling_hz, Some(1000));
    }

    #[tokio::test]
    async fn nordic_full_cycle_reads_and_writes() {
        let dev = Arc::new(
            MockDevice::new(0x1915, 0xAE11)
                .with_collections(vec![vendor_collection(0xFF0A, 0x01)]),
        );
        assert_eq!(registry::identify(dev.as_ref()), Some(Vendor::Nordic));

        /* Answer every register read with a plausible value. */
        dev.set_on_send(|_, data| {
            let opcode = data.first().copied().unwrap_or(0);
            let rw = data.get(6).copied().unwrap_or(0);
            if rw != nordic::RW_READ {
                return vec![];
            }
            let reply = match opcode {
                nordic::OP_POLLING => vec![opcode, 0x01, 0x02],
                nordic::OP_PERF_MODE => vec![opcode, 0x01, 0x02],
                nordic::OP_DPI_SELECT => vec![opcode, 0x02, 0x05, 0x01],
                nordic::OP_DPI_VALUE => {
                    let slot = data.get(5).copied().unwrap_or(0);
                    vec![opcode, 0x03, slot, 0x20, 0x03]
                }
                nordic::OP_BUTTON => {
                    let slot = data.get(5).copied().unwrap_or(0);
                    vec![opcode, 0x03, slot, 0x11, 0x01]
                }
                nordic::OP_FIRMWARE => vec![opcode, 0x04, 0x01, 0x07, 0x02, 0x03],
                nordic::OP_BATTERY => vec![opcode, 0x02, 80, 0x00],
                _ => vec![opcode, 0x01, 0x01],
            };
            vec![MockReaction::FeatureReply(nordic::REPORT_ID, reply)]
        });

        let api = MouseApi::with_transport_config(Vendor::Nordic, dev.clone(), fast_transport());
        api.open().await.unwrap();

        let config = api.request_config().await.unwrap();
        assert_eq!(config.polling_hz, Some(2000));
        assert_eq!(config.dpi_slot_count, Some(5));
        assert_eq!(config.current_dpi_index, Some(1));
        assert_eq!(config.dpi_slots_x.as_ref().unwrap()[0], 800);
        assert_eq!(config.battery.map(|b| b.percent), Some(80));
        assert_eq!(config.firmware.as_ref().unwrap().main, "1.7");

        /* A write after the read plans against the fresh state: the
         * perf-mode register address follows the 2000 Hz rate read
         * back a moment ago. */
        dev.clear_sent();
        api.apply(&Patch::new().set("performanceMode", "sport"))
            .await
            .unwrap();
        let sent = dev.sent();
        let perf = sent
            .iter()
            .find(|(_, d)| d[0] == nordic::OP_PERF_MODE)
            .unwrap();
        assert_eq!(perf.1[5], nordic::perf_addr(2000));
    }

    #[tokio::test]
    async fn facade_reports_device_capabilities() {
        let dev = Arc::new(MockDevice::new(0x24AE, 0x2015));
        let api = MouseApi::with_transport_config(Vendor::Rapoo, dev, fast_transport());
        let caps = api.capabilities();
        assert_eq!(caps.vendor, Vendor::Rapoo);
        assert!(caps.polling_rates.contains(&1000));
        assert!(caps.supports(crate::FeatureKey::RippleControl));
        assert!(!caps.supports(crate::FeatureKey::SleepSeconds));
    }

    #[tokio::test]
    async fn default_snapshot_is_vendor_specific() {
        let nordic_default = Vendor::Nordic.default_config();
        assert_eq!(nordic_default.sleep_seconds, Some(600));

        let rapoo_default = Vendor::Rapoo.default_config();
        assert_eq!(rapoo_default.sleep_seconds, None);

        assert_ne!(nordic_default, MouseConfig::default());
    }
}
