/* Abstract HID device capability.
 *
 * The engine never touches a platform HID stack directly; everything it
 * needs from the host is expressed by the `HidDevice` trait. Real
 * implementations wrap hidraw/hidapi/WebHID on the outside; tests use
 * the scripted device in `crate::testing`. */

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;

/* One report declared by the HID descriptor: its id and total byte length
 * (excluding the report-id byte). */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportInfo {
    pub id: u8,
    pub byte_len: usize,
}

/* One top-level HID collection with its usage signature and declared
 * reports. Mirrors what the host HID stack exposes per interface. */
#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub usage_page: u16,
    pub usage: u16,
    pub input_reports: Vec<ReportInfo>,
    pub output_reports: Vec<ReportInfo>,
    pub feature_reports: Vec<ReportInfo>,
}

/* An input report event delivered by the device. */
#[derive(Debug, Clone)]
pub struct InputReport {
    pub report_id: u8,
    pub data: Vec<u8>,
}

/* The device capability consumed by the engine.
 *
 * Methods take `&self`; implementations are expected to use interior
 * mutability, since the transport serialises all calls anyway. */
#[async_trait]
pub trait HidDevice: Send + Sync {
    fn vendor_id(&self) -> u16;
    fn product_id(&self) -> u16;
    fn product_name(&self) -> String;
    fn is_open(&self) -> bool;
    fn collections(&self) -> Vec<Collection>;

    async fn open(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;

    /* Write an output report. `data` excludes the report-id byte. */
    async fn send_report(&self, report_id: u8, data: &[u8]) -> Result<()>;

    /* Write a feature report. `data` excludes the report-id byte. */
    async fn send_feature_report(&self, report_id: u8, data: &[u8]) -> Result<()>;

    /* Read the named feature report. Returns the data bytes without the
     * report id. */
    async fn receive_feature_report(&self, report_id: u8) -> Result<Vec<u8>>;

    /* Subscribe to the device's input-report event stream. */
    fn input_reports(&self) -> broadcast::Receiver<InputReport>;
}

/* Look up the declared byte length for an output report id across all
 * collections. Returns `None` when the descriptor does not enumerate it,
 * in which case the transport falls back to probing a candidate set. */
pub fn output_report_len(collections: &[Collection], report_id: u8) -> Option<usize> {
    collections
        .iter()
        .flat_map(|c| c.output_reports.iter().chain(c.feature_reports.iter()))
        .find(|r| r.id == report_id)
        .map(|r| r.byte_len)
}

/* Look up the declared byte length for a feature report id. */
pub fn feature_report_len(collections: &[Collection], report_id: u8) -> Option<usize> {
    collections
        .iter()
        .flat_map(|c| c.feature_reports.iter())
        .find(|r| r.id == report_id)
        .map(|r| r.byte_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collections() -> Vec<Collection> {
        vec![
            Collection {
                usage_page: 0xFF00,
                usage: 0x01,
                input_reports: vec![ReportInfo { id: 0x04, byte_len: 8 }],
                output_reports: vec![ReportInfo { id: 0x05, byte_len: 64 }],
                feature_reports: vec![ReportInfo { id: 0x06, byte_len: 32 }],
            },
            Collection {
                usage_page: 0xFF0A,
                usage: 0x02,
                input_reports: vec![],
                output_reports: vec![],
                feature_reports: vec![ReportInfo { id: 0x08, byte_len: 64 }],
            },
        ]
    }

    #[test]
    fn output_len_from_output_reports() {
        assert_eq!(output_report_len(&collections(), 0x05), Some(64));
    }

    #[test]
    fn output_len_falls_back_to_feature_reports() {
        /* Feature-only report ids still resolve for writes, since the
         * transport may deliver them via send_feature_report. */
        assert_eq!(output_report_len(&collections(), 0x08), Some(64));
    }

    #[test]
    fn unknown_report_id_is_none() {
        assert_eq!(output_report_len(&collections(), 0x99), None);
        assert_eq!(feature_report_len(&collections(), 0x99), None);
    }

    #[test]
    fn feature_len_scans_all_collections() {
        assert_eq!(feature_report_len(&collections(), 0x08), Some(64));
        assert_eq!(feature_report_len(&collections(), 0x06), Some(32));
    }
}
