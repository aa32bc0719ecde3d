/* Compile-time device registry.
 *
 * One row per protocol family: a match rule over the device identity
 * (VID, PID, collection usage signature) plus the report filters a
 * host shell needs to request the right HID interfaces. `attach` is
 * the factory: identify the family, produce the façade. */

use std::sync::Arc;

use tracing::debug;

use crate::api::MouseApi;
use crate::error::{MouseError, Result};
use crate::hid::{Collection, HidDevice};
use crate::protocol::Vendor;

/* What a row needs to know about a connected device. */
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub collections: Vec<Collection>,
}

impl DeviceIdentity {
    pub fn of(dev: &dyn HidDevice) -> Self {
        Self {
            vendor_id: dev.vendor_id(),
            product_id: dev.product_id(),
            collections: dev.collections(),
        }
    }

    fn has_usage(&self, page: u16) -> bool {
        self.collections.iter().any(|c| c.usage_page == page)
    }

    fn has_usage_pair(&self, page: u16, usage: u16) -> bool {
        self.collections
            .iter()
            .any(|c| c.usage_page == page && c.usage == usage)
    }
}

/* Filter handed to the host HID layer when requesting devices. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportFilter {
    pub vendor_id: u16,
    pub product_id: Option<u16>,
    pub usage_page: Option<u16>,
    pub usage: Option<u16>,
}

pub struct RegistryEntry {
    pub vendor: Vendor,
    pub matches: fn(&DeviceIdentity) -> bool,
    pub report_filters: &'static [ReportFilter],
}

fn match_pixart(id: &DeviceIdentity) -> bool {
    id.vendor_id == 0x093A
        && id.product_id == 0xEB02
        && (id.collections.is_empty() || id.has_usage(0xFF01) || id.has_usage(0xFF00))
}

fn match_rapoo(id: &DeviceIdentity) -> bool {
    id.vendor_id == 0x24AE
        && (id.collections.is_empty()
            || id.has_usage_pair(0xFF00, 14)
            || id.has_usage_pair(0xFF00, 15))
}

fn match_nordic(id: &DeviceIdentity) -> bool {
    id.vendor_id == 0x1915
        && (id.collections.is_empty() || id.has_usage(0xFF0A) || id.has_usage(0xFF00))
}

fn match_hidpp(id: &DeviceIdentity) -> bool {
    id.vendor_id == 0x046D
        && (id.collections.is_empty()
            || id.has_usage_pair(0xFF00, 0x01)
            || id.has_usage_pair(0xFF00, 0x02))
}

fn match_compx(id: &DeviceIdentity) -> bool {
    (id.vendor_id == 0x373B || id.vendor_id == 0x3710)
        && (id.collections.is_empty() || id.has_usage_pair(0xFF02, 0x0002))
}

pub static REGISTRY: &[RegistryEntry] = &[
    RegistryEntry {
        vendor: Vendor::Pixart,
        matches: match_pixart,
        report_filters: &[
            ReportFilter {
                vendor_id: 0x093A,
                product_id: Some(0xEB02),
                usage_page: Some(0xFF01),
                usage: None,
            },
            ReportFilter {
                vendor_id: 0x093A,
                product_id: Some(0xEB02),
                usage_page: Some(0xFF00),
                usage: None,
            },
        ],
    },
    RegistryEntry {
        vendor: Vendor::Rapoo,
        matches: match_rapoo,
        report_filters: &[
            ReportFilter {
                vendor_id: 0x24AE,
                product_id: None,
                usage_page: Some(0xFF00),
                usage: Some(14),
            },
            ReportFilter {
                vendor_id: 0x24AE,
                product_id: None,
                usage_page: Some(0xFF00),
                usage: Some(15),
            },
        ],
    },
    RegistryEntry {
        vendor: Vendor::Nordic,
        matches: match_nordic,
        report_filters: &[
            ReportFilter {
                vendor_id: 0x1915,
                product_id: None,
                usage_page: Some(0xFF0A),
                usage: None,
            },
            ReportFilter {
                vendor_id: 0x1915,
                product_id: None,
                usage_page: Some(0xFF00),
                usage: None,
            },
        ],
    },
    RegistryEntry {
        vendor: Vendor::Hidpp,
        matches: match_hidpp,
        report_filters: &[
            ReportFilter {
                vendor_id: 0x046D,
                product_id: None,
                usage_page: Some(0xFF00),
                usage: Some(0x01),
            },
            ReportFilter {
                vendor_id: 0x046D,
                product_id: None,
                usage_page: Some(0xFF00),
                usage: Some(0x02),
            },
        ],
    },
    RegistryEntry {
        vendor: Vendor::Compx,
        matches: match_compx,
        report_filters: &[
            ReportFilter {
                vendor_id: 0x373B,
                product_id: None,
                usage_page: Some(0xFF02),
                usage: Some(0x0002),
            },
            ReportFilter {
                vendor_id: 0x3710,
                product_id: None,
                usage_page: Some(0xFF02),
                usage: Some(0x0002),
            },
        ],
    },
];

/* Identify which protocol family a device speaks, if any. */
pub fn identify(dev: &dyn HidDevice) -> Option<Vendor> {
    let identity = DeviceIdentity::of(dev);
    let hit = REGISTRY
        .iter()
        .find(|entry| (entry.matches)(&identity))
        .map(|entry| entry.vendor);
    debug!(
        "registry lookup {:04x}:{:04x} -> {:?}",
        identity.vendor_id, identity.product_id, hit
    );
    hit
}

/* Factory: produce the façade for a recognised device. */
pub fn attach(dev: Arc<dyn HidDevice>) -> Result<MouseApi> {
    let vendor = identify(dev.as_ref()).ok_or(MouseError::NoDevice)?;
    Ok(MouseApi::new(vendor, dev))
}

/* All report filters, for a shell that requests devices up front. */
pub fn all_report_filters() -> Vec<ReportFilter> {
    REGISTRY
        .iter()
        .flat_map(|entry| entry.report_filters.iter().copied())
        .collect()
}
