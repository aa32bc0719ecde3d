/* mousetune: cross-vendor HID mouse configuration engine.
 *
 * Semantic patches go in, bit-exact report sequences come out; device
 * responses are parsed back into the same semantic model. The crate is
 * a pure in-memory library: device discovery and the UI live outside
 * and talk to it through the `HidDevice` trait on one side and the
 * `MouseApi` façade on the other.
 *
 * Layering, bottom up: per-vendor codecs (`protocol::*`), the queued
 * transport (`transport`), pure value transformers (`convert`), the
 * declarative feature tables (`features`), the planner (`planner`),
 * and the façade (`api`). The registry (`registry`) identifies a
 * device and produces the right façade. */

pub mod api;
pub mod command;
pub mod config;
pub mod convert;
pub mod error;
pub mod features;
pub mod funckey;
pub mod hid;
pub mod patch;
pub mod planner;
pub mod protocol;
pub mod registry;
pub mod testing;
pub mod transport;

mod integration_tests;

pub use api::{MouseApi, Subscription};
pub use config::{
    BatteryState, ButtonMapping, Capabilities, DebounceLevel, FirmwareInfo, LedState, LodHeight,
    MouseConfig, PerfMode, Rgb,
};
pub use error::{MouseError, Result};
pub use hid::{Collection, HidDevice, InputReport, ReportInfo};
pub use patch::{FeatureKey, Patch};
pub use protocol::Vendor;
pub use registry::{attach, identify, DeviceIdentity, RegistryEntry, ReportFilter, REGISTRY};
pub use transport::{Transport, TransportConfig};
