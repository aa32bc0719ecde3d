/* Protocol family implementations.
 *
 * One module per family, each exporting the same shape: a `Protocol`
 * table, a `Capabilities` record, a default snapshot, and the async
 * read paths (`read_config`, `read_battery`) plus the input-report
 * decoder. The `Vendor` enum is the closed dispatch point: the
 * registry's factory returns a concrete variant, never a trait object. */

pub mod compx;
pub mod hidpp;
pub mod nordic;
pub mod pixart;
pub mod rapoo;

use serde::{Deserialize, Serialize};

use crate::config::{BatteryState, Capabilities, MouseConfig};
use crate::error::Result;
use crate::features::Protocol;
use crate::hid::InputReport;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Pixart,
    Rapoo,
    Nordic,
    Hidpp,
    Compx,
}

impl Vendor {
    pub fn name(self) -> &'static str {
        match self {
            Self::Pixart => "pixart",
            Self::Rapoo => "rapoo",
            Self::Nordic => "nordic",
            Self::Hidpp => "hidpp",
            Self::Compx => "compx",
        }
    }

    pub fn protocol(self) -> &'static Protocol {
        match self {
            Self::Pixart => pixart::protocol(),
            Self::Rapoo => rapoo::protocol(),
            Self::Nordic => nordic::protocol(),
            Self::Hidpp => hidpp::protocol(),
            Self::Compx => compx::protocol(),
        }
    }

    pub fn capabilities(self) -> &'static Capabilities {
        match self {
            Self::Pixart => pixart::capabilities(),
            Self::Rapoo => rapoo::capabilities(),
            Self::Nordic => nordic::capabilities(),
            Self::Hidpp => hidpp::capabilities(),
            Self::Compx => compx::capabilities(),
        }
    }

    /* Protocol-default snapshot a fresh `MouseApi` starts from. */
    pub fn default_config(self) -> MouseConfig {
        match self {
            Self::Pixart => pixart::default_config(),
            Self::Rapoo => rapoo::default_config(),
            Self::Nordic => nordic::default_config(),
            Self::Hidpp => hidpp::default_config(),
            Self::Compx => compx::default_config(),
        }
    }

    /* Rebuild the full snapshot from hardware. */
    pub async fn read_config(self, transport: &Transport) -> Result<MouseConfig> {
        match self {
            Self::Pixart => pixart::read_config(transport).await,
            Self::Rapoo => rapoo::read_config(transport).await,
            Self::Nordic => nordic::read_config(transport).await,
            Self::Hidpp => hidpp::read_config(transport).await,
            Self::Compx => compx::read_config(transport).await,
        }
    }

    pub async fn read_battery(self, transport: &Transport) -> Result<BatteryState> {
        match self {
            Self::Pixart => pixart::read_battery(transport).await,
            Self::Rapoo => rapoo::read_battery(transport).await,
            Self::Nordic => nordic::read_battery(transport).await,
            Self::Hidpp => hidpp::read_battery(transport).await,
            Self::Compx => compx::read_battery(transport).await,
        }
    }

    /* Decode a pushed input report. Keep-alives are filtered before
     * this is called. */
    pub fn parse_input(self, report: &InputReport) -> Option<InputEvent> {
        match self {
            Self::Pixart => pixart::parse_input(report),
            Self::Rapoo => rapoo::parse_input(report),
            Self::Nordic => nordic::parse_input(report),
            Self::Hidpp => hidpp::parse_input(report),
            Self::Compx => compx::parse_input(report),
        }
    }
}

/* A decoded device push. */
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    Battery(BatteryState),
    Config(ConfigPush),
}

/* Partial state carried by unsolicited config frames; only the fields
 * the frame actually encodes are set. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigPush {
    pub polling_hz: Option<u32>,
    pub current_dpi_index: Option<u8>,
    pub dpi_slot_count: Option<u8>,
}

impl ConfigPush {
    pub fn apply_to(&self, config: &mut MouseConfig) {
        if let Some(hz) = self.polling_hz {
            config.polling_hz = Some(hz);
        }
        if let Some(index) = self.current_dpi_index {
            config.current_dpi_index = Some(index);
        }
        if let Some(count) = self.dpi_slot_count {
            config.dpi_slot_count = Some(count);
        }
    }
}
