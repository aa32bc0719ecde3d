/* The declarative protocol model.
 *
 * Every vendor module exports one `Protocol`: a static table of
 * `FeatureEntry` rows plus the framing, dedup and gate hooks the generic
 * planner needs. All protocol knowledge lives in these tables: adding a
 * feature is adding an entry, adding a vendor is adding a module that
 * exports the same shape. The attached functions are plain `fn`s; there
 * is no trait object or inheritance in this layer. */

use serde_json::Value;

use crate::command::{Command, WriteSpec};
use crate::config::{Capabilities, MouseConfig};
use crate::error::Result;
use crate::patch::{ChangeSet, FeatureKey};
use crate::protocol::Vendor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /* One register/opcode write; `encode` sees only the patched value. */
    Direct,
    /* Several semantic fields share one register; `encode` reads the
     * whole next state for a merged value. */
    Compound,
    /* No direct register; expands into a bespoke command sequence. */
    Virtual,
}

/* Context handed to `plan` hooks. */
pub struct PlanCtx<'a> {
    pub caps: &'a Capabilities,
    pub prev: &'a MouseConfig,
}

pub type ValidateFn = fn(&ChangeSet, &MouseConfig, &Capabilities) -> Result<()>;
pub type EncodeFn = fn(&Value, &MouseConfig, &Capabilities) -> Result<WriteSpec>;
pub type PlanFn = fn(&ChangeSet, &MouseConfig, &PlanCtx) -> Result<Vec<Command>>;
pub type ExpandFn = fn(&mut ChangeSet, &MouseConfig, &Capabilities) -> Result<()>;
pub type PackFn = fn(&WriteSpec) -> Command;
pub type DedupKeyFn = fn(&Command) -> DedupKey;
pub type KeepaliveFn = fn(&[u8]) -> bool;

/* How an entry turns into wire commands. */
pub enum EntryAction {
    /* Packed through the vendor's `pack` hook. */
    Encode(EncodeFn),
    /* Emits its own command sequence. */
    Plan(PlanFn),
}

pub struct FeatureEntry {
    pub key: FeatureKey,
    pub kind: EntryKind,
    /* Dispatch order; low runs first. */
    pub priority: u8,
    /* Extra patch keys that cause this entry to fire. */
    pub triggers: &'static [FeatureKey],
    pub validate: Option<ValidateFn>,
    pub action: EntryAction,
}

impl FeatureEntry {
    /* Whether this entry fires for the given change set. */
    pub fn fires_for(&self, changes: &ChangeSet) -> bool {
        changes.contains(self.key) || self.triggers.iter().any(|t| changes.contains(*t))
    }
}

/* Last-write-wins dedup key. The optional fourth component carries
 * `data[0]` for indexed writes (DPI slots, button slots) so distinct
 * slots survive dedup. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub report_id: u8,
    pub opcode: u8,
    pub len_or_idx: u8,
    pub data0: Option<u8>,
}

/* Secure unlock/lock bracket for vendors that gate sensitive writes. */
pub struct GateSpec {
    pub report_id: u8,
    pub unlock_opcode: u8,
    pub lock_opcode: u8,
    pub unlock_payload: &'static [u8],
    pub lock_payload: &'static [u8],
    /* Settle time around each gate transition. */
    pub wait_ms: u16,
}

impl GateSpec {
    pub fn unlock_command(&self) -> Command {
        Command::new(self.report_id, self.unlock_opcode, self.unlock_payload.to_vec())
            .wait_ms(self.wait_ms)
            .gate_marker()
    }

    pub fn lock_command(&self) -> Command {
        Command::new(self.report_id, self.lock_opcode, self.lock_payload.to_vec())
            .wait_ms(self.wait_ms)
            .gate_marker()
    }
}

/* One vendor's complete protocol description. */
pub struct Protocol {
    pub vendor: Vendor,
    pub entries: &'static [FeatureEntry],
    /* Vendor-specific aliases, applied after the global table. */
    pub aliases: &'static [(&'static str, FeatureKey)],
    /* Dependency expansion: mutates the change set before the next
     * state is built (e.g. the nordic polling/perf-mode convergence). */
    pub expand: ExpandFn,
    /* Frame a `WriteSpec` into a wire command. */
    pub pack: PackFn,
    pub dedup_key: DedupKeyFn,
    pub gate: Option<&'static GateSpec>,
    /* Input reports matching this predicate are dropped before any ack
     * matching or demux parsing. */
    pub keepalive: Option<KeepaliveFn>,
}

impl Protocol {
    pub fn find_entry(&self, key: FeatureKey) -> Option<&FeatureEntry> {
        self.entries.iter().find(|e| e.key == key)
    }
}

/* No-op expansion for vendors without cross-field dependencies. */
pub fn expand_none(
    _changes: &mut ChangeSet,
    _prev: &MouseConfig,
    _caps: &Capabilities,
) -> Result<()> {
    Ok(())
}
