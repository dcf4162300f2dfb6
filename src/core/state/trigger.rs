// src/core/state/trigger.rs

//! Event triggers: small persistent records that fire when a watched
//! condition (node down, node drained, job completion, reconfigure)
//! becomes true. Fired triggers are logged and removed.

use crate::core::ControllerError;
use strum_macros::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
#[repr(u16)]
pub enum TriggerKind {
    NodeDown = 0,
    NodeDrained = 1,
    JobComplete = 2,
    Reconfigure = 3,
}

impl TriggerKind {
    pub fn from_u16(v: u16) -> Result<Self, ControllerError> {
        match v {
            0 => Ok(TriggerKind::NodeDown),
            1 => Ok(TriggerKind::NodeDrained),
            2 => Ok(TriggerKind::JobComplete),
            3 => Ok(TriggerKind::Reconfigure),
            other => Err(ControllerError::Protocol(format!(
                "bad trigger kind {other}"
            ))),
        }
    }
}

/// One armed trigger. `target` names a node for node kinds, a job id for
/// job kinds, and is empty for `Reconfigure`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub trig_id: u32,
    pub kind: TriggerKind,
    pub target: String,
}

#[derive(Debug, Default)]
pub struct TriggerTable {
    pub triggers: Vec<Trigger>,
    pub next_id: u32,
}

impl TriggerTable {
    pub fn arm(&mut self, kind: TriggerKind, target: String) -> u32 {
        self.next_id += 1;
        let id = self.next_id;
        self.triggers.push(Trigger {
            trig_id: id,
            kind,
            target,
        });
        id
    }

    /// Removes and returns every trigger matching the predicate.
    pub fn pull(&mut self, mut matches: impl FnMut(&Trigger) -> bool) -> Vec<Trigger> {
        let (fired, kept): (Vec<Trigger>, Vec<Trigger>) =
            std::mem::take(&mut self.triggers).into_iter().partition(|t| matches(t));
        self.triggers = kept;
        fired
    }
}
