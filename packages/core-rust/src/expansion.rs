//! Group expansion plans and their delimited record codec.
//!
//! An expansion plan moves a slot range from a source group to a freshly
//! added, empty destination group through four strictly ordered phases:
//! data sync, backup, slot migration, data clean. Each phase is triggered by
//! its own admin RPC and recorded on the plan, so a half-finished expansion
//! survives a coordinator restart and resumes where it stopped.
//!
//! # Record format
//!
//! Plans persist (and are listed over the API) as one `$`-delimited record
//! per line:
//!
//! ```text
//! id$src$dst$slots$speed$retention$action$step$status$error
//! ```
//!
//! `action`, `step` and `status` are numeric codes; `slots` is a `"0-9,20"`
//! slot list; `error` is free text and, being the final field, may itself
//! contain `$`. The add-plan RPC submits the five-field head form
//! `src$dst$slots$speed$retention`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::group::valid_group_id;
use crate::slots::{format_slot_list, parse_slot_list};

/// Upper bound for the per-plan sync speed knob, in MB/s.
pub const MAX_SYNC_SPEED_MB: u32 = 125;

/// Number of fields in a full plan record.
const RECORD_FIELDS: usize = 10;

/// Number of fields in the add-plan head form.
const ADD_REQUEST_FIELDS: usize = 5;

// ---------------------------------------------------------------------------
// Phase enums
// ---------------------------------------------------------------------------

/// Which phase of the expansion the plan last entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum PlanAction {
    #[default]
    Nothing,
    DataSync,
    Backup,
    SlotsMigrate,
    DataClean,
}

impl PlanAction {
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Nothing => 0,
            Self::DataSync => 1,
            Self::Backup => 2,
            Self::SlotsMigrate => 3,
            Self::DataClean => 4,
        }
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Nothing),
            1 => Some(Self::DataSync),
            2 => Some(Self::Backup),
            3 => Some(Self::SlotsMigrate),
            4 => Some(Self::DataClean),
            _ => None,
        }
    }
}

/// Progress of the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlanStep {
    #[default]
    Nothing,
    Running,
    Finished,
}

impl PlanStep {
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Nothing => 0,
            Self::Running => 1,
            Self::Finished => 2,
        }
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Nothing),
            1 => Some(Self::Running),
            2 => Some(Self::Finished),
            _ => None,
        }
    }
}

/// Sub-step cursor inside the data-clean phase (the record's `status`
/// column). Each clean RPC advances at most one sub-step, gated on the
/// poller's observed reload/purge flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CleanStep {
    #[default]
    Nothing,
    SlotsReload,
    SlotsPurge,
    SlotIndexPurge,
    Compact,
    Done,
}

impl CleanStep {
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Nothing => 0,
            Self::SlotsReload => 1,
            Self::SlotsPurge => 2,
            Self::SlotIndexPurge => 3,
            Self::Compact => 4,
            Self::Done => 5,
        }
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Nothing),
            1 => Some(Self::SlotsReload),
            2 => Some(Self::SlotsPurge),
            3 => Some(Self::SlotIndexPurge),
            4 => Some(Self::Compact),
            5 => Some(Self::Done),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// AddPlanRequest
// ---------------------------------------------------------------------------

/// Validated add-plan submission (`src$dst$slots$speed$retention`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddPlanRequest {
    pub src_group: u32,
    pub dst_group: u32,
    pub slots: Vec<usize>,
    /// Replication speed cap in MB/s, `0..=MAX_SYNC_SPEED_MB` (0 = unlimited).
    pub sync_speed: u32,
    /// Binlog retention in hours on both masters while the plan runs.
    pub binlog_retention: u32,
}

impl AddPlanRequest {
    /// Parse and validate the five-field head form.
    ///
    /// # Errors
    ///
    /// Fails on a wrong field count, non-numeric fields, group ids outside
    /// `1..=9999`, identical src/dst, an invalid slot list, or a sync speed
    /// above [`MAX_SYNC_SPEED_MB`].
    pub fn parse(text: &str) -> Result<Self> {
        let fields: Vec<&str> = text.split('$').collect();
        if fields.len() != ADD_REQUEST_FIELDS {
            bail!(
                "add-plan request needs {ADD_REQUEST_FIELDS} '$'-separated fields, got {}",
                fields.len()
            );
        }
        let src_group: u32 = fields[0]
            .parse()
            .with_context(|| format!("invalid source group {:?}", fields[0]))?;
        let dst_group: u32 = fields[1]
            .parse()
            .with_context(|| format!("invalid target group {:?}", fields[1]))?;
        if !valid_group_id(src_group) || !valid_group_id(dst_group) {
            bail!("group ids must be within [1, 9999]");
        }
        if src_group == dst_group {
            bail!("source and target group are both {src_group}");
        }
        let slots = parse_slot_list(fields[2])?;
        let sync_speed: u32 = fields[3]
            .parse()
            .with_context(|| format!("invalid sync speed {:?}", fields[3]))?;
        if sync_speed > MAX_SYNC_SPEED_MB {
            bail!("sync speed {sync_speed} exceeds {MAX_SYNC_SPEED_MB} MB/s");
        }
        let binlog_retention: u32 = fields[4]
            .parse()
            .with_context(|| format!("invalid binlog retention {:?}", fields[4]))?;
        Ok(Self {
            src_group,
            dst_group,
            slots,
            sync_speed,
            binlog_retention,
        })
    }
}

// ---------------------------------------------------------------------------
// ExpansionPlan
// ---------------------------------------------------------------------------

/// A persisted expansion plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpansionPlan {
    pub id: u64,
    pub src_group: u32,
    pub dst_group: u32,
    /// Canonical `"0-9,20"` slot list text.
    pub slot_list: String,
    pub sync_speed: u32,
    pub binlog_retention: u32,
    pub action: PlanAction,
    pub step: PlanStep,
    /// Clean-phase sub-step cursor.
    pub status: CleanStep,
    /// Last failure of the current phase; empty when none.
    pub error: String,
}

impl ExpansionPlan {
    /// A fresh plan from a validated add-plan request.
    #[must_use]
    pub fn new(id: u64, req: &AddPlanRequest) -> Self {
        Self {
            id,
            src_group: req.src_group,
            dst_group: req.dst_group,
            slot_list: format_slot_list(&req.slots),
            sync_speed: req.sync_speed,
            binlog_retention: req.binlog_retention,
            action: PlanAction::Nothing,
            step: PlanStep::Nothing,
            status: CleanStep::Nothing,
            error: String::new(),
        }
    }

    /// The plan's slot ids, parsed from the stored list.
    ///
    /// # Errors
    ///
    /// Fails only if the stored text was corrupted.
    pub fn slots(&self) -> Result<Vec<usize>> {
        parse_slot_list(&self.slot_list)
    }

    /// Whether a phase is currently running or the clean pipeline is between
    /// sub-steps. Such a plan cannot be deleted.
    #[must_use]
    pub fn in_flight(&self) -> bool {
        if self.step == PlanStep::Running {
            return true;
        }
        self.action == PlanAction::DataClean
            && !matches!(self.status, CleanStep::Nothing | CleanStep::Done)
    }

    /// Encode as the full ten-field record. Newlines in the error text are
    /// flattened so a record always occupies one line.
    #[must_use]
    pub fn to_record(&self) -> String {
        format!(
            "{}${}${}${}${}${}${}${}${}${}",
            self.id,
            self.src_group,
            self.dst_group,
            self.slot_list,
            self.sync_speed,
            self.binlog_retention,
            self.action.code(),
            self.step.code(),
            self.status.code(),
            self.error.replace('\n', " "),
        )
    }

    /// Decode a full ten-field record.
    ///
    /// # Errors
    ///
    /// Fails on a short record or any non-decodable field. The error field is
    /// last and unescaped, so it may contain `$`.
    pub fn parse_record(text: &str) -> Result<Self> {
        let fields: Vec<&str> = text.splitn(RECORD_FIELDS, '$').collect();
        if fields.len() != RECORD_FIELDS {
            bail!(
                "plan record needs {RECORD_FIELDS} '$'-separated fields, got {}",
                fields.len()
            );
        }
        let id: u64 = fields[0]
            .parse()
            .with_context(|| format!("invalid plan id {:?}", fields[0]))?;
        let head = AddPlanRequest::parse(&fields[1..=5].join("$"))
            .with_context(|| format!("plan {id}"))?;
        let action = fields[6]
            .parse::<u8>()
            .ok()
            .and_then(PlanAction::from_code)
            .with_context(|| format!("invalid plan action {:?}", fields[6]))?;
        let step = fields[7]
            .parse::<u8>()
            .ok()
            .and_then(PlanStep::from_code)
            .with_context(|| format!("invalid plan step {:?}", fields[7]))?;
        let status = fields[8]
            .parse::<u8>()
            .ok()
            .and_then(CleanStep::from_code)
            .with_context(|| format!("invalid plan status {:?}", fields[8]))?;
        let mut plan = Self::new(id, &head);
        plan.action = action;
        plan.step = step;
        plan.status = status;
        plan.error = fields[9].to_string();
        Ok(plan)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
