//! Ordered task lists for quick and full syncs

use crate::entities::{EntityId, EntitySpec, catalog};
use crate::models::SyncPhase;

/// Which kind of sync to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncKind {
    /// High-churn operational entities only
    Quick,
    /// Every entity, grouped
    Full,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::Quick => "quick",
            SyncKind::Full => "full",
        }
    }
}

impl std::fmt::Display for SyncKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<SyncKind> for SyncPhase {
    fn from(kind: SyncKind) -> Self {
        match kind {
            SyncKind::Quick => SyncPhase::Quick,
            SyncKind::Full => SyncPhase::Full,
        }
    }
}

/// One entity fetch inside a plan
#[derive(Debug, Clone, Copy)]
pub struct SyncTask {
    /// Group label for logs
    pub group: &'static str,
    pub entity: &'static EntitySpec,
    /// Failure of a required task fails the run; optional tasks are
    /// best-effort
    pub required: bool,
}

impl SyncTask {
    fn required(group: &'static str, id: EntityId) -> Self {
        Self {
            group,
            entity: catalog::spec(id),
            required: true,
        }
    }

    fn optional(group: &'static str, id: EntityId) -> Self {
        Self {
            group,
            entity: catalog::spec(id),
            required: false,
        }
    }
}

/// Tasks executed strictly in order by the engine
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub kind: SyncKind,
    pub tasks: Vec<SyncTask>,
}

impl SyncPlan {
    pub fn quick() -> Self {
        Self {
            kind: SyncKind::Quick,
            tasks: vec![
                SyncTask::required("core", EntityId::Invoices),
                SyncTask::required("core", EntityId::Jobs),
                SyncTask::required("core", EntityId::Appointments),
            ],
        }
    }

    pub fn full() -> Self {
        Self {
            kind: SyncKind::Full,
            tasks: vec![
                SyncTask::required("core", EntityId::Invoices),
                SyncTask::required("core", EntityId::Jobs),
                SyncTask::required("core", EntityId::Appointments),
                SyncTask::required("crm", EntityId::Customers),
                SyncTask::required("crm", EntityId::Technicians),
                SyncTask::required("sales", EntityId::Estimates),
                SyncTask::optional("reference", EntityId::JobTypes),
                SyncTask::optional("reference", EntityId::BusinessUnits),
                SyncTask::optional("reference", EntityId::TechnicianCategories),
                SyncTask::optional("job detail", EntityId::JobNotes),
                SyncTask::optional("job detail", EntityId::JobHistory),
            ],
        }
    }

    pub fn for_kind(kind: SyncKind) -> Self {
        match kind {
            SyncKind::Quick => Self::quick(),
            SyncKind::Full => Self::full(),
        }
    }
}
