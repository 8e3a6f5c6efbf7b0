//! Static descriptors for every replicated entity
//!
//! Adding or removing an entity is a change to this table, not to the
//! fetch or sync control flow.

use std::time::Duration;

/// Stable identifier of a replicated entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityId {
    Invoices,
    Jobs,
    Appointments,
    Customers,
    Technicians,
    Estimates,
    JobTypes,
    BusinessUnits,
    TechnicianCategories,
    JobNotes,
    JobHistory,
}

/// How the fetcher decides there are no more pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Stop when the response's `hasMore` flag is false or absent
    HasMoreFlag,
    /// Stop when a page returns fewer records than requested
    ShortPage,
    /// The endpoint is not paged; one request returns everything
    SinglePage,
}

/// Where a column's value comes from in the remote record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// JSON pointer into the record (`/customer/name`)
    Field(&'static str),
    /// Length of the array at the pointer, 0 when absent
    Count(&'static str),
    /// Boolean at the pointer, or the default when absent
    FlagOr(&'static str, bool),
    /// Key of the parent row the record was fetched under
    Parent,
}

/// One stored column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub source: Source,
    /// Records with a null value here are skipped
    pub required: bool,
}

const fn field(name: &'static str, pointer: &'static str) -> Column {
    Column {
        name,
        source: Source::Field(pointer),
        required: false,
    }
}

const fn required(name: &'static str, pointer: &'static str) -> Column {
    Column {
        name,
        source: Source::Field(pointer),
        required: true,
    }
}

const fn count(name: &'static str, pointer: &'static str) -> Column {
    Column {
        name,
        source: Source::Count(pointer),
        required: false,
    }
}

const fn flag_or(name: &'static str, pointer: &'static str, default: bool) -> Column {
    Column {
        name,
        source: Source::FlagOr(pointer, default),
        required: false,
    }
}

const fn parent(name: &'static str) -> Column {
    Column {
        name,
        source: Source::Parent,
        required: true,
    }
}

/// Stored parent rows a per-parent entity is fetched for
///
/// Parents are the rows of `relation` whose `date_column` falls within the
/// last `window_days`, newest first, at most `limit` of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentScope {
    pub relation: &'static str,
    pub key_column: &'static str,
    pub date_column: &'static str,
    pub window_days: u32,
    pub limit: usize,
}

/// Everything the fetcher and storage need to know about one entity
#[derive(Debug)]
pub struct EntitySpec {
    pub id: EntityId,
    /// Human-readable name for logs
    pub name: &'static str,
    /// Destination relation
    pub relation: &'static str,
    /// Natural key column (always required)
    pub key: Column,
    /// Non-key columns, in storage order
    pub columns: &'static [Column],
    /// Candidate endpoint paths, tried in order on 403/404
    pub paths: &'static [&'static str],
    pub page_size: u32,
    /// Courtesy delay between successful pages
    pub pacing: Duration,
    pub termination: Termination,
    /// Static query parameters sent with every page
    pub query: &'static [(&'static str, &'static str)],
    /// Query parameter that carries the configured lower time bound
    pub watermark_param: Option<&'static str>,
    /// Set for entities fetched once per parent row; paths contain `{parent}`
    pub parent: Option<ParentScope>,
}

impl EntitySpec {
    /// Every column including the key, in storage order
    pub fn all_columns(&self) -> impl Iterator<Item = &Column> {
        std::iter::once(&self.key).chain(self.columns.iter())
    }
}

pub static INVOICES: EntitySpec = EntitySpec {
    id: EntityId::Invoices,
    name: "invoices",
    relation: "invoices",
    key: required("invoice_id", "/id"),
    columns: &[
        field("customer_name", "/customer/name"),
        field("total", "/total"),
        field("balance", "/balance"),
        field("status", "/status"),
        field("created_at", "/createdOn"),
        field("updated_at", "/modifiedOn"),
    ],
    paths: &["/accounting/v2/tenant/{tenant}/invoices"],
    page_size: 100,
    pacing: Duration::from_millis(50),
    termination: Termination::HasMoreFlag,
    query: &[],
    watermark_param: Some("modifiedOnOrAfter"),
    parent: None,
};

pub static JOBS: EntitySpec = EntitySpec {
    id: EntityId::Jobs,
    name: "jobs",
    relation: "jobs",
    key: required("job_id", "/id"),
    columns: &[
        field("job_number", "/jobNumber"),
        field("customer_id", "/customerId"),
        field("job_type", "/jobType/name"),
        field("technician", "/technician/name"),
        field("location", "/location/name"),
        field("status", "/jobStatus"),
        field("scheduled_date", "/scheduledDate"),
        field("modified_on", "/modifiedOn"),
    ],
    paths: &["/jpm/v2/tenant/{tenant}/jobs"],
    page_size: 100,
    pacing: Duration::from_millis(50),
    termination: Termination::HasMoreFlag,
    query: &[],
    watermark_param: Some("modifiedOnOrAfter"),
    parent: None,
};

pub static APPOINTMENTS: EntitySpec = EntitySpec {
    id: EntityId::Appointments,
    name: "appointments",
    relation: "appointments",
    key: required("appointment_id", "/id"),
    columns: &[
        field("job_id", "/jobId"),
        field("appointment_number", "/appointmentNumber"),
        field("technician_id", "/technician/id"),
        field("technician_name", "/technician/name"),
        field("scheduled_start", "/start"),
        field("scheduled_end", "/end"),
        field("arrival_window_start", "/arrivalWindowStart"),
        field("arrival_window_end", "/arrivalWindowEnd"),
        field("status", "/status"),
        field("special_instructions", "/specialInstructions"),
        field("created_on", "/createdOn"),
        field("modified_on", "/modifiedOn"),
        field("customer_id", "/customerId"),
        field("unused", "/unused"),
        field("created_by_id", "/createdById"),
        field("is_confirmed", "/isConfirmed"),
    ],
    paths: &["/jpm/v2/tenant/{tenant}/appointments"],
    page_size: 50,
    pacing: Duration::from_millis(200),
    termination: Termination::ShortPage,
    query: &[("includeTotal", "true"), ("sort", "+CreatedOn")],
    watermark_param: None,
    parent: None,
};

pub static CUSTOMERS: EntitySpec = EntitySpec {
    id: EntityId::Customers,
    name: "customers",
    relation: "customers",
    key: required("customer_id", "/id"),
    columns: &[
        field("name", "/name"),
        field("first_name", "/firstName"),
        field("last_name", "/lastName"),
        field("company_name", "/companyName"),
        field("email", "/email"),
        field("phone_number", "/phoneNumber"),
        field("mobile_number", "/mobileNumber"),
        field("address_street", "/address/street"),
        field("address_city", "/address/city"),
        field("address_state", "/address/state"),
        field("address_zip", "/address/zip"),
        field("created_on", "/createdOn"),
        field("modified_on", "/modifiedOn"),
        field("active", "/active"),
    ],
    paths: &["/crm/v2/tenant/{tenant}/customers"],
    page_size: 100,
    pacing: Duration::from_millis(100),
    termination: Termination::HasMoreFlag,
    query: &[],
    watermark_param: Some("modifiedAfter"),
    parent: None,
};

pub static TECHNICIANS: EntitySpec = EntitySpec {
    id: EntityId::Technicians,
    name: "technicians",
    relation: "technicians",
    key: required("technician_id", "/id"),
    columns: &[
        field("name", "/name"),
        field("first_name", "/firstName"),
        field("last_name", "/lastName"),
        field("email", "/email"),
        field("phone_number", "/phoneNumber"),
        field("employee_id", "/employeeId"),
        field("active", "/active"),
        field("created_on", "/createdOn"),
    ],
    paths: &["/settings/v2/tenant/{tenant}/technicians"],
    page_size: 100,
    pacing: Duration::from_millis(100),
    termination: Termination::HasMoreFlag,
    query: &[],
    watermark_param: None,
    parent: None,
};

pub static ESTIMATES: EntitySpec = EntitySpec {
    id: EntityId::Estimates,
    name: "estimates",
    relation: "estimates",
    key: required("estimate_id", "/id"),
    columns: &[
        field("job_id", "/jobId"),
        field("customer_id", "/customerId"),
        field("total", "/total"),
        field("status", "/status/name"),
        field("sold_by", "/soldBy/name"),
        field("created_on", "/createdOn"),
        field("sold_on", "/soldOn"),
        count("items_count", "/items"),
    ],
    paths: &["/sales/v2/tenant/{tenant}/estimates"],
    page_size: 100,
    pacing: Duration::from_millis(100),
    termination: Termination::HasMoreFlag,
    query: &[],
    watermark_param: Some("createdOnOrAfter"),
    parent: None,
};

pub static JOB_TYPES: EntitySpec = EntitySpec {
    id: EntityId::JobTypes,
    name: "job types",
    relation: "job_types",
    key: required("job_type_id", "/id"),
    columns: &[
        required("name", "/name"),
        field("description", "/description"),
        flag_or("active", "/active", true),
    ],
    paths: &[
        "/settings/v2/tenant/{tenant}/job-types",
        "/jpm/v2/tenant/{tenant}/job-types",
        "/v2/tenant/{tenant}/job-types",
    ],
    page_size: 100,
    pacing: Duration::from_millis(50),
    termination: Termination::SinglePage,
    query: &[],
    watermark_param: None,
    parent: None,
};

pub static BUSINESS_UNITS: EntitySpec = EntitySpec {
    id: EntityId::BusinessUnits,
    name: "business units",
    relation: "business_units",
    key: required("unit_id", "/id"),
    columns: &[
        required("name", "/name"),
        field("description", "/description"),
        flag_or("active", "/active", true),
    ],
    paths: &["/settings/v2/tenant/{tenant}/business-units"],
    page_size: 100,
    pacing: Duration::from_millis(50),
    termination: Termination::SinglePage,
    query: &[],
    watermark_param: None,
    parent: None,
};

pub static TECHNICIAN_CATEGORIES: EntitySpec = EntitySpec {
    id: EntityId::TechnicianCategories,
    name: "technician categories",
    relation: "technician_categories",
    key: required("category_id", "/id"),
    columns: &[
        required("name", "/name"),
        field("description", "/description"),
        flag_or("active", "/active", true),
    ],
    paths: &["/settings/v2/tenant/{tenant}/technician-categories"],
    page_size: 100,
    pacing: Duration::from_millis(50),
    termination: Termination::SinglePage,
    query: &[],
    watermark_param: None,
    parent: None,
};

pub static JOB_NOTES: EntitySpec = EntitySpec {
    id: EntityId::JobNotes,
    name: "job notes",
    relation: "job_notes",
    key: required("note_id", "/id"),
    columns: &[
        parent("job_id"),
        field("note_text", "/text"),
        field("author", "/author/name"),
        field("author_id", "/author/id"),
        field("created_on", "/createdOn"),
        field("is_internal", "/isInternal"),
    ],
    paths: &["/jpm/v2/tenant/{tenant}/jobs/{parent}/notes"],
    page_size: 100,
    pacing: Duration::from_millis(50),
    termination: Termination::SinglePage,
    query: &[],
    watermark_param: None,
    parent: Some(ParentScope {
        relation: "jobs",
        key_column: "job_id",
        date_column: "scheduled_date",
        window_days: 30,
        limit: 1000,
    }),
};

pub static JOB_HISTORY: EntitySpec = EntitySpec {
    id: EntityId::JobHistory,
    name: "job history",
    relation: "job_history",
    key: required("history_id", "/id"),
    columns: &[
        parent("job_id"),
        field("event_type", "/eventType"),
        field("description", "/description"),
        field("changed_by", "/changedBy/name"),
        field("changed_by_id", "/changedBy/id"),
        field("occurred_at", "/changedOn"),
        field("old_value", "/oldValue"),
        field("new_value", "/newValue"),
    ],
    paths: &["/jpm/v2/tenant/{tenant}/jobs/{parent}/history"],
    page_size: 100,
    pacing: Duration::from_millis(100),
    termination: Termination::SinglePage,
    query: &[],
    watermark_param: None,
    parent: Some(ParentScope {
        relation: "jobs",
        key_column: "job_id",
        date_column: "scheduled_date",
        window_days: 7,
        limit: 500,
    }),
};

/// Every entity in full-sync order
pub fn all() -> [&'static EntitySpec; 11] {
    [
        &INVOICES,
        &JOBS,
        &APPOINTMENTS,
        &CUSTOMERS,
        &TECHNICIANS,
        &ESTIMATES,
        &JOB_TYPES,
        &BUSINESS_UNITS,
        &TECHNICIAN_CATEGORIES,
        &JOB_NOTES,
        &JOB_HISTORY,
    ]
}

/// Look up the descriptor for an entity
pub fn spec(id: EntityId) -> &'static EntitySpec {
    match id {
        EntityId::Invoices => &INVOICES,
        EntityId::Jobs => &JOBS,
        EntityId::Appointments => &APPOINTMENTS,
        EntityId::Customers => &CUSTOMERS,
        EntityId::Technicians => &TECHNICIANS,
        EntityId::Estimates => &ESTIMATES,
        EntityId::JobTypes => &JOB_TYPES,
        EntityId::BusinessUnits => &BUSINESS_UNITS,
        EntityId::TechnicianCategories => &TECHNICIAN_CATEGORIES,
        EntityId::JobNotes => &JOB_NOTES,
        EntityId::JobHistory => &JOB_HISTORY,
    }
}
