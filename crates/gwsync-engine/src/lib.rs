//! The sync engine: cursor-driven incremental extraction, per-site grouping,
//! reconciliation of observations against what the store already holds, and
//! dependency-ordered entity upserts. Jobs are declarative configs; the
//! runner wires them to a record source and a sink.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use gwsync_adapters::{CmpOp, Filter, RecordSource, SourceSettings, SourceSpec, TableQuery};
use gwsync_core::{
    bare_field, coerce_f64, coerce_i64, format_wire_time, is_missing_value, parse_store_time,
    parse_with_formats, DatastreamPayload, Entity, EntityKind, GroupKey, IotId, JobState,
    LocationPayload, ObservationRecord, ObservationsPayload, ObservedPropertyPayload, Row,
    SensorPayload, ThingPayload,
};
use gwsync_sta::{LocationQuery, StaClientConfig, StaError, StaSink};

pub const CRATE_NAME: &str = "gwsync-engine";

/// Sources report depth in meters; the store standardizes on feet.
pub const METERS_TO_FEET: f64 = 3.28084;

/// Ingest timestamps as upstream pipelines emit them: isoformat with or
/// without fractional seconds and offset. Order matters, first parse wins.
pub const ISO_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
];

/// Plain SQL datetime columns.
pub const WAREHOUSE_TIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S"];

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

/// Runtime configuration, environment-driven like the rest of the deploy.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub sta_base_url: String,
    pub sta_username: Option<String>,
    pub sta_password: Option<String>,
    pub http_timeout: Duration,
    pub user_agent: Option<String>,
    pub fixture_root: PathBuf,
    pub bucket_base: String,
    pub ckan_base: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        let sources = SourceSettings::default();
        Self {
            sta_base_url: "http://localhost:8080/FROST-Server/v1.1".to_string(),
            sta_username: None,
            sta_password: None,
            http_timeout: Duration::from_secs(30),
            user_agent: Some(format!("gwsync/{}", env!("CARGO_PKG_VERSION"))),
            fixture_root: sources.fixture_root,
            bucket_base: sources.bucket_base,
            ckan_base: sources.ckan_base,
        }
    }
}

impl SyncSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sta_base_url: env_or("GWSYNC_STA_URL", &defaults.sta_base_url),
            sta_username: std::env::var("GWSYNC_STA_USER").ok(),
            sta_password: std::env::var("GWSYNC_STA_PASSWORD").ok(),
            http_timeout: Duration::from_secs(env_parse("GWSYNC_HTTP_TIMEOUT_SECS", 30)),
            user_agent: std::env::var("GWSYNC_USER_AGENT")
                .ok()
                .or(defaults.user_agent),
            fixture_root: std::env::var("GWSYNC_FIXTURE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.fixture_root),
            bucket_base: env_or("GWSYNC_BUCKET_BASE", &defaults.bucket_base),
            ckan_base: env_or("GWSYNC_CKAN_BASE", &defaults.ckan_base),
        }
    }

    pub fn source_settings(&self) -> SourceSettings {
        SourceSettings {
            fixture_root: self.fixture_root.clone(),
            bucket_base: self.bucket_base.clone(),
            ckan_base: self.ckan_base.clone(),
            timeout: self.http_timeout,
            user_agent: self.user_agent.clone(),
        }
    }

    pub fn sta_client_config(&self) -> StaClientConfig {
        let mut config = StaClientConfig::new(self.sta_base_url.clone());
        config.username = self.sta_username.clone();
        config.password = self.sta_password.clone();
        config.timeout = self.http_timeout;
        config.user_agent = self.user_agent.clone();
        config
    }
}

/// Operator-editable toggle file. Jobs absent from the file run with their
/// registry defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobToggle {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub limit: Option<i64>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsFile {
    #[serde(default)]
    pub jobs: Vec<JobToggle>,
}

impl JobsFile {
    pub fn toggle(&self, name: &str) -> Option<&JobToggle> {
        self.jobs.iter().find(|t| t.name == name)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.toggle(name).map(|t| t.enabled).unwrap_or(true)
    }

    pub fn limit_override(&self, name: &str) -> Option<i64> {
        self.toggle(name).and_then(|t| t.limit)
    }
}

pub fn load_jobs_file(path: impl AsRef<Path>) -> anyhow::Result<JobsFile> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading jobs file {}", path.display()))?;
    let file: JobsFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing jobs file {}", path.display()))?;
    Ok(file)
}

/// How a job's cursor column orders and renders. Numeric and opaque cursors
/// are strictly-greater; timestamp jobs choose their operator because some
/// upstreams reuse the boundary second across batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    Numeric,
    Timestamp {
        formats: &'static [&'static str],
        op: CmpOp,
    },
    Opaque,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorSpec {
    pub field: &'static str,
    pub kind: CursorKind,
}

enum CursorRank {
    Num(f64),
    Time(NaiveDateTime),
    Text(String),
}

fn rank_gt(a: &CursorRank, b: &CursorRank) -> bool {
    match (a, b) {
        (CursorRank::Num(x), CursorRank::Num(y)) => x > y,
        (CursorRank::Time(x), CursorRank::Time(y)) => x > y,
        (CursorRank::Text(x), CursorRank::Text(y)) => x > y,
        _ => false,
    }
}

impl CursorSpec {
    /// Extraction predicate for the saved state, or None for a full pull.
    /// A malformed cursor is never fatal; it degrades to a full resync and
    /// the dedup downstream absorbs the re-read.
    pub fn compute_filter(&self, state: &JobState) -> Option<Filter> {
        let value = state.cursor(self.field)?;
        match &self.kind {
            CursorKind::Numeric => match coerce_i64(value) {
                Some(n) => Some(Filter::Cmp {
                    field: self.field.to_string(),
                    op: CmpOp::Gt,
                    value: Value::from(n),
                }),
                None => {
                    warn!(field = self.field, ?value, "unusable numeric cursor, full resync");
                    None
                }
            },
            CursorKind::Opaque => {
                let raw = value
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string());
                Some(Filter::Cmp {
                    field: self.field.to_string(),
                    op: CmpOp::Gt,
                    value: Value::from(raw),
                })
            }
            CursorKind::Timestamp { formats, op } => {
                let Some(raw) = value.as_str() else {
                    warn!(field = self.field, ?value, "cursor is not a timestamp string, full resync");
                    return None;
                };
                match parse_with_formats(raw, formats) {
                    Some(cutoff) => Some(Filter::CmpTime {
                        field: self.field.to_string(),
                        op: *op,
                        cutoff,
                        formats: formats.iter().map(|f| f.to_string()).collect(),
                    }),
                    None => {
                        warn!(field = self.field, raw, "unparseable timestamp cursor, full resync");
                        None
                    }
                }
            }
        }
    }

    fn rank(&self, value: &Value) -> Option<CursorRank> {
        match &self.kind {
            CursorKind::Numeric => coerce_f64(value).map(CursorRank::Num),
            CursorKind::Timestamp { formats, .. } => value
                .as_str()
                .and_then(|raw| parse_with_formats(raw, formats))
                .map(CursorRank::Time),
            CursorKind::Opaque => value.as_str().map(|raw| CursorRank::Text(raw.to_string())),
        }
    }

    /// Largest usable cursor value in `rows`, plus the count of rows whose
    /// value this cursor could not interpret.
    pub fn max_value(&self, rows: &[Row]) -> (Option<Value>, usize) {
        let bare = bare_field(self.field);
        let mut best: Option<(CursorRank, Value)> = None;
        let mut unranked = 0usize;
        for row in rows {
            let Some(value) = row.get(bare) else { continue };
            if value.is_null() {
                continue;
            }
            match self.rank(value) {
                Some(rank) => {
                    let better = match &best {
                        None => true,
                        Some((current, _)) => rank_gt(&rank, current),
                    };
                    if better {
                        best = Some((rank, value.clone()));
                    }
                }
                None => unranked += 1,
            }
        }
        (best.map(|(_, value)| value), unranked)
    }

    /// Next state after loading `rows`. The prior cursor participates in the
    /// max so the state never moves backwards, and the raw upstream value is
    /// stored untouched.
    pub fn advance(&self, state: &JobState, rows: &[Row], limit: Option<i64>) -> JobState {
        let (batch_best, unranked) = self.max_value(rows);
        if unranked > 0 {
            warn!(
                field = self.field,
                count = unranked,
                "rows with unusable cursor values ignored for advancement"
            );
        }
        let prior = state.cursor(self.field);
        let cursor = match (prior, batch_best) {
            (Some(p), Some(b)) => {
                let keep_prior = match (self.rank(p), self.rank(&b)) {
                    (Some(pr), Some(br)) => !rank_gt(&br, &pr),
                    _ => false,
                };
                if keep_prior {
                    p.clone()
                } else {
                    b
                }
            }
            (Some(p), None) => p.clone(),
            (None, Some(b)) => b,
            (None, None) => Value::Null,
        };
        JobState::advanced(self.field, cursor, limit, state.counter() + 1)
    }
}

/// One site's slice of a batch. Members keep their source order; the
/// watermark is the group's own cursor max, logged for traceability.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordGroup {
    pub key: GroupKey,
    pub members: Vec<Row>,
    pub watermark: Option<Value>,
}

/// Partitions a batch by site key. Rows without a usable result value are
/// dropped first, rows without a key are skipped with a warning, and groups
/// come back in key order.
pub fn group_records(
    rows: &[Row],
    group_field: &str,
    value_field: &str,
    cursor: Option<&CursorSpec>,
) -> Vec<RecordGroup> {
    let key_field = bare_field(group_field);
    let value_key = bare_field(value_field);

    let mut keyed: Vec<(GroupKey, Row)> = Vec::new();
    let mut no_value = 0usize;
    let mut no_key = 0usize;
    for row in rows {
        let usable = row
            .get(value_key)
            .map(|v| !is_missing_value(v))
            .unwrap_or(false);
        if !usable {
            no_value += 1;
            continue;
        }
        match row.get(key_field).and_then(GroupKey::from_value) {
            Some(key) => keyed.push((key, row.clone())),
            None => no_key += 1,
        }
    }
    if no_value > 0 {
        debug!(count = no_value, "rows without usable results dropped before grouping");
    }
    if no_key > 0 {
        warn!(count = no_key, field = key_field, "rows without a site key skipped");
    }

    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    let mut groups: Vec<RecordGroup> = Vec::new();
    for (key, row) in keyed {
        match groups.last_mut() {
            Some(group) if group.key == key => group.members.push(row),
            _ => groups.push(RecordGroup {
                key,
                members: vec![row],
                watermark: None,
            }),
        }
    }

    if let Some(cursor) = cursor {
        for group in &mut groups {
            let (max, _) = cursor.max_value(&group.members);
            group.watermark = max;
        }
    }
    groups
}

/// How a job reads its measurement timestamp column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampRule {
    EpochSeconds,
    EpochMillis,
    Formats(&'static [&'static str]),
}

impl TimestampRule {
    /// Observations hit the wire at whole-second precision; sub-second parts
    /// are truncated here so replay dedup lines up with store read-back.
    pub fn parse(&self, value: &Value) -> Option<NaiveDateTime> {
        let dt = match self {
            TimestampRule::EpochSeconds => {
                let secs = coerce_f64(value)? as i64;
                chrono::DateTime::from_timestamp(secs, 0).map(|dt| dt.naive_utc())?
            }
            TimestampRule::EpochMillis => {
                let millis = coerce_f64(value)?;
                let secs = (millis / 1000.0) as i64;
                chrono::DateTime::from_timestamp(secs, 0).map(|dt| dt.naive_utc())?
            }
            TimestampRule::Formats(formats) => {
                value.as_str().and_then(|raw| parse_with_formats(raw, formats))?
            }
        };
        dt.with_nanosecond(0)
    }
}

/// Per-agency unit and datum corrections, applied after numeric coercion and
/// before dedup so the comparison sees exactly what would be written.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueTransform {
    Identity,
    Scale(f64),
    /// Scales only rows whose unit column matches; everything else passes
    /// through unchanged.
    ScaleWhen {
        field: &'static str,
        equals: i64,
        factor: f64,
    },
    Negate,
    /// Subtracts a correction carried on the resolved Thing, zero when the
    /// property is absent.
    OffsetByThingProperty { property: &'static str },
}

impl ValueTransform {
    pub fn apply(&self, value: f64, row: &Row, thing: &Entity) -> f64 {
        match self {
            ValueTransform::Identity => value,
            ValueTransform::Scale(factor) => value * factor,
            ValueTransform::ScaleWhen { field, equals, factor } => {
                let unit = row.get(bare_field(field)).and_then(coerce_i64);
                if unit == Some(*equals) {
                    value * factor
                } else {
                    value
                }
            }
            ValueTransform::Negate => -value,
            ValueTransform::OffsetByThingProperty { property } => {
                let offset = thing
                    .properties
                    .get(*property)
                    .and_then(coerce_f64)
                    .unwrap_or(0.0);
                value - offset
            }
        }
    }
}

/// How a job maps a site key from its rows onto a Location in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationStrategy {
    /// `properties/source_id` plus agency.
    SourceId { field: &'static str },
    /// A different property key carries the upstream id.
    Property {
        property: &'static str,
        field: &'static str,
    },
    /// The location name is the row value itself.
    Name {
        field: &'static str,
        with_agency: bool,
    },
    /// Name built from a fixed prefix and the row value.
    PrefixedName {
        prefix: &'static str,
        field: &'static str,
    },
    /// Row value with literal replacements applied in order. Replacements do
    /// not trim, so a stripped suffix can leave trailing whitespace in the
    /// stored name.
    CleanedName {
        field: &'static str,
        replace: &'static [(&'static str, &'static str)],
        with_agency: bool,
    },
    /// Uppercased row value as the name.
    UppercasedName {
        field: &'static str,
        with_agency: bool,
    },
    /// Zero-padded numeric station id as the name.
    PaddedName {
        field: &'static str,
        width: usize,
    },
    /// Static upstream-id to location-name table for feeds that never carry
    /// the site name.
    MappedName {
        field: &'static str,
        names: &'static [(&'static str, &'static str)],
        with_agency: bool,
    },
}

impl LocationStrategy {
    pub fn field(&self) -> &'static str {
        match self {
            LocationStrategy::SourceId { field }
            | LocationStrategy::Property { field, .. }
            | LocationStrategy::Name { field, .. }
            | LocationStrategy::PrefixedName { field, .. }
            | LocationStrategy::CleanedName { field, .. }
            | LocationStrategy::UppercasedName { field, .. }
            | LocationStrategy::PaddedName { field, .. }
            | LocationStrategy::MappedName { field, .. } => field,
        }
    }

    pub fn query_for_key(&self, key: &GroupKey, agency: &str) -> Option<LocationQuery> {
        let id = key.to_string();
        match self {
            LocationStrategy::SourceId { .. } => Some(LocationQuery::SourceId {
                source_id: id,
                agency: agency.to_string(),
            }),
            LocationStrategy::Property { property, .. } => Some(LocationQuery::Property {
                key: property.to_string(),
                value: id,
                agency: agency.to_string(),
            }),
            LocationStrategy::Name { with_agency, .. } => Some(LocationQuery::Name {
                name: id,
                agency: with_agency.then(|| agency.to_string()),
            }),
            LocationStrategy::PrefixedName { prefix, .. } => Some(LocationQuery::Name {
                name: format!("{prefix}{id}"),
                agency: None,
            }),
            LocationStrategy::CleanedName {
                replace,
                with_agency,
                ..
            } => {
                let mut name = id;
                for (from, to) in *replace {
                    name = name.replace(from, to);
                }
                Some(LocationQuery::Name {
                    name,
                    agency: with_agency.then(|| agency.to_string()),
                })
            }
            LocationStrategy::UppercasedName { with_agency, .. } => Some(LocationQuery::Name {
                name: id.to_uppercase(),
                agency: with_agency.then(|| agency.to_string()),
            }),
            LocationStrategy::PaddedName { width, .. } => match key {
                GroupKey::Int(n) => Some(LocationQuery::Name {
                    name: format!("{n:0width$}", width = *width),
                    agency: None,
                }),
                GroupKey::Text(_) => {
                    warn!(station = %id, "station id is not numeric, nothing to pad");
                    None
                }
            },
            LocationStrategy::MappedName {
                names, with_agency, ..
            } => match names.iter().find(|(k, _)| *k == id.as_str()) {
                Some((_, name)) => Some(LocationQuery::Name {
                    name: name.to_string(),
                    agency: with_agency.then(|| agency.to_string()),
                }),
                None => {
                    warn!(source_id = %id, "no location name mapped for site");
                    None
                }
            },
        }
    }

    pub fn query_for_row(&self, row: &Row, agency: &str) -> Option<LocationQuery> {
        let key = row
            .get(bare_field(self.field()))
            .and_then(GroupKey::from_value)?;
        self.query_for_key(&key, agency)
    }
}

/// Which entity collection a job maintains. Observation jobs also resolve
/// the upstream chain Location -> Thing -> Datastream on every group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    Locations,
    Things,
    Datastreams,
    Observations,
}

/// Shared entities a job guarantees exist before its own upserts run.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionPayload {
    Sensor(SensorPayload),
    ObservedProperty(ObservedPropertyPayload),
}

pub type LocationBuilder = fn(&Row) -> Option<LocationPayload>;
pub type ThingBuilder = fn(&Row, IotId) -> Option<ThingPayload>;
pub type DatastreamBuilder = fn(&Row, DatastreamRefs) -> Option<DatastreamPayload>;

/// Resolved relations handed to a datastream builder.
#[derive(Debug, Clone, Copy)]
pub struct DatastreamRefs {
    pub thing: IotId,
    pub sensor: IotId,
    pub observed_property: IotId,
}

/// Names a datastream job resolves its relations by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatastreamPlan {
    pub thing_name: &'static str,
    pub sensor_name: &'static str,
    pub observed_property_name: &'static str,
}

/// Column mapping and normalization for an observation job.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationSpec {
    pub group_field: &'static str,
    pub timestamp_field: &'static str,
    pub value_field: &'static str,
    pub timestamp_rule: TimestampRule,
    pub transform: ValueTransform,
    pub thing_name: &'static str,
    pub datastream_name: &'static str,
    /// Extra columns carried verbatim into each observation's `parameters`.
    pub parameter_fields: &'static [&'static str],
}

/// One registered sync job: where records come from, how they are cut into
/// entities, and how the run's position is tracked.
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub name: &'static str,
    pub agency: &'static str,
    pub kind: JobKind,
    pub source: SourceSpec,
    pub query: TableQuery,
    pub cursor: Option<CursorSpec>,
    /// Collapse repeated site rows to the first occurrence before mapping.
    pub distinct_on: Option<&'static str>,
    pub location_strategy: LocationStrategy,
    /// Mint and attach a landing-page URI on location create.
    pub geoconnex: bool,
    pub provision: Vec<ProvisionPayload>,
    pub location_builder: Option<LocationBuilder>,
    pub thing_builder: Option<ThingBuilder>,
    pub datastream_builder: Option<DatastreamBuilder>,
    pub datastream_plan: Option<DatastreamPlan>,
    pub observations: Option<ObservationSpec>,
}

impl SyncJob {
    pub fn new(
        name: &'static str,
        agency: &'static str,
        kind: JobKind,
        source: SourceSpec,
        query: TableQuery,
        location_strategy: LocationStrategy,
    ) -> Self {
        Self {
            name,
            agency,
            kind,
            source,
            query,
            cursor: None,
            distinct_on: None,
            location_strategy,
            geoconnex: false,
            provision: Vec::new(),
            location_builder: None,
            thing_builder: None,
            datastream_builder: None,
            datastream_plan: None,
            observations: None,
        }
    }
}

/// Rejects jobs whose pieces cannot work together before anything is
/// fetched: kind-specific config present, and cursor/mapping columns
/// actually extracted when the query names its columns.
pub fn validate_job(job: &SyncJob) -> anyhow::Result<()> {
    match job.kind {
        JobKind::Locations => {
            if job.location_builder.is_none() {
                anyhow::bail!("job {} maps locations but has no location builder", job.name);
            }
        }
        JobKind::Things => {
            if job.thing_builder.is_none() {
                anyhow::bail!("job {} maps things but has no thing builder", job.name);
            }
        }
        JobKind::Datastreams => {
            if job.datastream_builder.is_none() {
                anyhow::bail!("job {} maps datastreams but has no datastream builder", job.name);
            }
            if job.datastream_plan.is_none() {
                anyhow::bail!("job {} maps datastreams but has no relation plan", job.name);
            }
        }
        JobKind::Observations => {
            if job.observations.is_none() {
                anyhow::bail!("job {} loads observations but has no observation mapping", job.name);
            }
        }
    }

    // Flat-file jobs leave fields empty and take whatever the file has.
    if job.query.fields.is_empty() {
        return Ok(());
    }
    let extracted =
        |field: &str| job.query.fields.iter().any(|f| bare_field(f) == bare_field(field));
    if let Some(cursor) = &job.cursor {
        if !extracted(cursor.field) {
            anyhow::bail!("job {} cursor column {} is not extracted", job.name, cursor.field);
        }
    }
    if let Some(spec) = &job.observations {
        for field in [spec.group_field, spec.timestamp_field, spec.value_field] {
            if !extracted(field) {
                anyhow::bail!("job {} observation column {field} is not extracted", job.name);
            }
        }
    }
    Ok(())
}

/// Time/value pairs already present in a datastream. Equality is exact: the
/// insert path writes the same f64 it checked, so replays compare the same
/// bits back.
#[derive(Debug, Default)]
pub struct DedupIndex {
    seen: Vec<(NaiveDateTime, f64)>,
}

impl DedupIndex {
    /// Builds the index from store read-back, counting entries that could
    /// not be interpreted (those cannot participate in dedup).
    pub fn from_store(existing: &[ObservationRecord]) -> (Self, usize) {
        let mut seen = Vec::with_capacity(existing.len());
        let mut unparsed = 0usize;
        for record in existing {
            match (
                parse_store_time(&record.phenomenon_time),
                coerce_f64(&record.result),
            ) {
                (Some(t), Some(v)) => seen.push((t, v)),
                _ => unparsed += 1,
            }
        }
        (Self { seen }, unparsed)
    }

    pub fn contains(&self, t: NaiveDateTime, v: f64) -> bool {
        self.seen.iter().any(|(et, ev)| *et == t && *ev == v)
    }

    /// Staged tuples join the index too, so repeats inside one batch
    /// collapse the same way store duplicates do.
    pub fn insert(&mut self, t: NaiveDateTime, v: f64) {
        self.seen.push((t, v));
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GroupCounts {
    pub staged: usize,
    pub duplicates: usize,
    pub skipped: usize,
}

/// Reconciles one site group: resolves its Location -> Thing -> Datastream
/// chain, rebuilds the dedup index from the store, and stages only tuples
/// the store does not already hold. A missing entity skips the whole group;
/// a bad row skips only that row.
pub async fn reconcile_group(
    sink: &dyn StaSink,
    agency: &str,
    strategy: &LocationStrategy,
    spec: &ObservationSpec,
    group: &RecordGroup,
    counts: &mut GroupCounts,
) -> Result<Option<ObservationsPayload>, StaError> {
    let Some(query) = strategy.query_for_key(&group.key, agency) else {
        counts.skipped += group.members.len();
        return Ok(None);
    };
    let Some(location) = sink.get_location(&query).await? else {
        warn!(site = %group.key, filter = %query.to_odata(), "location not found, group skipped");
        counts.skipped += group.members.len();
        return Ok(None);
    };
    let Some(thing) = sink.get_thing(spec.thing_name, location.iot_id()).await? else {
        warn!(site = %group.key, thing = spec.thing_name, "thing not found, group skipped");
        counts.skipped += group.members.len();
        return Ok(None);
    };
    let Some(datastream) = sink
        .get_datastream(spec.datastream_name, thing.iot_id())
        .await?
    else {
        warn!(site = %group.key, datastream = spec.datastream_name, "datastream not found, group skipped");
        counts.skipped += group.members.len();
        return Ok(None);
    };

    let existing = sink.get_observations(datastream.iot_id()).await?;
    let (mut index, unparsed) = DedupIndex::from_store(&existing);
    if unparsed > 0 {
        warn!(
            datastream = %datastream.iot_id(),
            count = unparsed,
            "stored observations with unusable time or result left out of dedup"
        );
    }

    let ts_field = bare_field(spec.timestamp_field);
    let value_field = bare_field(spec.value_field);
    let mut data_array: Vec<Vec<Value>> = Vec::new();
    for row in &group.members {
        let Some(t) = row.get(ts_field).and_then(|raw| spec.timestamp_rule.parse(raw)) else {
            warn!(site = %group.key, field = ts_field, "unparseable timestamp, row skipped");
            counts.skipped += 1;
            continue;
        };
        let Some(raw_value) = row.get(value_field).and_then(coerce_f64) else {
            warn!(site = %group.key, field = value_field, "non-numeric result, row skipped");
            counts.skipped += 1;
            continue;
        };
        let value = spec.transform.apply(raw_value, row, &thing);
        let Some(number) = serde_json::Number::from_f64(value) else {
            warn!(site = %group.key, value, "non-finite result after transform, row skipped");
            counts.skipped += 1;
            continue;
        };
        if index.contains(t, value) {
            counts.duplicates += 1;
            continue;
        }
        index.insert(t, value);

        let wire = format_wire_time(t);
        let mut tuple = vec![
            Value::from(wire.clone()),
            Value::from(wire),
            Value::Number(number),
        ];
        if !spec.parameter_fields.is_empty() {
            let mut parameters = Map::new();
            for field in spec.parameter_fields {
                if let Some(v) = row.get(bare_field(field)) {
                    parameters.insert(bare_field(field).to_string(), v.clone());
                }
            }
            tuple.push(Value::Object(parameters));
        }
        data_array.push(tuple);
    }

    counts.staged += data_array.len();
    if data_array.is_empty() {
        debug!(site = %group.key, "nothing new for site");
        return Ok(None);
    }

    let mut components = vec![
        "phenomenonTime".to_string(),
        "resultTime".to_string(),
        "result".to_string(),
    ];
    if !spec.parameter_fields.is_empty() {
        components.push("parameters".to_string());
    }
    Ok(Some(ObservationsPayload {
        datastream: datastream.iot_id().into(),
        components,
        data_array,
    }))
}

/// Lookup-before-create for a Location. New locations optionally get their
/// landing-page URI patched into properties; existing ones are left alone.
pub async fn ensure_location(
    sink: &dyn StaSink,
    query: &LocationQuery,
    payload: &Value,
    geoconnex: bool,
    dry: bool,
) -> Result<(IotId, bool), StaError> {
    if let Some(existing) = sink.get_location(query).await? {
        return Ok((existing.iot_id(), false));
    }
    let id = sink.create(EntityKind::Location, payload, dry).await?;
    if geoconnex {
        let mut properties = payload
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        properties.insert(
            "geoconnex".to_string(),
            Value::from(gwsync_core::vocab::geoconnex_uri(id)),
        );
        // The store replaces the whole properties object on patch, so the
        // original properties ride along with the new key.
        sink.patch_location(id, &serde_json::json!({ "properties": properties }), dry)
            .await?;
    }
    Ok((id, true))
}

pub async fn ensure_thing(
    sink: &dyn StaSink,
    location: IotId,
    payload: &Value,
    dry: bool,
) -> Result<(IotId, bool), StaError> {
    let name = payload.get("name").and_then(Value::as_str).unwrap_or_default();
    if let Some(existing) = sink.get_thing(name, location).await? {
        return Ok((existing.iot_id(), false));
    }
    let id = sink.create(EntityKind::Thing, payload, dry).await?;
    Ok((id, true))
}

pub async fn ensure_datastream(
    sink: &dyn StaSink,
    thing: IotId,
    payload: &Value,
    dry: bool,
) -> Result<(IotId, bool), StaError> {
    let name = payload.get("name").and_then(Value::as_str).unwrap_or_default();
    if let Some(existing) = sink.get_datastream(name, thing).await? {
        return Ok((existing.iot_id(), false));
    }
    let id = sink.create(EntityKind::Datastream, payload, dry).await?;
    Ok((id, true))
}

/// Creates a job's shared Sensors and ObservedProperties when absent.
/// Always safe to rerun.
pub async fn provision_shared(
    sink: &dyn StaSink,
    payloads: &[ProvisionPayload],
    dry: bool,
) -> anyhow::Result<usize> {
    let mut created = 0usize;
    for payload in payloads {
        match payload {
            ProvisionPayload::Sensor(sensor) => {
                if sink.get_sensor(&sensor.name).await?.is_none() {
                    let value =
                        serde_json::to_value(sensor).context("serializing sensor payload")?;
                    sink.create(EntityKind::Sensor, &value, dry).await?;
                    info!(name = %sensor.name, "provisioned sensor");
                    created += 1;
                }
            }
            ProvisionPayload::ObservedProperty(prop) => {
                if sink.get_observed_property(&prop.name).await?.is_none() {
                    let value = serde_json::to_value(prop)
                        .context("serializing observed property payload")?;
                    sink.create(EntityKind::ObservedProperty, &value, dry).await?;
                    info!(name = %prop.name, "provisioned observed property");
                    created += 1;
                }
            }
        }
    }
    Ok(created)
}

/// What one job invocation did, plus the state to hand to the next one.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub job: String,
    pub kind: JobKind,
    pub dry: bool,
    pub extracted: usize,
    pub groups: usize,
    pub staged: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub created: usize,
    pub state: JobState,
}

fn distinct_rows(rows: Vec<Row>, field: &str) -> Vec<Row> {
    let bare = bare_field(field);
    let mut seen: HashSet<GroupKey> = HashSet::new();
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        match row.get(bare).and_then(GroupKey::from_value) {
            Some(key) => {
                if seen.insert(key) {
                    out.push(row);
                }
            }
            None => out.push(row),
        }
    }
    out
}

/// Drives one job against a source and a sink. Holds no state of its own;
/// everything positional lives in the caller's `JobState`.
pub struct JobRunner<'a> {
    source: &'a dyn RecordSource,
    sink: &'a dyn StaSink,
}

impl<'a> JobRunner<'a> {
    pub fn new(source: &'a dyn RecordSource, sink: &'a dyn StaSink) -> Self {
        Self { source, sink }
    }

    /// One invocation: provision, extract past the cursor, map, upsert,
    /// advance. An empty extraction returns the input state untouched so
    /// schedulers can tell "caught up" from "moved".
    pub async fn render(
        &self,
        job: &SyncJob,
        state: &JobState,
        dry: bool,
    ) -> anyhow::Result<SyncRunSummary> {
        validate_job(job)?;
        let run_id = Uuid::new_v4();
        let span = info_span!("job_render", job = job.name, run = %run_id, dry);
        let _guard = span.enter();

        let mut summary = SyncRunSummary {
            run_id,
            job: job.name.to_string(),
            kind: job.kind,
            dry,
            extracted: 0,
            groups: 0,
            staged: 0,
            inserted: 0,
            duplicates: 0,
            skipped: 0,
            created: 0,
            state: state.clone(),
        };

        summary.created += provision_shared(self.sink, &job.provision, dry).await?;

        let effective_limit = state.limit().or(job.query.limit);
        let mut query = job.query.clone();
        query.limit = effective_limit;
        if let Some(cursor) = &job.cursor {
            // Cursor clause first, the job's static predicate appended.
            query.filter = match (cursor.compute_filter(state), job.query.filter.clone()) {
                (Some(c), Some(s)) => Some(c.and(s)),
                (Some(c), None) => Some(c),
                (None, s) => s,
            };
        }

        let mut rows = self
            .source
            .fetch(&query)
            .await
            .with_context(|| format!("extracting records for job {}", job.name))?;
        // Flat-file and catalog sources hand back everything they have; the
        // extraction cap still applies.
        if let Some(cap) = effective_limit.and_then(|n| usize::try_from(n).ok()) {
            if rows.len() > cap {
                debug!(job = job.name, cap, dropped = rows.len() - cap, "batch truncated to limit");
                rows.truncate(cap);
            }
        }
        summary.extracted = rows.len();
        if rows.is_empty() {
            info!(job = job.name, "no records extracted, state unchanged");
            return Ok(summary);
        }

        let rows = match job.distinct_on {
            Some(field) => distinct_rows(rows, field),
            None => rows,
        };

        match job.kind {
            JobKind::Observations => {
                self.render_observations(job, &rows, dry, &mut summary).await?
            }
            _ => self.render_entities(job, &rows, dry, &mut summary).await?,
        }

        summary.state = match &job.cursor {
            Some(cursor) => cursor.advance(state, &rows, effective_limit),
            None => state.clone(),
        };

        info!(
            job = job.name,
            extracted = summary.extracted,
            groups = summary.groups,
            staged = summary.staged,
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            skipped = summary.skipped,
            created = summary.created,
            "job render complete"
        );
        Ok(summary)
    }

    async fn render_observations(
        &self,
        job: &SyncJob,
        rows: &[Row],
        dry: bool,
        summary: &mut SyncRunSummary,
    ) -> anyhow::Result<()> {
        let Some(spec) = job.observations.as_ref() else {
            anyhow::bail!("job {} has no observation mapping", job.name);
        };
        let groups = group_records(rows, spec.group_field, spec.value_field, job.cursor.as_ref());
        summary.groups = groups.len();

        for group in &groups {
            let mut counts = GroupCounts::default();
            let payload = reconcile_group(
                self.sink,
                job.agency,
                &job.location_strategy,
                spec,
                group,
                &mut counts,
            )
            .await
            .with_context(|| format!("reconciling site {} for job {}", group.key, job.name))?;
            summary.staged += counts.staged;
            summary.duplicates += counts.duplicates;
            summary.skipped += counts.skipped;

            if let Some(payload) = payload {
                let inserted = self
                    .sink
                    .add_observations(&payload, dry)
                    .await
                    .with_context(|| {
                        format!("inserting observations for site {} in job {}", group.key, job.name)
                    })?;
                summary.inserted += inserted;
                info!(site = %group.key, inserted, watermark = ?group.watermark, "site group loaded");
            }
        }
        Ok(())
    }

    async fn render_entities(
        &self,
        job: &SyncJob,
        rows: &[Row],
        dry: bool,
        summary: &mut SyncRunSummary,
    ) -> anyhow::Result<()> {
        match job.kind {
            JobKind::Locations => {
                let Some(build) = job.location_builder else {
                    anyhow::bail!("job {} has no location builder", job.name);
                };
                for row in rows {
                    let Some(payload) = build(row) else {
                        summary.skipped += 1;
                        continue;
                    };
                    let Some(query) = job.location_strategy.query_for_row(row, job.agency) else {
                        summary.skipped += 1;
                        continue;
                    };
                    let value =
                        serde_json::to_value(&payload).context("serializing location payload")?;
                    let (_, created) =
                        ensure_location(self.sink, &query, &value, job.geoconnex, dry)
                            .await
                            .with_context(|| format!("upserting location {}", payload.name))?;
                    if created {
                        summary.created += 1;
                    }
                }
            }
            JobKind::Things => {
                let Some(build) = job.thing_builder else {
                    anyhow::bail!("job {} has no thing builder", job.name);
                };
                for row in rows {
                    let Some(query) = job.location_strategy.query_for_row(row, job.agency) else {
                        summary.skipped += 1;
                        continue;
                    };
                    let Some(location) = self.sink.get_location(&query).await? else {
                        warn!(filter = %query.to_odata(), "location not found, row skipped");
                        summary.skipped += 1;
                        continue;
                    };
                    let Some(payload) = build(row, location.iot_id()) else {
                        summary.skipped += 1;
                        continue;
                    };
                    let value =
                        serde_json::to_value(&payload).context("serializing thing payload")?;
                    let (_, created) = ensure_thing(self.sink, location.iot_id(), &value, dry)
                        .await
                        .with_context(|| format!("upserting thing {}", payload.name))?;
                    if created {
                        summary.created += 1;
                    }
                }
            }
            JobKind::Datastreams => {
                let Some(build) = job.datastream_builder else {
                    anyhow::bail!("job {} has no datastream builder", job.name);
                };
                let Some(plan) = &job.datastream_plan else {
                    anyhow::bail!("job {} has no relation plan", job.name);
                };
                for row in rows {
                    let Some(query) = job.location_strategy.query_for_row(row, job.agency) else {
                        summary.skipped += 1;
                        continue;
                    };
                    let Some(location) = self.sink.get_location(&query).await? else {
                        warn!(filter = %query.to_odata(), "location not found, row skipped");
                        summary.skipped += 1;
                        continue;
                    };
                    let Some(thing) = self.sink.get_thing(plan.thing_name, location.iot_id()).await?
                    else {
                        warn!(thing = plan.thing_name, "thing not found, row skipped");
                        summary.skipped += 1;
                        continue;
                    };
                    let Some(sensor) = self.sink.get_sensor(plan.sensor_name).await? else {
                        warn!(sensor = plan.sensor_name, "sensor not found, row skipped");
                        summary.skipped += 1;
                        continue;
                    };
                    let Some(observed_property) = self
                        .sink
                        .get_observed_property(plan.observed_property_name)
                        .await?
                    else {
                        warn!(
                            observed_property = plan.observed_property_name,
                            "observed property not found, row skipped"
                        );
                        summary.skipped += 1;
                        continue;
                    };
                    let refs = DatastreamRefs {
                        thing: thing.iot_id(),
                        sensor: sensor.iot_id(),
                        observed_property: observed_property.iot_id(),
                    };
                    let Some(payload) = build(row, refs) else {
                        summary.skipped += 1;
                        continue;
                    };
                    let value =
                        serde_json::to_value(&payload).context("serializing datastream payload")?;
                    let (_, created) = ensure_datastream(self.sink, refs.thing, &value, dry)
                        .await
                        .with_context(|| format!("upserting datastream {}", payload.name))?;
                    if created {
                        summary.created += 1;
                    }
                }
            }
            JobKind::Observations => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwsync_core::vocab;

    fn row(pairs: &[(&str, Value)]) -> Row {
        let mut r = Row::new();
        for (k, v) in pairs {
            r.insert(k.to_string(), v.clone());
        }
        r
    }

    fn state_json(text: &str) -> JobState {
        serde_json::from_str(text).unwrap()
    }

    fn objectid_cursor() -> CursorSpec {
        CursorSpec {
            field: "OBJECTID",
            kind: CursorKind::Numeric,
        }
    }

    #[test]
    fn numeric_cursor_renders_strict_greater_filter() {
        let cursor = objectid_cursor();
        let state = state_json(r#"{"OBJECTID": 100, "limit": null, "counter": 1}"#);
        let filter = cursor.compute_filter(&state).unwrap();
        assert_eq!(filter.to_sql(), "OBJECTID > 100");
        assert!(filter.matches(&row(&[("OBJECTID", Value::from(101))])));
        assert!(!filter.matches(&row(&[("OBJECTID", Value::from(100))])));
    }

    #[test]
    fn missing_or_null_cursor_means_full_extraction() {
        let cursor = objectid_cursor();
        assert!(cursor.compute_filter(&JobState::empty()).is_none());
        let state = state_json(r#"{"OBJECTID": null}"#);
        assert!(cursor.compute_filter(&state).is_none());
    }

    #[test]
    fn malformed_cursor_degrades_to_full_resync() {
        let cursor = objectid_cursor();
        let state = state_json(r#"{"OBJECTID": "garbage"}"#);
        assert!(cursor.compute_filter(&state).is_none());

        let cursor = CursorSpec {
            field: "data_time",
            kind: CursorKind::Timestamp {
                formats: WAREHOUSE_TIME_FORMATS,
                op: CmpOp::Gt,
            },
        };
        let state = state_json(r#"{"data_time": "not a time"}"#);
        assert!(cursor.compute_filter(&state).is_none());
        let state = state_json(r#"{"data_time": 12345}"#);
        assert!(cursor.compute_filter(&state).is_none());
    }

    #[test]
    fn opaque_cursor_compares_lexicographically() {
        let cursor = CursorSpec {
            field: "MP._airbyte_raw_id",
            kind: CursorKind::Opaque,
        };
        let state = state_json(r#"{"MP._airbyte_raw_id": "aaa"}"#);
        let filter = cursor.compute_filter(&state).unwrap();
        assert_eq!(filter.to_sql(), "MP._airbyte_raw_id > 'aaa'");
        assert!(filter.matches(&row(&[("_airbyte_raw_id", Value::from("abc"))])));
        assert!(!filter.matches(&row(&[("_airbyte_raw_id", Value::from("a"))])));
    }

    #[test]
    fn timestamp_cursor_honors_configured_operator() {
        let strict = CursorSpec {
            field: "data_time",
            kind: CursorKind::Timestamp {
                formats: WAREHOUSE_TIME_FORMATS,
                op: CmpOp::Gt,
            },
        };
        let state = state_json(r#"{"data_time": "2024-03-01 00:00:00"}"#);
        let filter = strict.compute_filter(&state).unwrap();
        assert!(!filter.matches(&row(&[("data_time", Value::from("2024-03-01 00:00:00"))])));
        assert!(filter.matches(&row(&[("data_time", Value::from("2024-03-01 00:00:01"))])));

        let inclusive = CursorSpec {
            field: "_airbyte_extracted_at",
            kind: CursorKind::Timestamp {
                formats: ISO_TIME_FORMATS,
                op: CmpOp::Ge,
            },
        };
        let state = state_json(r#"{"_airbyte_extracted_at": "2024-03-01T00:00:00.000000+00:00"}"#);
        let filter = inclusive.compute_filter(&state).unwrap();
        assert!(filter.matches(&row(&[(
            "_airbyte_extracted_at",
            Value::from("2024-03-01T00:00:00.000000+00:00")
        )])));
    }

    #[test]
    fn advance_picks_batch_max_and_bumps_counter() {
        let cursor = objectid_cursor();
        let state = state_json(r#"{"OBJECTID": 100, "limit": 500, "counter": 2}"#);
        let rows = vec![
            row(&[("OBJECTID", Value::from(101))]),
            row(&[("OBJECTID", Value::from(105))]),
            row(&[("OBJECTID", Value::from(103))]),
        ];
        let next = cursor.advance(&state, &rows, Some(500));
        assert_eq!(next.cursor("OBJECTID"), Some(&Value::from(105)));
        assert_eq!(next.limit(), Some(500));
        assert_eq!(next.counter(), 3);
    }

    #[test]
    fn advance_never_regresses_below_prior_cursor() {
        let cursor = objectid_cursor();
        let state = state_json(r#"{"OBJECTID": 200, "counter": 5}"#);
        let rows = vec![
            row(&[("OBJECTID", Value::from(101))]),
            row(&[("OBJECTID", Value::from(105))]),
        ];
        let next = cursor.advance(&state, &rows, None);
        assert_eq!(next.cursor("OBJECTID"), Some(&Value::from(200)));
        assert_eq!(next.counter(), 6);
    }

    #[test]
    fn advance_ignores_rows_without_usable_cursor_values() {
        let cursor = objectid_cursor();
        let rows = vec![
            row(&[("OBJECTID", Value::from(7))]),
            row(&[("OBJECTID", Value::Null)]),
            row(&[("OBJECTID", Value::from("junk"))]),
            row(&[("other", Value::from(99))]),
        ];
        let next = cursor.advance(&JobState::empty(), &rows, None);
        assert_eq!(next.cursor("OBJECTID"), Some(&Value::from(7)));
    }

    #[test]
    fn advance_keeps_the_raw_upstream_value() {
        let cursor = CursorSpec {
            field: "_airbyte_extracted_at",
            kind: CursorKind::Timestamp {
                formats: ISO_TIME_FORMATS,
                op: CmpOp::Ge,
            },
        };
        let rows = vec![
            row(&[("_airbyte_extracted_at", Value::from("2024-03-01T00:00:00.500000+00:00"))]),
            row(&[("_airbyte_extracted_at", Value::from("2024-03-02T12:30:00.000000+00:00"))]),
        ];
        let next = cursor.advance(&JobState::empty(), &rows, None);
        assert_eq!(
            next.cursor("_airbyte_extracted_at"),
            Some(&Value::from("2024-03-02T12:30:00.000000+00:00"))
        );
    }

    #[test]
    fn grouping_batches_by_site_and_drops_unusable_rows() {
        let rows = vec![
            row(&[("well_id", Value::from("1003")), ("value", Value::from("9.1"))]),
            row(&[("well_id", Value::from(1002)), ("value", Value::from("10.5"))]),
            row(&[("well_id", Value::from("1002")), ("value", Value::from("N/A"))]),
            row(&[("well_id", Value::Null), ("value", Value::from("3.3"))]),
            row(&[("well_id", Value::from("1002")), ("value", Value::from("11.0"))]),
        ];
        let groups = group_records(&rows, "well_id", "value", None);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].key, GroupKey::Int(1002));
        // Numeric and string forms of the same id share a group, in source order.
        let values: Vec<&str> = groups[0]
            .members
            .iter()
            .map(|r| r.get("value").and_then(Value::as_str).unwrap())
            .collect();
        assert_eq!(values, vec!["10.5", "11.0"]);
        assert_eq!(groups[1].key, GroupKey::Int(1003));
    }

    #[test]
    fn group_watermark_tracks_cursor_max() {
        let cursor = objectid_cursor();
        let rows = vec![
            row(&[
                ("well_id", Value::from(1)),
                ("value", Value::from(10.0)),
                ("OBJECTID", Value::from(4)),
            ]),
            row(&[
                ("well_id", Value::from(1)),
                ("value", Value::from(11.0)),
                ("OBJECTID", Value::from(9)),
            ]),
        ];
        let groups = group_records(&rows, "well_id", "value", Some(&cursor));
        assert_eq!(groups[0].watermark, Some(Value::from(9)));
    }

    #[test]
    fn epoch_millis_truncate_to_whole_seconds() {
        let rule = TimestampRule::EpochMillis;
        let t = rule.parse(&Value::from(1704448800123.0_f64)).unwrap();
        assert_eq!(format_wire_time(t), "2024-01-05T10:00:00.000Z");

        let rule = TimestampRule::EpochSeconds;
        let t = rule.parse(&Value::from(1704448800)).unwrap();
        assert_eq!(format_wire_time(t), "2024-01-05T10:00:00.000Z");
    }

    #[test]
    fn formatted_timestamps_drop_subsecond_parts() {
        let rule = TimestampRule::Formats(ISO_TIME_FORMATS);
        let t = rule
            .parse(&Value::from("2024-01-05T08:30:00.123456+00:00"))
            .unwrap();
        assert_eq!(format_wire_time(t), "2024-01-05T08:30:00.000Z");
        assert!(rule.parse(&Value::from("05/01/2024")).is_none());
    }

    #[test]
    fn value_transforms_cover_agency_conventions() {
        let thing = Entity {
            id: 1,
            name: "Water Well".to_string(),
            properties: Map::new(),
        };
        let meters_row = row(&[("unitId", Value::from(35))]);
        let feet_row = row(&[("unitId", Value::from(34))]);

        let scale_when = ValueTransform::ScaleWhen {
            field: "unitId",
            equals: 35,
            factor: METERS_TO_FEET,
        };
        assert_eq!(scale_when.apply(2.0, &meters_row, &thing), 2.0 * 3.28084);
        assert_eq!(scale_when.apply(2.0, &feet_row, &thing), 2.0);

        assert_eq!(ValueTransform::Negate.apply(-12.5, &feet_row, &thing), 12.5);
        assert_eq!(ValueTransform::Identity.apply(7.0, &feet_row, &thing), 7.0);
    }

    #[test]
    fn thing_property_offset_defaults_to_zero() {
        let transform = ValueTransform::OffsetByThingProperty {
            property: "casing_stickup",
        };
        let r = row(&[]);

        let mut props = Map::new();
        props.insert("casing_stickup".to_string(), Value::from(1.5));
        let with_stickup = Entity {
            id: 1,
            name: "Water Well".to_string(),
            properties: props,
        };
        assert_eq!(transform.apply(10.0, &r, &with_stickup), 8.5);

        let bare = Entity {
            id: 2,
            name: "Water Well".to_string(),
            properties: Map::new(),
        };
        assert_eq!(transform.apply(10.0, &r, &bare), 10.0);
    }

    #[test]
    fn dedup_index_is_exact_on_time_and_value() {
        let existing = vec![
            ObservationRecord {
                phenomenon_time: "2024-01-05T08:00:00.000Z".to_string(),
                result: Value::from(10.5),
            },
            ObservationRecord {
                phenomenon_time: "garbled".to_string(),
                result: Value::from(1.0),
            },
        ];
        let (mut index, unparsed) = DedupIndex::from_store(&existing);
        assert_eq!(unparsed, 1);
        assert_eq!(index.len(), 1);

        let t = parse_store_time("2024-01-05T08:00:00.000Z").unwrap();
        assert!(index.contains(t, 10.5));
        assert!(!index.contains(t, 10.500001));

        let t2 = parse_store_time("2024-01-05T09:00:00.000Z").unwrap();
        assert!(!index.contains(t2, 10.5));
        index.insert(t2, 10.5);
        assert!(index.contains(t2, 10.5));
    }

    #[test]
    fn location_strategies_build_store_queries() {
        let key = GroupKey::Int(1002);

        let q = LocationStrategy::SourceId { field: "well_id" }
            .query_for_key(&key, "EBID")
            .unwrap();
        assert_eq!(
            q.to_odata(),
            "properties/source_id eq '1002' and properties/agency eq 'EBID'"
        );

        let q = LocationStrategy::Property {
            property: "or_site_id",
            field: "or_site_id",
        }
        .query_for_key(&key, "EBID")
        .unwrap();
        assert_eq!(
            q.to_odata(),
            "properties/or_site_id eq '1002' and properties/agency eq 'EBID'"
        );

        let q = LocationStrategy::PrefixedName {
            prefix: "Site-",
            field: "site_no",
        }
        .query_for_key(&key, "X")
        .unwrap();
        assert_eq!(q.to_odata(), "name eq 'Site-1002'");

        const NAMES: &[(&str, &str)] = &[("1002", "Poe Corn Level")];
        let mapped = LocationStrategy::MappedName {
            field: "well_id",
            names: NAMES,
            with_agency: true,
        };
        let q = mapped.query_for_key(&key, "PVACD").unwrap();
        assert_eq!(
            q.to_odata(),
            "name eq 'Poe Corn Level' and properties/agency eq 'PVACD'"
        );
        assert!(mapped.query_for_key(&GroupKey::Int(9), "PVACD").is_none());
    }

    #[test]
    fn cleaned_name_applies_replacements_in_order_without_trimming() {
        const REPLACE: &[(&str, &str)] = &[("level", ""), ("Level", "")];
        let strategy = LocationStrategy::CleanedName {
            field: "name",
            replace: REPLACE,
            with_agency: false,
        };
        let q = strategy
            .query_for_key(&GroupKey::Text("Poe Corn Level".to_string()), "PVACD")
            .unwrap();
        assert_eq!(q.to_odata(), "name eq 'Poe Corn '");

        let q = strategy
            .query_for_key(&GroupKey::Text("Berrendo-Smith level".to_string()), "PVACD")
            .unwrap();
        assert_eq!(q.to_odata(), "name eq 'Berrendo-Smith '");

        let with_agency = LocationStrategy::CleanedName {
            field: "name",
            replace: REPLACE,
            with_agency: true,
        };
        let q = with_agency
            .query_for_key(&GroupKey::Text("Zumwalt level".to_string()), "PVACD")
            .unwrap();
        assert_eq!(
            q.to_odata(),
            "name eq 'Zumwalt ' and properties/agency eq 'PVACD'"
        );
    }

    #[test]
    fn uppercased_and_padded_name_strategies() {
        let upper = LocationStrategy::UppercasedName {
            field: "site_id",
            with_agency: false,
        };
        let q = upper
            .query_for_key(&GroupKey::Text("ls-28a".to_string()), "EBID")
            .unwrap();
        assert_eq!(q.to_odata(), "name eq 'LS-28A'");

        let padded = LocationStrategy::PaddedName {
            field: "Station_ID",
            width: 4,
        };
        let q = padded.query_for_key(&GroupKey::Int(23), "OSE").unwrap();
        assert_eq!(q.to_odata(), "name eq '0023'");
        let q = padded.query_for_key(&GroupKey::Int(12345), "OSE").unwrap();
        assert_eq!(q.to_odata(), "name eq '12345'");
        assert!(padded
            .query_for_key(&GroupKey::Text("flume".to_string()), "OSE")
            .is_none());

        // Station ids arrive as floats in the source export.
        let r = row(&[("Station_ID", Value::from(23.0))]);
        let q = padded.query_for_row(&r, "OSE").unwrap();
        assert_eq!(q.to_odata(), "name eq '0023'");
    }

    #[test]
    fn distinct_on_keeps_first_occurrence() {
        let rows = vec![
            row(&[("site_id", Value::from("A")), ("v", Value::from(1))]),
            row(&[("site_id", Value::from("B")), ("v", Value::from(2))]),
            row(&[("site_id", Value::from("A")), ("v", Value::from(3))]),
        ];
        let out = distinct_rows(rows, "site_id");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get("v"), Some(&Value::from(1)));
        assert_eq!(out[1].get("v"), Some(&Value::from(2)));
    }

    fn observation_job() -> SyncJob {
        let mut query = TableQuery::new(
            "levels",
            "readings",
            &["OBJECTID", "well_id", "timestamp", "value"],
        );
        query.order_by = Some("OBJECTID asc".to_string());
        query.limit = Some(500);
        let mut job = SyncJob::new(
            "test-observations",
            "TEST",
            JobKind::Observations,
            SourceSpec::Warehouse {
                dataset: "levels".to_string(),
                table: "readings".to_string(),
            },
            query,
            LocationStrategy::SourceId { field: "well_id" },
        );
        job.cursor = Some(objectid_cursor());
        job.observations = Some(ObservationSpec {
            group_field: "well_id",
            timestamp_field: "timestamp",
            value_field: "value",
            timestamp_rule: TimestampRule::Formats(WAREHOUSE_TIME_FORMATS),
            transform: ValueTransform::Identity,
            thing_name: vocab::WATER_WELL,
            datastream_name: vocab::GROUNDWATER_LEVELS,
            parameter_fields: &[],
        });
        job
    }

    #[test]
    fn validate_rejects_incoherent_jobs() {
        let good = observation_job();
        assert!(validate_job(&good).is_ok());

        let mut missing_mapping = good.clone();
        missing_mapping.observations = None;
        assert!(validate_job(&missing_mapping).is_err());

        let mut cursor_not_extracted = good.clone();
        cursor_not_extracted.cursor = Some(CursorSpec {
            field: "id",
            kind: CursorKind::Numeric,
        });
        assert!(validate_job(&cursor_not_extracted).is_err());

        let mut no_builder = good.clone();
        no_builder.kind = JobKind::Locations;
        assert!(validate_job(&no_builder).is_err());
    }

    #[test]
    fn validate_skips_column_checks_for_flat_sources() {
        let mut job = observation_job();
        job.query.fields.clear();
        job.cursor = Some(CursorSpec {
            field: "anything",
            kind: CursorKind::Numeric,
        });
        assert!(validate_job(&job).is_ok());
    }

    #[test]
    fn jobs_file_parses_toggles_and_defaults_to_enabled() {
        let text = "jobs:\n  - name: ebid-observations\n    enabled: false\n  - name: bernco-manual-observations\n    limit: 50\n";
        let file: JobsFile = serde_yaml::from_str(text).unwrap();
        assert!(!file.is_enabled("ebid-observations"));
        assert!(file.is_enabled("bernco-manual-observations"));
        assert!(file.is_enabled("never-mentioned"));
        assert_eq!(file.limit_override("bernco-manual-observations"), Some(50));
        assert_eq!(file.limit_override("ebid-observations"), None);
    }

    #[test]
    fn jobs_file_loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.yaml");
        std::fs::write(&path, "jobs:\n  - name: x\n    enabled: true\n").unwrap();
        let file = load_jobs_file(&path).unwrap();
        assert!(file.is_enabled("x"));
        assert!(load_jobs_file(dir.path().join("absent.yaml")).is_err());
    }

    #[test]
    fn settings_defaults_are_runnable_locally() {
        let settings = SyncSettings::default();
        assert!(settings.sta_base_url.ends_with("/v1.1"));
        let sources = settings.source_settings();
        assert_eq!(sources.fixture_root, PathBuf::from("fixtures"));
        let sta = settings.sta_client_config();
        assert_eq!(sta.timeout, Duration::from_secs(30));
    }
}
