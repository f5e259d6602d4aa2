//! Upstream source contracts and the record sources that feed sync jobs:
//! warehouse tables (fixture-resolved locally), bucket flat files, and CKAN
//! catalog resources.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use gwsync_core::{coerce_f64, parse_with_formats, Row};
use gwsync_sta::{classify_reqwest_error, classify_status, BackoffPolicy, RetryDisposition};

pub const CRATE_NAME: &str = "gwsync-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("source status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid source url {url}")]
    InvalidUrl { url: String },
    #[error("decoding {what} from {origin}: {detail}")]
    Decode {
        what: &'static str,
        origin: String,
        detail: String,
    },
    #[error("csv parse error in {origin}: {source}")]
    Csv {
        origin: String,
        #[source]
        source: csv::Error,
    },
    #[error("catalog gave no usable url for resource {resource}")]
    MissingResource { resource: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Gt,
    Ge,
}

impl CmpOp {
    fn as_sql(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }

    fn admits(&self, ordering: Ordering) -> bool {
        match self {
            CmpOp::Eq => ordering == Ordering::Equal,
            CmpOp::Gt => ordering == Ordering::Greater,
            CmpOp::Ge => ordering != Ordering::Less,
        }
    }
}

fn sql_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "''"))
}

/// Numbers compare numerically (numeric strings included), everything else
/// falls back to lexicographic string order.
fn cmp_values(left: &Value, right: &Value) -> Option<Ordering> {
    if let (Some(l), Some(r)) = (coerce_f64(left), coerce_f64(right)) {
        return l.partial_cmp(&r);
    }
    match (left.as_str(), right.as_str()) {
        (Some(l), Some(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

/// Extraction predicate. Structured variants evaluate locally so the fixture
/// source behaves like a warehouse; `Raw` is passed through to SQL-speaking
/// sources and treated as always-true everywhere else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Raw(String),
    Cmp {
        field: String,
        op: CmpOp,
        value: Value,
    },
    /// Timestamp comparison: row values are strings parsed through `formats`
    /// (ordered, first parse wins) and compared against `cutoff`.
    CmpTime {
        field: String,
        op: CmpOp,
        cutoff: NaiveDateTime,
        formats: Vec<String>,
    },
    And(Vec<Filter>),
}

impl Filter {
    pub fn and(self, other: Filter) -> Filter {
        match self {
            Filter::And(mut parts) => {
                parts.push(other);
                Filter::And(parts)
            }
            first => Filter::And(vec![first, other]),
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::Raw(_) => true,
            Filter::Cmp { field, op, value } => {
                let Some(cell) = row.get(gwsync_core::bare_field(field)) else {
                    return false;
                };
                match cmp_values(cell, value) {
                    Some(ordering) => op.admits(ordering),
                    None => false,
                }
            }
            Filter::CmpTime {
                field,
                op,
                cutoff,
                formats,
            } => {
                let Some(raw) = row
                    .get(gwsync_core::bare_field(field))
                    .and_then(Value::as_str)
                else {
                    return false;
                };
                let fmts: Vec<&str> = formats.iter().map(String::as_str).collect();
                match parse_with_formats(raw, &fmts) {
                    Some(dt) => op.admits(dt.cmp(cutoff)),
                    None => false,
                }
            }
            Filter::And(parts) => parts.iter().all(|p| p.matches(row)),
        }
    }

    pub fn to_sql(&self) -> String {
        match self {
            Filter::Raw(text) => text.clone(),
            Filter::Cmp { field, op, value } => {
                let rendered = match value {
                    Value::String(s) => sql_quote(s),
                    other => other.to_string(),
                };
                format!("{field} {} {rendered}", op.as_sql())
            }
            Filter::CmpTime {
                field, op, cutoff, ..
            } => format!(
                "{field} {} TIMESTAMP '{}'",
                op.as_sql(),
                cutoff.format("%Y-%m-%d %H:%M:%S")
            ),
            Filter::And(parts) => parts
                .iter()
                .map(Filter::to_sql)
                .collect::<Vec<_>>()
                .join(" and "),
        }
    }
}

/// What a job asks its source for. SQL-speaking sources render it with
/// `to_sql`; flat-file sources ignore the clauses they cannot honor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableQuery {
    pub fields: Vec<String>,
    pub dataset: String,
    pub table: String,
    pub alias: Option<String>,
    pub join: Option<String>,
    pub filter: Option<Filter>,
    pub order_by: Option<String>,
    pub limit: Option<i64>,
}

impl TableQuery {
    pub fn new(
        dataset: impl Into<String>,
        table: impl Into<String>,
        fields: &[&str],
    ) -> Self {
        TableQuery {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            dataset: dataset.into(),
            table: table.into(),
            alias: None,
            join: None,
            filter: None,
            order_by: None,
            limit: None,
        }
    }

    pub fn to_sql(&self) -> String {
        let fields = if self.fields.is_empty() {
            "*".to_string()
        } else {
            self.fields.join(", ")
        };
        let mut sql = format!("select {fields} from {}.{}", self.dataset, self.table);
        if let Some(alias) = &self.alias {
            sql.push_str(&format!(" as {alias}"));
        }
        if let Some(join) = &self.join {
            sql.push_str(&format!(" {join}"));
        }
        if let Some(filter) = &self.filter {
            sql.push_str(&format!(" where {}", filter.to_sql()));
        }
        if let Some(order_by) = &self.order_by {
            sql.push_str(&format!(" order by {order_by}"));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" limit {limit}"));
        }
        sql
    }
}

/// One upstream feed. Implementations return bare-keyed rows; what the engine
/// does with them is job configuration.
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn source_id(&self) -> &str;
    async fn fetch(&self, query: &TableQuery) -> Result<Vec<Row>, SourceError>;
}

/// In-memory rows with local evaluation of filter/order/limit. Backs tests
/// and local runs against warehouse table fixtures.
#[derive(Debug, Clone)]
pub struct MemoryTableSource {
    source_id: String,
    rows: Vec<Row>,
}

impl MemoryTableSource {
    pub fn new(source_id: impl Into<String>, rows: Vec<Row>) -> Self {
        Self {
            source_id: source_id.into(),
            rows,
        }
    }

    /// Loads a JSON array of objects, one file per warehouse table.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading table fixture {}", path.display()))?;
        let rows: Vec<Row> = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing table fixture {}", path.display()))?;
        Ok(Self::new(path.display().to_string(), rows))
    }
}

fn apply_order(rows: &mut [Row], order_by: &str) {
    let (field, descending) = match order_by.rsplit_once(' ') {
        Some((f, "desc")) => (f, true),
        Some((f, "asc")) => (f, false),
        _ => (order_by, false),
    };
    let field = gwsync_core::bare_field(field.trim());
    rows.sort_by(|a, b| {
        let ordering = match (a.get(field), b.get(field)) {
            (Some(l), Some(r)) => cmp_values(l, r).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };
        if descending {
            ordering.reverse()
        } else {
            ordering
        }
    });
}

#[async_trait]
impl RecordSource for MemoryTableSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self, query: &TableQuery) -> Result<Vec<Row>, SourceError> {
        let mut rows: Vec<Row> = match &query.filter {
            Some(filter) => self
                .rows
                .iter()
                .filter(|r| filter.matches(r))
                .cloned()
                .collect(),
            None => self.rows.clone(),
        };
        if let Some(order_by) = &query.order_by {
            apply_order(&mut rows, order_by);
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit.max(0) as usize);
        }
        Ok(rows)
    }
}

/// Raw bytes pulled from a source URL, content-hashed for traceability.
#[derive(Debug, Clone)]
pub struct FetchedBlob {
    pub url: String,
    pub content_type: Option<String>,
    pub sha256: String,
    pub body: Vec<u8>,
}

/// Plain GET with the sink crate's bounded retry/backoff.
#[derive(Debug, Clone)]
pub struct BlobFetcher {
    http: reqwest::Client,
    backoff: BackoffPolicy,
}

impl BlobFetcher {
    pub fn new(timeout: Duration, user_agent: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout);
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent.to_string());
        }
        Ok(Self {
            http: builder.build().context("building source http client")?,
            backoff: BackoffPolicy::default(),
        })
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedBlob, SourceError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.http.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let final_url = resp.url().to_string();
                        let content_type = resp
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(|v| v.to_string());
                        let body = resp.bytes().await?.to_vec();
                        let sha256 = hex::encode(Sha256::digest(&body));
                        debug!(url = %final_url, bytes = body.len(), sha256 = %sha256, "fetched source blob");
                        return Ok(FetchedBlob {
                            url: final_url,
                            content_type,
                            sha256,
                            body,
                        });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SourceError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SourceError::Request(err));
                }
            }
        }

        Err(SourceError::Request(
            last_request_error.expect("retry loop exits early without a captured error"),
        ))
    }
}

/// CSV bytes to rows, header row as keys. Cells stay strings; numeric
/// coercion is the consumer's call, same as the warehouse path.
pub fn rows_from_csv(bytes: &[u8], origin: &str) -> Result<Vec<Row>, SourceError> {
    rows_from_delimited(bytes, origin, b',')
}

/// Some agencies publish tab-separated exports under a `.txt` extension.
pub fn rows_from_delimited(
    bytes: &[u8],
    origin: &str,
    delimiter: u8,
) -> Result<Vec<Row>, SourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|source| SourceError::Csv {
            origin: origin.to_string(),
            source,
        })?
        .clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|source| SourceError::Csv {
            origin: origin.to_string(),
            source,
        })?;
        let mut row = Row::new();
        for (i, header) in headers.iter().enumerate() {
            let cell = record.get(i).unwrap_or("");
            row.insert(header.to_string(), Value::String(cell.to_string()));
        }
        rows.push(row);
    }
    Ok(rows)
}

/// GeoJSON FeatureCollection to rows: feature properties become the row,
/// the geometry rides along under `geometry`.
pub fn rows_from_geojson(bytes: &[u8], origin: &str) -> Result<Vec<Row>, SourceError> {
    let doc: Value = serde_json::from_slice(bytes).map_err(|err| SourceError::Decode {
        what: "geojson",
        origin: origin.to_string(),
        detail: err.to_string(),
    })?;
    let Some(features) = doc.get("features").and_then(Value::as_array) else {
        return Err(SourceError::Decode {
            what: "geojson",
            origin: origin.to_string(),
            detail: "missing features array".to_string(),
        });
    };

    let mut rows = Vec::new();
    for feature in features {
        let Some(properties) = feature.get("properties").and_then(Value::as_object) else {
            warn!(origin, "feature without properties skipped");
            continue;
        };
        let mut row = properties.clone();
        if let Some(geometry) = feature.get("geometry") {
            row.insert("geometry".to_string(), geometry.clone());
        }
        rows.push(row);
    }
    Ok(rows)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobFormat {
    Csv,
    Tsv,
    GeoJson,
}

fn rows_from_blob(blob: &FetchedBlob, format: BlobFormat) -> Result<Vec<Row>, SourceError> {
    match format {
        BlobFormat::Csv => rows_from_csv(&blob.body, &blob.url),
        BlobFormat::Tsv => rows_from_delimited(&blob.body, &blob.url, b'\t'),
        BlobFormat::GeoJson => rows_from_geojson(&blob.body, &blob.url),
    }
}

/// Flat file served over HTTP under `<base>/<bucket>/<blob>`. One-shot: the
/// whole file comes back every fetch, so cursor filters are not honored and
/// idempotence rests on the downstream dedup.
pub struct HttpBucketSource {
    fetcher: BlobFetcher,
    base_url: String,
    bucket: String,
    blob: String,
    format: BlobFormat,
    source_id: String,
}

impl HttpBucketSource {
    pub fn new(
        fetcher: BlobFetcher,
        base_url: impl Into<String>,
        bucket: impl Into<String>,
        blob: impl Into<String>,
        format: BlobFormat,
    ) -> Self {
        let bucket = bucket.into();
        let blob = blob.into();
        Self {
            fetcher,
            base_url: base_url.into(),
            source_id: format!("{bucket}/{blob}"),
            bucket,
            blob,
            format,
        }
    }
}

#[async_trait]
impl RecordSource for HttpBucketSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self, _query: &TableQuery) -> Result<Vec<Row>, SourceError> {
        let url = format!(
            "{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.bucket,
            self.blob
        );
        let blob = self.fetcher.fetch(&url).await?;
        rows_from_blob(&blob, self.format)
    }
}

/// Which catalog records to pull: a single resource by id, or every resource
/// of a dataset whose name passes the contains/excludes screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CkanSelector {
    Resource {
        resource_id: String,
    },
    Dataset {
        package_id: String,
        name_contains: Option<String>,
        name_excludes: Vec<String>,
    },
}

/// CKAN catalog source: action API lookup, then CSV dump download. One-shot,
/// like the bucket source.
pub struct CkanSource {
    fetcher: BlobFetcher,
    base_url: String,
    selector: CkanSelector,
    source_id: String,
}

impl CkanSource {
    pub fn new(
        fetcher: BlobFetcher,
        base_url: impl Into<String>,
        selector: CkanSelector,
    ) -> Self {
        let source_id = match &selector {
            CkanSelector::Resource { resource_id } => format!("ckan:{resource_id}"),
            CkanSelector::Dataset { package_id, .. } => format!("ckan:{package_id}"),
        };
        Self {
            fetcher,
            base_url: base_url.into(),
            selector,
            source_id,
        }
    }

    fn action_url(&self, action: &str, id: &str) -> String {
        format!(
            "{}/api/3/action/{action}?id={id}",
            self.base_url.trim_end_matches('/')
        )
    }

    async fn action_result(&self, action: &str, id: &str) -> Result<Value, SourceError> {
        let url = self.action_url(action, id);
        let blob = self.fetcher.fetch(&url).await?;
        let doc: Value = serde_json::from_slice(&blob.body).map_err(|err| SourceError::Decode {
            what: "ckan response",
            origin: url.clone(),
            detail: err.to_string(),
        })?;
        if doc.get("success").and_then(Value::as_bool) != Some(true) {
            return Err(SourceError::Decode {
                what: "ckan response",
                origin: url,
                detail: "success flag not set".to_string(),
            });
        }
        doc.get("result").cloned().ok_or_else(|| SourceError::Decode {
            what: "ckan response",
            origin: url,
            detail: "missing result".to_string(),
        })
    }

    async fn resource_rows(&self, resource_id: &str, url: &str) -> Result<Vec<Row>, SourceError> {
        if url.is_empty() {
            return Err(SourceError::MissingResource {
                resource: resource_id.to_string(),
            });
        }
        let blob = self.fetcher.fetch(url).await?;
        rows_from_csv(&blob.body, url)
    }
}

fn lowercase_keys(rows: Vec<Row>) -> Vec<Row> {
    rows.into_iter()
        .map(|row| row.into_iter().map(|(k, v)| (k.to_lowercase(), v)).collect())
        .collect()
}

#[async_trait]
impl RecordSource for CkanSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self, _query: &TableQuery) -> Result<Vec<Row>, SourceError> {
        match &self.selector {
            CkanSelector::Resource { resource_id } => {
                let result = self.action_result("resource_show", resource_id).await?;
                let url = result.get("url").and_then(Value::as_str).unwrap_or("");
                // Single-resource sheets are hand-maintained; headers are
                // normalized to lowercase so jobs see stable column names.
                let rows = self.resource_rows(resource_id, url).await?;
                Ok(lowercase_keys(rows))
            }
            CkanSelector::Dataset {
                package_id,
                name_contains,
                name_excludes,
            } => {
                let result = self.action_result("package_show", package_id).await?;
                let resources = result
                    .get("resources")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();

                let mut rows = Vec::new();
                for resource in &resources {
                    let name = resource.get("name").and_then(Value::as_str).unwrap_or("");
                    if let Some(needle) = name_contains {
                        if !name.contains(needle.as_str()) {
                            continue;
                        }
                    }
                    if name_excludes.iter().any(|ex| name.contains(ex.as_str())) {
                        continue;
                    }
                    let resource_id = resource.get("id").and_then(Value::as_str).unwrap_or(name);
                    let url = resource.get("url").and_then(Value::as_str).unwrap_or("");
                    match self.resource_rows(resource_id, url).await {
                        Ok(mut resource_rows) => rows.append(&mut resource_rows),
                        Err(err) => {
                            warn!(resource = resource_id, error = %err, "catalog resource skipped");
                        }
                    }
                }
                Ok(rows)
            }
        }
    }
}

/// Declarative source reference carried by job configurations; resolved to a
/// concrete `RecordSource` at run time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SourceSpec {
    /// Tabular warehouse table. Local runs resolve this against
    /// `fixture_root/<dataset>/<table>.json`; deployments swap in a real
    /// SQL executor behind the same trait.
    Warehouse { dataset: String, table: String },
    Bucket {
        bucket: String,
        blob: String,
        format: BlobFormat,
    },
    Ckan(CkanSelector),
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub fixture_root: PathBuf,
    pub bucket_base: String,
    pub ckan_base: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            fixture_root: PathBuf::from("fixtures"),
            bucket_base: "https://storage.googleapis.com".to_string(),
            ckan_base: "https://catalog.newmexicowaterdata.org".to_string(),
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

/// Builds the concrete source for a job's declarative spec.
pub fn source_for_spec(
    spec: &SourceSpec,
    settings: &SourceSettings,
) -> anyhow::Result<Box<dyn RecordSource>> {
    match spec {
        SourceSpec::Warehouse { dataset, table } => {
            let path = settings
                .fixture_root
                .join(dataset)
                .join(format!("{table}.json"));
            let source = MemoryTableSource::from_json_file(&path)?;
            Ok(Box::new(source))
        }
        SourceSpec::Bucket {
            bucket,
            blob,
            format,
        } => {
            let fetcher = BlobFetcher::new(settings.timeout, settings.user_agent.as_deref())?;
            Ok(Box::new(HttpBucketSource::new(
                fetcher,
                settings.bucket_base.clone(),
                bucket.clone(),
                blob.clone(),
                *format,
            )))
        }
        SourceSpec::Ckan(selector) => {
            let fetcher = BlobFetcher::new(settings.timeout, settings.user_agent.as_deref())?;
            Ok(Box::new(CkanSource::new(
                fetcher,
                settings.ckan_base.clone(),
                selector.clone(),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> Row {
        let mut r = Row::new();
        for (k, v) in pairs {
            r.insert(k.to_string(), v.clone());
        }
        r
    }

    #[test]
    fn table_query_renders_clauses_in_order() {
        let mut q = TableQuery::new("levels", "pecos_wells", &["OBJECTID", "PointID", "DTW"]);
        q.alias = Some("data".to_string());
        q.join = Some("join levels.sites as MP on MP.id = data.site_id".to_string());
        q.filter = Some(
            Filter::Cmp {
                field: "OBJECTID".to_string(),
                op: CmpOp::Gt,
                value: Value::from(100),
            }
            .and(Filter::Raw("parameterId=4".to_string())),
        );
        q.order_by = Some("OBJECTID asc".to_string());
        q.limit = Some(500);

        assert_eq!(
            q.to_sql(),
            "select OBJECTID, PointID, DTW from levels.pecos_wells as data \
             join levels.sites as MP on MP.id = data.site_id \
             where OBJECTID > 100 and parameterId=4 \
             order by OBJECTID asc limit 500"
        );
    }

    #[test]
    fn numeric_filter_compares_strings_numerically() {
        let f = Filter::Cmp {
            field: "OBJECTID".to_string(),
            op: CmpOp::Gt,
            value: Value::from(100),
        };
        assert!(f.matches(&row(&[("OBJECTID", Value::from(101))])));
        assert!(f.matches(&row(&[("OBJECTID", Value::from("105"))])));
        assert!(!f.matches(&row(&[("OBJECTID", Value::from(100))])));
        assert!(!f.matches(&row(&[("OBJECTID", Value::Null)])));
        assert!(!f.matches(&row(&[("other", Value::from(500))])));
    }

    #[test]
    fn timestamp_filter_tries_formats_in_order() {
        let f = Filter::CmpTime {
            field: "data_time".to_string(),
            op: CmpOp::Ge,
            cutoff: NaiveDateTime::parse_from_str("2024-03-01 00:00:00", "%Y-%m-%d %H:%M:%S")
                .unwrap(),
            formats: vec![
                "%Y-%m-%dT%H:%M:%S".to_string(),
                "%Y-%m-%d %H:%M:%S".to_string(),
            ],
        };
        // First format wins for ISO rows, the second picks up the space form.
        assert!(f.matches(&row(&[("data_time", Value::from("2024-03-01T00:00:00"))])));
        assert!(f.matches(&row(&[("data_time", Value::from("2024-03-02 10:00:00"))])));
        assert!(!f.matches(&row(&[("data_time", Value::from("2024-02-29 23:59:59"))])));
        assert!(!f.matches(&row(&[("data_time", Value::from("garbage"))])));
    }

    #[test]
    fn aliased_filter_field_matches_bare_row_key() {
        let f = Filter::Cmp {
            field: "MP._airbyte_raw_id".to_string(),
            op: CmpOp::Gt,
            value: Value::from("aaa"),
        };
        assert!(f.matches(&row(&[("_airbyte_raw_id", Value::from("abc"))])));
    }

    #[tokio::test]
    async fn memory_source_applies_filter_order_and_limit() {
        let rows = vec![
            row(&[("OBJECTID", Value::from(103)), ("v", Value::from(1))]),
            row(&[("OBJECTID", Value::from(101)), ("v", Value::from(2))]),
            row(&[("OBJECTID", Value::from(99)), ("v", Value::from(3))]),
            row(&[("OBJECTID", Value::from(105)), ("v", Value::from(4))]),
        ];
        let source = MemoryTableSource::new("t", rows);

        let mut q = TableQuery::new("d", "t", &["OBJECTID", "v"]);
        q.filter = Some(Filter::Cmp {
            field: "OBJECTID".to_string(),
            op: CmpOp::Gt,
            value: Value::from(100),
        });
        q.order_by = Some("OBJECTID".to_string());
        q.limit = Some(2);

        let got = source.fetch(&q).await.unwrap();
        let ids: Vec<i64> = got
            .iter()
            .map(|r| r.get("OBJECTID").and_then(Value::as_i64).unwrap())
            .collect();
        assert_eq!(ids, vec![101, 103]);
    }

    #[test]
    fn csv_rows_keep_cells_as_strings() {
        let bytes = b"site_id,DateMeasured,DepthToWaterBGS\n1002,2024-01-05 08:00:00,10.5\n1003,2024-01-06 08:00:00,N/A\n";
        let rows = rows_from_csv(bytes, "test.csv").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("site_id"), Some(&Value::from("1002")));
        assert_eq!(rows[0].get("DepthToWaterBGS"), Some(&Value::from("10.5")));
        assert_eq!(rows[1].get("DepthToWaterBGS"), Some(&Value::from("N/A")));
    }

    #[test]
    fn tab_delimited_exports_parse_like_csv() {
        let bytes = b"sys_loc_code\tmeasurement_date\twater_depth\nMW-1\t2024-01-05 08:00\t12.3\n";
        let rows = rows_from_delimited(bytes, "levels.txt", b'\t').unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("sys_loc_code"), Some(&Value::from("MW-1")));
        assert_eq!(rows[0].get("water_depth"), Some(&Value::from("12.3")));
    }

    #[test]
    fn lowercase_keys_normalizes_resource_headers() {
        let rows = rows_from_csv(b"Site_ID,DD_LAT\nRA-0100,33.4\n", "sheet.csv").unwrap();
        let rows = lowercase_keys(rows);
        assert_eq!(rows[0].get("site_id"), Some(&Value::from("RA-0100")));
        assert_eq!(rows[0].get("dd_lat"), Some(&Value::from("33.4")));
        assert!(rows[0].get("Site_ID").is_none());
    }

    #[test]
    fn geojson_rows_flatten_properties_and_keep_geometry() {
        let bytes = br#"{
            "type": "FeatureCollection",
            "features": [
                {
                    "type": "Feature",
                    "properties": {"site_id": "SR-1", "name": "Seven Rivers 1"},
                    "geometry": {"type": "Point", "coordinates": [-104.4, 32.6]}
                },
                {"type": "Feature", "geometry": null}
            ]
        }"#;
        let rows = rows_from_geojson(bytes, "wells.geojson").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("site_id"), Some(&Value::from("SR-1")));
        assert_eq!(
            rows[0]
                .get("geometry")
                .and_then(|g| g.get("coordinates"))
                .and_then(|c| c.get(0))
                .and_then(Value::as_f64),
            Some(-104.4)
        );
    }

    #[test]
    fn warehouse_spec_resolves_against_fixture_root() {
        let dir = tempfile::tempdir().unwrap();
        let dataset_dir = dir.path().join("levels");
        std::fs::create_dir_all(&dataset_dir).unwrap();
        std::fs::write(
            dataset_dir.join("pecos_wells.json"),
            br#"[{"OBJECTID": 1, "DTW": 10.5}]"#,
        )
        .unwrap();

        let settings = SourceSettings {
            fixture_root: dir.path().to_path_buf(),
            ..SourceSettings::default()
        };
        let spec = SourceSpec::Warehouse {
            dataset: "levels".to_string(),
            table: "pecos_wells".to_string(),
        };
        let source = source_for_spec(&spec, &settings).unwrap();
        assert!(source.source_id().ends_with("pecos_wells.json"));
    }

    #[test]
    fn missing_fixture_is_a_fatal_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SourceSettings {
            fixture_root: dir.path().to_path_buf(),
            ..SourceSettings::default()
        };
        let spec = SourceSpec::Warehouse {
            dataset: "levels".to_string(),
            table: "absent".to_string(),
        };
        assert!(source_for_spec(&spec, &settings).is_err());
    }
}
