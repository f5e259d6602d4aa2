//! SensorThings sink client for gwsync: the `StaSink` trait, a reqwest-backed
//! implementation with bounded retry, and an in-memory sink for tests and
//! local dry runs.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use gwsync_core::{Entity, EntityKind, IotId, ObservationRecord, ObservationsPayload};

pub const CRATE_NAME: &str = "gwsync-sta";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// OData string literal with embedded single quotes doubled.
pub fn odata_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "''"))
}

/// How a job locates the Location entity for a source record. Structured so
/// the in-memory sink can evaluate it without an OData parser; the HTTP
/// client renders it to a `$filter` expression.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationQuery {
    /// `properties/source_id eq '<id>' and properties/agency eq '<agency>'`
    SourceId { source_id: String, agency: String },
    /// Same shape against a different property key (`or_site_id` for EBID).
    Property {
        key: String,
        value: String,
        agency: String,
    },
    /// `name eq '<name>'`, optionally qualified by agency.
    Name {
        name: String,
        agency: Option<String>,
    },
}

impl LocationQuery {
    pub fn to_odata(&self) -> String {
        match self {
            LocationQuery::SourceId { source_id, agency } => format!(
                "properties/source_id eq {} and properties/agency eq {}",
                odata_quote(source_id),
                odata_quote(agency)
            ),
            LocationQuery::Property { key, value, agency } => format!(
                "properties/{} eq {} and properties/agency eq {}",
                key,
                odata_quote(value),
                odata_quote(agency)
            ),
            LocationQuery::Name { name, agency } => match agency {
                Some(agency) => format!(
                    "name eq {} and properties/agency eq {}",
                    odata_quote(name),
                    odata_quote(agency)
                ),
                None => format!("name eq {}", odata_quote(name)),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum StaError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("sink status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid sink url {url}")]
    InvalidUrl { url: String },
    #[error("decoding sink response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("create response for {collection} carried no server id")]
    MissingServerId { collection: &'static str },
}

/// Everything a sync job needs from the observational store. One entity get
/// per uniqueness predicate, creates dispatched by kind, bulk observation
/// insert. `dry` suppresses writes but keeps lookups live.
#[async_trait]
pub trait StaSink: Send + Sync {
    async fn get_location(&self, query: &LocationQuery) -> Result<Option<Entity>, StaError>;
    async fn get_thing(&self, name: &str, location: IotId) -> Result<Option<Entity>, StaError>;
    async fn get_sensor(&self, name: &str) -> Result<Option<Entity>, StaError>;
    async fn get_observed_property(&self, name: &str) -> Result<Option<Entity>, StaError>;
    async fn get_datastream(&self, name: &str, thing: IotId) -> Result<Option<Entity>, StaError>;
    /// Existing observations for a datastream, newest first, all pages.
    async fn get_observations(&self, datastream: IotId)
        -> Result<Vec<ObservationRecord>, StaError>;
    async fn create(&self, kind: EntityKind, payload: &Value, dry: bool)
        -> Result<IotId, StaError>;
    async fn patch_location(&self, id: IotId, patch: &Value, dry: bool) -> Result<(), StaError>;
    async fn add_observations(
        &self,
        payload: &ObservationsPayload,
        dry: bool,
    ) -> Result<usize, StaError>;
}

#[derive(Debug, Clone)]
pub struct StaClientConfig {
    /// Service root including the version segment, e.g.
    /// `https://host/FROST-Server/v1.1`.
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub page_size: usize,
}

impl StaClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            username: None,
            password: None,
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            page_size: 1000,
        }
    }
}

#[derive(Debug)]
pub struct StaClient {
    http: reqwest::Client,
    base: String,
    auth: Option<(String, String)>,
    backoff: BackoffPolicy,
    page_size: usize,
}

impl StaClient {
    pub fn new(config: StaClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let http = builder.build().context("building sink http client")?;

        let auth = match (config.username, config.password) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        };

        Ok(Self {
            http,
            base: config.base_url.trim_end_matches('/').to_string(),
            auth,
            backoff: config.backoff,
            page_size: config.page_size.max(1),
        })
    }

    fn api_url(&self, path: &str, params: &[(&str, String)]) -> Result<Url, StaError> {
        let raw = format!("{}/{}", self.base, path);
        Url::parse_with_params(&raw, params).map_err(|_| StaError::InvalidUrl { url: raw })
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, StaError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut req = self.http.request(method.clone(), url.clone());
            if let Some((user, pass)) = &self.auth {
                req = req.basic_auth(user, Some(pass));
            }
            if let Some(body) = body {
                req = req.json(body);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(StaError::HttpStatus {
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
                    return Err(StaError::Request(err));
                }
            }
        }

        Err(StaError::Request(
            last_request_error.expect("retry loop exits early without a captured error"),
        ))
    }

    async fn get_json(&self, url: Url) -> Result<Value, StaError> {
        let display = url.to_string();
        let resp = self.send(Method::GET, url, None).await?;
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|source| StaError::Decode {
            url: display,
            source,
        })
    }

    /// First entity matching `filter` in `collection`, or None.
    async fn first_entity(
        &self,
        collection: &str,
        filter: &str,
    ) -> Result<Option<Entity>, StaError> {
        let url = self.api_url(
            collection,
            &[("$filter", filter.to_string()), ("$top", "1".to_string())],
        )?;
        let display = url.to_string();
        let body = self.get_json(url).await?;
        let Some(first) = body
            .get("value")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
        else {
            return Ok(None);
        };
        serde_json::from_value(first.clone())
            .map(Some)
            .map_err(|source| StaError::Decode {
                url: display,
                source,
            })
    }
}

/// Server-assigned id from a create response: the `Location` header ends in
/// `<Collection>(<id>)`.
fn id_from_location_header(resp: &reqwest::Response) -> Option<i64> {
    let loc = resp
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|v| v.to_str().ok())?;
    let open = loc.rfind('(')?;
    let close = loc.rfind(')')?;
    if close <= open {
        return None;
    }
    loc[open + 1..close].parse::<i64>().ok()
}

#[async_trait]
impl StaSink for StaClient {
    async fn get_location(&self, query: &LocationQuery) -> Result<Option<Entity>, StaError> {
        self.first_entity("Locations", &query.to_odata()).await
    }

    async fn get_thing(&self, name: &str, location: IotId) -> Result<Option<Entity>, StaError> {
        let path = format!("Locations({location})/Things");
        self.first_entity(&path, &format!("name eq {}", odata_quote(name)))
            .await
    }

    async fn get_sensor(&self, name: &str) -> Result<Option<Entity>, StaError> {
        self.first_entity("Sensors", &format!("name eq {}", odata_quote(name)))
            .await
    }

    async fn get_observed_property(&self, name: &str) -> Result<Option<Entity>, StaError> {
        self.first_entity(
            "ObservedProperties",
            &format!("name eq {}", odata_quote(name)),
        )
        .await
    }

    async fn get_datastream(&self, name: &str, thing: IotId) -> Result<Option<Entity>, StaError> {
        let path = format!("Things({thing})/Datastreams");
        self.first_entity(&path, &format!("name eq {}", odata_quote(name)))
            .await
    }

    async fn get_observations(
        &self,
        datastream: IotId,
    ) -> Result<Vec<ObservationRecord>, StaError> {
        let mut url = self.api_url(
            &format!("Datastreams({datastream})/Observations"),
            &[
                ("$orderby", "phenomenonTime desc".to_string()),
                ("$top", self.page_size.to_string()),
            ],
        )?;
        let mut out = Vec::new();

        loop {
            let display = url.to_string();
            let body = self.get_json(url).await?;
            if let Some(items) = body.get("value").and_then(Value::as_array) {
                for item in items {
                    let rec: ObservationRecord = serde_json::from_value(item.clone()).map_err(
                        |source| StaError::Decode {
                            url: display.clone(),
                            source,
                        },
                    )?;
                    out.push(rec);
                }
            }
            match body.get("@iot.nextLink").and_then(Value::as_str) {
                Some(next) => {
                    url = Url::parse(next).map_err(|_| StaError::InvalidUrl {
                        url: next.to_string(),
                    })?;
                }
                None => break,
            }
        }

        Ok(out)
    }

    async fn create(
        &self,
        kind: EntityKind,
        payload: &Value,
        dry: bool,
    ) -> Result<IotId, StaError> {
        if dry {
            debug!(kind = %kind, "dry run, create suppressed");
            return Ok(IotId::DRY);
        }
        let url = self.api_url(kind.collection(), &[])?;
        let resp = self.send(Method::POST, url, Some(payload)).await?;
        if let Some(id) = id_from_location_header(&resp) {
            return Ok(IotId(id));
        }
        // Deployments configured to echo the entity put the id in the body.
        let body: Option<Value> = resp.json().await.ok();
        match body
            .as_ref()
            .and_then(|b| b.get("@iot.id"))
            .and_then(Value::as_i64)
        {
            Some(id) => Ok(IotId(id)),
            None => Err(StaError::MissingServerId {
                collection: kind.collection(),
            }),
        }
    }

    async fn patch_location(&self, id: IotId, patch: &Value, dry: bool) -> Result<(), StaError> {
        if dry {
            debug!(%id, "dry run, patch suppressed");
            return Ok(());
        }
        let url = self.api_url(&format!("Locations({id})"), &[])?;
        self.send(Method::PATCH, url, Some(patch)).await?;
        Ok(())
    }

    async fn add_observations(
        &self,
        payload: &ObservationsPayload,
        dry: bool,
    ) -> Result<usize, StaError> {
        if payload.is_empty() {
            return Ok(0);
        }
        if dry {
            debug!(count = payload.len(), "dry run, bulk insert suppressed");
            return Ok(payload.len());
        }
        let url = self.api_url("CreateObservations", &[])?;
        let body = serde_json::json!([payload]);
        self.send(Method::POST, url, Some(&body)).await?;
        Ok(payload.len())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    locations: Vec<Entity>,
    things: Vec<(Entity, i64)>,
    sensors: Vec<Entity>,
    observed_properties: Vec<Entity>,
    datastreams: Vec<(Entity, i64)>,
    observations: HashMap<i64, Vec<ObservationRecord>>,
    writes: usize,
}

impl MemoryState {
    fn assign_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// HashMap-backed sink used by the engine tests and local development runs.
/// Relations are resolved from the same wire payloads the HTTP client sends.
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

fn entity_from_payload(id: i64, payload: &Value) -> Entity {
    Entity {
        id,
        name: payload
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        properties: payload
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
    }
}

fn ref_id(payload: &Value, relation: &str) -> Option<i64> {
    payload
        .get(relation)
        .and_then(|v| v.get("@iot.id"))
        .and_then(Value::as_i64)
}

fn prop_text(entity: &Entity, key: &str) -> Option<String> {
    entity.properties.get(key).map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total mutating calls that reached the store; stays zero under dry runs.
    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }

    pub async fn created_count(&self, kind: EntityKind) -> usize {
        let state = self.state.lock().await;
        match kind {
            EntityKind::Location => state.locations.len(),
            EntityKind::Thing => state.things.len(),
            EntityKind::Sensor => state.sensors.len(),
            EntityKind::ObservedProperty => state.observed_properties.len(),
            EntityKind::Datastream => state.datastreams.len(),
        }
    }

    pub async fn observation_count(&self, datastream: IotId) -> usize {
        self.state
            .lock()
            .await
            .observations
            .get(&datastream.0)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Seeds a pre-existing observation, as if a prior run had inserted it.
    pub async fn seed_observation(&self, datastream: IotId, phenomenon_time: &str, result: Value) {
        let mut state = self.state.lock().await;
        state
            .observations
            .entry(datastream.0)
            .or_default()
            .push(ObservationRecord {
                phenomenon_time: phenomenon_time.to_string(),
                result,
            });
    }

    pub async fn location_properties(&self, id: IotId) -> Option<Map<String, Value>> {
        let state = self.state.lock().await;
        state
            .locations
            .iter()
            .find(|e| e.id == id.0)
            .map(|e| e.properties.clone())
    }
}

#[async_trait]
impl StaSink for MemorySink {
    async fn get_location(&self, query: &LocationQuery) -> Result<Option<Entity>, StaError> {
        let state = self.state.lock().await;
        let found = state.locations.iter().find(|e| match query {
            LocationQuery::SourceId { source_id, agency } => {
                prop_text(e, "source_id").as_deref() == Some(source_id.as_str())
                    && prop_text(e, "agency").as_deref() == Some(agency.as_str())
            }
            LocationQuery::Property { key, value, agency } => {
                prop_text(e, key).as_deref() == Some(value.as_str())
                    && prop_text(e, "agency").as_deref() == Some(agency.as_str())
            }
            LocationQuery::Name { name, agency } => {
                e.name == *name
                    && agency
                        .as_ref()
                        .map(|a| prop_text(e, "agency").as_deref() == Some(a.as_str()))
                        .unwrap_or(true)
            }
        });
        Ok(found.cloned())
    }

    async fn get_thing(&self, name: &str, location: IotId) -> Result<Option<Entity>, StaError> {
        let state = self.state.lock().await;
        Ok(state
            .things
            .iter()
            .find(|(e, loc)| e.name == name && *loc == location.0)
            .map(|(e, _)| e.clone()))
    }

    async fn get_sensor(&self, name: &str) -> Result<Option<Entity>, StaError> {
        let state = self.state.lock().await;
        Ok(state.sensors.iter().find(|e| e.name == name).cloned())
    }

    async fn get_observed_property(&self, name: &str) -> Result<Option<Entity>, StaError> {
        let state = self.state.lock().await;
        Ok(state
            .observed_properties
            .iter()
            .find(|e| e.name == name)
            .cloned())
    }

    async fn get_datastream(&self, name: &str, thing: IotId) -> Result<Option<Entity>, StaError> {
        let state = self.state.lock().await;
        Ok(state
            .datastreams
            .iter()
            .find(|(e, t)| e.name == name && *t == thing.0)
            .map(|(e, _)| e.clone()))
    }

    async fn get_observations(
        &self,
        datastream: IotId,
    ) -> Result<Vec<ObservationRecord>, StaError> {
        let state = self.state.lock().await;
        let mut out = state
            .observations
            .get(&datastream.0)
            .cloned()
            .unwrap_or_default();
        // Newest first, matching the HTTP client's $orderby.
        out.sort_by(|a, b| b.phenomenon_time.cmp(&a.phenomenon_time));
        Ok(out)
    }

    async fn create(
        &self,
        kind: EntityKind,
        payload: &Value,
        dry: bool,
    ) -> Result<IotId, StaError> {
        if dry {
            return Ok(IotId::DRY);
        }
        let mut state = self.state.lock().await;
        state.writes += 1;
        let id = state.assign_id();
        let entity = entity_from_payload(id, payload);
        match kind {
            EntityKind::Location => state.locations.push(entity),
            EntityKind::Thing => {
                let location = payload
                    .get("Locations")
                    .and_then(Value::as_array)
                    .and_then(|ls| ls.first())
                    .and_then(|l| l.get("@iot.id"))
                    .and_then(Value::as_i64);
                state.things.push((entity, location.unwrap_or_default()));
            }
            EntityKind::Sensor => state.sensors.push(entity),
            EntityKind::ObservedProperty => state.observed_properties.push(entity),
            EntityKind::Datastream => {
                let thing = ref_id(payload, "Thing").unwrap_or_default();
                state.datastreams.push((entity, thing));
            }
        }
        Ok(IotId(id))
    }

    async fn patch_location(&self, id: IotId, patch: &Value, dry: bool) -> Result<(), StaError> {
        if dry {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        state.writes += 1;
        if let Some(entity) = state.locations.iter_mut().find(|e| e.id == id.0) {
            if let Some(props) = patch.get("properties").and_then(Value::as_object) {
                for (k, v) in props {
                    entity.properties.insert(k.clone(), v.clone());
                }
            }
        }
        Ok(())
    }

    async fn add_observations(
        &self,
        payload: &ObservationsPayload,
        dry: bool,
    ) -> Result<usize, StaError> {
        if payload.is_empty() {
            return Ok(0);
        }
        if dry {
            return Ok(payload.len());
        }
        let mut state = self.state.lock().await;
        state.writes += 1;
        let rows = state.observations.entry(payload.datastream.id).or_default();
        for tuple in &payload.data_array {
            let phenomenon_time = tuple
                .first()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let result = tuple.get(2).cloned().unwrap_or(Value::Null);
            rows.push(ObservationRecord {
                phenomenon_time,
                result,
            });
        }
        Ok(payload.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location_payload(name: &str, source_id: &str, agency: &str) -> Value {
        serde_json::json!({
            "name": name,
            "description": "No Description",
            "location": {"type": "Point", "coordinates": [-104.2, 33.1]},
            "encodingType": "application/vnd.geo+json",
            "properties": {"source_id": source_id, "agency": agency},
        })
    }

    #[test]
    fn odata_quoting_doubles_single_quotes() {
        assert_eq!(odata_quote("Site-3"), "'Site-3'");
        assert_eq!(odata_quote("O'Brien Well"), "'O''Brien Well'");
    }

    #[test]
    fn location_query_renders_filter_expressions() {
        let q = LocationQuery::SourceId {
            source_id: "1002".to_string(),
            agency: "EBID".to_string(),
        };
        assert_eq!(
            q.to_odata(),
            "properties/source_id eq '1002' and properties/agency eq 'EBID'"
        );

        let q = LocationQuery::Property {
            key: "or_site_id".to_string(),
            value: "12".to_string(),
            agency: "EBID".to_string(),
        };
        assert_eq!(
            q.to_odata(),
            "properties/or_site_id eq '12' and properties/agency eq 'EBID'"
        );

        let q = LocationQuery::Name {
            name: "Site-7".to_string(),
            agency: None,
        };
        assert_eq!(q.to_odata(), "name eq 'Site-7'");

        let q = LocationQuery::Name {
            name: "Poe Corn Level".to_string(),
            agency: Some("PVACD".to_string()),
        };
        assert_eq!(
            q.to_odata(),
            "name eq 'Poe Corn Level' and properties/agency eq 'PVACD'"
        );
    }

    #[test]
    fn backoff_delay_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(700),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(700));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(700));
    }

    #[tokio::test]
    async fn memory_sink_resolves_entities_by_uniqueness_predicates() {
        let sink = MemorySink::new();
        let loc = sink
            .create(
                EntityKind::Location,
                &location_payload("Well 1", "1002", "EBID"),
                false,
            )
            .await
            .unwrap();

        let thing_payload = serde_json::json!({
            "name": "Water Well",
            "description": "No Description",
            "properties": {"agency": "EBID"},
            "Locations": [{"@iot.id": loc.0}],
        });
        let thing = sink
            .create(EntityKind::Thing, &thing_payload, false)
            .await
            .unwrap();

        let found = sink
            .get_location(&LocationQuery::SourceId {
                source_id: "1002".to_string(),
                agency: "EBID".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(found.map(|e| e.id), Some(loc.0));

        let found = sink.get_thing("Water Well", loc).await.unwrap();
        assert_eq!(found.map(|e| e.id), Some(thing.0));

        let missing = sink.get_thing("Water Well", IotId(999)).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn memory_sink_dry_mode_suppresses_all_writes() {
        let sink = MemorySink::new();
        let id = sink
            .create(
                EntityKind::Location,
                &location_payload("Well 1", "1", "X"),
                true,
            )
            .await
            .unwrap();
        assert_eq!(id, IotId::DRY);

        let payload = ObservationsPayload {
            datastream: IotId(3).into(),
            components: vec![
                "phenomenonTime".to_string(),
                "resultTime".to_string(),
                "result".to_string(),
            ],
            data_array: vec![vec![
                Value::from("2024-01-01T00:00:00.000Z"),
                Value::from("2024-01-01T00:00:00.000Z"),
                Value::from(10.5),
            ]],
        };
        let staged = sink.add_observations(&payload, true).await.unwrap();
        assert_eq!(staged, 1);
        assert_eq!(sink.write_count().await, 0);
        assert_eq!(sink.observation_count(IotId(3)).await, 0);
    }

    #[tokio::test]
    async fn memory_sink_patch_merges_location_properties() {
        let sink = MemorySink::new();
        let loc = sink
            .create(
                EntityKind::Location,
                &location_payload("Well 1", "1", "X"),
                false,
            )
            .await
            .unwrap();
        sink.patch_location(
            loc,
            &serde_json::json!({"properties": {"geoconnex": "https://geoconnex.us/nmwdi/st/locations/1"}}),
            false,
        )
        .await
        .unwrap();

        let props = sink.location_properties(loc).await.unwrap();
        assert_eq!(
            props.get("geoconnex").and_then(Value::as_str),
            Some("https://geoconnex.us/nmwdi/st/locations/1")
        );
        assert_eq!(props.get("source_id").and_then(Value::as_str), Some("1"));
    }

    #[tokio::test]
    async fn bulk_inserts_land_newest_first_on_read_back() {
        let sink = MemorySink::new();
        let payload = ObservationsPayload {
            datastream: IotId(9).into(),
            components: vec![
                "phenomenonTime".to_string(),
                "resultTime".to_string(),
                "result".to_string(),
            ],
            data_array: vec![
                vec![
                    Value::from("2024-01-01T00:00:00.000Z"),
                    Value::from("2024-01-01T00:00:00.000Z"),
                    Value::from(10.5),
                ],
                vec![
                    Value::from("2024-02-01T00:00:00.000Z"),
                    Value::from("2024-02-01T00:00:00.000Z"),
                    Value::from(11.0),
                ],
            ],
        };
        sink.add_observations(&payload, false).await.unwrap();

        let got = sink.get_observations(IotId(9)).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].phenomenon_time, "2024-02-01T00:00:00.000Z");
    }
}
