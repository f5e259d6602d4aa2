//! Core domain model for gwsync: SensorThings entity payloads, source rows,
//! and the cursor-state protocol shared by every sync job.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "gwsync-core";

/// One upstream record as delivered by a source adapter. Keys are bare column
/// names; values keep whatever JSON type the source produced.
pub type Row = Map<String, Value>;

/// Wire format for observation timestamps written to the store.
pub const WIRE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S.000Z";

/// Formats the store itself uses for `phenomenonTime`, tried in order when
/// rebuilding the dedup index from existing observations.
pub const STORE_TIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%SZ", "%Y-%m-%dT%H:%M:%S.000Z"];

/// Cursor fields may be aliased in the extraction query (`data.OBJECTID`)
/// while rows expose the bare column name.
pub fn bare_field(field: &str) -> &str {
    match field.rsplit_once('.') {
        Some((_, bare)) => bare,
        None => field,
    }
}

/// Tries each format in order; the first successful parse wins, so format
/// order is part of a job's contract.
pub fn parse_with_formats(raw: &str, formats: &[&str]) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    formats
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

/// Parses a `phenomenonTime` the store handed back.
pub fn parse_store_time(raw: &str) -> Option<NaiveDateTime> {
    parse_with_formats(raw, STORE_TIME_FORMATS)
}

pub fn format_wire_time(dt: NaiveDateTime) -> String {
    dt.format(WIRE_TIME_FORMAT).to_string()
}

/// Numeric coercion used for observation results and cursor ids: numbers pass
/// through, numeric strings parse, everything else is rejected.
pub fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

pub fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Sentinel results some agencies export instead of nulls.
const VALUE_SENTINELS: &[&str] = &["N/A", "#REF!"];

/// True when a result cell carries no usable measurement.
pub fn is_missing_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => {
            let t = s.trim();
            t.is_empty() || VALUE_SENTINELS.contains(&t)
        }
        _ => false,
    }
}

/// Grouping key for per-site batching. Site columns are numeric for some
/// agencies and free text for others; numeric coercion is attempted first so
/// `"1002"` and `1002` land in the same group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupKey {
    Int(i64),
    Text(String),
}

impl GroupKey {
    pub fn from_value(value: &Value) -> Option<GroupKey> {
        match value {
            Value::Null => None,
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(GroupKey::Int(i)),
                None => n.as_f64().map(|f| GroupKey::Int(f as i64)),
            },
            Value::String(s) => match s.trim().parse::<i64>() {
                Ok(i) => Some(GroupKey::Int(i)),
                Err(_) => Some(GroupKey::Text(s.clone())),
            },
            other => Some(GroupKey::Text(other.to_string())),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Int(i) => write!(f, "{i}"),
            GroupKey::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Server-assigned SensorThings id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IotId(pub i64);

impl IotId {
    /// Placeholder returned by dry-mode creates; never a real server id.
    pub const DRY: IotId = IotId(0);
}

impl fmt::Display for IotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Entity reference in request payloads: `{"@iot.id": n}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IotRef {
    #[serde(rename = "@iot.id")]
    pub id: i64,
}

impl From<IotId> for IotRef {
    fn from(id: IotId) -> Self {
        IotRef { id: id.0 }
    }
}

/// Minimal view of a stored entity: the pieces sync jobs read back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "@iot.id")]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Entity {
    pub fn iot_id(&self) -> IotId {
        IotId(self.id)
    }
}

/// One existing observation as read back from the store while building the
/// dedup index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    #[serde(rename = "phenomenonTime")]
    pub phenomenon_time: String,
    pub result: Value,
}

/// The five entity collections the upsert pipeline can target. Observations
/// go through the bulk insert path instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Location,
    Thing,
    Sensor,
    ObservedProperty,
    Datastream,
}

impl EntityKind {
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Location => "Locations",
            EntityKind::Thing => "Things",
            EntityKind::Sensor => "Sensors",
            EntityKind::ObservedProperty => "ObservedProperties",
            EntityKind::Datastream => "Datastreams",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}

/// Caller-supplied job state: `{<cursor_field>: value, "limit": n, "counter": k}`.
/// The cursor key is per-job, so this stays a thin wrapper over the raw map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobState(pub Map<String, Value>);

impl JobState {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn cursor(&self, cursor_field: &str) -> Option<&Value> {
        self.0.get(cursor_field).filter(|v| !v.is_null())
    }

    pub fn limit(&self) -> Option<i64> {
        self.0.get("limit").and_then(coerce_i64)
    }

    pub fn counter(&self) -> i64 {
        self.0.get("counter").and_then(coerce_i64).unwrap_or(0)
    }

    /// Builds the advanced state handed back to the scheduler.
    pub fn advanced(cursor_field: &str, cursor: Value, limit: Option<i64>, counter: i64) -> Self {
        let mut map = Map::new();
        map.insert(cursor_field.to_string(), cursor);
        map.insert(
            "limit".to_string(),
            limit.map(Value::from).unwrap_or(Value::Null),
        );
        map.insert("counter".to_string(), Value::from(counter));
        JobState(map)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOfMeasurement {
    pub name: String,
    pub symbol: String,
    pub definition: String,
}

/// Location create payload. `location` holds a GeoJSON geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationPayload {
    pub name: String,
    pub description: String,
    pub location: Value,
    #[serde(rename = "encodingType")]
    pub encoding_type: String,
    pub properties: Map<String, Value>,
}

impl LocationPayload {
    /// Point location in WGS84; the third coordinate is whatever elevation
    /// the source carries, in the source's own unit.
    pub fn point(
        name: impl Into<String>,
        description: impl Into<String>,
        lon: f64,
        lat: f64,
        elevation: Option<f64>,
        properties: Map<String, Value>,
    ) -> Self {
        let coordinates = match elevation {
            Some(e) => serde_json::json!([lon, lat, e]),
            None => serde_json::json!([lon, lat]),
        };
        LocationPayload {
            name: name.into(),
            description: description.into(),
            location: serde_json::json!({"type": "Point", "coordinates": coordinates}),
            encoding_type: vocab::ENCODING_GEOJSON.to_string(),
            properties,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThingPayload {
    pub name: String,
    pub description: String,
    pub properties: Map<String, Value>,
    #[serde(rename = "Locations")]
    pub locations: Vec<IotRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorPayload {
    pub name: String,
    pub description: String,
    #[serde(rename = "encodingType")]
    pub encoding_type: String,
    pub metadata: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedPropertyPayload {
    pub name: String,
    pub description: String,
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatastreamPayload {
    pub name: String,
    pub description: String,
    #[serde(rename = "Thing")]
    pub thing: IotRef,
    #[serde(rename = "Sensor")]
    pub sensor: IotRef,
    #[serde(rename = "ObservedProperty")]
    pub observed_property: IotRef,
    #[serde(rename = "unitOfMeasurement")]
    pub unit_of_measurement: UnitOfMeasurement,
    #[serde(rename = "observationType")]
    pub observation_type: String,
    pub properties: Map<String, Value>,
}

/// Bulk observation insert for one datastream, in the store's dataArray form.
/// Each inner vec lines up with `components`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationsPayload {
    #[serde(rename = "Datastream")]
    pub datastream: IotRef,
    pub components: Vec<String>,
    #[serde(rename = "dataArray")]
    pub data_array: Vec<Vec<Value>>,
}

impl ObservationsPayload {
    pub fn len(&self) -> usize {
        self.data_array.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data_array.is_empty()
    }
}

/// Shared names, definitions and payload factories used across agencies.
pub mod vocab {
    use super::*;

    pub const ENCODING_GEOJSON: &str = "application/vnd.geo+json";
    pub const ENCODING_PDF: &str = "application/pdf";

    pub const NO_DESCRIPTION: &str = "No Description";
    pub const NO_DEFINITION: &str = "No Definition";
    pub const NO_METADATA: &str = "No Metadata";

    pub const WATER_WELL: &str = "Water Well";
    pub const WATER_WELL_DESCRIPTION: &str =
        "Well drilled or set into subsurface for the purposes of pumping water or monitoring groundwater";
    pub const WELL_LOCATION_DESCRIPTION: &str = "Location of well where measurements are made";
    pub const WATER_QUANTITY: &str = "Water Quantity";

    pub const GROUNDWATER_LEVELS: &str = "Groundwater Levels";
    // Wells carrying more than one continuous feed need distinct datastream
    // names under the same Thing.
    pub const GROUNDWATER_LEVELS_PRESSURE: &str = "Groundwater Levels(Pressure)";
    pub const GROUNDWATER_LEVELS_ACOUSTIC: &str = "Groundwater Levels(Acoustic)";
    pub const MANUAL_GROUNDWATER_LEVELS: &str = "Manual Groundwater Levels";
    pub const GWL_DESCRIPTION: &str =
        "Measurement of groundwater depth in a water well, as measured below ground surface";
    pub const DEPTH_TO_WATER: &str = "Depth to Water Below Ground Surface";

    pub const GROUNDWATER_ELEVATIONS: &str = "Groundwater Elevations";
    pub const GROUNDWATER_ELEVATION: &str = "Groundwater Elevation";
    pub const GWE_DESCRIPTION: &str = "Elevation of groundwater in feet above msl";

    pub const OM_MEASUREMENT: &str =
        "http://www.opengis.net/def/observationType/OGC-OM/2.0/OM_Measurement";

    /// Published landing-page URIs are minted from the server-assigned id.
    pub const GEOCONNEX_LOCATION_BASE: &str = "https://geoconnex.us/nmwdi/st/locations";

    pub fn geoconnex_uri(id: IotId) -> String {
        format!("{GEOCONNEX_LOCATION_BASE}/{id}")
    }

    pub fn foot() -> UnitOfMeasurement {
        UnitOfMeasurement {
            name: "Foot".to_string(),
            symbol: "ft".to_string(),
            definition: "http://www.qudt.org/vocab/unit/FT".to_string(),
        }
    }

    fn sensor(name: &str) -> SensorPayload {
        SensorPayload {
            name: name.to_string(),
            description: NO_DESCRIPTION.to_string(),
            encoding_type: ENCODING_PDF.to_string(),
            metadata: NO_METADATA.to_string(),
        }
    }

    pub fn manual_sensor() -> SensorPayload {
        sensor("Manual")
    }

    pub fn pressure_sensor() -> SensorPayload {
        let mut s = sensor("Pressure");
        s.description = "Continuous (periodic automated) measurement depth to water in Feet below \
                         ground surface (converted from pressure reading from depth below ground \
                         surface in feet). Not Provisional. Quality Controlled"
            .to_string();
        s
    }

    pub fn acoustic_sensor() -> SensorPayload {
        let mut s = sensor("Acoustic");
        s.description = "Continuous (periodic automated) measurement depth to water in Feet below \
                         ground surface (converted from acoustic device). Not Provisional. Quality \
                         Controlled"
            .to_string();
        s
    }

    pub fn hydrovu_sensor() -> SensorPayload {
        sensor("HydroVu")
    }

    pub fn onerain_sensor() -> SensorPayload {
        sensor("OneRain")
    }

    pub fn no_sensor() -> SensorPayload {
        sensor("NoSensor")
    }

    pub fn depth_to_water() -> ObservedPropertyPayload {
        ObservedPropertyPayload {
            name: DEPTH_TO_WATER.to_string(),
            description: "depth to water below ground surface".to_string(),
            definition: NO_DEFINITION.to_string(),
        }
    }

    pub fn groundwater_elevation() -> ObservedPropertyPayload {
        ObservedPropertyPayload {
            name: GROUNDWATER_ELEVATION.to_string(),
            description: GWE_DESCRIPTION.to_string(),
            definition: NO_DEFINITION.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_field_strips_table_alias() {
        assert_eq!(bare_field("MP._airbyte_raw_id"), "_airbyte_raw_id");
        assert_eq!(bare_field("OBJECTID"), "OBJECTID");
    }

    #[test]
    fn numeric_coercion_accepts_numbers_and_numeric_strings() {
        assert_eq!(coerce_f64(&serde_json::json!(10.5)), Some(10.5));
        assert_eq!(coerce_f64(&serde_json::json!("10.5")), Some(10.5));
        assert_eq!(coerce_f64(&serde_json::json!(" 7 ")), Some(7.0));
        assert_eq!(coerce_f64(&serde_json::json!("deep")), None);
        assert_eq!(coerce_f64(&Value::Null), None);
    }

    #[test]
    fn missing_value_covers_null_empty_and_sentinels() {
        assert!(is_missing_value(&Value::Null));
        assert!(is_missing_value(&serde_json::json!("")));
        assert!(is_missing_value(&serde_json::json!("  ")));
        assert!(is_missing_value(&serde_json::json!("N/A")));
        assert!(is_missing_value(&serde_json::json!("#REF!")));
        assert!(!is_missing_value(&serde_json::json!(0.0)));
        assert!(!is_missing_value(&serde_json::json!("10.5")));
    }

    #[test]
    fn group_key_prefers_numeric_coercion() {
        assert_eq!(
            GroupKey::from_value(&serde_json::json!("1002")),
            Some(GroupKey::Int(1002))
        );
        assert_eq!(
            GroupKey::from_value(&serde_json::json!(1002)),
            Some(GroupKey::Int(1002))
        );
        assert_eq!(
            GroupKey::from_value(&serde_json::json!("MG-030")),
            Some(GroupKey::Text("MG-030".to_string()))
        );
        assert_eq!(GroupKey::from_value(&Value::Null), None);
    }

    #[test]
    fn iot_ref_serializes_to_wire_shape() {
        let r: IotRef = IotId(42).into();
        assert_eq!(
            serde_json::to_value(r).unwrap(),
            serde_json::json!({"@iot.id": 42})
        );
    }

    #[test]
    fn location_point_payload_is_geojson() {
        let p = LocationPayload::point("Site-1", vocab::NO_DESCRIPTION, -104.5, 33.4, None, Map::new());
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["encodingType"], "application/vnd.geo+json");
        assert_eq!(v["location"]["type"], "Point");
        assert_eq!(v["location"]["coordinates"], serde_json::json!([-104.5, 33.4]));
    }

    #[test]
    fn job_state_defaults_and_advanced_shape() {
        let s = JobState::empty();
        assert_eq!(s.counter(), 0);
        assert_eq!(s.limit(), None);
        assert!(s.cursor("OBJECTID").is_none());

        let next = JobState::advanced("OBJECTID", serde_json::json!(105), Some(500), 3);
        assert_eq!(next.cursor("OBJECTID"), Some(&serde_json::json!(105)));
        assert_eq!(next.limit(), Some(500));
        assert_eq!(next.counter(), 3);

        let parsed: JobState =
            serde_json::from_str(r#"{"OBJECTID": 100, "limit": null, "counter": 1}"#).unwrap();
        assert_eq!(parsed.cursor("OBJECTID"), Some(&serde_json::json!(100)));
        assert_eq!(parsed.limit(), None);
        assert_eq!(parsed.counter(), 1);
    }

    #[test]
    fn geoconnex_uri_uses_server_id() {
        assert_eq!(
            vocab::geoconnex_uri(IotId(5219)),
            "https://geoconnex.us/nmwdi/st/locations/5219"
        );
    }

    #[test]
    fn sensor_factories_share_encoding_but_not_descriptions() {
        let manual = vocab::manual_sensor();
        assert_eq!(manual.name, "Manual");
        assert_eq!(manual.description, vocab::NO_DESCRIPTION);
        assert_eq!(manual.encoding_type, vocab::ENCODING_PDF);

        let pressure = vocab::pressure_sensor();
        assert_eq!(pressure.name, "Pressure");
        assert!(pressure.description.contains("pressure reading"));

        let acoustic = vocab::acoustic_sensor();
        assert_eq!(acoustic.name, "Acoustic");
        assert!(acoustic.description.contains("acoustic device"));
    }

    #[test]
    fn observed_property_factories() {
        let dtw = vocab::depth_to_water();
        assert_eq!(dtw.name, vocab::DEPTH_TO_WATER);
        assert_eq!(dtw.definition, vocab::NO_DEFINITION);

        let gwe = vocab::groundwater_elevation();
        assert_eq!(gwe.name, "Groundwater Elevation");
        assert_eq!(gwe.description, vocab::GWE_DESCRIPTION);
    }

    #[test]
    fn format_order_decides_which_parse_wins() {
        let formats = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];
        let dt = parse_with_formats("2024-03-01 08:30:00", formats).unwrap();
        assert_eq!(dt.format("%H:%M").to_string(), "08:30");
        assert!(parse_with_formats("not a time", formats).is_none());
    }

    #[test]
    fn store_times_parse_with_and_without_millis() {
        assert!(parse_store_time("2024-01-01T00:00:00Z").is_some());
        assert!(parse_store_time("2024-01-01T00:00:00.000Z").is_some());
        assert!(parse_store_time("01/01/2024").is_none());
    }

    #[test]
    fn wire_time_renders_fixed_millis() {
        let dt = parse_store_time("2024-01-01T06:30:15Z").unwrap();
        assert_eq!(format_wire_time(dt), "2024-01-01T06:30:15.000Z");
    }
}
