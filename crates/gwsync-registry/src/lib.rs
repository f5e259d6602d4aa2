//! Registered sync jobs for every upstream agency feed.
//!
//! Each section covers one feed family: the table or file it reads, how site
//! rows map onto Locations and Things, the shared Sensors and
//! ObservedProperties it provisions, and how its measurement stream is cut
//! into datastream observations. Everything in this crate is configuration;
//! the mechanics live in gwsync-engine.

use serde_json::{json, Map, Value};

use gwsync_adapters::{BlobFormat, CkanSelector, CmpOp, Filter, SourceSpec, TableQuery};
use gwsync_core::{
    coerce_f64, coerce_i64, vocab, DatastreamPayload, IotId, LocationPayload, Row, SensorPayload,
    ThingPayload,
};
use gwsync_engine::{
    CursorKind, CursorSpec, DatastreamBuilder, DatastreamPlan, DatastreamRefs, JobKind,
    LocationStrategy, ObservationSpec, ProvisionPayload, SyncJob, TimestampRule, ValueTransform,
    ISO_TIME_FORMATS, METERS_TO_FEET, WAREHOUSE_TIME_FORMATS,
};

pub const CRATE_NAME: &str = "gwsync-registry";

const BERNCO: &str = "BernCo";
const PVACD: &str = "PVACD";
const ISC_SEVEN_RIVERS: &str = "ISC_SEVEN_RIVERS";
const EBID: &str = "EBID";
const NMBGMR: &str = "NMBGMR";
const OSE: &str = "OSE";
const OSE_ROSWELL: &str = "OSE-Roswell";
const CABQ: &str = "CABQ";
const CITY_OF_ROSWELL: &str = "CityOfRoswell";
const SAN_ACACIA: &str = "SanAcaciaReach";

/// Manual basin sheets dump dates either ISO or slash-separated.
const ROSWELL_TIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y/%m/%dT%H:%M:%S"];

/// CABQ's compliance exports have changed date shape over the years; all
/// three spellings appear in the current file.
const CABQ_TIME_FORMATS: &[&str] =
    &["%Y-%m-%d %H:%M:%S", "%m/%d/%Y %H:%M:%S", "%m/%d/%Y %H:%M"];

/// Every full catalog of jobs, in registration order.
pub fn all_jobs() -> Vec<SyncJob> {
    let mut jobs = Vec::new();
    jobs.extend(bernco_hydrovu_jobs());
    jobs.extend(bernco_manual_jobs());
    jobs.extend(pecos_hydrovu_jobs());
    jobs.extend(pecos_manual_jobs());
    jobs.extend(isc_seven_rivers_jobs());
    jobs.extend(ebid_jobs());
    jobs.extend(nmbgmr_jobs());
    jobs.extend(ose_realtime_jobs());
    jobs.extend(roswell_basin_jobs(
        "roswell",
        [
            "ose-roswell-locations",
            "ose-roswell-things",
            "ose-roswell-datastreams",
            "ose-roswell-water-levels",
        ],
        "75b89cfc-f28c-4b95-b477-09272a2e47d2",
    ));
    jobs.extend(roswell_basin_jobs(
        "ftsumner",
        [
            "ose-ftsumner-locations",
            "ose-ftsumner-things",
            "ose-ftsumner-datastreams",
            "ose-ftsumner-water-levels",
        ],
        "3fa1cd2c-be33-4bba-a65b-bbc786dcbd39",
    ));
    jobs.extend(roswell_basin_jobs(
        "hondo",
        [
            "ose-hondo-locations",
            "ose-hondo-things",
            "ose-hondo-datastreams",
            "ose-hondo-water-levels",
        ],
        "ce18fbb9-296d-4b40-ba66-f81a061051ac",
    ));
    jobs.extend(cabq_jobs());
    jobs.extend(croswell_jobs());
    jobs.extend(sanacacia_jobs());
    jobs
}

pub fn job_names() -> Vec<&'static str> {
    all_jobs().iter().map(|job| job.name).collect()
}

pub fn job_for_name(name: &str) -> Option<SyncJob> {
    all_jobs().into_iter().find(|job| job.name == name)
}

// Row helpers shared by the payload builders.

fn text(row: &Row, field: &str) -> Option<String> {
    match row.get(field)? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn num(row: &Row, field: &str) -> Option<f64> {
    row.get(field).and_then(coerce_f64)
}

fn copy_value(props: &mut Map<String, Value>, row: &Row, key: &str, field: &str) {
    if let Some(value) = row.get(field) {
        props.insert(key.to_string(), value.clone());
    }
}

fn copy_fields(props: &mut Map<String, Value>, row: &Row, fields: &[&str]) {
    for field in fields {
        copy_value(props, row, field, field);
    }
}

fn agency_props(agency: &str) -> Map<String, Value> {
    let mut props = Map::new();
    props.insert("agency".to_string(), Value::from(agency));
    props
}

/// Some manual sheets transpose the coordinate columns; a negative latitude
/// over New Mexico is really the longitude.
fn fix_latlon(lat: f64, lon: f64) -> (f64, f64) {
    if lat < 0.0 {
        (lon, lat)
    } else {
        (lat, lon)
    }
}

fn water_well_thing(location: IotId, properties: Map<String, Value>) -> ThingPayload {
    ThingPayload {
        name: vocab::WATER_WELL.to_string(),
        description: vocab::WATER_WELL_DESCRIPTION.to_string(),
        properties,
        locations: vec![location.into()],
    }
}

/// All level feeds report in feet against the standard measurement type; only
/// the datastream's name, description and properties vary by feed.
fn foot_datastream(
    name: &str,
    description: &str,
    refs: DatastreamRefs,
    properties: Map<String, Value>,
) -> DatastreamPayload {
    DatastreamPayload {
        name: name.to_string(),
        description: description.to_string(),
        thing: refs.thing.into(),
        sensor: refs.sensor.into(),
        observed_property: refs.observed_property.into(),
        unit_of_measurement: vocab::foot(),
        observation_type: vocab::OM_MEASUREMENT.to_string(),
        properties,
    }
}

fn gwl_datastream(_row: &Row, refs: DatastreamRefs) -> Option<DatastreamPayload> {
    Some(foot_datastream(
        vocab::GROUNDWATER_LEVELS,
        vocab::GWL_DESCRIPTION,
        refs,
        Map::new(),
    ))
}

fn manual_gwl_datastream(_row: &Row, refs: DatastreamRefs) -> Option<DatastreamPayload> {
    Some(foot_datastream(
        vocab::MANUAL_GROUNDWATER_LEVELS,
        vocab::GWL_DESCRIPTION,
        refs,
        Map::new(),
    ))
}

fn warehouse(dataset: &str, table: &str) -> SourceSpec {
    SourceSpec::Warehouse {
        dataset: dataset.to_string(),
        table: table.to_string(),
    }
}

// HydroVu telemetry. BernCo and PVACD both run VuLink dataloggers whose
// readings land in the warehouse through the same pipeline, so the site and
// reading shapes are shared and only naming differs per agency.

fn hydrovu_site_query(dataset: &str, table: &str) -> TableQuery {
    let mut query = TableQuery::new(
        dataset,
        table,
        &["id", "name", "latitude", "longitude", "description"],
    );
    query.limit = Some(100);
    query.order_by = Some("id asc".to_string());
    query
}

fn hydrovu_readings_query(table: &str) -> TableQuery {
    let mut query = TableQuery::new(
        "nmwdi",
        table,
        &[
            "value",
            "unitId",
            "timestamp",
            "locationId",
            "parameterId",
            "customParameter",
            "_airbyte_extracted_at",
        ],
    );
    query.limit = Some(500);
    // parameterId 4 is depth to water; the tables also carry temperature and
    // battery channels.
    query.filter = Some(Filter::Cmp {
        field: "parameterId".to_string(),
        op: CmpOp::Eq,
        value: Value::from(4),
    });
    query.order_by = Some("_airbyte_extracted_at asc".to_string());
    query
}

fn hydrovu_observation_spec() -> ObservationSpec {
    ObservationSpec {
        group_field: "locationId",
        timestamp_field: "timestamp",
        value_field: "value",
        timestamp_rule: TimestampRule::EpochSeconds,
        // unitId 35 is meters; everything else already reports feet.
        transform: ValueTransform::ScaleWhen {
            field: "unitId",
            equals: 35,
            factor: METERS_TO_FEET,
        },
        thing_name: vocab::WATER_WELL,
        datastream_name: vocab::GROUNDWATER_LEVELS,
        parameter_fields: &[],
    }
}

fn hydrovu_location(row: &Row, agency: &'static str) -> Option<LocationPayload> {
    let name = text(row, "name")?;
    let lat = num(row, "latitude")?;
    let lon = num(row, "longitude")?;
    let mut props = agency_props(agency);
    copy_value(&mut props, row, "source_id", "id");
    copy_value(&mut props, row, "hydrovu.description", "description");
    Some(LocationPayload::point(
        name,
        vocab::WELL_LOCATION_DESCRIPTION,
        lon,
        lat,
        None,
        props,
    ))
}

fn hydrovu_thing(row: &Row, location: IotId, agency: &'static str) -> Option<ThingPayload> {
    let mut props = agency_props(agency);
    copy_value(&mut props, row, "source_id", "id");
    Some(water_well_thing(location, props))
}

fn bernco_location(row: &Row) -> Option<LocationPayload> {
    hydrovu_location(row, BERNCO)
}

fn bernco_thing(row: &Row, location: IotId) -> Option<ThingPayload> {
    hydrovu_thing(row, location, BERNCO)
}

fn bernco_hydrovu_jobs() -> Vec<SyncJob> {
    let source = warehouse("nmwdi", "bernco_locations");
    let sites = hydrovu_site_query("nmwdi", "bernco_locations");
    let by_name = LocationStrategy::Name {
        field: "name",
        with_agency: false,
    };

    let mut locations = SyncJob::new(
        "bernco-hydrovu-locations",
        BERNCO,
        JobKind::Locations,
        source.clone(),
        sites.clone(),
        by_name,
    );
    locations.geoconnex = true;
    locations.location_builder = Some(bernco_location);

    let mut things = SyncJob::new(
        "bernco-hydrovu-things",
        BERNCO,
        JobKind::Things,
        source.clone(),
        sites.clone(),
        by_name,
    );
    things.thing_builder = Some(bernco_thing);

    let mut datastreams = SyncJob::new(
        "bernco-hydrovu-waterlevel-datastreams",
        BERNCO,
        JobKind::Datastreams,
        source,
        sites,
        LocationStrategy::Name {
            field: "name",
            with_agency: true,
        },
    );
    datastreams.datastream_builder = Some(gwl_datastream);
    datastreams.datastream_plan = Some(DatastreamPlan {
        thing_name: vocab::WATER_WELL,
        sensor_name: "HydroVu",
        observed_property_name: vocab::DEPTH_TO_WATER,
    });
    datastreams.provision = vec![
        ProvisionPayload::Sensor(vocab::hydrovu_sensor()),
        ProvisionPayload::ObservedProperty(vocab::depth_to_water()),
    ];

    let mut observations = SyncJob::new(
        "bernco-hydrovu-water-levels",
        BERNCO,
        JobKind::Observations,
        warehouse("nmwdi", "bernco_readings"),
        hydrovu_readings_query("bernco_readings"),
        LocationStrategy::SourceId { field: "locationId" },
    );
    observations.cursor = Some(CursorSpec {
        field: "_airbyte_extracted_at",
        kind: CursorKind::Timestamp {
            formats: ISO_TIME_FORMATS,
            op: CmpOp::Ge,
        },
    });
    observations.observations = Some(hydrovu_observation_spec());

    vec![locations, things, datastreams, observations]
}

// BernCo's manual program: wells surveyed in ArcGIS, tape-down measurements
// keyed by well UUID. Depths are read at the measuring point, so the casing
// stickup carried on the Thing is subtracted to get below ground surface.

fn bernco_well_location(row: &Row) -> Option<LocationPayload> {
    let name = text(row, "name")?;
    let lat = num(row, "latitude")?;
    let lon = num(row, "longitude")?;
    let mut props = agency_props(BERNCO);
    copy_value(&mut props, row, "source_id", "well_uuid");
    copy_value(&mut props, row, "nmbgmr_id", "point_id");
    copy_value(&mut props, row, "ose_permit", "ose_permit");
    Some(LocationPayload::point(
        name,
        vocab::WELL_LOCATION_DESCRIPTION,
        lon,
        lat,
        None,
        props,
    ))
}

fn bernco_well_thing(row: &Row, location: IotId) -> Option<ThingPayload> {
    let mut props = agency_props(BERNCO);
    copy_fields(
        &mut props,
        row,
        &[
            "ose_permit",
            "well_uuid",
            "aquifer_code",
            "casing_stickup",
            "screen_interval",
            "well_depth",
        ],
    );
    copy_value(&mut props, row, "nmbgmr_id", "point_id");
    Some(water_well_thing(location, props))
}

fn bernco_manual_jobs() -> Vec<SyncJob> {
    let source = warehouse("nmwdi", "bernco_arcgis_wells");
    let mut sites = TableQuery::new(
        "nmwdi",
        "bernco_arcgis_wells",
        &[
            "name",
            "latitude",
            "longitude",
            "point_id",
            "ose_permit",
            "well_depth",
            "aquifer_code",
            "casing_stickup",
            "screen_interval",
            "well_uuid",
            "objectid",
        ],
    );
    sites.limit = Some(500);
    sites.order_by = Some("objectid asc".to_string());
    let site_cursor = CursorSpec {
        field: "objectid",
        kind: CursorKind::Numeric,
    };
    let by_name = LocationStrategy::Name {
        field: "name",
        with_agency: false,
    };

    let mut locations = SyncJob::new(
        "bernco-manual-locations",
        BERNCO,
        JobKind::Locations,
        source.clone(),
        sites.clone(),
        by_name,
    );
    locations.geoconnex = true;
    locations.cursor = Some(site_cursor);
    locations.location_builder = Some(bernco_well_location);

    let mut things = SyncJob::new(
        "bernco-manual-things",
        BERNCO,
        JobKind::Things,
        source.clone(),
        sites.clone(),
        by_name,
    );
    things.cursor = Some(site_cursor);
    things.thing_builder = Some(bernco_well_thing);

    let mut datastreams = SyncJob::new(
        "bernco-manual-waterlevel-datastreams",
        BERNCO,
        JobKind::Datastreams,
        source,
        sites,
        LocationStrategy::Name {
            field: "name",
            with_agency: true,
        },
    );
    datastreams.cursor = Some(site_cursor);
    datastreams.datastream_builder = Some(manual_gwl_datastream);
    datastreams.datastream_plan = Some(DatastreamPlan {
        thing_name: vocab::WATER_WELL,
        sensor_name: "Manual",
        observed_property_name: vocab::DEPTH_TO_WATER,
    });
    datastreams.provision = vec![
        ProvisionPayload::Sensor(vocab::manual_sensor()),
        ProvisionPayload::ObservedProperty(vocab::depth_to_water()),
    ];

    let mut readings = TableQuery::new(
        "nmwdi",
        "bernco_arcgis_manual_waterlevels",
        &[
            "id",
            "well_uuid",
            "measurement_date",
            "measurement_method",
            "depth_to_water_at_measurement_point",
        ],
    );
    readings.alias = Some("data".to_string());
    readings.limit = Some(500);
    readings.order_by = Some("id asc".to_string());
    let mut observations = SyncJob::new(
        "bernco-manual-water-levels",
        BERNCO,
        JobKind::Observations,
        warehouse("nmwdi", "bernco_arcgis_manual_waterlevels"),
        readings,
        LocationStrategy::SourceId { field: "well_uuid" },
    );
    observations.cursor = Some(CursorSpec {
        field: "id",
        kind: CursorKind::Numeric,
    });
    observations.observations = Some(ObservationSpec {
        group_field: "well_uuid",
        timestamp_field: "measurement_date",
        value_field: "depth_to_water_at_measurement_point",
        timestamp_rule: TimestampRule::EpochMillis,
        transform: ValueTransform::OffsetByThingProperty {
            property: "casing_stickup",
        },
        thing_name: vocab::WATER_WELL,
        datastream_name: vocab::MANUAL_GROUNDWATER_LEVELS,
        parameter_fields: &["measurement_method"],
    });

    vec![locations, things, datastreams, observations]
}

// PVACD's Pecos valley wells, continuous feed. Site names carry a "level"
// suffix in the source table that is stripped for display, suffix only, so a
// stripped name can keep its trailing space.

const PECOS_NAME_STRIP: &[(&str, &str)] = &[("level", ""), ("Level", "")];

fn pecos_clean(name: &str) -> String {
    let mut name = name.to_string();
    for (from, to) in PECOS_NAME_STRIP {
        name = name.replace(from, to);
    }
    name
}

fn pecos_location(row: &Row) -> Option<LocationPayload> {
    let mut payload = hydrovu_location(row, PVACD)?;
    payload.name = pecos_clean(&payload.name);
    Some(payload)
}

fn pecos_thing(row: &Row, location: IotId) -> Option<ThingPayload> {
    hydrovu_thing(row, location, PVACD)
}

fn pecos_hydrovu_jobs() -> Vec<SyncJob> {
    let source = warehouse("locations", "pecos_locations");
    let mut sites = hydrovu_site_query("locations", "pecos_locations");
    // The locations table mixes wells with met stations; only the level
    // sites belong to this program.
    sites.filter = Some(Filter::Raw("LOWER(name) like '%level%'".to_string()));
    let cleaned = LocationStrategy::CleanedName {
        field: "name",
        replace: PECOS_NAME_STRIP,
        with_agency: false,
    };

    let mut locations = SyncJob::new(
        "pecos-hydrovu-locations",
        PVACD,
        JobKind::Locations,
        source.clone(),
        sites.clone(),
        cleaned,
    );
    locations.geoconnex = true;
    locations.location_builder = Some(pecos_location);

    let mut things = SyncJob::new(
        "pecos-hydrovu-things",
        PVACD,
        JobKind::Things,
        source.clone(),
        sites.clone(),
        cleaned,
    );
    things.thing_builder = Some(pecos_thing);

    let mut datastreams = SyncJob::new(
        "pecos-hydrovu-waterlevel-datastreams",
        PVACD,
        JobKind::Datastreams,
        source,
        sites,
        LocationStrategy::CleanedName {
            field: "name",
            replace: PECOS_NAME_STRIP,
            with_agency: true,
        },
    );
    datastreams.datastream_builder = Some(gwl_datastream);
    datastreams.datastream_plan = Some(DatastreamPlan {
        thing_name: vocab::WATER_WELL,
        sensor_name: "HydroVu",
        observed_property_name: vocab::DEPTH_TO_WATER,
    });
    datastreams.provision = vec![
        ProvisionPayload::Sensor(vocab::hydrovu_sensor()),
        ProvisionPayload::ObservedProperty(vocab::depth_to_water()),
    ];

    let mut observations = SyncJob::new(
        "pecos-hydrovu-water-levels",
        PVACD,
        JobKind::Observations,
        warehouse("nmwdi", "pecos_readings"),
        hydrovu_readings_query("pecos_readings"),
        LocationStrategy::SourceId { field: "locationId" },
    );
    observations.cursor = Some(CursorSpec {
        field: "_airbyte_extracted_at",
        kind: CursorKind::Timestamp {
            formats: ISO_TIME_FORMATS,
            op: CmpOp::Ge,
        },
    });
    observations.observations = Some(hydrovu_observation_spec());

    vec![locations, things, datastreams, observations]
}

// PVACD's meter-manager tape downs. The measurement feed only carries well
// ids, so both jobs resolve sites through a static id-to-name table.

const PECOS_WELL_NAMES: &[(&str, &str)] = &[
    ("1515", "Poe Corn Level"),
    ("1516", "Transwestern Level"),
    ("1517", "Berrendo-Smith level"),
    ("1518", "LFD Level"),
    ("1519", "Orchard Park Level"),
    ("1520", "Greenfield level"),
    ("1521", "Bartlett level"),
    ("1522", "Cottonwood level"),
    ("1523", "Zumwalt level"),
    ("1524", "Artesia A Level"),
];

fn pecos_manual_jobs() -> Vec<SyncJob> {
    let mut wells = TableQuery::new("nmwdi", "pvacdmetermanager_Wells", &["id", "name", "osetag"]);
    wells.filter = Some(Filter::Raw(
        "id in (1524, 1521, 1517, 1522, 1520, 1518, 1519, 1515, 1516, 1523)".to_string(),
    ));
    let mut datastreams = SyncJob::new(
        "pecos-manual-waterlevel-datastreams",
        PVACD,
        JobKind::Datastreams,
        warehouse("nmwdi", "pvacdmetermanager_Wells"),
        wells,
        LocationStrategy::MappedName {
            field: "id",
            names: PECOS_WELL_NAMES,
            with_agency: true,
        },
    );
    datastreams.datastream_builder = Some(manual_gwl_datastream);
    datastreams.datastream_plan = Some(DatastreamPlan {
        thing_name: vocab::WATER_WELL,
        sensor_name: "Manual",
        observed_property_name: vocab::DEPTH_TO_WATER,
    });
    datastreams.provision = vec![
        ProvisionPayload::Sensor(vocab::manual_sensor()),
        ProvisionPayload::ObservedProperty(vocab::depth_to_water()),
    ];

    let mut measurements = TableQuery::new(
        "nmwdi",
        "pvacdmetermanager_WellMeasurements",
        &["_airbyte_extracted_at", "id", "value", "unit_id", "well_id", "timestamp"],
    );
    measurements.limit = Some(500);
    measurements.order_by = Some("_airbyte_extracted_at asc".to_string());
    let mut observations = SyncJob::new(
        "pecos-manual-waterlevel-observations",
        PVACD,
        JobKind::Observations,
        warehouse("nmwdi", "pvacdmetermanager_WellMeasurements"),
        measurements,
        LocationStrategy::MappedName {
            field: "well_id",
            names: PECOS_WELL_NAMES,
            with_agency: true,
        },
    );
    observations.cursor = Some(CursorSpec {
        field: "_airbyte_extracted_at",
        kind: CursorKind::Timestamp {
            formats: ISO_TIME_FORMATS,
            op: CmpOp::Ge,
        },
    });
    observations.observations = Some(ObservationSpec {
        group_field: "well_id",
        timestamp_field: "timestamp",
        value_field: "value",
        timestamp_rule: TimestampRule::Formats(ISO_TIME_FORMATS),
        // unit_id 7 is meters.
        transform: ValueTransform::ScaleWhen {
            field: "unit_id",
            equals: 7,
            factor: METERS_TO_FEET,
        },
        thing_name: vocab::WATER_WELL,
        datastream_name: vocab::MANUAL_GROUNDWATER_LEVELS,
        parameter_fields: &[],
    });

    vec![datastreams, observations]
}

// ISC Seven Rivers monitoring points along the Pecos. The upstream API has
// no sensor metadata at all, hence the NoSensor placeholder.

const ISC_SOURCE_API: &str = "https://nmisc-wf.gladata.com/api/getMonitoringPoints.ashx";

fn isc_location(row: &Row) -> Option<LocationPayload> {
    let name = text(row, "name")?;
    let lat = num(row, "latitude")?;
    let lon = num(row, "longitude")?;
    let description = text(row, "comments").unwrap_or_else(|| vocab::NO_DESCRIPTION.to_string());
    let mut props = agency_props(ISC_SEVEN_RIVERS);
    copy_value(&mut props, row, "source_id", "id");
    props.insert("source_api".to_string(), Value::from(ISC_SOURCE_API));
    copy_value(
        &mut props,
        row,
        "groundSurfaceElevationFeet",
        "groundSurfaceElevationFeet",
    );
    Some(LocationPayload::point(name, description, lon, lat, None, props))
}

fn isc_thing(row: &Row, location: IotId) -> Option<ThingPayload> {
    let mut props = Map::new();
    copy_value(&mut props, row, "type", "type");
    Some(ThingPayload {
        name: vocab::WATER_WELL.to_string(),
        description: vocab::NO_DESCRIPTION.to_string(),
        properties: props,
        locations: vec![location.into()],
    })
}

fn isc_seven_rivers_jobs() -> Vec<SyncJob> {
    let source = warehouse("locations", "isc_seven_rivers_monitoring_points");
    let sites = TableQuery::new(
        "locations",
        "isc_seven_rivers_monitoring_points",
        &["id", "name", "type", "comments", "latitude", "longitude", "groundSurfaceElevationFeet"],
    );
    let by_name = LocationStrategy::Name {
        field: "name",
        with_agency: false,
    };

    let mut locations = SyncJob::new(
        "isc-seven-rivers-locations",
        ISC_SEVEN_RIVERS,
        JobKind::Locations,
        source.clone(),
        sites.clone(),
        by_name,
    );
    locations.geoconnex = true;
    locations.location_builder = Some(isc_location);

    let mut things = SyncJob::new(
        "isc-seven-rivers-things",
        ISC_SEVEN_RIVERS,
        JobKind::Things,
        source.clone(),
        sites.clone(),
        by_name,
    );
    things.thing_builder = Some(isc_thing);

    let mut datastreams = SyncJob::new(
        "isc-seven-rivers-datastreams",
        ISC_SEVEN_RIVERS,
        JobKind::Datastreams,
        source,
        sites,
        LocationStrategy::Name {
            field: "name",
            with_agency: true,
        },
    );
    datastreams.datastream_builder = Some(gwl_datastream);
    datastreams.datastream_plan = Some(DatastreamPlan {
        thing_name: vocab::WATER_WELL,
        sensor_name: "NoSensor",
        observed_property_name: vocab::DEPTH_TO_WATER,
    });
    datastreams.provision = vec![
        ProvisionPayload::Sensor(vocab::no_sensor()),
        ProvisionPayload::ObservedProperty(vocab::depth_to_water()),
    ];

    let mut levels = TableQuery::new(
        "levels",
        "isc_seven_rivers_water_levels",
        &["id", "monitoring_point_id", "dateTime", "depthToWaterFeet"],
    );
    levels.limit = Some(500);
    levels.order_by = Some("id asc".to_string());
    let mut observations = SyncJob::new(
        "isc-seven-rivers-water-levels",
        ISC_SEVEN_RIVERS,
        JobKind::Observations,
        warehouse("levels", "isc_seven_rivers_water_levels"),
        levels,
        LocationStrategy::SourceId {
            field: "monitoring_point_id",
        },
    );
    observations.cursor = Some(CursorSpec {
        field: "id",
        kind: CursorKind::Numeric,
    });
    observations.observations = Some(ObservationSpec {
        group_field: "monitoring_point_id",
        timestamp_field: "dateTime",
        value_field: "depthToWaterFeet",
        timestamp_rule: TimestampRule::EpochMillis,
        transform: ValueTransform::Identity,
        thing_name: vocab::WATER_WELL,
        datastream_name: vocab::GROUNDWATER_LEVELS,
        parameter_fields: &[],
    });

    vec![locations, things, datastreams, observations]
}

// EBID's OneRain network. The site export joins sensor metadata so the query
// can keep only depth-to-water stations; transducer values come back positive
// and are negated to read as depth below ground.

fn ebid_site_query() -> TableQuery {
    let mut query = TableQuery::new(
        "nmwdi",
        "ebid_get_site_meta_data",
        &[
            "site.site_id",
            "site.location",
            "client_id",
            "system_id",
            "site.or_site_id",
            "cast(elevation as FLOAT64) as elevation",
            "cast(latitude_dec as FLOAT64) as latitude_dec",
            "cast(longitude_dec as FLOAT64) as longitude_dec",
            "(cast(reference as FLOAT64)/3.28084) as reference",
        ],
    );
    query.alias = Some("site".to_string());
    query.join = Some(
        "join nmwdi.ebid_get_sensor_meta_data as s on site.or_site_id = s.or_site_id".to_string(),
    );
    // sensor_class 102 is depth to water.
    query.filter = Some(Filter::Raw("sensor_class = 102".to_string()));
    query.limit = Some(100);
    query.order_by = Some("or_site_id asc".to_string());
    query
}

fn ebid_location(row: &Row) -> Option<LocationPayload> {
    let name = text(row, "site_id")?.to_uppercase();
    let lat = num(row, "latitude_dec")?;
    let lon = num(row, "longitude_dec")?;
    let elevation = num(row, "reference");
    let mut props = Map::new();
    copy_fields(
        &mut props,
        row,
        &["site_id", "location", "elevation", "or_site_id", "latitude_dec", "longitude_dec"],
    );
    props.insert("agency".to_string(), Value::from(EBID));
    copy_value(&mut props, row, "source_id", "site_id");
    Some(LocationPayload::point(
        name,
        vocab::WELL_LOCATION_DESCRIPTION,
        lon,
        lat,
        elevation,
        props,
    ))
}

fn ebid_thing(row: &Row, location: IotId) -> Option<ThingPayload> {
    if !text(row, "location")?.contains("Well") {
        return None;
    }
    Some(water_well_thing(location, agency_props(EBID)))
}

fn ebid_datastream(row: &Row, refs: DatastreamRefs) -> Option<DatastreamPayload> {
    if !text(row, "location")?.contains("Well") {
        return None;
    }
    gwl_datastream(row, refs)
}

fn ebid_jobs() -> Vec<SyncJob> {
    let source = warehouse("nmwdi", "ebid_get_site_meta_data");
    let sites = ebid_site_query();
    let uppercased = LocationStrategy::UppercasedName {
        field: "site_id",
        with_agency: false,
    };

    let mut locations = SyncJob::new(
        "ebid-well-locations",
        EBID,
        JobKind::Locations,
        source.clone(),
        sites.clone(),
        uppercased,
    );
    locations.geoconnex = true;
    locations.location_builder = Some(ebid_location);

    let mut things = SyncJob::new(
        "ebid-well-things",
        EBID,
        JobKind::Things,
        source.clone(),
        sites.clone(),
        uppercased,
    );
    things.thing_builder = Some(ebid_thing);

    let mut datastreams = SyncJob::new(
        "ebid-well-datastreams",
        EBID,
        JobKind::Datastreams,
        source,
        sites,
        uppercased,
    );
    datastreams.datastream_builder = Some(ebid_datastream);
    datastreams.datastream_plan = Some(DatastreamPlan {
        thing_name: vocab::WATER_WELL,
        sensor_name: "OneRain",
        observed_property_name: vocab::DEPTH_TO_WATER,
    });
    datastreams.provision = vec![
        ProvisionPayload::Sensor(vocab::onerain_sensor()),
        ProvisionPayload::ObservedProperty(vocab::depth_to_water()),
    ];

    let mut readings = TableQuery::new(
        "nmwdi",
        "ebid_get_sensor_data",
        &["data_time", "or_sensor_id", "data_value", "or_site_id"],
    );
    readings.alias = Some("data".to_string());
    readings.limit = Some(500);
    // or_sensor_id 4 is the water level channel.
    readings.filter = Some(Filter::Cmp {
        field: "or_sensor_id".to_string(),
        op: CmpOp::Eq,
        value: Value::from(4),
    });
    readings.order_by = Some("data_time asc".to_string());
    let mut observations = SyncJob::new(
        "ebid-waterlevels",
        EBID,
        JobKind::Observations,
        warehouse("nmwdi", "ebid_get_sensor_data"),
        readings,
        LocationStrategy::Property {
            property: "or_site_id",
            field: "or_site_id",
        },
    );
    observations.cursor = Some(CursorSpec {
        field: "data_time",
        kind: CursorKind::Timestamp {
            formats: WAREHOUSE_TIME_FORMATS,
            op: CmpOp::Gt,
        },
    });
    observations.observations = Some(ObservationSpec {
        group_field: "or_site_id",
        timestamp_field: "data_time",
        value_field: "data_value",
        timestamp_rule: TimestampRule::Formats(WAREHOUSE_TIME_FORMATS),
        transform: ValueTransform::Negate,
        thing_name: vocab::WATER_WELL,
        datastream_name: vocab::GROUNDWATER_LEVELS,
        parameter_fields: &[],
    });

    vec![locations, things, datastreams, observations]
}

// NMBGMR's statewide network, one table per collection method. Sites are
// managed elsewhere; these jobs attach datastreams and observations to wells
// that already exist under the NMBGMR agency. Each method gets its own
// datastream name so a well carrying several feeds stays unambiguous.

const OBJECTID_CURSOR: CursorSpec = CursorSpec {
    field: "OBJECTID",
    kind: CursorKind::Numeric,
};

fn nmbgmr_feed_props(row: &Row) -> Map<String, Value> {
    let mut props = Map::new();
    copy_fields(&mut props, row, &["MeasuringAgency", "DataSource"]);
    props.insert("agency".to_string(), Value::from(NMBGMR));
    props.insert("topic".to_string(), Value::from(vocab::WATER_QUANTITY));
    props
}

fn nmbgmr_pressure_datastream(row: &Row, refs: DatastreamRefs) -> Option<DatastreamPayload> {
    Some(foot_datastream(
        vocab::GROUNDWATER_LEVELS_PRESSURE,
        vocab::GWL_DESCRIPTION,
        refs,
        nmbgmr_feed_props(row),
    ))
}

fn nmbgmr_acoustic_datastream(row: &Row, refs: DatastreamRefs) -> Option<DatastreamPayload> {
    Some(foot_datastream(
        vocab::GROUNDWATER_LEVELS_ACOUSTIC,
        vocab::GWL_DESCRIPTION,
        refs,
        nmbgmr_feed_props(row),
    ))
}

fn nmbgmr_datastream_job(
    name: &'static str,
    table: &'static str,
    fields: &[&str],
    sensor: SensorPayload,
    sensor_name: &'static str,
    builder: DatastreamBuilder,
) -> SyncJob {
    let mut query = TableQuery::new("levels", table, fields);
    query.limit = Some(500);
    query.order_by = Some("OBJECTID asc".to_string());
    let mut job = SyncJob::new(
        name,
        NMBGMR,
        JobKind::Datastreams,
        warehouse("levels", table),
        query,
        LocationStrategy::Name {
            field: "PointID",
            with_agency: true,
        },
    );
    job.cursor = Some(OBJECTID_CURSOR);
    // The level tables hold one row per measurement; one well, one stream.
    job.distinct_on = Some("PointID");
    job.datastream_builder = Some(builder);
    job.datastream_plan = Some(DatastreamPlan {
        thing_name: vocab::WATER_WELL,
        sensor_name,
        observed_property_name: vocab::DEPTH_TO_WATER,
    });
    job.provision = vec![
        ProvisionPayload::Sensor(sensor),
        ProvisionPayload::ObservedProperty(vocab::depth_to_water()),
    ];
    job
}

fn nmbgmr_observation_job(
    name: &'static str,
    table: &'static str,
    datastream_name: &'static str,
) -> SyncJob {
    let mut query = TableQuery::new(
        "levels",
        table,
        &[
            "OBJECTID",
            "PointID",
            "MeasuringAgency",
            "MeasurementMethod",
            "DataSource",
            "DateTimeMeasured",
            "DepthToWaterBGS",
        ],
    );
    query.limit = Some(500);
    query.order_by = Some("OBJECTID asc".to_string());
    let mut job = SyncJob::new(
        name,
        NMBGMR,
        JobKind::Observations,
        warehouse("levels", table),
        query,
        LocationStrategy::Name {
            field: "PointID",
            with_agency: false,
        },
    );
    job.cursor = Some(OBJECTID_CURSOR);
    job.observations = Some(ObservationSpec {
        group_field: "PointID",
        timestamp_field: "DateTimeMeasured",
        value_field: "DepthToWaterBGS",
        timestamp_rule: TimestampRule::Formats(ISO_TIME_FORMATS),
        transform: ValueTransform::Identity,
        thing_name: vocab::WATER_WELL,
        datastream_name,
        parameter_fields: &[],
    });
    job
}

fn nmbgmr_jobs() -> Vec<SyncJob> {
    vec![
        nmbgmr_datastream_job(
            "nmbgmr-manual-waterlevel-datastreams",
            "nmbgmr_manual_gwl",
            &[
                "OBJECTID",
                "PointID",
                "MeasuringAgency",
                "MeasurementMethod",
                "LevelStatus",
                "DataSource",
                "DataQuality",
            ],
            vocab::manual_sensor(),
            "Manual",
            gwl_datastream,
        ),
        nmbgmr_observation_job(
            "nmbgmr-manual-waterlevel-observations",
            "nmbgmr_manual_gwl",
            vocab::GROUNDWATER_LEVELS,
        ),
        nmbgmr_datastream_job(
            "nmbgmr-pressure-waterlevel-datastreams",
            "pressure_gwl",
            &["OBJECTID", "PointID", "MeasuringAgency", "MeasurementMethod", "DataSource"],
            vocab::pressure_sensor(),
            "Pressure",
            nmbgmr_pressure_datastream,
        ),
        nmbgmr_observation_job(
            "nmbgmr-pressure-waterlevel-observations",
            "pressure_gwl",
            vocab::GROUNDWATER_LEVELS_PRESSURE,
        ),
        nmbgmr_datastream_job(
            "nmbgmr-acoustic-waterlevel-datastreams",
            "acoustic_gwl",
            &["OBJECTID", "PointID", "MeasuringAgency", "MeasurementMethod", "DataSource"],
            vocab::acoustic_sensor(),
            "Acoustic",
            nmbgmr_acoustic_datastream,
        ),
        nmbgmr_observation_job(
            "nmbgmr-acoustic-waterlevel-observations",
            "acoustic_gwl",
            vocab::GROUNDWATER_LEVELS_ACOUSTIC,
        ),
    ]
}

// OSE real-time metering stations, published as a GeoJSON layer. Stations
// are named by their zero-padded gauge number; measurement feeds are not
// wired up yet, so only the site entities sync.

const OSE_STATION_DESCRIPTION: &str =
    "Location of station where real time measurements are made";

const OSE_LOCATION_ATTRS: &[&str] = &[
    "Ditch_Name",
    "River_src",
    "Field_ID",
    "Op_Initial",
    "OSE_File",
    "POD_nbr",
    "Comments",
    "Basin",
    "Station_ID",
    "Gauge_name",
    "Number_",
    "Suffix",
    "Jurisdiction",
    "data_url",
    "Photo_ID",
    "Edit_Date",
    "Photos",
    "SW_or_GW",
];

const OSE_STATION_ATTRS: &[&str] = &[
    "Comments",
    "Station_ID",
    "Gauge_name",
    "data_url",
    "SW_or_GW",
    "Meter_type",
    "Meter_status",
];

fn ose_station_name(row: &Row) -> Option<String> {
    let station = num(row, "Station_ID")? as i64;
    if station == 0 {
        return None;
    }
    Some(format!("{station:04}"))
}

fn ose_realtime_location(row: &Row) -> Option<LocationPayload> {
    let name = ose_station_name(row)?;
    let lat = num(row, "lat_ddd")?;
    let lon = num(row, "long_ddd")?;
    let mut props = Map::new();
    copy_fields(&mut props, row, OSE_LOCATION_ATTRS);
    props.insert("agency".to_string(), Value::from(OSE));
    copy_value(&mut props, row, "source_id", "OBJECTID");
    Some(LocationPayload::point(name, OSE_STATION_DESCRIPTION, lon, lat, None, props))
}

fn ose_realtime_thing(row: &Row, location: IotId) -> Option<ThingPayload> {
    let mut props = Map::new();
    copy_fields(&mut props, row, OSE_STATION_ATTRS);
    props.insert("agency".to_string(), Value::from(OSE));
    copy_value(&mut props, row, "source_id", "OBJECTID");
    Some(ThingPayload {
        name: "OSE Realtime Station".to_string(),
        description: "OSE Realtime Station".to_string(),
        properties: props,
        locations: vec![location.into()],
    })
}

fn ose_realtime_jobs() -> Vec<SyncJob> {
    let source = SourceSpec::Bucket {
        bucket: "waterdatainitiative".to_string(),
        blob: "ose_rt_locations.geojson".to_string(),
        format: BlobFormat::GeoJson,
    };
    let query = TableQuery::new("waterdatainitiative", "ose_rt_locations", &[]);
    let padded = LocationStrategy::PaddedName {
        field: "Station_ID",
        width: 4,
    };

    let mut locations = SyncJob::new(
        "ose-realtime-locations",
        OSE,
        JobKind::Locations,
        source.clone(),
        query.clone(),
        padded,
    );
    locations.geoconnex = true;
    locations.location_builder = Some(ose_realtime_location);

    let mut things = SyncJob::new(
        "ose-realtime-things",
        OSE,
        JobKind::Things,
        source,
        query,
        padded,
    );
    things.thing_builder = Some(ose_realtime_thing);

    vec![locations, things]
}

// OSE's Roswell district manual campaigns: one CKAN sheet per basin, each a
// running log of tape downs. Site rows repeat per measurement, so the entity
// jobs collapse to the first row per site before mapping.

fn roswell_basin_location(row: &Row) -> Option<LocationPayload> {
    let name = text(row, "site_id")?;
    let lat = num(row, "dd_lat")?;
    let lon = num(row, "dd_lon")?;
    let (lat, lon) = fix_latlon(lat, lon);
    let mut props = agency_props(OSE_ROSWELL);
    copy_value(&mut props, row, "basin", "basin");
    Some(LocationPayload::point(name, vocab::NO_DESCRIPTION, lon, lat, None, props))
}

fn roswell_basin_thing(_row: &Row, location: IotId) -> Option<ThingPayload> {
    Some(ThingPayload {
        name: vocab::WATER_WELL.to_string(),
        description: vocab::NO_DESCRIPTION.to_string(),
        properties: agency_props(OSE_ROSWELL),
        locations: vec![location.into()],
    })
}

fn roswell_basin_datastream(_row: &Row, refs: DatastreamRefs) -> Option<DatastreamPayload> {
    let mut props = agency_props(OSE_ROSWELL);
    props.insert("topic".to_string(), Value::from(vocab::WATER_QUANTITY));
    props.insert("is_continuous".to_string(), Value::from(false));
    props.insert("is_provisional".to_string(), Value::from(false));
    props.insert("collection_type".to_string(), Value::from("manual"));
    Some(foot_datastream(
        vocab::MANUAL_GROUNDWATER_LEVELS,
        vocab::GWL_DESCRIPTION,
        refs,
        props,
    ))
}

fn roswell_basin_jobs(
    basin: &'static str,
    names: [&'static str; 4],
    resource_id: &str,
) -> Vec<SyncJob> {
    let [locations_name, things_name, datastreams_name, observations_name] = names;
    let source = SourceSpec::Ckan(CkanSelector::Resource {
        resource_id: resource_id.to_string(),
    });
    let query = TableQuery::new("ckan", basin, &[]);
    let by_site = LocationStrategy::Name {
        field: "site_id",
        with_agency: false,
    };

    let mut locations = SyncJob::new(
        locations_name,
        OSE_ROSWELL,
        JobKind::Locations,
        source.clone(),
        query.clone(),
        by_site,
    );
    locations.distinct_on = Some("site_id");
    locations.location_builder = Some(roswell_basin_location);

    let mut things = SyncJob::new(
        things_name,
        OSE_ROSWELL,
        JobKind::Things,
        source.clone(),
        query.clone(),
        by_site,
    );
    things.distinct_on = Some("site_id");
    things.thing_builder = Some(roswell_basin_thing);

    let mut datastreams = SyncJob::new(
        datastreams_name,
        OSE_ROSWELL,
        JobKind::Datastreams,
        source.clone(),
        query.clone(),
        LocationStrategy::Name {
            field: "site_id",
            with_agency: true,
        },
    );
    datastreams.distinct_on = Some("site_id");
    datastreams.datastream_builder = Some(roswell_basin_datastream);
    datastreams.datastream_plan = Some(DatastreamPlan {
        thing_name: vocab::WATER_WELL,
        sensor_name: "Manual",
        observed_property_name: vocab::DEPTH_TO_WATER,
    });
    datastreams.provision = vec![
        ProvisionPayload::Sensor(vocab::manual_sensor()),
        ProvisionPayload::ObservedProperty(vocab::depth_to_water()),
    ];

    let mut observations = SyncJob::new(
        observations_name,
        OSE_ROSWELL,
        JobKind::Observations,
        source,
        query,
        by_site,
    );
    observations.observations = Some(ObservationSpec {
        group_field: "site_id",
        timestamp_field: "date",
        value_field: "dtwgs",
        timestamp_rule: TimestampRule::Formats(ROSWELL_TIME_FORMATS),
        transform: ValueTransform::Identity,
        thing_name: vocab::WATER_WELL,
        datastream_name: vocab::MANUAL_GROUNDWATER_LEVELS,
        parameter_fields: &[],
    });

    vec![locations, things, datastreams, observations]
}

// CABQ compliance wells. One tab-separated export carries both site metadata
// and the measurement log; depth and elevation land in sibling datastreams
// read from their own columns.

fn cabq_location(row: &Row) -> Option<LocationPayload> {
    let name = text(row, "sys_loc_code")?;
    let description = text(row, "loc_name").unwrap_or_else(|| vocab::NO_DESCRIPTION.to_string());
    let lat = num(row, "latitude")?;
    let lon = num(row, "longitude")?;
    let (lat, lon) = fix_latlon(lat, lon);
    let mut props = agency_props(CABQ);
    copy_value(&mut props, row, "altitude", "reference_elev");
    props.insert("altitude_units".to_string(), Value::from("feet asl"));
    copy_fields(&mut props, row, &["facility_id", "facility_code"]);
    Some(LocationPayload::point(name, description, lon, lat, None, props))
}

fn cabq_thing(row: &Row, location: IotId) -> Option<ThingPayload> {
    let mut props = agency_props(CABQ);
    copy_fields(
        &mut props,
        row,
        &[
            "measured_depth_of_well",
            "lnapl_cas_rn",
            "lnapl_depth",
            "lnapl_thickness",
            "lnapl_density",
            "dnapl_cas_rn",
            "dnapl_depth",
            "dnapl_thickness",
        ],
    );
    let mut payload = water_well_thing(location, props);
    payload.description = vocab::NO_DESCRIPTION.to_string();
    Some(payload)
}

fn gwe_datastream(_row: &Row, refs: DatastreamRefs) -> Option<DatastreamPayload> {
    Some(foot_datastream(
        vocab::GROUNDWATER_ELEVATIONS,
        vocab::GWE_DESCRIPTION,
        refs,
        Map::new(),
    ))
}

fn cabq_observation_spec(value_field: &'static str, datastream_name: &'static str) -> ObservationSpec {
    ObservationSpec {
        group_field: "sys_loc_code",
        timestamp_field: "measurement_date",
        value_field,
        timestamp_rule: TimestampRule::Formats(CABQ_TIME_FORMATS),
        transform: ValueTransform::Identity,
        thing_name: vocab::WATER_WELL,
        datastream_name,
        parameter_fields: &[],
    }
}

fn cabq_jobs() -> Vec<SyncJob> {
    let source = SourceSpec::Bucket {
        bucket: "waterdatainitiative".to_string(),
        blob: "cabq/COA_WaterLevels_All.txt".to_string(),
        format: BlobFormat::Tsv,
    };
    let query = TableQuery::new("waterdatainitiative", "cabq_waterlevels", &[]);
    let by_site = LocationStrategy::Name {
        field: "sys_loc_code",
        with_agency: false,
    };
    let by_site_agency = LocationStrategy::Name {
        field: "sys_loc_code",
        with_agency: true,
    };

    let mut locations = SyncJob::new(
        "cabq-locations",
        CABQ,
        JobKind::Locations,
        source.clone(),
        query.clone(),
        by_site,
    );
    locations.distinct_on = Some("sys_loc_code");
    locations.location_builder = Some(cabq_location);

    let mut things = SyncJob::new(
        "cabq-things",
        CABQ,
        JobKind::Things,
        source.clone(),
        query.clone(),
        by_site,
    );
    things.distinct_on = Some("sys_loc_code");
    things.thing_builder = Some(cabq_thing);

    let mut depth_datastreams = SyncJob::new(
        "cabq-waterlevel-datastreams",
        CABQ,
        JobKind::Datastreams,
        source.clone(),
        query.clone(),
        by_site_agency,
    );
    depth_datastreams.distinct_on = Some("sys_loc_code");
    depth_datastreams.datastream_builder = Some(gwl_datastream);
    depth_datastreams.datastream_plan = Some(DatastreamPlan {
        thing_name: vocab::WATER_WELL,
        sensor_name: "Manual",
        observed_property_name: vocab::DEPTH_TO_WATER,
    });
    depth_datastreams.provision = vec![
        ProvisionPayload::Sensor(vocab::manual_sensor()),
        ProvisionPayload::ObservedProperty(vocab::depth_to_water()),
    ];

    let mut elevation_datastreams = SyncJob::new(
        "cabq-waterelevation-datastreams",
        CABQ,
        JobKind::Datastreams,
        source.clone(),
        query.clone(),
        by_site_agency,
    );
    elevation_datastreams.distinct_on = Some("sys_loc_code");
    elevation_datastreams.datastream_builder = Some(gwe_datastream);
    elevation_datastreams.datastream_plan = Some(DatastreamPlan {
        thing_name: vocab::WATER_WELL,
        sensor_name: "Manual",
        observed_property_name: vocab::GROUNDWATER_ELEVATION,
    });
    elevation_datastreams.provision = vec![
        ProvisionPayload::Sensor(vocab::manual_sensor()),
        ProvisionPayload::ObservedProperty(vocab::groundwater_elevation()),
    ];

    let mut depths = SyncJob::new(
        "cabq-water-levels",
        CABQ,
        JobKind::Observations,
        source.clone(),
        query.clone(),
        by_site,
    );
    depths.observations = Some(cabq_observation_spec("water_depth", vocab::GROUNDWATER_LEVELS));

    let mut elevations = SyncJob::new(
        "cabq-water-elevations",
        CABQ,
        JobKind::Observations,
        source,
        query,
        by_site,
    );
    elevations.observations =
        Some(cabq_observation_spec("water_level", vocab::GROUNDWATER_ELEVATIONS));

    vec![locations, things, depth_datastreams, elevation_datastreams, depths, elevations]
}

// City of Roswell wells, surveyed once into a flat table. Names are minted
// from the numeric site id. Well construction details keep their units next
// to the value on the Thing.

fn croswell_location(row: &Row) -> Option<LocationPayload> {
    let site_id = text(row, "site_id")?;
    let lat = num(row, "y_coord")?;
    let lon = num(row, "x_coord")?;
    Some(LocationPayload::point(
        format!("Site-{site_id}"),
        vocab::WELL_LOCATION_DESCRIPTION,
        lon,
        lat,
        None,
        agency_props(CITY_OF_ROSWELL),
    ))
}

fn croswell_thing(row: &Row, location: IotId) -> Option<ThingPayload> {
    let mut props = agency_props(CITY_OF_ROSWELL);
    if let Some(depth) = row.get("well_depth") {
        props.insert(
            "well_depth".to_string(),
            json!({"value": depth, "unit": row.get("well_depth_unit")}),
        );
    }
    if let Some(diameter) = row.get("casing_diameter") {
        props.insert(
            "casing_diameter".to_string(),
            json!({"value": diameter, "unit": row.get("casing_diameter_unit")}),
        );
    }
    Some(water_well_thing(location, props))
}

fn croswell_jobs() -> Vec<SyncJob> {
    let source = warehouse("croswell", "roswell_locations");
    let query = TableQuery::new("croswell", "roswell_locations", &[]);
    let prefixed = LocationStrategy::PrefixedName {
        prefix: "Site-",
        field: "site_id",
    };

    let mut locations = SyncJob::new(
        "croswell-locations",
        CITY_OF_ROSWELL,
        JobKind::Locations,
        source.clone(),
        query.clone(),
        prefixed,
    );
    locations.geoconnex = true;
    locations.location_builder = Some(croswell_location);

    let mut things = SyncJob::new(
        "croswell-things",
        CITY_OF_ROSWELL,
        JobKind::Things,
        source,
        query,
        prefixed,
    );
    things.thing_builder = Some(croswell_thing);

    vec![locations, things]
}

// Van Essen piezometers along the San Acacia reach. Only site metadata is
// delivered today; the upstream id is namespaced so it cannot collide with
// other agencies' numeric ids.

fn sanacacia_location(row: &Row) -> Option<LocationPayload> {
    let name = text(row, "name")?;
    let lat = num(row, "lat")?;
    let lon = num(row, "lng")?;
    let id = match row.get("id").and_then(coerce_i64) {
        Some(id) => id.to_string(),
        None => text(row, "id")?,
    };
    let mut props = agency_props(SAN_ACACIA);
    copy_value(&mut props, row, "purpose", "purpose");
    copy_value(&mut props, row, "is_active", "isActive");
    props.insert("source_id".to_string(), Value::from(format!("sanacaciareach-{id}")));
    copy_value(&mut props, row, "number_of_screens", "numberOfScreens");
    Some(LocationPayload::point(
        name,
        vocab::WELL_LOCATION_DESCRIPTION,
        lon,
        lat,
        None,
        props,
    ))
}

fn sanacacia_jobs() -> Vec<SyncJob> {
    let mut sites = TableQuery::new(
        "nmwdi",
        "vanessen_sanacacia_reach_locations",
        &["id", "uid", "name", "lat", "lng", "purpose", "isActive", "drillingDepth", "numberOfScreens"],
    );
    sites.limit = Some(100);
    sites.order_by = Some("id asc".to_string());

    let mut locations = SyncJob::new(
        "sanacacia-locations",
        SAN_ACACIA,
        JobKind::Locations,
        warehouse("nmwdi", "vanessen_sanacacia_reach_locations"),
        sites,
        LocationStrategy::Name {
            field: "name",
            with_agency: false,
        },
    );
    locations.geoconnex = true;
    locations.location_builder = Some(sanacacia_location);

    vec![locations]
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwsync_adapters::MemoryTableSource;
    use gwsync_core::JobState;
    use gwsync_engine::{validate_job, JobRunner};
    use gwsync_sta::{LocationQuery, MemorySink, StaSink};

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            other => panic!("row fixtures are objects, got {other}"),
        }
    }

    #[test]
    fn every_registered_job_validates() {
        for job in all_jobs() {
            if let Err(err) = validate_job(&job) {
                panic!("{}: {err}", job.name);
            }
        }
    }

    #[test]
    fn job_names_are_unique() {
        let names = job_names();
        let mut deduped = names.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(names.len(), deduped.len());
    }

    #[test]
    fn datastream_jobs_provision_what_their_plans_resolve() {
        for job in all_jobs() {
            if !matches!(job.kind, JobKind::Datastreams) {
                continue;
            }
            let plan = job.datastream_plan.unwrap();
            let sensor = job.provision.iter().any(|p| {
                matches!(p, ProvisionPayload::Sensor(s) if s.name == plan.sensor_name)
            });
            let property = job.provision.iter().any(|p| {
                matches!(p, ProvisionPayload::ObservedProperty(o) if o.name == plan.observed_property_name)
            });
            assert!(sensor, "{} never provisions sensor {}", job.name, plan.sensor_name);
            assert!(
                property,
                "{} never provisions observed property {}",
                job.name, plan.observed_property_name
            );
        }
    }

    #[test]
    fn pecos_site_names_drop_the_level_suffix() {
        let job = job_for_name("pecos-hydrovu-locations").unwrap();
        let builder = job.location_builder.unwrap();
        let payload = builder(&row(json!({
            "id": 1515, "name": "Poe Corn Level", "latitude": 33.4, "longitude": -104.5
        })))
        .unwrap();
        // Suffix removal only; the trailing space survives into the name.
        assert_eq!(payload.name, "Poe Corn ");
        assert_eq!(payload.properties.get("agency"), Some(&Value::from("PVACD")));
    }

    #[test]
    fn pecos_manual_wells_resolve_by_static_id_table() {
        let job = job_for_name("pecos-manual-waterlevel-observations").unwrap();
        let LocationStrategy::MappedName { names, with_agency, .. } = job.location_strategy else {
            panic!("pecos manual wells must resolve through the static name table");
        };
        assert!(with_agency);
        assert!(names.contains(&("1518", "LFD Level")));
        assert_eq!(names.len(), 10);
    }

    #[test]
    fn ebid_non_well_sites_map_nothing() {
        let things = job_for_name("ebid-well-things").unwrap().thing_builder.unwrap();
        let well = row(json!({"site_id": "ab-0100", "location": "Mesilla Well #1"}));
        let canal = row(json!({"site_id": "ab-0200", "location": "Leasburg Canal"}));
        assert!(things(&well, IotId(7)).is_some());
        assert!(things(&canal, IotId(8)).is_none());

        let streams = job_for_name("ebid-well-datastreams").unwrap().datastream_builder.unwrap();
        let refs = DatastreamRefs {
            thing: IotId(1),
            sensor: IotId(2),
            observed_property: IotId(3),
        };
        assert!(streams(&canal, refs).is_none());
    }

    #[test]
    fn ebid_location_carries_elevation_from_the_reference_column() {
        let builder = job_for_name("ebid-well-locations").unwrap().location_builder.unwrap();
        let payload = builder(&row(json!({
            "site_id": "ab-0100",
            "location": "Mesilla Well #1",
            "latitude_dec": 32.3,
            "longitude_dec": -106.8,
            "reference": 1172.5,
            "or_site_id": 210
        })))
        .unwrap();
        assert_eq!(payload.name, "AB-0100");
        assert_eq!(payload.location["coordinates"], json!([-106.8, 32.3, 1172.5]));
    }

    #[test]
    fn ose_station_names_are_zero_padded() {
        let builder = job_for_name("ose-realtime-locations").unwrap().location_builder.unwrap();
        let payload = builder(&row(json!({
            "Station_ID": 86.0, "lat_ddd": 35.1, "long_ddd": -106.7, "OBJECTID": 12
        })))
        .unwrap();
        assert_eq!(payload.name, "0086");
        assert_eq!(payload.properties.get("source_id"), Some(&Value::from(12)));

        let unnumbered = row(json!({"Station_ID": 0, "lat_ddd": 35.1, "long_ddd": -106.7}));
        assert!(builder(&unnumbered).is_none());
    }

    #[test]
    fn transposed_basin_coordinates_are_swapped_back() {
        let builder = job_for_name("ose-roswell-locations").unwrap().location_builder.unwrap();
        let payload = builder(&row(json!({
            "site_id": "RA-0100", "dd_lat": -104.4, "dd_lon": 33.3, "basin": "Roswell"
        })))
        .unwrap();
        assert_eq!(payload.location["coordinates"], json!([-104.4, 33.3]));
        assert_eq!(payload.properties.get("basin"), Some(&Value::from("Roswell")));
    }

    #[test]
    fn cabq_depth_and_elevation_jobs_read_distinct_columns() {
        let depth = job_for_name("cabq-water-levels").unwrap().observations.unwrap();
        let elevation = job_for_name("cabq-water-elevations").unwrap().observations.unwrap();
        assert_eq!(depth.value_field, "water_depth");
        assert_eq!(elevation.value_field, "water_level");
        assert_ne!(depth.datastream_name, elevation.datastream_name);
    }

    #[test]
    fn croswell_thing_keeps_units_with_construction_values() {
        let builder = job_for_name("croswell-things").unwrap().thing_builder.unwrap();
        let payload = builder(
            &row(json!({
                "site_id": "18",
                "well_depth": 220, "well_depth_unit": "ft",
                "casing_diameter": 8, "casing_diameter_unit": "in"
            })),
            IotId(4),
        )
        .unwrap();
        assert_eq!(
            payload.properties.get("well_depth"),
            Some(&json!({"value": 220, "unit": "ft"}))
        );
        assert_eq!(
            payload.properties.get("casing_diameter"),
            Some(&json!({"value": 8, "unit": "in"}))
        );
    }

    #[test]
    fn sanacacia_ids_are_namespaced() {
        let builder = job_for_name("sanacacia-locations").unwrap().location_builder.unwrap();
        let payload = builder(&row(json!({
            "id": 12, "name": "SA-12", "lat": 34.2, "lng": -106.9, "isActive": true
        })))
        .unwrap();
        assert_eq!(
            payload.properties.get("source_id"),
            Some(&Value::from("sanacaciareach-12"))
        );
        assert_eq!(payload.properties.get("is_active"), Some(&Value::from(true)));
    }

    #[tokio::test]
    async fn bernco_site_rows_render_locations() {
        let rows = vec![row(json!({
            "id": 1002,
            "name": "Alameda Well",
            "latitude": 35.19,
            "longitude": -106.62,
            "description": "VuLink"
        }))];
        let source = MemoryTableSource::new("warehouse", rows);
        let sink = MemorySink::new();
        let job = job_for_name("bernco-hydrovu-locations").unwrap();

        let summary = JobRunner::new(&source, &sink)
            .render(&job, &JobState::empty(), false)
            .await
            .unwrap();
        assert_eq!(summary.extracted, 1);
        assert_eq!(summary.created, 1);

        let location = sink
            .get_location(&LocationQuery::Name {
                name: "Alameda Well".to_string(),
                agency: None,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(location.properties.get("agency"), Some(&Value::from("BernCo")));
        assert_eq!(location.properties.get("source_id"), Some(&Value::from(1002)));
    }
}
