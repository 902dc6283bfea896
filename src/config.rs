use std::collections::BTreeMap;
use std::path::PathBuf;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::record::{CoordinatePolicy, FieldMapping};

const DEFAULT_GRIST_SERVER: &str = "https://docs.getgrist.com";
const DEFAULT_NOMINATIM_ENDPOINT: &str = "https://nominatim.openstreetmap.org";
const DEFAULT_ARCGIS_ENDPOINT: &str =
    "https://geocode.arcgis.com/arcgis/rest/services/World/GeocodeServer";
const DEFAULT_GEOCODE_DELAY_MS: u64 = 1_000;
const DEFAULT_GEOCODE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
const DEFAULT_TELEMETRY_BUFFER_MAX_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GeocoderKind {
    #[default]
    Nominatim,
    ArcGis,
    NominatimThenArcGis,
}

impl GeocoderKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "nominatim" | "osm" => Some(GeocoderKind::Nominatim),
            "arcgis" | "esri" => Some(GeocoderKind::ArcGis),
            "nominatim+arcgis" => Some(GeocoderKind::NominatimThenArcGis),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub grist_server: String,
    pub grist_doc_id: Option<String>,
    pub grist_table_id: Option<String>,
    pub grist_api_key: Option<SecretString>,
    pub field_mapping: FieldMapping,
    pub geocoder: GeocoderKind,
    pub nominatim_endpoint: String,
    pub arcgis_endpoint: String,
    pub geocoder_user_agent: String,
    pub geocode_delay_ms: u64,
    pub geocode_timeout_ms: u64,
    pub coordinate_policy: CoordinatePolicy,
    pub poll_interval_ms: u64,
    pub telemetry_enabled: bool,
    pub telemetry_dir: Option<PathBuf>,
    pub telemetry_batch_size: usize,
    pub telemetry_buffer_max_bytes: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub grist_server: String,
    pub grist_doc_id: Option<String>,
    pub grist_table_id: Option<String>,
    pub has_grist_api_key: bool,
    pub field_mapping: Option<BTreeMap<String, String>>,
    pub geocoder: GeocoderKind,
    pub nominatim_endpoint: String,
    pub arcgis_endpoint: String,
    pub geocode_delay_ms: u64,
    pub geocode_timeout_ms: u64,
    pub coordinate_policy: CoordinatePolicy,
    pub poll_interval_ms: u64,
    pub telemetry_enabled: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            grist_server: DEFAULT_GRIST_SERVER.to_string(),
            grist_doc_id: None,
            grist_table_id: None,
            grist_api_key: None,
            field_mapping: FieldMapping::Identity,
            geocoder: GeocoderKind::default(),
            nominatim_endpoint: DEFAULT_NOMINATIM_ENDPOINT.to_string(),
            arcgis_endpoint: DEFAULT_ARCGIS_ENDPOINT.to_string(),
            geocoder_user_agent: concat!("grist-geocode-sync/", env!("CARGO_PKG_VERSION"))
                .to_string(),
            geocode_delay_ms: DEFAULT_GEOCODE_DELAY_MS,
            geocode_timeout_ms: DEFAULT_GEOCODE_TIMEOUT_MS,
            coordinate_policy: CoordinatePolicy::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            telemetry_enabled: false,
            telemetry_dir: None,
            telemetry_batch_size: 25,
            telemetry_buffer_max_bytes: DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        Self {
            grist_server: env::var("GRIST_SERVER").unwrap_or(defaults.grist_server),
            grist_doc_id: non_empty("GRIST_DOC_ID"),
            grist_table_id: non_empty("GRIST_TABLE_ID"),
            grist_api_key: non_empty("GRIST_API_KEY").map(SecretString::from),
            field_mapping: parse_mapping("GRIST_FIELD_MAPPING"),
            geocoder: env::var("GEOCODER")
                .ok()
                .and_then(|v| {
                    let parsed = GeocoderKind::parse(&v);
                    if parsed.is_none() {
                        warn!(value = %v, "unknown GEOCODER; using nominatim");
                    }
                    parsed
                })
                .unwrap_or_default(),
            nominatim_endpoint: env::var("NOMINATIM_ENDPOINT")
                .unwrap_or(defaults.nominatim_endpoint),
            arcgis_endpoint: env::var("ARCGIS_ENDPOINT").unwrap_or(defaults.arcgis_endpoint),
            geocoder_user_agent: non_empty("GEOCODER_USER_AGENT")
                .unwrap_or(defaults.geocoder_user_agent),
            geocode_delay_ms: parse_u64("GEOCODE_DELAY_MS", DEFAULT_GEOCODE_DELAY_MS),
            geocode_timeout_ms: parse_u64("GEOCODE_TIMEOUT_MS", DEFAULT_GEOCODE_TIMEOUT_MS)
                .max(1),
            coordinate_policy: if parse_bool("GEOCODE_ZERO_IS_UNSET", true) {
                CoordinatePolicy::ZeroIsUnset
            } else {
                CoordinatePolicy::ZeroIsValid
            },
            poll_interval_ms: parse_u64("POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS).max(100),
            telemetry_enabled: parse_bool("TELEMETRY_ENABLED", defaults.telemetry_enabled),
            telemetry_dir: non_empty("TELEMETRY_DIR").map(PathBuf::from),
            telemetry_batch_size: parse_usize("TELEMETRY_BATCH_SIZE", 25).max(1),
            telemetry_buffer_max_bytes: parse_u64(
                "TELEMETRY_BUFFER_MAX_BYTES",
                DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
            ),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            grist_server: self.grist_server.clone(),
            grist_doc_id: self.grist_doc_id.clone(),
            grist_table_id: self.grist_table_id.clone(),
            has_grist_api_key: self.grist_api_key.is_some(),
            field_mapping: match &self.field_mapping {
                FieldMapping::Identity => None,
                FieldMapping::Explicit(columns) => Some(
                    columns
                        .iter()
                        .map(|(role, column)| (role.as_str().to_string(), column.clone()))
                        .collect(),
                ),
            },
            geocoder: self.geocoder,
            nominatim_endpoint: self.nominatim_endpoint.clone(),
            arcgis_endpoint: self.arcgis_endpoint.clone(),
            geocode_delay_ms: self.geocode_delay_ms,
            geocode_timeout_ms: self.geocode_timeout_ms,
            coordinate_policy: self.coordinate_policy,
            poll_interval_ms: self.poll_interval_ms,
            telemetry_enabled: self.telemetry_enabled,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_mapping(key: &str) -> FieldMapping {
    let Some(raw) = non_empty(key) else {
        return FieldMapping::Identity;
    };
    serde_json::from_str::<Value>(&raw)
        .map_err(|err| err.to_string())
        .and_then(|value| FieldMapping::from_json(&value).map_err(|err| err.to_string()))
        .unwrap_or_else(|err| {
            warn!(%err, "ignoring invalid {key}; falling back to identity mapping");
            FieldMapping::Identity
        })
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use crate::record::Role;

    use super::*;

    #[test]
    fn builds_public_profile_without_secrets() {
        env::set_var("GRIST_API_KEY", "secret");
        env::set_var("GRIST_DOC_ID", "doc123");
        env::set_var("GEOCODER", "arcgis");
        env::set_var("GEOCODE_ZERO_IS_UNSET", "false");
        env::set_var(
            "GRIST_FIELD_MAPPING",
            r#"{"Address": "Street", "Geocode": "Lookup"}"#,
        );

        let config = AppConfig::from_env();
        let public = config.public_profile();

        assert!(public.has_grist_api_key);
        assert_eq!(public.grist_doc_id.as_deref(), Some("doc123"));
        assert_eq!(public.geocoder, GeocoderKind::ArcGis);
        assert_eq!(public.coordinate_policy, CoordinatePolicy::ZeroIsValid);
        assert_eq!(
            public
                .field_mapping
                .as_ref()
                .and_then(|m| m.get("Address"))
                .map(String::as_str),
            Some("Street")
        );
        assert!(!serde_json::to_string(&public).unwrap().contains("secret"));
        assert!(matches!(
            &config.field_mapping,
            FieldMapping::Explicit(columns) if columns.get(&Role::Geocode).map(String::as_str) == Some("Lookup")
        ));
        assert_eq!(config.geocode_delay_ms, DEFAULT_GEOCODE_DELAY_MS);
    }

    #[test]
    fn parses_geocoder_names() {
        assert_eq!(GeocoderKind::parse("OSM"), Some(GeocoderKind::Nominatim));
        assert_eq!(
            GeocoderKind::parse("nominatim+arcgis"),
            Some(GeocoderKind::NominatimThenArcGis)
        );
        assert_eq!(GeocoderKind::parse("google"), None);
    }
}
