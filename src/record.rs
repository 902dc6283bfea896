use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cell::CellValue;
use crate::errors::{AppError, AppResult, GeocodeError};

pub type RowId = i64;

/// Column values keyed by actual column name, as written to the host store.
pub type FieldValues = Map<String, Value>;

/// Logical column roles the map widgets declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Name,
    Longitude,
    Latitude,
    Address,
    Geocode,
    GeocodedAddress,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Name,
        Role::Longitude,
        Role::Latitude,
        Role::Address,
        Role::Geocode,
        Role::GeocodedAddress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Name => "Name",
            Role::Longitude => "Longitude",
            Role::Latitude => "Latitude",
            Role::Address => "Address",
            Role::Geocode => "Geocode",
            Role::GeocodedAddress => "GeocodedAddress",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == value.trim())
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role to column association supplied by the host.
///
/// `Identity` is what a widget sees when the host sends no mapping: a role
/// resolves to the column of the same name if the record has one. Longitude
/// and Latitude always resolve, since a pass writes them even on rows that
/// have never been geocoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FieldMapping {
    #[default]
    Identity,
    Explicit(HashMap<Role, String>),
}

impl FieldMapping {
    /// Parses the host's mapping payload. Unknown role names are ignored,
    /// and roles mapped to `null` or `""` stay unmapped.
    pub fn from_json(value: &Value) -> AppResult<Self> {
        match value {
            Value::Null => Ok(FieldMapping::Identity),
            Value::Object(entries) => Ok(FieldMapping::Explicit(
                entries
                    .iter()
                    .filter_map(|(role, column)| {
                        let role = Role::parse(role)?;
                        let column = column.as_str()?.trim();
                        (!column.is_empty()).then(|| (role, column.to_string()))
                    })
                    .collect(),
            )),
            other => Err(AppError::Config(format!(
                "field mapping must be an object, got {other}"
            ))),
        }
    }

    pub fn resolve<'a>(&'a self, role: Role, fields: &FieldValues) -> Option<&'a str> {
        match self {
            FieldMapping::Identity => match role {
                Role::Longitude | Role::Latitude => Some(role.as_str()),
                _ => fields.contains_key(role.as_str()).then(|| role.as_str()),
            },
            FieldMapping::Explicit(columns) => columns.get(&role).map(String::as_str),
        }
    }
}

impl FromIterator<(Role, String)> for FieldMapping {
    fn from_iter<I: IntoIterator<Item = (Role, String)>>(iter: I) -> Self {
        FieldMapping::Explicit(iter.into_iter().collect())
    }
}

/// One row as delivered by the host: an id plus raw, still-encoded cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RowId,
    #[serde(default)]
    pub fields: FieldValues,
}

impl Record {
    pub fn new(id: RowId, fields: FieldValues) -> Self {
        Self { id, fields }
    }

    /// Builds a record from the widget API shape, where `id` sits next to the
    /// column values instead of wrapping them.
    pub fn from_flat(value: Value) -> AppResult<Self> {
        let Value::Object(mut fields) = value else {
            return Err(AppError::Config("record must be a JSON object".into()));
        };
        let id = fields
            .remove("id")
            .and_then(|id| id.as_i64())
            .ok_or_else(|| AppError::Config("record is missing an integer id".into()))?;
        Ok(Self { id, fields })
    }
}

/// A record with its roles resolved against a mapping.
#[derive(Debug, Clone)]
pub struct RowRecord {
    id: RowId,
    fields: FieldValues,
    columns: HashMap<Role, String>,
}

impl RowRecord {
    pub fn bind(record: Record, mapping: &FieldMapping) -> Self {
        let columns = Role::ALL
            .into_iter()
            .filter_map(|role| {
                mapping
                    .resolve(role, &record.fields)
                    .map(|column| (role, column.to_string()))
            })
            .collect();
        Self {
            id: record.id,
            fields: record.fields,
            columns,
        }
    }

    pub fn id(&self) -> RowId {
        self.id
    }

    /// Column the role is mapped to, whether or not the record carries it.
    pub fn column(&self, role: Role) -> Option<&str> {
        self.columns.get(&role).map(String::as_str)
    }

    pub fn has(&self, role: Role) -> bool {
        self.column(role)
            .is_some_and(|column| self.fields.contains_key(column))
    }

    pub fn get(&self, role: Role) -> CellValue {
        self.column(role)
            .and_then(|column| self.fields.get(column))
            .map(CellValue::decode)
            .unwrap_or(CellValue::Null)
    }

    pub fn clear(&mut self, role: Role) {
        if let Some(column) = self.columns.get(&role) {
            self.fields.insert(column.clone(), Value::Null);
        }
    }

    pub fn into_record(self) -> Record {
        Record {
            id: self.id,
            fields: self.fields,
        }
    }
}

/// WGS84 position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Result<Self, GeocodeError> {
        if !lat.is_finite() || !lng.is_finite() {
            return Err(GeocodeError::InvalidCoordinate(format!("{lat}, {lng}")));
        }
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            return Err(GeocodeError::InvalidCoordinate(format!(
                "{lat}, {lng} is out of range"
            )));
        }
        Ok(Self { lat, lng })
    }
}

/// How a stored coordinate of exactly zero is read.
///
/// Grist numeric columns start out as 0 on new rows, which is why the widgets
/// treated any falsy longitude as missing. `ZeroIsValid` keeps points on the
/// equator or prime meridian and only treats empty cells as unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum CoordinatePolicy {
    #[default]
    ZeroIsUnset,
    ZeroIsValid,
}

impl CoordinatePolicy {
    pub fn is_unset(&self, value: &CellValue) -> bool {
        match self {
            CoordinatePolicy::ZeroIsUnset => !value.is_truthy() || value.is_error(),
            CoordinatePolicy::ZeroIsValid => value.as_f64().is_none(),
        }
    }
}
