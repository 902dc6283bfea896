use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::record::{FieldMapping, Record, RowId};
use crate::sync::{GeocodeSync, SyncBatch};

/// Interaction details the host passes alongside widget options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    #[serde(default)]
    pub access_level: Option<String>,
}

impl Interaction {
    pub fn full_access() -> Self {
        Self {
            access_level: Some("full".into()),
        }
    }

    pub fn grants_write(&self) -> bool {
        self.access_level.as_deref() == Some("full")
    }
}

/// State of one map widget instance, fed by host callbacks.
pub struct WidgetSession {
    sync: GeocodeSync,
    table_id: Option<String>,
    records: Vec<Record>,
    mapping: FieldMapping,
    selected_row: Option<RowId>,
    options: Value,
    can_write: bool,
}

impl WidgetSession {
    pub fn new(sync: GeocodeSync) -> Self {
        Self {
            sync,
            table_id: None,
            records: Vec::new(),
            mapping: FieldMapping::Identity,
            selected_row: None,
            options: Value::Null,
            can_write: false,
        }
    }

    pub fn sync(&self) -> &GeocodeSync {
        &self.sync
    }

    pub fn set_table_id(&mut self, table_id: impl Into<String>) {
        self.table_id = Some(table_id.into());
    }

    pub fn table_id(&self) -> Option<&str> {
        self.table_id.as_deref()
    }

    pub fn on_options(&mut self, options: Value, interaction: &Interaction) {
        self.can_write = interaction.grants_write();
        self.options = options;
        debug!(can_write = self.can_write, "widget options updated");
    }

    pub fn options(&self) -> &Value {
        &self.options
    }

    /// Replaces the current batch and starts a scan if none is running.
    pub fn on_records(&mut self, records: Vec<Record>, mapping: FieldMapping) -> bool {
        self.records = records;
        self.scan_on_need(mapping)
    }

    /// Tracks the cursor row; selection alone never triggers geocoding.
    pub fn on_record(&mut self, record: Record, mapping: FieldMapping) {
        self.mapping = mapping;
        self.selected_row = Some(record.id);
        if let Some(existing) = self.records.iter_mut().find(|r| r.id == record.id) {
            *existing = record;
        }
    }

    pub fn selected_row(&self) -> Option<RowId> {
        self.selected_row
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    pub fn scan_on_need(&mut self, mapping: FieldMapping) -> bool {
        self.mapping = mapping;
        if !self.can_write {
            debug!("no write access; skipping geocode scan");
            return false;
        }
        let Some(table_id) = self.table_id.clone() else {
            debug!("table id unknown; skipping geocode scan");
            return false;
        };
        self.sync.scan_on_need(SyncBatch {
            table_id,
            records: self.records.clone(),
            mapping: self.mapping.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use crate::errors::GeocodeError;
    use crate::geocoder::Geocoder;
    use crate::host::MemoryStore;
    use crate::record::Coordinate;
    use crate::sync::SyncOptions;

    use super::*;

    struct Fixed;

    #[async_trait::async_trait]
    impl Geocoder for Fixed {
        async fn geocode(&self, _address: &str) -> Result<Coordinate, GeocodeError> {
            Coordinate::new(45.5, -122.6)
        }
    }

    fn session(store: Arc<MemoryStore>) -> WidgetSession {
        WidgetSession::new(GeocodeSync::new(
            Arc::new(Fixed),
            store,
            SyncOptions::default(),
        ))
    }

    fn records() -> Vec<Record> {
        vec![Record::from_flat(json!({ "id": 1, "Address": "1 Main St", "Geocode": true })).unwrap()]
    }

    #[tokio::test(start_paused = true)]
    async fn requires_full_access_before_scanning() {
        let store = Arc::new(MemoryStore::new());
        let mut session = session(store.clone());
        session.set_table_id("Places");

        session.on_options(json!({}), &Interaction {
            access_level: Some("read table".into()),
        });
        assert!(!session.on_records(records(), FieldMapping::Identity));

        session.on_options(json!({}), &Interaction::full_access());
        assert!(session.on_records(records(), FieldMapping::Identity));
        session.sync().wait_idle().await;
        assert_eq!(store.updates().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_table_id() {
        let store = Arc::new(MemoryStore::new());
        let mut session = session(store.clone());
        session.on_options(Value::Null, &Interaction::full_access());
        assert!(!session.on_records(records(), FieldMapping::Identity));
        assert_eq!(session.sync().passes_started(), 0);
    }

    #[test]
    fn selection_updates_cursor_and_batch() {
        let mut session = session(Arc::new(MemoryStore::new()));
        session.records = records();
        let moved = Record::from_flat(json!({ "id": 1, "Address": "2 Main St", "Geocode": true }))
            .unwrap();
        let mapping = FieldMapping::from_json(&json!({ "Address": "Address" })).unwrap();
        session.on_record(moved.clone(), mapping.clone());
        assert_eq!(session.selected_row(), Some(1));
        assert_eq!(session.records()[0], moved);
        assert_eq!(session.mapping(), &mapping);
        assert_eq!(session.sync().passes_started(), 0);
    }

    #[test]
    fn parses_interaction_payload() {
        let interaction: Interaction =
            serde_json::from_value(json!({ "accessLevel": "full" })).unwrap();
        assert!(interaction.grants_write());
        assert!(!Interaction::default().grants_write());
    }
}
