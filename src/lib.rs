pub mod cell;
pub mod config;
pub mod errors;
pub mod geocoder;
pub mod host;
pub mod record;
pub mod sync;
pub mod telemetry;
pub mod widget;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use cell::CellValue;
pub use config::{AppConfig, GeocoderKind, PublicAppConfig};
pub use errors::{AppError, AppResult, GeocodeError};
pub use geocoder::{
    ArcGisGeocoder, FallbackGeocoder, Geocoder, GeocodingService, NominatimGeocoder,
};
pub use host::{AppliedUpdate, DryRunStore, GristClient, HostStore, MemoryStore};
pub use record::{Coordinate, CoordinatePolicy, FieldMapping, Record, Role, RowId, RowRecord};
pub use sync::{GeocodeSync, PassReport, SyncBatch, SyncOptions, DEFAULT_LOOKUP_DELAY};
pub use telemetry::{JournalEvent, SyncJournal};
pub use widget::{Interaction, WidgetSession};

/// Installs the global subscriber once. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str, json: bool) {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter));
        let registry = tracing_subscriber::registry().with(filter);
        if json {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    });
}
