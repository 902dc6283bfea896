use std::sync::Arc;
use std::time::Duration;

use httptest::matchers::{all_of, contains, eq, json_decoded, request, url_decoded};
use httptest::responders::{json_encoded, status_code};
use httptest::{Expectation, Server};
use serde_json::json;

use grist_geocode_sync::{
    AppConfig, AppError, GeocodeError, GeocodeSync, Geocoder, GeocoderKind, GeocodingService,
    GristClient, HostStore, Interaction, NominatimGeocoder, SyncOptions, WidgetSession,
};

fn config_for(server: &Server) -> AppConfig {
    AppConfig {
        grist_server: server.url("/").to_string(),
        grist_doc_id: Some("doc".into()),
        grist_table_id: Some("Places".into()),
        nominatim_endpoint: server.url("/nominatim").to_string(),
        arcgis_endpoint: server.url("/arcgis").to_string(),
        geocode_delay_ms: 0,
        geocode_timeout_ms: 2_000,
        ..AppConfig::default()
    }
}

#[tokio::test]
async fn fetches_geocodes_and_patches_grist() {
    let server = Server::run();

    server.expect(
        Expectation::matching(request::method_path(
            "GET",
            "/api/docs/doc/tables/Places/records",
        ))
        .respond_with(json_encoded(json!({
            "records": [
                { "id": 1, "fields": {
                    "Name": "Office", "Address": "1 Main St", "Longitude": 0, "Latitude": 0,
                    "Geocode": true, "GeocodedAddress": ""
                }},
                { "id": 2, "fields": {
                    "Name": "Depot", "Address": "2 Main St", "Longitude": 10, "Latitude": 20,
                    "Geocode": true, "GeocodedAddress": "2 Main St"
                }},
                { "id": 3, "fields": {
                    "Name": "Home", "Address": "4 Main St", "Longitude": 0, "Latitude": 0,
                    "Geocode": false, "GeocodedAddress": ""
                }}
            ]
        }))),
    );

    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/nominatim/search"),
            request::query(url_decoded(contains(("q", "1 Main St")))),
            request::query(url_decoded(contains(("format", "json")))),
        ])
        .respond_with(json_encoded(json!([
            { "lat": "45.5", "lon": "-122.6", "display_name": "1 Main St, Portland" }
        ]))),
    );

    server.expect(
        Expectation::matching(all_of![
            request::method_path("PATCH", "/api/docs/doc/tables/Places/records"),
            request::body(json_decoded(eq(json!({
                "records": [{
                    "id": 1,
                    "fields": { "Longitude": -122.6, "Latitude": 45.5, "GeocodedAddress": "1 Main St" }
                }]
            })))),
        ])
        .respond_with(json_encoded(json!(null))),
    );

    let config = config_for(&server);
    let grist = GristClient::new(&config).expect("grist client");
    let geocoder = GeocodingService::new(&config).expect("geocoder").into_inner();
    let sync = GeocodeSync::new(
        geocoder,
        Arc::new(grist.clone()),
        SyncOptions::from_config(&config),
    );

    let mut session = WidgetSession::new(sync);
    session.set_table_id("Places");
    session.on_options(json!({}), &Interaction::full_access());

    let records = grist.fetch_records("Places").await.expect("fetch records");
    assert_eq!(records.len(), 3);
    assert!(session.on_records(records, config.field_mapping.clone()));

    let report = session.sync().wait_idle().await.expect("pass report");
    assert_eq!(report.scanned, 3);
    assert_eq!(report.opted_out, 1);
    assert_eq!(report.lookups, 1);
    assert_eq!(report.updates, 1);
    assert!(!session.sync().is_running());
}

#[tokio::test]
async fn falls_back_to_arcgis_when_nominatim_finds_nothing() {
    let server = Server::run();

    server.expect(
        Expectation::matching(request::method_path("GET", "/nominatim/search"))
            .respond_with(json_encoded(json!([]))),
    );
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/arcgis/findAddressCandidates"),
            request::query(url_decoded(contains(("SingleLine", "10 Downing St")))),
        ])
        .respond_with(json_encoded(json!({
            "candidates": [
                { "address": "10 Downing St", "score": 100, "location": { "x": -0.1276, "y": 51.5034 } }
            ]
        }))),
    );

    let config = AppConfig {
        geocoder: GeocoderKind::NominatimThenArcGis,
        ..config_for(&server)
    };
    let geocoder = GeocodingService::new(&config).expect("geocoder");
    let coordinate = geocoder.geocode("10 Downing St").await.expect("coordinate");
    assert_eq!(coordinate.lat, 51.5034);
    assert_eq!(coordinate.lng, -0.1276);
}

#[tokio::test]
async fn surfaces_provider_status_errors() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/nominatim/search"))
            .respond_with(status_code(503)),
    );

    let geocoder = NominatimGeocoder::new(
        &server.url("/nominatim").to_string(),
        "grist-geocode-sync-tests",
        Duration::from_secs(2),
    )
    .expect("geocoder");
    let err = geocoder.geocode("anywhere").await.unwrap_err();
    assert!(matches!(err, GeocodeError::Status(503)));
}

#[tokio::test]
async fn rejected_writes_become_host_errors() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path(
            "PATCH",
            "/api/docs/doc/tables/Places/records",
        ))
        .respond_with(status_code(403).body("no write access")),
    );

    let grist = GristClient::new(&config_for(&server)).expect("grist client");
    let mut fields = serde_json::Map::new();
    fields.insert("Longitude".into(), json!(1.0));
    let err = grist
        .apply_update("Places", 1, fields)
        .await
        .unwrap_err();
    match err {
        AppError::Host { status, body } => {
            assert_eq!(status, 403);
            assert_eq!(body, "no write access");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
