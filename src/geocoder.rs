use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{trace, warn};

use crate::config::{AppConfig, GeocoderKind};
use crate::errors::{AppResult, GeocodeError};
use crate::record::Coordinate;

/// Forward geocoding of a free-text address.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> Result<Coordinate, GeocodeError>;
}

#[derive(Clone)]
pub struct GeocodingService {
    inner: Arc<dyn Geocoder>,
}

impl GeocodingService {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let timeout = Duration::from_millis(config.geocode_timeout_ms);
        let inner: Arc<dyn Geocoder> = match config.geocoder {
            GeocoderKind::Nominatim => Arc::new(NominatimGeocoder::new(
                &config.nominatim_endpoint,
                &config.geocoder_user_agent,
                timeout,
            )?),
            GeocoderKind::ArcGis => Arc::new(ArcGisGeocoder::new(
                &config.arcgis_endpoint,
                &config.geocoder_user_agent,
                timeout,
            )?),
            GeocoderKind::NominatimThenArcGis => Arc::new(FallbackGeocoder::new(
                NominatimGeocoder::new(
                    &config.nominatim_endpoint,
                    &config.geocoder_user_agent,
                    timeout,
                )?,
                ArcGisGeocoder::new(&config.arcgis_endpoint, &config.geocoder_user_agent, timeout)?,
            )),
        };
        Ok(Self { inner })
    }

    pub fn from_geocoder(geocoder: Arc<dyn Geocoder>) -> Self {
        Self { inner: geocoder }
    }

    pub fn into_inner(self) -> Arc<dyn Geocoder> {
        self.inner
    }
}

#[async_trait]
impl Geocoder for GeocodingService {
    async fn geocode(&self, address: &str) -> Result<Coordinate, GeocodeError> {
        self.inner.geocode(address).await
    }
}

fn http_client(user_agent: &str, timeout: Duration) -> AppResult<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .build()?;
    Ok(client)
}

/// Nominatim `/search` endpoint, as used by OpenStreetMap-based widgets.
pub struct NominatimGeocoder {
    http: reqwest::Client,
    search_url: String,
}

impl NominatimGeocoder {
    pub fn new(endpoint: &str, user_agent: &str, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            http: http_client(user_agent, timeout)?,
            search_url: format!("{}/search", endpoint.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, address: &str) -> Result<Coordinate, GeocodeError> {
        #[derive(Deserialize)]
        struct Place {
            lat: String,
            lon: String,
        }

        let response = self
            .http
            .get(&self.search_url)
            .query(&[("format", "json"), ("limit", "1"), ("q", address)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GeocodeError::Status(response.status().as_u16()));
        }

        let places: Vec<Place> = response
            .json()
            .await
            .map_err(|err| GeocodeError::Decode(err.to_string()))?;
        let place = places
            .into_iter()
            .next()
            .ok_or_else(|| GeocodeError::NoResult(address.to_string()))?;

        let lat = parse_degrees(&place.lat)?;
        let lng = parse_degrees(&place.lon)?;
        trace!(address, lat, lng, "nominatim resolved address");
        Coordinate::new(lat, lng)
    }
}

fn parse_degrees(text: &str) -> Result<f64, GeocodeError> {
    text.trim()
        .parse::<f64>()
        .map_err(|err| GeocodeError::InvalidCoordinate(format!("{text:?}: {err}")))
}

/// ArcGIS World Geocoding Service `findAddressCandidates`.
pub struct ArcGisGeocoder {
    http: reqwest::Client,
    candidates_url: String,
}

impl ArcGisGeocoder {
    pub fn new(endpoint: &str, user_agent: &str, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            http: http_client(user_agent, timeout)?,
            candidates_url: format!("{}/findAddressCandidates", endpoint.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl Geocoder for ArcGisGeocoder {
    async fn geocode(&self, address: &str) -> Result<Coordinate, GeocodeError> {
        #[derive(Deserialize)]
        struct Response {
            candidates: Option<Vec<Candidate>>,
            error: Option<ResponseError>,
        }

        #[derive(Deserialize)]
        struct Candidate {
            location: Location,
        }

        #[derive(Deserialize)]
        struct Location {
            x: f64,
            y: f64,
        }

        #[derive(Deserialize)]
        struct ResponseError {
            message: Option<String>,
        }

        let response = self
            .http
            .get(&self.candidates_url)
            .query(&[("f", "json"), ("maxLocations", "1"), ("SingleLine", address)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GeocodeError::Status(response.status().as_u16()));
        }

        let parsed: Response = response
            .json()
            .await
            .map_err(|err| GeocodeError::Decode(err.to_string()))?;
        if let Some(error) = parsed.error {
            return Err(GeocodeError::Decode(
                error.message.unwrap_or_else(|| "arcgis error".into()),
            ));
        }

        let candidate = parsed
            .candidates
            .and_then(|list| list.into_iter().next())
            .ok_or_else(|| GeocodeError::NoResult(address.to_string()))?;
        trace!(
            address,
            lat = candidate.location.y,
            lng = candidate.location.x,
            "arcgis resolved address"
        );
        Coordinate::new(candidate.location.y, candidate.location.x)
    }
}

/// Tries `primary`, then `fallback` when the primary lookup fails for any reason.
pub struct FallbackGeocoder<P, F> {
    primary: P,
    fallback: F,
}

impl<P, F> FallbackGeocoder<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl<P, F> Geocoder for FallbackGeocoder<P, F>
where
    P: Geocoder,
    F: Geocoder,
{
    async fn geocode(&self, address: &str) -> Result<Coordinate, GeocodeError> {
        match self.primary.geocode(address).await {
            Ok(coordinate) => Ok(coordinate),
            Err(err) => {
                warn!(?err, address, "primary geocoder failed; trying fallback");
                self.fallback.geocode(address).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    struct Scripted {
        calls: Mutex<Vec<String>>,
        result: Option<Coordinate>,
    }

    impl Scripted {
        fn new(result: Option<Coordinate>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                result,
            }
        }
    }

    #[async_trait]
    impl Geocoder for Scripted {
        async fn geocode(&self, address: &str) -> Result<Coordinate, GeocodeError> {
            self.calls.lock().push(address.to_string());
            self.result
                .ok_or_else(|| GeocodeError::NoResult(address.to_string()))
        }
    }

    #[tokio::test]
    async fn fallback_only_runs_after_primary_failure() {
        let hit = Coordinate::new(1.0, 2.0).unwrap();
        let chained = FallbackGeocoder::new(Scripted::new(Some(hit)), Scripted::new(None));
        assert_eq!(chained.geocode("a").await.unwrap(), hit);
        assert!(chained.fallback.calls.lock().is_empty());

        let chained = FallbackGeocoder::new(Scripted::new(None), Scripted::new(Some(hit)));
        assert_eq!(chained.geocode("b").await.unwrap(), hit);
        assert_eq!(chained.primary.calls.lock().as_slice(), ["b".to_string()]);
        assert_eq!(chained.fallback.calls.lock().as_slice(), ["b".to_string()]);
    }

    #[tokio::test]
    async fn fallback_reports_secondary_error() {
        let chained = FallbackGeocoder::new(Scripted::new(None), Scripted::new(None));
        let err = chained.geocode("nowhere").await.unwrap_err();
        assert!(matches!(err, GeocodeError::NoResult(address) if address == "nowhere"));
    }

    #[test]
    fn rejects_unparseable_degrees() {
        assert!(parse_degrees(" 45.5").is_ok());
        assert!(matches!(
            parse_degrees("north"),
            Err(GeocodeError::InvalidCoordinate(_))
        ));
    }
}
