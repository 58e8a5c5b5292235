//! OSRM HTTP adapter for point-to-point legs and distance tables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::Coordinate;
use crate::traits::{ProviderError, ProviderLeg, ProviderTable, TravelCostProvider};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OsrmConfig {
    pub base_url: String,
    pub profile: String,
    pub timeout_secs: u64,
}

impl Default for OsrmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            profile: "car".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OsrmClient {
    config: OsrmConfig,
    client: reqwest::blocking::Client,
}

impl OsrmClient {
    pub fn new(config: OsrmConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    fn coordinates(points: &[Coordinate]) -> String {
        points
            .iter()
            .map(|point| format!("{:.6},{:.6}", point.lng, point.lat))
            .collect::<Vec<_>>()
            .join(";")
    }

    fn route_url(&self, from: Coordinate, to: Coordinate) -> String {
        format!(
            "{}/route/v1/{}/{}?overview=false",
            self.config.base_url.trim_end_matches('/'),
            self.config.profile,
            Self::coordinates(&[from, to])
        )
    }

    fn table_url(&self, points: &[Coordinate]) -> String {
        format!(
            "{}/table/v1/{}/{}?annotations=distance,duration",
            self.config.base_url.trim_end_matches('/'),
            self.config.profile,
            Self::coordinates(points)
        )
    }

    fn fetch<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<T, ProviderError> {
        self.client
            .get(url)
            .timeout(timeout)
            .send()
            .and_then(|resp| resp.error_for_status())
            .map_err(|err| classify(&err, url, timeout))?
            .json::<T>()
            .map_err(|err| ProviderError::Malformed(err.to_string()))
    }
}

/// Map a reqwest failure onto the provider error taxonomy.
fn classify(error: &reqwest::Error, url: &str, timeout: Duration) -> ProviderError {
    if error.is_timeout() {
        return ProviderError::Timeout {
            url: url.to_owned(),
            timeout_secs: timeout.as_secs(),
        };
    }
    if let Some(status) = error.status() {
        return ProviderError::Status {
            url: url.to_owned(),
            status: status.as_u16(),
        };
    }
    ProviderError::Transport {
        url: url.to_owned(),
        message: error.to_string(),
    }
}

impl TravelCostProvider for OsrmClient {
    fn leg(
        &self,
        from: Coordinate,
        to: Coordinate,
        timeout: Duration,
    ) -> Result<ProviderLeg, ProviderError> {
        let url = self.route_url(from, to);
        let body: OsrmRouteResponse = self.fetch(&url, timeout)?;
        body.into_leg()
    }

    fn table(
        &self,
        points: &[Coordinate],
        timeout: Duration,
    ) -> Result<ProviderTable, ProviderError> {
        if points.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.table_url(points);
        let body: OsrmTableResponse = self.fetch(&url, timeout)?;
        body.into_table(points.len())
    }
}

#[derive(Debug, Deserialize)]
struct OsrmRouteResponse {
    code: String,
    message: Option<String>,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    distance: f64,
    duration: f64,
}

impl OsrmRouteResponse {
    fn into_leg(self) -> Result<ProviderLeg, ProviderError> {
        if self.code != "Ok" {
            return Err(ProviderError::Service {
                code: self.code,
                message: self.message.unwrap_or_default(),
            });
        }
        let route = self
            .routes
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Malformed("route response has no routes".to_string()))?;
        Ok(ProviderLeg {
            distance_meters: route.distance,
            duration_seconds: route.duration,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OsrmTableResponse {
    code: String,
    message: Option<String>,
    distances: Option<Vec<Vec<Option<f64>>>>,
    durations: Option<Vec<Vec<Option<f64>>>>,
}

impl OsrmTableResponse {
    fn into_table(self, size: usize) -> Result<ProviderTable, ProviderError> {
        if self.code != "Ok" {
            return Err(ProviderError::Service {
                code: self.code,
                message: self.message.unwrap_or_default(),
            });
        }
        let (Some(distances), Some(durations)) = (self.distances, self.durations) else {
            return Err(ProviderError::Malformed(
                "table response missing distances or durations".to_string(),
            ));
        };
        if distances.len() != size || durations.len() != size {
            return Err(ProviderError::Malformed(format!(
                "expected {size} table rows, got {} distances and {} durations",
                distances.len(),
                durations.len()
            )));
        }

        Ok(distances
            .into_iter()
            .zip(durations)
            .map(|(distance_row, duration_row)| {
                (0..size)
                    .map(|j| {
                        let distance = distance_row.get(j).copied().flatten()?;
                        let duration = duration_row.get(j).copied().flatten()?;
                        Some(ProviderLeg {
                            distance_meters: distance,
                            duration_seconds: duration,
                        })
                    })
                    .collect()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> OsrmClient {
        OsrmClient::new(OsrmConfig {
            base_url: "http://osrm.example.com/".to_string(),
            ..OsrmConfig::default()
        })
        .expect("client should build")
    }

    #[test]
    fn route_url_uses_lng_lat_order() {
        let url = client().route_url(Coordinate::new(-6.1, 106.9), Coordinate::new(-6.2, 106.8));
        assert_eq!(
            url,
            "http://osrm.example.com/route/v1/car/106.900000,-6.100000;106.800000,-6.200000?overview=false"
        );
    }

    #[test]
    fn table_url_requests_distance_and_duration() {
        let url = client().table_url(&[Coordinate::new(1.0, 2.0), Coordinate::new(3.0, 4.0)]);
        assert!(url.starts_with("http://osrm.example.com/table/v1/car/2.000000,1.000000;4.000000,3.000000"));
        assert!(url.ends_with("annotations=distance,duration"));
    }

    #[test]
    fn route_response_yields_first_route() {
        let body: OsrmRouteResponse = serde_json::from_str(
            r#"{"code":"Ok","routes":[{"distance":1523.4,"duration":301.2},{"distance":9.0,"duration":9.0}]}"#,
        )
        .expect("should deserialize");
        let leg = body.into_leg().expect("leg");
        assert_eq!(leg.distance_meters, 1523.4);
        assert_eq!(leg.duration_seconds, 301.2);
    }

    #[test]
    fn route_response_error_code() {
        let body: OsrmRouteResponse =
            serde_json::from_str(r#"{"code":"NoRoute","message":"Impossible route"}"#)
                .expect("should deserialize");
        let err = body.into_leg().expect_err("NoRoute must fail");
        assert_eq!(
            err,
            ProviderError::Service {
                code: "NoRoute".to_string(),
                message: "Impossible route".to_string()
            }
        );
    }

    #[test]
    fn table_response_keeps_null_cells() {
        let body: OsrmTableResponse = serde_json::from_str(
            r#"{
                "code": "Ok",
                "distances": [[0.0, 1000.0], [null, 0.0]],
                "durations": [[0.0, 120.0], [130.0, 0.0]]
            }"#,
        )
        .expect("should deserialize");
        let table = body.into_table(2).expect("table");
        assert_eq!(
            table[0][1],
            Some(ProviderLeg {
                distance_meters: 1000.0,
                duration_seconds: 120.0
            })
        );
        assert_eq!(table[1][0], None);
    }

    #[test]
    fn table_response_wrong_shape_is_malformed() {
        let body: OsrmTableResponse = serde_json::from_str(
            r#"{"code":"Ok","distances":[[0.0]],"durations":[[0.0]]}"#,
        )
        .expect("should deserialize");
        assert!(matches!(body.into_table(2), Err(ProviderError::Malformed(_))));
    }
}
