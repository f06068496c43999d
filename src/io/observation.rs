use crate::core::timeseries::{Lake, LongFormTable, PayloadBuilder, RowPolicy, StatisticKind};
use crate::types::{FeatureMap, SkippedItem, WqpError, WqpResult};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;

const EXPIRED_SIGNATURE: &str = "Signature has expired";
const OFFERING: &str = "temporary";

/// Connection settings for the observation-data service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationConfig {
    /// Base URL, e.g. `https://istsos.example.org`
    pub host: String,
    /// Service instance name
    pub service: String,
    /// Lake whose procedures are managed (COMO, LUGANO, MAGGIORE)
    pub lake: String,
    /// JSON file holding the token request form fields
    pub credentials_path: PathBuf,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost".to_string(),
            service: "demo".to_string(),
            lake: "MAGGIORE".to_string(),
            credentials_path: PathBuf::from("credentials.json"),
            timeout_secs: 100,
        }
    }
}

impl ObservationConfig {
    pub fn token_url(&self) -> String {
        format!("{}/auth/realms/istsos/protocol/openid-connect/token", self.host)
    }

    pub fn api_endpoint(&self) -> String {
        format!("{}/istsos/wa/istsos/services/{}", self.host, self.service)
    }
}

/// True for the service's "token expired" answer
pub fn is_expired_signature(status: StatusCode, body: &Value) -> bool {
    status == StatusCode::UNAUTHORIZED
        && body.get("message").and_then(Value::as_str) == Some(EXPIRED_SIGNATURE)
}

/// Run `attempt`; on `ExpiredCredential` run `refresh` and try exactly once more
pub fn retry_once_on_expired<S, T>(
    state: &mut S,
    mut attempt: impl FnMut(&mut S) -> WqpResult<T>,
    mut refresh: impl FnMut(&mut S) -> WqpResult<()>,
) -> WqpResult<T> {
    match attempt(state) {
        Err(WqpError::ExpiredCredential) => {
            log::info!("Updating authentication token");
            refresh(state)?;
            attempt(state)
        }
        other => other,
    }
}

/// Blocking client for the istSOS REST API
pub struct ObservationClient {
    http: Client,
    token_url: String,
    api_endpoint: String,
    credentials: HashMap<String, String>,
    procedures: Vec<String>,
    token: Option<String>,
}

impl ObservationClient {
    /// Build a client; credentials are read from the configured JSON file
    pub fn new(config: &ObservationConfig) -> WqpResult<Self> {
        let lake: Lake = config.lake.parse()?;
        let raw = std::fs::read_to_string(&config.credentials_path)?;
        let fields: HashMap<String, Value> = serde_json::from_str(&raw)?;
        let credentials = fields
            .into_iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, v)
            })
            .collect();

        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("lakewqp/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            token_url: config.token_url(),
            api_endpoint: config.api_endpoint(),
            credentials,
            procedures: lake.procedures(),
            token: None,
        })
    }

    pub fn procedures(&self) -> &[String] {
        &self.procedures
    }

    /// Fetch a new bearer token
    pub fn refresh_token(&mut self) -> WqpResult<()> {
        let response = self.http.post(&self.token_url).form(&self.credentials).send()?;
        let status = response.status();
        let body: Value = response.json()?;

        let token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| WqpError::Service(format!("Token request failed ({}): {}", status, body)))?;
        self.token = Some(token.to_string());
        log::debug!("Bearer token refreshed");
        Ok(())
    }

    fn send_once(&mut self, build: &dyn Fn(&Client) -> RequestBuilder) -> WqpResult<(StatusCode, Value)> {
        if self.token.is_none() {
            self.refresh_token()?;
        }
        let token = self.token.clone().unwrap_or_default();
        let response = build(&self.http).bearer_auth(token).send()?;
        let status = response.status();
        let body = response.json::<Value>().unwrap_or(Value::Null);

        if is_expired_signature(status, &body) {
            return Err(WqpError::ExpiredCredential);
        }
        Ok((status, body))
    }

    fn send(&mut self, build: &dyn Fn(&Client) -> RequestBuilder) -> WqpResult<(StatusCode, Value)> {
        retry_once_on_expired(self, |client| client.send_once(build), |client| client.refresh_token())
    }

    /// Assigned sensor id per procedure of the lake; empty when the service has none
    pub fn procedure_ids(&mut self) -> WqpResult<FeatureMap<String>> {
        let mut ids = FeatureMap::new();
        for procedure in self.procedures.clone() {
            let url = format!("{}/procedures/{}", self.api_endpoint, procedure);
            let (status, body) = self.send(&|http| http.get(&url))?;

            let id = if status.is_success() {
                body.pointer("/data/assignedSensorId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| {
                        log::warn!("The procedure {} has not been provided with an ID", procedure);
                        String::new()
                    })
            } else {
                log::warn!("Procedure {} lookup failed with HTTP {}", procedure, status);
                String::new()
            };
            ids.insert(procedure, id);
        }
        Ok(ids)
    }

    /// Last observation of a procedure, used as payload template
    pub fn request_sample(&mut self, procedure: &str) -> WqpResult<Value> {
        let url = format!(
            "{}/operations/getobservation/offerings/{}/procedures/{}/observedproperties/:/eventtime/last",
            self.api_endpoint, OFFERING, procedure
        );
        let (_, body) = self.send(&|http| http.get(&url))?;

        let message = body.get("message").and_then(Value::as_str).unwrap_or_default().to_string();
        if body.get("success").and_then(Value::as_bool) != Some(true) {
            return Err(WqpError::Service(format!("Sample request for {} failed: {}", procedure, message)));
        }
        log::info!("{}", message);

        body.pointer("/data/0")
            .cloned()
            .ok_or_else(|| WqpError::Service(format!("No sample observation for {}", procedure)))
    }

    /// Insert an observation payload for a sensor
    pub fn insert_observation(&mut self, assigned_sensor_id: &str, observation: &Value) -> WqpResult<Value> {
        let url = format!("{}/operations/insertobservation", self.api_endpoint);
        let body = json!({
            "AssignedSensorId": assigned_sensor_id,
            "ForceInsert": "true",
            "Observation": observation,
        });
        let (status, response) = self.send(&|http| http.post(&url).json(&body))?;

        if !status.is_success() || response.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(WqpError::Service(format!(
                "Insert observation failed ({}): {}",
                status,
                response.get("message").and_then(Value::as_str).unwrap_or_default()
            )));
        }
        log::info!("Observation inserted for sensor {}", assigned_sensor_id);
        Ok(response)
    }

    /// Build and insert the payload of one procedure from a statistics table
    pub fn publish(
        &mut self,
        table: &LongFormTable,
        procedure: &str,
        assigned_sensor_id: &str,
        policy: RowPolicy,
    ) -> WqpResult<Vec<SkippedItem>> {
        let sample = self.request_sample(procedure)?;
        let statistic = StatisticKind::from_procedure(procedure);
        let (payload, skipped) = PayloadBuilder::build_payload(table, &sample, procedure, statistic, policy)?;
        self.insert_observation(assigned_sensor_id, &payload)?;
        Ok(skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_signature_detection() {
        let expired = json!({"message": "Signature has expired"});
        assert!(is_expired_signature(StatusCode::UNAUTHORIZED, &expired));
        assert!(!is_expired_signature(StatusCode::OK, &expired));
        assert!(!is_expired_signature(StatusCode::UNAUTHORIZED, &json!({"message": "Invalid"})));
        assert!(!is_expired_signature(StatusCode::UNAUTHORIZED, &Value::Null));
    }

    struct Session {
        attempts: usize,
        refreshes: usize,
        fresh: bool,
    }

    fn attempt(s: &mut Session) -> WqpResult<&'static str> {
        s.attempts += 1;
        if s.fresh {
            Ok("done")
        } else {
            Err(WqpError::ExpiredCredential)
        }
    }

    #[test]
    fn test_retry_after_refresh() {
        let mut session = Session { attempts: 0, refreshes: 0, fresh: false };
        let result = retry_once_on_expired(&mut session, attempt, |s| {
            s.refreshes += 1;
            s.fresh = true;
            Ok(())
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!((session.attempts, session.refreshes), (2, 1));
    }

    #[test]
    fn test_retry_only_once() {
        let mut session = Session { attempts: 0, refreshes: 0, fresh: false };
        let result = retry_once_on_expired(&mut session, attempt, |s| {
            s.refreshes += 1;
            Ok(())
        });
        assert!(matches!(result, Err(WqpError::ExpiredCredential)));
        assert_eq!((session.attempts, session.refreshes), (2, 1));
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let mut calls = 0;
        let result: WqpResult<()> = retry_once_on_expired(
            &mut calls,
            |c| {
                *c += 1;
                Err(WqpError::Service("down".into()))
            },
            |_| Ok(()),
        );
        assert!(matches!(result, Err(WqpError::Service(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_config_endpoints_and_client_setup() {
        let dir = tempfile::tempdir().unwrap();
        let credentials = dir.path().join("credentials.json");
        std::fs::write(&credentials, r#"{"grant_type": "password", "client_id": "istsos", "port": 8080}"#).unwrap();

        let config = ObservationConfig {
            host: "https://sos.example.org".into(),
            service: "lakes".into(),
            lake: "lugano".into(),
            credentials_path: credentials,
            timeout_secs: 5,
        };
        assert_eq!(
            config.token_url(),
            "https://sos.example.org/auth/realms/istsos/protocol/openid-connect/token"
        );
        assert_eq!(config.api_endpoint(), "https://sos.example.org/istsos/wa/istsos/services/lakes");

        let client = ObservationClient::new(&config).unwrap();
        assert_eq!(client.procedures().len(), 16);
        assert_eq!(client.credentials.get("port").map(String::as_str), Some("8080"));
    }
}
