//! JSON REST provider adapter.
//!
//! Routes:
//!
//! - `POST {endpoint}/resources` creates an object
//! - `PATCH {endpoint}/resources/{type}/{id}` updates it
//! - `DELETE {endpoint}/resources/{type}/{id}` deletes it
//! - `GET {endpoint}/resources/{type}/{id}` reads its outputs

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{ConvergeError, ProviderError, ProviderResult, Result};
use crate::model::Value;
use crate::state::Outputs;

use super::{Created, Provider, ResourceChanges, ResourceSpec};

/// Header carrying [`ResourceSpec::request_id`] on creates.
const IDEMPOTENCY_KEY: &str = "idempotency-key";

/// Retry delay assumed for a 429 without a usable `Retry-After` header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// HTTP provider adapter.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Base URL without a trailing slash.
    endpoint: String,
    /// Bearer token, if any.
    token: Option<String>,
}

/// Create request body.
#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    #[serde(rename = "type")]
    resource_type: &'a str,
    name: &'a str,
    properties: &'a BTreeMap<String, Value>,
}

/// Update request body.
#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    changed: &'a [String],
    properties: &'a BTreeMap<String, Value>,
}

/// Create response body.
#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
    #[serde(default)]
    outputs: Outputs,
}

/// Update and read response body.
#[derive(Debug, Deserialize)]
struct ObjectResponse {
    #[serde(default)]
    outputs: Outputs,
}

impl HttpProvider {
    /// Creates a new HTTP provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            ConvergeError::Provider(ProviderError::permanent(format!(
                "Failed to create HTTP client: {e}"
            )))
        })?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// URL of an existing object.
    fn object_url(&self, resource_type: &str, provider_id: &str) -> String {
        format!("{}/resources/{resource_type}/{provider_id}", self.endpoint)
    }

    /// Adds the bearer token to a request.
    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    /// Sends a request, mapping transport failures.
    async fn send(&self, request: reqwest::RequestBuilder) -> ProviderResult<Response> {
        self.authorize(request)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(classify_transport)
    }

    /// Parses a successful JSON body.
    async fn parse<T: for<'de> Deserialize<'de>>(response: Response) -> ProviderResult<T> {
        response.json().await.map_err(|e| {
            ProviderError::permanent(format!("Failed to parse provider response: {e}"))
        })
    }
}

/// Classifies a transport failure.
///
/// A timed-out create may have landed; its retry carries the same
/// `Idempotency-Key`, and providers that ignore the header can end up with
/// a duplicate object.
fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() {
        ProviderError::transient(format!("Request failed: {err}"))
    } else {
        ProviderError::permanent(format!("Request failed: {err}"))
    }
}

/// Classifies an unsuccessful response.
async fn classify_status(response: Response, provider_id: Option<&str>) -> ProviderError {
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
        return ProviderError::Transient {
            message: String::from("Rate limited by provider"),
            retry_after: Some(Duration::from_secs(retry_after)),
        };
    }

    if status == StatusCode::NOT_FOUND
        && let Some(id) = provider_id
    {
        return ProviderError::NotFound {
            provider_id: id.to_string(),
        };
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("HTTP {}: {body}", status.as_u16());

    if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
        ProviderError::transient(message)
    } else {
        ProviderError::permanent(message)
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn create_resource(&self, spec: &ResourceSpec) -> ProviderResult<Created> {
        let url = format!("{}/resources", self.endpoint);
        trace!("POST {url} ({})", spec.id);

        let body = CreateRequest {
            resource_type: &spec.id.resource_type,
            name: &spec.id.name,
            properties: &spec.properties,
        };
        let mut request = self.client.post(&url).json(&body);
        if !spec.request_id.is_empty() {
            request = request.header(IDEMPOTENCY_KEY, &spec.request_id);
        }
        let response = self.send(request).await?;

        if !response.status().is_success() {
            return Err(classify_status(response, None).await);
        }

        let created: CreateResponse = Self::parse(response).await?;
        debug!("Provider created {} as {}", spec.id, created.id);
        Ok(Created {
            provider_id: created.id,
            outputs: created.outputs,
        })
    }

    async fn update_resource(
        &self,
        provider_id: &str,
        changes: &ResourceChanges,
    ) -> ProviderResult<Outputs> {
        let url = self.object_url(&changes.id.resource_type, provider_id);
        trace!("PATCH {url}");

        let body = UpdateRequest {
            changed: &changes.changed,
            properties: &changes.properties,
        };
        let response = self.send(self.client.patch(&url).json(&body)).await?;

        if !response.status().is_success() {
            return Err(classify_status(response, Some(provider_id)).await);
        }

        let object: ObjectResponse = Self::parse(response).await?;
        Ok(object.outputs)
    }

    async fn delete_resource(&self, resource_type: &str, provider_id: &str) -> ProviderResult<()> {
        let url = self.object_url(resource_type, provider_id);
        trace!("DELETE {url}");

        let response = self.send(self.client.delete(&url)).await?;

        if !response.status().is_success() {
            return Err(classify_status(response, Some(provider_id)).await);
        }
        Ok(())
    }

    async fn read_resource(
        &self,
        resource_type: &str,
        provider_id: &str,
    ) -> ProviderResult<Option<Outputs>> {
        let url = self.object_url(resource_type, provider_id);
        trace!("GET {url}");

        let response = self.send(self.client.get(&url)).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(classify_status(response, Some(provider_id)).await);
        }

        let object: ObjectResponse = Self::parse(response).await?;
        Ok(Some(object.outputs))
    }

    fn kind(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceId;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> HttpProvider {
        HttpProvider::new(
            &format!("{}/", server.uri()),
            Some(String::from("secret")),
            Duration::from_secs(5),
        )
        .expect("client")
    }

    fn spec() -> ResourceSpec {
        let mut properties = BTreeMap::new();
        properties.insert(String::from("image"), Value::from("ubuntu-24.04"));
        ResourceSpec::new(ResourceId::new("compute_instance", "web"), properties)
    }

    #[tokio::test]
    async fn test_create_sends_spec_and_returns_identity() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({
                "type": "compute_instance",
                "name": "web",
                "properties": { "image": "ubuntu-24.04" }
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "i-0abc",
                "outputs": { "public_ip": "203.0.113.7" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let created = provider(&server)
            .create_resource(&spec())
            .await
            .expect("create");
        assert_eq!(created.provider_id, "i-0abc");
        assert_eq!(created.outputs["public_ip"], Value::from("203.0.113.7"));
    }

    #[tokio::test]
    async fn test_create_retry_reuses_idempotency_key() {
        let server = MockServer::start().await;
        let spec = spec();
        Mock::given(method("POST"))
            .and(header("idempotency-key", spec.request_id.as_str()))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(header("idempotency-key", spec.request_id.as_str()))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "i-0abc" })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider(&server);
        let err = provider.create_resource(&spec).await.expect_err("unavailable");
        assert!(err.is_transient());

        let created = provider.create_resource(&spec).await.expect("retry");
        assert_eq!(created.provider_id, "i-0abc");

        let next_step = ResourceSpec::new(spec.id.clone(), spec.properties.clone());
        assert_ne!(next_step.request_id, spec.request_id);
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient_with_hint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;

        let err = provider(&server)
            .create_resource(&spec())
            .await
            .expect_err("rate limited");
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn test_server_error_is_transient_client_error_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/resources/compute_instance/i-1"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/resources/compute_instance/i-2"))
            .respond_with(ResponseTemplate::new(422).set_body_string("invalid image"))
            .mount(&server)
            .await;

        let provider = provider(&server);
        let changes = ResourceChanges {
            id: ResourceId::new("compute_instance", "web"),
            changed: vec![String::from("image")],
            properties: spec().properties,
        };

        let err = provider
            .update_resource("i-1", &changes)
            .await
            .expect_err("unavailable");
        assert!(err.is_transient());

        let err = provider
            .update_resource("i-2", &changes)
            .await
            .expect_err("invalid");
        assert!(matches!(err, ProviderError::Permanent { ref message } if message.contains("invalid image")));
    }

    #[tokio::test]
    async fn test_delete_missing_object_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/resources/key_pair/kp-9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = provider(&server)
            .delete_resource("key_pair", "kp-9")
            .await
            .expect_err("missing");
        assert_eq!(
            err,
            ProviderError::NotFound {
                provider_id: String::from("kp-9")
            }
        );
    }

    #[tokio::test]
    async fn test_read_resource() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resources/compute_instance/i-0abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "outputs": { "public_ip": "203.0.113.8" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/resources/compute_instance/i-gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = provider(&server);
        let outputs = provider
            .read_resource("compute_instance", "i-0abc")
            .await
            .expect("read")
            .expect("exists");
        assert_eq!(outputs["public_ip"], Value::from("203.0.113.8"));

        assert!(
            provider
                .read_resource("compute_instance", "i-gone")
                .await
                .expect("read")
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let provider = HttpProvider::new("http://127.0.0.1:9", None, Duration::from_secs(2))
            .expect("client");
        let err = provider
            .delete_resource("vm", "i-1")
            .await
            .expect_err("unreachable");
        assert!(err.is_transient());
    }
}
