use anyhow::{Context, Result};
use reqwest::header::ACCEPT;
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::auth::{AccessToken, AuthSession};
use crate::config::ClientConfig;
use crate::error::{upstream_message, PiwikError, PiwikResult};
use crate::types::{AnalyticsQuery, AnalyticsResult, Annotation, WebsiteSummary};
use crate::validation::{self, DATE_FORMAT};

pub const APPS_PATH: &str = "/api/apps/v2";
pub const ANALYTICS_QUERY_PATH: &str = "/api/analytics/v1/query";
pub const ANNOTATIONS_PATH: &str = "/api/analytics/v1/manage/annotation/user/";

/// One outbound API call, rebuilt for each attempt
struct ApiRequest<'a> {
    method: Method,
    path: String,
    query: Vec<(&'static str, String)>,
    body: Option<Value>,
    /// Named in the NotFound message, e.g. "website '42'"
    resource: &'a str,
}

/// HTTP client for the Piwik PRO API
pub struct PiwikClient {
    http: Client,
    config: ClientConfig,
    auth: Arc<AuthSession>,
}

impl PiwikClient {
    /// Create a new Piwik PRO client with its own auth session
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let auth = Arc::new(AuthSession::new(&config, http.clone()));

        Ok(Self { http, config, auth })
    }

    pub fn base_url(&self) -> &str {
        self.config.base_url.as_str()
    }

    /// List all websites/apps visible to the credentials, in upstream order
    pub async fn list_websites(&self) -> PiwikResult<Vec<WebsiteSummary>> {
        let request = ApiRequest {
            method: Method::GET,
            path: APPS_PATH.to_string(),
            query: Vec::new(),
            body: None,
            resource: "website list",
        };
        let (status, json) = self.call(&request).await?;

        let items = resource_list(&json).ok_or_else(|| PiwikError::Upstream {
            status: status.as_u16(),
            message: "apps response has no data array".to_string(),
        })?;

        items
            .iter()
            .map(|item| {
                WebsiteSummary::from_resource(item).ok_or_else(|| PiwikError::Upstream {
                    status: status.as_u16(),
                    message: format!("unexpected app entry: {}", item),
                })
            })
            .collect()
    }

    /// Get details for a single website/app
    pub async fn get_website(&self, website_id: &str) -> PiwikResult<WebsiteSummary> {
        let website_id = validation::website_id(website_id)?;
        let resource = format!("website '{}'", website_id);
        let request = ApiRequest {
            method: Method::GET,
            path: format!("{}/{}", APPS_PATH, website_id),
            query: Vec::new(),
            body: None,
            resource: &resource,
        };
        let (status, json) = self.call(&request).await?;

        let item = json.get("data").unwrap_or(&json);
        WebsiteSummary::from_resource(item).ok_or_else(|| PiwikError::Upstream {
            status: status.as_u16(),
            message: format!("unexpected app detail for {}: {}", resource, json),
        })
    }

    /// Run an analytics query. Metric names are validated upstream, not here.
    pub async fn query_analytics(&self, query: &AnalyticsQuery) -> PiwikResult<AnalyticsResult> {
        validation::analytics_query(query)?;
        let resource = format!("analytics for website '{}'", query.website_id);
        let request = ApiRequest {
            method: Method::POST,
            path: ANALYTICS_QUERY_PATH.to_string(),
            query: Vec::new(),
            body: Some(query.to_body()),
            resource: &resource,
        };

        let (status, json) = match self.call(&request).await {
            Err(PiwikError::Upstream { status, message }) if status == 400 => {
                return Err(PiwikError::Validation {
                    message: format!("Piwik PRO rejected the query: {}", message),
                    status: Some(status),
                });
            }
            other => other?,
        };

        AnalyticsResult::from_response(query, &json).map_err(|reason| PiwikError::Upstream {
            status: status.as_u16(),
            message: reason,
        })
    }

    /// Create an annotation. Not idempotent: every call creates a new record.
    pub async fn create_annotation(
        &self,
        website_id: &str,
        content: &str,
        date: Option<&str>,
        is_public: bool,
    ) -> PiwikResult<Annotation> {
        let website_id = validation::website_id(website_id)?;
        let content = validation::annotation_content(content)?;
        let date = match date {
            Some(d) => validation::date("date", d)?,
            None => chrono::Local::now().date_naive(),
        }
        .format(DATE_FORMAT)
        .to_string();

        let resource = format!("website '{}'", website_id);
        let request = ApiRequest {
            method: Method::POST,
            path: ANNOTATIONS_PATH.to_string(),
            query: Vec::new(),
            body: Some(Annotation::create_body(
                &website_id,
                &content,
                &date,
                is_public,
            )),
            resource: &resource,
        };
        let (status, json) = self.call(&request).await?;

        let id = Annotation::created_id(&json).ok_or_else(|| PiwikError::Upstream {
            status: status.as_u16(),
            message: "annotation response did not include an id".to_string(),
        })?;
        info!("Created annotation {} for website {}", id, website_id);

        Ok(Annotation {
            id,
            website_id,
            content,
            date,
            is_public,
        })
    }

    /// List annotations of a website, optionally bounded by date
    pub async fn list_annotations(
        &self,
        website_id: &str,
        date_from: Option<&str>,
        date_to: Option<&str>,
    ) -> PiwikResult<Vec<Annotation>> {
        let website_id = validation::website_id(website_id)?;
        let (from, to) = validation::optional_range(date_from, date_to)?;

        let mut query = vec![("website_id", website_id.clone())];
        if let Some(from) = from {
            query.push(("date_from", from.format(DATE_FORMAT).to_string()));
        }
        if let Some(to) = to {
            query.push(("date_to", to.format(DATE_FORMAT).to_string()));
        }

        let resource = format!("website '{}'", website_id);
        let request = ApiRequest {
            method: Method::GET,
            path: ANNOTATIONS_PATH.to_string(),
            query,
            body: None,
            resource: &resource,
        };
        let (status, json) = self.call(&request).await?;

        let items = resource_list(&json).ok_or_else(|| PiwikError::Upstream {
            status: status.as_u16(),
            message: "annotations response has no data array".to_string(),
        })?;

        items
            .iter()
            .map(|item| {
                Annotation::from_resource(item, &website_id).ok_or_else(|| {
                    PiwikError::Upstream {
                        status: status.as_u16(),
                        message: format!("unexpected annotation entry: {}", item),
                    }
                })
            })
            .collect()
    }

    /// Send a request, refreshing the token and retrying exactly once on 401
    async fn call(&self, request: &ApiRequest<'_>) -> PiwikResult<(StatusCode, Value)> {
        let (response, token) = self.send(request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return read_response(response, request.resource).await;
        }

        warn!(
            "Piwik PRO returned 401 for {} {}, refreshing token",
            request.method, request.path
        );
        self.auth.invalidate(&token).await;

        let (response, _) = self.send(request).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let text = match response.text().await {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to read 401 response body: {}", e);
                    String::new()
                }
            };
            return Err(PiwikError::Auth {
                message: format!(
                    "Piwik PRO rejected a freshly issued token: {}",
                    upstream_message(&text)
                ),
                status: Some(401),
            });
        }
        read_response(response, request.resource).await
    }

    /// Send one attempt, returning the token it was authorized with
    async fn send(&self, request: &ApiRequest<'_>) -> PiwikResult<(Response, AccessToken)> {
        let token = self.auth.get_token().await?;
        let url = self.config.endpoint(&request.path);
        debug!("Calling Piwik PRO API: {} {}", request.method, url);

        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .bearer_auth(token.value())
            .header(ACCEPT, "application/json");
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        Ok((builder.send().await?, token))
    }
}

async fn read_response(response: Response, resource: &str) -> PiwikResult<(StatusCode, Value)> {
    let status = response.status();
    let text = response.text().await?;

    if status == StatusCode::NOT_FOUND {
        return Err(PiwikError::NotFound {
            message: format!("{} not found", resource),
        });
    }
    if !status.is_success() {
        let message = upstream_message(&text);
        warn!("Piwik PRO API error ({}): {}", status, message);
        return Err(PiwikError::Upstream {
            status: status.as_u16(),
            message,
        });
    }

    if text.trim().is_empty() {
        return Ok((status, Value::Null));
    }
    let json = serde_json::from_str(&text).map_err(|e| PiwikError::Upstream {
        status: status.as_u16(),
        message: format!("invalid JSON in response: {}", e),
    })?;
    Ok((status, json))
}

/// Elements of a JSON:API `{data: [...]}` document or a bare array
fn resource_list(json: &Value) -> Option<&Vec<Value>> {
    json.as_array()
        .or_else(|| json.get("data").and_then(|d| d.as_array()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TOKEN_PATH;
    use crate::config::Credentials;
    use mockito::{Matcher, Mock, ServerGuard};
    use serde_json::json;
    use std::time::Duration;

    fn client_for(server: &ServerGuard) -> PiwikClient {
        let config = ClientConfig::new(
            Credentials::new("client", "secret", server.url()),
            Duration::from_secs(5),
        )
        .unwrap();
        PiwikClient::new(config).unwrap()
    }

    async fn token_mock(server: &mut ServerGuard, token: &str, hits: usize) -> Mock {
        server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"access_token": token, "expires_in": 1800}).to_string())
            .expect(hits)
            .create_async()
            .await
    }

    fn analytics_args(from: &str, to: &str) -> AnalyticsQuery {
        AnalyticsQuery {
            website_id: "42".to_string(),
            date_from: from.to_string(),
            date_to: to.to_string(),
            metrics: vec!["visits".to_string()],
            dimensions: Vec::new(),
            filters: None,
            offset: 0,
            limit: 100,
        }
    }

    #[tokio::test]
    async fn test_list_websites_empty_is_ok() {
        let mut server = mockito::Server::new_async().await;
        let _token = token_mock(&mut server, "tok", 1).await;
        let _apps = server
            .mock("GET", APPS_PATH)
            .match_header("authorization", "Bearer tok")
            .with_status(200)
            .with_body(r#"{"data":[],"meta":{"total":0}}"#)
            .create_async()
            .await;

        let sites = client_for(&server).list_websites().await.unwrap();
        assert!(sites.is_empty());
    }

    #[tokio::test]
    async fn test_list_websites_keeps_upstream_order() {
        let mut server = mockito::Server::new_async().await;
        let _token = token_mock(&mut server, "tok", 1).await;
        let _apps = server
            .mock("GET", APPS_PATH)
            .with_status(200)
            .with_body(
                json!({"data": [
                    {"id": "b", "attributes": {"name": "Zeta"}},
                    {"id": "a", "attributes": {"name": "Alpha"}}
                ]})
                .to_string(),
            )
            .create_async()
            .await;

        let sites = client_for(&server).list_websites().await.unwrap();
        let ids: Vec<&str> = sites.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_list_websites_bad_shape_is_upstream_error() {
        let mut server = mockito::Server::new_async().await;
        let _token = token_mock(&mut server, "tok", 1).await;
        let _apps = server
            .mock("GET", APPS_PATH)
            .with_status(200)
            .with_body(r#"{"data":{"unexpected":true}}"#)
            .create_async()
            .await;

        let err = client_for(&server).list_websites().await.unwrap_err();
        assert_eq!(err.kind(), "upstream_error");
        assert_eq!(err.status(), Some(200));
    }

    #[tokio::test]
    async fn test_get_website_not_found_names_id() {
        let mut server = mockito::Server::new_async().await;
        let _token = token_mock(&mut server, "tok", 1).await;
        let _app = server
            .mock("GET", "/api/apps/v2/nonexistent")
            .with_status(404)
            .with_body(r#"{"errors":[{"status":"404","title":"Not found"}]}"#)
            .create_async()
            .await;

        let err = client_for(&server)
            .get_website("nonexistent")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found_error");
        assert!(err.to_string().contains("nonexistent"));
    }

    #[tokio::test]
    async fn test_get_website_detail() {
        let mut server = mockito::Server::new_async().await;
        let _token = token_mock(&mut server, "tok", 1).await;
        let _app = server
            .mock("GET", "/api/apps/v2/42")
            .with_status(200)
            .with_body(
                json!({"data": {"id": "42", "attributes": {
                    "name": "Shop", "urls": ["https://shop.example.com"], "timezone": "UTC"
                }}})
                .to_string(),
            )
            .create_async()
            .await;

        let site = client_for(&server).get_website("42").await.unwrap();
        assert_eq!(site.name.as_deref(), Some("Shop"));
        assert_eq!(site.url.as_deref(), Some("https://shop.example.com"));
    }

    #[tokio::test]
    async fn test_get_website_empty_id_makes_no_calls() {
        let mut server = mockito::Server::new_async().await;
        let token = token_mock(&mut server, "tok", 0).await;

        let err = client_for(&server).get_website("  ").await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_retry_once_after_401() {
        let mut server = mockito::Server::new_async().await;
        let first_token = token_mock(&mut server, "stale", 1).await;
        let second_token = token_mock(&mut server, "fresh", 1).await;
        let rejected = server
            .mock("POST", ANALYTICS_QUERY_PATH)
            .match_header("authorization", "Bearer stale")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let accepted = server
            .mock("POST", ANALYTICS_QUERY_PATH)
            .match_header("authorization", "Bearer fresh")
            .with_status(200)
            .with_body(r#"{"data":[[99]],"meta":{"columns":["sessions"]}}"#)
            .expect(1)
            .create_async()
            .await;

        let result = client_for(&server)
            .query_analytics(&analytics_args("2023-04-01", "2023-04-30"))
            .await
            .unwrap();

        assert_eq!(result.values.unwrap().get("visits"), Some(&json!(99)));
        first_token.assert_async().await;
        second_token.assert_async().await;
        rejected.assert_async().await;
        accepted.assert_async().await;
    }

    #[tokio::test]
    async fn test_concurrent_401s_refresh_once() {
        let mut server = mockito::Server::new_async().await;
        let revoked = token_mock(&mut server, "t0", 1).await;
        let replacement = token_mock(&mut server, "t1", 1).await;
        let _rejected = server
            .mock("GET", APPS_PATH)
            .match_header("authorization", "Bearer t0")
            .with_status(401)
            .expect(2)
            .create_async()
            .await;
        let accepted = server
            .mock("GET", APPS_PATH)
            .match_header("authorization", "Bearer t1")
            .with_status(200)
            .with_body(r#"{"data":[]}"#)
            .expect(2)
            .create_async()
            .await;

        let client = client_for(&server);
        assert_eq!(client.auth.get_token().await.unwrap().value(), "t0");

        let (a, b) = tokio::join!(client.list_websites(), client.list_websites());
        assert!(a.is_ok());
        assert!(b.is_ok());
        revoked.assert_async().await;
        replacement.assert_async().await;
        accepted.assert_async().await;
    }

    #[tokio::test]
    async fn test_second_401_is_auth_error() {
        let mut server = mockito::Server::new_async().await;
        let token = token_mock(&mut server, "tok", 2).await;
        let apps = server
            .mock("GET", APPS_PATH)
            .with_status(401)
            .with_body(r#"{"message":"token revoked"}"#)
            .expect(2)
            .create_async()
            .await;

        let err = client_for(&server).list_websites().await.unwrap_err();
        assert_eq!(err.kind(), "auth_error");
        assert_eq!(err.status(), Some(401));
        token.assert_async().await;
        apps.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_upstream_error_without_retry() {
        let mut server = mockito::Server::new_async().await;
        let _token = token_mock(&mut server, "tok", 1).await;
        let apps = server
            .mock("GET", APPS_PATH)
            .with_status(503)
            .with_body(r#"{"message":"maintenance"}"#)
            .expect(1)
            .create_async()
            .await;

        let err = client_for(&server).list_websites().await.unwrap_err();
        assert_eq!(err.kind(), "upstream_error");
        assert_eq!(err.status(), Some(503));
        assert!(err.to_string().contains("maintenance"));
        apps.assert_async().await;
    }

    #[tokio::test]
    async fn test_query_sends_column_ids() {
        let mut server = mockito::Server::new_async().await;
        let _token = token_mock(&mut server, "tok", 1).await;
        let query = server
            .mock("POST", ANALYTICS_QUERY_PATH)
            .match_body(Matcher::PartialJson(json!({
                "website_id": "42",
                "date_from": "2023-04-01",
                "date_to": "2023-04-30",
                "columns": [{"column_id": "sessions"}]
            })))
            .with_status(200)
            .with_body(r#"{"data":[[5]]}"#)
            .expect(1)
            .create_async()
            .await;

        client_for(&server)
            .query_analytics(&analytics_args("2023-04-01", "2023-04-30"))
            .await
            .unwrap();
        query.assert_async().await;
    }

    #[tokio::test]
    async fn test_query_inverted_range_makes_no_calls() {
        let mut server = mockito::Server::new_async().await;
        let token = token_mock(&mut server, "tok", 0).await;

        let err = client_for(&server)
            .query_analytics(&analytics_args("2023-05-01", "2023-04-01"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_query_400_is_validation_error() {
        let mut server = mockito::Server::new_async().await;
        let _token = token_mock(&mut server, "tok", 1).await;
        let _query = server
            .mock("POST", ANALYTICS_QUERY_PATH)
            .with_status(400)
            .with_body(r#"{"errors":[{"title":"Unknown column","detail":"bogus"}]}"#)
            .create_async()
            .await;

        let err = client_for(&server)
            .query_analytics(&analytics_args("2023-04-01", "2023-04-30"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert_eq!(err.status(), Some(400));
        assert!(err.to_string().contains("bogus"));
    }

    #[tokio::test]
    async fn test_create_annotation_echoes_fields() {
        let mut server = mockito::Server::new_async().await;
        let _token = token_mock(&mut server, "tok", 1).await;
        let create = server
            .mock("POST", ANNOTATIONS_PATH)
            .match_body(Matcher::PartialJson(json!({
                "data": {"type": "UserAnnotation", "attributes": {
                    "content": "Launch",
                    "website_id": "42",
                    "date": "2023-04-15",
                    "visibility": "private"
                }}
            })))
            .with_status(201)
            .with_body(r#"{"id":"abc123"}"#)
            .expect(1)
            .create_async()
            .await;

        let annotation = client_for(&server)
            .create_annotation("42", "Launch", Some("2023-04-15"), false)
            .await
            .unwrap();

        assert_eq!(
            annotation,
            Annotation {
                id: "abc123".to_string(),
                website_id: "42".to_string(),
                content: "Launch".to_string(),
                date: "2023-04-15".to_string(),
                is_public: false,
            }
        );
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_create_annotation_keeps_content_verbatim() {
        let mut server = mockito::Server::new_async().await;
        let _token = token_mock(&mut server, "tok", 1).await;
        let create = server
            .mock("POST", ANNOTATIONS_PATH)
            .match_body(Matcher::PartialJson(json!({
                "data": {"attributes": {"content": "  Launch day "}}
            })))
            .with_status(201)
            .with_body(r#"{"id":"abc123"}"#)
            .expect(1)
            .create_async()
            .await;

        let annotation = client_for(&server)
            .create_annotation("42", "  Launch day ", Some("2023-04-15"), false)
            .await
            .unwrap();
        assert_eq!(annotation.content, "  Launch day ");
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_create_annotation_defaults_to_today() {
        let mut server = mockito::Server::new_async().await;
        let _token = token_mock(&mut server, "tok", 1).await;
        let _create = server
            .mock("POST", ANNOTATIONS_PATH)
            .with_status(201)
            .with_body(r#"{"data":{"id":"n1","type":"UserAnnotation"}}"#)
            .create_async()
            .await;

        let annotation = client_for(&server)
            .create_annotation("42", "Release", None, true)
            .await
            .unwrap();
        assert_eq!(annotation.id, "n1");
        assert!(validation::date("date", &annotation.date).is_ok());
        assert!(annotation.is_public);
    }

    #[tokio::test]
    async fn test_create_annotation_too_long_makes_no_calls() {
        let mut server = mockito::Server::new_async().await;
        let token = token_mock(&mut server, "tok", 0).await;

        let err = client_for(&server)
            .create_annotation("42", &"x".repeat(151), None, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_list_annotations_passes_range() {
        let mut server = mockito::Server::new_async().await;
        let _token = token_mock(&mut server, "tok", 1).await;
        let list = server
            .mock("GET", ANNOTATIONS_PATH)
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("website_id".to_string(), "42".to_string()),
                Matcher::UrlEncoded("date_from".to_string(), "2023-04-01".to_string()),
                Matcher::UrlEncoded("date_to".to_string(), "2023-04-30".to_string()),
            ]))
            .with_status(200)
            .with_body(
                json!({"data": [
                    {"id": "2", "attributes": {"content": "B", "date": "2023-04-20", "visibility": "public"}},
                    {"id": "1", "attributes": {"content": "A", "date": "2023-04-02", "visibility": "private"}}
                ]})
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;

        let annotations = client_for(&server)
            .list_annotations("42", Some("2023-04-01"), Some("2023-04-30"))
            .await
            .unwrap();

        assert_eq!(annotations.len(), 2);
        assert_eq!(annotations[0].id, "2");
        assert!(annotations[0].is_public);
        assert_eq!(annotations[1].website_id, "42");
        list.assert_async().await;
    }

    #[tokio::test]
    async fn test_concurrent_calls_share_one_exchange() {
        let mut server = mockito::Server::new_async().await;
        let token = token_mock(&mut server, "tok", 1).await;
        let apps = server
            .mock("GET", APPS_PATH)
            .with_status(200)
            .with_body(r#"{"data":[]}"#)
            .expect(2)
            .create_async()
            .await;

        let client = client_for(&server);
        let (a, b) = tokio::join!(client.list_websites(), client.list_websites());
        assert!(a.is_ok());
        assert!(b.is_ok());
        token.assert_async().await;
        apps.assert_async().await;
    }
}
