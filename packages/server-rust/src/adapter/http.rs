//! HTTP adapter for the catalog API.
//!
//! Every operation is a `GET` against one base URL with `Action=<name>`, the
//! positional arguments bound to named query parameters, and the remaining
//! kwargs passed through. The raw response body is returned as a string;
//! parsing it into typed records is left to the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use colander_core::hash::CONTROL_KWARGS;
use colander_core::Value;

use super::{CallError, OperationHandler};
use crate::service::operation::OperationContext;

/// Connection settings for [`HttpAdapter`].
#[derive(Debug, Clone)]
pub struct HttpAdapterConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
    /// Bound on the whole request once connected.
    pub read_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpAdapterConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api".to_string(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            user_agent: concat!("colander/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Shared HTTP client for catalog operations.
#[derive(Clone)]
pub struct HttpAdapter {
    client: reqwest::Client,
    base_url: Arc<str>,
}

impl HttpAdapter {
    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new(config: &HttpAdapterConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            base_url: Arc::from(config.base_url.as_str()),
        })
    }

    /// Handler for `action`, binding positional arguments to `params` in order.
    #[must_use]
    pub fn operation(&self, action: &str, params: &[&'static str]) -> HttpOperation {
        HttpOperation {
            adapter: self.clone(),
            action: action.to_string(),
            params: params.to_vec(),
        }
    }
}

/// One catalog API action.
pub struct HttpOperation {
    adapter: HttpAdapter,
    action: String,
    params: Vec<&'static str>,
}

impl HttpOperation {
    fn query(&self, ctx: &OperationContext) -> Result<Vec<(String, String)>, CallError> {
        if ctx.args.len() > self.params.len() {
            return Err(CallError::Rejected(format!(
                "{} takes {} positional arguments, got {}",
                self.action,
                self.params.len(),
                ctx.args.len()
            )));
        }
        let mut query = vec![("Action".to_string(), self.action.clone())];
        for (name, value) in self.params.iter().zip(&ctx.args) {
            if !value.is_null() {
                query.push(((*name).to_string(), value.to_param_string()));
            }
        }
        for (name, value) in &ctx.kwargs {
            if !CONTROL_KWARGS.contains(&name.as_str()) && !value.is_null() {
                query.push((name.clone(), value.to_param_string()));
            }
        }
        Ok(query)
    }
}

fn map_transport_error(e: &reqwest::Error) -> CallError {
    if e.is_timeout() {
        CallError::Timeout(e.to_string())
    } else if e.is_connect() || e.is_request() {
        CallError::Connection(e.to_string())
    } else if let Some(status) = e.status() {
        CallError::Status {
            status: status.as_u16(),
            body: String::new(),
        }
    } else {
        CallError::Malformed(e.to_string())
    }
}

#[async_trait]
impl OperationHandler for HttpOperation {
    async fn call(&self, ctx: &OperationContext) -> Result<Value, CallError> {
        let query = self.query(ctx)?;
        let response = self
            .adapter
            .client
            .get(self.adapter.base_url.as_ref())
            .query(&query)
            .send()
            .await
            .map_err(|e| map_transport_error(&e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| map_transport_error(&e))?;
        if !status.is_success() {
            return Err(CallError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(Value::String(body))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use colander_core::Kwargs;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::retry::{Classify, ErrorClass};

    fn adapter(base_url: String, read_timeout: Duration) -> HttpAdapter {
        HttpAdapter::new(&HttpAdapterConfig {
            base_url,
            read_timeout,
            connect_timeout: Duration::from_millis(500),
            ..HttpAdapterConfig::default()
        })
        .unwrap()
    }

    fn ctx(operation: &str, args: Vec<Value>, kwargs: Kwargs) -> OperationContext {
        let mut ctx = OperationContext::for_test(operation, args);
        ctx.kwargs = kwargs;
        ctx
    }

    #[tokio::test]
    async fn binds_arguments_and_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("Action", "ItemLookup"))
            .and(query_param("ItemId", "B000123"))
            .and(query_param("ResponseGroup", "Large"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<Item/>"))
            .expect(1)
            .mount(&server)
            .await;

        let op = adapter(server.uri(), Duration::from_secs(5)).operation("ItemLookup", &["ItemId"]);
        let mut kwargs = Kwargs::new();
        kwargs.insert("ResponseGroup".into(), Value::from("Large"));
        kwargs.insert("priority".into(), Value::Int(2));
        let value = op
            .call(&ctx("ItemLookup", vec![Value::from("B000123")], kwargs))
            .await
            .unwrap();
        assert_eq!(value, Value::from("<Item/>"));
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("throttled"))
            .mount(&server)
            .await;

        let op = adapter(server.uri(), Duration::from_secs(5)).operation("GetReport", &["ReportId"]);
        let err = op
            .call(&ctx("GetReport", vec![Value::from("r-1")], Kwargs::new()))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CallError::Status {
                status: 503,
                body: "throttled".into()
            }
        );
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[tokio::test]
    async fn client_error_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_string("InvalidParameterValue"))
            .mount(&server)
            .await;

        let op = adapter(server.uri(), Duration::from_secs(5)).operation("GetReport", &["ReportId"]);
        let err = op
            .call(&ctx("GetReport", vec![Value::from("r-1")], Kwargs::new()))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let op = adapter(server.uri(), Duration::from_millis(50)).operation("GetServiceStatus", &[]);
        let err = op
            .call(&ctx("GetServiceStatus", vec![], Kwargs::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Timeout(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_transient() {
        // Port 9 (discard) is closed on test hosts.
        let op = adapter("http://127.0.0.1:9".into(), Duration::from_secs(1))
            .operation("GetServiceStatus", &[]);
        let err = op
            .call(&ctx("GetServiceStatus", vec![], Kwargs::new()))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[tokio::test]
    async fn too_many_arguments_are_rejected() {
        let op = adapter("http://127.0.0.1:9".into(), Duration::from_secs(1))
            .operation("GetServiceStatus", &[]);
        let err = op
            .call(&ctx("GetServiceStatus", vec![Value::Int(1)], Kwargs::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Rejected(_)));
    }
}
