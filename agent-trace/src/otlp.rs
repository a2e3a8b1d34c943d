//! OTLP/HTTP JSON span exporter.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::body::to_bytes;
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Request, Uri};
use hyper_rustls::HttpsConnector;
use rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore};
use serde::Serialize;
use tokio::time::timeout;
use webpki_roots::TLS_SERVER_ROOTS;

use crate::exporter::{ExportError, ExportResult, SpanExporter};
use crate::span::{SpanRecord, SpanStatus};

type HyperClient = Client<HttpsConnector<HttpConnector>, Body>;

const DEFAULT_SERVICE_NAME: &str = "agentwatch";

/// Exporter that posts OTLP-shaped JSON batches to a collector endpoint such
/// as `http://localhost:4318/v1/traces`.
pub struct OtlpHttpExporter {
    client: HyperClient,
    endpoint: Uri,
    timeout: Duration,
    service_name: String,
}

impl fmt::Debug for OtlpHttpExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtlpHttpExporter")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl OtlpHttpExporter {
    /// Creates an exporter for `endpoint` with a per-request `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Configuration`] if the endpoint is not an
    /// absolute `http://` or `https://` URI.
    pub fn new(endpoint: &str, timeout: Duration) -> ExportResult<Self> {
        let trimmed = endpoint.trim();
        if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
            return Err(ExportError::Configuration(
                "OTLP endpoint must start with http:// or https://".to_owned(),
            ));
        }
        let endpoint = trimmed
            .parse::<Uri>()
            .map_err(|err| ExportError::Configuration(format!("invalid OTLP endpoint: {err}")))?;

        Ok(Self {
            client: build_https_client(),
            endpoint,
            timeout,
            service_name: DEFAULT_SERVICE_NAME.to_owned(),
        })
    }

    /// Sets the `service.name` resource attribute.
    #[must_use]
    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    /// Collector endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &Uri {
        &self.endpoint
    }
}

#[async_trait]
impl SpanExporter for OtlpHttpExporter {
    fn name(&self) -> &'static str {
        "otlp_http"
    }

    async fn export(&self, batch: &[SpanRecord]) -> ExportResult<()> {
        let body = serde_json::to_vec(&encode_batch(&self.service_name, batch))?;

        let req = Request::post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .map_err(|err| ExportError::Transport(format!("failed to build OTLP request: {err}")))?;

        let response = timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| ExportError::Timeout(self.timeout))?
            .map_err(|err| ExportError::Transport(format!("OTLP request failed: {err}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let bytes = to_bytes(response.into_body()).await.unwrap_or_default();
        Err(ExportError::Rejected {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

fn build_https_client() -> HyperClient {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(TLS_SERVER_ROOTS.iter().map(|anchor| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            anchor.subject,
            anchor.spki,
            anchor.name_constraints,
        )
    }));

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let mut http = HttpConnector::new();
    http.enforce_http(false);

    let connector = HttpsConnector::from((http, Arc::new(config)));
    Client::builder().build::<_, Body>(connector)
}

// OTLP status codes: 1 = OK, 2 = ERROR.
const STATUS_OK: u8 = 1;
const STATUS_ERROR: u8 = 2;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportTraceRequest<'a> {
    resource_spans: Vec<ResourceSpans<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceSpans<'a> {
    resource: Resource<'a>,
    scope_spans: Vec<ScopeSpans<'a>>,
}

#[derive(Debug, Serialize)]
struct Resource<'a> {
    attributes: Vec<KeyValue<'a>>,
}

#[derive(Debug, Serialize)]
struct ScopeSpans<'a> {
    scope: Scope,
    spans: Vec<OtlpSpan<'a>>,
}

#[derive(Debug, Serialize)]
struct Scope {
    name: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OtlpSpan<'a> {
    trace_id: String,
    span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_span_id: Option<String>,
    name: &'a str,
    // Kind 1 = SPAN_KIND_INTERNAL.
    kind: u8,
    start_time_unix_nano: String,
    end_time_unix_nano: String,
    attributes: Vec<KeyValue<'a>>,
    status: Status,
}

#[derive(Debug, Serialize)]
struct KeyValue<'a> {
    key: &'a str,
    value: AnyValue<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnyValue<'a> {
    string_value: &'a str,
}

#[derive(Debug, Serialize)]
struct Status {
    code: u8,
}

fn encode_batch<'a>(service_name: &'a str, batch: &'a [SpanRecord]) -> ExportTraceRequest<'a> {
    let spans = batch
        .iter()
        .map(|span| OtlpSpan {
            trace_id: span.trace_id.to_string(),
            span_id: span.span_id.to_string(),
            parent_span_id: span.parent_span_id.map(|id| id.to_string()),
            name: &span.name,
            kind: 1,
            start_time_unix_nano: span.start_time_ns.to_string(),
            end_time_unix_nano: span.end_time_ns.to_string(),
            attributes: span
                .tags
                .iter()
                .map(|(key, value)| KeyValue {
                    key,
                    value: AnyValue { string_value: value },
                })
                .collect(),
            status: Status {
                code: match span.status {
                    SpanStatus::Ok => STATUS_OK,
                    SpanStatus::Error => STATUS_ERROR,
                },
            },
        })
        .collect();

    ExportTraceRequest {
        resource_spans: vec![ResourceSpans {
            resource: Resource {
                attributes: vec![KeyValue {
                    key: "service.name",
                    value: AnyValue {
                        string_value: service_name,
                    },
                }],
            },
            scope_spans: vec![ScopeSpans {
                scope: Scope {
                    name: "agentwatch",
                    version: env!("CARGO_PKG_VERSION"),
                },
                spans,
            }],
        }],
    }
}
