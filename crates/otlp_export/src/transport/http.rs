//! OTLP/JSON over HTTP.

use super::json;
use super::tls::{TlsError, TlsMaterial};
use super::{resolve_headers, Destination};
use crate::config::{Compression, ExporterConfig};
use crate::exporter::ExportError;
use crate::span::ExportRequest;
use flate2::write::GzEncoder;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Certificate, Client, ClientBuilder, Identity, Url};
use std::io::Write;
use std::net::SocketAddr;
use tokio::sync::OnceCell;

/// Response bodies longer than this are cut in error messages.
const MAX_ERROR_BODY: usize = 1024;

struct HttpClient {
    client: Client,
    url: Url,
}

/// Posts OTLP/JSON requests to the configured endpoint.
///
/// The underlying client is built on first send, reading any TLS material at
/// that point. A certificate, key or CA file that cannot be loaded is logged
/// and left out; the remaining material still applies.
pub struct HttpExporter {
    destination: Destination,
    client: OnceCell<HttpClient>,
}

impl HttpExporter {
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            client: OnceCell::new(),
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub async fn send(&self, request: &ExportRequest) -> Result<(), ExportError> {
        let config = self.destination.config();
        let payload = json::encode_request(request)?;
        let gzip = config.compression == Compression::Gzip;
        let body = if gzip { compress(&payload)? } else { payload };

        let http = self
            .client
            .get_or_try_init(|| build_client(config))
            .await?;
        let headers = header_map(config, gzip);

        let response_body = self
            .destination
            .guarded(async move {
                let response = http
                    .client
                    .post(http.url.clone())
                    .headers(headers)
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| ExportError::Transport(e.to_string()))?;

                let status = response.status();
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| ExportError::Transport(e.to_string()))?;

                if status.as_u16() >= 400 {
                    let mut body = String::from_utf8_lossy(&bytes).into_owned();
                    if body.len() > MAX_ERROR_BODY {
                        let cut = (0..=MAX_ERROR_BODY)
                            .rev()
                            .find(|i| body.is_char_boundary(*i))
                            .unwrap_or(0);
                        body.truncate(cut);
                    }
                    return Err(ExportError::Status {
                        status: status.as_u16(),
                        body,
                    });
                }
                Ok(bytes)
            })
            .await;

        let response_body = match response_body {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(
                    exporter_id = %config.id,
                    endpoint = %config.endpoint,
                    error = %e,
                    "Failed to export spans"
                );
                return Err(e);
            }
        };

        if let Some((rejected, message)) = json::parse_partial_success(&response_body) {
            self.destination.record_partial_success(rejected, &message);
        }
        tracing::debug!(
            exporter_id = %config.id,
            endpoint = %config.endpoint,
            span_count = request.span_count(),
            "Exported spans"
        );
        Ok(())
    }
}

fn header_map(config: &ExporterConfig, gzip: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if gzip {
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    }
    for (key, value) in resolve_headers(&config.headers) {
        match (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(
                exporter_id = %config.id,
                header = %key,
                "Skipping invalid export header"
            ),
        }
    }
    headers
}

fn compress(payload: &[u8]) -> Result<Vec<u8>, ExportError> {
    let mut encoder = GzEncoder::new(
        Vec::with_capacity(payload.len() / 4),
        flate2::Compression::default(),
    );
    encoder
        .write_all(payload)
        .map_err(|e| ExportError::Serialization(format!("gzip: {e}")))?;
    encoder
        .finish()
        .map_err(|e| ExportError::Serialization(format!("gzip: {e}")))
}

fn plain_builder(config: &ExporterConfig) -> ClientBuilder {
    Client::builder()
        .timeout(config.timeout())
        .danger_accept_invalid_certs(config.insecure)
}

async fn build_client(config: &ExporterConfig) -> Result<HttpClient, ExportError> {
    let url = Url::parse(&config.endpoint)
        .map_err(|e| ExportError::InvalidEndpoint(format!("{}: {e}", config.endpoint)))?;

    if let Some(tls) = &config.tls_config {
        let (material, mut skipped) = TlsMaterial::load_each(tls).await;
        let (builder, tls_url) = with_tls(plain_builder(config), &material, &url, &mut skipped).await;
        for e in &skipped {
            tracing::warn!(
                exporter_id = %config.id,
                endpoint = %config.endpoint,
                error = %e,
                "Skipping unloadable TLS material"
            );
        }
        match builder.build() {
            Ok(client) => return Ok(HttpClient { client, url: tls_url }),
            Err(e) => tracing::warn!(
                exporter_id = %config.id,
                endpoint = %config.endpoint,
                error = %e,
                "Failed to apply TLS configuration, using default client"
            ),
        }
    }

    let client = plain_builder(config)
        .build()
        .map_err(|e| ExportError::Transport(format!("failed to build HTTP client: {e}")))?;
    Ok(HttpClient { client, url })
}

/// Applies client identity, custom roots and the verification name. Each
/// piece is applied on its own; one that cannot be used is pushed onto
/// `skipped` and the rest still apply.
///
/// A server name override is realised by addressing the request to that name
/// and pinning it to the addresses of the configured host. The addresses are
/// resolved once, when the client is built, and kept for the client's
/// lifetime.
async fn with_tls(
    mut builder: ClientBuilder,
    material: &TlsMaterial,
    url: &Url,
    skipped: &mut Vec<TlsError>,
) -> (ClientBuilder, Url) {
    if let Some(identity) = &material.identity {
        match Identity::from_pem(&identity.combined_pem()) {
            Ok(identity) => builder = builder.identity(identity),
            Err(e) => skipped.push(TlsError::Invalid(format!("client identity: {e}"))),
        }
    }
    if let Some(ca) = &material.ca_pem {
        match Certificate::from_pem(ca) {
            Ok(ca) => builder = builder.tls_built_in_root_certs(false).add_root_certificate(ca),
            Err(e) => skipped.push(TlsError::Invalid(format!("CA certificate: {e}"))),
        }
    }

    let mut url = url.clone();
    if let (Some(name), Some(host)) = (&material.server_name, url.host_str().map(str::to_owned)) {
        if *name != host {
            match pin_server_name(&mut url, &host, name).await {
                Ok(addrs) => builder = builder.resolve_to_addrs(name, &addrs),
                Err(e) => skipped.push(e),
            }
        }
    }

    (builder, url)
}

/// Rewrites `url` to address `name` and returns the addresses of `host`.
async fn pin_server_name(url: &mut Url, host: &str, name: &str) -> Result<Vec<SocketAddr>, TlsError> {
    let port = url.port_or_known_default().unwrap_or(443);
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TlsError::Invalid(format!("cannot resolve {host}: {e}")))?
        .collect();
    let mut renamed = url.clone();
    renamed
        .set_host(Some(name))
        .map_err(|e| TlsError::Invalid(format!("server name {name}: {e}")))?;
    *url = renamed;
    Ok(addrs)
}
