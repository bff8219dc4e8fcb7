//! OTLP/protobuf over gRPC.

use super::proto;
use super::tls::TlsMaterial;
use super::{resolve_headers, Destination};
use crate::config::{Compression, ExporterConfig};
use crate::exporter::ExportError;
use crate::span::ExportRequest;
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_client::TraceServiceClient;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tonic::codec::CompressionEncoding;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tonic::Code;

/// Shared gRPC channels, one per endpoint string.
///
/// Channels connect lazily and multiplex concurrent calls, so every exporter
/// pointing at the same endpoint shares one connection.
#[derive(Debug, Default)]
pub struct ChannelCache {
    channels: RwLock<HashMap<String, Channel>>,
    connections_created: AtomicU64,
}

impl ChannelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the channel for `config.endpoint`, creating it on first use.
    pub async fn get_or_connect(&self, config: &ExporterConfig) -> Result<Channel, ExportError> {
        if let Some(channel) = self.cached(&config.endpoint) {
            return Ok(channel);
        }

        let endpoint = build_endpoint(config).await?;

        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(channel) = channels.get(&config.endpoint) {
            return Ok(channel.clone());
        }
        let channel = endpoint.connect_lazy();
        channels.insert(config.endpoint.clone(), channel.clone());
        self.connections_created.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            exporter_id = %config.id,
            endpoint = %config.endpoint,
            "Created gRPC connection for OTLP export"
        );
        Ok(channel)
    }

    fn cached(&self, endpoint: &str) -> Option<Channel> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .cloned()
    }

    /// Channels created since start.
    pub fn connections_created(&self) -> u64 {
        self.connections_created.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.channels.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every channel; connections close once in-flight calls release
    /// their clones. Returns how many were dropped.
    pub fn close_all(&self) -> usize {
        let drained: Vec<String> = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(endpoint, _)| endpoint)
            .collect();
        for endpoint in &drained {
            tracing::debug!(endpoint = %endpoint, "Closed gRPC connection");
        }
        drained.len()
    }
}

/// Target URI of an endpoint. An explicit scheme is kept; otherwise
/// `insecure` selects plaintext over TLS.
fn endpoint_uri(endpoint: &str, insecure: bool) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_owned()
    } else if insecure {
        format!("http://{endpoint}")
    } else {
        format!("https://{endpoint}")
    }
}

async fn build_endpoint(config: &ExporterConfig) -> Result<Endpoint, ExportError> {
    let uri = endpoint_uri(&config.endpoint, config.insecure);
    let endpoint = Endpoint::from_shared(uri.clone())
        .map_err(|e| ExportError::InvalidEndpoint(format!("{uri}: {e}")))?
        .timeout(config.timeout())
        .connect_timeout(config.timeout());

    if !uri.starts_with("https://") {
        return Ok(endpoint);
    }

    let material = match &config.tls_config {
        Some(tls) => TlsMaterial::load(tls).await?,
        None => TlsMaterial::default(),
    };

    let mut tls = ClientTlsConfig::new();
    tls = match &material.ca_pem {
        Some(ca) => tls.ca_certificate(Certificate::from_pem(ca)),
        None => tls.with_webpki_roots(),
    };
    if let Some(identity) = &material.identity {
        tls = tls.identity(Identity::from_pem(&identity.cert_pem, &identity.key_pem));
    }
    if let Some(name) = &material.server_name {
        tls = tls.domain_name(name.clone());
    }

    endpoint
        .tls_config(tls)
        .map_err(|e| ExportError::Tls(e.to_string()))
}

/// Header map as gRPC metadata. Keys are lowercased; entries that are not
/// valid ASCII metadata are skipped.
fn metadata(config: &ExporterConfig) -> MetadataMap {
    let mut metadata = MetadataMap::new();
    for (key, value) in resolve_headers(&config.headers) {
        let parsed = (
            AsciiMetadataKey::from_bytes(key.to_ascii_lowercase().as_bytes()),
            AsciiMetadataValue::try_from(value.as_str()),
        );
        match parsed {
            (Ok(key), Ok(value)) => {
                metadata.insert(key, value);
            }
            _ => tracing::warn!(
                exporter_id = %config.id,
                header = %key,
                "Skipping invalid gRPC metadata entry"
            ),
        }
    }
    metadata
}

/// Maps a gRPC status onto the export error taxonomy. Codes the OTLP
/// protocol treats as transient become transport errors.
fn status_error(status: &tonic::Status) -> ExportError {
    match status.code() {
        Code::DeadlineExceeded => ExportError::Timeout,
        Code::Cancelled
        | Code::Unavailable
        | Code::ResourceExhausted
        | Code::Aborted
        | Code::OutOfRange
        | Code::DataLoss => ExportError::Transport(format!(
            "gRPC export failed: {:?}: {}",
            status.code(),
            status.message()
        )),
        _ => ExportError::Rejected(format!(
            "gRPC export failed: {:?}: {}",
            status.code(),
            status.message()
        )),
    }
}

/// Sends protobuf requests through the shared [`ChannelCache`].
pub struct GrpcExporter {
    destination: Destination,
    channels: Arc<ChannelCache>,
}

impl GrpcExporter {
    pub fn new(destination: Destination, channels: Arc<ChannelCache>) -> Self {
        Self {
            destination,
            channels,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub async fn send(&self, request: &ExportRequest) -> Result<(), ExportError> {
        let config = self.destination.config();
        let channel = self.channels.get_or_connect(config).await?;
        let message = proto::to_proto_request(request);
        let metadata = metadata(config);
        let gzip = config.compression == Compression::Gzip;

        let response = self
            .destination
            .guarded(async move {
                let mut client = TraceServiceClient::new(channel);
                if gzip {
                    client = client.send_compressed(CompressionEncoding::Gzip);
                }
                let mut call = tonic::Request::new(message);
                *call.metadata_mut() = metadata;
                client
                    .export(call)
                    .await
                    .map(tonic::Response::into_inner)
                    .map_err(|status| status_error(&status))
            })
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(
                    exporter_id = %config.id,
                    endpoint = %config.endpoint,
                    error = %e,
                    "Failed to export spans via gRPC"
                );
                return Err(e);
            }
        };

        if let Some(partial) = response.partial_success {
            if partial.rejected_spans > 0 {
                self.destination
                    .record_partial_success(partial.rejected_spans, &partial.error_message);
            }
        }
        tracing::debug!(
            exporter_id = %config.id,
            endpoint = %config.endpoint,
            span_count = request.span_count(),
            "Exported spans via gRPC"
        );
        Ok(())
    }
}
