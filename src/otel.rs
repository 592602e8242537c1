//! OpenTelemetry resource detection and per-setting OTLP/HTTP trace pipelines.
//!
//! Unlike a typical service that builds one process-wide [`SdkTracerProvider`] at startup, each
//! OTEL-mode [`crate::TraceSetting`] builds its own pipeline: the collector endpoint comes from
//! that setting's `config_map`, so two settings can legitimately point at two different
//! collectors. The [`Resource`] (service identity plus environment/process detectors) is shared.

use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry_otlp::{SpanExporter, WithExportConfig, WithHttpConfig};
use opentelemetry_resource_detectors::{OsResourceDetector, ProcessResourceDetector};
use opentelemetry_sdk::{
    resource::{EnvResourceDetector, SdkProvidedResourceDetector, TelemetryResourceDetector},
    trace::{SdkTracerProvider, Tracer},
    Resource,
};
use opentelemetry_semantic_conventions::resource as res;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Key inside a setting's `config_map` holding OpenTelemetry-specific options.
pub(crate) const OTEL_CONFIG_KEY: &str = "OTEL";
/// `config_map["OTEL"]` option naming the collector endpoint.
pub(crate) const OTEL_URL_OPTION: &str = "url";
/// Endpoint used when `config_map["OTEL"]["url"]` is absent.
const DEFAULT_ENDPOINT: &str = "http://localhost:4318/v1/traces";

/// Error building an OpenTelemetry trace pipeline.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OtelError {
    /// The configured collector URL could not be parsed.
    #[error("invalid OTLP collector URL {0:?}: {1}")]
    Endpoint(String, url::ParseError),
    /// The OTLP/HTTP span exporter could not be built.
    #[error("OTLP span exporter build error: {0}")]
    Exporter(#[from] opentelemetry_otlp::ExporterBuildError),
}

/// Common OpenTelemetry configuration shared by every OTEL-mode setting.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct OpenTelemetryConfig {
    /// OpenTelemetry resource detection timeout.
    ///
    /// Carried over from the detector-based resource builder this crate's ambient stack is
    /// modeled on; the current `Resource::builder()` API no longer takes a timeout argument, so
    /// this field is presently advisory only.
    #[serde(
        default = "OpenTelemetryConfig::default_detector_timeout",
        with = "humantime_serde"
    )]
    pub detector_timeout: Duration,
    /// Value reported as `service.name` in the OTel resource.
    #[serde(default)]
    pub service_name: Option<String>,
    /// Value reported as `service.version` in the OTel resource.
    #[serde(default)]
    pub service_version: Option<String>,
}

impl Default for OpenTelemetryConfig {
    fn default() -> Self {
        Self {
            detector_timeout: Self::default_detector_timeout(),
            service_name: None,
            service_version: None,
        }
    }
}

impl OpenTelemetryConfig {
    /// Default value for [`Self::detector_timeout`].
    fn default_detector_timeout() -> Duration {
        Duration::from_secs(6)
    }

    /// Build the shared OTel resource from standard detectors plus this config's static fields.
    #[must_use]
    pub fn resource(&self) -> Resource {
        let mut static_resources = Vec::new();
        if let Some(name) = &self.service_name {
            static_resources.push(KeyValue::new(res::SERVICE_NAME, name.clone()));
        }
        if let Some(version) = &self.service_version {
            static_resources.push(KeyValue::new(res::SERVICE_VERSION, version.clone()));
        }
        Resource::builder()
            .with_detectors(&[
                Box::new(OsResourceDetector),
                Box::new(ProcessResourceDetector),
                Box::new(SdkProvidedResourceDetector),
                Box::new(EnvResourceDetector::new()),
                Box::new(TelemetryResourceDetector),
            ])
            .with_attributes(static_resources)
            .build()
    }
}

/// One OTEL-mode setting's exporter, tracer provider and tracer, bundled so they share a
/// lifetime: dropping the pipeline shuts the provider down and flushes any buffered spans.
pub(crate) struct OtelPipeline {
    provider: SdkTracerProvider,
    tracer: Tracer,
}

impl OtelPipeline {
    /// Build an OTLP/HTTP pipeline exporting to `endpoint` (or the default collector address
    /// when `endpoint` is `None`), tagged with `resource`.
    pub(crate) fn build(resource: Resource, endpoint: Option<&str>) -> Result<Self, OtelError> {
        let endpoint = endpoint.unwrap_or(DEFAULT_ENDPOINT);
        Url::parse(endpoint).map_err(|err| OtelError::Endpoint(endpoint.to_owned(), err))?;

        let exporter = SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()?;
        let provider = SdkTracerProvider::builder()
            .with_resource(resource)
            .with_batch_exporter(exporter)
            .build();
        let tracer = {
            use opentelemetry::trace::TracerProvider as _;
            provider.tracer("modeltrace")
        };
        Ok(Self { provider, tracer })
    }

    /// The tracer used to start spans for this setting's traces.
    pub(crate) fn tracer(&self) -> &Tracer {
        &self.tracer
    }
}

impl Drop for OtelPipeline {
    fn drop(&mut self) {
        if let Err(err) = self.provider.shutdown() {
            tracing::warn!(%err, "failed to cleanly shut down OpenTelemetry tracer provider");
        }
    }
}

/// Resolve `config_map["OTEL"]["url"]`, if present.
pub(crate) fn configured_endpoint(config_map: &crate::ConfigMap) -> Option<&str> {
    config_map
        .get(OTEL_CONFIG_KEY)
        .and_then(|opts| opts.get(OTEL_URL_OPTION))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn configured_endpoint_reads_otel_url_option() {
        let mut opts = HashMap::new();
        opts.insert("url".to_string(), "http://collector:4318/v1/traces".to_string());
        let mut config_map = crate::ConfigMap::new();
        config_map.insert("OTEL".to_string(), opts);
        assert_eq!(
            configured_endpoint(&config_map),
            Some("http://collector:4318/v1/traces")
        );
    }

    #[test]
    fn configured_endpoint_absent_without_otel_key() {
        let config_map = crate::ConfigMap::new();
        assert_eq!(configured_endpoint(&config_map), None);
    }
}
