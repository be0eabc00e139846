// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2025 Waddle Social

//! OpenTelemetry instrumentation for the external component server.
//!
//! Logs are always JSON on stdout. Traces and metrics are exported over OTLP
//! only when a collector endpoint is configured; the library's meter
//! (`waddle-extcomp`) reports through the global provider installed here.

use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    trace::SdkTracerProvider,
    Resource,
};
use std::sync::OnceLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();
static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

const DEFAULT_FILTER: &str = "info,waddle_extcomp=debug,waddle_extcomp_server=debug";

fn build_resource() -> Resource {
    let service_name = std::env::var("OTEL_SERVICE_NAME")
        .unwrap_or_else(|_| "waddle-extcomp-server".to_string());
    let service_version = std::env::var("OTEL_SERVICE_VERSION")
        .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());

    Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", service_name),
            KeyValue::new("service.version", service_version),
        ])
        .build()
}

fn default_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

/// Expand a bare level into a filter for this server's crates.
fn level_filter(level_or_filter: &str) -> Option<String> {
    let level_or_filter = level_or_filter.trim();
    if level_or_filter.is_empty() {
        return None;
    }
    if level_or_filter.contains('=') || level_or_filter.contains(',') {
        Some(level_or_filter.to_string())
    } else {
        Some(format!(
            "{level},waddle_extcomp={level},waddle_extcomp_server={level}",
            level = level_or_filter
        ))
    }
}

/// `RUST_LOG`, then `EXTCOMP_LOG_LEVEL`, then the built-in default.
fn build_log_filter() -> EnvFilter {
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(filter).unwrap_or_else(|_| default_filter());
    }

    if let Some(filter) = std::env::var("EXTCOMP_LOG_LEVEL")
        .ok()
        .and_then(|value| level_filter(&value))
    {
        return EnvFilter::try_new(filter).unwrap_or_else(|_| default_filter());
    }

    default_filter()
}

/// JSON log lines carrying the active span chain.
fn json_layer<S>() -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_file(true)
        .with_line_number(true)
}

/// Install OTLP trace and metric pipelines, returning the tracer provider
/// for the subscriber layer.
fn install_otlp(endpoint: &str) -> Result<SdkTracerProvider> {
    let resource = build_resource();

    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("Failed to build OTLP span exporter")?;
    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(spans)
        .with_resource(resource.clone())
        .build();
    let _ = TRACER_PROVIDER.set(tracer_provider.clone());

    let metrics = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("Failed to build OTLP metric exporter")?;
    let meter_provider = SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(metrics).build())
        .with_resource(resource)
        .build();
    opentelemetry::global::set_meter_provider(meter_provider.clone());
    let _ = METER_PROVIDER.set(meter_provider);

    Ok(tracer_provider)
}

/// Initialize logging, plus OTLP traces and metrics when `otlp_endpoint`
/// is given (normally from `OTEL_EXPORTER_OTLP_ENDPOINT`).
///
/// `OTEL_SERVICE_NAME` and `OTEL_SERVICE_VERSION` override the resource
/// attributes reported to the collector.
pub fn init(otlp_endpoint: Option<&str>) -> Result<()> {
    let Some(endpoint) = otlp_endpoint else {
        tracing_subscriber::registry()
            .with(build_log_filter())
            .with(json_layer())
            .try_init()
            .context("Failed to install tracing subscriber")?;
        tracing::info!("Logging initialized, OTLP export disabled");
        return Ok(());
    };

    let tracer = install_otlp(endpoint)?.tracer("waddle-extcomp-server");
    tracing_subscriber::registry()
        .with(build_log_filter())
        .with(json_layer())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::info!(endpoint, "Telemetry initialized with OTLP export");
    Ok(())
}

/// Flush pending spans and metrics.
pub fn shutdown() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = %e, "Tracer provider did not shut down cleanly");
        }
    }

    if let Some(provider) = METER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = %e, "Meter provider did not shut down cleanly");
        }
    }
}
