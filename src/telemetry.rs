//! Per-connection Prometheus metrics

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::{FeedError, Result};

/// Counters owned by one connection, registered on their own registry
pub struct FeedTelemetry {
    registry: Registry,
    /// Frames read, labelled `status`, `feed` or `unclassified`
    pub frames: IntCounterVec,
    /// Feed items that failed parsing, labelled by feed
    pub parse_errors: IntCounterVec,
    pub decode_errors: IntCounter,
    pub reconnects: IntCounter,
    pub confirmed_subscriptions: IntGauge,
}

impl FeedTelemetry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let frames = IntCounterVec::new(
            Opts::new("feed_frames_total", "Frames read from the exchange connection"),
            &["kind"],
        )
        .map_err(metrics_error)?;
        let parse_errors = IntCounterVec::new(
            Opts::new("feed_parse_errors_total", "Feed payloads that failed validation"),
            &["feed"],
        )
        .map_err(metrics_error)?;
        let decode_errors = IntCounter::new(
            "feed_decode_errors_total",
            "Frames that could not be classified",
        )
        .map_err(metrics_error)?;
        let reconnects = IntCounter::new("feed_reconnects_total", "Successful reconnections")
            .map_err(metrics_error)?;
        let confirmed_subscriptions = IntGauge::new(
            "feed_confirmed_subscriptions",
            "Subscriptions acknowledged by the exchange",
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(frames.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(parse_errors.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(decode_errors.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(reconnects.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(confirmed_subscriptions.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            frames,
            parse_errors,
            decode_errors,
            reconnects,
            confirmed_subscriptions,
        })
    }

    /// Render in the Prometheus text exposition format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| FeedError::Serialization(e.to_string()))
    }
}

fn metrics_error(err: prometheus::Error) -> FeedError {
    FeedError::Config(format!("metrics: {}", err))
}
