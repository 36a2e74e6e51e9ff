//! Metrics payload providers.

use async_trait::async_trait;
use bytes::Bytes;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::Result;

/// Produces the body served on the metrics path.
///
/// Only called for requests the authorization gate allowed.
#[async_trait]
pub trait MetricsSource: Send + Sync + 'static {
    /// Render the current exposition-format payload.
    async fn gather(&self) -> Result<Bytes>;
}

/// Renders this process's own Prometheus recorder.
#[derive(Clone)]
pub struct PrometheusSource {
    handle: PrometheusHandle,
}

impl PrometheusSource {
    /// Wrap an installed recorder's handle.
    #[must_use]
    pub fn new(handle: PrometheusHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl MetricsSource for PrometheusSource {
    async fn gather(&self) -> Result<Bytes> {
        Ok(Bytes::from(self.handle.render()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use telemetry_metrics::{Key, Recorder, Level, Metadata};

    #[tokio::test]
    async fn prometheus_source_renders_recorded_counter() {
        // GIVEN: a local (not globally installed) recorder with one counter
        let recorder = PrometheusBuilder::new().build_recorder();
        let metadata = Metadata::new(module_path!(), Level::INFO, None);
        recorder
            .register_counter(&Key::from_name("scrapes_total"), &metadata)
            .increment(3);
        let source = PrometheusSource::new(recorder.handle());

        // WHEN: gathering
        let body = source.gather().await.unwrap();

        // THEN: the exposition text contains it
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("scrapes_total 3"));
    }
}
