use provision::telemetry::{TelemetryEvent, TelemetrySink};
use reqwest::Client;

pub const DEFAULT_TELEMETRY_URL: &str = "https://telemetry.kubefirst.io/api/v1/events";

/// Fire-and-forget POST of each event; delivery failures are only logged.
pub struct HttpTelemetry {
    url: String,
    client: Client,
}

impl HttpTelemetry {
    pub fn new(url: impl Into<String>, client: Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

impl TelemetrySink for HttpTelemetry {
    fn send(&self, event: TelemetryEvent) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("[Telemetry] No runtime, dropping {:?}", event.metric);
            return;
        };
        let request = self.client.post(&self.url).json(&event);
        handle.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!("[Telemetry] Sent {:?}", event.metric)
                }
                Ok(response) => tracing::debug!("[Telemetry] {:?} rejected: {}", event.metric, response.status()),
                Err(e) => tracing::debug!("[Telemetry] {:?} not delivered: {}", event.metric, e),
            }
        });
    }
}
