use serde::Serialize;
use std::time::Duration;

pub const EVENT_PAYMENT_SUCCESS: &str = "payment_success";
pub const EVENT_PAYMENT_FAILURE: &str = "payment_failure_classified";
pub const EVENT_AUTO_PAUSED: &str = "subscription_auto_paused";

/// Envelope POSTed to the configured sink. Field names are part of the
/// external interface; do not rename.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub event: &'static str,
    pub sub_id: String,
    pub ts: i64,
    pub trigger_count: u64,
    pub failed_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
}

/// Fire-and-forget event sink. Delivery failures are logged and never fed
/// back into scheduler state.
pub struct WebhookSink {
    url: String,
    http: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: String, timeout: Duration) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| eyre::eyre!("failed to build http client: {e}"))?;
        Ok(Self { url, http })
    }

    pub fn emit(&self, envelope: EventEnvelope) {
        let http = self.http.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            match http.post(&url).json(&envelope).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(event = envelope.event, sub_id = %envelope.sub_id, "webhook delivered");
                }
                Ok(resp) => {
                    tracing::warn!(
                        event = envelope.event,
                        sub_id = %envelope.sub_id,
                        status = %resp.status(),
                        "webhook sink returned an error status"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        event = envelope.event,
                        sub_id = %envelope.sub_id,
                        error = %err,
                        "webhook delivery failed"
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_omits_absent_optionals() {
        let json = serde_json::to_value(EventEnvelope {
            event: EVENT_PAYMENT_SUCCESS,
            sub_id: "a".into(),
            ts: 5,
            trigger_count: 1,
            failed_count: 0,
            last_error: None,
            tx_id: Some("sig".into()),
        })
        .unwrap();

        assert_eq!(json["event"], "payment_success");
        assert_eq!(json["tx_id"], "sig");
        assert!(json.get("last_error").is_none());
    }
}
