//! Slack incoming-webhook posting.

use reqwest::Client;

/// Accept https everywhere; plain http only for local development hosts.
fn is_valid_webhook_url(url: &str) -> bool {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    match parsed.scheme() {
        "https" => true,
        "http" => matches!(host, "localhost" | "127.0.0.1" | "::1"),
        _ => false,
    }
}

/// Post a message via a Slack incoming webhook.
///
/// Returns true when Slack accepts the payload (HTTP 2xx). Every failure mode
/// is logged and returns false; this never surfaces an error to the caller.
pub async fn send_slack_message(
    client: &Client,
    webhook_url: &str,
    text: &str,
    channel: Option<&str>,
) -> bool {
    if webhook_url.is_empty() || !is_valid_webhook_url(webhook_url) {
        tracing::warn!(webhook_url = %webhook_url, "refusing to post to invalid Slack webhook URL");
        return false;
    }

    let mut payload = serde_json::json!({ "text": text });
    if let Some(channel) = channel {
        payload["channel"] = serde_json::Value::String(channel.to_string());
    }

    match client.post(webhook_url).json(&payload).send().await {
        Ok(response) if response.status().is_success() => true,
        Ok(response) => {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(200).collect();
            tracing::warn!(status, body = %body, "Slack webhook failed");
            false
        }
        Err(error) => {
            tracing::warn!(%error, "Slack webhook request failed");
            false
        }
    }
}
