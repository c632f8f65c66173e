use serde_json::json;
use tracing::warn;

/// Fire-and-forget call to the external email-notification service.
/// Delivery failures are logged and never bubble up to the write path
/// that triggered them.
pub async fn send_email(
    http: &reqwest::Client,
    recipient_email: &str,
    recipient_name: Option<&str>,
    subject: &str,
    message_content: &str,
) {
    let api_url = std::env::var("EMAIL_API_URL").unwrap_or_default();
    if api_url.trim().is_empty() {
        warn!(subject, "EMAIL_API_URL not configured, skipping notification");
        return;
    }
    let api_key = std::env::var("EMAIL_API_KEY").unwrap_or_default();

    let mut payload = json!({
        "recipientEmail": recipient_email,
        "subject": subject,
        "messageContent": message_content,
    });
    if let Some(name) = recipient_name {
        payload["recipientName"] = json!(name);
    }

    let result = http
        .post(api_url.trim())
        .bearer_auth(api_key)
        .json(&payload)
        .send()
        .await;

    match result {
        Ok(response) if response.status().is_success() => {}
        Ok(response) => {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, subject, "email notification rejected: {body}");
        }
        Err(err) => {
            warn!(subject, "email notification failed: {err}");
        }
    }
}

pub fn admin_email() -> Option<String> {
    std::env::var("SUPPORT_ADMIN_EMAIL")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
