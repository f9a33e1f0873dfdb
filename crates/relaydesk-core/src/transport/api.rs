//! Transactional email APIs over HTTPS.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::json;
use tracing::debug;

use super::{DeliveryError, OutgoingMessage, RelayTransport};
use crate::relay::{ApiDetails, ApiProvider, RelayCredential, RelayEndpoint};

/// Sends through `SendGrid`, Mailgun, Postmark or Resend.
#[derive(Debug, Clone)]
pub struct ApiTransport {
    http: Client,
    base_override: Option<String>,
}

impl ApiTransport {
    /// Creates a transport whose requests give up after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_override: None,
        }
    }

    /// Sends every request to `base` instead of the provider's host.
    #[must_use]
    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        self.base_override = Some(base.into().trim_end_matches('/').to_string());
        self
    }

    fn base(&self, details: &ApiDetails) -> String {
        if let Some(base) = &self.base_override {
            return base.clone();
        }
        match details.provider {
            ApiProvider::SendGrid => "https://api.sendgrid.com".to_string(),
            ApiProvider::Mailgun if is_eu(details) => "https://api.eu.mailgun.net".to_string(),
            ApiProvider::Mailgun => "https://api.mailgun.net".to_string(),
            ApiProvider::Postmark => "https://api.postmarkapp.com".to_string(),
            ApiProvider::Resend => "https://api.resend.com".to_string(),
        }
    }

    fn verify_request(&self, relay: &RelayCredential, details: &ApiDetails) -> RequestBuilder {
        let base = self.base(details);
        let key = &relay.secret;
        match details.provider {
            ApiProvider::SendGrid => self.http.get(format!("{base}/v3/scopes")).bearer_auth(key),
            ApiProvider::Mailgun => {
                let url = match &details.domain {
                    Some(domain) => format!("{base}/v3/domains/{domain}"),
                    None => format!("{base}/v3/domains"),
                };
                self.http.get(url).basic_auth("api", Some(key))
            }
            ApiProvider::Postmark => self
                .http
                .get(format!("{base}/server"))
                .header("X-Postmark-Server-Token", key)
                .header("Accept", "application/json"),
            ApiProvider::Resend => self.http.get(format!("{base}/domains")).bearer_auth(key),
        }
    }

    fn send_request(
        &self,
        relay: &RelayCredential,
        details: &ApiDetails,
        message: &OutgoingMessage,
    ) -> RequestBuilder {
        let base = self.base(details);
        let key = &relay.secret;
        let body_field = |html: &'static str, text: &'static str| if message.is_html { html } else { text };

        match details.provider {
            ApiProvider::SendGrid => self
                .http
                .post(format!("{base}/v3/mail/send"))
                .bearer_auth(key)
                .json(&json!({
                    "personalizations": [{ "to": [{ "email": message.to }] }],
                    "from": { "email": message.from_email, "name": message.from_name },
                    "subject": message.subject,
                    "content": [{
                        "type": body_field("text/html", "text/plain"),
                        "value": message.body,
                    }],
                })),
            ApiProvider::Mailgun => {
                let domain = details.domain.clone().unwrap_or_else(|| {
                    message
                        .from_email
                        .rsplit_once('@')
                        .map(|(_, d)| d.to_string())
                        .unwrap_or_default()
                });
                let form = [
                    ("from", message.from_header()),
                    ("to", message.to.clone()),
                    ("subject", message.subject.clone()),
                    (body_field("html", "text"), message.body.clone()),
                ];
                self.http
                    .post(format!("{base}/v3/{domain}/messages"))
                    .basic_auth("api", Some(key))
                    .form(&form)
            }
            ApiProvider::Postmark => {
                let mut payload = json!({
                    "From": message.from_header(),
                    "To": message.to,
                    "Subject": message.subject,
                });
                payload[body_field("HtmlBody", "TextBody")] = json!(message.body);
                self.http
                    .post(format!("{base}/email"))
                    .header("X-Postmark-Server-Token", key)
                    .header("Accept", "application/json")
                    .json(&payload)
            }
            ApiProvider::Resend => {
                let mut payload = json!({
                    "from": message.from_header(),
                    "to": [message.to],
                    "subject": message.subject,
                });
                payload[body_field("html", "text")] = json!(message.body);
                self.http.post(format!("{base}/emails")).bearer_auth(key).json(&payload)
            }
        }
    }

    async fn execute(request: RequestBuilder) -> Result<(), DeliveryError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::transient(format!("request timed out: {e}"))
            } else {
                DeliveryError::transient(format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

#[async_trait]
impl RelayTransport for ApiTransport {
    async fn verify(&self, relay: &RelayCredential) -> Result<(), DeliveryError> {
        let details = api_details(relay)?;
        debug!(relay = %relay.id, provider = details.provider.display_name(), "Verifying API key");
        Self::execute(self.verify_request(relay, details)).await
    }

    async fn send(&self, relay: &RelayCredential, message: &OutgoingMessage) -> Result<(), DeliveryError> {
        let details = api_details(relay)?;
        Self::execute(self.send_request(relay, details, message)).await
    }
}

fn api_details(relay: &RelayCredential) -> Result<&ApiDetails, DeliveryError> {
    match &relay.endpoint {
        RelayEndpoint::Api(details) => Ok(details),
        _ => Err(DeliveryError::relay_broken("relay is not an API relay")),
    }
}

fn is_eu(details: &ApiDetails) -> bool {
    details
        .region
        .as_deref()
        .is_some_and(|r| r.eq_ignore_ascii_case("eu"))
}

/// 401/403 mean the key is dead; 429 and 5xx are worth another try.
fn classify_status(status: StatusCode, body: &str) -> DeliveryError {
    let snippet: String = body.chars().take(200).collect();
    let message = format!("HTTP {}: {}", status.as_u16(), snippet.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DeliveryError::relay_broken(message),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => DeliveryError::transient(message),
        s if s.is_server_error() => DeliveryError::transient(message),
        _ => DeliveryError::permanent(message),
    }
}
