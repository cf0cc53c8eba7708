//! Fire-and-forget outbound alerts over a long-lived `reqwest::Client`.

use tracing::warn;

use crate::external::Notifier;

pub struct WebhookNotifier {
    client: reqwest::Client,
    url_template: String,
}

impl WebhookNotifier {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), url_template: url_template.into() }
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &str, detail: &str) {
        let url = format!("{}?event={}&detail={}", self.url_template, urlencode(event), urlencode(detail));
        if let Err(e) = self.client.get(&url).send().await {
            warn!(event, error = %e, "webhook notification failed");
        }
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
