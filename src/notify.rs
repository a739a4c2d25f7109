//! Detection alerting.
//!
//! Alerts are best-effort: the registry fires one per stored detection and
//! never lets a delivery failure back up into message handling.

use std::time::Duration;

/// Notification collaborator invoked after a detection record is stored.
pub trait Notifier: Send {
    fn notify_detection(&self, image_name: &str);
}

/// Default notifier: just logs the detection.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_detection(&self, image_name: &str) {
        log::info!("detection stored: {}", image_name);
    }
}

/// Posts the image name to a webhook. Failures are logged and swallowed.
pub struct WebhookNotifier {
    url: String,
    agent: ureq::Agent,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(5))
            .build();
        Self { url, agent }
    }
}

impl Notifier for WebhookNotifier {
    fn notify_detection(&self, image_name: &str) {
        let body = serde_json::json!({ "image": image_name }).to_string();
        let result = self
            .agent
            .post(&self.url)
            .set("content-type", "application/json")
            .send_string(&body);
        if let Err(e) = result {
            log::warn!("detection webhook failed: {}", e);
        }
    }
}
