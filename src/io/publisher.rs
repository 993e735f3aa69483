//! Egress publisher - delivers records and alerts to their sinks
//!
//! Every message is appended to the JSONL egress file and, when an HTTP
//! endpoint is configured, POSTed once as JSON. Failures are logged and
//! counted, never retried.
//!
//! The publisher runs until every `EgressSender` is dropped, so messages
//! emitted during shutdown (the final session flush) are still delivered.

use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::egress::Egress;
use crate::io::egress_channel::EgressMessage;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct Publisher {
    egress: Egress,
    http_client: Option<reqwest::Client>,
    http_url: Option<String>,
    embed_images: bool,
    site_id: String,
    camera_name: String,
    location_id: Option<String>,
    rx: mpsc::Receiver<EgressMessage>,
    metrics: Arc<Metrics>,
}

impl Publisher {
    pub fn new(config: &Config, rx: mpsc::Receiver<EgressMessage>, metrics: Arc<Metrics>) -> Self {
        // Create HTTP client once for reuse (connection pooling)
        let http_client = config.egress_http_url().and_then(|_| {
            reqwest::Client::builder()
                .timeout(config.egress_http_timeout())
                .build()
                .map_err(|e| error!(error = %e, "egress_http_client_failed"))
                .ok()
        });

        Self {
            egress: Egress::new(config.egress_file()),
            http_client,
            http_url: config.egress_http_url().map(str::to_string),
            embed_images: config.egress_embed_images(),
            site_id: config.site_id().to_string(),
            camera_name: config.camera_name().to_string(),
            location_id: config.location_id().map(str::to_string),
            rx,
            metrics,
        }
    }

    /// Run the publisher loop until the channel closes
    pub async fn run(mut self) {
        info!(
            file = %self.egress.file_path(),
            http = %self.http_url.as_deref().unwrap_or("-"),
            embed_images = %self.embed_images,
            "publisher_started"
        );

        let mut published = 0u64;
        while let Some(msg) = self.rx.recv().await {
            self.publish(msg).await;
            published += 1;
        }

        info!(published = %published, "publisher_stopped");
    }

    async fn publish(&self, msg: EgressMessage) {
        let mut value = match msg.to_value() {
            Ok(v) => v,
            Err(e) => {
                error!(kind = %msg.kind(), error = %e, "egress_serialize_failed");
                self.metrics.record_egress_failed();
                return;
            }
        };
        self.annotate(&mut value);
        if self.embed_images {
            if let Some(image) = msg.image_ref() {
                if let (Some(encoded), Some(obj)) =
                    (read_image_base64(image.as_str()).await, value.as_object_mut())
                {
                    obj.insert("image_b64".to_string(), Value::String(encoded));
                }
            }
        }

        if self.egress.write_value(&value) {
            self.metrics.record_egress_written();
        } else {
            self.metrics.record_egress_failed();
        }

        self.post(msg.kind(), &value).await;
    }

    /// Add site identity fields
    fn annotate(&self, value: &mut Value) {
        let Some(obj) = value.as_object_mut() else {
            return;
        };
        obj.insert("site".to_string(), self.site_id.clone().into());
        obj.insert("camera".to_string(), self.camera_name.clone().into());
        if let Some(ref location) = self.location_id {
            obj.insert("location".to_string(), location.clone().into());
        }
    }

    async fn post(&self, kind: &str, value: &Value) {
        let (Some(client), Some(url)) = (&self.http_client, &self.http_url) else {
            return;
        };
        let body = match serde_json::to_vec(value) {
            Ok(b) => b,
            Err(e) => {
                error!(kind = %kind, error = %e, "egress_serialize_failed");
                self.metrics.record_egress_failed();
                return;
            }
        };

        match client
            .post(url)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                debug!(kind = %kind, status = %response.status().as_u16(), "egress_http_posted");
            }
            Ok(response) => {
                self.metrics.record_egress_failed();
                warn!(kind = %kind, status = %response.status().as_u16(), "egress_http_rejected");
            }
            Err(e) => {
                self.metrics.record_egress_failed();
                error!(kind = %kind, error = %e, "egress_http_failed");
            }
        }
    }
}

/// Read a local image and encode it; remote references are not fetched
async fn read_image_base64(path: &str) -> Option<String> {
    if path.starts_with("http://") || path.starts_with("https://") {
        return None;
    }
    match tokio::fs::read(path).await {
        Ok(bytes) => Some(STANDARD.encode(bytes)),
        Err(e) => {
            warn!(path = %path, error = %e, "egress_image_read_failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::record::{DwellAlert, Severity};
    use crate::domain::types::{EntityId, ImageRef, SessionId};
    use crate::io::egress_channel::create_egress_channel;
    use chrono::Utc;
    use tempfile::tempdir;

    fn dwell_alert(snapshot: Option<ImageRef>) -> DwellAlert {
        DwellAlert {
            session_id: SessionId::new(),
            entity_id: EntityId(3),
            zone: "Zone-1".to_string(),
            dwell_secs: 75,
            entered_at: Utc::now(),
            severity: Severity::High,
            snapshot,
        }
    }

    fn write_config(dir: &std::path::Path, extra: &str) -> Config {
        let out = dir.join("out.jsonl");
        let path = dir.join("config.toml");
        let toml = format!(
            "[site]\nid = \"lot-7\"\n\n[egress]\nfile = \"{}\"\n{}\n",
            out.display(),
            extra
        );
        std::fs::write(&path, toml).unwrap();
        Config::from_file(&path).unwrap()
    }

    #[tokio::test]
    async fn test_publishes_until_channel_closed() {
        let dir = tempdir().unwrap();
        let config = write_config(dir.path(), "");
        let metrics = Arc::new(Metrics::new());
        let (sender, rx) = create_egress_channel(8);

        let publisher = Publisher::new(&config, rx, metrics.clone());
        let handle = tokio::spawn(publisher.run());

        assert!(sender.send_dwell_alert(&dwell_alert(None)));
        assert!(sender.send_dwell_alert(&dwell_alert(None)));
        drop(sender);
        handle.await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("out.jsonl")).unwrap();
        let lines: Vec<Value> =
            content.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "dwell_alert");
        assert_eq!(lines[0]["site"], "lot-7");
        assert_eq!(lines[0]["severity"], "high");
        assert!(lines[0].get("image_b64").is_none());
    }

    #[tokio::test]
    async fn test_embeds_images() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("snap.jpg");
        std::fs::write(&image, b"jpeg").unwrap();
        let config = write_config(dir.path(), "embed_images = true");

        let (sender, rx) = create_egress_channel(8);
        let publisher = Publisher::new(&config, rx, Arc::new(Metrics::new()));
        let handle = tokio::spawn(publisher.run());

        let snapshot = ImageRef(image.display().to_string());
        sender.send_dwell_alert(&dwell_alert(Some(snapshot)));
        drop(sender);
        handle.await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("out.jsonl")).unwrap();
        let line: Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(line["image_b64"], STANDARD.encode(b"jpeg"));
    }

    #[tokio::test]
    async fn test_http_failure_is_counted_not_retried() {
        let dir = tempdir().unwrap();
        // Nothing listens on port 9 (discard); the POST fails fast
        let config = write_config(
            dir.path(),
            "http_url = \"http://127.0.0.1:9/ingest\"\nhttp_timeout_ms = 500",
        );
        let metrics = Arc::new(Metrics::new());
        let (sender, rx) = create_egress_channel(8);
        let handle = tokio::spawn(Publisher::new(&config, rx, metrics.clone()).run());

        sender.send_dwell_alert(&dwell_alert(None));
        drop(sender);
        handle.await.unwrap();

        // File write still happened
        let content = std::fs::read_to_string(dir.path().join("out.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 1);
        let summary = metrics.report();
        assert_eq!(summary.egress_written_total, 1);
        assert_eq!(summary.egress_failed_total, 1);
    }
}
