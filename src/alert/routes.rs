//! Built-in HTTP sinks: generic webhook, chat-channel webhook, and
//! incident-system webhook.
//!
//! These are conveniences; the router itself is transport-agnostic and
//! any closure returning a boxed future works as a handler.

use serde_json::json;

use crate::alert::AlertRoute;
use crate::event::Severity;
use crate::Error;

fn shared_client() -> reqwest::Client {
    reqwest::Client::new()
}

fn severity_color(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "#d00000",
        Severity::Error => "#e85d04",
        Severity::Warning => "#ffba08",
        Severity::Info => "#4895ef",
    }
}

/// POST the full event as JSON to `url`.
pub fn webhook_route(name: impl Into<String>, url: impl Into<String>) -> AlertRoute {
    let client = shared_client();
    let url = url.into();
    AlertRoute::new(name, move |event| {
        let client = client.clone();
        let url = url.clone();
        Box::pin(async move {
            let response = client
                .post(url.as_str())
                .json(&*event)
                .send()
                .await
                .map_err(Error::sink)?;
            response.error_for_status().map_err(Error::sink)?;
            Ok(())
        })
    })
}

/// POST a chat-channel payload (attachment with color, title and
/// fields) to a chat webhook `url`.
pub fn chat_webhook_route(name: impl Into<String>, url: impl Into<String>) -> AlertRoute {
    let client = shared_client();
    let url = url.into();
    AlertRoute::new(name, move |event| {
        let client = client.clone();
        let url = url.clone();
        Box::pin(async move {
            let mut fields = vec![
                json!({"title": "Severity", "value": event.severity.as_str(), "short": true}),
                json!({"title": "Source", "value": event.source, "short": true}),
            ];
            if let (Some(file), Some(line)) = (&event.file, event.line) {
                fields.push(json!({
                    "title": "Location",
                    "value": format!("{file}:{line}"),
                    "short": false,
                }));
            }
            if let Some(suggestion) = &event.suggestion {
                fields.push(json!({
                    "title": "Suggestion",
                    "value": suggestion,
                    "short": false,
                }));
            }
            let body = json!({
                "attachments": [{
                    "color": severity_color(event.severity),
                    "title": format!("{}", event.kind),
                    "text": serde_json::to_string(&event.payload).unwrap_or_default(),
                    "fields": fields,
                    "ts": event.timestamp_ms / 1000,
                }]
            });

            let response = client
                .post(url.as_str())
                .json(&body)
                .send()
                .await
                .map_err(Error::sink)?;
            response.error_for_status().map_err(Error::sink)?;
            Ok(())
        })
    })
}

/// POST an incident-trigger payload (routing key plus event action) to
/// an incident-system events endpoint `url`.
pub fn incident_webhook_route(
    name: impl Into<String>,
    url: impl Into<String>,
    routing_key: impl Into<String>,
) -> AlertRoute {
    let client = shared_client();
    let url = url.into();
    let routing_key = routing_key.into();
    AlertRoute::new(name, move |event| {
        let client = client.clone();
        let url = url.clone();
        let routing_key = routing_key.clone();
        Box::pin(async move {
            let body = json!({
                "routing_key": routing_key,
                "event_action": "trigger",
                "dedup_key": event.dedup_key(),
                "payload": {
                    "summary": format!("{}: {}", event.kind, event.source),
                    "severity": match event.severity {
                        Severity::Critical => "critical",
                        Severity::Error => "error",
                        Severity::Warning => "warning",
                        Severity::Info => "info",
                    },
                    "source": event.source,
                    "custom_details": event.payload,
                },
            });

            let response = client
                .post(url.as_str())
                .json(&body)
                .send()
                .await
                .map_err(Error::sink)?;
            response.error_for_status().map_err(Error::sink)?;
            Ok(())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factories_produce_enabled_named_routes() {
        let route = webhook_route("generic", "http://localhost:1/hook");
        assert_eq!(route.name(), "generic");

        let route = chat_webhook_route("chat", "http://localhost:1/chat");
        assert_eq!(route.name(), "chat");

        let route = incident_webhook_route("incidents", "http://localhost:1/enqueue", "key");
        assert_eq!(route.name(), "incidents");
    }

    #[test]
    fn colors_cover_every_severity() {
        let colors: Vec<&str> = Severity::ALL.iter().map(|s| severity_color(*s)).collect();
        assert_eq!(colors.len(), 4);
        assert!(colors.iter().all(|c| c.starts_with('#')));
    }
}
