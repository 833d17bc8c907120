//! Built-in application: reports service liveness as JSON.

use crate::runtime::http::{RequestHead, Response};
use crate::runtime::Application;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

#[derive(Serialize)]
struct StatusBody<'a> {
    service: &'a str,
    engine: &'a str,
    status: &'static str,
    started_at: String,
    uptime_secs: i64,
    requests_served: u64,
}

/// Answers `GET`/`HEAD` on any path with the service status document.
///
/// For `HEAD` the event loop sends only the headers.
pub struct StatusApplication {
    service: String,
    engine: String,
    started_at: DateTime<Utc>,
    requests_served: u64,
}

impl StatusApplication {
    pub fn new(service: impl Into<String>, engine: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            engine: engine.into(),
            started_at: Utc::now(),
            requests_served: 0,
        }
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served
    }
}

impl Application for StatusApplication {
    fn handle(&mut self, request: &RequestHead) -> Response {
        if request.method != "GET" && request.method != "HEAD" {
            return Response::text(405, "method not allowed");
        }
        self.requests_served += 1;

        let body = StatusBody {
            service: &self.service,
            engine: &self.engine,
            status: "running",
            started_at: self.started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            requests_served: self.requests_served,
        };

        match serde_json::to_vec(&body) {
            Ok(json) => Response::json(200, json),
            Err(_) => Response::text(500, "status unavailable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str) -> RequestHead {
        RequestHead {
            method: method.into(),
            path: "/".into(),
            version: "HTTP/1.1".into(),
        }
    }

    #[test]
    fn test_status_document() {
        let mut app = StatusApplication::new("NDSchedulerService", "BaseScheduler");
        let response = app.handle(&request("GET"));
        assert_eq!(response.status, 200);
        assert_eq!(response.content_type, "application/json");

        let doc: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(doc["service"], "NDSchedulerService");
        assert_eq!(doc["engine"], "BaseScheduler");
        assert_eq!(doc["status"], "running");
        assert_eq!(doc["requests_served"], 1);
    }

    #[test]
    fn test_rejects_other_methods() {
        let mut app = StatusApplication::new("svc", "engine");
        assert_eq!(app.handle(&request("POST")).status, 405);
        assert_eq!(app.requests_served(), 0);
    }
}
