//! Remote delegation to an action server.
//!
//! The wire protocol: `POST {baseUrl}/action/run` with a JSON body
//! `{token, botId, actionName, actionArgs, incomingEvent}` — the bearer
//! token rides in the body, not a header. Every HTTP status is a valid
//! response envelope; only transport-level failures raise. Each attempt
//! records exactly one audit task.

pub mod token;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use url::Url;

use crate::audit::{AuditRepository, ExecutionTask, TaskStatus};
use crate::error::ActionError;
use crate::event::Event;

/// Connect and response timeout for the action-server call.
pub const REMOTE_TIMEOUT: Duration = Duration::from_secs(5);

/// An external process capable of executing actions over HTTP. The id
/// correlates audit records.
#[derive(Debug, Clone)]
pub struct ActionServer {
    pub id: String,
    pub base_url: Url,
}

impl ActionServer {
    pub fn new(id: &str, base_url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            id: id.to_string(),
            base_url: Url::parse(base_url)?,
        })
    }

    fn run_url(&self) -> String {
        format!("{}/action/run", self.base_url.as_str().trim_end_matches('/'))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunActionBody<'a> {
    token: &'a str,
    bot_id: &'a str,
    action_name: &'a str,
    action_args: &'a Value,
    incoming_event: &'a Event,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunActionResponse {
    incoming_event: Event,
}

pub struct RemoteDelegate {
    client: reqwest::Client,
    secret: String,
    audience: String,
    audit: Arc<dyn AuditRepository>,
}

impl RemoteDelegate {
    pub fn new(secret: &str, audience: &str, audit: Arc<dyn AuditRepository>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REMOTE_TIMEOUT)
            .connect_timeout(REMOTE_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            secret: secret.to_string(),
            audience: audience.to_string(),
            audit,
        }
    }

    /// Forwards one execution to the action server. Returns the event the
    /// server handed back (or the original one when the response body is
    /// not an event envelope), with `state.temp.responseStatusCode` set.
    pub async fn run(
        &self,
        workspace: &str,
        bot_id: &str,
        action_name: &str,
        action_args: &Value,
        incoming_event: &Event,
        server: &ActionServer,
    ) -> Result<Event, ActionError> {
        let started_at = Utc::now();
        let token = token::mint(&self.secret, bot_id, workspace, &self.audience);
        let body = RunActionBody {
            token: &token,
            bot_id,
            action_name,
            action_args,
            incoming_event,
        };

        match self.client.post(server.run_url()).json(&body).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let mut event = match response.json::<RunActionResponse>().await {
                    Ok(parsed) => parsed.incoming_event,
                    Err(_) => incoming_event.clone(),
                };
                event.set_response_status_code(status);
                // The call happened — completed whatever the status code;
                // the caller inspects responseStatusCode and acts on it
                self.record(ExecutionTask::new(
                    &incoming_event.id,
                    action_name,
                    action_args.clone(),
                    &server.id,
                    started_at,
                    TaskStatus::Completed,
                    None,
                ))
                .await;
                info!("Action {action_name} delegated to {} (HTTP {status})", server.id);
                Ok(event)
            }
            Err(e) => {
                let code = transport_error_code(&e);
                self.record(ExecutionTask::new(
                    &incoming_event.id,
                    action_name,
                    action_args.clone(),
                    &server.id,
                    started_at,
                    TaskStatus::Failed,
                    Some(code.to_string()),
                ))
                .await;
                Err(ActionError::Transport(format!("{code}: {e}")))
            }
        }
    }

    async fn record(&self, task: ExecutionTask) {
        if let Err(e) = self.audit.create_task(task).await {
            warn!("Failed to record execution task: {e}");
        }
    }
}

/// Node-style errno code derived from the transport error class.
fn transport_error_code(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        "ETIMEDOUT"
    } else if err.is_connect() {
        "ECONNREFUSED"
    } else if err.is_request() {
        "EREQUEST"
    } else {
        "EUNKNOWN"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditStore;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// One-shot HTTP stub: accepts a single request, returns the canned
    /// response, and hands the raw request back for inspection.
    async fn stub_server(status: u16, body: &str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let body = body.to_string();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = vec![0u8; 8192];
            let mut received = String::new();
            loop {
                let n = socket.read(&mut buf).await.expect("read");
                if n == 0 {
                    break;
                }
                received.push_str(&String::from_utf8_lossy(&buf[..n]));
                if let Some(headers_end) = received.find("\r\n\r\n") {
                    let content_length = received
                        .lines()
                        .find_map(|line| {
                            line.to_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if received.len() >= headers_end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {status} STATUS\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.expect("write");
            let _ = socket.shutdown().await;
            received
        });
        (format!("http://{addr}"), handle)
    }

    fn delegate(audit: Arc<MemoryAuditStore>) -> RemoteDelegate {
        RemoteDelegate::new("s3cret", "action-server", audit)
    }

    #[tokio::test]
    async fn successful_delegation_returns_the_remote_event() {
        let mut remote_event = Event::new("b1");
        remote_event.id = "ev-1".to_string();
        remote_event.state.temp = json!({"remote": true});
        let response_body =
            serde_json::to_string(&json!({"incomingEvent": remote_event})).expect("body");
        let (base_url, _stub) = stub_server(200, &response_body).await;

        let audit = Arc::new(MemoryAuditStore::new());
        let server = ActionServer::new("as-1", &base_url).expect("server");
        let mut event = Event::new("b1");
        event.id = "ev-1".to_string();

        let returned = delegate(audit.clone())
            .run("ws", "b1", "billing/charge", &json!({}), &event, &server)
            .await
            .expect("run");

        assert_eq!(returned.state.temp["remote"], json!(true));
        assert_eq!(returned.state.temp["responseStatusCode"], json!(200));
        let tasks = audit.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn http_500_is_not_an_error_and_audits_completed() {
        let (base_url, _stub) = stub_server(500, r#"{"error":"boom"}"#).await;
        let audit = Arc::new(MemoryAuditStore::new());
        let server = ActionServer::new("as-1", &base_url).expect("server");
        let event = Event::new("b1");

        let returned = delegate(audit.clone())
            .run("ws", "b1", "billing/charge", &json!({}), &event, &server)
            .await
            .expect("a 500 is still a response");

        assert_eq!(returned.state.temp["responseStatusCode"], json!(500));
        let tasks = audit.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert!(tasks[0].failure_reason.is_none());
    }

    #[tokio::test]
    async fn connection_failure_audits_failed_with_transport_code() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let audit = Arc::new(MemoryAuditStore::new());
        let server = ActionServer::new("as-1", &format!("http://{addr}")).expect("server");
        let event = Event::new("b1");

        let err = delegate(audit.clone())
            .run("ws", "b1", "billing/charge", &json!({}), &event, &server)
            .await
            .expect_err("must fail");

        assert!(matches!(err, ActionError::Transport(_)));
        let tasks = audit.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Failed);
        assert_eq!(tasks[0].failure_reason.as_deref(), Some("ECONNREFUSED"));
    }

    #[tokio::test]
    async fn wire_body_carries_the_protocol_fields() {
        let (base_url, stub) = stub_server(200, "{}").await;
        let audit = Arc::new(MemoryAuditStore::new());
        let server = ActionServer::new("as-1", &base_url).expect("server");
        let event = Event::new("b1");

        let _ = delegate(audit)
            .run("ws-acme", "b1", "nlu/detect", &json!({"k": "v"}), &event, &server)
            .await
            .expect("run");

        let raw = stub.await.expect("stub");
        assert!(raw.starts_with("POST /action/run HTTP/1.1"));
        let json_start = raw.find("\r\n\r\n").expect("body") + 4;
        let body: serde_json::Value = serde_json::from_str(&raw[json_start..]).expect("json");
        assert_eq!(body["botId"], json!("b1"));
        assert_eq!(body["actionName"], json!("nlu/detect"));
        assert_eq!(body["actionArgs"], json!({"k": "v"}));
        assert!(body.get("incomingEvent").is_some());

        // The in-body token is verifiable and workspace-scoped
        let claims = token::verify(
            "s3cret",
            body["token"].as_str().expect("token"),
            "action-server",
        )
        .expect("verify");
        assert_eq!(claims.workspace, "ws-acme");
    }

    #[tokio::test]
    async fn unparsable_success_body_falls_back_to_the_original_event() {
        let (base_url, _stub) = stub_server(200, "not json at all").await;
        let audit = Arc::new(MemoryAuditStore::new());
        let server = ActionServer::new("as-1", &base_url).expect("server");
        let mut event = Event::new("b1");
        event.state.temp = json!({"kept": 1});

        let returned = delegate(audit)
            .run("ws", "b1", "x", &json!({}), &event, &server)
            .await
            .expect("run");
        assert_eq!(returned.state.temp["kept"], json!(1));
        assert_eq!(returned.state.temp["responseStatusCode"], json!(200));
    }
}
