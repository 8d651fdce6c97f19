use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::sse::{classify_line, rewrite_endpoint_data, SseLine};

const EVENT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    Sent,
    Received,
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub direction: MessageDirection,
    pub service: String,
    pub body: String,
}

struct SessionState {
    endpoints: HashMap<String, String>,
    messages: Vec<MessageRecord>,
    last_activity: Instant,
}

/// A global fan-in/fan-out session: one client-facing SSE stream multiplexed
/// over however many backends were registered when the session was opened.
///
/// Mirrors the upstream proxy's session type one-for-one: a bounded,
/// drop-when-full event channel feeds the client stream, a subscriber task
/// per backend feeds the channel, and `close()` is idempotent so a GC sweep
/// racing a client disconnect never double-frees anything.
pub struct Session {
    pub id: String,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    subscribers: StdMutex<Vec<JoinHandle<()>>>,
    state: StdMutex<SessionState>,
    http_client: reqwest::Client,
}

impl Session {
    pub fn new(http_client: reqwest::Client) -> (std::sync::Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let session = std::sync::Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            tx,
            cancel: CancellationToken::new(),
            subscribers: StdMutex::new(Vec::new()),
            state: StdMutex::new(SessionState {
                endpoints: HashMap::new(),
                messages: Vec::new(),
                last_activity: Instant::now(),
            }),
            http_client,
        });
        (session, rx)
    }

    /// Subscribe to one backend's `/sse` stream: parse `event:`/`data:` lines,
    /// stash `endpoint` events without forwarding them (the gateway answers
    /// the client's own endpoint event itself), and forward everything else
    /// with the path rewritten to route back through this gateway.
    pub fn subscribe(self: &std::sync::Arc<Self>, service_name: String, sse_url: String) {
        let session = self.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            if let Err(error) = session.run_subscriber(&service_name, &sse_url, cancel).await {
                tracing::debug!(service = %service_name, error = %error, "sse subscriber ended");
            }
        });
        self.subscribers.lock().expect("subscribers mutex poisoned").push(handle);
    }

    async fn run_subscriber(
        self: &std::sync::Arc<Self>,
        service_name: &str,
        sse_url: &str,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let response = self.http_client.get(sse_url).send().await?;
        let stream = response.bytes_stream();
        let reader = tokio_util::io::StreamReader::new(
            stream.map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))),
        );
        let mut lines = BufReader::new(reader).lines();
        let mut current_event: Option<String> = None;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => line,
            };
            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(_) => break,
            };

            match classify_line(&line) {
                SseLine::Event(name) => current_event = Some(name),
                SseLine::Data(payload) => {
                    if current_event.as_deref() == Some("endpoint") {
                        self.record_endpoint(service_name, &payload);
                    } else {
                        let rewritten =
                            rewrite_endpoint_data(service_name, current_event.as_deref(), &payload);
                        self.record_received(service_name, &rewritten);
                        self.send_event(rewritten).await;
                    }
                }
                SseLine::Other(_) | SseLine::Blank => {}
            }
        }
        Ok(())
    }

    fn record_endpoint(&self, service_name: &str, endpoint: &str) {
        let mut state = self.state.lock().expect("session state mutex poisoned");
        state
            .endpoints
            .insert(service_name.to_string(), endpoint.to_string());
        state.last_activity = Instant::now();
    }

    fn record_received(&self, service_name: &str, body: &str) {
        let mut state = self.state.lock().expect("session state mutex poisoned");
        state.messages.push(MessageRecord {
            direction: MessageDirection::Received,
            service: service_name.to_string(),
            body: body.to_string(),
        });
        state.last_activity = Instant::now();
    }

    pub fn record_sent(&self, service_name: &str, body: &str) {
        let mut state = self.state.lock().expect("session state mutex poisoned");
        state.messages.push(MessageRecord {
            direction: MessageDirection::Sent,
            service: service_name.to_string(),
            body: body.to_string(),
        });
        state.last_activity = Instant::now();
    }

    pub fn endpoint_for(&self, service_name: &str) -> Option<String> {
        self.state
            .lock()
            .expect("session state mutex poisoned")
            .endpoints
            .get(service_name)
            .cloned()
    }

    /// Enqueue a line for the client-facing stream. Non-blocking: a client
    /// that has stopped reading just misses events rather than stalling
    /// every backend's subscriber task.
    async fn send_event(&self, data: String) {
        if self.tx.try_send(data).is_err() {
            tracing::debug!(session = %self.id, "event channel full or closed, dropping event");
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.state
            .lock()
            .expect("session state mutex poisoned")
            .last_activity
            .elapsed()
    }

    /// Stop every subscriber task and wait for them to finish. Safe to call
    /// more than once: subsequent calls cancel an already-cancelled token and
    /// await already-finished handles.
    pub async fn close(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = std::mem::take(
            &mut *self.subscribers.lock().expect("subscribers mutex poisoned"),
        );
        for handle in handles {
            let _ = handle.await;
        }
    }
}

use futures::StreamExt;
