//! An in-memory kernel for exercising handlers without a Jupyter process.
//!
//! `DummyKernel` answers requests from a table of scripted replies keyed by the
//! exact code string, echoes `execute_input` for non-silent requests the way a
//! real kernel does, and can simulate user executions and restarts.
//!
//! Available behind the `test-utils` feature.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::channel::{
    ChannelError, ExecutionStatus, KernelChannel, KernelMessage, KernelRequest, MessageContent,
    MimeBundle, RequestEvent, RequestHandle, RestartSignal,
};
use crate::handler::lock;
use crate::language::KernelLanguage;
use crate::manager::VariableView;
use crate::variable::UpdateEvent;

/// How the dummy kernel answers a request.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Reply `ok` with no output.
    Ok,
    /// An `execute_result` whose `text/plain` is the given text.
    Result(String),
    /// A `display_data` whose `text/plain` is the given text.
    Display(String),
    /// An `execute_result` carrying `text/html`.
    Html(String),
    /// An `error` message followed by an error reply.
    Error { ename: String, evalue: String },
    /// Never reply. See [`DummyKernel::release_held`].
    Hold,
}

impl Scripted {
    pub fn error(ename: &str, evalue: &str) -> Self {
        Scripted::Error {
            ename: ename.to_string(),
            evalue: evalue.to_string(),
        }
    }
}

/// Scripted in-memory implementation of [`KernelChannel`].
pub struct DummyKernel {
    language: KernelLanguage,
    messages: broadcast::Sender<KernelMessage>,
    restarts: broadcast::Sender<RestartSignal>,
    requests: StdMutex<Vec<KernelRequest>>,
    responses: StdMutex<Vec<(String, Scripted)>>,
    held: StdMutex<Vec<(String, mpsc::UnboundedSender<RequestEvent>)>>,
}

impl DummyKernel {
    pub fn new(language: KernelLanguage) -> Arc<Self> {
        let (messages, _) = broadcast::channel(256);
        let (restarts, _) = broadcast::channel(8);
        Arc::new(Self {
            language,
            messages,
            restarts,
            requests: StdMutex::new(Vec::new()),
            responses: StdMutex::new(Vec::new()),
            held: StdMutex::new(Vec::new()),
        })
    }

    pub fn python() -> Arc<Self> {
        Self::new(KernelLanguage::Python)
    }

    /// Answer requests whose code equals `code` with `reply`.
    pub fn respond(&self, code: impl Into<String>, reply: Scripted) {
        let code = code.into();
        let mut responses = lock(&self.responses);
        responses.retain(|(c, _)| *c != code);
        responses.push((code, reply));
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<KernelRequest> {
        lock(&self.requests).clone()
    }

    /// How many requests carried exactly `code`.
    pub fn executions_of(&self, code: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|r| r.code == code)
            .count()
    }

    /// Simulate another client running `code` on this kernel.
    pub fn user_executes(&self, code: &str) {
        let _ = self.messages.send(KernelMessage {
            parent_msg_id: Some(Uuid::new_v4().to_string()),
            content: MessageContent::ExecuteInput {
                code: code.to_string(),
            },
        });
    }

    /// Announce a restart. The kernel is back once the returned sender fires.
    pub fn restart(&self) -> oneshot::Sender<()> {
        let (done, signal) = RestartSignal::pending();
        let _ = self.restarts.send(signal);
        done
    }

    /// Answer every held request with `reply`.
    pub fn release_held(&self, reply: Scripted) {
        let held: Vec<_> = lock(&self.held).drain(..).collect();
        for (msg_id, tx) in held {
            self.deliver(&msg_id, &tx, reply.clone());
        }
    }

    /// Number of requests waiting on [`Scripted::Hold`].
    pub fn held_count(&self) -> usize {
        lock(&self.held).len()
    }

    fn scripted_reply(&self, code: &str) -> Scripted {
        lock(&self.responses)
            .iter()
            .find(|(c, _)| c == code)
            .map(|(_, reply)| reply.clone())
            .unwrap_or(Scripted::Ok)
    }

    fn output(&self, msg_id: &str, tx: &mpsc::UnboundedSender<RequestEvent>, content: MessageContent) {
        let _ = self.messages.send(KernelMessage {
            parent_msg_id: Some(msg_id.to_string()),
            content: content.clone(),
        });
        let _ = tx.send(RequestEvent::Output(content));
    }

    fn deliver(&self, msg_id: &str, tx: &mpsc::UnboundedSender<RequestEvent>, reply: Scripted) {
        let status = match reply {
            Scripted::Ok => ExecutionStatus::Ok,
            Scripted::Result(text) => {
                let data = bundle("text/plain", text);
                self.output(msg_id, tx, MessageContent::ExecuteResult { data });
                ExecutionStatus::Ok
            }
            Scripted::Display(text) => {
                let data = bundle("text/plain", text);
                self.output(msg_id, tx, MessageContent::DisplayData { data });
                ExecutionStatus::Ok
            }
            Scripted::Html(html) => {
                let mut data = bundle("text/html", html);
                data.insert("text/plain".into(), Value::String("<HTML>".into()));
                self.output(msg_id, tx, MessageContent::ExecuteResult { data });
                ExecutionStatus::Ok
            }
            Scripted::Error { ename, evalue } => {
                let content = MessageContent::Error {
                    ename,
                    evalue,
                    traceback: Vec::new(),
                };
                self.output(msg_id, tx, content);
                ExecutionStatus::Error
            }
            Scripted::Hold => {
                lock(&self.held).push((msg_id.to_string(), tx.clone()));
                return;
            }
        };
        let _ = tx.send(RequestEvent::Done(status));
    }
}

fn bundle(mime: &str, text: String) -> MimeBundle {
    let mut data = MimeBundle::new();
    data.insert(mime.to_string(), Value::String(text));
    data
}

#[async_trait]
impl KernelChannel for DummyKernel {
    async fn ready(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn kernel_language(&self) -> Result<KernelLanguage, ChannelError> {
        Ok(self.language.clone())
    }

    async fn execute(&self, request: KernelRequest) -> Result<RequestHandle, ChannelError> {
        lock(&self.requests).push(request.clone());

        if !request.silent {
            let _ = self.messages.send(KernelMessage {
                parent_msg_id: Some(request.msg_id.clone()),
                content: MessageContent::ExecuteInput {
                    code: request.code.clone(),
                },
            });
        }

        let (tx, handle) = RequestHandle::channel(request.msg_id.clone());
        let reply = self.scripted_reply(&request.code);
        self.deliver(&request.msg_id, &tx, reply);
        Ok(handle)
    }

    fn messages(&self) -> broadcast::Receiver<KernelMessage> {
        self.messages.subscribe()
    }

    fn restarts(&self) -> broadcast::Receiver<RestartSignal> {
        self.restarts.subscribe()
    }
}

/// A view that records every event it is asked to render.
#[derive(Default)]
pub struct RecordingView {
    events: StdMutex<Vec<UpdateEvent>>,
}

impl RecordingView {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<UpdateEvent> {
        lock(&self.events).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` events were rendered. Returns false on timeout.
    pub async fn wait_for(&self, count: usize) -> bool {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while self.len() < count {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        true
    }
}

impl VariableView for RecordingView {
    fn render(&self, event: &UpdateEvent) {
        lock(&self.events).push(event.clone());
    }
}
