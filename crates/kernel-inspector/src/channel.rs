//! The contract between inspection handlers and a kernel connection.
//!
//! A [`KernelChannel`] accepts execute requests and publishes every message the
//! kernel broadcasts. Handlers never see the transport: the Jupyter wire
//! adapter lives in [`crate::jupyter_channel`], and tests use the in-memory
//! `DummyKernel` behind the `test-utils` feature.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::language::KernelLanguage;

/// MIME-keyed data of a result or display message.
pub type MimeBundle = Map<String, Value>;

/// Errors reported by a kernel channel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("Kernel not connected")]
    NotConnected,

    #[error("Failed to send request: {0}")]
    Send(String),

    #[error("Channel closed before the reply arrived")]
    Closed,

    #[error("Kernel did not respond in time")]
    Timeout,
}

/// An execute request with a client-assigned message id.
///
/// The id is chosen before sending so a handler can recognize its own
/// `execute_input` echoes on the broadcast stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelRequest {
    pub msg_id: String,
    pub code: String,
    /// No output, no `execute_input` broadcast, no execution count bump.
    pub silent: bool,
    pub store_history: bool,
}

impl KernelRequest {
    /// A non-silent request that is kept out of the kernel's history.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            code: code.into(),
            silent: false,
            store_history: false,
        }
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }
}

/// Payload of a broadcast kernel message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    ExecuteInput {
        code: String,
    },
    ExecuteResult {
        data: MimeBundle,
    },
    DisplayData {
        data: MimeBundle,
    },
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    Stream {
        name: String,
        text: String,
    },
}

impl MessageContent {
    pub fn msg_type(&self) -> &'static str {
        match self {
            MessageContent::ExecuteInput { .. } => "execute_input",
            MessageContent::ExecuteResult { .. } => "execute_result",
            MessageContent::DisplayData { .. } => "display_data",
            MessageContent::Error { .. } => "error",
            MessageContent::Stream { .. } => "stream",
        }
    }

    /// Text stored under `mime` for result and display messages.
    pub fn mime_text(&self, mime: &str) -> Option<&str> {
        match self {
            MessageContent::ExecuteResult { data } | MessageContent::DisplayData { data } => {
                data.get(mime).and_then(Value::as_str)
            }
            _ => None,
        }
    }
}

/// A message from the kernel's broadcast stream.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelMessage {
    /// `msg_id` of the request that caused this message, if any.
    pub parent_msg_id: Option<String>,
    pub content: MessageContent,
}

/// Final status of an execute request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Ok,
    Error,
}

/// Events delivered to the issuer of one request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestEvent {
    /// A broadcast message parented by the request.
    Output(MessageContent),
    /// The reply; nothing follows it.
    Done(ExecutionStatus),
}

/// The in-flight side of an execute request.
pub struct RequestHandle {
    msg_id: String,
    events: mpsc::UnboundedReceiver<RequestEvent>,
}

impl RequestHandle {
    /// Create a handle and the sender a channel uses to feed it.
    pub fn channel(msg_id: impl Into<String>) -> (mpsc::UnboundedSender<RequestEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                msg_id: msg_id.into(),
                events: rx,
            },
        )
    }

    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    /// Next event, or `None` once the channel dropped the request.
    pub async fn next(&mut self) -> Option<RequestEvent> {
        self.events.recv().await
    }

    /// Drain outputs until the reply arrives.
    pub async fn finish(mut self) -> Result<ExecutionStatus, ChannelError> {
        while let Some(event) = self.next().await {
            if let RequestEvent::Done(status) = event {
                return Ok(status);
            }
        }
        Err(ChannelError::Closed)
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("msg_id", &self.msg_id)
            .finish()
    }
}

/// Announces a kernel restart; resolves once the new process is ready.
#[derive(Clone)]
pub struct RestartSignal {
    ready: Shared<BoxFuture<'static, Result<(), ChannelError>>>,
}

impl RestartSignal {
    pub fn new(ready: BoxFuture<'static, Result<(), ChannelError>>) -> Self {
        Self {
            ready: ready.shared(),
        }
    }

    /// A signal resolved by sending on the returned sender.
    ///
    /// Dropping the sender resolves the signal with `ChannelError::Closed`.
    pub fn pending() -> (oneshot::Sender<()>, Self) {
        let (tx, rx) = oneshot::channel::<()>();
        let ready = async move { rx.await.map_err(|_| ChannelError::Closed) }.boxed();
        (tx, Self::new(ready))
    }

    /// A signal for a kernel that is already back.
    pub fn completed() -> Self {
        Self::new(futures::future::ready(Ok(())).boxed())
    }

    pub async fn wait(&self) -> Result<(), ChannelError> {
        self.ready.clone().await
    }
}

impl std::fmt::Debug for RestartSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestartSignal").finish_non_exhaustive()
    }
}

/// A connection to one running kernel.
#[async_trait]
pub trait KernelChannel: Send + Sync + 'static {
    /// Resolves once the kernel accepts requests.
    async fn ready(&self) -> Result<(), ChannelError>;

    /// The language reported by the kernel.
    async fn kernel_language(&self) -> Result<KernelLanguage, ChannelError>;

    /// Submit a request. Returns as soon as it is sent.
    async fn execute(&self, request: KernelRequest) -> Result<RequestHandle, ChannelError>;

    /// Subscribe to every message the kernel broadcasts, whoever caused it.
    fn messages(&self) -> broadcast::Receiver<KernelMessage>;

    /// Subscribe to restart announcements.
    fn restarts(&self) -> broadcast::Receiver<RestartSignal>;
}
