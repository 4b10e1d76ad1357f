//! [`KernelChannel`] over a running Jupyter kernel.
//!
//! Connects as an extra client to the kernel's shell and iopub sockets, the
//! same way a second notebook frontend would. Requests are correlated by the
//! client-assigned message id: iopub outputs and the shell `execute_reply` are
//! routed to the pending request, and a request completes once both its reply
//! and its `idle` status have arrived.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use jupyter_protocol::{
    ConnectionInfo, ExecuteRequest, ExecutionState, JupyterMessage, JupyterMessageContent,
    KernelInfoRequest, ReplyStatus,
};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::channel::{
    ChannelError, ExecutionStatus, KernelChannel, KernelMessage, KernelRequest, MessageContent,
    MimeBundle, RequestEvent, RequestHandle, RestartSignal,
};
use crate::handler::lock;
use crate::language::KernelLanguage;

const KERNEL_INFO_TIMEOUT: Duration = Duration::from_secs(30);
const MESSAGE_CAPACITY: usize = 256;

struct PendingRequest {
    events: mpsc::UnboundedSender<RequestEvent>,
    reply: Option<ExecutionStatus>,
    idle: bool,
}

impl PendingRequest {
    fn new(events: mpsc::UnboundedSender<RequestEvent>) -> Self {
        Self {
            events,
            reply: None,
            idle: false,
        }
    }
}

type PendingMap = Arc<StdMutex<HashMap<String, PendingRequest>>>;

fn route_output(pending: &PendingMap, msg_id: &str, content: MessageContent) {
    if let Some(entry) = lock(pending).get(msg_id) {
        let _ = entry.events.send(RequestEvent::Output(content));
    }
}

/// Apply `update` to the request and complete it once reply and idle are in.
fn settle(pending: &PendingMap, msg_id: &str, update: impl FnOnce(&mut PendingRequest)) {
    let mut map = lock(pending);
    let status = match map.get_mut(msg_id) {
        Some(entry) => {
            update(entry);
            entry.reply.filter(|_| entry.idle)
        }
        None => return,
    };
    if let Some(status) = status {
        if let Some(entry) = map.remove(msg_id) {
            let _ = entry.events.send(RequestEvent::Done(status));
        }
    }
}

/// Drop every pending request; their handles observe `ChannelError::Closed`.
fn fail_pending(pending: &PendingMap) {
    let mut map = lock(pending);
    if !map.is_empty() {
        debug!("[jupyter-channel] Dropping {} pending requests", map.len());
        map.clear();
    }
}

fn media_bundle<T: serde::Serialize>(media: &T) -> MimeBundle {
    match serde_json::to_value(media) {
        Ok(Value::Object(map)) => map,
        _ => MimeBundle::new(),
    }
}

/// Map the iopub message kinds the inspector cares about.
fn convert(content: JupyterMessageContent) -> Option<MessageContent> {
    match content {
        JupyterMessageContent::ExecuteInput(input) => {
            Some(MessageContent::ExecuteInput { code: input.code })
        }
        JupyterMessageContent::ExecuteResult(result) => Some(MessageContent::ExecuteResult {
            data: media_bundle(&result.data),
        }),
        JupyterMessageContent::DisplayData(display) => Some(MessageContent::DisplayData {
            data: media_bundle(&display.data),
        }),
        JupyterMessageContent::ErrorOutput(e) => Some(MessageContent::Error {
            ename: e.ename,
            evalue: e.evalue,
            traceback: e.traceback,
        }),
        JupyterMessageContent::StreamContent(stream) => Some(MessageContent::Stream {
            name: match stream.name {
                jupyter_protocol::Stdio::Stdout => "stdout".to_string(),
                jupyter_protocol::Stdio::Stderr => "stderr".to_string(),
            },
            text: stream.text,
        }),
        _ => None,
    }
}

/// Turns iopub status messages into restart signals.
///
/// A `restarting` or `starting` status opens a restart: outstanding requests
/// are dropped and one [`RestartSignal`] is announced. The next `idle` status
/// resolves it. Further `restarting`/`starting` statuses while a restart is
/// open announce nothing. Parented `idle` statuses also settle their request.
struct RestartTracker {
    pending: PendingMap,
    open: Option<oneshot::Sender<()>>,
}

impl RestartTracker {
    fn new(pending: PendingMap) -> Self {
        Self {
            pending,
            open: None,
        }
    }

    fn on_status(&mut self, state: &ExecutionState, parent: Option<&str>) -> Option<RestartSignal> {
        match state {
            ExecutionState::Restarting | ExecutionState::Starting => {
                if self.open.is_some() {
                    return None;
                }
                info!("[jupyter-channel] Kernel is restarting");
                fail_pending(&self.pending);
                let (done, signal) = RestartSignal::pending();
                self.open = Some(done);
                Some(signal)
            }
            ExecutionState::Idle => {
                if let Some(done) = self.open.take() {
                    info!("[jupyter-channel] Kernel is back after restart");
                    let _ = done.send(());
                }
                if let Some(msg_id) = parent {
                    settle(&self.pending, msg_id, |p| p.idle = true);
                }
                None
            }
            _ => None,
        }
    }
}

pub struct JupyterChannel {
    language: KernelLanguage,
    session_id: String,
    shell_writer: tokio::sync::Mutex<runtimelib::DealerSendConnection>,
    pending: PendingMap,
    messages: broadcast::Sender<KernelMessage>,
    restarts: broadcast::Sender<RestartSignal>,
    iopub_task: StdMutex<Option<JoinHandle<()>>>,
    shell_reader_task: StdMutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl JupyterChannel {
    /// Read a kernel connection file and connect to it.
    pub async fn from_connection_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let connection_info: ConnectionInfo = serde_json::from_str(&content)?;
        Self::connect(&connection_info).await
    }

    pub async fn connect(connection_info: &ConnectionInfo) -> Result<Self> {
        let session_id = Uuid::new_v4().to_string();

        let mut iopub =
            runtimelib::create_client_iopub_connection(connection_info, "", &session_id).await?;

        let identity = runtimelib::peer_identity_for_session(&session_id)?;
        let mut shell = runtimelib::create_client_shell_connection_with_identity(
            connection_info,
            &session_id,
            identity,
        )
        .await?;

        // Verify kernel is alive with kernel_info handshake
        let request: JupyterMessage = KernelInfoRequest::default().into();
        shell.send(request).await?;

        let language = match tokio::time::timeout(KERNEL_INFO_TIMEOUT, shell.read()).await {
            Ok(Ok(msg)) => match msg.content {
                JupyterMessageContent::KernelInfoReply(reply) => {
                    info!(
                        "[jupyter-channel] Connected to {} kernel",
                        reply.language_info.name
                    );
                    KernelLanguage::from_name(&reply.language_info.name)
                }
                _ => {
                    warn!(
                        "[jupyter-channel] Expected kernel_info_reply, got {}",
                        msg.header.msg_type
                    );
                    KernelLanguage::Other("unknown".to_string())
                }
            },
            Ok(Err(e)) => return Err(anyhow::anyhow!("Kernel did not respond: {}", e)),
            Err(_) => {
                return Err(anyhow::anyhow!(
                    "Kernel did not respond within {}s",
                    KERNEL_INFO_TIMEOUT.as_secs()
                ))
            }
        };

        let (shell_writer, mut shell_reader) = shell.split();
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let (messages, _) = broadcast::channel(MESSAGE_CAPACITY);
        let (restarts, _) = broadcast::channel(8);

        let iopub_pending = pending.clone();
        let iopub_messages = messages.clone();
        let iopub_restarts = restarts.clone();
        let iopub_task = tokio::spawn(async move {
            let mut tracker = RestartTracker::new(iopub_pending.clone());
            loop {
                let message = match iopub.read().await {
                    Ok(message) => message,
                    Err(e) => {
                        error!("[jupyter-channel] iopub read error: {}", e);
                        break;
                    }
                };
                let parent = message.parent_header.as_ref().map(|h| h.msg_id.clone());

                match message.content {
                    JupyterMessageContent::Status(status) => {
                        if let Some(signal) =
                            tracker.on_status(&status.execution_state, parent.as_deref())
                        {
                            let _ = iopub_restarts.send(signal);
                        }
                    }
                    content => {
                        let Some(content) = convert(content) else {
                            continue;
                        };
                        if let Some(msg_id) = &parent {
                            route_output(&iopub_pending, msg_id, content.clone());
                        }
                        let _ = iopub_messages.send(KernelMessage {
                            parent_msg_id: parent,
                            content,
                        });
                    }
                }
            }
            fail_pending(&iopub_pending);
        });

        let shell_pending = pending.clone();
        let shell_reader_task = tokio::spawn(async move {
            loop {
                match shell_reader.read().await {
                    Ok(msg) => {
                        let parent_msg_id = msg.parent_header.as_ref().map(|h| h.msg_id.clone());
                        match msg.content {
                            JupyterMessageContent::ExecuteReply(reply) => {
                                let status = if reply.status == ReplyStatus::Ok {
                                    ExecutionStatus::Ok
                                } else {
                                    ExecutionStatus::Error
                                };
                                if let Some(msg_id) = parent_msg_id {
                                    settle(&shell_pending, &msg_id, |p| p.reply = Some(status));
                                }
                            }
                            _ => {
                                debug!("[jupyter-channel] shell reply: type={}", msg.header.msg_type);
                            }
                        }
                    }
                    Err(e) => {
                        error!("[jupyter-channel] shell read error: {}", e);
                        break;
                    }
                }
            }
            fail_pending(&shell_pending);
        });

        Ok(Self {
            language,
            session_id,
            shell_writer: tokio::sync::Mutex::new(shell_writer),
            pending,
            messages,
            restarts,
            iopub_task: StdMutex::new(Some(iopub_task)),
            shell_reader_task: StdMutex::new(Some(shell_reader_task)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Stop both reader tasks and fail outstanding requests.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = lock(&self.iopub_task).take() {
            task.abort();
        }
        if let Some(task) = lock(&self.shell_reader_task).take() {
            task.abort();
        }
        fail_pending(&self.pending);
        info!("[jupyter-channel] Disconnected session {}", self.session_id);
    }
}

impl Drop for JupyterChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl KernelChannel for JupyterChannel {
    async fn ready(&self) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected);
        }
        Ok(())
    }

    async fn kernel_language(&self) -> Result<KernelLanguage, ChannelError> {
        Ok(self.language.clone())
    }

    async fn execute(&self, request: KernelRequest) -> Result<RequestHandle, ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected);
        }

        let mut message: JupyterMessage = ExecuteRequest {
            code: request.code,
            silent: request.silent,
            store_history: request.store_history,
            user_expressions: None,
            allow_stdin: false,
            stop_on_error: false,
        }
        .into();
        message.header.msg_id = request.msg_id.clone();

        // Register before sending so early iopub traffic finds the request.
        let (events, handle) = RequestHandle::channel(request.msg_id.clone());
        lock(&self.pending).insert(request.msg_id.clone(), PendingRequest::new(events));

        let mut shell = self.shell_writer.lock().await;
        if let Err(e) = shell.send(message).await {
            lock(&self.pending).remove(&request.msg_id);
            return Err(ChannelError::Send(e.to_string()));
        }
        debug!("[jupyter-channel] Sent execute_request: msg_id={}", request.msg_id);
        Ok(handle)
    }

    fn messages(&self) -> broadcast::Receiver<KernelMessage> {
        self.messages.subscribe()
    }

    fn restarts(&self) -> broadcast::Receiver<RestartSignal> {
        self.restarts.subscribe()
    }
}
