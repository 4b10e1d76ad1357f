//! Inspection handlers.
//!
//! A [`KernelInspector`] drives one kernel session: it injects the language's
//! helper script once per kernel process, re-queries the variable list after
//! every execution it did not cause itself, and republishes the result to
//! subscribers. [`UnsupportedInspector`] stands in for kernels whose language
//! has no script bundle.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::channel::{
    ChannelError, ExecutionStatus, KernelChannel, KernelMessage, KernelRequest, MessageContent,
    RequestEvent, RequestHandle,
};
use crate::error::InspectError;
use crate::language::KernelLanguage;
use crate::matrix::MatrixModel;
use crate::scripts::{LanguageScripts, ScriptRegistry};
use crate::session::SessionId;
use crate::settings::InspectorSettings;
use crate::variable::{decode_variables, UpdateEvent, UpdateTitle};

const EVENT_CAPACITY: usize = 16;
const OWN_REQUEST_CAPACITY: usize = 256;

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Lifecycle of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerState {
    /// Waiting for the kernel to accept requests.
    Uninitialized,
    /// Helper script sent, reply pending.
    Initializing,
    Ready,
    /// Ready, with at least one query in flight.
    Inspecting,
    /// Kernel restart announced; waiting for the new process.
    Restarting,
    Disposed,
}

impl std::fmt::Display for HandlerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerState::Uninitialized => write!(f, "uninitialized"),
            HandlerState::Initializing => write!(f, "initializing"),
            HandlerState::Ready => write!(f, "ready"),
            HandlerState::Inspecting => write!(f, "inspecting"),
            HandlerState::Restarting => write!(f, "restarting"),
            HandlerState::Disposed => write!(f, "disposed"),
        }
    }
}

/// Bounded memory of the message ids this handler sent.
///
/// The kernel echoes each non-silent request as `execute_input` parented by
/// the request's id; those echoes must not trigger another inspection.
struct OwnRequests {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl OwnRequests {
    fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(OWN_REQUEST_CAPACITY),
            ids: HashSet::with_capacity(OWN_REQUEST_CAPACITY),
        }
    }

    fn remember(&mut self, msg_id: &str) {
        if self.order.len() == OWN_REQUEST_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(msg_id.to_string());
        self.ids.insert(msg_id.to_string());
    }

    fn contains(&self, msg_id: &str) -> bool {
        self.ids.contains(msg_id)
    }
}

struct Published {
    seq: u64,
    event: Option<UpdateEvent>,
}

/// Counts a query as in flight for as long as it lives.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Shared {
    session: SessionId,
    scripts: &'static LanguageScripts,
    channel: Arc<dyn KernelChannel>,
    settings: InspectorSettings,
    phase: watch::Sender<HandlerState>,
    in_flight: AtomicUsize,
    /// Bumped on every restart. Replies stamped with an older epoch are stale.
    epoch: AtomicU64,
    next_seq: AtomicU64,
    published: StdMutex<Published>,
    events: broadcast::Sender<UpdateEvent>,
    own_requests: StdMutex<OwnRequests>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn phase(&self) -> HandlerState {
        *self.phase.borrow()
    }

    /// Move to `next` unless disposed. Returns whether the phase changed.
    fn set_phase(&self, next: HandlerState) -> bool {
        self.phase.send_if_modified(|current| {
            if *current == HandlerState::Disposed || *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }

    async fn wait_ready(&self) -> Result<(), InspectError> {
        let mut phase = self.phase.subscribe();
        let state = phase
            .wait_for(|s| matches!(s, HandlerState::Ready | HandlerState::Disposed))
            .await
            .map(|s| *s)
            .map_err(|_| InspectError::Disposed)?;
        match state {
            HandlerState::Disposed => Err(InspectError::Disposed),
            _ => Ok(()),
        }
    }

    fn title(&self) -> UpdateTitle {
        UpdateTitle {
            session_label: Some(self.session.to_string()),
            language_label: Some(self.scripts.language.label().to_string()),
        }
    }

    async fn submit(&self, request: KernelRequest) -> Result<RequestHandle, InspectError> {
        lock(&self.own_requests).remember(&request.msg_id);
        debug!(
            "[inspector] {} -> {}",
            self.session,
            request.code.lines().next().unwrap_or_default()
        );
        Ok(self.channel.execute(request).await?)
    }

    /// Run `code` and publish the variable list it returns.
    async fn query(&self, code: &str) -> Result<UpdateEvent, InspectError> {
        self.wait_ready().await?;
        let epoch = self.epoch.load(Ordering::SeqCst);
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight::enter(&self.in_flight);

        let handle = self.submit(KernelRequest::new(code)).await?;
        let text = await_payload(handle, PayloadKind::ResultOrDisplay, "text/plain").await?;
        let variables = decode_variables(&text)?;
        self.publish(epoch, seq, UpdateEvent::new(self.title(), variables))
    }

    fn publish(&self, epoch: u64, seq: u64, event: UpdateEvent) -> Result<UpdateEvent, InspectError> {
        let mut published = lock(&self.published);
        if self.phase() == HandlerState::Disposed {
            return Err(InspectError::Disposed);
        }
        if self.epoch.load(Ordering::SeqCst) != epoch || seq <= published.seq {
            debug!(
                "[inspector] Dropping stale inspection #{} for {}",
                seq, self.session
            );
            return Err(InspectError::Superseded);
        }
        published.seq = seq;
        published.event = Some(event.clone());
        let _ = self.events.send(event.clone());
        Ok(event)
    }

    /// Publish `event`, superseding every query issued so far.
    fn publish_placeholder(&self, event: UpdateEvent) {
        let mut published = lock(&self.published);
        published.seq = self.next_seq.load(Ordering::SeqCst);
        published.event = Some(event.clone());
        let _ = self.events.send(event);
    }

    fn perform_inspection(self: &Arc<Self>) {
        let shared = self.clone();
        self.spawn_tracked(async move {
            match shared.query(shared.scripts.query).await {
                Ok(event) => debug!(
                    "[inspector] {} now has {} variables",
                    shared.session,
                    event.variables.len()
                ),
                Err(InspectError::Superseded) | Err(InspectError::Disposed) => {}
                Err(e) => warn!("[inspector] Inspection failed for {}: {}", shared.session, e),
            }
        });
    }

    fn spawn_tracked<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.phase() == HandlerState::Disposed {
            return;
        }
        let handle = tokio::spawn(task);
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    fn abort_tracked(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }

    /// Inject the helper script. Failures are logged; the handler becomes
    /// ready regardless so later queries surface the kernel's own error.
    async fn initialize(&self) {
        if !self.set_phase(HandlerState::Initializing) {
            return;
        }
        let request = KernelRequest::new(self.scripts.init).silent();
        match self.submit(request).await {
            Ok(handle) => match handle.finish().await {
                Ok(ExecutionStatus::Ok) => {
                    info!("[inspector] Initialized {} kernel for {}", self.scripts.language, self.session)
                }
                Ok(ExecutionStatus::Error) => warn!(
                    "[inspector] Init script failed in {}, inspections may error",
                    self.session
                ),
                Err(e) => warn!("[inspector] Init script for {} got no reply: {}", self.session, e),
            },
            Err(e) => error!("[inspector] Failed to send init script to {}: {}", self.session, e),
        }
        self.set_phase(HandlerState::Ready);
    }

    fn begin_restart(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if !self.set_phase(HandlerState::Restarting) {
            return;
        }
        self.abort_tracked();
        info!("[inspector] Kernel for {} is restarting", self.session);

        let title = UpdateTitle {
            session_label: Some(self.settings.restarting_label.clone()),
            language_label: Some(self.scripts.language.label().to_string()),
        };
        self.publish_placeholder(UpdateEvent::placeholder(title));
    }

    fn observe(self: &Arc<Self>, message: &KernelMessage) {
        if !matches!(message.content, MessageContent::ExecuteInput { .. }) {
            return;
        }
        let own = message
            .parent_msg_id
            .as_deref()
            .is_some_and(|id| lock(&self.own_requests).contains(id));
        if own {
            return;
        }
        debug!("[inspector] Code ran in {}, refreshing", self.session);
        self.perform_inspection();
    }
}

async fn recv_or_pending<T: Clone>(
    receiver: &mut Option<broadcast::Receiver<T>>,
) -> Result<T, RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_listener(shared: Arc<Shared>) {
    let mut restarts = Some(shared.channel.restarts());
    let mut messages = Some(shared.channel.messages());

    if let Err(e) = shared.channel.ready().await {
        warn!("[inspector] Kernel for {} not ready: {}", shared.session, e);
    }
    shared.initialize().await;

    while messages.is_some() || restarts.is_some() {
        tokio::select! {
            received = recv_or_pending(&mut messages) => match received {
                Ok(message) => shared.observe(&message),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("[inspector] Missed {} kernel messages for {}", skipped, shared.session);
                    shared.perform_inspection();
                }
                Err(RecvError::Closed) => {
                    debug!("[inspector] Message stream for {} closed", shared.session);
                    messages = None;
                }
            },
            signal = recv_or_pending(&mut restarts) => match signal {
                Ok(signal) => {
                    shared.begin_restart();
                    drop(messages.take());
                    if let Err(e) = signal.wait().await {
                        warn!("[inspector] Restart of {} did not complete: {}", shared.session, e);
                    }
                    messages = Some(shared.channel.messages());
                    shared.initialize().await;
                    shared.perform_inspection();
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => restarts = None,
            },
        }
    }
    debug!("[inspector] Listener for {} stopped", shared.session);
}

#[derive(Clone, Copy)]
enum PayloadKind {
    ResultOrDisplay,
    Result,
}

impl PayloadKind {
    fn accepts(self, content: &MessageContent) -> bool {
        match (self, content) {
            (_, MessageContent::ExecuteResult { .. }) => true,
            (PayloadKind::ResultOrDisplay, MessageContent::DisplayData { .. }) => true,
            _ => false,
        }
    }
}

/// Wait for the first accepted output carrying `mime`.
async fn await_payload(
    mut handle: RequestHandle,
    kind: PayloadKind,
    mime: &'static str,
) -> Result<String, InspectError> {
    while let Some(event) = handle.next().await {
        match event {
            RequestEvent::Output(MessageContent::Error { ename, evalue, .. }) => {
                return Err(InspectError::Kernel { ename, evalue });
            }
            RequestEvent::Output(content) if kind.accepts(&content) => {
                if let Some(text) = content.mime_text(mime) {
                    return Ok(text.to_string());
                }
            }
            RequestEvent::Output(_) => {}
            RequestEvent::Done(ExecutionStatus::Ok) => return Err(InspectError::NoResult),
            RequestEvent::Done(ExecutionStatus::Error) => {
                return Err(InspectError::Kernel {
                    ename: "ExecutionError".to_string(),
                    evalue: "execute_reply status error".to_string(),
                });
            }
        }
    }
    Err(ChannelError::Closed.into())
}

/// Inspection engine for a kernel whose language has a script bundle.
pub struct KernelInspector {
    shared: Arc<Shared>,
    listener: StdMutex<Option<JoinHandle<()>>>,
}

impl KernelInspector {
    /// Start inspecting `channel`. Must be called inside a Tokio runtime.
    pub fn start(
        session: SessionId,
        channel: Arc<dyn KernelChannel>,
        scripts: &'static LanguageScripts,
        settings: InspectorSettings,
    ) -> Self {
        let (phase, _) = watch::channel(HandlerState::Uninitialized);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            session,
            scripts,
            channel,
            settings,
            phase,
            in_flight: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
            published: StdMutex::new(Published {
                seq: 0,
                event: None,
            }),
            events,
            own_requests: StdMutex::new(OwnRequests::new()),
            tasks: StdMutex::new(Vec::new()),
        });
        let listener = tokio::spawn(run_listener(shared.clone()));
        Self {
            shared,
            listener: StdMutex::new(Some(listener)),
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.shared.session
    }

    pub fn language(&self) -> &KernelLanguage {
        &self.shared.scripts.language
    }

    pub fn state(&self) -> HandlerState {
        match self.shared.phase() {
            HandlerState::Ready if self.shared.in_flight.load(Ordering::SeqCst) > 0 => {
                HandlerState::Inspecting
            }
            phase => phase,
        }
    }

    /// Observe lifecycle transitions (`Inspecting` is not reported here).
    pub fn watch_state(&self) -> watch::Receiver<HandlerState> {
        self.shared.phase.subscribe()
    }

    /// Resolves once the helper script has run in the current kernel process.
    pub async fn ready(&self) -> Result<(), InspectError> {
        self.shared.wait_ready().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.shared.events.subscribe()
    }

    /// The most recently published event.
    pub fn latest(&self) -> Option<UpdateEvent> {
        lock(&self.shared.published).event.clone()
    }

    /// The latest event and a receiver for everything published after it.
    pub fn subscribe_from_latest(&self) -> (Option<UpdateEvent>, broadcast::Receiver<UpdateEvent>) {
        let published = lock(&self.shared.published);
        (published.event.clone(), self.shared.events.subscribe())
    }

    /// Request a refresh in the background. Results reach subscribers.
    pub fn perform_inspection(&self) {
        self.shared.perform_inspection();
    }

    /// Query the variable list and wait for it.
    pub async fn inspect(&self) -> Result<UpdateEvent, InspectError> {
        self.shared.query(self.shared.scripts.query).await
    }

    /// Fetch a table preview of `name`, at most `max_rows` rows.
    pub async fn perform_matrix_inspection(
        &self,
        name: &str,
        max_rows: usize,
    ) -> Result<MatrixModel, InspectError> {
        self.shared.wait_ready().await?;
        let _in_flight = InFlight::enter(&self.shared.in_flight);
        let command = self.shared.scripts.matrix_command(name, max_rows);
        let handle = self.shared.submit(KernelRequest::new(command)).await?;
        let text = await_payload(handle, PayloadKind::Result, "text/plain").await?;
        Ok(MatrixModel::decode(&text, max_rows)?)
    }

    /// Display the widget bound to `name`. The caller renders the outputs.
    pub async fn perform_widget_inspection(&self, name: &str) -> Result<RequestHandle, InspectError> {
        self.shared.wait_ready().await?;
        let command = self.shared.scripts.widget_command(name);
        self.shared.submit(KernelRequest::new(command)).await
    }

    /// Delete `name`. On success the refreshed list is published.
    pub async fn perform_delete(&self, name: &str) -> Result<UpdateEvent, InspectError> {
        let command = self.shared.scripts.delete_command(name);
        self.shared.query(&command).await.inspect_err(|e| {
            warn!("[inspector] Deleting {} in {} failed: {}", name, self.shared.session, e)
        })
    }

    /// Delete every user variable.
    pub async fn perform_all_delete(&self) -> Result<UpdateEvent, InspectError> {
        self.shared
            .query(self.shared.scripts.delete_all)
            .await
            .inspect_err(|e| {
                warn!("[inspector] Deleting all variables in {} failed: {}", self.shared.session, e)
            })
    }

    /// Evaluate `expression` and return its `text/html` rendering.
    pub async fn perform_preview(&self, expression: &str) -> Result<String, InspectError> {
        self.shared.wait_ready().await?;
        let _in_flight = InFlight::enter(&self.shared.in_flight);
        let handle = self.shared.submit(KernelRequest::new(expression)).await?;
        await_payload(handle, PayloadKind::Result, "text/html").await
    }

    /// Stop listening and cancel pending background work. Idempotent.
    pub fn dispose(&self) {
        if !self.shared.set_phase(HandlerState::Disposed) {
            return;
        }
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
        self.shared.abort_tracked();
        info!("[inspector] Disposed handler for {}", self.shared.session);
    }
}

impl Drop for KernelInspector {
    fn drop(&mut self) {
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
        self.shared.abort_tracked();
    }
}

/// Handler for kernels without a script bundle.
///
/// Every inspection request yields one empty event labelled as unsupported.
pub struct UnsupportedInspector {
    session: SessionId,
    language: KernelLanguage,
    label: String,
    phase: watch::Sender<HandlerState>,
    events: broadcast::Sender<UpdateEvent>,
    latest: StdMutex<Option<UpdateEvent>>,
}

impl UnsupportedInspector {
    pub fn new(session: SessionId, language: KernelLanguage, settings: &InspectorSettings) -> Self {
        let (phase, _) = watch::channel(HandlerState::Ready);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            session,
            language,
            label: settings.unsupported_label.clone(),
            phase,
            events,
            latest: StdMutex::new(None),
        }
    }

    fn placeholder(&self) -> UpdateEvent {
        UpdateEvent::placeholder(UpdateTitle {
            session_label: Some(self.session.to_string()),
            language_label: Some(self.label.clone()),
        })
    }

    fn emit(&self) -> Result<UpdateEvent, InspectError> {
        if *self.phase.borrow() == HandlerState::Disposed {
            return Err(InspectError::Disposed);
        }
        let event = self.placeholder();
        let mut latest = lock(&self.latest);
        *latest = Some(event.clone());
        let _ = self.events.send(event.clone());
        Ok(event)
    }

    fn unsupported<T>(&self) -> Result<T, InspectError> {
        Err(InspectError::UnsupportedLanguage(self.language.clone()))
    }

    pub fn dispose(&self) {
        self.phase.send_replace(HandlerState::Disposed);
    }
}

/// Ask the kernel for its language. A channel that cannot answer gets the
/// placeholder handler.
pub async fn probe_language(session: &SessionId, channel: &dyn KernelChannel) -> KernelLanguage {
    match channel.kernel_language().await {
        Ok(language) => language,
        Err(e) => {
            warn!("[inspector] Could not determine language for {}: {}", session, e);
            KernelLanguage::Other("unknown".to_string())
        }
    }
}

/// The handler registered for one session.
pub enum InspectionHandler {
    Kernel(KernelInspector),
    Unsupported(UnsupportedInspector),
}

impl InspectionHandler {
    /// Pick the handler variant for the language `channel` reports.
    pub async fn create(
        session: SessionId,
        channel: Arc<dyn KernelChannel>,
        settings: InspectorSettings,
    ) -> Self {
        let language = probe_language(&session, channel.as_ref()).await;
        Self::for_language(session, channel, language, settings)
    }

    pub fn for_language(
        session: SessionId,
        channel: Arc<dyn KernelChannel>,
        language: KernelLanguage,
        settings: InspectorSettings,
    ) -> Self {
        match ScriptRegistry::lookup(&language) {
            Ok(scripts) => {
                InspectionHandler::Kernel(KernelInspector::start(session, channel, scripts, settings))
            }
            Err(e) => {
                info!("[inspector] {} for {}, using placeholder handler", e, session);
                InspectionHandler::Unsupported(UnsupportedInspector::new(session, language, &settings))
            }
        }
    }

    pub fn session(&self) -> &SessionId {
        match self {
            InspectionHandler::Kernel(h) => h.session(),
            InspectionHandler::Unsupported(h) => &h.session,
        }
    }

    pub fn language(&self) -> &KernelLanguage {
        match self {
            InspectionHandler::Kernel(h) => h.language(),
            InspectionHandler::Unsupported(h) => &h.language,
        }
    }

    pub fn is_supported(&self) -> bool {
        matches!(self, InspectionHandler::Kernel(_))
    }

    pub fn state(&self) -> HandlerState {
        match self {
            InspectionHandler::Kernel(h) => h.state(),
            InspectionHandler::Unsupported(h) => *h.phase.borrow(),
        }
    }

    pub fn watch_state(&self) -> watch::Receiver<HandlerState> {
        match self {
            InspectionHandler::Kernel(h) => h.watch_state(),
            InspectionHandler::Unsupported(h) => h.phase.subscribe(),
        }
    }

    pub async fn ready(&self) -> Result<(), InspectError> {
        match self {
            InspectionHandler::Kernel(h) => h.ready().await,
            InspectionHandler::Unsupported(h) => match *h.phase.borrow() {
                HandlerState::Disposed => Err(InspectError::Disposed),
                _ => Ok(()),
            },
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        match self {
            InspectionHandler::Kernel(h) => h.subscribe(),
            InspectionHandler::Unsupported(h) => h.events.subscribe(),
        }
    }

    pub fn latest(&self) -> Option<UpdateEvent> {
        match self {
            InspectionHandler::Kernel(h) => h.latest(),
            InspectionHandler::Unsupported(h) => lock(&h.latest).clone(),
        }
    }

    /// Snapshot and subscription taken together, so no event is seen twice.
    pub fn subscribe_from_latest(&self) -> (Option<UpdateEvent>, broadcast::Receiver<UpdateEvent>) {
        match self {
            InspectionHandler::Kernel(h) => h.subscribe_from_latest(),
            InspectionHandler::Unsupported(h) => {
                let latest = lock(&h.latest);
                (latest.clone(), h.events.subscribe())
            }
        }
    }

    pub fn perform_inspection(&self) {
        match self {
            InspectionHandler::Kernel(h) => h.perform_inspection(),
            InspectionHandler::Unsupported(h) => {
                let _ = h.emit();
            }
        }
    }

    pub async fn inspect(&self) -> Result<UpdateEvent, InspectError> {
        match self {
            InspectionHandler::Kernel(h) => h.inspect().await,
            InspectionHandler::Unsupported(h) => h.emit(),
        }
    }

    pub async fn perform_matrix_inspection(
        &self,
        name: &str,
        max_rows: usize,
    ) -> Result<MatrixModel, InspectError> {
        match self {
            InspectionHandler::Kernel(h) => h.perform_matrix_inspection(name, max_rows).await,
            InspectionHandler::Unsupported(h) => h.unsupported(),
        }
    }

    pub async fn perform_widget_inspection(&self, name: &str) -> Result<RequestHandle, InspectError> {
        match self {
            InspectionHandler::Kernel(h) => h.perform_widget_inspection(name).await,
            InspectionHandler::Unsupported(h) => h.unsupported(),
        }
    }

    pub async fn perform_delete(&self, name: &str) -> Result<UpdateEvent, InspectError> {
        match self {
            InspectionHandler::Kernel(h) => h.perform_delete(name).await,
            InspectionHandler::Unsupported(h) => h.unsupported(),
        }
    }

    pub async fn perform_all_delete(&self) -> Result<UpdateEvent, InspectError> {
        match self {
            InspectionHandler::Kernel(h) => h.perform_all_delete().await,
            InspectionHandler::Unsupported(h) => h.unsupported(),
        }
    }

    pub async fn perform_preview(&self, expression: &str) -> Result<String, InspectError> {
        match self {
            InspectionHandler::Kernel(h) => h.perform_preview(expression).await,
            InspectionHandler::Unsupported(h) => h.unsupported(),
        }
    }

    pub fn dispose(&self) {
        match self {
            InspectionHandler::Kernel(h) => h.dispose(),
            InspectionHandler::Unsupported(h) => h.dispose(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{DummyKernel, Scripted};
    use std::time::Duration;
    use tokio::time::timeout;

    const QUERY: &str = "_varinspect_dict_list()";
    const DATAFRAME_REPLY: &str = r#"'[{"varName":"df","varType":"DataFrame","varSize":"128","varShape":"3 rows x 2 cols","varContent":"a, b","isMatrix":true,"isWidget":false}]'"#;
    const TABLE_REPLY: &str = r#"{"schema":{"fields":[{"name":"index","type":"integer"},{"name":"a","type":"integer"}],"primaryKey":["index"]},"data":[{"index":0,"a":1},{"index":1,"a":2},{"index":2,"a":3},{"index":3,"a":4},{"index":4,"a":5}]}"#;

    fn session() -> SessionId {
        SessionId::new("analysis.ipynb").unwrap()
    }

    fn start(kernel: &Arc<DummyKernel>) -> KernelInspector {
        let scripts = ScriptRegistry::lookup(&KernelLanguage::Python).unwrap();
        KernelInspector::start(session(), kernel.clone(), scripts, InspectorSettings::default())
    }

    async fn next_event(rx: &mut broadcast::Receiver<UpdateEvent>) -> UpdateEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for an update")
            .unwrap()
    }

    async fn wait_for_state(handler: &KernelInspector, state: HandlerState) {
        let mut rx = handler.watch_state();
        timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
            .await
            .expect("timed out waiting for state")
            .unwrap();
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn test_own_requests_forget_oldest() {
        let mut own = OwnRequests::new();
        for i in 0..OWN_REQUEST_CAPACITY + 1 {
            own.remember(&format!("m{i}"));
        }
        assert!(!own.contains("m0"));
        assert!(own.contains("m1"));
        assert!(own.contains(&format!("m{OWN_REQUEST_CAPACITY}")));
        assert_eq!(own.order.len(), OWN_REQUEST_CAPACITY);
    }

    #[tokio::test]
    async fn test_init_runs_once_silently() {
        let kernel = DummyKernel::python();
        let handler = start(&kernel);
        handler.ready().await.unwrap();

        let requests = kernel.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].silent);
        assert!(requests[0].code.contains("def _varinspect_dict_list"));
        assert_eq!(handler.state(), HandlerState::Ready);
    }

    #[tokio::test]
    async fn test_inspection_publishes_parsed_event() {
        let kernel = DummyKernel::python();
        kernel.respond(QUERY, Scripted::Result(DATAFRAME_REPLY.into()));
        let handler = start(&kernel);
        let mut rx = handler.subscribe();

        handler.perform_inspection();
        let event = next_event(&mut rx).await;

        assert_eq!(event.variables.len(), 1);
        let df = &event.variables[0];
        assert_eq!(df.name, "df");
        assert_eq!(df.declared_type, "DataFrame");
        assert!(df.is_tabular);
        assert_eq!(event.title.session_label.as_deref(), Some("analysis.ipynb"));
        assert_eq!(event.title.language_label.as_deref(), Some("Python"));
        assert_eq!(handler.latest(), Some(event));
    }

    #[tokio::test]
    async fn test_display_data_is_accepted_for_queries() {
        let kernel = DummyKernel::python();
        kernel.respond(QUERY, Scripted::Display("'[]'".into()));
        let handler = start(&kernel);
        assert!(handler.inspect().await.unwrap().variables.is_empty());
    }

    #[tokio::test]
    async fn test_user_execution_triggers_one_inspection() {
        let kernel = DummyKernel::python();
        kernel.respond(QUERY, Scripted::Result(DATAFRAME_REPLY.into()));
        let handler = start(&kernel);
        handler.ready().await.unwrap();
        let mut rx = handler.subscribe();

        kernel.user_executes("df = make_frame()");
        next_event(&mut rx).await;
        settle().await;

        assert_eq!(kernel.executions_of(QUERY), 1);
    }

    #[tokio::test]
    async fn test_own_echo_does_not_retrigger() {
        let kernel = DummyKernel::python();
        kernel.respond(QUERY, Scripted::Result("'[]'".into()));
        let handler = start(&kernel);

        handler.inspect().await.unwrap();
        settle().await;
        assert_eq!(kernel.executions_of(QUERY), 1);

        // Same text, but sent by someone else.
        let mut rx = handler.subscribe();
        kernel.user_executes(QUERY);
        next_event(&mut rx).await;
        settle().await;
        assert_eq!(kernel.executions_of(QUERY), 2);
    }

    #[tokio::test]
    async fn test_kernel_error_keeps_last_event() {
        let kernel = DummyKernel::python();
        kernel.respond(QUERY, Scripted::Result(DATAFRAME_REPLY.into()));
        let handler = start(&kernel);
        let first = handler.inspect().await.unwrap();

        kernel.respond(QUERY, Scripted::error("NameError", "name '_varinspect_dict_list' is not defined"));
        let err = handler.inspect().await.unwrap_err();
        assert!(matches!(err, InspectError::Kernel { ref ename, .. } if ename == "NameError"));
        assert_eq!(handler.latest(), Some(first));
        assert_eq!(handler.state(), HandlerState::Ready);
    }

    #[tokio::test]
    async fn test_malformed_reply_is_not_published() {
        let kernel = DummyKernel::python();
        kernel.respond(QUERY, Scripted::Result("'not json'".into()));
        let handler = start(&kernel);

        assert!(matches!(handler.inspect().await, Err(InspectError::Decode(_))));
        assert!(handler.latest().is_none());

        kernel.respond(QUERY, Scripted::Ok);
        assert!(matches!(handler.inspect().await, Err(InspectError::NoResult)));
    }

    #[tokio::test]
    async fn test_out_of_order_replies_are_dropped() {
        let kernel = DummyKernel::python();
        let handler = start(&kernel);
        let shared = &handler.shared;
        let older = UpdateEvent::placeholder(UpdateTitle::default());
        let newer = UpdateEvent::new(UpdateTitle::default(), decode_variables(DATAFRAME_REPLY).unwrap());

        assert!(shared.publish(0, 2, newer.clone()).is_ok());
        assert!(matches!(shared.publish(0, 1, older), Err(InspectError::Superseded)));
        assert_eq!(handler.latest(), Some(newer));
    }

    #[tokio::test]
    async fn test_restart_emits_placeholder_then_reinitializes() {
        let kernel = DummyKernel::python();
        kernel.respond(QUERY, Scripted::Result(DATAFRAME_REPLY.into()));
        let handler = start(&kernel);
        handler.ready().await.unwrap();
        let mut rx = handler.subscribe();

        let done = kernel.restart();
        let placeholder = next_event(&mut rx).await;
        assert!(placeholder.variables.is_empty());
        assert_eq!(
            placeholder.title.session_label.as_deref(),
            Some("Restarting kernel...")
        );
        assert_eq!(handler.state(), HandlerState::Restarting);

        done.send(()).unwrap();
        let refreshed = next_event(&mut rx).await;
        assert_eq!(refreshed.variables[0].name, "df");

        let inits = kernel.requests().iter().filter(|r| r.silent).count();
        assert_eq!(inits, 2);
    }

    #[tokio::test]
    async fn test_reply_from_before_restart_is_stale() {
        let kernel = DummyKernel::python();
        kernel.respond(QUERY, Scripted::Hold);
        let handler = start(&kernel);
        handler.ready().await.unwrap();

        let (result, _) = tokio::join!(handler.inspect(), async {
            while kernel.held_count() == 0 {
                settle().await;
            }
            assert_eq!(handler.state(), HandlerState::Inspecting);
            kernel.respond(QUERY, Scripted::Result("'[]'".into()));
            let done = kernel.restart();
            wait_for_state(&handler, HandlerState::Restarting).await;
            kernel.release_held(Scripted::Result(DATAFRAME_REPLY.into()));
            done.send(()).unwrap();
        });

        assert!(matches!(result, Err(InspectError::Superseded)));
        let latest = handler.latest().unwrap();
        assert!(latest.variables.iter().all(|v| v.name != "df"));
    }

    #[tokio::test]
    async fn test_matrix_preview_caps_rows() {
        let kernel = DummyKernel::python();
        let scripts = ScriptRegistry::lookup(&KernelLanguage::Python).unwrap();
        kernel.respond(scripts.matrix_command("df", 2), Scripted::Result(TABLE_REPLY.into()));
        let handler = start(&kernel);

        let model = handler.perform_matrix_inspection("df", 2).await.unwrap();
        assert_eq!(model.row_count(), 2);
        assert_eq!(model.column_names().collect::<Vec<_>>(), vec!["index", "a"]);
    }

    #[tokio::test]
    async fn test_matrix_preview_rejects_display_data() {
        let kernel = DummyKernel::python();
        let scripts = ScriptRegistry::lookup(&KernelLanguage::Python).unwrap();
        kernel.respond(scripts.matrix_command("df", 5), Scripted::Display(TABLE_REPLY.into()));
        let handler = start(&kernel);

        assert!(matches!(
            handler.perform_matrix_inspection("df", 5).await,
            Err(InspectError::NoResult)
        ));
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_list_and_does_not_retry() {
        let kernel = DummyKernel::python();
        let scripts = ScriptRegistry::lookup(&KernelLanguage::Python).unwrap();
        kernel.respond(QUERY, Scripted::Result(DATAFRAME_REPLY.into()));
        kernel.respond(scripts.delete_command("df"), Scripted::error("NameError", "df"));
        let handler = start(&kernel);
        let before = handler.inspect().await.unwrap();

        assert!(handler.perform_delete("df").await.is_err());
        settle().await;
        assert_eq!(handler.latest(), Some(before));
        assert_eq!(kernel.executions_of(&scripts.delete_command("df")), 1);
        assert_eq!(kernel.executions_of(QUERY), 1);
    }

    #[tokio::test]
    async fn test_delete_publishes_refreshed_list() {
        let kernel = DummyKernel::python();
        let scripts = ScriptRegistry::lookup(&KernelLanguage::Python).unwrap();
        kernel.respond(scripts.delete_command("df"), Scripted::Result("'[]'".into()));
        kernel.respond(scripts.delete_all, Scripted::Result("'[]'".into()));
        let handler = start(&kernel);
        let mut rx = handler.subscribe();

        assert!(handler.perform_delete("df").await.unwrap().variables.is_empty());
        assert!(next_event(&mut rx).await.variables.is_empty());
        assert!(handler.perform_all_delete().await.is_ok());
    }

    #[tokio::test]
    async fn test_preview_returns_html() {
        let kernel = DummyKernel::python();
        kernel.respond("df.head()", Scripted::Html("<table></table>".into()));
        let handler = start(&kernel);
        assert_eq!(handler.perform_preview("df.head()").await.unwrap(), "<table></table>");
    }

    #[tokio::test]
    async fn test_widget_returns_request_handle() {
        let kernel = DummyKernel::python();
        let handler = start(&kernel);
        let handle = handler.perform_widget_inspection("slider").await.unwrap();

        let last = kernel.requests().pop().unwrap();
        assert_eq!(handle.msg_id(), last.msg_id);
        assert!(last.code.contains(r#""slider""#));
        assert_eq!(handle.finish().await.unwrap(), ExecutionStatus::Ok);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_final() {
        let kernel = DummyKernel::python();
        let handler = start(&kernel);
        handler.ready().await.unwrap();

        handler.dispose();
        handler.dispose();
        assert_eq!(handler.state(), HandlerState::Disposed);
        assert!(matches!(handler.inspect().await, Err(InspectError::Disposed)));
        assert!(matches!(handler.ready().await, Err(InspectError::Disposed)));

        kernel.user_executes("x = 1");
        settle().await;
        assert_eq!(kernel.executions_of(QUERY), 0);
    }

    #[tokio::test]
    async fn test_unsupported_emits_one_event_per_request() {
        let kernel = DummyKernel::new(KernelLanguage::Other("julia".into()));
        let handler = InspectionHandler::create(session(), kernel.clone(), InspectorSettings::default()).await;
        assert!(!handler.is_supported());
        let mut rx = handler.subscribe();

        for _ in 0..3 {
            handler.perform_inspection();
        }
        for _ in 0..3 {
            let event = rx.try_recv().unwrap();
            assert!(event.variables.is_empty());
            assert_eq!(
                event.title.language_label.as_deref(),
                Some("Language currently not supported.")
            );
        }
        assert!(rx.try_recv().is_err());
        assert!(kernel.requests().is_empty());
        assert!(handler.perform_delete("x").await.unwrap_err().is_unsupported());
        assert!(handler.perform_matrix_inspection("x", 10).await.unwrap_err().is_unsupported());
    }

    #[tokio::test]
    async fn test_subscribe_from_latest_does_not_repeat_snapshot() {
        let kernel = DummyKernel::python();
        kernel.respond(QUERY, Scripted::Result(DATAFRAME_REPLY.into()));
        let handler = InspectionHandler::Kernel(start(&kernel));
        handler.inspect().await.unwrap();

        let (latest, mut rx) = handler.subscribe_from_latest();
        assert_eq!(latest.unwrap().variables[0].name, "df");
        settle().await;
        assert!(rx.try_recv().is_err());

        handler.inspect().await.unwrap();
        assert_eq!(next_event(&mut rx).await.variables.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsupported_subscribe_from_latest() {
        let kernel = DummyKernel::new(KernelLanguage::Other("julia".into()));
        let handler = InspectionHandler::create(session(), kernel, InspectorSettings::default()).await;
        let (latest, _) = handler.subscribe_from_latest();
        assert!(latest.is_none());

        handler.perform_inspection();
        let (latest, mut rx) = handler.subscribe_from_latest();
        assert!(latest.is_some());
        assert!(rx.try_recv().is_err());
        handler.perform_inspection();
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_create_picks_scripted_handler() {
        let kernel = DummyKernel::new(KernelLanguage::R);
        let handler = InspectionHandler::create(session(), kernel, InspectorSettings::default()).await;
        assert!(handler.is_supported());
        assert_eq!(handler.language(), &KernelLanguage::R);
        handler.ready().await.unwrap();
    }
}
