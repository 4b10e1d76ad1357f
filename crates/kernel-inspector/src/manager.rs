//! Session registry and active-handler tracking.
//!
//! The manager owns one [`InspectionHandler`] per session, remembers which one
//! is active (the session the user is looking at), and forwards that handler's
//! updates to the attached [`VariableView`]. Every activation owns its
//! subscriptions through [`TaskGuard`]s, so switching sessions, detaching the
//! view or disposing the handler releases them on every path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use log::{debug, info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::channel::{KernelChannel, RequestHandle};
use crate::error::InspectError;
use crate::handler::{lock, probe_language, HandlerState, InspectionHandler};
use crate::matrix::MatrixModel;
use crate::session::SessionId;
use crate::settings::InspectorSettings;
use crate::variable::UpdateEvent;

/// A surface that displays the active session's variables.
pub trait VariableView: Send + Sync + 'static {
    fn render(&self, event: &UpdateEvent);
}

/// Aborts the task when dropped.
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Activation {
    handler: Arc<InspectionHandler>,
    _disposal: TaskGuard,
    forwarding: Option<TaskGuard>,
}

#[derive(Default)]
struct ActiveState {
    active: Option<Activation>,
    view: Option<Arc<dyn VariableView>>,
}

pub struct InspectorManager {
    settings: InspectorSettings,
    handlers: StdMutex<HashMap<SessionId, Arc<InspectionHandler>>>,
    state: Arc<StdMutex<ActiveState>>,
}

impl Default for InspectorManager {
    fn default() -> Self {
        Self::new(InspectorSettings::default())
    }
}

impl InspectorManager {
    pub fn new(settings: InspectorSettings) -> Self {
        Self {
            settings,
            handlers: StdMutex::new(HashMap::new()),
            state: Arc::new(StdMutex::new(ActiveState::default())),
        }
    }

    pub fn settings(&self) -> &InspectorSettings {
        &self.settings
    }

    pub fn has_handler(&self, session: &SessionId) -> bool {
        lock(&self.handlers).contains_key(session)
    }

    pub fn get_handler(&self, session: &SessionId) -> Option<Arc<InspectionHandler>> {
        lock(&self.handlers).get(session).cloned()
    }

    /// Register `handler` under its session id. Last write wins; a different
    /// handler previously registered for the id is disposed and returned.
    pub fn add_handler(&self, handler: Arc<InspectionHandler>) -> Option<Arc<InspectionHandler>> {
        let session = handler.session().clone();
        let previous = lock(&self.handlers).insert(session.clone(), handler.clone());
        match previous {
            Some(previous) if !Arc::ptr_eq(&previous, &handler) => {
                warn!("[manager] Replacing handler for {}", session);
                previous.dispose();
                Some(previous)
            }
            _ => None,
        }
    }

    /// Return the handler for `session`, creating it for `channel` if needed.
    pub async fn handler_for(
        &self,
        session: SessionId,
        channel: Arc<dyn KernelChannel>,
    ) -> Arc<InspectionHandler> {
        if let Some(existing) = self.get_handler(&session) {
            return existing;
        }

        let language = probe_language(&session, channel.as_ref()).await;
        let mut handlers = lock(&self.handlers);
        handlers
            .entry(session.clone())
            .or_insert_with(|| {
                info!("[manager] Creating {} handler for {}", language, session);
                Arc::new(InspectionHandler::for_language(
                    session,
                    channel,
                    language,
                    self.settings.clone(),
                ))
            })
            .clone()
    }

    /// Dispose and forget the handler for `session`.
    pub fn remove_handler(&self, session: &SessionId) -> bool {
        let removed = lock(&self.handlers).remove(session);
        match removed {
            Some(handler) => {
                handler.dispose();
                self.clear_if_active(&handler);
                true
            }
            None => false,
        }
    }

    /// Registered session ids, sorted.
    pub fn sessions(&self) -> Vec<SessionId> {
        let mut sessions: Vec<_> = lock(&self.handlers).keys().cloned().collect();
        sessions.sort();
        sessions
    }

    pub fn active_handler(&self) -> Option<Arc<InspectionHandler>> {
        lock(&self.state)
            .active
            .as_ref()
            .map(|a| a.handler.clone())
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.active_handler().map(|h| h.session().clone())
    }

    /// Make `handler` the active one, or clear the active handler with `None`.
    ///
    /// The previous activation's subscriptions are released before the new
    /// ones are taken. With a view attached, the view immediately gets the
    /// handler's latest event and a fresh inspection is requested.
    pub fn set_active(&self, handler: Option<Arc<InspectionHandler>>) {
        let mut state = lock(&self.state);
        // Release the old subscriptions before taking new ones.
        state.active = None;

        let Some(handler) = handler else {
            debug!("[manager] No active session");
            return;
        };

        let disposal = watch_disposal(Arc::downgrade(&self.state), handler.clone());
        let forwarding = state.view.clone().map(|view| forward_events(&handler, view));
        let query = forwarding.is_some() && self.settings.query_on_attach;
        info!("[manager] Active session is now {}", handler.session());
        state.active = Some(Activation {
            handler: handler.clone(),
            _disposal: disposal,
            forwarding,
        });
        drop(state);

        if query {
            handler.perform_inspection();
        }
    }

    /// Attach the surface that renders the active session.
    pub fn attach_view(&self, view: Arc<dyn VariableView>) {
        let mut state = lock(&self.state);
        state.view = Some(view.clone());
        let Some(active) = state.active.as_mut() else {
            return;
        };
        active.forwarding = Some(forward_events(&active.handler, view));
        let handler = active.handler.clone();
        drop(state);

        if self.settings.query_on_attach {
            handler.perform_inspection();
        }
    }

    pub fn detach_view(&self) {
        let mut state = lock(&self.state);
        state.view = None;
        if let Some(active) = state.active.as_mut() {
            active.forwarding = None;
        }
    }

    /// Dispose every handler and clear the active one.
    pub fn shutdown(&self) {
        self.set_active(None);
        let handlers: Vec<_> = lock(&self.handlers).drain().map(|(_, h)| h).collect();
        for handler in handlers {
            handler.dispose();
        }
    }

    fn clear_if_active(&self, handler: &Arc<InspectionHandler>) {
        clear_if_active(&self.state, handler);
    }

    fn require_active(&self) -> Result<Arc<InspectionHandler>, InspectError> {
        self.active_handler().ok_or(InspectError::NoActiveHandler)
    }

    pub fn perform_inspection(&self) -> Result<(), InspectError> {
        self.require_active()?.perform_inspection();
        Ok(())
    }

    pub async fn inspect(&self) -> Result<UpdateEvent, InspectError> {
        self.require_active()?.inspect().await
    }

    pub async fn perform_preview(&self, expression: &str) -> Result<String, InspectError> {
        self.require_active()?.perform_preview(expression).await
    }

    /// Table preview of `name`; `max_rows` defaults to the configured cap.
    pub async fn perform_matrix_inspection(
        &self,
        name: &str,
        max_rows: Option<usize>,
    ) -> Result<MatrixModel, InspectError> {
        let max_rows = max_rows.unwrap_or(self.settings.max_matrix_rows);
        self.require_active()?
            .perform_matrix_inspection(name, max_rows)
            .await
    }

    pub async fn perform_widget_inspection(&self, name: &str) -> Result<RequestHandle, InspectError> {
        self.require_active()?.perform_widget_inspection(name).await
    }

    pub async fn perform_delete(&self, name: &str) -> Result<UpdateEvent, InspectError> {
        self.require_active()?.perform_delete(name).await
    }

    pub async fn perform_all_delete(&self) -> Result<UpdateEvent, InspectError> {
        self.require_active()?.perform_all_delete().await
    }
}

fn clear_if_active(state: &StdMutex<ActiveState>, handler: &Arc<InspectionHandler>) {
    let mut state = lock(state);
    let is_active = state
        .active
        .as_ref()
        .is_some_and(|a| Arc::ptr_eq(&a.handler, handler));
    if is_active {
        info!("[manager] Active handler for {} disposed", handler.session());
        let stale = state.active.take();
        drop(state);
        drop(stale);
    }
}

/// Clear the active slot once `handler` disposes.
fn watch_disposal(state: Weak<StdMutex<ActiveState>>, handler: Arc<InspectionHandler>) -> TaskGuard {
    let mut lifecycle = handler.watch_state();
    TaskGuard(tokio::spawn(async move {
        if lifecycle
            .wait_for(|s| *s == HandlerState::Disposed)
            .await
            .is_err()
        {
            return;
        }
        if let Some(state) = state.upgrade() {
            clear_if_active(&state, &handler);
        }
    }))
}

/// Render the handler's latest event, then every new one.
fn forward_events(handler: &InspectionHandler, view: Arc<dyn VariableView>) -> TaskGuard {
    let (latest, mut events) = handler.subscribe_from_latest();
    let session = handler.session().clone();
    TaskGuard(tokio::spawn(async move {
        if let Some(latest) = latest {
            view.render(&latest);
        }
        loop {
            match events.recv().await {
                Ok(event) => view.render(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("[manager] View fell behind {} by {} updates", session, skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{DummyKernel, RecordingView, Scripted};
    use crate::language::KernelLanguage;
    use std::time::Duration;

    const QUERY: &str = "_varinspect_dict_list()";
    const DATAFRAME_REPLY: &str = r#"'[{"varName":"df","varType":"DataFrame","varSize":"128","varShape":"3 rows x 2 cols","varContent":"a, b","isMatrix":true,"isWidget":false}]'"#;

    fn id(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    fn init_count(kernel: &DummyKernel) -> usize {
        kernel.requests().iter().filter(|r| r.silent).count()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_no_active_handler() {
        let manager = InspectorManager::default();
        assert!(manager.active_handler().is_none());
        assert!(matches!(manager.perform_inspection(), Err(InspectError::NoActiveHandler)));
        assert!(matches!(
            manager.perform_delete("x").await,
            Err(InspectError::NoActiveHandler)
        ));
    }

    #[tokio::test]
    async fn test_handler_for_reuses_instance() {
        let manager = InspectorManager::default();
        let kernel = DummyKernel::python();

        let first = manager.handler_for(id("a.ipynb"), kernel.clone()).await;
        first.ready().await.unwrap();
        let second = manager.handler_for(id("a.ipynb"), kernel.clone()).await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.sessions(), vec![id("a.ipynb")]);
        settle().await;
        assert_eq!(init_count(&kernel), 1);
    }

    #[tokio::test]
    async fn test_switching_sessions_reuses_handlers() {
        let manager = InspectorManager::default();
        let kernel_a = DummyKernel::python();
        let kernel_b = DummyKernel::python();
        let a = manager.handler_for(id("a.ipynb"), kernel_a.clone()).await;
        let b = manager.handler_for(id("b.ipynb"), kernel_b.clone()).await;

        manager.set_active(Some(a.clone()));
        manager.set_active(Some(b.clone()));
        let again = manager.handler_for(id("a.ipynb"), kernel_a.clone()).await;
        manager.set_active(Some(again.clone()));

        assert!(Arc::ptr_eq(&a, &again));
        assert!(Arc::ptr_eq(&manager.active_handler().unwrap(), &a));
        a.ready().await.unwrap();
        b.ready().await.unwrap();
        settle().await;
        assert_eq!(init_count(&kernel_a), 1);
        assert_eq!(init_count(&kernel_b), 1);
    }

    #[tokio::test]
    async fn test_set_active_with_view_requests_inspection() {
        let manager = InspectorManager::default();
        let kernel = DummyKernel::python();
        kernel.respond(QUERY, Scripted::Result(DATAFRAME_REPLY.into()));
        let view = RecordingView::new();
        manager.attach_view(view.clone());

        let handler = manager.handler_for(id("a.ipynb"), kernel.clone()).await;
        manager.set_active(Some(handler.clone()));

        assert!(Arc::ptr_eq(&manager.active_handler().unwrap(), &handler));
        assert!(view.wait_for(1).await);
        assert_eq!(view.events()[0].variables[0].name, "df");
        assert_eq!(kernel.executions_of(QUERY), 1);
    }

    #[tokio::test]
    async fn test_attached_view_renders_latest_once() {
        let manager = InspectorManager::new(InspectorSettings {
            query_on_attach: false,
            ..Default::default()
        });
        let kernel = DummyKernel::python();
        kernel.respond(QUERY, Scripted::Result(DATAFRAME_REPLY.into()));
        let handler = manager.handler_for(id("a.ipynb"), kernel.clone()).await;
        handler.inspect().await.unwrap();
        manager.set_active(Some(handler.clone()));

        let view = RecordingView::new();
        manager.attach_view(view.clone());
        assert!(view.wait_for(1).await);
        settle().await;
        assert_eq!(view.len(), 1);

        handler.inspect().await.unwrap();
        assert!(view.wait_for(2).await);
        settle().await;
        assert_eq!(view.len(), 2);
        assert_eq!(kernel.executions_of(QUERY), 2);
    }

    #[tokio::test]
    async fn test_set_active_without_view_does_not_query() {
        let manager = InspectorManager::default();
        let kernel = DummyKernel::python();
        let handler = manager.handler_for(id("a.ipynb"), kernel.clone()).await;
        manager.set_active(Some(handler.clone()));
        handler.ready().await.unwrap();
        settle().await;
        assert_eq!(kernel.executions_of(QUERY), 0);
    }

    #[tokio::test]
    async fn test_switch_stops_forwarding_previous_handler() {
        let manager = InspectorManager::default();
        let kernel_a = DummyKernel::python();
        let kernel_b = DummyKernel::new(KernelLanguage::Other("julia".into()));
        kernel_a.respond(QUERY, Scripted::Result(DATAFRAME_REPLY.into()));
        let view = RecordingView::new();
        manager.attach_view(view.clone());

        let a = manager.handler_for(id("a.ipynb"), kernel_a.clone()).await;
        let b = manager.handler_for(id("b.jl"), kernel_b).await;
        manager.set_active(Some(a.clone()));
        assert!(view.wait_for(1).await);

        manager.set_active(Some(b));
        assert!(view.wait_for(2).await);
        let rendered = view.len();

        a.inspect().await.unwrap();
        settle().await;
        assert_eq!(view.len(), rendered);
        assert!(view.events().last().unwrap().variables.is_empty());
    }

    #[tokio::test]
    async fn test_detach_view_stops_forwarding() {
        let manager = InspectorManager::default();
        let kernel = DummyKernel::python();
        kernel.respond(QUERY, Scripted::Result("'[]'".into()));
        let view = RecordingView::new();
        manager.attach_view(view.clone());
        let handler = manager.handler_for(id("a.ipynb"), kernel.clone()).await;
        manager.set_active(Some(handler.clone()));
        assert!(view.wait_for(1).await);

        manager.detach_view();
        handler.inspect().await.unwrap();
        settle().await;
        assert_eq!(view.len(), 1);
        assert!(manager.active_handler().is_some());
    }

    #[tokio::test]
    async fn test_disposed_active_handler_is_cleared() {
        let manager = InspectorManager::default();
        let kernel = DummyKernel::python();
        let handler = manager.handler_for(id("a.ipynb"), kernel).await;
        manager.set_active(Some(handler.clone()));

        handler.dispose();
        for _ in 0..100 {
            if manager.active_handler().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.active_handler().is_none());
        // Still registered until the session is removed.
        assert!(manager.has_handler(&id("a.ipynb")));
    }

    #[tokio::test]
    async fn test_remove_handler_disposes_and_clears() {
        let manager = InspectorManager::default();
        let handler = manager.handler_for(id("a.ipynb"), DummyKernel::python()).await;
        manager.set_active(Some(handler.clone()));

        assert!(manager.remove_handler(&id("a.ipynb")));
        assert!(!manager.remove_handler(&id("a.ipynb")));
        assert_eq!(handler.state(), HandlerState::Disposed);
        assert!(manager.active_handler().is_none());
        assert!(manager.get_handler(&id("a.ipynb")).is_none());
    }

    #[tokio::test]
    async fn test_add_handler_last_write_wins() {
        let manager = InspectorManager::default();
        let settings = InspectorSettings::default();
        let first = Arc::new(InspectionHandler::for_language(
            id("a.ipynb"),
            DummyKernel::python(),
            KernelLanguage::Python,
            settings.clone(),
        ));
        let second = Arc::new(InspectionHandler::for_language(
            id("a.ipynb"),
            DummyKernel::python(),
            KernelLanguage::Python,
            settings,
        ));

        assert!(manager.add_handler(first.clone()).is_none());
        assert!(manager.add_handler(first.clone()).is_none());
        let replaced = manager.add_handler(second.clone()).unwrap();

        assert!(Arc::ptr_eq(&replaced, &first));
        assert_eq!(first.state(), HandlerState::Disposed);
        assert!(Arc::ptr_eq(&manager.get_handler(&id("a.ipynb")).unwrap(), &second));
    }

    #[tokio::test]
    async fn test_matrix_uses_configured_row_cap() {
        let settings = InspectorSettings {
            max_matrix_rows: 3,
            ..Default::default()
        };
        let manager = InspectorManager::new(settings);
        let kernel = DummyKernel::python();
        let handler = manager.handler_for(id("a.ipynb"), kernel.clone()).await;
        manager.set_active(Some(handler));

        // No scripted reply: the request runs but yields nothing.
        assert!(matches!(
            manager.perform_matrix_inspection("df", None).await,
            Err(InspectError::NoResult)
        ));
        let last = kernel.requests().pop().unwrap();
        assert!(last.code.ends_with(", 3)"));
    }

    #[tokio::test]
    async fn test_shutdown_disposes_everything() {
        let manager = InspectorManager::default();
        let a = manager.handler_for(id("a.ipynb"), DummyKernel::python()).await;
        manager.set_active(Some(a.clone()));
        manager.shutdown();

        assert!(manager.sessions().is_empty());
        assert!(manager.active_handler().is_none());
        assert_eq!(a.state(), HandlerState::Disposed);
    }
}
