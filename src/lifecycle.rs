//! Server lifecycle control
//!
//! Owns the current session, applies the fault policy to transport events,
//! and decides when a user-visible notice is warranted. A session that dies
//! or exhausts its fault budget is never restarted automatically; only an
//! explicit start or restart brings a server back.

use std::fmt;
use tracing::{debug, info, warn};

use crate::config::ClientConfiguration;
use crate::lsp::TransportEvent;
use crate::recovery::{CloseVerdict, FaultTracker, FaultVerdict};
use crate::session::{SessionFactory, SessionHandle};

// ============================================================================
// Lifecycle State and Notices
// ============================================================================

/// Coarse controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No server session
    Idle,
    /// A session is active
    Running,
}

/// A one-shot user-visible notice about the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The fault budget was exhausted and the session was shut down
    FaultLimitReached { count: u32 },

    /// The server went away without being asked to stop
    ServerExited,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::FaultLimitReached { count } => write!(
                f,
                "The tndr language server reported {count} errors and was shut down. \
                 It will not be restarted automatically."
            ),
            Notice::ServerExited => write!(
                f,
                "The tndr language server stopped unexpectedly. \
                 It will not be restarted automatically."
            ),
        }
    }
}

// ============================================================================
// Lifecycle Controller
// ============================================================================

/// Supplies the configuration for each session start
///
/// Invoked on every start and restart so live settings are picked up; a
/// session never reuses the configuration snapshot of its predecessor.
pub type ConfigProvider = Box<dyn Fn() -> ClientConfiguration + Send>;

/// Drives sessions created by a factory through start/stop/restart
pub struct LifecycleController<F: SessionFactory> {
    /// Session factory
    factory: F,

    /// Builds a fresh configuration for every session this controller starts
    config_provider: ConfigProvider,

    /// The active session, if any
    session: Option<F::Session>,

    /// Event stream taken from the active session
    events: Option<tokio::sync::mpsc::UnboundedReceiver<TransportEvent>>,

    /// Fault budget for the active session
    faults: FaultTracker,
}

impl<F: SessionFactory> LifecycleController<F> {
    /// Create a controller that uses the same configuration for every start
    pub fn new(factory: F, config: ClientConfiguration) -> Self {
        Self::with_config_provider(factory, move || config.clone())
    }

    /// Create a controller that rebuilds its configuration on every start
    pub fn with_config_provider(
        factory: F,
        provider: impl Fn() -> ClientConfiguration + Send + 'static,
    ) -> Self {
        Self {
            factory,
            config_provider: Box::new(provider),
            session: None,
            events: None,
            faults: FaultTracker::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        if self.session.is_some() {
            LifecycleState::Running
        } else {
            LifecycleState::Idle
        }
    }

    /// Start a new session, stopping any active one first
    ///
    /// Every start gets a fresh fault budget and a freshly built
    /// configuration.
    pub async fn start(&mut self) -> Result<(), F::Error> {
        if self.session.is_some() {
            debug!("Stopping active session before starting a new one");
            self.stop().await;
        }

        self.faults = FaultTracker::new();

        let config = (self.config_provider)();
        let mut session = self.factory.create_session(config).await?;
        self.events = session.take_events();
        self.session = Some(session);

        info!("Server session started");
        Ok(())
    }

    /// Stop the active session, if any
    ///
    /// Returns whether a session was actually stopped. Calling stop while
    /// idle is a no-op.
    pub async fn stop(&mut self) -> bool {
        // Dropping the receiver first marks the stop as expected: any Closed
        // event the teardown produces has nowhere to go
        self.events = None;

        match self.session.take() {
            Some(session) => {
                if let Err(e) = session.close().await {
                    warn!("Session teardown reported an error: {e}");
                }
                info!("Server session stopped");
                true
            }
            None => false,
        }
    }

    /// Stop the active session and start a fresh one
    pub async fn restart(&mut self) -> Result<(), F::Error> {
        info!("Restarting server session");
        self.stop().await;
        self.start().await
    }

    /// Wait for the next transport event from the active session
    ///
    /// Pends forever while idle so callers can hold this in a select loop.
    pub async fn next_event(&mut self) -> TransportEvent {
        loop {
            match &mut self.events {
                Some(receiver) => match receiver.recv().await {
                    Some(event) => return event,
                    None => self.events = None,
                },
                None => std::future::pending::<()>().await,
            }
        }
    }

    /// Apply the fault policy to one transport event
    ///
    /// Returns a notice when the event warrants telling the user; faults
    /// under the budget and expected closures stay silent.
    pub async fn handle_transport_event(&mut self, event: TransportEvent) -> Option<Notice> {
        match event {
            TransportEvent::ReadError(detail) => match self.faults.record() {
                FaultVerdict::Continue => {
                    warn!(
                        "Transport read fault {} from server: {detail}",
                        self.faults.count()
                    );
                    None
                }
                FaultVerdict::Shutdown => {
                    let count = self.faults.count();
                    warn!("Fault budget exhausted after {count} read faults, stopping server");
                    self.stop().await;
                    Some(Notice::FaultLimitReached { count })
                }
            },
            TransportEvent::Closed => match self.classify_close() {
                CloseVerdict::ExpectedStop => {
                    debug!("Transport closed during an expected stop");
                    None
                }
                CloseVerdict::DoNotRestart => {
                    warn!("Server transport closed unexpectedly");
                    self.events = None;
                    if let Some(session) = self.session.take() {
                        if let Err(e) = session.close().await {
                            warn!("Cleanup of dead session reported an error: {e}");
                        }
                    }
                    Some(Notice::ServerExited)
                }
            },
        }
    }

    /// A closure with no active session was asked for; one with a session
    /// means the server went away on its own
    fn classify_close(&self) -> CloseVerdict {
        if self.session.is_some() {
            CloseVerdict::DoNotRestart
        } else {
            CloseVerdict::ExpectedStop
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::FAULT_THRESHOLD;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    struct MockSession {
        events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
        closed: Arc<AtomicUsize>,
        client: (),
    }

    #[async_trait]
    impl SessionHandle for MockSession {
        type Error = crate::session::SessionError;
        type Client = ();

        fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
            self.events.take()
        }

        fn is_running(&self) -> bool {
            true
        }

        fn client(&self) -> &Self::Client {
            &self.client
        }

        fn client_mut(&mut self) -> &mut Self::Client {
            &mut self.client
        }

        async fn close(self) -> Result<(), Self::Error> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockFactory {
        created: AtomicUsize,
        closed: Arc<AtomicUsize>,
        senders: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
        configs: Mutex<Vec<ClientConfiguration>>,
    }

    impl MockFactory {
        fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }

        fn closed(&self) -> usize {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SessionFactory for Arc<MockFactory> {
        type Session = MockSession;
        type Error = crate::session::SessionError;

        async fn create_session(
            &self,
            config: ClientConfiguration,
        ) -> Result<Self::Session, Self::Error> {
            self.created.fetch_add(1, Ordering::SeqCst);
            self.configs.lock().unwrap().push(config);
            let (sender, receiver) = mpsc::unbounded_channel();
            self.senders.lock().unwrap().push(sender);
            Ok(MockSession {
                events: Some(receiver),
                closed: Arc::clone(&self.closed),
                client: (),
            })
        }
    }

    fn controller(factory: &Arc<MockFactory>) -> LifecycleController<Arc<MockFactory>> {
        LifecycleController::new(Arc::clone(factory), ClientConfiguration::default())
    }

    #[tokio::test]
    async fn test_start_activates_session() {
        let factory = Arc::new(MockFactory::default());
        let mut controller = controller(&factory);

        assert_eq!(controller.state(), LifecycleState::Idle);
        controller.start().await.unwrap();
        assert_eq!(controller.state(), LifecycleState::Running);
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn test_faults_under_budget_stay_silent() {
        let factory = Arc::new(MockFactory::default());
        let mut controller = controller(&factory);
        controller.start().await.unwrap();

        for n in 0..FAULT_THRESHOLD - 1 {
            let notice = controller
                .handle_transport_event(TransportEvent::ReadError(format!("fault {n}")))
                .await;
            assert_eq!(notice, None);
        }

        assert_eq!(controller.state(), LifecycleState::Running);
        assert_eq!(factory.closed(), 0);
    }

    #[tokio::test]
    async fn test_fault_budget_exhaustion_stops_with_single_notice() {
        let factory = Arc::new(MockFactory::default());
        let mut controller = controller(&factory);
        controller.start().await.unwrap();

        let mut notices = Vec::new();
        for n in 0..FAULT_THRESHOLD {
            if let Some(notice) = controller
                .handle_transport_event(TransportEvent::ReadError(format!("fault {n}")))
                .await
            {
                notices.push(notice);
            }
        }

        assert_eq!(
            notices,
            vec![Notice::FaultLimitReached {
                count: FAULT_THRESHOLD
            }]
        );
        assert_eq!(controller.state(), LifecycleState::Idle);
        assert_eq!(factory.closed(), 1);
    }

    #[tokio::test]
    async fn test_restart_resets_fault_budget() {
        let factory = Arc::new(MockFactory::default());
        let mut controller = controller(&factory);
        controller.start().await.unwrap();

        for _ in 0..FAULT_THRESHOLD - 1 {
            controller
                .handle_transport_event(TransportEvent::ReadError("fault".to_string()))
                .await;
        }

        controller.restart().await.unwrap();

        // A fresh budget tolerates the same number of faults again
        for _ in 0..FAULT_THRESHOLD - 1 {
            let notice = controller
                .handle_transport_event(TransportEvent::ReadError("fault".to_string()))
                .await;
            assert_eq!(notice, None);
        }
        assert_eq!(controller.state(), LifecycleState::Running);
    }

    #[tokio::test]
    async fn test_restart_uses_fresh_configuration() {
        let factory = Arc::new(MockFactory::default());
        let generation = Arc::new(AtomicUsize::new(0));

        let provider_generation = Arc::clone(&generation);
        let mut controller =
            LifecycleController::with_config_provider(Arc::clone(&factory), move || {
                let n = provider_generation.fetch_add(1, Ordering::SeqCst);
                ClientConfiguration::builder()
                    .root_uri(format!("file:///workspace-{n}"))
                    .build()
                    .unwrap()
            });

        controller.start().await.unwrap();
        controller.restart().await.unwrap();

        let configs = factory.configs.lock().unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].root_uri.as_deref(), Some("file:///workspace-0"));
        assert_eq!(configs[1].root_uri.as_deref(), Some("file:///workspace-1"));
    }

    #[tokio::test]
    async fn test_start_while_running_stops_old_session_first() {
        let factory = Arc::new(MockFactory::default());
        let mut controller = controller(&factory);

        controller.start().await.unwrap();
        controller.start().await.unwrap();

        assert_eq!(factory.created(), 2);
        assert_eq!(factory.closed(), 1);
        assert_eq!(controller.state(), LifecycleState::Running);
    }

    #[tokio::test]
    async fn test_unexpected_closure_notifies_and_goes_idle() {
        let factory = Arc::new(MockFactory::default());
        let mut controller = controller(&factory);
        controller.start().await.unwrap();

        let notice = controller
            .handle_transport_event(TransportEvent::Closed)
            .await;

        assert_eq!(notice, Some(Notice::ServerExited));
        assert_eq!(controller.state(), LifecycleState::Idle);
        assert_eq!(factory.closed(), 1);
    }

    #[tokio::test]
    async fn test_closure_after_stop_stays_silent() {
        let factory = Arc::new(MockFactory::default());
        let mut controller = controller(&factory);
        controller.start().await.unwrap();

        assert!(controller.stop().await);

        let notice = controller
            .handle_transport_event(TransportEvent::Closed)
            .await;
        assert_eq!(notice, None);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let factory = Arc::new(MockFactory::default());
        let mut controller = controller(&factory);
        controller.start().await.unwrap();

        assert!(controller.stop().await);
        assert!(!controller.stop().await);
        assert_eq!(factory.closed(), 1);
    }

    #[tokio::test]
    async fn test_next_event_delivers_injected_events() {
        let factory = Arc::new(MockFactory::default());
        let mut controller = controller(&factory);
        controller.start().await.unwrap();

        let sender = factory.senders.lock().unwrap()[0].clone();
        sender
            .send(TransportEvent::ReadError("injected".to_string()))
            .unwrap();

        let event = controller.next_event().await;
        assert_eq!(event, TransportEvent::ReadError("injected".to_string()));
    }
}
