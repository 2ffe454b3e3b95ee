//! Pipeline core
//!
//! A fixed worker pool drains the priority queue. Every request walks
//! the same stages: admission checks, session-FIFO turn, intent
//! classification, context attachment, clarify short-circuit, capability
//! routing, invocation with bounded retries, history persistence, and
//! result delivery. Cancellation and the absolute deadline are checked
//! at every stage boundary and before every blocking call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use orchestrator_config::PipelineConfig;
use orchestrator_context::{ContextError, ContextManager};
use orchestrator_core::{
    CallContext, CommandInvoker, CommandRequest, CommandResult, CommandSubmission, ErrorKind,
    HistoryEntry, Intent, InvocationOutcome, InvokeError, RequestId, ResultSink, ServiceCall,
    ServiceSelector, SessionRecord,
};
use orchestrator_nlp::IntentClassifier;

use crate::gate::{SessionGate, SessionTicket};
use crate::queue::{CommandQueue, QueuedCommand, SubmitOutcome};
use crate::{retry, PipelineError};

/// Clarify response for commands below the confidence threshold.
const CLARIFY_RESPONSE: &str =
    "Sorry, I didn't understand that command. Could you rephrase it?";

/// What the terminal result should leave in session history.
struct HistoryPlan {
    session_id: String,
    entry: HistoryEntry,
}

struct Dispatched {
    result: CommandResult,
    history: Option<HistoryPlan>,
}

impl Dispatched {
    fn bare(result: CommandResult) -> Self {
        Self {
            result,
            history: None,
        }
    }
}

pub struct CommandPipeline {
    config: PipelineConfig,
    classifier: Arc<IntentClassifier>,
    context: Arc<ContextManager>,
    selector: Arc<dyn ServiceSelector>,
    invoker: Arc<dyn CommandInvoker>,
    sink: Arc<dyn ResultSink>,
    queue: CommandQueue,
    gate: SessionGate,
    accepting: AtomicBool,
    /// Stops workers' queue waits
    worker_shutdown: CancellationToken,
    /// Parent of every request token; fired when the drain grace expires
    cancel_all: CancellationToken,
    /// Requests currently being processed by a worker
    active: AtomicUsize,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    tokens: Mutex<HashMap<RequestId, CancellationToken>>,
}

impl CommandPipeline {
    pub fn new(
        config: PipelineConfig,
        classifier: Arc<IntentClassifier>,
        context: Arc<ContextManager>,
        selector: Arc<dyn ServiceSelector>,
        invoker: Arc<dyn CommandInvoker>,
        sink: Arc<dyn ResultSink>,
    ) -> Arc<Self> {
        let queue = CommandQueue::new(config.queue_capacity);
        Arc::new(Self {
            config,
            classifier,
            context,
            selector,
            invoker,
            sink,
            queue,
            gate: SessionGate::new(),
            accepting: AtomicBool::new(true),
            worker_shutdown: CancellationToken::new(),
            cancel_all: CancellationToken::new(),
            active: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn the worker pool.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        for worker in 0..self.config.worker_count {
            let pipeline = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                pipeline.worker_loop(worker).await;
            }));
        }
        tracing::info!(workers = self.config.worker_count, "command pipeline started");
    }

    /// Admit a submission. The request id is returned immediately; the
    /// terminal `CommandResult` (including overload rejections) is
    /// always delivered through the result sink, exactly once.
    pub async fn submit(&self, submission: CommandSubmission) -> Result<RequestId, PipelineError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(PipelineError::ShuttingDown);
        }

        let mut request = CommandRequest::admit(submission, self.config.default_deadline());
        request.cancel = self.cancel_all.child_token();
        let id = request.id.clone();
        self.tokens.lock().insert(id.clone(), request.cancel.clone());

        let ticket = request.session_key().map(|key| self.gate.enroll(&key));
        tracing::debug!(
            request_id = %id,
            interface = %request.interface,
            priority = %request.priority,
            "command admitted"
        );

        match self.queue.push(QueuedCommand { request, ticket }) {
            SubmitOutcome::Enqueued => {}
            SubmitOutcome::Displaced(victim) => {
                tracing::debug!(
                    victim = %victim.request.id,
                    "low-priority command displaced on full queue"
                );
                self.complete_unstarted(victim, ErrorKind::RejectedOverload, "queue overloaded")
                    .await;
            }
            SubmitOutcome::Rejected(own) => {
                self.complete_unstarted(own, ErrorKind::RejectedOverload, "queue overloaded")
                    .await;
            }
        }
        Ok(id)
    }

    /// Cooperatively cancel an in-flight request.
    pub fn cancel(&self, id: &RequestId) -> bool {
        match self.tokens.lock().get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop accepting, drain within the grace window, cancel the rest,
    /// and join the workers.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        tracing::info!("pipeline draining");

        let drained = tokio::time::timeout(self.config.drain_grace(), async {
            while !self.queue.is_empty() || self.active.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .is_ok();

        if !drained {
            tracing::warn!("drain grace expired, cancelling remaining requests");
            self.cancel_all.cancel();
        }

        self.worker_shutdown.cancel();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        // Anything a worker never picked up completes as cancelled
        for command in self.queue.drain() {
            self.complete_unstarted(command, ErrorKind::Cancelled, "shutdown").await;
        }
        tracing::info!("pipeline stopped");
    }

    /// Finish a request that never reached dispatch.
    async fn complete_unstarted(&self, command: QueuedCommand, kind: ErrorKind, message: &str) {
        if let Some(ticket) = &command.ticket {
            self.gate.finish(ticket);
        }
        self.tokens.lock().remove(&command.request.id);
        self.sink
            .deliver(CommandResult::error(&command.request, kind, message))
            .await;
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        tracing::debug!(worker, "pipeline worker started");
        while let Some(command) = self.queue.dequeue(&self.worker_shutdown).await {
            self.active.fetch_add(1, Ordering::SeqCst);
            self.process(command).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
        tracing::debug!(worker, "pipeline worker stopped");
    }

    async fn process(&self, command: QueuedCommand) {
        let QueuedCommand { request, ticket } = command;
        let dispatched = self.dispatch(&request, ticket.as_ref()).await;

        if let Some(plan) = dispatched.history {
            if let Err(e) = self
                .context
                .add_command_to_history(&plan.session_id, plan.entry)
                .await
            {
                tracing::warn!(
                    session_id = %plan.session_id,
                    error = %e,
                    "failed to persist command history"
                );
            }
        }

        if let Some(ticket) = &ticket {
            self.gate.finish(ticket);
        }
        self.tokens.lock().remove(&request.id);

        tracing::info!(
            request_id = %request.id,
            success = dispatched.result.success,
            error = ?dispatched.result.error,
            latency_ms = dispatched.result.latency_ms,
            "command finished"
        );
        self.sink.deliver(dispatched.result).await;
    }

    async fn dispatch(&self, request: &CommandRequest, ticket: Option<&SessionTicket>) -> Dispatched {
        // Stage boundary: admission
        if request.cancel.is_cancelled() {
            return Dispatched::bare(CommandResult::error(
                request,
                ErrorKind::Cancelled,
                "request cancelled",
            ));
        }
        if request.is_expired() {
            return Dispatched::bare(CommandResult::error(
                request,
                ErrorKind::TimedOut,
                "deadline expired before dispatch",
            ));
        }

        // Per-session FIFO: wait for this request's turn
        if let Some(ticket) = ticket {
            self.gate
                .wait_turn(ticket, request.deadline, &request.cancel)
                .await;
            if request.cancel.is_cancelled() {
                return Dispatched::bare(CommandResult::error(
                    request,
                    ErrorKind::Cancelled,
                    "request cancelled",
                ));
            }
            if request.is_expired() {
                return Dispatched::bare(CommandResult::error(
                    request,
                    ErrorKind::TimedOut,
                    "deadline expired waiting for session turn",
                ));
            }
        }

        // Classify
        let mut intent = self.classifier.parse(&request.text);

        // Attach session context; an invalid session id is not fatal
        let session = self.attach_context(request, &mut intent).await;
        let started = session.is_some();

        if request.cancel.is_cancelled() {
            return self.terminal_cancelled(request, &session, started);
        }
        if request.is_expired() {
            return self.terminal_error(
                request,
                &session,
                ErrorKind::TimedOut,
                "deadline expired after context attach",
            );
        }

        // Clarify short-circuit: forgiving UX for low confidence
        if !intent.is_dispatchable() {
            let result = CommandResult::ok(request, CLARIFY_RESPONSE);
            let history = session.as_ref().map(|record| HistoryPlan {
                session_id: record.id.clone(),
                entry: HistoryEntry::completed(&request.text, CLARIFY_RESPONSE),
            });
            return Dispatched { result, history };
        }

        // Remember the classified intent for contextual inference
        if let Some(record) = &session {
            if let Err(e) = self
                .context
                .update_last_intent(&record.id, intent.name, intent.parameters.clone())
                .await
            {
                tracing::warn!(session_id = %record.id, error = %e, "failed to record last intent");
            }
        }

        let Some(capability) = intent.name.capability() else {
            return self.terminal_error(
                request,
                &session,
                ErrorKind::CapabilityUnknown,
                format!("no capability mapping for intent {}", intent.name),
            );
        };

        self.route_and_invoke(request, &session, &intent, capability, started)
            .await
    }

    /// Stages 5-7: selection, invocation, bounded retry on a fresh
    /// selection for transport-class failures.
    async fn route_and_invoke(
        &self,
        request: &CommandRequest,
        session: &Option<SessionRecord>,
        intent: &Intent,
        capability: &str,
        started: bool,
    ) -> Dispatched {
        let call = ServiceCall {
            intent: intent.name,
            parameters: intent.parameters.clone(),
            context: CallContext {
                user_id: request
                    .user_id
                    .clone()
                    .or_else(|| session.as_ref().map(|s| s.user_id.clone())),
                session_id: request.session_id.clone(),
                locale: None,
            },
        };

        let max_retries = self.config.retry.max_attempts;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            if request.cancel.is_cancelled() {
                return self.terminal_cancelled(request, session, started);
            }
            if request.is_expired() {
                return self.terminal_error(
                    request,
                    session,
                    ErrorKind::TimedOut,
                    "deadline expired",
                );
            }

            // Fresh selection every attempt; the same instance may win
            // again if it is the only candidate
            let Some(service) = self.selector.acquire(capability) else {
                return self.terminal_error(
                    request,
                    session,
                    ErrorKind::NoService,
                    format!("no service available for capability {capability}"),
                );
            };

            let attempt_deadline =
                request.deadline.min(Instant::now() + self.config.per_attempt_cap());
            let attempt_start = Instant::now();
            let outcome = self
                .invoker
                .invoke(&service, &call, attempt_deadline, &request.cancel)
                .await;
            let latency = attempt_start.elapsed();

            match outcome {
                Ok(reply) if reply.success => {
                    self.selector
                        .release(&service.name, InvocationOutcome::Success, latency);
                    if let Some(record) = session {
                        if let Err(e) = self
                            .context
                            .update_last_service(&record.id, &service.name)
                            .await
                        {
                            tracing::warn!(session_id = %record.id, error = %e, "failed to record last service");
                        }
                    }
                    let response = reply.response.unwrap_or_default();
                    let history = session.as_ref().map(|record| HistoryPlan {
                        session_id: record.id.clone(),
                        entry: HistoryEntry::completed(&request.text, &response),
                    });
                    return Dispatched {
                        result: CommandResult::ok(request, response),
                        history,
                    };
                }
                Ok(reply) => {
                    self.selector
                        .release(&service.name, InvocationOutcome::SoftFailure, latency);
                    let message = reply
                        .error
                        .unwrap_or_else(|| "service reported an error".to_string());
                    return self.terminal_error(request, session, ErrorKind::ServiceError, message);
                }
                Err(InvokeError::Service(message)) => {
                    self.selector
                        .release(&service.name, InvocationOutcome::SoftFailure, latency);
                    return self.terminal_error(request, session, ErrorKind::ServiceError, message);
                }
                Err(InvokeError::Cancelled) => {
                    self.selector
                        .release(&service.name, InvocationOutcome::Abandoned, latency);
                    return self.terminal_cancelled(request, session, started);
                }
                Err(InvokeError::NoService) => {
                    self.selector
                        .release(&service.name, InvocationOutcome::Abandoned, latency);
                    return self.terminal_error(
                        request,
                        session,
                        ErrorKind::NoService,
                        "service became unavailable",
                    );
                }
                Err(error @ (InvokeError::Timeout | InvokeError::Transport(_))) => {
                    self.selector
                        .release(&service.name, InvocationOutcome::HardFailure, latency);
                    let kind = match &error {
                        InvokeError::Timeout => ErrorKind::TimedOut,
                        _ => ErrorKind::TransportError,
                    };
                    if request.is_expired() {
                        return self.terminal_error(
                            request,
                            session,
                            ErrorKind::TimedOut,
                            "deadline expired during invocation",
                        );
                    }
                    if attempt > max_retries {
                        return self.terminal_error(request, session, kind, error.to_string());
                    }

                    let delay = retry::backoff_delay(&self.config.retry, attempt);
                    let wake = Instant::now() + delay;
                    tracing::debug!(
                        request_id = %request.id,
                        service = %service.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "invocation failed, backing off before fresh selection"
                    );
                    if wake >= request.deadline {
                        tokio::select! {
                            _ = tokio::time::sleep_until(request.deadline) => {}
                            _ = request.cancel.cancelled() => {
                                return self.terminal_cancelled(request, session, started);
                            }
                        }
                        return self.terminal_error(
                            request,
                            session,
                            ErrorKind::TimedOut,
                            "deadline expired during retry backoff",
                        );
                    }
                    tokio::select! {
                        _ = tokio::time::sleep_until(wake) => {}
                        _ = request.cancel.cancelled() => {
                            return self.terminal_cancelled(request, session, started);
                        }
                    }
                }
            }
        }
    }

    /// Load the session, merge `last_parameters` into unset slots when
    /// the intent repeats, and hand back the record.
    async fn attach_context(
        &self,
        request: &CommandRequest,
        intent: &mut Intent,
    ) -> Option<SessionRecord> {
        let session_id = request.session_id.as_ref()?;
        match self.context.get_session_context(session_id).await {
            Ok(record) => {
                if record.last_intent == Some(intent.name) {
                    for (key, value) in &record.last_parameters {
                        intent
                            .parameters
                            .entry(key.clone())
                            .or_insert_with(|| value.clone());
                    }
                }
                Some(record)
            }
            Err(ContextError::NotFound(_)) => {
                tracing::debug!(
                    request_id = %request.id,
                    session_id = %session_id,
                    "unknown session id, dispatching without session context"
                );
                None
            }
            Err(e) => {
                tracing::warn!(
                    request_id = %request.id,
                    session_id = %session_id,
                    error = %e,
                    "session load failed, dispatching without session context"
                );
                None
            }
        }
    }

    fn terminal_error(
        &self,
        request: &CommandRequest,
        session: &Option<SessionRecord>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Dispatched {
        let message = message.into();
        let history = session.as_ref().map(|record| HistoryPlan {
            session_id: record.id.clone(),
            entry: HistoryEntry::failed(&request.text, format!("{kind}: {message}")),
        });
        Dispatched {
            result: CommandResult::error(request, kind, message),
            history,
        }
    }

    /// Cancelled requests leave no history unless the session already
    /// observed the dispatch start, in which case a single cancellation
    /// marker is recorded.
    fn terminal_cancelled(
        &self,
        request: &CommandRequest,
        session: &Option<SessionRecord>,
        started: bool,
    ) -> Dispatched {
        let history = if started {
            session.as_ref().map(|record| HistoryPlan {
                session_id: record.id.clone(),
                entry: HistoryEntry::cancelled(&request.text),
            })
        } else {
            None
        };
        Dispatched {
            result: CommandResult::error(request, ErrorKind::Cancelled, "request cancelled"),
            history,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::mpsc;

    use orchestrator_config::{RegistryConfig, RetryConfig, SessionConfig};
    use orchestrator_core::{
        HistoryStatus, InterfaceTag, Priority, ServiceDescriptor, ServiceReply, TransportKind,
    };
    use orchestrator_invoker::{InprocRouter, ServiceInvoker};
    use orchestrator_persistence::MemoryStore;
    use orchestrator_registry::ServiceRegistry;

    struct TestSink {
        tx: mpsc::UnboundedSender<CommandResult>,
    }

    #[async_trait::async_trait]
    impl ResultSink for TestSink {
        async fn deliver(&self, result: CommandResult) {
            let _ = self.tx.send(result);
        }
    }

    struct Harness {
        pipeline: Arc<CommandPipeline>,
        context: Arc<ContextManager>,
        registry: Arc<ServiceRegistry>,
        router: Arc<InprocRouter>,
        rx: mpsc::UnboundedReceiver<CommandResult>,
    }

    fn fast_retries() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            base_ms: 10,
            cap_ms: 50,
            jitter_pct: 0,
        }
    }

    fn harness(mut config: PipelineConfig) -> Harness {
        config.retry = fast_retries();
        let store = Arc::new(MemoryStore::new());
        let context = Arc::new(ContextManager::new(store, SessionConfig::default()));
        let registry = Arc::new(ServiceRegistry::new(RegistryConfig::default()));
        let router = Arc::new(InprocRouter::new());
        let invoker = Arc::new(ServiceInvoker::new(router.clone(), None));
        let (tx, rx) = mpsc::unbounded_channel();

        let pipeline = CommandPipeline::new(
            config,
            Arc::new(IntentClassifier::new()),
            context.clone(),
            registry.clone(),
            invoker,
            Arc::new(TestSink { tx }),
        );
        pipeline.start();

        Harness {
            pipeline,
            context,
            registry,
            router,
            rx,
        }
    }

    impl Harness {
        fn register_service(&self, name: &str, capability: &str, max_concurrency: u32) {
            self.registry
                .register_service(
                    ServiceDescriptor::new(name, "localhost", 0, TransportKind::Inproc)
                        .with_capability(capability)
                        .with_max_concurrency(max_concurrency),
                )
                .unwrap();
            self.registry.mark_healthy(name);
        }

        async fn next_result(&mut self) -> CommandResult {
            tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
                .await
                .expect("result within 5s")
                .expect("sink channel open")
        }
    }

    fn submission(text: &str) -> CommandSubmission {
        CommandSubmission {
            text: text.to_string(),
            interface: InterfaceTag::Text,
            user_id: Some("u1".to_string()),
            session_id: None,
            priority: Priority::Normal,
            deadline_ms: None,
        }
    }

    fn ok_reply(text: impl Into<String>) -> ServiceReply {
        ServiceReply {
            success: true,
            response: Some(text.into()),
            error: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_play_music_routes_to_music_capability() {
        let mut h = harness(PipelineConfig::default());
        h.register_service("music-player", "music", 4);
        h.router.register_fn("music-player", |call| async move {
            let genre = call
                .parameters
                .get("genre")
                .and_then(|v| v.as_text())
                .unwrap_or("something")
                .to_string();
            ok_reply(format!("now playing {genre}"))
        });

        let id = h.pipeline.submit(submission("play jazz music")).await.unwrap();
        let result = h.next_result().await;
        assert_eq!(result.request_id, id);
        assert!(result.success);
        assert_eq!(result.response, "now playing jazz");
        assert!(result.error.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_registered_service_fails_fast() {
        let mut h = harness(PipelineConfig::default());
        let _ = h.pipeline.submit(submission("set volume to 75")).await.unwrap();
        let result = h.next_result().await;
        assert!(!result.success);
        assert_eq!(result.error, Some(ErrorKind::NoService));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_per_session_fifo_and_concurrency_cap() {
        let mut h = harness(PipelineConfig::default());
        let order = Arc::new(Mutex::new(Vec::<String>::new()));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        h.register_service("audio-svc", "audio", 1);
        {
            let order = order.clone();
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            h.router.register_fn("audio-svc", move |call| {
                let order = order.clone();
                let concurrent = concurrent.clone();
                let peak = peak.clone();
                async move {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    if let Some(level) = call.parameters.get("level").and_then(|v| v.as_text()) {
                        order.lock().push(level.to_string());
                    }
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    ok_reply("volume set")
                }
            });
        }

        let session = h
            .context
            .create_session("u1", InterfaceTag::Text)
            .await
            .unwrap();
        for text in ["set volume to 10", "set volume to 20"] {
            let mut sub = submission(text);
            sub.session_id = Some(session.id.clone());
            h.pipeline.submit(sub).await.unwrap();
        }

        let first = h.next_result().await;
        let second = h.next_result().await;
        assert!(first.success && second.success);

        assert_eq!(*order.lock(), vec!["10".to_string(), "20".to_string()]);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(h.registry.in_flight("audio-svc"), Some(0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_transport_failures_degrade_service_to_no_service() {
        let mut h = harness(PipelineConfig::default());
        // Registered but no in-process handler: every attempt is a
        // transport error
        h.register_service("ghost", "audio", 4);

        let _ = h.pipeline.submit(submission("set volume to 75")).await.unwrap();
        let result = h.next_result().await;
        assert!(!result.success);
        assert_eq!(result.error, Some(ErrorKind::TransportError));

        // Three hard failures drove it healthy -> degraded -> unhealthy
        let _ = h.pipeline.submit(submission("set volume to 75")).await.unwrap();
        let result = h.next_result().await;
        assert_eq!(result.error, Some(ErrorKind::NoService));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_deadline_expiry_records_failure_history() {
        let mut h = harness(PipelineConfig::default());
        h.register_service("sleeper", "audio", 4);
        h.router.register_fn("sleeper", |_call| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            ok_reply("too late")
        });

        let session = h
            .context
            .create_session("u1", InterfaceTag::Text)
            .await
            .unwrap();
        let mut sub = submission("set volume to 75");
        sub.session_id = Some(session.id.clone());
        sub.deadline_ms = Some(50);
        h.pipeline.submit(sub).await.unwrap();

        let result = h.next_result().await;
        assert!(!result.success);
        assert_eq!(result.error, Some(ErrorKind::TimedOut));

        let history = h.context.get_recent_commands(&session.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, HistoryStatus::Failed);
        assert_eq!(h.registry.in_flight("sleeper"), Some(0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_low_confidence_clarifies_without_routing() {
        let mut h = harness(PipelineConfig::default());
        let session = h
            .context
            .create_session("u1", InterfaceTag::Voice)
            .await
            .unwrap();
        let mut sub = submission("colorless green ideas dream furiously");
        sub.session_id = Some(session.id.clone());
        h.pipeline.submit(sub).await.unwrap();

        let result = h.next_result().await;
        assert!(result.success);
        assert_eq!(result.response, CLARIFY_RESPONSE);
        assert!(result.error.is_none());

        let history = h.context.get_recent_commands(&session.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, HistoryStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_contextual_inference_fills_missing_slots() {
        let mut h = harness(PipelineConfig::default());
        let genres = Arc::new(Mutex::new(Vec::<Option<String>>::new()));
        h.register_service("music-player", "music", 4);
        {
            let genres = genres.clone();
            h.router.register_fn("music-player", move |call| {
                let genres = genres.clone();
                async move {
                    genres.lock().push(
                        call.parameters
                            .get("genre")
                            .and_then(|v| v.as_text())
                            .map(str::to_string),
                    );
                    ok_reply("playing")
                }
            });
        }

        let session = h
            .context
            .create_session("u1", InterfaceTag::Voice)
            .await
            .unwrap();

        let mut first = submission("play some jazz music");
        first.session_id = Some(session.id.clone());
        h.pipeline.submit(first).await.unwrap();
        h.next_result().await;

        // Same intent, no genre slot: inherited from last_parameters
        let mut second = submission("play it once more");
        second.session_id = Some(session.id.clone());
        h.pipeline.submit(second).await.unwrap();
        h.next_result().await;

        let seen = genres.lock().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].as_deref(), Some("jazz"));
        assert_eq!(seen[1].as_deref(), Some("jazz"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_critical_displaces_oldest_low_when_full() {
        let config = PipelineConfig {
            queue_capacity: 2,
            worker_count: 1,
            ..PipelineConfig::default()
        };
        let mut h = harness(config);
        h.register_service("audio-svc", "audio", 4);
        h.router.register_fn("audio-svc", |_call| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            ok_reply("done")
        });

        // Anonymous submissions run without a session gate, so ordering
        // here is purely the queue's
        let anon = |text: &str| {
            let mut sub = submission(text);
            sub.user_id = None;
            sub
        };

        // Occupy the single worker
        h.pipeline.submit(anon("set volume to 1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Fill the queue with low-priority work
        let mut low_ids = Vec::new();
        for text in ["set volume to 2", "set volume to 3"] {
            let mut sub = anon(text);
            sub.priority = Priority::Low;
            low_ids.push(h.pipeline.submit(sub).await.unwrap());
        }

        let mut critical = anon("set volume to 9");
        critical.priority = Priority::Critical;
        h.pipeline.submit(critical).await.unwrap();

        // The displaced oldest low arrives as rejected-overload
        let mut rejected = Vec::new();
        let mut completed = 0;
        for _ in 0..4 {
            let result = h.next_result().await;
            if result.error == Some(ErrorKind::RejectedOverload) {
                rejected.push(result.request_id);
            } else {
                completed += 1;
            }
        }
        assert_eq!(rejected, vec![low_ids[0].clone()]);
        assert_eq!(completed, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancellation_mid_invocation() {
        let mut h = harness(PipelineConfig::default());
        h.register_service("sleeper", "audio", 4);
        h.router.register_fn("sleeper", |_call| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            ok_reply("unreachable")
        });

        let session = h
            .context
            .create_session("u1", InterfaceTag::Web)
            .await
            .unwrap();
        let mut sub = submission("set volume to 75");
        sub.session_id = Some(session.id.clone());
        let id = h.pipeline.submit(sub).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(h.pipeline.cancel(&id));

        let result = h.next_result().await;
        assert_eq!(result.error, Some(ErrorKind::Cancelled));

        // Dispatch had started, so a single cancellation marker remains
        let history = h.context.get_recent_commands(&session.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, HistoryStatus::Cancelled);
        assert_eq!(h.registry.in_flight("sleeper"), Some(0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_drains_then_rejects() {
        let mut h = harness(PipelineConfig::default());
        h.register_service("audio-svc", "audio", 4);
        h.router.register_fn("audio-svc", |_call| async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            ok_reply("done")
        });

        h.pipeline.submit(submission("set volume to 5")).await.unwrap();
        h.pipeline.shutdown().await;

        // The in-flight command drained to completion
        let result = h.next_result().await;
        assert!(result.success);

        let err = h.pipeline.submit(submission("set volume to 6")).await.unwrap_err();
        assert!(matches!(err, PipelineError::ShuttingDown));
    }
}
