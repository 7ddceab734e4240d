//! Session orchestrator
//!
//! One loop per session. It drains the message queue a batch at a time,
//! restarts the agent session when the requested mode changes, runs exactly
//! one turn at a time and reports readiness when the session goes idle.
//!
//! `abort` cancels only the in-flight turn. `kill` aborts and releases
//! everything in order: pending permissions, the agent process, the keepalive
//! and finally the relay-side session record, which is archived and closed.

use super::control::TurnControl;
use super::queue::{MessageQueue, QueuedMessage};
use super::record::Session;
use super::remote::SessionChannel;
use super::resume::{ResumeLocator, ResumeRecord};
use crate::agent::{AgentBackend, NativeEvent, StartConfig};
use crate::error::Result;
use crate::permission::PermissionMediator;
use crate::translator::{EventTranslator, SessionEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const STATUS_ABORTED: &str = "aborted by user";
pub const STATUS_FAULT: &str = "Agent process unexpectedly exited";

/// Loop-local state
#[derive(Debug, Default)]
struct LoopState {
    /// An agent session exists for `active_mode_hash`
    was_created: bool,
    active_mode_hash: Option<String>,
    /// Batch re-queued by a mode restart; runs before the queue
    pending: Option<QueuedMessage>,
    /// Transcript hint for the next `start_session`
    resume_candidate: Option<ResumeRecord>,
}

enum TurnOutcome {
    Completed,
    Aborted,
    Faulted,
}

pub struct Orchestrator {
    session: Arc<Session>,
    backend: Arc<dyn AgentBackend>,
    channel: Arc<dyn SessionChannel>,
    mediator: Arc<PermissionMediator>,
    turn: Arc<TurnControl>,
    queue: MessageQueue,
    resume: ResumeLocator,
    thinking: Arc<AtomicBool>,
    keepalive_interval: Duration,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    keepalive_stop: CancellationToken,
    /// Stops the loop
    shutdown: CancellationToken,
    terminating: AtomicBool,
    kill_started: AtomicBool,
    /// Cancelled once kill has completed
    killed: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        session: Arc<Session>,
        backend: Arc<dyn AgentBackend>,
        channel: Arc<dyn SessionChannel>,
        mediator: Arc<PermissionMediator>,
        turn: Arc<TurnControl>,
        resume: ResumeLocator,
        keepalive_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            backend,
            channel,
            mediator,
            turn,
            queue: MessageQueue::new(),
            resume,
            thinking: Arc::new(AtomicBool::new(false)),
            keepalive_interval,
            keepalive: Mutex::new(None),
            keepalive_stop: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            terminating: AtomicBool::new(false),
            kill_started: AtomicBool::new(false),
            killed: CancellationToken::new(),
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    pub fn is_thinking(&self) -> bool {
        self.thinking.load(Ordering::SeqCst)
    }

    /// Queue a user message; returns false once the session is terminating
    pub fn enqueue(&self, message: QueuedMessage) -> bool {
        if self.is_terminating() {
            tracing::warn!(session_id = %self.session.id, "Dropping message for terminating session");
            return false;
        }
        tracing::debug!(
            session_id = %self.session.id,
            mode = %message.mode.permission_level,
            "Message queued"
        );
        self.queue.push(message)
    }

    /// Cancel the in-flight turn. A no-op while idle.
    pub fn abort(&self) -> bool {
        let aborted = self.turn.abort();
        if aborted {
            tracing::info!(session_id = %self.session.id, "Abort requested");
        }
        aborted
    }

    /// Resolves once [`kill`](Self::kill) has completed
    pub async fn wait_killed(&self) {
        self.killed.cancelled().await;
    }

    /// Run the session loop until killed
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<NativeEvent>) {
        self.start_keepalive().await;
        let mut translator = EventTranslator::new(self.thinking.clone());
        let mut state = LoopState::default();
        tracing::info!(session_id = %self.session.id, "Session loop started");

        loop {
            if self.is_terminating() {
                break;
            }

            let batch = match state.pending.take() {
                Some(batch) => batch,
                None => {
                    let token = self.turn.current();
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => break,
                        _ = token.cancelled() => {
                            // Abort while idle: nothing to cancel.
                            self.turn.renew();
                            continue;
                        }
                        batch = self.queue.next_batch() => match batch {
                            Some(batch) => batch,
                            None => break,
                        },
                    }
                }
            };

            let mode_hash = batch.mode.hash();
            if state.was_created && state.active_mode_hash.as_deref() != Some(mode_hash.as_str()) {
                self.restart_for_mode(&mut state, batch).await;
                continue;
            }

            let ran = self
                .run_turn(&mut state, &mut translator, &mut events, batch, mode_hash)
                .await;
            self.turn.renew();

            if ran && state.pending.is_none() && self.queue.is_empty() && !self.is_terminating() {
                self.emit(&SessionEvent::Ready).await;
                self.channel.notify_ready();
            }
        }

        tracing::info!(session_id = %self.session.id, "Session loop stopped");
    }

    async fn restart_for_mode(&self, state: &mut LoopState, batch: QueuedMessage) {
        let previous = self.backend.session_id().await;
        tracing::info!(
            session_id = %self.session.id,
            previous = ?previous,
            mode = %batch.mode.permission_level,
            "Mode changed, restarting agent session"
        );

        state.resume_candidate = match &previous {
            Some(id) => self.resume.find_async(id).await,
            None => None,
        };
        if let Some(record) = &state.resume_candidate {
            tracing::debug!(path = %record.path.display(), "Found transcript to resume");
        }

        if let Err(e) = self.backend.disconnect().await {
            tracing::warn!("Agent disconnect during restart failed: {}", e);
        }
        self.backend.clear_session().await;
        self.session.clear_native_ids().await;
        // Tools approved for the old session are not approved in the new mode.
        self.mediator.reset().await;
        state.was_created = false;
        state.active_mode_hash = None;
        state.pending = Some(batch);
    }

    /// Run one turn; returns false if there was nothing to send
    async fn run_turn(
        &self,
        state: &mut LoopState,
        translator: &mut EventTranslator,
        events: &mut mpsc::UnboundedReceiver<NativeEvent>,
        batch: QueuedMessage,
        mode_hash: String,
    ) -> bool {
        let prompt = batch.prompt();
        if prompt.trim().is_empty() {
            tracing::debug!(session_id = %self.session.id, "Skipping empty message");
            return false;
        }

        let token = self.turn.current();
        translator.begin_turn();

        let starting = !state.was_created;
        let start_config = if starting {
            let policy = batch.mode.permission_level.agent_policy();
            state.was_created = true;
            state.active_mode_hash = Some(mode_hash);
            self.session.set_mode(Some(batch.mode.clone())).await;
            Some(StartConfig {
                prompt: prompt.clone(),
                approval_policy: policy.approval_policy.to_string(),
                sandbox: policy.sandbox.to_string(),
                model: batch.mode.model.clone(),
                cwd: self.session.cwd().to_path_buf(),
                resume: state.resume_candidate.take().map(|r| r.path),
            })
        } else {
            None
        };

        let backend = self.backend.clone();
        let call_token = token.clone();
        let call = async move {
            match start_config {
                Some(config) => backend.start_session(config, call_token).await,
                None => backend.continue_session(&prompt, call_token).await,
            }
        };
        tokio::pin!(call);

        let result: Result<serde_json::Value> = loop {
            tokio::select! {
                result = &mut call => break result,
                Some(event) = events.recv() => {
                    let out = translator.translate(event);
                    self.emit_all(out).await;
                }
            }
        };
        // Events written before the response are already queued.
        while let Ok(event) = events.try_recv() {
            let out = translator.translate(event);
            self.emit_all(out).await;
        }

        let outcome = match &result {
            _ if token.is_cancelled() => TurnOutcome::Aborted,
            Ok(_) => TurnOutcome::Completed,
            Err(e) if e.is_cancelled() => TurnOutcome::Aborted,
            Err(_) => TurnOutcome::Faulted,
        };

        match outcome {
            TurnOutcome::Completed => {
                let out = translator.finish_turn();
                self.emit_all(out).await;
            }
            TurnOutcome::Aborted => {
                let out = translator.abort();
                self.emit_all(out).await;
                let abandoned = self.mediator.abandon_all().await;
                tracing::info!(session_id = %self.session.id, abandoned, "Turn aborted");
                // A start cancelled before the agent reported an id left no session behind.
                if self.backend.session_id().await.is_none() {
                    state.was_created = false;
                    state.active_mode_hash = None;
                }
                self.emit(&SessionEvent::status(STATUS_ABORTED)).await;
            }
            TurnOutcome::Faulted => {
                if let Err(e) = &result {
                    tracing::error!(session_id = %self.session.id, starting, "Agent turn failed: {}", e);
                }
                let out = translator.abort();
                self.emit_all(out).await;
                self.mediator.abandon_all().await;

                if let Some(id) = self.backend.session_id().await {
                    state.resume_candidate = self.resume.find_async(&id).await;
                }
                self.backend.clear_session().await;
                state.was_created = false;
                state.active_mode_hash = None;
                self.emit(&SessionEvent::error_status(STATUS_FAULT)).await;
            }
        }

        self.session.observe_ids(self.backend.identifiers().await).await;
        true
    }

    async fn emit(&self, event: &SessionEvent) {
        if self.is_terminating() {
            return;
        }
        if let Err(e) = self.channel.send_event(event).await {
            tracing::warn!(session_id = %self.session.id, "Failed to send session event: {}", e);
        }
    }

    async fn emit_all(&self, events: Vec<SessionEvent>) {
        for event in &events {
            self.emit(event).await;
        }
    }

    async fn start_keepalive(&self) {
        let mut slot = self.keepalive.lock().await;
        if slot.is_some() || self.keepalive_stop.is_cancelled() {
            return;
        }
        let channel = self.channel.clone();
        let thinking = self.thinking.clone();
        let stop = self.keepalive_stop.clone();
        let period = self.keepalive_interval.max(Duration::from_millis(10));
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => channel.keep_alive(thinking.load(Ordering::SeqCst)),
                }
            }
        }));
    }

    async fn stop_keepalive(&self) {
        self.keepalive_stop.cancel();
        let handle = self.keepalive.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Keepalive task ended abnormally: {}", e);
            }
        }
    }

    /// Terminate the session. Idempotent; concurrent callers wait for the
    /// first one to finish.
    pub async fn kill(&self) {
        if self.kill_started.swap(true, Ordering::SeqCst) {
            self.killed.cancelled().await;
            return;
        }
        tracing::info!(session_id = %self.session.id, "Killing session");

        self.terminating.store(true, Ordering::SeqCst);
        self.turn.abort();
        self.queue.close();
        self.shutdown.cancel();

        let abandoned = self.mediator.abandon_all().await;
        if abandoned > 0 {
            tracing::debug!(abandoned, "Abandoned pending permission requests");
        }

        if let Err(e) = self.backend.force_close().await {
            tracing::warn!("Failed to stop agent: {}", e);
        }
        self.stop_keepalive().await;

        self.session.archive().await;
        if let Err(e) = self.channel.archive().await {
            tracing::warn!("Failed to archive session record: {}", e);
        }
        self.channel.send_session_death();
        self.channel.release().await;
        if let Err(e) = self.channel.flush().await {
            tracing::warn!("Failed to flush relay channel: {}", e);
        }
        self.channel.close();

        tracing::info!(session_id = %self.session.id, "Session killed");
        self.killed.cancel();
    }
}
