use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    ClaimResult, EnrollmentPolicy, EventSink, PollSettings, QueueEvent, RunState, StatusPoller,
    cancellable, claim, enroll,
};
use crate::api::IslandApi;
use crate::broker::{Broker, BrokerSession};
use crate::discovery::Target;
use crate::error::QueueError;

pub const DEFAULT_MAX_CLAIM_ATTEMPTS: u32 = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSettings {
    pub display_name: String,
    pub enrollment_policy: EnrollmentPolicy,
    pub poll: PollSettings,
    /// Claims allowed per run; a rejected claim re-enters polling until this
    /// is used up.
    pub max_claim_attempts: u32,
}

impl RunSettings {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            enrollment_policy: EnrollmentPolicy::default(),
            poll: PollSettings::default(),
            max_claim_attempts: DEFAULT_MAX_CLAIM_ATTEMPTS,
        }
    }
}

/// Joins one island's queue and walks it through to a claimed dodo code.
pub struct QueueRun {
    broker: Arc<dyn Broker>,
    api: Arc<dyn IslandApi>,
    settings: RunSettings,
    events: EventSink,
    cancel: CancellationToken,
    state: RunState,
}

impl QueueRun {
    pub fn new(broker: Arc<dyn Broker>, api: Arc<dyn IslandApi>, settings: RunSettings) -> Self {
        Self {
            broker,
            api,
            settings,
            events: EventSink::default(),
            cancel: CancellationToken::new(),
            state: RunState::Idle,
        }
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<QueueEvent>) -> Self {
        self.events = EventSink::new(tx);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub async fn run(&mut self, target: &Target) -> Result<ClaimResult, QueueError> {
        tracing::info!(
            target: "island_queue::queue",
            island = %target.code,
            name = %target.name,
            "generating visitor id"
        );
        let session = match cancellable(&self.cancel, self.broker.establish(&target.code)).await
        {
            Ok(session) => session,
            Err(err) => {
                self.transition(RunState::Abandoned);
                return Err(err);
            }
        };
        self.transition(RunState::SessionEstablished);
        self.events.emit(QueueEvent::SessionEstablished {
            visitor_id: session.visitor_id().to_string(),
        });

        let result = self.drive(&session).await;
        session.close().await;

        if let Err(err) = &result {
            tracing::warn!(
                target: "island_queue::queue",
                island = %target.code,
                state = %self.state,
                error = %err,
                "abandoning queue run"
            );
            self.transition(RunState::Abandoned);
        }
        result
    }

    async fn drive(&mut self, session: &BrokerSession) -> Result<ClaimResult, QueueError> {
        let enrolled = cancellable(
            &self.cancel,
            enroll(
                self.api.as_ref(),
                session,
                &self.settings.display_name,
                &self.events,
            ),
        )
        .await;
        match enrolled {
            Ok(outcome) => {
                outcome.enforce(self.settings.enrollment_policy)?;
            }
            Err(QueueError::Cancelled) => return Err(QueueError::Cancelled),
            Err(err) if self.settings.enrollment_policy == EnrollmentPolicy::Continue => {
                tracing::warn!(
                    target: "island_queue::queue",
                    island = %session.target(),
                    error = %err,
                    "enrollment request failed; polling anyway"
                );
                self.events.emit(QueueEvent::EnrollmentRejected {
                    message: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        }
        self.transition(RunState::Enrolled);

        let mut poller = StatusPoller::new(
            self.api.clone(),
            self.settings.poll.clone(),
            self.events.clone(),
            self.cancel.clone(),
        );
        let mut claims = 0u32;
        loop {
            self.transition(RunState::Polling);
            poller.wait_for_front(session).await?;

            claims += 1;
            match claim(self.api.as_ref(), session, &self.events, &self.cancel).await {
                Ok(result) => {
                    self.transition(RunState::Claimed);
                    return Ok(result);
                }
                Err(QueueError::Cancelled) => return Err(QueueError::Cancelled),
                Err(err) if claims < self.settings.max_claim_attempts => {
                    tracing::warn!(
                        target: "island_queue::queue",
                        island = %session.target(),
                        attempt = claims,
                        error = %err,
                        "claim failed; returning to the queue"
                    );
                    poller.pause().await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn transition(&mut self, next: RunState) {
        if self.state == next {
            return;
        }
        tracing::debug!(
            target: "island_queue::queue",
            from = %self.state,
            to = %next,
            "run state transition"
        );
        self.state = next;
        self.events.emit(QueueEvent::State(next));
    }
}
