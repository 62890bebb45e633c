use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{EventSink, QueueEvent, QueueStatus, cancellable, sleep_or_cancel};
use crate::api::IslandApi;
use crate::broker::BrokerSession;
use crate::error::QueueError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollSettings {
    /// Fixed delay between status requests.
    pub interval: Duration,
    /// Total status requests allowed for the run. `None` polls forever.
    pub max_polls: Option<u64>,
    /// Wall-clock budget for the run, measured from the first poll.
    pub deadline: Option<Duration>,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_polls: None,
            deadline: None,
        }
    }
}

enum PollStep {
    Front(QueueStatus),
    Continue,
}

/// Polls the queue until the visitor reaches first place.
///
/// Attempt counts and the deadline persist across calls to
/// [`StatusPoller::wait_for_front`], so re-entering polling after a failed
/// claim shares the same budget.
pub struct StatusPoller {
    api: Arc<dyn IslandApi>,
    settings: PollSettings,
    events: EventSink,
    cancel: CancellationToken,
    attempts: u64,
    deadline: Option<Instant>,
}

impl StatusPoller {
    pub fn new(
        api: Arc<dyn IslandApi>,
        settings: PollSettings,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        let deadline = settings.deadline.map(|budget| Instant::now() + budget);
        Self {
            api,
            settings,
            events,
            cancel,
            attempts: 0,
            deadline,
        }
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub async fn wait_for_front(
        &mut self,
        session: &BrokerSession,
    ) -> Result<QueueStatus, QueueError> {
        loop {
            if let Some(max) = self.settings.max_polls {
                if self.attempts >= max {
                    return Err(QueueError::PollLimitReached {
                        attempts: self.attempts,
                    });
                }
            }
            if self.deadline_passed() {
                return Err(QueueError::DeadlineElapsed);
            }

            self.attempts += 1;
            if let PollStep::Front(status) = self.poll_once(session).await? {
                return Ok(status);
            }
            self.pause().await?;
        }
    }

    /// Waits one poll interval, shortened so it never sleeps past the deadline.
    pub async fn pause(&self) -> Result<(), QueueError> {
        let mut delay = self.settings.interval;
        if let Some(deadline) = self.deadline {
            delay = delay.min(deadline.saturating_duration_since(Instant::now()));
        }
        self.events.emit(QueueEvent::Waiting { delay });
        tracing::debug!(
            target: "island_queue::queue",
            delay_ms = delay.as_millis() as u64,
            "awaiting next status poll"
        );
        sleep_or_cancel(delay, &self.cancel).await
    }

    fn deadline_passed(&self) -> bool {
        self.deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }

    async fn poll_once(&self, session: &BrokerSession) -> Result<PollStep, QueueError> {
        let response = cancellable(
            &self.cancel,
            self.api.queue_status(session.target(), session.visitor_id()),
        )
        .await;

        let (status, message) = match response {
            Ok(response) => {
                let message = response.message.clone();
                (QueueStatus::from(response), message)
            }
            Err(QueueError::Cancelled) => return Err(QueueError::Cancelled),
            Err(err) => {
                tracing::warn!(
                    target: "island_queue::queue",
                    island = %session.target(),
                    attempt = self.attempts,
                    error = %err,
                    "status request failed"
                );
                self.events.emit(QueueEvent::StatusFailed {
                    error: err.to_string(),
                });
                return Ok(PollStep::Continue);
            }
        };

        if !status.success {
            tracing::warn!(
                target: "island_queue::queue",
                island = %session.target(),
                attempt = self.attempts,
                message = ?message,
                "island rejected status request"
            );
            self.events.emit(QueueEvent::StatusRejected {
                message: message.unwrap_or_else(|| "no message".to_string()),
            });
            return Ok(PollStep::Continue);
        }

        if status.position == 1 {
            tracing::info!(
                target: "island_queue::queue",
                island = %session.target(),
                total = status.total,
                "reached the front of the queue"
            );
            return Ok(PollStep::Front(status));
        }

        if status.position < 1 {
            tracing::warn!(
                target: "island_queue::queue",
                island = %session.target(),
                position = status.position,
                total = status.total,
                "unexpected queue position; continuing to poll"
            );
        } else {
            tracing::info!(
                target: "island_queue::queue",
                island = %session.target(),
                position = status.position,
                total = status.total,
                "queue position"
            );
        }
        self.events.emit(QueueEvent::Position {
            position: status.position,
            total: status.total,
        });
        Ok(PollStep::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::QueueStatusResponse;
    use crate::queue::testing::{Call, FakeApi, FakeBroker};
    use tokio::sync::mpsc;

    fn poller(
        api: Arc<FakeApi>,
        settings: PollSettings,
    ) -> (StatusPoller, mpsc::UnboundedReceiver<QueueEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let poller = StatusPoller::new(
            api,
            settings,
            EventSink::new(tx),
            CancellationToken::new(),
        );
        (poller, rx)
    }

    fn assert_waited(started: Instant, expected: Duration) {
        let elapsed = started.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_secs(1),
            "waited {elapsed:?}, expected {expected:?}"
        );
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<QueueEvent>) -> Vec<QueueEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn position_report_then_repoll_after_fixed_interval() {
        let api = FakeApi::new();
        api.status(true, 3, 5).await;
        api.status(true, 1, 5).await;
        let session = FakeBroker::new("V1").session("ABC123");
        let (mut poller, mut rx) = poller(api.clone(), PollSettings::default());

        let started = Instant::now();
        let status = poller.wait_for_front(&session).await.unwrap();

        assert_eq!(status.position, 1);
        assert_waited(started, DEFAULT_POLL_INTERVAL);
        assert_eq!(poller.attempts(), 2);
        assert_eq!(
            drain(&mut rx),
            vec![
                QueueEvent::Position {
                    position: 3,
                    total: 5
                },
                QueueEvent::Waiting {
                    delay: DEFAULT_POLL_INTERVAL
                },
            ]
        );
        for call in api.calls().await {
            assert_eq!(
                call,
                Call::Status {
                    code: "ABC123".into(),
                    visitor: "V1".into()
                }
            );
        }
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn rejected_status_keeps_polling() {
        let api = FakeApi::new();
        api.status(false, 0, 0).await;
        api.status(true, 1, 2).await;
        let session = FakeBroker::new("V1").session("ABC123");
        let (mut poller, mut rx) = poller(api.clone(), PollSettings::default());

        let started = Instant::now();
        poller.wait_for_front(&session).await.unwrap();

        assert_waited(started, DEFAULT_POLL_INTERVAL);
        let events = drain(&mut rx);
        assert!(matches!(events[0], QueueEvent::StatusRejected { .. }));
        assert!(matches!(events[1], QueueEvent::Waiting { .. }));
        assert_eq!(events.len(), 2);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn transport_failures_are_transient() {
        let api = FakeApi::new();
        api.status_error(QueueError::Transport("connection reset".into()))
            .await;
        api.status(true, 1, 2).await;
        let session = FakeBroker::new("V1").session("ABC123");
        let (mut poller, mut rx) = poller(api.clone(), PollSettings::default());

        poller.wait_for_front(&session).await.unwrap();

        assert!(matches!(
            drain(&mut rx).first(),
            Some(QueueEvent::StatusFailed { .. })
        ));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn non_positive_positions_never_claim() {
        let api = FakeApi::new();
        api.status(true, 0, 5).await;
        api.status(true, -2, 5).await;
        api.status(true, 2, 5).await;
        api.status(true, 1, 5).await;
        let session = FakeBroker::new("V1").session("ABC123");
        let (mut poller, _rx) = poller(api.clone(), PollSettings::default());

        let status = poller.wait_for_front(&session).await.unwrap();

        assert_eq!(status.position, 1);
        assert_eq!(poller.attempts(), 4);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn unchanged_position_respects_poll_limit() {
        let api = FakeApi::new();
        *api.status_fallback.lock().await = Some(QueueStatusResponse {
            success: true,
            total: 9,
            your_place: 4,
            message: None,
        });
        let session = FakeBroker::new("V1").session("ABC123");
        let settings = PollSettings {
            max_polls: Some(5),
            ..PollSettings::default()
        };
        let (mut poller, _rx) = poller(api.clone(), settings);

        let err = poller.wait_for_front(&session).await.unwrap_err();

        assert!(matches!(err, QueueError::PollLimitReached { attempts: 5 }));
        assert_eq!(api.calls().await.len(), 5);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn deadline_bounds_the_wait() {
        let api = FakeApi::new();
        *api.status_fallback.lock().await = Some(QueueStatusResponse {
            success: true,
            total: 9,
            your_place: 4,
            message: None,
        });
        let session = FakeBroker::new("V1").session("ABC123");
        let settings = PollSettings {
            deadline: Some(Duration::from_secs(40)),
            ..PollSettings::default()
        };
        let (mut poller, _rx) = poller(api.clone(), settings);

        let started = Instant::now();
        let err = poller.wait_for_front(&session).await.unwrap_err();

        assert!(matches!(err, QueueError::DeadlineElapsed));
        assert_waited(started, Duration::from_secs(40));
        assert_eq!(poller.attempts(), 3);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn cancellation_interrupts_the_delay() {
        let api = FakeApi::new();
        api.status(true, 3, 5).await;
        let session = FakeBroker::new("V1").session("ABC123");
        let cancel = CancellationToken::new();
        let mut poller = StatusPoller::new(
            api.clone(),
            PollSettings::default(),
            EventSink::default(),
            cancel.clone(),
        );

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let err = poller.wait_for_front(&session).await.unwrap_err();
        assert!(matches!(err, QueueError::Cancelled));
        assert_eq!(api.calls().await.len(), 1);
    }
}
