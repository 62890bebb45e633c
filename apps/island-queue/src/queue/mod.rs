pub mod claim;
pub mod enrollment;
pub mod poller;
pub mod runner;

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::QueueStatusResponse;
use crate::error::QueueError;

pub use claim::{ClaimResult, claim};
pub use enrollment::{EnrollmentOutcome, EnrollmentPolicy, enroll};
pub use poller::{PollSettings, StatusPoller};
pub use runner::{QueueRun, RunSettings};

/// Per-target run lifecycle. `Claimed` and `Abandoned` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    SessionEstablished,
    Enrolled,
    Polling,
    Claimed,
    Abandoned,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Claimed | RunState::Abandoned)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunState::Idle => "idle",
            RunState::SessionEstablished => "session_established",
            RunState::Enrolled => "enrolled",
            RunState::Polling => "polling",
            RunState::Claimed => "claimed",
            RunState::Abandoned => "abandoned",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueStatus {
    pub success: bool,
    pub position: i64,
    pub total: i64,
}

impl From<QueueStatusResponse> for QueueStatus {
    fn from(value: QueueStatusResponse) -> Self {
        Self {
            success: value.success,
            position: value.your_place,
            total: value.total,
        }
    }
}

/// Progress notifications for whoever renders a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueEvent {
    State(RunState),
    SessionEstablished { visitor_id: String },
    Enrolled { message: Option<String> },
    EnrollmentRejected { message: String },
    Position { position: i64, total: i64 },
    StatusRejected { message: String },
    StatusFailed { error: String },
    Waiting { delay: Duration },
    ClaimRejected { message: String },
    Claimed { code: String },
}

#[derive(Clone, Debug, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<QueueEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<QueueEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn emit(&self, event: QueueEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// Races `fut` against a cancellation token. A cancelled token wins even
/// when `fut` is already ready.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, QueueError>
where
    F: Future<Output = Result<T, QueueError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(QueueError::Cancelled),
        result = fut => result,
    }
}

pub(crate) async fn sleep_or_cancel(
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<(), QueueError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(QueueError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
