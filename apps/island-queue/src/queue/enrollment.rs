use clap::ValueEnum;

use super::{EventSink, QueueEvent};
use crate::api::IslandApi;
use crate::broker::BrokerSession;
use crate::error::{QueueError, Stage};

/// What a run does when the server refuses to enroll the visitor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum EnrollmentPolicy {
    /// Report the rejection and poll anyway.
    #[default]
    Continue,
    /// End the run with `RemoteRejected`.
    Abort,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnrollmentOutcome {
    pub success: bool,
    pub message: Option<String>,
}

/// Places the session's visitor in the island queue. One request, no retry.
pub async fn enroll(
    api: &dyn IslandApi,
    session: &BrokerSession,
    display_name: &str,
    events: &EventSink,
) -> Result<EnrollmentOutcome, QueueError> {
    let response = api
        .join_queue(session.target(), session.visitor_id(), display_name)
        .await?;

    if response.success {
        tracing::info!(
            target: "island_queue::queue",
            island = %session.target(),
            place = ?response.your_place,
            "joined island queue"
        );
        events.emit(QueueEvent::Enrolled {
            message: response.message.clone(),
        });
    } else {
        tracing::warn!(
            target: "island_queue::queue",
            island = %session.target(),
            message = ?response.message,
            "island refused queue enrollment"
        );
        events.emit(QueueEvent::EnrollmentRejected {
            message: response
                .message
                .clone()
                .unwrap_or_else(|| "no message".to_string()),
        });
    }

    Ok(EnrollmentOutcome {
        success: response.success,
        message: response.message,
    })
}

impl EnrollmentOutcome {
    /// Applies `policy` to a finished enrollment.
    pub fn enforce(self, policy: EnrollmentPolicy) -> Result<Self, QueueError> {
        if self.success || policy == EnrollmentPolicy::Continue {
            return Ok(self);
        }
        Err(QueueError::rejected(Stage::Enrollment, self.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::JoinQueueResponse;
    use crate::queue::testing::{Call, FakeApi, FakeBroker};
    use tokio::sync::mpsc;

    #[test_timeout::tokio_timeout_test]
    async fn enrollment_carries_identity_and_name() {
        let api = FakeApi::new();
        api.join(JoinQueueResponse {
            success: true,
            message: Some("welcome".into()),
            ..Default::default()
        })
        .await;
        let session = FakeBroker::new("V1").session("ABC123");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = enroll(api.as_ref(), &session, "Tom", &EventSink::new(tx))
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(
            api.calls().await,
            vec![Call::Join {
                code: "ABC123".into(),
                visitor: "V1".into(),
                name: "Tom".into()
            }]
        );
        assert_eq!(
            rx.recv().await,
            Some(QueueEvent::Enrolled {
                message: Some("welcome".into())
            })
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejection_is_reported_not_raised() {
        let api = FakeApi::new();
        api.join(JoinQueueResponse {
            success: false,
            message: Some("queue full".into()),
            ..Default::default()
        })
        .await;
        let session = FakeBroker::new("V1").session("ABC123");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = enroll(api.as_ref(), &session, "Tom", &EventSink::new(tx))
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(
            rx.recv().await,
            Some(QueueEvent::EnrollmentRejected {
                message: "queue full".into()
            })
        );
    }

    #[test]
    fn policy_decides_whether_rejection_is_fatal() {
        let rejected = EnrollmentOutcome {
            success: false,
            message: Some("queue full".into()),
        };
        assert!(rejected.clone().enforce(EnrollmentPolicy::Continue).is_ok());
        let err = rejected.enforce(EnrollmentPolicy::Abort).unwrap_err();
        assert!(matches!(
            err,
            QueueError::RemoteRejected { stage: Stage::Enrollment, ref message } if message == "queue full"
        ));

        let accepted = EnrollmentOutcome {
            success: true,
            message: None,
        };
        assert!(accepted.enforce(EnrollmentPolicy::Abort).is_ok());
    }
}
