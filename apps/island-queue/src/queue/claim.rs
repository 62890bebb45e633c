use tokio_util::sync::CancellationToken;

use super::{EventSink, QueueEvent, cancellable};
use crate::api::IslandApi;
use crate::broker::BrokerSession;
use crate::error::{QueueError, Stage};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimResult {
    pub success: bool,
    pub code: String,
}

/// Issues a single grab request for the session's visitor. A response without
/// a usable code counts as a rejection.
pub async fn claim(
    api: &dyn IslandApi,
    session: &BrokerSession,
    events: &EventSink,
    cancel: &CancellationToken,
) -> Result<ClaimResult, QueueError> {
    let response = cancellable(
        cancel,
        api.grab_code(session.target(), session.visitor_id()),
    )
    .await?;

    let code = response
        .dodo_code
        .filter(|code| !code.trim().is_empty());
    match code {
        Some(code) if response.success => {
            tracing::info!(
                target: "island_queue::queue",
                island = %session.target(),
                "dodo code claimed"
            );
            events.emit(QueueEvent::Claimed { code: code.clone() });
            Ok(ClaimResult {
                success: true,
                code,
            })
        }
        _ => {
            let message = response
                .message
                .unwrap_or_else(|| "no dodo code in response".to_string());
            tracing::warn!(
                target: "island_queue::queue",
                island = %session.target(),
                message = %message,
                "claim rejected"
            );
            events.emit(QueueEvent::ClaimRejected {
                message: message.clone(),
            });
            Err(QueueError::rejected(Stage::Claim, Some(message)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::GrabCodeResponse;
    use crate::queue::testing::{Call, FakeApi, FakeBroker};
    use tokio::sync::mpsc;

    #[test_timeout::tokio_timeout_test]
    async fn successful_grab_returns_code() {
        let api = FakeApi::new();
        api.grab(GrabCodeResponse {
            success: true,
            message: None,
            dodo_code: Some("D0D0X".into()),
        })
        .await;
        let session = FakeBroker::new("V1").session("ABC123");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let result = claim(
            api.as_ref(),
            &session,
            &EventSink::new(tx),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(
            result,
            ClaimResult {
                success: true,
                code: "D0D0X".into()
            }
        );
        assert_eq!(
            api.calls().await,
            vec![Call::Grab {
                code: "ABC123".into(),
                visitor: "V1".into()
            }]
        );
        assert_eq!(
            rx.recv().await,
            Some(QueueEvent::Claimed {
                code: "D0D0X".into()
            })
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejected_or_empty_grab_is_remote_rejected() {
        let api = FakeApi::new();
        api.grab(GrabCodeResponse {
            success: false,
            message: Some("someone else got it".into()),
            dodo_code: None,
        })
        .await;
        api.grab(GrabCodeResponse {
            success: true,
            message: None,
            dodo_code: Some("  ".into()),
        })
        .await;
        let session = FakeBroker::new("V1").session("ABC123");
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let err = claim(api.as_ref(), &session, &EventSink::default(), &cancel)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                QueueError::RemoteRejected {
                    stage: Stage::Claim,
                    ..
                }
            ));
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn cancelled_claim_sends_nothing_further() {
        let api = FakeApi::new();
        let session = FakeBroker::new("V1").session("ABC123");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = claim(api.as_ref(), &session, &EventSink::default(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::Cancelled));
        assert!(api.calls().await.is_empty());
    }
}
