use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::api::{IslandApi, IslandInfo, IslandsRequest};
use crate::error::{QueueError, Stage};
use crate::queue::{cancellable, sleep_or_cancel};

/// An island that can be queued for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub code: String,
    pub name: String,
    pub turnip_price: i64,
    /// `"<queued>/<capacity>"` as advertised by the listing.
    pub queued: String,
    pub discord_only: bool,
    pub created_at: Option<OffsetDateTime>,
}

impl Target {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            turnip_price: 0,
            queued: String::new(),
            discord_only: false,
            created_at: None,
        }
    }

    /// Listing entries without a turnip code cannot be joined and are dropped.
    pub fn from_listing(info: IslandInfo) -> Option<Self> {
        let code = info.turnip_code.clone().filter(|code| !code.trim().is_empty())?;
        Some(Self::from_info(code, info))
    }

    fn from_info(code: String, info: IslandInfo) -> Self {
        let queued = info.queued.clone().unwrap_or_else(|| {
            let count = info
                .visitor_count
                .map(|value| value.to_string())
                .unwrap_or_else(|| "?".into());
            let limit = info
                .visitor_limit
                .map(|value| value.to_string())
                .unwrap_or_else(|| "?".into());
            format!("{count}/{limit}")
        });
        Self {
            code,
            name: info.name,
            turnip_price: info.turnip_price,
            queued,
            discord_only: info.discord_only,
            created_at: info.creation_time.as_ref().and_then(|t| t.to_datetime()),
        }
    }

    /// Number of visitors already queued, from the leading part of `queued`.
    pub fn queue_length(&self) -> Option<u64> {
        self.queued.split('/').next()?.trim().parse().ok()
    }
}

/// Looks up one island by code. A `success:false` answer ends the run before
/// any broker handshake.
pub async fn lookup(api: &dyn IslandApi, code: &str) -> Result<Target, QueueError> {
    tracing::info!(target: "island_queue::discovery", island = %code, "searching for island");
    let response = api.island(code).await?;
    match response.island_info {
        Some(info) if response.success => Ok(Target::from_info(code.to_string(), info)),
        _ => Err(QueueError::NotFound(code.to_string())),
    }
}

/// Keeps islands paying at least `minimum_bells` that are open to everyone.
pub fn eligible(islands: Vec<Target>, minimum_bells: i64) -> Vec<Target> {
    islands
        .into_iter()
        .filter(|island| island.turnip_price >= minimum_bells && !island.discord_only)
        .collect()
}

/// Shortest queue first. Unparseable queue sizes go last; ties keep listing order.
pub fn rank_by_queue(mut islands: Vec<Target>) -> Vec<Target> {
    islands.sort_by_key(|island| island.queue_length().unwrap_or(u64::MAX));
    islands
}

async fn fetch(api: &dyn IslandApi) -> Result<Vec<Target>, QueueError> {
    let response = api.islands(&IslandsRequest::default()).await?;
    if !response.success {
        return Err(QueueError::rejected(
            Stage::Lookup,
            Some("island listing failed".into()),
        ));
    }
    Ok(response
        .islands
        .into_iter()
        .filter_map(Target::from_listing)
        .collect())
}

/// Current eligible islands, best candidate first.
pub async fn list_candidates(
    api: &dyn IslandApi,
    minimum_bells: i64,
) -> Result<Vec<Target>, QueueError> {
    let islands = fetch(api).await?;
    Ok(rank_by_queue(eligible(islands, minimum_bells)))
}

/// Waits for eligible islands listed after the watch started, checking every
/// `interval`. Each check keeps islands created after the previous check began.
pub async fn watch_for_new(
    api: &dyn IslandApi,
    minimum_bells: i64,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<Target>, QueueError> {
    let mut since = OffsetDateTime::now_utc();
    loop {
        let checked_at = OffsetDateTime::now_utc();
        let islands = cancellable(cancel, fetch(api)).await?;
        let fresh: Vec<Target> = eligible(islands, minimum_bells)
            .into_iter()
            .filter(|island| island.created_at.is_some_and(|created| created > since))
            .collect();
        if !fresh.is_empty() {
            tracing::info!(
                target: "island_queue::discovery",
                count = fresh.len(),
                "new islands found"
            );
            return Ok(rank_by_queue(fresh));
        }

        tracing::info!(
            target: "island_queue::discovery",
            "no new islands found; searching again"
        );
        since = checked_at;
        sleep_or_cancel(interval, cancel).await?;
    }
}
