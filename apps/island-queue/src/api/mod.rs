use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, PrimitiveDateTime};
use url::Url;

use crate::broker::VisitorId;
use crate::error::QueueError;

/// HTTP surface of the island exchange.
#[async_trait]
pub trait IslandApi: Send + Sync {
    async fn join_queue(
        &self,
        code: &str,
        visitor: &VisitorId,
        name: &str,
    ) -> Result<JoinQueueResponse, QueueError>;

    async fn queue_status(
        &self,
        code: &str,
        visitor: &VisitorId,
    ) -> Result<QueueStatusResponse, QueueError>;

    async fn grab_code(
        &self,
        code: &str,
        visitor: &VisitorId,
    ) -> Result<GrabCodeResponse, QueueError>;

    async fn island(&self, code: &str) -> Result<IslandResponse, QueueError>;

    async fn islands(&self, request: &IslandsRequest) -> Result<IslandsResponse, QueueError>;
}

pub struct ReqwestIslandApi {
    client: reqwest::Client,
    base_url: Url,
}

impl ReqwestIslandApi {
    pub fn new(base_url: Url) -> Result<Self, QueueError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self { client, base_url })
    }

    /// Appends `segments` to the base url. Each segment is percent-encoded on
    /// its own, so an island code can never reach another route.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, QueueError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                QueueError::InvalidConfig(format!("api base {} cannot take a path", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn decode<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, QueueError> {
        if !response.status().is_success() {
            return Err(QueueError::HttpStatus(response.status()));
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl IslandApi for ReqwestIslandApi {
    async fn join_queue(
        &self,
        code: &str,
        visitor: &VisitorId,
        name: &str,
    ) -> Result<JoinQueueResponse, QueueError> {
        let endpoint = self.endpoint(&["island", "queue", code])?;
        let response = self
            .client
            .put(endpoint)
            .query(&[("visitorID", visitor.as_str())])
            .header("x-recaptcha-token", visitor.as_str())
            .json(&JoinQueueRequest { name })
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn queue_status(
        &self,
        code: &str,
        visitor: &VisitorId,
    ) -> Result<QueueStatusResponse, QueueError> {
        let endpoint = self.endpoint(&["island", "queue", code])?;
        let response = self
            .client
            .post(endpoint)
            .query(&[("visitorID", visitor.as_str())])
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn grab_code(
        &self,
        code: &str,
        visitor: &VisitorId,
    ) -> Result<GrabCodeResponse, QueueError> {
        let endpoint = self.endpoint(&["island", "queue", code, "grab"])?;
        let response = self
            .client
            .post(endpoint)
            .query(&[("visitorID", visitor.as_str())])
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn island(&self, code: &str) -> Result<IslandResponse, QueueError> {
        let endpoint = self.endpoint(&["island", code])?;
        let response = self.client.post(endpoint).send().await?;
        Self::decode(response).await
    }

    async fn islands(&self, request: &IslandsRequest) -> Result<IslandsResponse, QueueError> {
        let endpoint = self.endpoint(&["islands", ""])?;
        let response = self.client.post(endpoint).json(request).send().await?;
        Self::decode(response).await
    }
}

#[derive(Debug, Serialize)]
struct JoinQueueRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinQueueResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub your_place: Option<i64>,
    #[serde(default)]
    pub max_queue: Option<i64>,
    #[serde(default)]
    pub current_queue_size: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusResponse {
    pub success: bool,
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub your_place: i64,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GrabCodeResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub dodo_code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IslandResponse {
    pub success: bool,
    #[serde(default)]
    pub island_info: Option<IslandInfo>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct IslandsResponse {
    pub success: bool,
    #[serde(default)]
    pub islands: Vec<IslandInfo>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Islander {
    Neither,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Turnips,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IslandsRequest {
    pub islander: Islander,
    pub category: Category,
}

impl Default for IslandsRequest {
    fn default() -> Self {
        Self {
            islander: Islander::Neither,
            category: Category::Turnips,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IslandInfo {
    #[serde(default)]
    pub turnip_code: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub fruit: Option<String>,
    #[serde(default)]
    pub turnip_price: i64,
    #[serde(default)]
    pub max_queue: Option<i64>,
    #[serde(default)]
    pub queued: Option<String>,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub discord_only: bool,
    #[serde(default)]
    pub visitor_count: Option<i64>,
    #[serde(default)]
    pub visitor_limit: Option<i64>,
    #[serde(default)]
    pub creation_time: Option<CreationTime>,
}

/// The listing reports creation time either as epoch milliseconds or as a
/// timestamp string.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CreationTime {
    Millis(i64),
    Text(String),
}

impl CreationTime {
    pub fn to_datetime(&self) -> Option<OffsetDateTime> {
        match self {
            CreationTime::Millis(ms) => {
                OffsetDateTime::from_unix_timestamp_nanos(i128::from(*ms) * 1_000_000).ok()
            }
            CreationTime::Text(raw) => {
                let raw = raw.trim();
                if let Ok(parsed) = OffsetDateTime::parse(raw, &Rfc3339) {
                    return Some(parsed);
                }
                let format =
                    time::format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]")
                        .ok()?;
                PrimitiveDateTime::parse(raw, &format)
                    .ok()
                    .map(PrimitiveDateTime::assume_utc)
            }
        }
    }
}

fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Number(i64),
    }

    Ok(match Option::<Flag>::deserialize(deserializer)? {
        Some(Flag::Bool(value)) => value,
        Some(Flag::Number(value)) => value != 0,
        None => false,
    })
}
