//! Resolve "who should receive this" into users and their subscriptions.
//!
//! Audience facts live in the domain store behind [`AudienceDirectory`].
//! Resolved user ids are cached per filter for a short TTL; subscriptions
//! are always read from the store, so endpoints removed or disabled after
//! the lookup never come back from the cache.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{NotificationError, NotificationResult};
use crate::models::{EventSummary, PushSubscription};
use crate::subscriptions::SubscriptionStore;

/// Audience selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetFilter {
    /// Users holding a ticket for the event.
    EventTicketHolders { event_id: Uuid },
    /// Users opted in to a notification category.
    NotificationCategory { category: String },
    City { city: String },
    UserIds { user_ids: Vec<Uuid> },
    All,
}

impl TargetFilter {
    fn cache_key(&self) -> String {
        match self {
            TargetFilter::EventTicketHolders { event_id } => format!("event:{}", event_id),
            TargetFilter::NotificationCategory { category } => {
                format!("category:{}", category.to_lowercase())
            }
            TargetFilter::City { city } => format!("city:{}", city.to_lowercase()),
            TargetFilter::UserIds { user_ids } => {
                let sorted: BTreeSet<_> = user_ids.iter().collect();
                let ids: Vec<String> = sorted.into_iter().map(Uuid::to_string).collect();
                format!("users:{}", ids.join(","))
            }
            TargetFilter::All => "all".to_string(),
        }
    }
}

/// A filter plus users to leave out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetQuery {
    pub filter: TargetFilter,
    #[serde(default)]
    pub exclude: Vec<Uuid>,
}

impl TargetQuery {
    pub fn new(filter: TargetFilter) -> Self {
        Self {
            filter,
            exclude: Vec::new(),
        }
    }

    pub fn excluding(mut self, users: impl IntoIterator<Item = Uuid>) -> Self {
        self.exclude.extend(users);
        self
    }

    pub fn cache_key(&self) -> String {
        if self.exclude.is_empty() {
            return self.filter.cache_key();
        }
        let excluded: BTreeSet<_> = self.exclude.iter().collect();
        let ids: Vec<String> = excluded.into_iter().map(Uuid::to_string).collect();
        format!("{}|not:{}", self.filter.cache_key(), ids.join(","))
    }
}

/// Resolved audience.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTargets {
    pub users: Vec<Uuid>,
    pub subscriptions: Vec<PushSubscription>,
    /// User ids came from the cache without asking the directory.
    pub cache_hit: bool,
}

/// Read-only view of the event/ticket/user domain store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudienceDirectory: Send + Sync {
    /// Facts about one event, `None` when it does not exist.
    async fn event_summary(&self, event_id: Uuid) -> NotificationResult<Option<EventSummary>>;

    /// Users matched by `filter`.
    async fn resolve_users(&self, filter: &TargetFilter) -> NotificationResult<Vec<Uuid>>;
}

// ============================================================================
// HTTP directory
// ============================================================================

#[derive(Debug, Deserialize)]
struct ResolveUsersResponse {
    user_ids: Vec<Uuid>,
}

/// Directory backed by the domain API.
///
/// - `GET  {base}/events/{id}/summary` returns an [`EventSummary`] or 404
/// - `POST {base}/audiences/resolve` takes a [`TargetFilter`] and returns `{"user_ids": [...]}`
#[derive(Debug, Clone)]
pub struct HttpAudienceDirectory {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpAudienceDirectory {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> NotificationResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl AudienceDirectory for HttpAudienceDirectory {
    async fn event_summary(&self, event_id: Uuid) -> NotificationResult<Option<EventSummary>> {
        let url = format!("{}/events/{}/summary", self.base_url, event_id);
        let response = self.authorize(self.client.get(&url)).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(NotificationError::Http(format!(
                "domain API returned {} for event {}",
                status, event_id
            ))),
        }
    }

    async fn resolve_users(&self, filter: &TargetFilter) -> NotificationResult<Vec<Uuid>> {
        let url = format!("{}/audiences/resolve", self.base_url);
        let response = self
            .authorize(self.client.post(&url).json(filter))
            .send()
            .await?
            .error_for_status()?;
        let body: ResolveUsersResponse = response.json().await?;
        Ok(body.user_ids)
    }
}

// ============================================================================
// Targeting with cache
// ============================================================================

struct CacheEntry {
    filter: TargetFilter,
    users: Vec<Uuid>,
    inserted_at: Instant,
}

/// Capacity-bounded TTL cache keyed by [`TargetQuery::cache_key`].
struct TargetCache {
    entries: HashMap<String, CacheEntry>,
    ttl: Duration,
    capacity: usize,
}

impl TargetCache {
    fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries
            .get(key)
            .filter(|entry| entry.inserted_at.elapsed() < self.ttl)
    }

    fn insert(&mut self, key: String, entry: CacheEntry) {
        self.sweep();
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(key, entry);
    }

    fn sweep(&mut self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
        before - self.entries.len()
    }
}

/// Resolves target queries into subscriptions, caching the result.
pub struct UserTargeting {
    directory: Arc<dyn AudienceDirectory>,
    subscriptions: Arc<dyn SubscriptionStore>,
    cache: Mutex<TargetCache>,
}

impl UserTargeting {
    pub fn new(
        directory: Arc<dyn AudienceDirectory>,
        subscriptions: Arc<dyn SubscriptionStore>,
        ttl: Duration,
        capacity: usize,
    ) -> Self {
        Self {
            directory,
            subscriptions,
            cache: Mutex::new(TargetCache {
                entries: HashMap::new(),
                ttl,
                capacity: capacity.max(1),
            }),
        }
    }

    #[instrument(skip_all, fields(key = %query.cache_key()))]
    pub async fn resolve(&self, query: &TargetQuery) -> NotificationResult<ResolvedTargets> {
        let key = query.cache_key();

        let cached = self
            .cache
            .lock()
            .await
            .get(&key)
            .map(|entry| entry.users.clone());

        let (users, cache_hit) = match cached {
            Some(users) => {
                metrics::counter!("notifications_targeting_cache_total", "result" => "hit")
                    .increment(1);
                (users, true)
            }
            None => {
                metrics::counter!("notifications_targeting_cache_total", "result" => "miss")
                    .increment(1);
                let users = self.lookup_users(query).await?;
                self.cache.lock().await.insert(
                    key,
                    CacheEntry {
                        filter: query.filter.clone(),
                        users: users.clone(),
                        inserted_at: Instant::now(),
                    },
                );
                (users, false)
            }
        };

        let subscriptions = self.subscriptions.list_enabled_for_users(&users).await?;
        debug!(
            users = users.len(),
            subscriptions = subscriptions.len(),
            cache_hit,
            "Resolved targets"
        );

        Ok(ResolvedTargets {
            users,
            subscriptions,
            cache_hit,
        })
    }

    async fn lookup_users(&self, query: &TargetQuery) -> NotificationResult<Vec<Uuid>> {
        let excluded: BTreeSet<Uuid> = query.exclude.iter().copied().collect();
        let mut users = self.directory.resolve_users(&query.filter).await?;
        users.retain(|u| !excluded.contains(u));
        users.sort();
        users.dedup();
        Ok(users)
    }

    /// Drop cached audiences for an event (its ticket holders changed).
    pub async fn invalidate_event(&self, event_id: Uuid) -> usize {
        let mut cache = self.cache.lock().await;
        let before = cache.entries.len();
        cache.entries.retain(|_, e| {
            !matches!(&e.filter, TargetFilter::EventTicketHolders { event_id: id } if *id == event_id)
        });
        before - cache.entries.len()
    }

    /// Drop cached audiences that a user's preference change may affect.
    ///
    /// Covers every entry containing the user, plus all category audiences
    /// since an opt-in can add the user to one.
    pub async fn invalidate_user(&self, user_id: Uuid) -> usize {
        let mut cache = self.cache.lock().await;
        let before = cache.entries.len();
        cache.entries.retain(|_, e| {
            !e.users.contains(&user_id)
                && !matches!(e.filter, TargetFilter::NotificationCategory { .. })
        });
        before - cache.entries.len()
    }

    /// Remove expired entries. Returns how many were dropped.
    pub async fn sweep(&self) -> usize {
        self.cache.lock().await.sweep()
    }

    pub async fn cached_entries(&self) -> usize {
        self.cache.lock().await.entries.len()
    }
}
