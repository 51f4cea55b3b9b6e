//! Notifications Domain
//!
//! Asynchronous push notification delivery for event changes and new event
//! announcements.
//!
//! # Features
//!
//! - Event update notifications to ticket holders (cancellation, time, venue, description)
//! - New event announcements targeted by category, city or everyone
//! - Bounded-parallel delivery with per-send timeouts
//! - Error classification with automatic cleanup of dead endpoints
//! - Windowed metrics, a composite health verdict and rule-based alerting
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    Producer     │  ← enqueue_event_update / enqueue_new_event
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │ NotificationSvc │  ← validates, assigns priority and dedupe key
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │    Job queue    │  ← priority-ordered, leased, TTL-bounded (Redis)
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │  PushProcessor  │  ← targeting → payload → bulk send → error tracking
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │ Push transport  │  ← HTTP push gateway
//! └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use domain_notifications::{NotificationDeps, NotificationSettings, NotificationSystem};
//!
//! let settings = NotificationSettings::from_env()?;
//! let deps = NotificationDeps::from_redis(redis, &settings)?;
//! let system = NotificationSystem::init(&settings, deps)?;
//!
//! system.service().enqueue_new_event(NewEventRequest { event_id }).await?;
//! ```

pub mod alerting;
pub mod config;
pub mod error;
pub mod error_tracking;
pub mod health;
pub mod ledger;
pub mod maintenance;
pub mod metrics_collector;
pub mod models;
pub mod processor;
pub mod queues;
pub mod service;
pub mod subscriptions;
pub mod system;
pub mod targeting;
pub mod transport;

// Re-export commonly used types
pub use alerting::{Alert, AlertCondition, AlertManager, AlertRule, AlertSink};
pub use config::NotificationSettings;
pub use error::{NotificationError, NotificationResult};
pub use error_tracking::{ErrorTracker, ErrorTrackerConfig};
pub use health::health_api_router;
pub use ledger::{DeliveryLedger, InMemoryDeliveryLedger, RedisDeliveryLedger};
pub use maintenance::{Maintenance, MaintenanceReport};
pub use metrics_collector::{HealthStatus, MetricsCollector, MetricsPeriod, SystemHealth};
pub use models::{
    ChangeType, EventUpdateRequest, JobHandle, JobKind, NewEventRequest, NotificationJob,
    PushPayload, PushSubscription,
};
pub use processor::PushProcessor;
pub use queues::PushQueue;
pub use service::NotificationService;
pub use subscriptions::{InMemorySubscriptionStore, RedisSubscriptionStore, SubscriptionStore};
pub use system::{NotificationDeps, NotificationSystem};
pub use targeting::{AudienceDirectory, HttpAudienceDirectory, TargetFilter, UserTargeting};
pub use transport::{DeliveryTransport, ErrorClass, HttpPushTransport};
