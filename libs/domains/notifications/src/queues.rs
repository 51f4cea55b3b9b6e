//! Queue definitions for the notifications domain.

use job_queue::QueueDef;

/// Push notification job queue.
///
/// The key prefix can be overridden per deployment with
/// `NOTIFICATIONS_QUEUE_PREFIX`; these are the defaults.
pub struct PushQueue;

impl QueueDef for PushQueue {
    const QUEUE_NAME: &'static str = "notifications";

    const LEASE_MS: u64 = 60_000;

    const MAX_ATTEMPTS: u32 = 3;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_queue_def() {
        assert_eq!(PushQueue::queue_name(), "notifications");
        assert_eq!(PushQueue::MAX_ATTEMPTS, 3);
        assert_eq!(PushQueue::POLL_INTERVAL_MS, 500);
    }
}
