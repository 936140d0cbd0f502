use once_cell::sync::Lazy;
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LeaseLogKind {
    EmptyPoll,
    DeadLeasePoll,
    DuplicateComplete,
}

impl LeaseLogKind {
    fn interval(self) -> Duration {
        match self {
            LeaseLogKind::EmptyPoll => Duration::from_secs(30),
            LeaseLogKind::DeadLeasePoll => Duration::from_secs(10),
            LeaseLogKind::DuplicateComplete => Duration::from_secs(10),
        }
    }
}

static LEASE_LOG_MEMORY: Lazy<Mutex<HashMap<(LeaseLogKind, Uuid), Instant>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// True at most once per interval for a given kind and lease.
pub fn should_log_lease_event(kind: LeaseLogKind, lease_id: Uuid) -> bool {
    let mut guard = LEASE_LOG_MEMORY
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let now = Instant::now();
    if let Some(last) = guard.get(&(kind, lease_id)) {
        if now.duration_since(*last) < kind.interval() {
            return false;
        }
    }
    guard.insert((kind, lease_id), now);
    true
}

/// Drops throttle entries for a lease that has ended.
pub fn forget_lease(lease_id: Uuid) {
    let mut guard = LEASE_LOG_MEMORY
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.retain(|(_, id), _| *id != lease_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeats_are_suppressed_per_lease() {
        let lease = Uuid::new_v4();
        let other = Uuid::new_v4();
        assert!(should_log_lease_event(LeaseLogKind::EmptyPoll, lease));
        assert!(!should_log_lease_event(LeaseLogKind::EmptyPoll, lease));
        assert!(should_log_lease_event(LeaseLogKind::EmptyPoll, other));
        assert!(should_log_lease_event(LeaseLogKind::DeadLeasePoll, lease));
        forget_lease(lease);
        assert!(should_log_lease_event(LeaseLogKind::EmptyPoll, lease));
    }
}
