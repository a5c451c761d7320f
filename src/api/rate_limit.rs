use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Endpoint classes with independent rate budgets. A 429 on one class never
/// blocks the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Account,
    EventStream,
    GameStream,
    GameAction,
    Challenge,
    Chat,
}

const DEFAULT_PENALTY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct RateBudget {
    next_permitted: Instant,
    consecutive_failures: u32,
}

/// Per-class budgets, owned by the client and touched from every request
/// path, so the map sits behind a mutex. The lock is never held across an
/// await; callers get a wait duration back and sleep outside it.
pub struct RateLimiter {
    budgets: Mutex<HashMap<EndpointClass, RateBudget>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter {
            budgets: Mutex::new(HashMap::new()),
        }
    }

    /// How long the caller must wait before touching this class, if at all.
    pub fn delay_for(&self, class: EndpointClass) -> Option<Duration> {
        let budgets = self.budgets.lock().unwrap();
        let budget = budgets.get(&class)?;
        let now = Instant::now();
        if budget.next_permitted > now {
            Some(budget.next_permitted - now)
        } else {
            None
        }
    }

    /// Record a 429. The Retry-After hint wins; without one a fixed penalty
    /// applies.
    pub fn note_rate_limited(&self, class: EndpointClass, retry_after: Option<Duration>) {
        let penalty = retry_after.unwrap_or(DEFAULT_PENALTY);
        let mut budgets = self.budgets.lock().unwrap();
        let entry = budgets.entry(class).or_insert(RateBudget {
            next_permitted: Instant::now(),
            consecutive_failures: 0,
        });
        entry.next_permitted = Instant::now() + penalty;
        entry.consecutive_failures += 1;
    }

    pub fn note_success(&self, class: EndpointClass) {
        let mut budgets = self.budgets.lock().unwrap();
        if let Some(entry) = budgets.get_mut(&class) {
            entry.consecutive_failures = 0;
        }
    }

    pub fn consecutive_failures(&self, class: EndpointClass) -> u32 {
        let budgets = self.budgets.lock().unwrap();
        budgets
            .get(&class)
            .map(|b| b.consecutive_failures)
            .unwrap_or(0)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        RateLimiter::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_class_has_no_delay() {
        let limiter = RateLimiter::new();
        assert!(limiter.delay_for(EndpointClass::GameAction).is_none());
    }

    #[test]
    fn test_retry_after_hint_sets_the_budget() {
        let limiter = RateLimiter::new();
        limiter.note_rate_limited(EndpointClass::GameAction, Some(Duration::from_secs(30)));

        let delay = limiter.delay_for(EndpointClass::GameAction).unwrap();
        assert!(delay > Duration::from_secs(29));
        assert!(delay <= Duration::from_secs(30));
    }

    #[test]
    fn test_missing_hint_applies_fixed_penalty() {
        let limiter = RateLimiter::new();
        limiter.note_rate_limited(EndpointClass::Chat, None);

        let delay = limiter.delay_for(EndpointClass::Chat).unwrap();
        assert!(delay > Duration::from_secs(59));
        assert!(delay <= Duration::from_secs(60));
    }

    #[test]
    fn test_classes_are_independent() {
        let limiter = RateLimiter::new();
        limiter.note_rate_limited(EndpointClass::GameAction, None);
        assert!(limiter.delay_for(EndpointClass::Challenge).is_none());
        assert!(limiter.delay_for(EndpointClass::EventStream).is_none());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let limiter = RateLimiter::new();
        limiter.note_rate_limited(EndpointClass::Chat, None);
        limiter.note_rate_limited(EndpointClass::Chat, None);
        assert_eq!(limiter.consecutive_failures(EndpointClass::Chat), 2);

        limiter.note_success(EndpointClass::Chat);
        assert_eq!(limiter.consecutive_failures(EndpointClass::Chat), 0);
    }
}
