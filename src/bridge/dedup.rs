use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How long a handled request id is remembered.
pub const HANDLED_ID_TTL: Duration = Duration::from_secs(5 * 60);

/// Request ids already acted on. The same request may arrive once per transport.
pub struct HandledIds {
    ttl: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl Default for HandledIds {
    fn default() -> Self {
        Self::new(HANDLED_ID_TTL)
    }
}

impl HandledIds {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// True exactly once per id within the TTL window.
    pub fn first_delivery(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        seen.retain(|_, at| now.duration_since(*at) <= self.ttl);
        if seen.contains_key(id) {
            return false;
        }
        seen.insert(id.to_string(), now);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_delivery_is_rejected() {
        let ids = HandledIds::default();
        assert!(ids.first_delivery("a"));
        assert!(!ids.first_delivery("a"));
        assert!(ids.first_delivery("b"));
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_expired_ids_are_forgotten() {
        let ids = HandledIds::new(Duration::from_millis(10));
        assert!(ids.first_delivery("a"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(ids.first_delivery("a"));
        assert_eq!(ids.len(), 1);
    }
}
