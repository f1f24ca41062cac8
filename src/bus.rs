// =============================================================================
// Message Bus — in-process pub/sub with capped per-subject replay
// =============================================================================
//
// Subject naming convention (see types::subjects):
//   bar.<SYMBOL>.<TIMEFRAME>.<MARKET>
//   ind.<SYMBOL>.<TIMEFRAME>
//   sig.<STRATEGY>.<SYMBOL>
//
// Pattern language: dot-separated tokens. `*` in the middle matches exactly
// one token; a final `*` matches all remaining tokens, so `bar.BTCUSDT.*`
// matches `bar.BTCUSDT.1h.spot` and `bar.*.*.spot` matches by token.
//
// Delivery is best-effort at-most-once through a bounded per-subscriber
// channel. A full channel drops that subscriber's message (counter + warn);
// a slow subscriber never stalls the publisher or its peers. Per-subscriber
// ordering is FIFO. Every published payload is also appended to a replay log
// capped at REPLAY_CAP entries per subject.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Maximum replay-log entries retained per subject.
const REPLAY_CAP: usize = 1000;

/// Bounded capacity of each subscriber's delivery channel.
const SUBSCRIBER_CAPACITY: usize = 1024;

struct Subscriber {
    id: u64,
    pattern: String,
    tx: mpsc::Sender<(String, Value)>,
}

struct BusInner {
    subscribers: RwLock<Vec<Subscriber>>,
    replay: Mutex<HashMap<String, VecDeque<Value>>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

/// In-process message bus. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(Vec::new()),
                replay: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Publish
    // -------------------------------------------------------------------------

    /// Deliver `payload` to every live subscriber whose pattern matches
    /// `subject` and append it to the subject's replay log.
    pub fn publish(&self, subject: &str, payload: Value) {
        // Replay log first so history() sees the message even with no
        // subscribers attached.
        {
            let mut replay = self.inner.replay.lock();
            let log = replay.entry(subject.to_string()).or_default();
            log.push_back(payload.clone());
            while log.len() > REPLAY_CAP {
                log.pop_front();
            }
        }

        let mut closed: Vec<u64> = Vec::new();
        {
            let subscribers = self.inner.subscribers.read();
            for sub in subscribers.iter() {
                if !pattern_matches(&sub.pattern, subject) {
                    continue;
                }
                match sub.tx.try_send((subject.to_string(), payload.clone())) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            subject,
                            pattern = %sub.pattern,
                            "subscriber channel full, dropping message"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        closed.push(sub.id);
                    }
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.inner.subscribers.write();
            subscribers.retain(|s| !closed.contains(&s.id));
            debug!(removed = closed.len(), "pruned closed subscribers");
        }
    }

    // -------------------------------------------------------------------------
    // Subscribe
    // -------------------------------------------------------------------------

    /// Register a long-lived subscription for `pattern`.
    ///
    /// Dropping the returned [`Subscription`] cancels delivery.
    pub fn subscribe(&self, pattern: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.write().push(Subscriber {
            id,
            pattern: pattern.to_string(),
            tx,
        });
        debug!(pattern, id, "subscription registered");
        Subscription {
            id,
            inner: Arc::clone(&self.inner),
            rx,
        }
    }

    // -------------------------------------------------------------------------
    // Replay log
    // -------------------------------------------------------------------------

    /// Up to `count` recent entries for `subject`. With `reverse` the newest
    /// entry comes first, otherwise chronological order.
    pub fn history(&self, subject: &str, count: usize, reverse: bool) -> Vec<Value> {
        let replay = self.inner.replay.lock();
        let Some(log) = replay.get(subject) else {
            return Vec::new();
        };
        if reverse {
            log.iter().rev().take(count).cloned().collect()
        } else {
            let start = log.len().saturating_sub(count);
            log.iter().skip(start).cloned().collect()
        }
    }

    /// Drop the replay log for `subject`.
    pub fn clear(&self, subject: &str) {
        self.inner.replay.lock().remove(subject);
    }

    /// Total messages dropped on full subscriber channels.
    pub fn dropped_messages(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Current live subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Receiving half of one subscription. Messages arrive in publish order.
pub struct Subscription {
    id: u64,
    inner: Arc<BusInner>,
    rx: mpsc::Receiver<(String, Value)>,
}

impl Subscription {
    /// Wait for the next matching message. Returns `None` once the bus side
    /// has been removed (only happens after cancellation).
    pub async fn recv(&mut self) -> Option<(String, Value)> {
        self.rx.recv().await
    }

    /// Non-blocking variant used by drain loops.
    pub fn try_recv(&mut self) -> Option<(String, Value)> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.subscribers.write().retain(|s| s.id != self.id);
    }
}

// ---------------------------------------------------------------------------
// Pattern matching
// ---------------------------------------------------------------------------

/// Match a dot-separated `pattern` against a `subject`.
fn pattern_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.').peekable();
    let mut sub = subject.split('.').peekable();

    loop {
        match (pat.next(), sub.next()) {
            (None, None) => return true,
            (Some("*"), Some(_)) => {
                // A trailing `*` swallows the rest of the subject.
                if pat.peek().is_none() {
                    return true;
                }
            }
            (Some(p), Some(s)) if p == s => {}
            _ => return false,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pattern_matching_rules() {
        assert!(pattern_matches("bar.BTCUSDT.1h.spot", "bar.BTCUSDT.1h.spot"));
        assert!(!pattern_matches("bar.BTCUSDT.1h.spot", "bar.BTCUSDT.1h.future"));
        // Trailing wildcard swallows one or more tokens.
        assert!(pattern_matches("bar.BTCUSDT.*", "bar.BTCUSDT.1h.spot"));
        assert!(pattern_matches("bar.BTCUSDT.*", "bar.BTCUSDT.1h"));
        assert!(!pattern_matches("bar.BTCUSDT.*", "bar.ETHUSDT.1h.spot"));
        // Mid-pattern wildcard matches exactly one token.
        assert!(pattern_matches("bar.*.*.spot", "bar.BTCUSDT.1h.spot"));
        assert!(!pattern_matches("bar.*.*.spot", "bar.BTCUSDT.1h.future"));
        assert!(!pattern_matches("bar.*.*.spot", "bar.BTCUSDT.spot"));
        // Pattern longer than subject never matches.
        assert!(!pattern_matches("bar.BTCUSDT.1h.spot", "bar.BTCUSDT.1h"));
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscriber() {
        let bus = MessageBus::new();
        let mut sub = bus.subscribe("bar.BTCUSDT.*");

        bus.publish("bar.BTCUSDT.1h.spot", json!({"close": 100.0}));
        bus.publish("bar.ETHUSDT.1h.spot", json!({"close": 2000.0}));

        let (subject, payload) = sub.recv().await.unwrap();
        assert_eq!(subject, "bar.BTCUSDT.1h.spot");
        assert_eq!(payload["close"], 100.0);
        // The ETH message must not have been delivered.
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn per_subscriber_ordering_preserved() {
        let bus = MessageBus::new();
        let mut sub = bus.subscribe("ind.BTCUSDT.1h");

        for i in 0..10 {
            bus.publish("ind.BTCUSDT.1h", json!({ "seq": i }));
        }
        for i in 0..10 {
            let (_, payload) = sub.recv().await.unwrap();
            assert_eq!(payload["seq"], i);
        }
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned() {
        let bus = MessageBus::new();
        {
            let _sub = bus.subscribe("sig.*");
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
        // Publishing after the drop must not panic or deliver anywhere.
        bus.publish("sig.dual_ma.BTCUSDT", json!({}));
    }

    #[tokio::test]
    async fn full_subscriber_does_not_block_peers() {
        let bus = MessageBus::new();
        let mut stalled = bus.subscribe("x.*");
        let mut healthy = bus.subscribe("x.*");

        // Overfill the stalled subscriber's channel.
        for i in 0..(SUBSCRIBER_CAPACITY + 10) {
            bus.publish("x.y", json!({ "seq": i }));
        }
        assert!(bus.dropped_messages() >= 10);

        // The healthy subscriber saw the first CAPACITY messages in order.
        let (_, first) = healthy.recv().await.unwrap();
        assert_eq!(first["seq"], 0);
        let (_, second) = stalled.recv().await.unwrap();
        assert_eq!(second["seq"], 0);
    }

    #[test]
    fn replay_log_capped_and_ordered() {
        let bus = MessageBus::new();
        for i in 0..(REPLAY_CAP + 50) {
            bus.publish("bar.BTCUSDT.1h.spot", json!({ "seq": i }));
        }

        let chrono = bus.history("bar.BTCUSDT.1h.spot", 5, false);
        let newest_first = bus.history("bar.BTCUSDT.1h.spot", 5, true);

        let last = (REPLAY_CAP + 49) as i64;
        assert_eq!(chrono.last().unwrap()["seq"], last);
        assert_eq!(newest_first.first().unwrap()["seq"], last);

        // Log was trimmed to the cap.
        let full = bus.history("bar.BTCUSDT.1h.spot", REPLAY_CAP * 2, false);
        assert_eq!(full.len(), REPLAY_CAP);
        assert_eq!(full.first().unwrap()["seq"], 50);
    }

    #[test]
    fn clear_removes_history() {
        let bus = MessageBus::new();
        bus.publish("a.b", json!(1));
        assert_eq!(bus.history("a.b", 10, false).len(), 1);
        bus.clear("a.b");
        assert!(bus.history("a.b", 10, false).is_empty());
    }
}
