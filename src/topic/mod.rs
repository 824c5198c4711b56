//! Topic matching and the cross-session subscription index
//!
//! Filters are validated and matched per the MQTT v5.0 topic rules. The index
//! is a topic trie holding, per filter, every session subscribed to it; shared
//! subscriptions live in the same trie tagged with their group.

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{
    is_wildcard_filter, topic_matches_filter, validate_topic_filter, validate_topic_name,
};

use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::protocol::QoS;

/// A subscription entry in the index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub client_id: Arc<str>,
    /// Filter without any `$share/{group}/` prefix
    pub filter: Arc<str>,
    /// Maximum QoS granted
    pub qos: QoS,
    /// Don't deliver messages published by the subscribing client
    pub no_local: bool,
    /// Forward the retain flag as published
    pub retain_as_published: bool,
    pub subscription_id: Option<u32>,
    /// Share group name for `$share/{group}/{filter}`
    pub share_group: Option<Arc<str>>,
}

/// Split a shared subscription filter into `(group, filter)`
pub fn parse_shared_subscription(filter: &str) -> Option<(&str, &str)> {
    let rest = filter.strip_prefix("$share/")?;
    let (group, actual) = rest.split_once('/')?;
    if group.is_empty() || actual.is_empty() {
        return None;
    }
    Some((group, actual))
}

type ShareKey = (Arc<str>, Arc<str>);

/// Thread-safe subscription index
pub struct SubscriptionStore {
    trie: RwLock<TopicTrie<Vec<Subscription>>>,
    /// Round-robin cursor per (group, filter)
    share_counters: DashMap<ShareKey, AtomicUsize>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(TopicTrie::new()),
            share_counters: DashMap::new(),
        }
    }

    /// Add or replace the subscription of `subscription.client_id` to `filter`.
    ///
    /// `filter` may carry a `$share/{group}/` prefix. Returns true when the
    /// client already held this exact subscription.
    pub fn subscribe(&self, filter: &str, mut subscription: Subscription) -> bool {
        let actual = match parse_shared_subscription(filter) {
            Some((group, actual)) => {
                subscription.share_group = Some(group.into());
                actual
            }
            None => {
                subscription.share_group = None;
                filter
            }
        };
        subscription.filter = actual.into();

        let mut trie = self.trie.write();
        let subs = trie.get_or_default(actual);
        let before = subs.len();
        subs.retain(|s| {
            !(s.client_id == subscription.client_id && s.share_group == subscription.share_group)
        });
        let existed = subs.len() != before;
        subs.push(subscription);
        existed
    }

    /// Remove one subscription; returns false when none existed
    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> bool {
        let (actual, group) = match parse_shared_subscription(filter) {
            Some((group, actual)) => (actual, Some(group)),
            None => (filter, None),
        };

        let mut trie = self.trie.write();
        let Some(subs) = trie.get_mut(actual) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| !(s.client_id.as_ref() == client_id && s.share_group.as_deref() == group));
        let removed = subs.len() != before;
        if subs.is_empty() {
            trie.remove(actual);
            if let Some(group) = group {
                self.share_counters
                    .remove(&(Arc::from(group), Arc::from(actual)));
            }
        }
        removed
    }

    /// Remove every subscription held by a client
    pub fn unsubscribe_all(&self, client_id: &str) {
        let mut trie = self.trie.write();
        trie.remove_by_predicate(|subs| {
            subs.retain(|s| s.client_id.as_ref() != client_id);
            subs.is_empty()
        });
    }

    /// All subscriptions matching `topic`, with each shared group reduced to
    /// one member chosen round-robin.
    pub fn matches(&self, topic: &str) -> SmallVec<[Subscription; 16]> {
        let trie = self.trie.read();
        let mut result: SmallVec<[Subscription; 16]> = SmallVec::new();
        let mut groups: AHashMap<ShareKey, SmallVec<[Subscription; 4]>> = AHashMap::new();

        trie.matches(topic, |subs| {
            for sub in subs {
                match sub.share_group {
                    Some(ref group) => groups
                        .entry((group.clone(), sub.filter.clone()))
                        .or_default()
                        .push(sub.clone()),
                    None => result.push(sub.clone()),
                }
            }
        });

        for (key, mut members) in groups {
            let idx = self
                .share_counters
                .entry(key)
                .or_insert_with(|| AtomicUsize::new(0))
                .fetch_add(1, Ordering::Relaxed)
                % members.len();
            result.push(members.swap_remove(idx));
        }

        result
    }

    /// Number of filters with at least one subscriber
    pub fn filter_count(&self) -> usize {
        self.trie.read().len()
    }

    /// Total subscriptions, shared members included
    pub fn subscription_count(&self) -> usize {
        let mut count = 0;
        self.trie.read().for_each(|subs| count += subs.len());
        count
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}
