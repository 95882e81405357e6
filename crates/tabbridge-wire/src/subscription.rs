//! Broker subscription table.
//!
//! A subscription is keyed by `(target, eventPath)`. It has at most one
//! receiver (the agent session serving it) and a set of subscriber client
//! sessions. Subscriptions outlive their receiver so a reconnecting agent can
//! pick them up again.

use crate::session::SessionId;
use std::collections::{BTreeSet, HashMap};
use tabbridge_types::{PathSegment, Target};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub target: Target,
    pub event_path: Vec<PathSegment>,
}

#[derive(Debug, Default)]
pub struct Subscription {
    pub receiver: Option<SessionId>,
    pub subscribers: BTreeSet<SessionId>,
}

/// A subscription that lost its last subscriber.
#[derive(Debug, PartialEq, Eq)]
pub struct Removed {
    pub event_path: Vec<PathSegment>,
    pub receiver: Option<SessionId>,
}

#[derive(Debug, Default)]
pub struct SubscriptionTable {
    subs: HashMap<SubscriptionKey, Subscription>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    pub fn get(&self, key: &SubscriptionKey) -> Option<&Subscription> {
        self.subs.get(key)
    }

    /// Add `client` to the subscription at `key`, creating it if needed.
    ///
    /// `resolve_receiver` is consulted when the subscription has no receiver.
    /// Returns the receiver to notify when this call added the first
    /// subscriber or attached a receiver to a subscription that already had
    /// subscribers.
    pub fn subscribe(
        &mut self,
        key: SubscriptionKey,
        client: SessionId,
        resolve_receiver: impl FnOnce() -> Option<SessionId>,
    ) -> Option<SessionId> {
        let sub = self.subs.entry(key).or_default();
        let was_empty = sub.subscribers.is_empty();
        let added = sub.subscribers.insert(client);
        let mut attached = false;
        if sub.receiver.is_none() {
            sub.receiver = resolve_receiver();
            attached = sub.receiver.is_some();
        }
        if (added && was_empty) || attached {
            sub.receiver
        } else {
            None
        }
    }

    /// Remove `client` from the subscription at `key`. Returns the removed
    /// subscription when that was its last subscriber.
    pub fn unsubscribe(&mut self, key: &SubscriptionKey, client: SessionId) -> Option<Removed> {
        let sub = self.subs.get_mut(key)?;
        if !sub.subscribers.remove(&client) || !sub.subscribers.is_empty() {
            return None;
        }
        let receiver = sub.receiver;
        self.subs.remove(key);
        Some(Removed {
            event_path: key.event_path.clone(),
            receiver,
        })
    }

    /// Prune `client` from every subscription.
    pub fn remove_client(&mut self, client: SessionId) -> Vec<Removed> {
        let keys: Vec<SubscriptionKey> = self
            .subs
            .iter()
            .filter(|(_, sub)| sub.subscribers.contains(&client))
            .map(|(key, _)| key.clone())
            .collect();
        keys.iter()
            .filter_map(|key| self.unsubscribe(key, client))
            .collect()
    }

    /// Mark every subscription served by `agent` as receiver-less.
    pub fn detach_receiver(&mut self, agent: SessionId) -> usize {
        let mut detached = 0;
        for sub in self.subs.values_mut() {
            if sub.receiver == Some(agent) {
                sub.receiver = None;
                detached += 1;
            }
        }
        detached
    }

    /// Attach `agent` to every receiver-less subscription whose target it
    /// satisfies. Returns the event paths to subscribe the agent to.
    pub fn reattach(
        &mut self,
        agent: SessionId,
        matches: impl Fn(&Target) -> bool,
    ) -> Vec<Vec<PathSegment>> {
        let mut paths = Vec::new();
        for (key, sub) in self.subs.iter_mut() {
            if sub.receiver.is_none() && matches(&key.target) {
                sub.receiver = Some(agent);
                paths.push(key.event_path.clone());
            }
        }
        paths
    }

    /// Clients subscribed to `event_path` on subscriptions served by `agent`.
    pub fn subscribers_for(&self, agent: SessionId, event_path: &[PathSegment]) -> BTreeSet<SessionId> {
        self.subs
            .iter()
            .filter(|(key, sub)| sub.receiver == Some(agent) && key.event_path == event_path)
            .flat_map(|(_, sub)| sub.subscribers.iter().copied())
            .collect()
    }

    pub fn clear(&mut self) {
        self.subs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabbridge_types::AgentKind;

    fn key(path: &str) -> SubscriptionKey {
        SubscriptionKey {
            target: Target::agent(AgentKind::Chrome, Some("work")),
            event_path: tabbridge_types::request::parse_path(path),
        }
    }

    const AGENT: SessionId = SessionId(1);
    const C1: SessionId = SessionId(10);
    const C2: SessionId = SessionId(11);

    #[test]
    fn test_first_subscriber_notifies_once() {
        let mut table = SubscriptionTable::new();
        assert_eq!(table.subscribe(key("tabs.onUpdated"), C1, || Some(AGENT)), Some(AGENT));
        assert_eq!(table.subscribe(key("tabs.onUpdated"), C2, || Some(AGENT)), None);
        assert_eq!(table.subscribe(key("tabs.onUpdated"), C2, || Some(AGENT)), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_last_unsubscribe_removes() {
        let mut table = SubscriptionTable::new();
        table.subscribe(key("e"), C1, || Some(AGENT));
        table.subscribe(key("e"), C2, || Some(AGENT));
        assert_eq!(table.unsubscribe(&key("e"), C1), None);
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.unsubscribe(&key("e"), C2),
            Some(Removed {
                event_path: vec!["e".into()],
                receiver: Some(AGENT)
            })
        );
        assert!(table.is_empty());
        assert_eq!(table.unsubscribe(&key("e"), C2), None);
    }

    #[test]
    fn test_receiverless_subscription_reattaches() {
        let mut table = SubscriptionTable::new();
        assert_eq!(table.subscribe(key("e"), C1, || None), None);
        assert_eq!(table.subscribers_for(AGENT, &["e".into()]).len(), 0);

        let paths = table.reattach(AGENT, |t| t.matches_agent(AgentKind::Chrome, Some("work")));
        assert_eq!(paths, vec![vec![PathSegment::from("e")]]);
        assert!(table.subscribers_for(AGENT, &["e".into()]).contains(&C1));

        assert_eq!(table.detach_receiver(AGENT), 1);
        assert_eq!(table.get(&key("e")).unwrap().receiver, None);
    }

    #[test]
    fn test_remove_client_prunes_everywhere() {
        let mut table = SubscriptionTable::new();
        table.subscribe(key("a"), C1, || Some(AGENT));
        table.subscribe(key("b"), C1, || Some(AGENT));
        table.subscribe(key("b"), C2, || Some(AGENT));
        let removed = table.remove_client(C1);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].event_path, vec![PathSegment::from("a")]);
        assert_eq!(table.len(), 1);
    }
}
