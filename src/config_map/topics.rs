use std::collections::BTreeSet;

use super::{ConfigKey, ConfigMap, ConfigValue, TopicInfo};
use crate::model::{SubscriberGroupId, SubscriberId, Subscription, SubscriptionId, SubscriptionKey};

/// Typed queries over the topic and subscription entries.
impl ConfigMap {
    pub fn topic_info(&self, topic: &str) -> Option<TopicInfo> {
        match self.get(&ConfigKey::Topic(topic.to_string())) {
            Some(ConfigValue::Topic(info)) => Some(info),
            _ => None,
        }
    }

    /// Published channel count, if the topic has been registered.
    pub fn channel_count(&self, topic: &str) -> Option<u32> {
        self.topic_info(topic).map(|info| info.channel_count)
    }

    pub fn set_channel_count(&self, topic: &str, channel_count: u32) -> bool {
        self.put(
            ConfigKey::Topic(topic.to_string()),
            ConfigValue::Topic(TopicInfo { channel_count }),
        )
    }

    /// Topics with a registered info entry or at least one subscription.
    pub fn topic_names(&self) -> BTreeSet<String> {
        self.entries_where(|key, _| !matches!(key, ConfigKey::Other(_)))
            .into_iter()
            .filter_map(|(key, _)| match key {
                ConfigKey::Topic(name) => Some(name),
                ConfigKey::Subscription(key) => Some(key.topic),
                ConfigKey::Other(_) => None,
            })
            .collect()
    }

    pub fn subscription(&self, key: &SubscriptionKey) -> Option<Subscription> {
        match self.get(&ConfigKey::Subscription(key.clone())) {
            Some(ConfigValue::Subscription(sub)) => Some(sub),
            _ => None,
        }
    }

    pub fn subscription_by_id(&self, id: SubscriptionId) -> Option<Subscription> {
        self.subscriptions(None).into_iter().find(|sub| sub.id == id)
    }

    pub fn subscription_id(&self, topic: &str, group: &SubscriberGroupId) -> Option<SubscriptionId> {
        self.subscription(&SubscriptionKey::new(topic, group.clone()))
            .map(|sub| sub.id)
    }

    pub fn has_subscription(&self, id: SubscriptionId) -> bool {
        self.subscription_by_id(id).is_some()
    }

    /// All subscriptions, or only those of `topic`.
    pub fn subscriptions(&self, topic: Option<&str>) -> Vec<Subscription> {
        self.entries_where(|key, _| match (key, topic) {
            (ConfigKey::Subscription(key), Some(topic)) => key.topic == topic,
            (ConfigKey::Subscription(_), None) => true,
            _ => false,
        })
        .into_iter()
        .filter_map(|(_, value)| match value {
            ConfigValue::Subscription(sub) => Some(sub),
            _ => None,
        })
        .collect()
    }

    pub fn subscriber_groups(&self, topic: &str) -> BTreeSet<SubscriberGroupId> {
        self.subscriptions(Some(topic))
            .into_iter()
            .map(|sub| sub.key.group)
            .collect()
    }

    pub fn subscribers(&self, topic: &str, group: &SubscriberGroupId) -> BTreeSet<SubscriberId> {
        self.subscription(&SubscriptionKey::new(topic, group.clone()))
            .map(|sub| sub.subscribers)
            .unwrap_or_default()
    }

    pub fn update_subscription(&self, subscription: &Subscription) -> bool {
        self.put(
            ConfigKey::Subscription(subscription.key.clone()),
            ConfigValue::Subscription(subscription.clone()),
        )
    }

    pub fn remove_subscription(&self, key: &SubscriptionKey) -> Option<Subscription> {
        match self.remove(&ConfigKey::Subscription(key.clone())) {
            Some(ConfigValue::Subscription(sub)) => Some(sub),
            _ => None,
        }
    }

    /// Removes the topic entry and every subscription of the topic.
    pub fn remove_topic(&self, topic: &str) -> Vec<Subscription> {
        let removed: Vec<Subscription> = self
            .subscriptions(Some(topic))
            .iter()
            .filter_map(|sub| self.remove_subscription(&sub.key))
            .collect();
        self.remove(&ConfigKey::Topic(topic.to_string()));
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemberId;

    fn subscription(topic: &str, group: &str, id: i64) -> Subscription {
        Subscription::new(
            SubscriptionId(id),
            SubscriptionKey::new(topic, SubscriberGroupId::durable(group)),
            None,
            None,
        )
    }

    #[test]
    fn subscription_queries() {
        let map = ConfigMap::standalone();
        map.set_channel_count("orders", 6);
        let mut billing = subscription("orders", "billing", 11);
        billing.add_subscribers(&[SubscriberId::new(1, MemberId(2))]);
        map.update_subscription(&billing);
        map.update_subscription(&subscription("orders", "audit", 12));
        map.update_subscription(&subscription("trades", "audit", 13));

        assert_eq!(map.channel_count("orders"), Some(6));
        assert_eq!(map.channel_count("trades"), None);
        assert_eq!(map.subscriber_groups("orders").len(), 2);
        assert_eq!(
            map.subscription_id("orders", &SubscriberGroupId::durable("billing")),
            Some(SubscriptionId(11))
        );
        assert!(map.has_subscription(SubscriptionId(13)));
        assert_eq!(map.subscribers("orders", &SubscriberGroupId::durable("billing")).len(), 1);
        assert_eq!(
            map.topic_names().into_iter().collect::<Vec<_>>(),
            vec!["orders".to_string(), "trades".to_string()]
        );
    }

    #[test]
    fn remove_topic_drops_its_subscriptions() {
        let map = ConfigMap::standalone();
        map.set_channel_count("orders", 6);
        map.update_subscription(&subscription("orders", "billing", 11));
        map.update_subscription(&subscription("trades", "audit", 13));

        let removed = map.remove_topic("orders");
        assert_eq!(removed.len(), 1);
        assert!(map.channel_count("orders").is_none());
        assert_eq!(map.subscriptions(None).len(), 1);
    }
}
