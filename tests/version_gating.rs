use std::thread;
use std::time::Duration;

use topic_coordinator::{LocalCluster, ProtocolTier, ServiceConfig, SubscriberGroupId, SubscriptionId, TopicConfig};

fn config() -> ServiceConfig {
    let mut config = ServiceConfig {
        request_timeout_ms: 5_000,
        ..ServiceConfig::default()
    };
    config.topics.insert(
        "orders".into(),
        TopicConfig {
            channel_count: Some(6),
        },
    );
    config
}

#[test]
fn legacy_senior_answers_not_compatible() {
    let cluster = LocalCluster::new(7, config());
    let senior = cluster.start_member(ProtocolTier::Legacy, true).expect("legacy senior");
    let member = cluster.start_member(ProtocolTier::CURRENT, true).expect("member");
    member.ensure_topic("orders").expect("topics predate the tiers");

    let group = SubscriberGroupId::durable("billing");
    let id = member
        .ensure_subscription("orders", group.clone(), Some(member.new_subscriber_id()), None, None)
        .expect("not an error");
    assert_eq!(id, SubscriptionId::NOT_COMPATIBLE);
    assert!(member.subscription_id("orders", &group).is_none());

    let own = senior
        .ensure_subscription("orders", group, None, None, None)
        .expect("senior path");
    assert!(own.is_not_compatible());

    assert_eq!(member.ensure_channel_count("orders", 10, 10).expect("fallback"), 6);
    assert_eq!(senior.channel_count("orders"), 6);
}

#[test]
fn channel_count_tier_senior_still_raises_counts() {
    let cluster = LocalCluster::new(7, config());
    let _senior = cluster.start_member(ProtocolTier::ChannelCount, true).expect("senior");
    let member = cluster.start_member(ProtocolTier::CURRENT, true).expect("member");
    member.ensure_topic("orders").expect("topic");

    assert_eq!(member.ensure_channel_count("orders", 10, 10).expect("raise"), 10);
    let id = member
        .ensure_subscription("orders", SubscriberGroupId::durable("billing"), None, None, None)
        .expect("subscription");
    assert!(id.is_not_compatible());
}

#[test]
fn legacy_storage_member_degrades_confirmation() {
    let cluster = LocalCluster::new(7, config());
    let senior = cluster.start_member(ProtocolTier::CURRENT, true).expect("senior");
    let legacy = cluster.start_member(ProtocolTier::Legacy, true).expect("legacy storage");
    let id = senior
        .ensure_subscription("orders", SubscriberGroupId::durable("billing"), None, None, None)
        .expect("assumed confirmed");
    assert!(!id.is_not_compatible());
    assert!(senior.get_subscription(id).is_some());

    // Subscription entries are only replicated to members that understand them.
    thread::sleep(Duration::from_millis(100));
    assert!(legacy.get_subscription(id).is_none());
    assert!(legacy.config_map().subscription_by_id(id).is_none());

    senior.ensure_topic("orders").expect("topic");
    assert_eq!(senior.ensure_channel_count("orders", 9, 9).expect("raise"), 9);
}
