use std::thread;
use std::time::{Duration, Instant};

use topic_coordinator::{LocalCluster, MemberId, ProtocolTier, ServiceConfig, SubscriberGroupId, TopicConfig};

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

fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn raise_from_non_senior_reaches_every_member() {
    let cluster = LocalCluster::new(13, config());
    let services = cluster.start_members(3).expect("members");
    let client = &services[2];
    client.ensure_topic("orders").expect("topic");
    assert_eq!(client.channel_count("orders"), 6);

    let count = client.ensure_channel_count("orders", 10, 10).expect("raise");
    assert_eq!(count, 10);
    for service in &services {
        assert_eq!(service.channel_count("orders"), 10);
    }

    let senior = cluster.senior().expect("senior");
    assert_eq!(cluster.suspend_count(senior), 1);
    assert_eq!(cluster.resume_count(senior), 1);
}

#[test]
fn raise_publishes_topic_the_senior_never_registered() {
    // The senior runs with the default count; only the client knows "orders".
    let senior_config = ServiceConfig {
        request_timeout_ms: 5_000,
        ..ServiceConfig::default()
    };
    let cluster = LocalCluster::new(7, config());
    let senior = cluster
        .start_member_with_config(ProtocolTier::CURRENT, true, senior_config.clone())
        .expect("senior");
    let client = cluster.start_member(ProtocolTier::CURRENT, true).expect("client");
    assert_eq!(client.channel_count("orders"), 6);
    assert_eq!(senior.channel_count("orders"), senior_config.default_channel_count);

    let count = client
        .ensure_channel_count_with_timeout("orders", 10, 10, Duration::from_millis(1_500))
        .expect("raise");
    assert_eq!(count, senior_config.default_channel_count.max(10));
    assert_eq!(senior.channel_count("orders"), count);
    assert_eq!(client.channel_count("orders"), count);
}

#[test]
fn lower_or_equal_request_is_a_no_op() {
    let cluster = LocalCluster::new(7, config());
    let services = cluster.start_members(2).expect("members");
    services[1].ensure_topic("orders").expect("topic");

    assert_eq!(services[1].ensure_channel_count("orders", 4, 4).expect("lower"), 6);
    assert_eq!(services[1].ensure_channel_count("orders", 6, 12).expect("equal"), 6);
    assert_eq!(cluster.suspend_count(MemberId(1)), 0);
}

#[test]
fn total_above_required_is_honoured() {
    let cluster = LocalCluster::new(7, config());
    let services = cluster.start_members(2).expect("members");
    services[1].ensure_topic("orders").expect("topic");
    assert_eq!(services[1].ensure_channel_count("orders", 8, 12).expect("raise"), 12);
}

#[test]
fn concurrent_raises_never_regress() {
    let cluster = LocalCluster::new(13, config());
    let services = cluster.start_members(3).expect("members");
    services[0].ensure_topic("orders").expect("topic");

    let high = services[1].clone();
    let low = services[2].clone();
    let high = thread::spawn(move || high.ensure_channel_count("orders", 10, 10));
    let low = thread::spawn(move || low.ensure_channel_count("orders", 8, 8));
    let high = high.join().expect("high thread").expect("high raise");
    let low = low.join().expect("low thread").expect("low raise");

    assert_eq!(high, 10);
    assert!(low >= 8, "low raise observed {low}");
    for service in &services {
        assert_eq!(service.channel_count("orders"), 10);
    }
    // Once 10 is published, a request for 8 returns 10.
    assert_eq!(services[2].ensure_channel_count("orders", 8, 8).expect("late"), 10);
}

#[test]
fn raise_reallocates_existing_subscriptions() {
    let cluster = LocalCluster::new(13, config());
    let services = cluster.start_members(2).expect("members");
    let a = services[0].new_subscriber_id();
    let b = services[1].new_subscriber_id();
    let group = SubscriberGroupId::durable("billing");
    let id = services[0]
        .ensure_subscription("orders", group.clone(), Some(a), None, None)
        .expect("a");
    services[1]
        .ensure_subscription("orders", group, Some(b), None, None)
        .expect("b");

    services[1].ensure_channel_count("orders", 9, 9).expect("raise");
    eventually("reallocation to replicate", || {
        services.iter().all(|s| {
            s.get_subscription(id)
                .is_some_and(|sub| sub.allocation.channel_count() == 9)
        })
    });
    let sub = services[1].get_subscription(id).expect("subscription");
    let mut channels = sub.allocation.channels_of(&a);
    channels.extend(sub.allocation.channels_of(&b));
    channels.sort_unstable();
    assert_eq!(channels, (0..9).collect::<Vec<_>>());
}
