use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use topic_coordinator::cluster::local::RegistrarEvent;
use topic_coordinator::{
    Error, Filter, LocalCluster, ServiceConfig, SubscriberGroupId, Subscription, SubscriptionId,
    SubscriptionKey, SubscriptionListener, TopicConfig,
};

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
fn repeated_create_returns_the_same_id() {
    let cluster = LocalCluster::new(13, config());
    let services = cluster.start_members(3).expect("members");
    let client = &services[2];
    let billing = SubscriberGroupId::durable("billing");
    let subscriber = client.new_subscriber_id();

    let first = client
        .ensure_subscription("orders", billing.clone(), Some(subscriber), None, None)
        .expect("first ensure");
    let second = client
        .ensure_subscription("orders", billing.clone(), Some(subscriber), None, None)
        .expect("second ensure");
    assert_eq!(first, second);
    assert!(!first.is_not_compatible());

    // The barrier returned, so every storage member has applied it.
    for service in &services {
        let sub = service.get_subscription(first).expect("subscription on every member");
        assert_eq!(sub.subscribers.len(), 1);
        assert!(sub.has_subscriber(&subscriber));
        assert_eq!(sub.allocation.channel_count(), 6);
        assert_eq!(sub.allocation.channels_of(&subscriber), vec![0, 1, 2, 3, 4, 5]);
    }
}

#[test]
fn conflicting_filter_is_rejected_and_filter_kept() {
    let cluster = LocalCluster::new(13, config());
    let services = cluster.start_members(3).expect("members");
    let billing = SubscriberGroupId::durable("billing");

    let id = services[1]
        .ensure_subscription("orders", billing.clone(), None, None, None)
        .expect("create");

    // Rejected by the local pre-check.
    let err = services[1]
        .ensure_subscription("orders", billing.clone(), None, Some(Filter::from("amount > 10")), None)
        .expect_err("local conflict");
    assert!(matches!(err, Error::Conflict { .. }), "{err}");
    assert!(!err.is_retryable());

    // A member joining later learns the group from the welcome snapshot.
    let late = cluster.start_member(topic_coordinator::ProtocolTier::CURRENT, true).expect("late member");
    let err = late
        .ensure_subscription("orders", billing.clone(), None, Some(Filter::from("region = 'EU'")), None)
        .expect_err("remote conflict");
    assert!(matches!(err, Error::Conflict { ref key } if key == &SubscriptionKey::new("orders", billing.clone())));

    for service in services.iter().chain(std::iter::once(&late)) {
        let sub = service.get_subscription(id).expect("subscription");
        assert_eq!(sub.filter, None);
    }
    assert_eq!(late.subscription_id("orders", &billing), Some(id));
}

#[test]
fn removing_one_subscriber_keeps_the_group() {
    let cluster = LocalCluster::new(13, config());
    let services = cluster.start_members(2).expect("members");
    let group = SubscriberGroupId::durable("audit");
    let a = services[0].new_subscriber_id();
    let b = services[1].new_subscriber_id();

    let id = services[0]
        .ensure_subscription("orders", group.clone(), Some(a), None, None)
        .expect("a");
    services[1].ensure_subscriber("orders", id, b).expect("b");
    assert_eq!(services[0].subscribers("orders", &group).len(), 2);

    services[1].destroy_subscription(id, Some(b)).expect("remove b");
    eventually("b to leave on every member", || {
        services.iter().all(|s| {
            s.get_subscription(id)
                .is_some_and(|sub| sub.subscribers.len() == 1 && sub.has_subscriber(&a))
        })
    });
    let sub = services[1].get_subscription(id).expect("group kept");
    assert_eq!(sub.allocation.channels_of(&a).len(), 6);
    assert!(!services[1].is_subscription_destroyed(id));
}

#[test]
fn destroyed_subscription_is_never_recreated_under_its_id() {
    let cluster = LocalCluster::new(13, config());
    let services = cluster.start_members(3).expect("members");
    let group = SubscriberGroupId::durable("reports");

    let id = services[2]
        .ensure_subscription("orders", group.clone(), Some(services[2].new_subscriber_id()), None, None)
        .expect("create");
    services[2].destroy_subscription(id, None).expect("destroy");
    eventually("destroy to reach every member", || {
        services.iter().all(|s| s.is_subscription_destroyed(id) && !s.has_subscription(id))
    });

    let err = services[1]
        .ensure_subscriber("orders", id, services[1].new_subscriber_id())
        .expect_err("destroyed id");
    assert!(matches!(err, Error::SubscriptionDestroyed(gone) if gone == id), "{err}");

    // Destroying again is harmless.
    services[0].destroy_subscription(id, None).expect("second destroy");

    let recreated = services[2]
        .ensure_subscription("orders", group, None, None, None)
        .expect("recreate");
    assert_ne!(recreated, id);
}

#[test]
fn unknown_subscription_id_is_invalid() {
    let cluster = LocalCluster::new(5, config());
    let services = cluster.start_members(2).expect("members");
    let bogus = SubscriptionId(0x7_0000_0042);
    let err = services[1]
        .ensure_subscriber("orders", bogus, services[1].new_subscriber_id())
        .expect_err("invalid id");
    assert!(matches!(err, Error::InvalidSubscription(id) if id == bogus), "{err}");
}

#[test]
fn group_destroy_by_name() {
    let cluster = LocalCluster::new(7, config());
    let services = cluster.start_members(2).expect("members");
    let group = SubscriberGroupId::durable("ledger");
    let id = services[0]
        .ensure_subscription("orders", group.clone(), Some(services[0].new_subscriber_id()), None, None)
        .expect("create");

    services[1].destroy_subscriber_group("orders", "ledger").expect("destroy group");
    eventually("group to disappear", || {
        services
            .iter()
            .all(|s| s.subscription_id("orders", &group).is_none() && s.is_subscription_destroyed(id))
    });
    assert!(services[0].subscriber_groups("orders").is_empty());
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl SubscriptionListener for Recorder {
    fn on_insert(&self, subscription: &Subscription) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(format!("insert {}", subscription.id));
        Ok(())
    }

    fn on_update(&self, subscription: &Subscription) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(format!("update {}", subscription.id));
        anyhow::bail!("listener failures stay local")
    }

    fn on_delete(&self, id: SubscriptionId, _key: &SubscriptionKey) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(format!("delete {id}"));
        Ok(())
    }
}

#[test]
fn listeners_and_registrar_follow_the_mirror() {
    let cluster = LocalCluster::new(7, config());
    let services = cluster.start_members(2).expect("members");
    let recorder = Arc::new(Recorder::default());
    services[1].add_subscription_listener(recorder.clone());

    let group = SubscriberGroupId::durable("metrics");
    let id = services[0]
        .ensure_subscription("orders", group.clone(), None, None, None)
        .expect("create");
    services[0]
        .ensure_subscription("orders", group, Some(services[0].new_subscriber_id()), None, None)
        .expect("add subscriber");
    services[0].destroy_subscription(id, None).expect("destroy");

    eventually("delete on the non-senior", || {
        recorder.events.lock().unwrap().contains(&format!("delete {id}"))
    });
    let events = recorder.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![format!("insert {id}"), format!("update {id}"), format!("delete {id}")]
    );

    // One registration and one unregistration per member registry.
    let registrar = cluster.registrar().events_for(id);
    let registered = registrar.iter().filter(|e| matches!(e, RegistrarEvent::Registered(_))).count();
    let unregistered = registrar.iter().filter(|e| matches!(e, RegistrarEvent::Unregistered(_))).count();
    assert_eq!((registered, unregistered), (2, 2));

    // Private groups are never registered.
    let private = services[1].anonymous_group();
    let anon = services[1]
        .ensure_subscription("orders", private, Some(services[1].new_subscriber_id()), None, None)
        .expect("anonymous");
    assert!(cluster.registrar().events_for(anon).is_empty());
}

#[test]
fn topics_are_registered_and_destroyed() {
    let cluster = LocalCluster::new(7, config());
    let services = cluster.start_members(2).expect("members");

    let default = services[1].ensure_topic("").expect("default topic");
    assert_eq!(default.name(), "Default");
    assert_eq!(default.channel_count(), 17);
    let orders = services[1].ensure_topic("orders").expect("orders");
    assert_eq!(orders.channel_count(), 6);
    eventually("topics on the senior", || {
        services[0].topic_names().into_iter().collect::<Vec<_>>() == vec!["Default".to_string(), "orders".to_string()]
    });

    let id = services[1]
        .ensure_subscription("orders", SubscriberGroupId::durable("a"), None, None, None)
        .expect("subscription");
    assert_eq!(services[0].destroy_topic("orders").expect("destroy topic"), 1);
    eventually("topic removal to replicate", || {
        !services[1].topic_names().contains("orders") && services[1].is_subscription_destroyed(id)
    });
    assert!(services[1].release_topic("orders"));
    assert!(!services[1].release_topic("orders"));
}
