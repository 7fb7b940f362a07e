use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use super::Coordinator;
use crate::cluster::ServiceControl;
use crate::error::{Error, Result};
use crate::sync::lock;

/// Resumes the service when dropped, including during unwinding.
struct SuspendGuard {
    control: Option<Arc<dyn ServiceControl>>,
}

impl SuspendGuard {
    fn suspend(control: &Arc<dyn ServiceControl>) -> Self {
        if control.is_suspended() {
            return Self { control: None };
        }
        control.suspend();
        Self {
            control: Some(Arc::clone(control)),
        }
    }
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        if let Some(control) = self.control.take() {
            control.resume();
        }
    }
}

/// Raises the channel count of `topic` to at least `required`.
///
/// Runs on the senior. The published count is re-read under the topic store
/// lock (a topic with nothing published counts as zero); when it is already
/// sufficient nothing changes. Otherwise the service is suspended while the new
/// count is published and every subscription of the topic is reallocated. The
/// new count is the largest of `required`, `total` and the configured count.
/// Returns the count in effect afterwards.
pub fn ensure_channel_count(
    coordinator: &Coordinator,
    control: &Arc<dyn ServiceControl>,
    topic: &str,
    required: u32,
    total: u32,
) -> u32 {
    let _topics = coordinator.topics().lock();
    let current = coordinator.config_map().channel_count(topic).unwrap_or(0);
    if required <= current {
        log::debug!("channel count of {topic} already {current} (required {required})");
        return current;
    }

    let target = required.max(total).max(coordinator.channel_count(topic));
    let _suspended = SuspendGuard::suspend(control);
    coordinator.config_map().set_channel_count(topic, target);
    let reallocated = coordinator.reallocate(Some(topic));
    log::info!(
        "increased channel count of {topic} from {current} to {target}, reallocated {reallocated} subscriptions"
    );
    target
}

pub struct ChannelCountTask {
    pub topic: String,
    pub required: u32,
    pub total: u32,
    /// Receives the resulting channel count.
    pub reply: Box<dyn FnOnce(u32) + Send>,
}

/// Worker thread that runs channel-count increases off the service thread.
pub struct ChannelCountExecutor {
    tx: Mutex<Option<Sender<ChannelCountTask>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelCountExecutor {
    pub fn start(
        name: &str,
        coordinator: Arc<Coordinator>,
        control: Arc<dyn ServiceControl>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<ChannelCountTask>();
        let handle = thread::Builder::new()
            .name(format!("{name}-channel-count"))
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        ensure_channel_count(&coordinator, &control, &task.topic, task.required, task.total)
                    }));
                    let count = match outcome {
                        Ok(count) => count,
                        Err(_) => {
                            log::error!("channel count task for {} panicked", task.topic);
                            coordinator.channel_count(&task.topic)
                        }
                    };
                    (task.reply)(count);
                }
            })?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn submit(&self, task: ChannelCountTask) -> Result<()> {
        let guard = lock(&self.tx);
        let tx = guard.as_ref().ok_or(Error::ServiceStopped)?;
        tx.send(task).map_err(|_| Error::ServiceStopped)
    }

    pub fn shutdown(&self) {
        lock(&self.tx).take();
        if let Some(handle) = lock(&self.handle).take() {
            if handle.join().is_err() {
                log::warn!("channel count executor exited with a panic");
            }
        }
    }
}

impl Drop for ChannelCountExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::cluster::{MemberId, NoopRegistrar};
    use crate::config::ServiceConfig;
    use crate::config_map::ConfigMap;
    use crate::model::{SimpleChannelAllocationStrategy, SubscriberGroupId, SubscriberId, SubscriptionKey};
    use crate::protocol::SubscriberIdRequest;
    use crate::registry::SubscriptionRegistry;
    use crate::topics::TopicStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingControl {
        suspended: AtomicBool,
        suspends: AtomicUsize,
        resumes: AtomicUsize,
    }

    impl ServiceControl for RecordingControl {
        fn is_suspended(&self) -> bool {
            self.suspended.load(Ordering::SeqCst)
        }

        fn suspend(&self) {
            self.suspended.store(true, Ordering::SeqCst);
            self.suspends.fetch_add(1, Ordering::SeqCst);
        }

        fn resume(&self) {
            self.suspended.store(false, Ordering::SeqCst);
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn coordinator() -> Arc<Coordinator> {
        let config = Arc::new(ServiceConfig {
            default_channel_count: 6,
            ..ServiceConfig::default()
        });
        let config_map = Arc::new(ConfigMap::standalone());
        let registry = Arc::new(SubscriptionRegistry::new(
            Arc::new(ManualClock::new(0)),
            &config,
            Arc::new(NoopRegistrar),
        ));
        let topics = Arc::new(TopicStore::new(Arc::clone(&config), Arc::clone(&config_map)));
        Arc::new(Coordinator::new(
            MemberId(1),
            config,
            registry,
            config_map,
            topics,
            Arc::new(SimpleChannelAllocationStrategy),
        ))
    }

    #[test]
    fn increase_suspends_and_resumes() {
        let coordinator = coordinator();
        let recording = Arc::new(RecordingControl::default());
        let control: Arc<dyn ServiceControl> = recording.clone();
        let key = SubscriptionKey::new("orders", SubscriberGroupId::durable("billing"));
        coordinator.handle_subscriber_id(&SubscriberIdRequest::create(
            &key,
            vec![SubscriberId::new(1, MemberId(1))],
        ));

        assert_eq!(ensure_channel_count(&coordinator, &control, "orders", 10, 10), 10);
        assert_eq!(recording.suspends.load(Ordering::SeqCst), 1);
        assert_eq!(recording.resumes.load(Ordering::SeqCst), 1);
        assert!(!recording.is_suspended());
        assert_eq!(coordinator.config_map().subscription(&key).unwrap().channel_count, 10);

        // Lower requests never shrink the count or touch the service.
        assert_eq!(ensure_channel_count(&coordinator, &control, "orders", 8, 8), 10);
        assert_eq!(recording.suspends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unpublished_topic_is_published_even_below_configured_count() {
        let coordinator = coordinator();
        let control: Arc<dyn ServiceControl> = Arc::new(RecordingControl::default());
        assert_eq!(coordinator.config_map().channel_count("orders"), None);

        // Nothing published yet, so even a small request publishes the configured count.
        assert_eq!(ensure_channel_count(&coordinator, &control, "orders", 4, 4), 6);
        assert_eq!(coordinator.config_map().channel_count("orders"), Some(6));

        assert_eq!(ensure_channel_count(&coordinator, &control, "audit", 10, 8), 10);
        assert_eq!(coordinator.config_map().channel_count("audit"), Some(10));
    }

    #[test]
    fn already_suspended_service_is_left_suspended() {
        let coordinator = coordinator();
        let recording = Arc::new(RecordingControl::default());
        recording.suspended.store(true, Ordering::SeqCst);
        let control: Arc<dyn ServiceControl> = recording.clone();

        assert_eq!(ensure_channel_count(&coordinator, &control, "orders", 7, 12), 12);
        assert_eq!(recording.suspends.load(Ordering::SeqCst), 0);
        assert_eq!(recording.resumes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn executor_replies_with_new_count() {
        let coordinator = coordinator();
        let control: Arc<dyn ServiceControl> = Arc::new(RecordingControl::default());
        let executor = ChannelCountExecutor::start("test", coordinator, control).unwrap();
        let (tx, rx) = mpsc::channel();
        executor
            .submit(ChannelCountTask {
                topic: "orders".into(),
                required: 9,
                total: 9,
                reply: Box::new(move |count| {
                    let _ = tx.send(count);
                }),
            })
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 9);
        executor.shutdown();
        assert!(executor
            .submit(ChannelCountTask {
                topic: "orders".into(),
                required: 1,
                total: 1,
                reply: Box::new(|_| {}),
            })
            .is_err());
    }
}
