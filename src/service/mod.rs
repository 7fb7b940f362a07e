//! Per-member topic service.
//!
//! Each member runs one service thread that handles every inbound frame and
//! membership change in order. It never blocks on the network: confirmation
//! barriers and channel-count waits run on caller threads (see `client`), and
//! channel-count increases run on the coordinator's executor thread.
//!
//! A member that is not senior relays senior-only requests to the senior once,
//! remembers the relay, and re-sends it if the senior departs before replying.

mod client;
mod forward;
mod replicator;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::AtomicU64;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub use forward::{Forward, Forwards, MAX_FORWARD_ATTEMPTS};
pub use replicator::ClusterReplicator;

use crate::cleanup::DepartureCleanup;
use crate::clock::Clock;
use crate::cluster::{ClusterContext, MemberId, MemberRegistry};
use crate::config::ServiceConfig;
use crate::config_map::ConfigMap;
use crate::confirm;
use crate::coordinator::channel_count::{ChannelCountExecutor, ChannelCountTask};
use crate::coordinator::Coordinator;
use crate::error::{Error, ProtocolError, Result};
use crate::model::{ChannelAllocationStrategy, SimpleChannelAllocationStrategy, SubscriptionId};
use crate::protocol::{codec, Envelope, Message, Requests, Response};
use crate::registry::{RegistrySync, SubscriptionRegistry};
use crate::sync::lock;
use crate::topics::TopicStore;

/// Input to a member's service thread.
#[derive(Debug)]
pub enum ServiceEvent {
    Frame(Vec<u8>),
    MemberJoined(MemberId),
    MemberLeft(MemberId),
    Shutdown,
}

pub(crate) struct ServiceShared {
    pub(crate) name: String,
    pub(crate) config: Arc<ServiceConfig>,
    pub(crate) ctx: ClusterContext,
    pub(crate) requests: Arc<Requests>,
    pub(crate) config_map: Arc<ConfigMap>,
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) topics: Arc<TopicStore>,
    pub(crate) coordinator: Arc<Coordinator>,
    pub(crate) next_subscriber: AtomicU64,
    executor: ChannelCountExecutor,
    cleanup: Arc<DepartureCleanup>,
    ready: Mutex<bool>,
    ready_cv: Condvar,
}

impl ServiceShared {
    fn mark_ready(&self) {
        let mut ready = lock(&self.ready);
        if !*ready {
            *ready = true;
            self.ready_cv.notify_all();
        }
    }
}

/// Handle on one member's topic service. Clones share the same service.
#[derive(Clone)]
pub struct TopicService {
    shared: Arc<ServiceShared>,
    events: Sender<ServiceEvent>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TopicService {
    pub fn start(config: ServiceConfig, ctx: ClusterContext, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::start_with_strategy(config, ctx, clock, Arc::new(SimpleChannelAllocationStrategy))
    }

    pub fn start_with_strategy(
        config: ServiceConfig,
        ctx: ClusterContext,
        clock: Arc<dyn Clock>,
        strategy: Arc<dyn ChannelAllocationStrategy>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let local = ctx.local_member();
        let name = format!("{}-{}", config.service_name, local.0);

        let requests = Arc::new(Requests::new(local, Arc::clone(&ctx.transport)));
        let replicator = ClusterReplicator::new(Arc::clone(&ctx.members), Arc::clone(&requests));
        let config_map = Arc::new(ConfigMap::new(Some(Arc::new(replicator))));
        let registry = Arc::new(SubscriptionRegistry::new(clock, &config, Arc::clone(&ctx.registrar)));
        config_map.add_listener(Arc::new(RegistrySync::new(Arc::clone(&registry))));
        let topics = Arc::new(TopicStore::new(Arc::clone(&config), Arc::clone(&config_map)));
        let coordinator = Arc::new(Coordinator::new(
            local,
            Arc::clone(&config),
            Arc::clone(&registry),
            Arc::clone(&config_map),
            Arc::clone(&topics),
            strategy,
        ));
        let executor = ChannelCountExecutor::start(&name, Arc::clone(&coordinator), Arc::clone(&ctx.control))?;
        let cleanup = Arc::new(DepartureCleanup::new(
            ctx.clone(),
            Arc::clone(&config),
            Arc::clone(&coordinator),
        ));

        let shared = Arc::new(ServiceShared {
            name: name.clone(),
            config,
            ctx,
            requests,
            config_map,
            registry,
            topics,
            coordinator,
            next_subscriber: AtomicU64::new(1),
            executor,
            cleanup,
            ready: Mutex::new(false),
            ready_cv: Condvar::new(),
        });

        let (tx, rx) = mpsc::channel();
        let mut worker = ServiceThread {
            shared: Arc::clone(&shared),
            forwards: Forwards::default(),
            was_senior: false,
        };
        let handle = thread::Builder::new().name(name).spawn(move || worker.run(rx))?;

        Ok(Self {
            shared,
            events: tx,
            thread: Arc::new(Mutex::new(Some(handle))),
        })
    }

    /// Where the host delivers frames and membership changes for this member.
    pub fn event_sender(&self) -> Sender<ServiceEvent> {
        self.events.clone()
    }

    pub fn local_member(&self) -> MemberId {
        self.shared.ctx.local_member()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_senior(&self) -> bool {
        self.shared.ctx.members.is_senior()
    }

    /// Waits until this member is senior or has received the senior's config snapshot.
    pub fn await_ready(&self, timeout: Duration) -> Result<()> {
        let ready = lock(&self.shared.ready);
        let (ready, result) = self
            .shared
            .ready_cv
            .wait_timeout_while(ready, timeout, |ready| !*ready)
            .unwrap_or_else(PoisonError::into_inner);
        if result.timed_out() && !*ready {
            return Err(Error::Timeout {
                what: format!("{} to join", self.shared.name),
                millis: timeout.as_millis() as u64,
            });
        }
        Ok(())
    }

    /// Stops the service thread and fails outstanding requests.
    pub fn shutdown(&self) {
        let _ = self.events.send(ServiceEvent::Shutdown);
        if let Some(handle) = lock(&self.thread).take() {
            if handle.join().is_err() {
                log::warn!("{} service thread panicked", self.shared.name);
            }
        }
    }
}

struct ServiceThread {
    shared: Arc<ServiceShared>,
    forwards: Forwards,
    was_senior: bool,
}

impl ServiceThread {
    fn run(&mut self, rx: Receiver<ServiceEvent>) {
        log::info!("{} started", self.shared.name);
        while let Ok(event) = rx.recv() {
            if matches!(event, ServiceEvent::Shutdown) {
                break;
            }
            match catch_unwind(AssertUnwindSafe(|| self.handle(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err @ (Error::Corrupt(_) | Error::Codec(_)))) => {
                    log::warn!("{}: dropped bad frame: {err}", self.shared.name);
                }
                Ok(Err(err)) => log::error!("{}: event failed: {err}", self.shared.name),
                Err(_) => log::error!("{}: event handler panicked, continuing", self.shared.name),
            }
        }
        self.shared.requests.stop();
        self.shared.executor.shutdown();
        log::info!("{} stopped", self.shared.name);
    }

    fn members(&self) -> &Arc<dyn MemberRegistry> {
        &self.shared.ctx.members
    }

    fn local(&self) -> MemberId {
        self.shared.ctx.local_member()
    }

    fn handle(&mut self, event: ServiceEvent) -> Result<()> {
        match event {
            ServiceEvent::Frame(frame) => {
                let envelope = codec::decode(&frame)?;
                self.dispatch(envelope)
            }
            ServiceEvent::MemberJoined(member) => self.on_member_joined(member),
            ServiceEvent::MemberLeft(member) => self.on_member_left(member),
            ServiceEvent::Shutdown => Ok(()),
        }
    }

    fn on_member_joined(&mut self, member: MemberId) -> Result<()> {
        log::debug!("{}: {member} joined", self.shared.name);
        self.check_seniority()?;
        if member != self.local() && self.members().is_senior() {
            self.shared.config_map.send_welcome(member);
        }
        Ok(())
    }

    fn on_member_left(&mut self, member: MemberId) -> Result<()> {
        log::info!("{}: {member} left", self.shared.name);
        self.shared.requests.fail_member(member);
        let became_senior = self.check_seniority()?;
        for forward in self.forwards.take_targeting(member) {
            log::debug!("re-sending {} relayed to departed {member}", forward.message.name());
            self.forward(forward)?;
        }
        if !became_senior && self.members().is_senior() {
            self.shared.cleanup.spawn(false)?;
        }
        Ok(())
    }

    /// Returns true when this member just became senior.
    fn check_seniority(&mut self) -> Result<bool> {
        let senior = self.members().is_senior();
        let became = senior && !self.was_senior;
        self.was_senior = senior;
        if became {
            log::info!("{} is now the senior member", self.shared.name);
            self.shared.mark_ready();
            self.shared.cleanup.spawn(true)?;
        }
        Ok(became)
    }

    fn dispatch(&mut self, envelope: Envelope) -> Result<()> {
        if let Some(reply_to) = envelope.reply_to {
            if let Some(forward) = self.forwards.take(reply_to) {
                return self.relay(forward, envelope.message);
            }
            if !self.shared.requests.complete(reply_to, envelope.from, envelope.message) {
                log::trace!("{}: late reply {reply_to} from {}", self.shared.name, envelope.from);
            }
            return Ok(());
        }

        if envelope.message.is_senior_request() {
            return self.on_senior_request(envelope);
        }

        let Envelope { from, id, message, .. } = envelope;
        match message {
            Message::SubscriberConfirm(request) => {
                let owned = self.members().owned_partitions(self.local());
                let reply = confirm::confirm_subscriber(&self.shared.registry, &request, &owned);
                self.shared.requests.reply(from, id, Message::PartialValue(reply))
            }
            Message::ChannelCountConfirm(request) => {
                let owned = self.members().owned_partitions(self.local());
                let local_count = self.shared.config_map.channel_count(&request.topic).unwrap_or(0);
                let reply = confirm::confirm_channel_count(local_count, &request, &owned);
                self.shared.requests.reply(from, id, Message::PartialValue(reply))
            }
            Message::ConfigUpdate(update) => {
                self.shared.config_map.apply_remote(update);
                Ok(())
            }
            Message::Welcome(entries) => {
                log::info!("{}: received {} config entries from {from}", self.shared.name, entries.len());
                self.shared.config_map.apply_snapshot(entries);
                self.shared.mark_ready();
                Ok(())
            }
            other => {
                log::warn!("{}: unsolicited {} from {from}", self.shared.name, other.name());
                Ok(())
            }
        }
    }

    fn on_senior_request(&mut self, envelope: Envelope) -> Result<()> {
        let required = envelope.message.required_tier();
        let Envelope {
            from,
            id,
            forwarded,
            message,
            ..
        } = envelope;

        if self.members().is_senior() {
            let supported = self
                .members()
                .protocol_tier(self.local())
                .is_some_and(|tier| tier.supports(required));
            if !supported {
                return self.respond(from, id, Response::Success(SubscriptionId::NOT_COMPATIBLE.0));
            }
            return self.decide(from, id, message);
        }
        if forwarded {
            return self.respond(from, id, Response::Failure(ProtocolError::NotSenior));
        }
        if !self.shared.ctx.senior_supports(required) {
            log::debug!("senior cannot handle {}; answering not-compatible", message.name());
            return self.respond(from, id, Response::Success(SubscriptionId::NOT_COMPATIBLE.0));
        }
        self.forward(Forward {
            origin: from,
            origin_id: id,
            message,
            target: MemberId::NONE,
            attempts: 0,
        })
    }

    fn decide(&mut self, from: MemberId, id: u64, message: Message) -> Result<()> {
        match message {
            Message::SubscriberId(request) => {
                let response = self.shared.coordinator.handle_subscriber_id(&request);
                self.respond(from, id, response)
            }
            Message::Topic(request) => {
                let response = self.shared.coordinator.handle_topic(&request);
                self.respond(from, id, response)
            }
            Message::SetChannelCount(request) => {
                let requests = Arc::clone(&self.shared.requests);
                self.shared.executor.submit(ChannelCountTask {
                    topic: request.topic,
                    required: request.required,
                    total: request.total,
                    reply: Box::new(move |count| {
                        let response = Message::Response(Response::Success(count as i64));
                        if let Err(err) = requests.reply(from, id, response) {
                            log::debug!("channel count reply to {from} dropped: {err}");
                        }
                    }),
                })
            }
            other => {
                log::warn!("{}: {} is not a senior request", self.shared.name, other.name());
                Ok(())
            }
        }
    }

    /// Relays to the current senior, or decides locally if that is us.
    fn forward(&mut self, mut forward: Forward) -> Result<()> {
        let Some(senior) = self.members().senior() else {
            return self.respond(forward.origin, forward.origin_id, Response::Failure(ProtocolError::NotSenior));
        };
        if senior == self.local() {
            return self.decide(forward.origin, forward.origin_id, forward.message);
        }
        if forward.attempts >= MAX_FORWARD_ATTEMPTS {
            log::warn!("{}: giving up relaying {}", self.shared.name, forward.message.name());
            return self.respond(forward.origin, forward.origin_id, Response::Failure(ProtocolError::NotSenior));
        }
        forward.attempts += 1;
        forward.target = senior;

        let relay_id = self.shared.requests.next_id();
        let envelope = Envelope {
            from: self.local(),
            id: relay_id,
            reply_to: None,
            forwarded: true,
            message: forward.message.clone(),
        };
        // Kept even if delivery fails: the departure of `senior` re-sends it.
        if let Err(err) = self.shared.requests.deliver(senior, &envelope) {
            log::debug!("relay to {senior} failed: {err}");
        }
        self.forwards.insert(relay_id, forward);
        Ok(())
    }

    fn relay(&mut self, forward: Forward, message: Message) -> Result<()> {
        if let Message::Response(Response::Failure(ProtocolError::NotSenior)) = message {
            return self.forward(forward);
        }
        self.shared.requests.reply(forward.origin, forward.origin_id, message)
    }

    fn respond(&self, to: MemberId, reply_to: u64, response: Response) -> Result<()> {
        self.shared.requests.reply(to, reply_to, Message::Response(response))
    }
}
