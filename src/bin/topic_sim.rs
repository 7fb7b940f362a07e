use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use topic_coordinator::{LocalCluster, ServiceConfig, SubscriberGroupId, TopicService};

#[derive(Parser)]
#[command(name = "topic-sim", version, about = "Run coordination scenarios on an in-process cluster")]
struct Cli {
    /// JSON service config; defaults apply when omitted.
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,
    #[arg(long = "members", default_value_t = 3, global = true)]
    members: usize,
    #[arg(long = "partitions", default_value_t = 13, global = true)]
    partitions: u32,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe a group from every member, then try a conflicting filter.
    Subscribe {
        #[arg(long = "topic", default_value = "orders")]
        topic: String,
        #[arg(long = "group", default_value = "billing")]
        group: String,
        #[arg(long = "filter")]
        filter: Option<String>,
    },
    /// Raise a topic's channel count from a non-senior member.
    ChannelCount {
        #[arg(long = "topic", default_value = "orders")]
        topic: String,
        #[arg(long = "required")]
        required: u32,
        #[arg(long = "total")]
        total: Option<u32>,
    },
    /// Stop a member holding subscribers and show what cleanup left behind.
    Departure {
        #[arg(long = "topic", default_value = "orders")]
        topic: String,
        /// Stop the senior instead of the newest member.
        #[arg(long = "senior")]
        senior: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    if cli.members == 0 {
        bail!("--members must be at least 1");
    }
    let config = match &cli.config {
        Some(path) => ServiceConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => ServiceConfig::default(),
    };

    let cluster = LocalCluster::new(cli.partitions, config);
    let services = cluster.start_members(cli.members).context("starting members")?;
    log::info!("cluster up: {:?}, senior {:?}", cluster.members(), cluster.senior());

    match cli.command {
        Commands::Subscribe { topic, group, filter } => subscribe(&services, &topic, &group, filter),
        Commands::ChannelCount { topic, required, total } => {
            channel_count(&services, &topic, required, total.unwrap_or(required))
        }
        Commands::Departure { topic, senior } => departure(&cluster, &services, &topic, senior),
    }
}

fn subscribe(services: &[TopicService], topic: &str, group: &str, filter: Option<String>) -> Result<()> {
    let group = SubscriberGroupId::durable(group);
    for service in services {
        service.ensure_topic(topic)?;
        let subscriber = service.new_subscriber_id();
        let id = service
            .ensure_subscription(topic, group.clone(), Some(subscriber), filter.as_deref().map(Into::into), None)
            .with_context(|| format!("subscribing {subscriber}"))?;
        println!("{}: {subscriber} joined subscription {id}", service.name());
    }

    let last = services.last().context("no members")?;
    match last.ensure_subscription(topic, group.clone(), None, Some("conflicting".into()), None) {
        Ok(id) => println!("conflicting filter unexpectedly accepted: {id}"),
        Err(err) => println!("conflicting filter rejected: {err}"),
    }
    print_topic(last, topic);
    Ok(())
}

fn channel_count(services: &[TopicService], topic: &str, required: u32, total: u32) -> Result<()> {
    let service = services.last().context("no members")?;
    service.ensure_topic(topic)?;
    let before = service.channel_count(topic);
    let after = service.ensure_channel_count(topic, required, total)?;
    println!("{topic}: {before} -> {after} channels");
    for service in services {
        println!("  {} sees {}", service.name(), service.channel_count(topic));
    }
    Ok(())
}

fn departure(cluster: &LocalCluster, services: &[TopicService], topic: &str, senior: bool) -> Result<()> {
    let group = SubscriberGroupId::durable("workers");
    for service in services {
        service.ensure_topic(topic)?;
        service.ensure_subscription(topic, group.clone(), Some(service.new_subscriber_id()), None, None)?;
        let private = service.anonymous_group();
        service.ensure_subscription(topic, private, Some(service.new_subscriber_id()), None, None)?;
    }
    let observer = services.first().context("no members")?;
    print_topic(observer, topic);

    let victim = if senior {
        cluster.senior().context("no senior")?
    } else {
        *cluster.members().last().context("no members")?
    };
    println!("stopping {victim}");
    cluster.stop_member(victim);
    // Cleanup runs asynchronously on the senior.
    std::thread::sleep(Duration::from_millis(500));

    let survivor = services
        .iter()
        .find(|s| s.local_member() != victim)
        .context("no surviving member")?;
    print_topic(survivor, topic);
    println!("unsubscribe calls: {}", cluster.store().calls().len());
    Ok(())
}

fn print_topic(service: &TopicService, topic: &str) {
    println!("{topic} ({} channels) as seen by {}:", service.channel_count(topic), service.name());
    for group in service.subscriber_groups(topic) {
        let subscribers: Vec<String> = service.subscribers(topic, &group).iter().map(ToString::to_string).collect();
        println!("  {group}: [{}]", subscribers.join(", "));
    }
}

