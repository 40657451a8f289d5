use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rabbit_consumer::config::{self, RuntimeConfig};
use rabbit_consumer::env::apply_env_overrides;
use rabbit_consumer::rabbitmq::{
    AmqpTransport, ChannelPool, ConnectionManager, ConsumerPool, DispatchRouter, InMemoryBroker,
    LapinTransport, Publisher, RoutingKey,
};
use rabbit_consumer::telemetry::init_tracing;
use rabbit_consumer::{Delivery, HandlerError, HandlerResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct OrderMessage {
    order_id: String,
    customer_id: String,
    items: Vec<String>,
    total: f64,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Options {
    in_memory: bool,
    publish: usize,
    config: Option<PathBuf>,
    init_config: Option<PathBuf>,
}

const USAGE: &str = "usage: rabbit-consumer [--config <file>] [--init-config <file>] [--in-memory] [--publish <n>]";

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Options> {
    let mut options = Options::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--in-memory" => options.in_memory = true,
            "--publish" => {
                let count = args.next().ok_or_else(|| anyhow!("--publish needs a count"))?;
                options.publish = count
                    .parse()
                    .with_context(|| format!("Invalid --publish count '{}'", count))?;
            }
            "--config" => {
                let path = args.next().ok_or_else(|| anyhow!("--config needs a path"))?;
                options.config = Some(PathBuf::from(path));
            }
            "--init-config" => {
                let path = args.next().ok_or_else(|| anyhow!("--init-config needs a path"))?;
                options.init_config = Some(PathBuf::from(path));
            }
            other => return Err(anyhow!("Unknown argument '{}'\n{}", other, USAGE)),
        }
    }
    Ok(options)
}

async fn add_order(delivery: Delivery) -> HandlerResult {
    let order: OrderMessage = delivery.json()?;
    if order.items.is_empty() {
        return Err(HandlerError::Fatal(format!(
            "order {} has no items",
            order.order_id
        )));
    }
    info!(
        order_id = %order.order_id,
        customer_id = %order.customer_id,
        items = order.items.len(),
        total = order.total,
        "Order added"
    );
    Ok(())
}

async fn unhandled(delivery: Delivery) -> HandlerResult {
    warn!(
        routing_key = %delivery.routing_key,
        bytes = delivery.payload.len(),
        payload = %delivery.payload_str(),
        "No dedicated handler, message accepted by default handler"
    );
    Ok(())
}

fn load_configuration(options: &Options) -> Result<RuntimeConfig> {
    let mut config = match &options.config {
        Some(path) => config::load_config_from(path)?,
        None => match config::load_config() {
            Ok(config) => config,
            Err(e) => {
                info!("Using built-in defaults: {}", e);
                RuntimeConfig::default()
            }
        },
    };
    apply_env_overrides(&mut config)?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn publish_demo_orders(channels: &ChannelPool, config: &RuntimeConfig, count: usize) -> Result<()> {
    let exchange = config
        .topology
        .bindings
        .iter()
        .find(|b| b.queue == config.consumer.queue)
        .map(|b| b.exchange.clone())
        .unwrap_or_default();
    let publisher = Publisher::new(channels.clone(), &exchange);

    for n in 0..count {
        let order = OrderMessage {
            order_id: format!("ORD-{}", &Uuid::new_v4().simple().to_string()[..8]),
            customer_id: format!("CUST-{}", n % 7),
            items: vec!["widget".to_string(); 1 + n % 3],
            total: 9.99 * (1 + n % 3) as f64,
            timestamp: Utc::now(),
        };
        publisher
            .publish_json("add", &order)
            .await
            .with_context(|| format!("Failed to publish demo order {}", n))?;
    }
    info!(count, exchange = %exchange, "Published demo orders");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let options = parse_args(std::env::args().skip(1))?;

    if let Some(path) = &options.init_config {
        config::create_default_config_file(path)?;
        return Ok(());
    }
    let config = load_configuration(&options)?;

    let transport: Arc<dyn AmqpTransport> = if options.in_memory {
        info!("Running against the in-memory broker");
        Arc::new(InMemoryBroker::new())
    } else {
        Arc::new(LapinTransport::new())
    };

    let connection = Arc::new(ConnectionManager::new(
        transport,
        config.endpoint.clone(),
        config.topology.clone(),
        config.recovery.clone(),
    ));
    connection
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", config.endpoint.display_address()))?;
    let watchdog = connection.spawn_watchdog();
    let channels = ChannelPool::new(Arc::clone(&connection), config.channel_pool.capacity);

    let mut router = DispatchRouter::new(&config.dispatch);
    router.register(&config.consumer.queue, RoutingKey::key("add"), add_order)?;
    router.register(&config.consumer.queue, RoutingKey::Default, unhandled)?;

    let pool = ConsumerPool::new(Arc::clone(&connection), channels.clone(), router, &config)
        .start()
        .await
        .context("Failed to start consumer pool")?;
    info!(
        queue = %pool.queue(),
        consumers = pool.active_consumers(),
        "Service running. Press Ctrl+C to exit."
    );

    if options.publish > 0 {
        publish_demo_orders(&channels, &config, options.publish).await?;
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            info!("Shutdown requested");
        }
        fatal = pool.fatal() => {
            error!(error = %fatal, "Connection could not be recovered");
        }
    }

    let stats = pool.stats();
    let report = pool.stop().await?;
    info!(
        acked = stats.acked,
        requeued = stats.requeued,
        discarded = stats.discarded,
        dead_lettered = stats.dead_lettered,
        consumers_stopped = report.consumers_stopped,
        forced_requeues = report.forced_requeues,
        "Consumer pool stopped"
    );

    watchdog.abort();
    if let Err(e) = connection.close().await {
        warn!(error = %e, "Error while closing the connection");
    }
    Ok(())
}
