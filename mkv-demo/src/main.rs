//! # ModalKV Walkthrough
//!
//! Purpose: Exercise every invocation style of the client against either an
//! ephemeral in-process store or a fixed address, then shut everything down
//! in order.
//!
//! Usage: `mkv-demo [true|false]`. `true` (the default) provisions an
//! ephemeral instance; `false` connects to `MKV_URI`
//! (default `redis://localhost:6379`).

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::FutureExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mkv_client::{ClientConfig, Connection, PubSubChannel, TargetResolver};
use mkv_common::{StaticResolver, TtlStatus};
use mkv_server::EphemeralResolver;

const DEFAULT_URI: &str = "redis://localhost:6379";

struct DemoConfig {
    use_ephemeral: bool,
    uri: String,
    client: ClientConfig,
}

impl DemoConfig {
    fn from_args_and_env() -> Self {
        let use_ephemeral = env::args()
            .nth(1)
            .map(|raw| raw.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(true);
        DemoConfig {
            use_ephemeral,
            uri: env::var("MKV_URI").unwrap_or_else(|_| DEFAULT_URI.to_string()),
            client: ClientConfig::from_env(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = DemoConfig::from_args_and_env();
    if config.use_ephemeral {
        let resolver = EphemeralResolver::start().context("provisioning ephemeral instance")?;
        let outcome = run(&resolver, config.client).await;
        resolver.teardown();
        info!("ephemeral instance torn down");
        outcome
    } else {
        let resolver = StaticResolver::from_uri(&config.uri).with_context(|| format!("parsing {}", config.uri))?;
        run(&resolver, config.client).await
    }
}

async fn run(resolver: &dyn TargetResolver, config: ClientConfig) -> Result<()> {
    let target = resolver.resolve().context("resolving store target")?;
    let conn = Connection::connect_async(&target, config)
        .await
        .with_context(|| format!("connecting to {target}"))?;
    let pubsub = conn.pubsub();

    let outcome = walkthrough(&conn, &pubsub).await;

    pubsub.close();
    conn.close();
    outcome
}

async fn walkthrough(conn: &Connection, pubsub: &PubSubChannel) -> Result<()> {
    simple_usage(conn)?;
    ttl_usage(conn).await?;
    hashes_usage(conn)?;
    async_usage(conn).await?;
    reactive_usage(conn).await?;
    pubsub_usage(pubsub).await?;
    Ok(())
}

fn simple_usage(conn: &Connection) -> Result<()> {
    println!("-------------- SIMPLE USAGE --------------");
    let sync = conn.sync();
    sync.set("test", "123")?;
    println!("Value: {}", display(sync.get("test")?));
    Ok(())
}

async fn ttl_usage(conn: &Connection) -> Result<()> {
    println!("-------------- TTL USAGE --------------");
    let sync = conn.sync();
    sync.set_with_expiry("temp-key", "this is temporary", 6)?;
    println!("TTL: {} seconds", ttl_secs(sync.ttl("temp-key")?));

    tokio::time::sleep(Duration::from_secs(2)).await;
    println!("TTL after 2s: {}", ttl_secs(sync.ttl("temp-key")?));
    println!("Value with TTL: {}", display(sync.get("temp-key")?));

    tokio::time::sleep(Duration::from_secs(5)).await;
    println!("Value after 7s: {}", display(sync.get("temp-key")?));
    Ok(())
}

fn hashes_usage(conn: &Connection) -> Result<()> {
    println!("-------------- HASHES USAGE --------------");
    let user: HashMap<String, String> = [
        ("name", "Alice"),
        ("email", "alice@example.com"),
        ("role", "admin"),
    ]
    .into_iter()
    .map(|(field, value)| (field.to_string(), value.to_string()))
    .collect();

    let sync = conn.sync();
    sync.set_user_profile("123", &user)?;

    // Sorted so the printed profile is stable.
    let profile: BTreeMap<_, _> = sync.get_user_profile("123")?.into_iter().collect();
    println!("User profile:");
    println!("{}", serde_json::to_string_pretty(&profile)?);
    Ok(())
}

async fn async_usage(conn: &Connection) -> Result<()> {
    let commands = conn.asynchronous();
    let follow_up = commands.clone();

    let value = commands
        .set("async-key", "yo from the future")?
        .then(move |set_result| async move {
            println!("-------------- ASYNC USAGE --------------");
            println!("SET result: {}", set_result?);
            follow_up.get("async-key")?.await
        })
        .await?;
    println!("GET value: {}", display(value));
    Ok(())
}

async fn reactive_usage(conn: &Connection) -> Result<()> {
    let reactive = conn.reactive();
    reactive
        .set("reactive-key", "hi from reactive")?
        .do_on_next(|_| println!("-------------- REACTIVE USAGE --------------"))
        .do_on_next(|result| println!("SET result: {result}"))
        .then(reactive.get("reactive-key")?)
        .do_on_next(|value| println!("GET value: {value}"))
        .single()
        .await?;
    Ok(())
}

async fn pubsub_usage(pubsub: &PubSubChannel) -> Result<()> {
    pubsub
        .subscribe("chat", |channel: &str, message: &str| {
            println!("[SUB] Received message: {message} on channel: {channel}");
        })
        .await
        .context("subscribing to chat")?;
    println!("[SUB] Subscribed on channel: chat");

    pubsub.publish("chat", "Hey from ModalKV Pub/Sub!").await?;
    pubsub.publish("chat", "Another message").await?;

    // Handlers run on the subscription thread; give them a moment to print.
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(())
}

fn display(value: Option<String>) -> String {
    value.unwrap_or_else(|| "null".to_string())
}

fn ttl_secs(status: TtlStatus) -> i64 {
    status.to_reply()
}
