//! `revrpc list | present | send | send-to | commands | stop`: User commands
//! against a relay.

use super::{format_reply, parse_data};
use anyhow::{Context, Result};
use revrpc_client::{ClientConfig, EndpointConfig, UserClient};
use tracing::debug;

async fn connect(cfg: &EndpointConfig) -> Result<UserClient> {
    debug!(host = %cfg.host, port = cfg.port, "connecting to relay");
    let config = ClientConfig {
        retry: cfg.retry_policy(),
        transport_log: cfg.transport_log,
    };
    UserClient::connect_with(&cfg.host, cfg.port, config)
        .await
        .with_context(|| format!("cannot reach relay at {}:{}", cfg.host, cfg.port))
}

pub async fn run_list(cfg: &EndpointConfig, prefix: &str, json: bool) -> Result<()> {
    let mut client = connect(cfg).await?;
    let names = client
        .list_resources(prefix)
        .await
        .context("LIST_RESOURCES failed")?;
    client.disconnect().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&names)?);
    } else if names.is_empty() {
        eprintln!("no resources");
    } else {
        for name in names {
            println!("{name}");
        }
    }
    Ok(())
}

pub async fn run_present(cfg: &EndpointConfig, name: &str) -> Result<()> {
    let mut client = connect(cfg).await?;
    let id = client
        .is_resource_present(name)
        .await
        .context("IS_RESOURCE_PRESENT failed")?;
    client.disconnect().await;
    println!("{id}");
    Ok(())
}

pub async fn run_send(cfg: &EndpointConfig, id: u64, data: &str, hex: bool) -> Result<()> {
    let payload = parse_data(data, hex)?;
    let mut client = connect(cfg).await?;
    let reply = client
        .send(id, &payload)
        .await
        .with_context(|| format!("send to resource {id} failed"))?;
    client.disconnect().await;
    println!("{}", format_reply(reply, hex));
    Ok(())
}

pub async fn run_send_to(cfg: &EndpointConfig, name: &str, data: &str, hex: bool) -> Result<()> {
    let payload = parse_data(data, hex)?;
    let mut client = connect(cfg).await?;
    let reply = client
        .send_to(name, &payload)
        .await
        .with_context(|| format!("send to {name:?} failed"))?;
    client.disconnect().await;
    println!("{}", format_reply(reply, hex));
    Ok(())
}

pub async fn run_commands(cfg: &EndpointConfig) -> Result<()> {
    let mut client = connect(cfg).await?;
    let codes = client
        .enum_commands()
        .await
        .context("ENUM_COMMANDS failed")?;
    client.disconnect().await;
    for code in codes {
        println!("{code:#010x}");
    }
    Ok(())
}

pub async fn run_stop(cfg: &EndpointConfig) -> Result<()> {
    let mut client = connect(cfg).await?;
    client.stop_server().await.context("relay refused to stop")?;
    client.disconnect().await;
    println!("relay stopping");
    Ok(())
}
