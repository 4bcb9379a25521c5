//! `revrpc serve`: register as a resource and answer SEND payloads.
//!
//! Without `--exec` the resource echoes each payload. With `--exec CMD`
//! each payload is piped to `sh -c CMD` and the reply is its stdout.

use anyhow::{bail, Context, Result};
use revrpc_client::{EndpointConfig, ResourceBuilder};
use revrpc_core::{Ed25519Identity, RpcError, RpcResult};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

pub async fn run_serve(cfg: &EndpointConfig, exec: Option<&str>) -> Result<()> {
    if cfg.name.is_empty() {
        bail!("resource name required (--name or [endpoint] name)");
    }

    let mut builder = ResourceBuilder::from_config(cfg);
    if let Some(path) = cfg.key_path() {
        let identity = Ed25519Identity::load_or_generate(&path)
            .with_context(|| format!("failed to load key {}", path.display()))?;
        info!(fingerprint = %identity.fingerprint(), "signing registration");
        builder = builder.identity(Arc::new(identity));
    }
    builder = match exec {
        Some(command) => {
            let command = Arc::new(command.to_string());
            builder.on_send(move |payload: Vec<u8>| {
                let command = command.clone();
                async move { run_exec(&command, payload).await }
            })
        }
        None => builder.on_send(|payload: Vec<u8>| async move { Ok::<_, RpcError>(payload) }),
    };

    let port = cfg.resource_port();
    let handle = builder
        .connect(&cfg.host, port)
        .await
        .with_context(|| format!("cannot reach relay at {}:{port}", cfg.host))?;
    eprintln!(
        "serving {:?} via {}:{port} (Ctrl+C to stop)",
        handle.resource_name(),
        cfg.host
    );

    tokio::select! {
        _ = handle.closed() => {
            let reason = handle
                .lifecycle()
                .close_reason()
                .map(|r| r.to_string())
                .unwrap_or_default();
            bail!("relay closed the connection: {reason}");
        }
        _ = tokio::signal::ctrl_c() => {
            handle.shutdown();
            handle.closed().await;
        }
    }
    Ok(())
}

/// Run `command` with `payload` on stdin and return its stdout.
async fn run_exec(command: &str, payload: Vec<u8>) -> RpcResult<Vec<u8>> {
    debug!(command, len = payload.len(), "running exec handler");
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| RpcError::Internal(format!("cannot start {command:?}: {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        // A command that ignores its input may close stdin early.
        if let Err(e) = stdin.write_all(&payload).await {
            debug!(error = %e, "exec handler stopped reading stdin");
        }
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(RpcError::Internal(format!(
            "{command:?} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output.stdout)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use revrpc_core::status;

    #[tokio::test]
    async fn exec_pipes_payload() {
        let out = run_exec("tr a-z A-Z", b"hello".to_vec()).await.unwrap();
        assert_eq!(out, b"HELLO");
    }

    #[tokio::test]
    async fn exec_failure_is_internal_error() {
        let err = run_exec("echo broken >&2; exit 3", Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err.status(), status::INTERNAL_ERROR);
        assert!(err.to_string().contains("broken"));
    }
}
