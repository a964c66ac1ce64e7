//! `callbox-server probe`: a smoke test against a running relay.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use callbox_core::{ClientMessage, ConnectionId, ServerMessage, User};
use futures_util::{SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ProbeArgs;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no answer from {url} within {secs}s")]
    TimedOut { url: String, secs: u64 },
    #[error("relay closed the connection before replying")]
    Closed,
    #[error("relay refused the request ({kind}): {message}")]
    Refused { kind: String, message: String },
}

pub async fn run(args: ProbeArgs) -> Result<()> {
    let users = timeout(Duration::from_secs(args.timeout_secs), probe(&args))
        .await
        .map_err(|_| ProbeError::TimedOut {
            url: args.url.clone(),
            secs: args.timeout_secs,
        })??;
    println!("{}", serde_json::to_string_pretty(&users)?);
    Ok(())
}

async fn probe(args: &ProbeArgs) -> Result<Vec<User>> {
    let (mut stream, _) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.url))?;

    let connection_id = loop {
        if let ServerMessage::Identity { connection_id } = next_message(&mut stream).await? {
            break connection_id;
        }
    };
    debug!(connection_id = %connection_id, "relay assigned connection id");

    let user_id = args
        .user_id
        .clone()
        .unwrap_or_else(|| format!("probe-{}", Uuid::new_v4().simple()));
    let register = ClientMessage::Register {
        user_id: user_id.clone(),
        display_name: args.display_name.clone(),
    };
    stream
        .send(Message::Text(serde_json::to_string(&register)?.into()))
        .await
        .context("failed to send register")?;

    let users = wait_for_listing(&mut stream, connection_id).await?;
    info!(user_id = %user_id, online = users.len(), "registered with relay");
    let _ = stream.close(None).await;
    Ok(users)
}

async fn wait_for_listing<S>(stream: &mut S, connection_id: ConnectionId) -> Result<Vec<User>>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match next_message(stream).await? {
            ServerMessage::UserList { users }
                if users.iter().any(|user| user.connection_id == connection_id) =>
            {
                return Ok(users);
            }
            ServerMessage::Error { kind, message } => {
                return Err(ProbeError::Refused {
                    kind: kind.as_str().to_string(),
                    message,
                }
                .into());
            }
            other => debug!(kind = other.kind(), "skipping frame"),
        }
    }
}

async fn next_message<S>(stream: &mut S) -> Result<ServerMessage>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame.context("websocket read failed")? {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str())
                    .with_context(|| format!("unreadable frame from relay: {}", text.as_str()));
            }
            Message::Close(_) => bail!(ProbeError::Closed),
            _ => continue,
        }
    }
    Err(ProbeError::Closed.into())
}
