//! Remote notification integrations.
//!
//! Each notifier hands the event bus an [`Outbox`] handler. The handler only
//! queues formatted text; the notifier's own task drains the queue and talks
//! to the remote API, so a slow network never stalls event dispatch.

mod discord;
mod telegram;

pub use discord::DiscordNotifier;
pub use telegram::TelegramNotifier;

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::event::{Event, EventHandler};
use crate::{Error, Result};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Event handler that queues one line per event.
pub struct Outbox {
    tx: mpsc::UnboundedSender<String>,
}

impl EventHandler for Outbox {
    fn handle(&self, event: &Event) {
        // The receiver only goes away once the notifier has stopped.
        let _ = self.tx.send(format_event(event));
    }
}

pub fn format_event(event: &Event) -> String {
    format!("[{}] {}", event.at.format("%H:%M:%S"), event.kind)
}

fn outbox() -> (Outbox, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Outbox { tx }, rx)
}

fn http_client(integration: &str) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| init_error(integration, e))
}

fn init_error(integration: &str, reason: impl ToString) -> Error {
    Error::Init {
        integration: integration.to_string(),
        reason: reason.to_string(),
    }
}

async fn send(request: reqwest::RequestBuilder) -> Result<()> {
    request.send().await?.error_for_status()?;
    Ok(())
}

/// Send queued messages until `token` fires. A failed delivery is logged and
/// the message dropped; a delivery still in flight when `token` fires is
/// abandoned.
async fn deliver<F, Fut>(
    integration: &'static str,
    mut rx: mpsc::UnboundedReceiver<String>,
    token: CancellationToken,
    mut send: F,
) -> Result<()>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    tracing::info!(integration, "notifier started");
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = rx.recv() => match next {
                Some(text) => tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    sent = send(text) => {
                        if let Err(e) = sent {
                            tracing::warn!(integration, error = %e, "notification not delivered");
                        }
                    }
                },
                None => {
                    token.cancelled().await;
                    break;
                }
            },
        }
    }
    tracing::info!(integration, "notifier stopped");
    Ok(())
}
