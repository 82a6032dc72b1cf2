use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{deliver, http_client, init_error, outbox, send, Outbox};
use crate::config::TelegramConfig;
use crate::event::EventHandler;
use crate::orchestrator::Notifier;
use crate::Result;

const NAME: &str = "Telegram";
const API_BASE: &str = "https://api.telegram.org";

/// Sends events to one Telegram chat through the Bot API.
pub struct TelegramNotifier {
    client: reqwest::Client,
    base_url: String,
    token: String,
    chat_id: i64,
    outbox: Arc<Outbox>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl TelegramNotifier {
    pub fn new(cfg: &TelegramConfig) -> Result<Self> {
        let token = cfg.token.trim();
        validate_token(token)?;
        // Group chats have negative ids.
        let chat_id = cfg
            .chat_id
            .trim()
            .parse::<i64>()
            .map_err(|_| init_error(NAME, format!("invalid chat id {:?}", cfg.chat_id)))?;

        let (outbox, rx) = outbox();
        Ok(Self {
            client: http_client(NAME)?,
            base_url: API_BASE.to_string(),
            token: token.to_string(),
            chat_id,
            outbox: Arc::new(outbox),
            rx,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// Bot tokens look like `<numeric bot id>:<secret>`.
fn validate_token(token: &str) -> Result<()> {
    if token.is_empty() {
        return Err(init_error(NAME, "bot token is empty"));
    }
    match token.split_once(':') {
        Some((id, secret))
            if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) && !secret.is_empty() =>
        {
            Ok(())
        }
        _ => Err(init_error(NAME, "bot token is malformed")),
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &'static str {
        NAME
    }

    fn handler(&self) -> Arc<dyn EventHandler> {
        self.outbox.clone()
    }

    async fn start(self: Box<Self>, token: CancellationToken) -> Result<()> {
        let Self {
            client,
            base_url,
            token: bot_token,
            chat_id,
            rx,
            ..
        } = *self;
        let url = format!("{}/bot{}/sendMessage", base_url, bot_token);

        deliver(NAME, rx, token, |text| {
            send(
                client
                    .post(&url)
                    .json(&serde_json::json!({ "chat_id": chat_id, "text": text })),
            )
        })
        .await
    }
}
