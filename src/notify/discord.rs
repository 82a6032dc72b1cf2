use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{deliver, http_client, init_error, outbox, send, Outbox};
use crate::config::DiscordConfig;
use crate::event::EventHandler;
use crate::orchestrator::Notifier;
use crate::Result;

const NAME: &str = "Discord";
const API_BASE: &str = "https://discord.com/api/v10";

/// Posts events to one Discord channel through the bot REST API.
pub struct DiscordNotifier {
    client: reqwest::Client,
    base_url: String,
    token: String,
    channel_id: u64,
    outbox: Arc<Outbox>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl DiscordNotifier {
    pub fn new(cfg: &DiscordConfig) -> Result<Self> {
        let token = cfg.token.trim();
        if token.is_empty() {
            return Err(init_error(NAME, "bot token is empty"));
        }
        let channel_id = cfg
            .channel_id
            .trim()
            .parse::<u64>()
            .map_err(|_| init_error(NAME, format!("invalid channel id {:?}", cfg.channel_id)))?;

        let (outbox, rx) = outbox();
        Ok(Self {
            client: http_client(NAME)?,
            base_url: API_BASE.to_string(),
            token: token.to_string(),
            channel_id,
            outbox: Arc::new(outbox),
            rx,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
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
            channel_id,
            rx,
            ..
        } = *self;
        let url = format!("{}/channels/{}/messages", base_url, channel_id);
        let auth = format!("Bot {}", bot_token);

        deliver(NAME, rx, token, |text| {
            send(
                client
                    .post(&url)
                    .header(reqwest::header::AUTHORIZATION, &auth)
                    .json(&serde_json::json!({ "content": text })),
            )
        })
        .await
    }
}
