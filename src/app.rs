//! Process wiring: builds the real collaborators from configuration and
//! hands them to the orchestrator.

use std::sync::Arc;

use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::event::EventBus;
use crate::frontend::{HeadlessFrontEnd, TuiFrontEnd};
use crate::jobs::JobManager;
use crate::notify::{DiscordNotifier, TelegramNotifier};
use crate::orchestrator::{FrontEnd, IntegrationSpec, Notifier, Orchestrator};
use crate::render::Dashboard;
use crate::server::ControlServer;
use crate::{Error, Result};

/// Run tether until shutdown on a fresh multi-threaded runtime.
pub fn run(config: Config) -> Result<()> {
    Runtime::new()?.block_on(run_async(config))
}

async fn run_async(config: Config) -> Result<()> {
    let bus = Arc::new(EventBus::new());
    let jobs = Arc::new(JobManager::from_config(
        Arc::clone(&bus),
        config.grace(),
        config.load_jobs()?,
    ));
    let server = Arc::new(ControlServer::new(
        Arc::clone(&jobs),
        config.server.host.clone(),
        config.grace(),
    ));

    let front_end: Box<dyn FrontEnd> = if config.front_end.headless {
        Box::new(HeadlessFrontEnd)
    } else {
        Box::new(TuiFrontEnd::new(Dashboard::new(
            Arc::clone(&jobs),
            bus.subscribe(),
            config.server.port,
        )))
    };

    let orchestrator = Orchestrator::new(jobs.clone(), server, bus, front_end)
        .with_port(config.server.port)
        .with_signals(true)
        .with_integration(integrations::discord(&config))
        .with_integration(integrations::telegram(&config));

    jobs.start_autostart();
    let result = orchestrator.run(CancellationToken::new()).await;
    if let Err(Error::Init { .. }) = &result {
        // Nothing else was started, but autostarted jobs already run.
        jobs.stop_all().await;
    }
    result
}

mod integrations {
    use super::*;

    pub(super) fn discord(config: &Config) -> IntegrationSpec {
        let cfg = config.discord.clone();
        IntegrationSpec::new("Discord", cfg.enabled, move || {
            Ok(Box::new(DiscordNotifier::new(&cfg)?) as Box<dyn Notifier>)
        })
    }

    pub(super) fn telegram(config: &Config) -> IntegrationSpec {
        let cfg = config.telegram.clone();
        IntegrationSpec::new("Telegram", cfg.enabled, move || {
            Ok(Box::new(TelegramNotifier::new(&cfg)?) as Box<dyn Notifier>)
        })
    }
}
