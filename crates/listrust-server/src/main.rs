//! ListRust - list manager entry point

use anyhow::Result;
use listrust_common::config::{Config, LoggingConfig};
use listrust_core::digest::DigestBuilder;
use listrust_core::dns::TrustDnsResolver;
use listrust_core::handlers::{ModerateHandler, ToDigestHandler, ToOutgoingHandler};
use listrust_core::rules::{AdministriviaRule, DmarcMitigationRule, OrgDomainCache, SuspiciousHeaderRule};
use listrust_core::{
    queues, DigestDispatcher, DigestMailboxes, HandlerRegistry, IncomingProcessor, ItemProcessor,
    RetryPolicy, RuleRegistry, Runner, Switchboard,
};
use listrust_storage::{DatabasePool, DbMailingListRepository, FileStorage, LocalStorage, MailingListStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config.logging);

    info!(hostname = %config.server.hostname, "Starting ListRust...");

    // Initialize list store
    let db_pool = DatabasePool::connect(&config.database).await?;
    let lists: Arc<dyn MailingListStore> = Arc::new(DbMailingListRepository::new(db_pool));

    // Initialize file storage
    let local = LocalStorage::new(&config.storage)?;
    local.remove_temp_files().await?;
    let storage: Arc<dyn FileStorage> = Arc::new(local);

    // Queues
    let retry = RetryPolicy::from(&config.queue);
    let switchboard = |name: &str| Arc::new(Switchboard::new(name, storage.clone(), retry));
    let incoming = switchboard(queues::IN);
    let digest = switchboard(queues::DIGEST);
    let out = switchboard(queues::OUT);
    let held = switchboard(queues::HELD);

    // Nothing is running yet, so every claim on disk is abandoned
    for queue in [&incoming, &digest] {
        queue.recover(None).await?;
    }

    // Digests
    let mailboxes = Arc::new(DigestMailboxes::new(storage.clone()));
    let dispatcher = Arc::new(DigestDispatcher::new(
        lists.clone(),
        mailboxes.clone(),
        digest.clone(),
    ));

    // Rules
    let mut rules = RuleRegistry::new();
    rules.register(Arc::new(AdministriviaRule::new(config.administrivia.clone())));
    rules.register(Arc::new(SuspiciousHeaderRule::new()));
    rules.register(Arc::new(DmarcMitigationRule::new(
        Arc::new(TrustDnsResolver::new(Duration::from_millis(
            config.dmarc.resolver_timeout_ms,
        ))),
        Arc::new(OrgDomainCache::new(config.dmarc.org_domain_data_url.clone())),
        Duration::from_millis(config.dmarc.resolver_lifetime_ms),
    )));
    let rules = rules.resolve(&config.pipeline.rules)?;

    // Handlers
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(ModerateHandler::new(held.clone())));
    handlers.register(Arc::new(ToDigestHandler::new(
        mailboxes.clone(),
        dispatcher.clone(),
    )));
    handlers.register(Arc::new(ToOutgoingHandler::new(out.clone())));
    let handlers = handlers.resolve(&config.pipeline.handlers)?;

    info!(rules = ?rules.names(), handlers = ?handlers.names(), "Pipeline configured");

    let incoming_processor: Arc<dyn ItemProcessor> =
        Arc::new(IncomingProcessor::new(lists.clone(), rules, handlers));
    let digest_builder: Arc<dyn ItemProcessor> =
        Arc::new(DigestBuilder::new(lists.clone(), mailboxes, out));

    let cancel = CancellationToken::new();
    let poll_interval = Duration::from_millis(config.queue.poll_interval_ms);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Start runners
    for (queue, processor, count) in [
        (&incoming, &incoming_processor, config.queue.incoming_runners),
        (&digest, &digest_builder, config.queue.digest_runners),
    ] {
        for i in 0..count {
            let runner = Runner::new(
                format!("{}-{}", queue.name(), i),
                queue.clone(),
                processor.clone(),
                poll_interval,
            );
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move { runner.run(cancel).await }));
        }
    }

    // Return claims left behind by stuck runners
    {
        let queues = vec![incoming.clone(), digest.clone()];
        let claim_timeout = Duration::from_secs(config.queue.claim_timeout_secs);
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(claim_timeout);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        for queue in &queues {
                            if let Err(e) = queue.recover(Some(claim_timeout)).await {
                                error!(queue = %queue.name(), error = %e, "Claim recovery failed");
                            }
                        }
                    }
                }
            }
        }));
    }

    // Periodic digests
    if let Some(secs) = config.digest.periodic_send_secs {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(secs));
            // The first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = dispatcher.send_periodic_digests().await {
                            error!(error = %e, "Periodic digest run failed");
                        }
                    }
                }
            }
        }));
        info!(interval_secs = secs, "Periodic digests enabled");
    }

    info!("ListRust started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Runners finish their current item before stopping
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Task ended abnormally");
        }
    }

    info!("ListRust shutdown complete");

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},listrust=debug", config.level)));

    let registry = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        registry
            .with(fmt::layer().json().with_target(true).with_level(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
