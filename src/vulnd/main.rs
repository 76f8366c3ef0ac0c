// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

use std::str::FromStr;
use std::sync::Arc;

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
    SqlitePool,
};
use tracing_subscriber::EnvFilter;

use vulnd::{
    auth::TokenVerifier,
    config::Config,
    controller::ContextBuilder,
    crypt::{CredentialCrypt, Key},
    directory::SqliteDirectory,
    gateway::Gateway,
    jobs::{self, result_poll::ResultPoll, scan_sync::ScanSync, vuln_fetch::VulnFetch},
    make_svc,
    queue::JobQueue,
    router::Router,
    sla::SlaPolicy,
};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

fn setup_log() {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::metadata::LevelFilter::INFO.into())
        .with_env_var("VULND_LOG")
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn setup_sqlite(config: &Config) -> Result<SqlitePool> {
    let address = if config.storage.database == ":memory:" {
        "sqlite::memory:".to_string()
    } else {
        format!("sqlite:{}", config.storage.database)
    };
    let options = SqliteConnectOptions::from_str(&address)?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(2))
        .create_if_missing(true);
    Ok(SqlitePool::connect_with(options).await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_log();
    let config = Config::load();

    let crypter = Arc::new(CredentialCrypt::new(match config.crypt.key.as_str() {
        "" => {
            tracing::warn!("no crypt key configured, stored credentials stay unreadable");
            Key::default()
        }
        passphrase => Key::from(passphrase),
    }));

    let pool = setup_sqlite(&config).await?;
    let directory = Arc::new(SqliteDirectory::init(pool.clone()).await?);
    let router = Arc::new(Router::new(directory.clone(), crypter.clone()));
    let gateway = Arc::new(Gateway::new(&config.external, directory.clone(), crypter)?);
    let queue = Arc::new(JobQueue::init(pool, config.sync.max_attempts).await?);

    let ctx = ContextBuilder::new(router.clone())
        .verifier(TokenVerifier::new(config.endpoints.token_key.as_bytes().to_vec()))
        .sla(SlaPolicy::from(&config.sla))
        .edit_buffer_minutes(config.endpoints.edit_buffer_minutes)
        .build();
    let controller = Arc::new(ctx);

    let abort = controller.abort.clone();
    let scan_sync = Arc::new(ScanSync::new(
        directory.clone(),
        router.clone(),
        gateway.clone(),
        config.sync.backup_repository_markers.clone(),
    ));
    tokio::spawn(jobs::run(
        "scan_sync",
        config.jobs.scan_sync.clone(),
        abort.clone(),
        move || {
            let job = scan_sync.clone();
            async move { job.run_once().await }
        },
    ));

    let result_poll = Arc::new(ResultPoll::new(
        directory,
        router.clone(),
        gateway.clone(),
        queue.clone(),
        config.sync.backup_repository_markers.clone(),
        config.sync.result_lookback,
    ));
    tokio::spawn(jobs::run(
        "result_poll",
        config.jobs.result_poll.clone(),
        abort.clone(),
        move || {
            let job = result_poll.clone();
            async move { job.run_once().await }
        },
    ));

    let vuln_fetch = Arc::new(VulnFetch::new(router, gateway, queue));
    tokio::spawn(jobs::run(
        "vuln_fetch",
        config.jobs.vuln_fetch.clone(),
        abort.clone(),
        move || {
            let job = vuln_fetch.clone();
            async move { job.run_once().await }
        },
    ));

    let addr = config.listener.address;
    let incoming = hyper::server::conn::AddrIncoming::bind(&addr)?;
    let addr = incoming.local_addr();
    let make_svc = make_svc!(&controller);
    let server = hyper::Server::builder(incoming).serve(make_svc);
    tracing::info!("listening on http://{}", addr);
    server.await?;
    Ok(())
}
