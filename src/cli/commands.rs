use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::proxy_pool::ProxyPool;
use crate::session::{AccountIdentity, AccountOptions, Credentials, SessionOrchestrator};

use super::template;

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Run { config } => run(config).await?,
        Commands::Probe { config, timeout_ms } => probe(config, *timeout_ms).await?,
        Commands::Check { config } => check(config)?,
        Commands::Template { output } => template::generate_config_template(output.as_deref())?,
    }

    Ok(())
}

fn load_config(path: &str) -> Result<AppConfig> {
    let path = crate::config::expand_path(path);
    let path = path.to_string_lossy();
    info!("Loading configuration from: {}", path);
    AppConfig::load(&path)
}

/// 启动所有账号，运行到 Ctrl-C
async fn run(config_path: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let pool = Arc::new(config.build_pool()?);
    info!(
        "Relay pool: {} relays ({} available)",
        pool.len(),
        pool.available_count()
    );

    let orchestrator = SessionOrchestrator::new(
        pool.clone(),
        config.connection_config()?,
        config.session_config(),
    );
    let activities = config.build_activities()?;

    let mut changes = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(change) = changes.recv().await {
            info!("[{}] {} -> {}", change.account, change.from, change.to);
        }
    });

    let starts = config.accounts.iter().map(|account| {
        let orchestrator = orchestrator.clone();
        let identity = AccountIdentity::new(
            account.id.clone(),
            account
                .platform
                .clone()
                .unwrap_or_else(|| config.gate.platform.clone()),
        );
        let credentials = Credentials::new(account.code.clone());
        let options = AccountOptions {
            direct: account.direct,
            activities: activities.clone(),
        };
        async move {
            let id = identity.id.clone();
            if let Err(e) = orchestrator.start_with(identity, credentials, options).await {
                error!("[{}] Failed to start: {}", id, e);
            }
        }
    });
    futures::future::join_all(starts).await;

    let online = orchestrator
        .list()
        .iter()
        .filter(|s| s.state == crate::session::AccountState::Online)
        .count();
    info!(
        "{}/{} accounts online, press Ctrl-C to stop",
        online,
        config.accounts.len()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    orchestrator.stop_all().await;
    save_health(&config, &pool);
    Ok(())
}

fn save_health(config: &AppConfig, pool: &ProxyPool) {
    if let Some(path) = config.health_file() {
        if let Err(e) = pool.save_health(&path) {
            warn!("Failed to save relay health: {:#}", e);
        }
    }
}

/// 探测所有中继
async fn probe(config_path: &str, timeout_ms: Option<u64>) -> Result<()> {
    let config = load_config(config_path)?;
    let pool = config.build_pool()?;
    if pool.is_empty() {
        println!("No relays configured");
        return Ok(());
    }

    let timeout = Duration::from_millis(timeout_ms.unwrap_or(config.proxy_pool.probe_timeout_ms));
    info!("Probing {} relays (timeout {:?})", pool.len(), timeout);
    let report = pool.probe_all(timeout).await;

    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(success) => println!(
                "✓ {:<48} {:>6} ms  exit {}",
                outcome.url.masked(),
                success.latency_ms,
                success.exit_ip
            ),
            Err(e) => println!("✗ {:<48} {}", outcome.url.masked(), e),
        }
    }
    println!(
        "\n{} ok, {} failed, {} available",
        report.succeeded(),
        report.failed(),
        pool.available_count()
    );

    save_health(&config, &pool);
    Ok(())
}

/// 检查配置文件
fn check(config_path: &str) -> Result<()> {
    let path = crate::config::expand_path(config_path);
    if !path.exists() {
        println!("✗ Configuration file not found: {}", path.display());
        anyhow::bail!("Configuration file not found: {}", path.display());
    }
    println!("Checking configuration file: {}\n", path.display());

    let config = match AppConfig::load(&path.to_string_lossy()) {
        Ok(config) => config,
        Err(e) => {
            println!("✗ {:#}", e);
            return Err(e);
        }
    };

    println!("✓ Gate: {}", config.gate.server_url);
    println!("✓ Client version: {}", config.gate.client_version);
    println!("✓ Accounts: {}", config.accounts.len());
    for account in &config.accounts {
        println!(
            "  - {} ({}{})",
            account.id,
            account.platform.as_deref().unwrap_or(&config.gate.platform),
            if account.direct { ", direct" } else { "" }
        );
    }
    match config.build_pool() {
        Ok(pool) => println!("✓ Relays: {}", pool.len()),
        Err(e) => println!("⚠ Warning: {:#}", e),
    }
    println!("✓ Activities: {}", config.activities.len());
    println!("\n✓ Configuration is valid!");
    Ok(())
}
