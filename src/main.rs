use anyhow::{Context, Result};
use bounce_tier::clock::system_clock;
use bounce_tier::config::AppConfig;
use bounce_tier::locker::ReconcileLocker;
use bounce_tier::policy::{PolicyContext, build_policy};
use bounce_tier::scheduler::BackgroundScheduler;
use bounce_tier::services::BounceService;
use bounce_tier::store::{BlobStore, LocalStore};
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, path::Path, sync::Arc};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config ---
    let cfg = AppConfig::from_env_and_args()?;
    tracing::info!("Starting bounce with config: {:?}", cfg);

    // --- Open both tiers ---
    let clock = system_clock();
    let near = open_store("near", &cfg.near_dir, &cfg.near_database_url).await?;
    let far = open_store("far", &cfg.far_dir, &cfg.far_database_url).await?;
    for store in [&near, &far] {
        store
            .create_container(&cfg.container)
            .await
            .with_context(|| format!("creating container {} in {}", cfg.container, store.id()))?;
    }

    // --- Build the policy ---
    let scheduler = BackgroundScheduler::new(clock.clone());
    let dispatcher = scheduler.start();
    let ctx = PolicyContext::new(near, far, ReconcileLocker::new(), scheduler.clone(), clock);
    let policy = build_policy(&cfg.policy, ctx).context("building policy")?;

    // --- Run one pass ---
    let service = BounceService::new();
    service.register(&cfg.container, policy);
    let status = service.bounce(&cfg.container)?;
    status.wait().await;

    // Delayed work queued by the pass runs before exit.
    let queued = scheduler.drain().await;
    if queued > 0 {
        tracing::info!("Ran {} queued reconciliation tasks", queued);
    }
    dispatcher.abort();

    println!("{}", serde_json::to_string_pretty(&status.snapshot())?);
    Ok(())
}

/// Prepare the payload directory and SQLite file of one tier, then open it.
async fn open_store(id: &str, dir: &str, db_url: &str) -> Result<Arc<dyn BlobStore>> {
    if !Path::new(dir).exists() {
        fs::create_dir_all(dir)?;
        tracing::info!("Created {} storage directory at {}", id, dir);
    }

    // Extract the local file path SQLx will use
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted {} SQLite path => {}", id, db_path);

    let db_path_obj = Path::new(db_path);
    if let Some(parent) = db_path_obj.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // SQLx will not create the database file itself
    match fs::OpenOptions::new().create(true).append(true).open(db_path) {
        Ok(_) => tracing::debug!("{} database file is usable", id),
        Err(e) => tracing::warn!("Failed to open {} manually: {}", db_path, e),
    }

    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
            .with_context(|| format!("connecting to {}", db_url))?,
    );

    let store = LocalStore::new(id, db, dir);
    store.migrate().await?;
    Ok(Arc::new(store))
}
