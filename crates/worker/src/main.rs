use std::sync::Arc;

use anyhow::Context;
use optti_client::{ApiClient, InMemoryOptionStore, ReqwestTransport, SecretCipher, SecretStore};
use optti_queue::{
    DeferredScheduler, JobStore, JobProcessor, Queue, QueueNamespace, QueueRunner, SqliteJobStore,
    TokioScheduler,
};
use optti_worker::{AltTextProcessor, Settings, SqliteMediaLibrary};
use sqlx::sqlite::SqlitePoolOptions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    optti_observability::init();

    let settings = Settings::from_env().context("invalid worker configuration")?;

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&settings.database_url)
        .await
        .with_context(|| format!("failed to open {}", settings.database_url))?;

    let namespace = QueueNamespace::new(&settings.plugin_slug);
    let store = SqliteJobStore::new(pool.clone(), &namespace);
    store.create_table().await.context("failed to create queue table")?;

    let media = SqliteMediaLibrary::new(
        pool,
        namespace.slug(),
        settings.image_url_template.clone(),
        settings.site_url.clone(),
    );
    media.create_table().await.context("failed to create media table")?;

    let cipher = settings.auth_salt.as_deref().map(SecretCipher::from_salt);
    let secrets = SecretStore::new(InMemoryOptionStore::arc(), cipher);
    if let Some(license_key) = settings.license_key.as_deref() {
        secrets.set_license_key(license_key);
    }
    if let Some(token) = settings.auth_token.as_deref() {
        secrets.set_token(token);
    }
    let client = ApiClient::new(ReqwestTransport::new(), secrets, settings.client_config());

    let (scheduler, mut triggers) = TokioScheduler::new();
    let scheduler: Arc<dyn DeferredScheduler> = Arc::new(scheduler);
    let queue = Arc::new(Queue::new(store, scheduler, namespace.clone()));

    let processor = AltTextProcessor::new(Arc::new(client), media);
    let runner = QueueRunner::new(queue.clone(), processor, settings.runner_config());

    tracing::info!(
        source = "worker",
        queue = %namespace,
        table = queue.store().table(),
        backend = %settings.backend_url,
        "worker started"
    );

    run_cycle(&runner).await;
    let mut sweep = tokio::time::interval(settings.sweep_interval);
    sweep.tick().await;

    loop {
        tokio::select! {
            Some(hook) = triggers.recv() => {
                if hook == namespace.hook_name() {
                    run_cycle(&runner).await;
                }
            }
            _ = sweep.tick() => run_cycle(&runner).await,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(source = "worker", "shutdown requested");
                break;
            }
        }
    }
    Ok(())
}

async fn run_cycle<S: JobStore, P: JobProcessor>(runner: &QueueRunner<S, P>) {
    if let Err(err) = runner.run_once().await {
        tracing::error!(source = "worker", error = %err, "queue cycle failed");
    }
}
