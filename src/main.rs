use std::{process, sync::Arc};

use tagcache::{
    cache::{Backend, CacheConfig, CacheService, MemoryBackend, RedisBackend, Tag, WriteBehind},
    config::{self, Settings, StoreSettings},
    error::AppError,
    infra::{
        error::InfraError,
        http::{self, AdminState},
        telemetry,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    if let Some(err) = settings.cache_error.as_ref() {
        warn!(
            target = "tagcache::config",
            error = %err,
            "Invalid cache configuration; caching disabled"
        );
    }

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Invalidate(args) => run_invalidate(settings, args).await,
        config::Command::Members(args) => run_members(settings, args).await,
    }
}

/// Build the cache service. A store URL that cannot even be parsed into a pool
/// leaves the process running with caching disabled.
fn build_service(store: &StoreSettings, cache: CacheConfig) -> Arc<CacheService> {
    match RedisBackend::connect(&store.url, store.pool_size.get() as usize, store.timeout) {
        Ok(backend) => Arc::new(CacheService::new(cache, Arc::new(backend))),
        Err(err) => {
            warn!(
                target = "tagcache::store",
                error = %err,
                url = %store.url,
                "Failed to build store pool; caching disabled"
            );
            let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
            Arc::new(CacheService::new(CacheConfig::disabled(), backend))
        }
    }
}

async fn run_serve(settings: Settings) -> Result<(), AppError> {
    let Settings {
        server,
        store,
        cache,
        ..
    } = settings;

    let service = build_service(&store, cache);
    let config = service.config().clone();

    let mut background = Vec::new();
    let writer = if service.is_enabled() {
        if !service.store().probe().await {
            warn!(
                target = "tagcache::store",
                url = %store.url,
                "Backing store unreachable at startup; serving uncached until it recovers"
            );
        }
        background.push(
            service
                .store()
                .spawn_health_probe(config.health_check_interval),
        );
        background.push(service.stats().spawn_reporter(config.stats_interval));
        let (writer, handle) = WriteBehind::spawn(Arc::clone(&service), config.write_queue_limit);
        background.push(handle);
        Some(writer)
    } else {
        None
    };

    let router = http::build_admin_router(AdminState {
        service: Arc::clone(&service),
        writer: writer.clone(),
    });

    let listener = tokio::net::TcpListener::bind(server.addr)
        .await
        .map_err(InfraError::from)?;
    info!(
        target = "tagcache::server",
        addr = %server.addr,
        enabled = service.is_enabled(),
        prefix = %config.prefix,
        "Cache admin listening"
    );

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    if let Some(writer) = writer {
        let drain = tokio::time::timeout(server.graceful_shutdown, writer.flush()).await;
        if !matches!(drain, Ok(true)) {
            warn!(
                target = "tagcache::server",
                "Pending cache writes were not drained before shutdown"
            );
        }
    }
    for handle in background {
        handle.abort();
        let _ = handle.await;
    }

    info!(target = "tagcache::server", "Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!(target = "tagcache::server", "Shutdown signal received");
}

async fn connect_for_command(settings: Settings) -> Result<Arc<CacheService>, AppError> {
    let Settings { store, cache, .. } = settings;
    if !cache.is_enabled() {
        return Err(AppError::unexpected("cache is disabled by configuration"));
    }
    let service = build_service(&store, cache);
    if !service.is_enabled() || !service.store().probe().await {
        return Err(InfraError::store(format!("store at {} is unreachable", store.url)).into());
    }
    Ok(service)
}

async fn run_invalidate(settings: Settings, args: config::InvalidateArgs) -> Result<(), AppError> {
    let service = connect_for_command(settings).await?;
    let tags: Vec<Tag> = args.tags.into_iter().map(Tag::new).collect();
    let invalidated = service.invalidate(&tags).await;

    let output = serde_json::json!({
        "tags": tags,
        "invalidated": invalidated,
    });
    println!("{output}");
    Ok(())
}

async fn run_members(settings: Settings, args: config::MembersArgs) -> Result<(), AppError> {
    let service = connect_for_command(settings).await?;
    for key in service.members_of(&Tag::new(args.tag)).await {
        println!("{key}");
    }
    Ok(())
}
