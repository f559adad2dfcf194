use std::sync::Arc;

use sqlx::PgPool;
use tracing::{error, info, warn};

use flowbridge_api::app::{build_app, AppServices};
use flowbridge_api::settings::Settings;
use flowbridge_engine::{LivePlatform, PollingScheduler, RunOrchestrator, SchedulerConfig};
use flowbridge_payments::{
    MockPaymentService, PaymentGatewayClient, PaymentGatewayConfig, PaymentService,
};
use flowbridge_storage::{
    InMemoryRunStore, InMemorySessionStore, PgRunStore, PgSessionStore, RunStore, SessionStore,
};
use flowbridge_upstream::{
    FlowCatalog, FlowCatalogConfig, SessionConfig, SessionManager, UpstreamClient,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    flowbridge_observability::init();
    let settings = Settings::from_env();
    info!("starting flowbridge");

    let (run_store, session_store): (Arc<dyn RunStore>, Arc<dyn SessionStore>) =
        match &settings.database_url {
            Some(url) => {
                let pool = PgPool::connect(url).await?;
                PgRunStore::migrate(&pool).await?;
                info!("database ready");
                (
                    Arc::new(PgRunStore::new(pool.clone())),
                    Arc::new(PgSessionStore::new(pool)),
                )
            }
            None => {
                warn!("DATABASE_URL not set; using in-memory stores");
                (
                    Arc::new(InMemoryRunStore::new()),
                    Arc::new(InMemorySessionStore::new()),
                )
            }
        };

    let mut session_config = SessionConfig::default().with_base_url(&settings.upstream_base_url);
    if let (Some(username), Some(password)) =
        (&settings.upstream_username, &settings.upstream_password)
    {
        session_config = session_config.with_credentials(username, password);
    }
    if let Some(api_key) = &settings.upstream_api_key {
        session_config = session_config.with_api_key(api_key);
    }

    let session = SessionManager::new(session_config, session_store);
    session.preload().await;

    let client = UpstreamClient::new(session.clone());
    let catalog = Arc::new(FlowCatalog::new(client.clone(), FlowCatalogConfig::default()));
    let platform = Arc::new(LivePlatform::new(client, catalog.clone()));

    let payments: Arc<dyn PaymentService> = if settings.payment_test_mode {
        Arc::new(MockPaymentService::default())
    } else {
        PaymentGatewayClient::new(
            PaymentGatewayConfig::default()
                .with_base_url(&settings.payment_base_url)
                .with_api_key(&settings.payment_api_key)
                .with_agent_identifier(&settings.payment_agent_identifier)
                .with_network(settings.network)
                .with_amount(settings.payment_amount, &settings.payment_unit),
        )
    };

    let orchestrator = RunOrchestrator::new(run_store, platform, payments, settings.network);

    // Re-attach confirmation subscriptions left over from the previous
    // process life. Not fatal: the service still works without them.
    if let Err(e) = orchestrator.resume_monitoring().await {
        error!(error = %e, "failed to resume payment monitoring");
    }

    let scheduler = PollingScheduler::new(
        orchestrator.clone(),
        SchedulerConfig::default()
            .with_poll_interval(settings.poll_interval)
            .with_max_concurrent_checks(settings.max_concurrent_status_checks)
            .with_batch_delay(settings.batch_delay),
    );
    let scheduler_handle = scheduler.spawn();

    let services = Arc::new(AppServices {
        orchestrator,
        catalog,
        session: session.clone(),
    });
    let app = build_app(services);

    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    scheduler_handle.shutdown().await;
    session.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
