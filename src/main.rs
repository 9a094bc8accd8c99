use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{Router, routing::get, routing::post};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use logsift::alarm_engine::AlarmEngine;
use logsift::buffer::LogBuffer;
use logsift::config::LogsiftConfig;
use logsift::config_db::ConfigDb;
use logsift::fields::FieldRegistry;
use logsift::index::{IndexError, IndexStore};
use logsift::notify::Notifier;
use logsift::offsets::OffsetStore;
use logsift::redaction::RedactionEngine;
use logsift::retention::RetentionExecutor;
use logsift::scanner::Scanner;
use logsift::search::SearchExecutor;
use logsift::{AppState, handlers};

// CLI exit codes
const EXIT_CONFIG: i32 = 1;
const EXIT_INDEX_CORRUPT: i32 = 2;
const EXIT_BIND: i32 = 3;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("logsift=debug,tower_http=info")),
        )
        .init();

    let config_path =
        std::env::var("LOGSIFT_CONFIG").unwrap_or_else(|_| "./logsift.toml".to_string());
    let config = match LogsiftConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("invalid configuration at {config_path}: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let data_dir = PathBuf::from(&config.storage.data_dir);
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!("cannot create data dir {}: {e}", data_dir.display());
        std::process::exit(EXIT_CONFIG);
    }

    let config_db = match ConfigDb::open(data_dir.join("config.db").to_string_lossy().as_ref()) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            tracing::error!("cannot open config db: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };
    tracing::info!("config db opened at {}", data_dir.join("config.db").display());

    let redaction_config = config_db.get_redaction_config().unwrap_or_default();
    let redaction = Arc::new(RedactionEngine::new(&redaction_config));
    let field_configs = config_db.list_field_configurations().unwrap_or_default();
    let fields = Arc::new(FieldRegistry::new(&field_configs));

    let index = match IndexStore::open(
        &data_dir,
        &config.shard_configuration(),
        config.index_settings(),
        fields.clone(),
    ) {
        Ok(index) => Arc::new(index),
        Err(e @ IndexError::Corrupt { .. }) => {
            tracing::error!("fatal index corruption: {e}");
            std::process::exit(EXIT_INDEX_CORRUPT);
        }
        Err(e) => {
            tracing::error!("cannot open index: {e}");
            std::process::exit(EXIT_INDEX_CORRUPT);
        }
    };

    let offsets = match OffsetStore::open(data_dir.join("offsets.db").to_string_lossy().as_ref()) {
        Ok(offsets) => offsets,
        Err(e) => {
            tracing::error!("cannot open offsets db: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let shutdown = CancellationToken::new();
    let buffer = LogBuffer::start(
        config.buffer_settings(),
        index.clone(),
        redaction.clone(),
        fields.clone(),
    );
    let scanner = Scanner::new(
        config_db.clone(),
        offsets,
        buffer.clone(),
        config.scanner_settings(),
    );
    scanner.spawn(shutdown.clone());

    logsift::index::spawn_housekeeping(
        index.clone(),
        config.index.housekeep_interval_secs,
        shutdown.clone(),
    );

    let search = SearchExecutor::new(index.clone(), fields.clone(), config.search_settings());

    let retention = Arc::new(RetentionExecutor::new(config_db.clone(), index.clone()));
    if config.retention.enabled {
        retention
            .clone()
            .spawn(config.retention.interval_secs, shutdown.clone());
    } else {
        tracing::info!("retention executor disabled by config");
    }

    let notifier = Arc::new(Notifier::new(
        &config.smtp_from_env(),
        config.notify_settings(),
    ));
    let alarm_engine = Arc::new(AlarmEngine::new(
        config_db.clone(),
        search.clone(),
        notifier,
    ));
    if config.alarms.enabled {
        alarm_engine
            .clone()
            .spawn(config.alarms.eval_interval_secs, shutdown.clone());
    } else {
        tracing::info!("alarm engine disabled by config");
    }

    let state = AppState {
        config_db,
        index,
        search,
        buffer: buffer.clone(),
        scanner,
        retention,
        redaction,
        fields,
    };

    // One routing table, served under both prefixes.
    let api = api_routes();
    let app = Router::new()
        .nest("/api", api.clone())
        .nest("/api/v1", api)
        .route("/healthz", get(handlers::health::healthz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("cannot bind {addr}: {e}");
            std::process::exit(EXIT_BIND);
        }
    };
    tracing::info!("logsift listening on {addr}");

    let serve = axum::serve(listener, app).with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        }
    });
    if let Err(e) = serve.await {
        tracing::error!("server error: {e}");
    }

    // Drain pending ingestion before exiting so committed offsets and the
    // index agree.
    buffer.shutdown().await;
    tracing::info!("logsift stopped");
    std::process::exit(0);
}

fn api_routes() -> Router<AppState> {
    Router::new()
        // Search
        .route("/logs/search", get(handlers::logs::search))
        .route("/logs/search/page", get(handlers::logs::search))
        .route("/logs/search/stream", get(handlers::logs::search_stream))
        .route(
            "/logs/search/timetable/stream",
            get(handlers::logs::histogram_stream),
        )
        .route("/logs/time-aggregation", get(handlers::logs::time_aggregation))
        .route("/logs/histogram", get(handlers::logs::histogram))
        .route("/logs/count", get(handlers::logs::count))
        .route("/logs/fields", get(handlers::logs::fields))
        .route("/logs/sources", get(handlers::logs::sources))
        .route("/logs/levels", get(handlers::logs::levels))
        .route("/logs/export.csv", get(handlers::logs::export_csv))
        .route("/logs/export.json", get(handlers::logs::export_json))
        // Directory configs
        .route(
            "/logDirectoryConfigs",
            get(handlers::directories::list).post(handlers::directories::create),
        )
        .route(
            "/logDirectoryConfigs/{id}",
            get(handlers::directories::get)
                .put(handlers::directories::update)
                .delete(handlers::directories::delete),
        )
        .route(
            "/logDirectoryConfigs/{id}/scan",
            post(handlers::directories::scan),
        )
        .route(
            "/logDirectoryConfigs/scan-all",
            post(handlers::directories::scan_all),
        )
        // Retention policies
        .route(
            "/retentionPolicies",
            get(handlers::retention::list).post(handlers::retention::create),
        )
        .route(
            "/retentionPolicies/{id}",
            get(handlers::retention::get)
                .put(handlers::retention::update)
                .delete(handlers::retention::delete),
        )
        .route(
            "/retentionPolicies/{id}/apply",
            post(handlers::retention::apply),
        )
        .route(
            "/retentionPolicies/apply-all",
            post(handlers::retention::apply_all),
        )
        // Field configurations
        .route(
            "/fieldConfigurations",
            get(handlers::fields::list).post(handlers::fields::create),
        )
        .route(
            "/fieldConfigurations/{id}",
            get(handlers::fields::get)
                .put(handlers::fields::update)
                .delete(handlers::fields::delete),
        )
        .route("/fieldConfigurations/test", post(handlers::fields::test))
        // Redaction
        .route(
            "/redaction/config",
            get(handlers::redaction::get_config).put(handlers::redaction::put_config),
        )
        .route("/redaction/reload", post(handlers::redaction::reload))
        // Alarms
        .route(
            "/alarms",
            get(handlers::alarms::list).post(handlers::alarms::create),
        )
        .route(
            "/alarms/{id}",
            get(handlers::alarms::get)
                .put(handlers::alarms::update)
                .delete(handlers::alarms::delete),
        )
        .route("/alarms/{id}/toggle", post(handlers::alarms::toggle))
        .route("/alarms/events", get(handlers::alarms::list_events))
        .route(
            "/alarms/events/{id}/acknowledge",
            post(handlers::alarms::acknowledge),
        )
        .route("/alarms/events/{id}/resolve", post(handlers::alarms::resolve))
        .route("/alarms/statistics", get(handlers::alarms::statistics))
}
