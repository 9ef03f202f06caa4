use std::sync::Arc;

use log::info;

use hris_installer::api;
use hris_installer::config::Config;
use hris_installer::database::PgDatabase;
use hris_installer::installer::Installer;
use hris_installer::utils::logging::mask_connection_string;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = Arc::new(Config::from_env());
    info!(
        "[PHASE: startup] Configuration loaded (bundle_url={}, work_dir={:?}, db={})",
        config.http.bundle_url,
        config.http.work_dir,
        mask_connection_string(&config.db.display_url())
    );

    // The pool is lazy: a broken database configuration surfaces at the
    // CONNECT_DB step of a run, not at startup.
    let database = Arc::new(PgDatabase::connect_lazy(&config.db));
    let installer = Arc::new(Installer::new(Arc::clone(&config), database));

    let app = api::create_router(installer);
    let addr = format!("0.0.0.0:{}", config.http.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("[PHASE: startup] HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("[PHASE: shutdown] Server stopped");
    Ok(())
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            writeln!(
                buf,
                "[{}] [{}] [{}] {}",
                timestamp,
                record.level(),
                record.module_path().unwrap_or("unknown"),
                record.args()
            )
        })
        .init();
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("[PHASE: shutdown] Shutdown signal received");
    }
}
