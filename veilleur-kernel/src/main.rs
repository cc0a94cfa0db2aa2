/**
 * VEILLEUR KERNEL - Point d'entrée principal du récepteur de checks passifs
 *
 * RÔLE : Orchestration de tous les modules : config, ingestion NRDP, spool,
 * ledger, générateur de config Nagios, watcher de reload.
 * Bootstrap du système complet avec gestion d'erreurs et logging.
 *
 * ARCHITECTURE : API REST d'ingestion + registre persistant last_seen +
 * boucle de régénération de config avec purge des entrées périmées.
 * UTILITÉ : Fait le pont entre des agents NRDP passifs et un moteur Nagios
 * dont la config suit d'elle-même le parc encore vivant.
 */

mod config;
mod generator;
mod health;
mod http;
mod ledger;
mod models;
mod reload;
mod spool;

use crate::config::load_config;
use crate::generator::Generator;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::ledger::Ledger;
use crate::spool::SpoolWriter;

use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

fn init_tracing(level: &str) {
    // RUST_LOG prime sur logging.level quand il est défini
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("veilleur_kernel={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok(); // Ok si .env n'existe pas

    let cfg = match load_config().await {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("[kernel] failed to load config: {e:#}");
            std::process::exit(1);
        }
    };
    init_tracing(&cfg.logging.level);
    if let Err(e) = cfg.validate() {
        eprintln!("[kernel] invalid config: {e:#}");
        std::process::exit(1);
    }
    let cfg = Arc::new(cfg);

    // registre last_seen persistant
    let ledger = match Ledger::open(&cfg.ledger.path).await {
        Ok(ledger) => Arc::new(ledger),
        Err(e) => {
            eprintln!("[kernel] cannot open ledger {}: {e}", cfg.ledger.path);
            std::process::exit(1);
        }
    };

    // dépôt des checkresults pour le moteur
    let pause = match cfg.spool.pause_duration() {
        Ok(pause) => pause,
        Err(e) => {
            eprintln!("[kernel] {e:#}");
            std::process::exit(1);
        }
    };
    let spool = Arc::new(SpoolWriter::new(
        &cfg.spool.output_dir,
        cfg.spool.group_name.clone(),
        cfg.spool.max_files,
        cfg.spool.min_disk_space_percent,
        pause,
    ));
    if let Err(e) = spool.ensure_writable() {
        eprintln!("[kernel] spool dir {} not writable: {e}", cfg.spool.output_dir);
        std::process::exit(1);
    }

    let health = HealthTracker::new();

    // générateur de config + watcher de reload
    let (generator, reload_rx) = match Generator::new(&cfg.nagios, ledger.clone(), health.clone()) {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("[kernel] cannot start config generator: {e:#}");
            std::process::exit(1);
        }
    };
    let stale_threshold_secs = match cfg.nagios.stale_threshold() {
        Ok(threshold) => threshold.as_secs() as i64,
        Err(e) => {
            eprintln!("[kernel] {e:#}");
            std::process::exit(1);
        }
    };

    // le sender reste en vie toute la durée du process, le watch sert aux
    // arrêts contrôlés du générateur
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    Arc::new(generator).spawn(shutdown_rx);
    reload::spawn_reload_watcher(reload_rx, cfg.nagios.clone());

    // fabrique l'état unique pour Axum
    let app_state = AppState {
        cfg: cfg.clone(),
        ledger,
        spool,
        health,
        stale_threshold_secs,
    };

    // HTTP
    let app = http::build_router(app_state);

    info!("listening on http://{}", cfg.server.listen_addr);
    let listener = match TcpListener::bind(&cfg.server.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("[kernel] cannot bind {}: {e}", cfg.server.listen_addr);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("[kernel] http server error: {e}");
        std::process::exit(1);
    }
}
