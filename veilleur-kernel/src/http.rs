/**
 * API REST VEILLEUR - Serveur HTTP principal du kernel
 *
 * RÔLE :
 * Ce module expose le point d'entrée NRDP des agents passifs et les routes
 * d'inspection pour humains et outils.
 *
 * FONCTIONNEMENT :
 * - POST / : soumission NRDP (formulaire XMLDATA), chaque résultat est
 *   spoolé pour le moteur et enregistré dans le ledger
 * - GET /hosts, /services : vue du ledger avec indicateur de staleness
 * - GET /health, /system/health : liveness et compteurs internes
 *
 * UTILITÉ DANS VEILLEUR :
 * 🎯 Ingestion : les agents NRDP existants pointent ici sans modification
 * 🎯 Debug/administration : inspection du ledger en temps réel
 */

use crate::config::KernelConfig;
use crate::health::HealthTracker;
use crate::ledger::{HostRecord, Ledger, ServiceRecord};
use crate::models::{parse_xmldata, summarize};
use crate::spool::SpoolWriter;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, error, warn};

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<KernelConfig>,
    pub ledger: Arc<Ledger>,
    pub spool: Arc<SpoolWriter>,
    pub health: HealthTracker,
    /// Copie du seuil nagios.stale_threshold, pour le flag `stale` des vues
    pub stale_threshold_secs: i64,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", post(submit_checks))
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/hosts", get(get_hosts))
        .route("/services", get(get_services))
        .with_state(app_state)
}

#[derive(Debug, Deserialize)]
struct NrdpForm {
    #[serde(rename = "XMLDATA")]
    xmldata: Option<String>,
}

// POST / (soumission NRDP)
async fn submit_checks(
    State(app): State<AppState>,
    Form(form): Form<NrdpForm>,
) -> (StatusCode, Json<serde_json::Value>) {
    let Some(xmldata) = form.xmldata else {
        return error_response(StatusCode::BAD_REQUEST, "missing XMLDATA field");
    };
    if app.cfg.logging.show_raw {
        debug!("raw XMLDATA: {}", xmldata);
    }

    let batch = match parse_xmldata(&xmldata) {
        Ok(batch) => batch,
        Err(e) => {
            warn!("rejecting malformed XMLDATA: {}", e);
            return error_response(StatusCode::BAD_REQUEST, &format!("invalid XMLDATA: {e}"));
        }
    };

    let now = OffsetDateTime::now_utc().unix_timestamp();
    let mut seen_hosts: HashSet<&str> = HashSet::new();
    let mut processed = 0u64;

    for result in &batch.results {
        if result.hostname.is_empty() {
            warn!("skipping check result without hostname");
            continue;
        }

        // le spool d'abord : si le moteur ne peut pas recevoir, on refuse
        if let Err(e) = app.spool.write(result).await {
            error!("cannot spool check for {}: {}", result.hostname, e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "spool write failed");
        }

        // le ledger ensuite, best-effort : une erreur ici ne perd pas le check
        if seen_hosts.insert(result.hostname.as_str()) {
            if let Err(e) = app.ledger.upsert_host(&result.hostname, now).await {
                warn!("cannot record host {} in ledger: {}", result.hostname, e);
            }
        }
        if !result.servicename.is_empty() {
            if let Err(e) = app
                .ledger
                .upsert_service(&result.hostname, &result.servicename, now)
                .await
            {
                warn!(
                    "cannot record service {}/{} in ledger: {}",
                    result.hostname, result.servicename, e
                );
            }
        }
        processed += 1;
    }

    app.health.record_batch(processed);
    debug!("processed batch of {} checks ({})", processed, summarize(&batch));

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": 0,
            "message": format!("OK: {} checks processed", processed),
        })),
    )
}

fn error_response(code: StatusCode, message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (code, Json(serde_json::json!({ "status": -1, "message": message })))
}

#[derive(serde::Serialize)]
struct HostView {
    hostname: String,
    last_seen: String, // format RFC3339 pour l'API
    stale: bool,
    stale_for_seconds: i64,
}

#[derive(serde::Serialize)]
struct ServiceView {
    hostname: String,
    service_description: String,
    last_seen: String,
    stale: bool,
    stale_for_seconds: i64,
}

fn format_ts(ts: i64) -> String {
    OffsetDateTime::from_unix_timestamp(ts)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| ts.to_string())
}

fn to_host_view(h: &HostRecord, now: i64, threshold: i64) -> HostView {
    let age = (now - h.last_seen).max(0);
    HostView {
        hostname: h.hostname.clone(),
        last_seen: format_ts(h.last_seen),
        stale: age > threshold,
        stale_for_seconds: age,
    }
}

fn to_service_view(s: &ServiceRecord, now: i64, threshold: i64) -> ServiceView {
    let age = (now - s.last_seen).max(0);
    ServiceView {
        hostname: s.hostname.clone(),
        service_description: s.service_description.clone(),
        last_seen: format_ts(s.last_seen),
        stale: age > threshold,
        stale_for_seconds: age,
    }
}

// GET /hosts (liste triée)
async fn get_hosts(State(app): State<AppState>) -> Result<Json<Vec<HostView>>, StatusCode> {
    let hosts = app
        .ledger
        .list_hosts()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let list = hosts
        .iter()
        .map(|h| to_host_view(h, now, app.stale_threshold_secs))
        .collect();
    Ok(Json(list))
}

// GET /services (liste triée)
async fn get_services(State(app): State<AppState>) -> Result<Json<Vec<ServiceView>>, StatusCode> {
    let services = app
        .ledger
        .list_services()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let list = services
        .iter()
        .map(|s| to_service_view(s, now, app.stale_threshold_secs))
        .collect();
    Ok(Json(list))
}

// GET /system/health (compteurs internes)
async fn get_system_health(State(app): State<AppState>) -> Json<crate::health::KernelHealth> {
    let (hosts, services) = app.ledger.counts().await;
    Json(app.health.snapshot(hosts, services))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_view_staleness_boundary() {
        let record = HostRecord { hostname: "web1".into(), last_seen: 1000 };
        // âge == seuil : pas encore stale
        let view = to_host_view(&record, 1000 + 300, 300);
        assert!(!view.stale);
        assert_eq!(view.stale_for_seconds, 300);
        // une seconde de plus : stale
        let view = to_host_view(&record, 1000 + 301, 300);
        assert!(view.stale);
    }

    #[test]
    fn test_view_clamps_future_timestamps() {
        // last_seen dans le futur (horloge d'agent en avance) : âge 0, pas stale
        let record = HostRecord { hostname: "web1".into(), last_seen: 2000 };
        let view = to_host_view(&record, 1000, 300);
        assert!(!view.stale);
        assert_eq!(view.stale_for_seconds, 0);
    }

    #[test]
    fn test_format_ts() {
        assert_eq!(format_ts(0), "1970-01-01T00:00:00Z");
        let record = ServiceRecord {
            hostname: "web1".into(),
            service_description: "HTTP".into(),
            last_seen: 1690000000,
        };
        let view = to_service_view(&record, 1690000000, 300);
        assert!(view.last_seen.starts_with("2023-07-22T"));
    }
}
