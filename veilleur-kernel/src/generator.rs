/**
 * GENERATOR - Régénération de la configuration Nagios des hôtes actifs
 *
 * RÔLE :
 * Le cœur du kernel. À intervalle fixe : purge les entrées périmées du
 * ledger, relit les hôtes/services encore vivants, produit le texte de
 * configuration, et ne publie (écriture atomique tmp + rename) que si le
 * contenu a réellement changé. Chaque publication pousse un signal de
 * reload best-effort vers le watcher.
 *
 * FONCTIONNEMENT :
 * - Un cycle = Prune → Fetch → Render → Compare → Publish → Notify
 * - Échec de purge : loggé, le cycle continue avec ce qui reste
 * - Échec de lecture du ledger : le cycle est abandonné, le suivant réessaie
 * - Ledger vide : aucun write, la config publiée précédente reste en place
 * - Contenu identique à l'existant : ni write ni signal (supprime les
 *   reloads redondants côté moteur)
 * - Signal de reload : slot unique non bloquant, les signaux en trop sont
 *   fusionnés/abandonnés
 *
 * UTILITÉ DANS VEILLEUR :
 * 🎯 La config du moteur reflète en permanence les hôtes qui parlent encore
 * 🎯 Les hôtes décommissionnés disparaissent seuls après stale_threshold
 * 🎯 Le moteur n'est rechargé que quand quelque chose a changé
 */

use crate::config::NagiosConf;
use crate::health::HealthTracker;
use crate::ledger::{HostRecord, Ledger, ServiceRecord};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Nom du fichier publié dans nagios.output_dir
pub const GENERATED_FILE: &str = "veilleur_generated.cfg";

/// Paramètres de rendu, figés à la construction du générateur.
#[derive(Debug, Clone)]
pub struct RenderParams {
    pub host_template: String,
    pub service_template: String,
    /// Seuil de fraîcheur poussé dans chaque définition de service, en
    /// secondes (= stale_threshold : au-delà le moteur râle de lui-même)
    pub freshness_threshold_secs: u64,
}

/// Issue d'un cycle, exposée pour les tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Lecture du ledger ou publication impossible : cycle abandonné
    Aborted,
    /// Aucun hôte ni service actif : on ne touche pas au fichier publié
    NothingActive,
    /// Rendu identique au contenu publié : ni write ni signal
    Unchanged,
    Published { hosts: usize, services: usize, notified: bool },
}

/// Rendu pur et déterministe : mêmes entrées → mêmes octets.
/// Les hôtes sortent en ordre lexicographique croissant, les services d'un
/// hôte en ordre croissant de description. Un service dont l'hôte n'a pas
/// d'enregistrement propre n'est jamais émis.
pub fn render_config(
    hosts: &[HostRecord],
    services_by_host: &BTreeMap<String, Vec<ServiceRecord>>,
    params: &RenderParams,
) -> String {
    let mut sorted_hosts: Vec<&HostRecord> = hosts.iter().collect();
    sorted_hosts.sort_by(|a, b| a.hostname.cmp(&b.hostname));

    let mut out = String::new();
    for host in sorted_hosts {
        out.push_str("define host {\n");
        out.push_str(&format!("    use                 {}\n", params.host_template));
        out.push_str(&format!("    host_name           {}\n", host.hostname));
        // le hostname sert d'alias, on n'a rien de plus parlant
        out.push_str(&format!("    alias               {}\n", host.hostname));
        out.push_str("}\n\n");

        let Some(services) = services_by_host.get(&host.hostname) else {
            continue;
        };
        let mut sorted_services: Vec<&ServiceRecord> = services.iter().collect();
        sorted_services.sort_by(|a, b| a.service_description.cmp(&b.service_description));

        for service in sorted_services {
            out.push_str("define service {\n");
            out.push_str(&format!("    use                     {}\n", params.service_template));
            out.push_str(&format!("    host_name               {}\n", service.hostname));
            out.push_str(&format!(
                "    service_description     {}\n",
                service.service_description
            ));
            out.push_str("    check_command           check_dummy!0!OK\n");
            out.push_str("    active_checks_enabled   0\n");
            out.push_str("    passive_checks_enabled  1\n");
            out.push_str("    check_freshness         1\n");
            out.push_str(&format!(
                "    freshness_threshold     {}\n",
                params.freshness_threshold_secs
            ));
            out.push_str("    notification_interval   0\n");
            out.push_str("}\n\n");
        }
    }
    out
}

pub struct Generator {
    ledger: Arc<Ledger>,
    output_dir: PathBuf,
    params: RenderParams,
    interval: Duration,
    stale_threshold: Duration,
    reload_tx: mpsc::Sender<()>,
    health: HealthTracker,
}

impl Generator {
    /// Construit le générateur et le récepteur de signaux de reload associé.
    /// Les durées invalides sont des erreurs fatales de démarrage.
    pub fn new(
        cfg: &NagiosConf,
        ledger: Arc<Ledger>,
        health: HealthTracker,
    ) -> Result<(Self, mpsc::Receiver<()>)> {
        let interval = cfg.generation_interval().context("generator interval")?;
        let stale_threshold = cfg.stale_threshold().context("generator stale threshold")?;

        // slot unique : un signal en attente suffit, les suivants fusionnent
        let (reload_tx, reload_rx) = mpsc::channel(1);

        let generator = Self {
            ledger,
            output_dir: PathBuf::from(&cfg.output_dir),
            params: RenderParams {
                host_template: cfg.host_template.clone(),
                service_template: cfg.service_template.clone(),
                freshness_threshold_secs: stale_threshold.as_secs(),
            },
            interval,
            stale_threshold,
            reload_tx,
            health,
        };
        Ok((generator, reload_rx))
    }

    /// Lance la boucle périodique : un cycle immédiat au démarrage, puis un
    /// par intervalle, jusqu'au signal d'arrêt. Les ticks manqués ne
    /// s'empilent pas : au plus un cycle à la fois.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        info!(
            "config generator started (interval: {:?}, stale after: {:?}, output: {})",
            self.interval,
            self.stale_threshold,
            self.output_dir.display()
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_cycle().await;
                    }
                    _ = shutdown.changed() => {
                        info!("config generator stopped");
                        break;
                    }
                }
            }
        })
    }

    pub async fn run_cycle(&self) -> CycleOutcome {
        self.run_cycle_at(OffsetDateTime::now_utc().unix_timestamp()).await
    }

    /// Un cycle complet à l'instant `now` (timestamp Unix en secondes).
    /// Paramétré pour que les tests pilotent l'horloge.
    pub async fn run_cycle_at(&self, now: i64) -> CycleOutcome {
        debug!("running config generation cycle");

        // 1. Prune — les deux tables indépendamment, un échec n'arrête rien
        let cutoff = now - self.stale_threshold.as_secs() as i64;
        match self.ledger.delete_hosts_older_than(cutoff).await {
            Ok(0) => {}
            Ok(n) => info!("pruned {} stale hosts (last_seen < {})", n, cutoff),
            Err(e) => warn!("stale host pruning failed: {}", e),
        }
        match self.ledger.delete_services_older_than(cutoff).await {
            Ok(0) => {}
            Ok(n) => info!("pruned {} stale services (last_seen < {})", n, cutoff),
            Err(e) => warn!("stale service pruning failed: {}", e),
        }

        // 2. Fetch — un échec ici abandonne le cycle, le suivant réessaiera
        let hosts = match self.ledger.list_hosts().await {
            Ok(hosts) => hosts,
            Err(e) => {
                error!("cannot list hosts, aborting cycle: {}", e);
                return CycleOutcome::Aborted;
            }
        };
        let services = match self.ledger.list_services().await {
            Ok(services) => services,
            Err(e) => {
                error!("cannot list services, aborting cycle: {}", e);
                return CycleOutcome::Aborted;
            }
        };

        if hosts.is_empty() && services.is_empty() {
            debug!("ledger is empty, keeping previously published config untouched");
            return CycleOutcome::NothingActive;
        }

        // 3. Render
        let mut services_by_host: BTreeMap<String, Vec<ServiceRecord>> = BTreeMap::new();
        for service in &services {
            services_by_host
                .entry(service.hostname.clone())
                .or_default()
                .push(service.clone());
        }
        let rendered = render_config(&hosts, &services_by_host, &self.params);

        // 4. Compare — fichier absent == contenu vide
        let final_path = self.output_dir.join(GENERATED_FILE);
        let existing = match tokio::fs::read(&final_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!("cannot read {} for comparison: {}", final_path.display(), e);
                Vec::new()
            }
        };
        if rendered.as_bytes() == existing.as_slice() {
            debug!("generated config identical to published one, skipping write");
            return CycleOutcome::Unchanged;
        }

        // 5. Publish — tmp dans le même répertoire puis rename atomique.
        // Le nom temporaire est unique par cycle, deux cycles ne peuvent pas
        // s'écraser mutuellement un tmp en vol.
        let tmp_path = self
            .output_dir
            .join(format!("{GENERATED_FILE}.{}.tmp", Uuid::new_v4().simple()));
        if let Err(e) = tokio::fs::write(&tmp_path, rendered.as_bytes()).await {
            error!("cannot write temporary config {}: {}", tmp_path.display(), e);
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return CycleOutcome::Aborted;
        }
        if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
            error!(
                "cannot move {} into place at {}: {}",
                tmp_path.display(),
                final_path.display(),
                e
            );
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return CycleOutcome::Aborted;
        }

        info!(
            "published {} ({} hosts, {} services)",
            final_path.display(),
            hosts.len(),
            services.len()
        );
        self.health.mark_published();

        // 6. Notify — best-effort, jamais bloquant
        let notified = match self.reload_tx.try_send(()) {
            Ok(()) => {
                debug!("reload signal sent");
                true
            }
            Err(mpsc::error::TrySendError::Full(())) => {
                info!("reload signal already pending, coalescing");
                false
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                info!("no reload listener, dropping signal");
                false
            }
        };

        CycleOutcome::Published { hosts: hosts.len(), services: services.len(), notified }
    }
}
