/**
 * LEDGER - Registre persistant "dernière vue" des hôtes et services
 *
 * RÔLE :
 * Chaque soumission NRDP met à jour le timestamp last_seen de l'hôte (et du
 * service) concerné. Le générateur de config lit ce registre pour savoir qui
 * est encore vivant, et purge les entrées trop vieilles.
 *
 * FONCTIONNEMENT :
 * - Deux tables : hosts (hostname → last_seen) et services
 *   ((hostname, service) → last_seen), timestamps Unix en secondes
 * - Stockage en fichier JSON, réécrit à chaque mutation (tmp + rename pour
 *   ne jamais laisser un fichier tronqué sur disque)
 * - Upsert "dernier écrit gagne" : un événement en retard peut faire reculer
 *   last_seen, on ne compare pas les timestamps (comportement assumé)
 * - Les listes sortent triées (BTreeMap), l'ordre alimente directement le
 *   rendu déterministe de la config
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger io: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostRecord {
    pub hostname: String,
    pub last_seen: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRecord {
    pub hostname: String,
    pub service_description: String,
    pub last_seen: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerTables {
    /// hostname → last_seen
    hosts: BTreeMap<String, i64>,
    /// hostname → (service_description → last_seen)
    services: BTreeMap<String, BTreeMap<String, i64>>,
}

pub struct Ledger {
    tables: RwLock<LedgerTables>,
    data_file: PathBuf,
}

impl Ledger {
    /// Ouvre (ou crée) le registre au chemin donné. Un fichier existant mais
    /// corrompu est une erreur fatale : on ne repart pas silencieusement de
    /// zéro avec un historique perdu.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let data_file = path.as_ref().to_path_buf();
        if let Some(parent) = data_file.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tables = if data_file.exists() {
            let content = tokio::fs::read_to_string(&data_file).await?;
            let tables: LedgerTables = serde_json::from_str(&content)?;
            info!(
                "ledger loaded from {} ({} hosts, {} service groups)",
                data_file.display(),
                tables.hosts.len(),
                tables.services.len()
            );
            tables
        } else {
            info!("no existing ledger at {}, starting fresh", data_file.display());
            LedgerTables::default()
        };

        Ok(Self { tables: RwLock::new(tables), data_file })
    }

    /// Insère ou écrase le last_seen d'un hôte (dernier écrit gagne).
    /// Si la sauvegarde échoue, la table en mémoire est remise dans son état
    /// précédent : ce qui est listable est toujours ce qui est sur disque.
    pub async fn upsert_host(&self, hostname: &str, last_seen: i64) -> Result<(), LedgerError> {
        let mut tables = self.tables.write().await;
        let previous = tables.hosts.insert(hostname.to_string(), last_seen);
        if let Err(e) = self.save(&tables).await {
            match previous {
                Some(prev) => tables.hosts.insert(hostname.to_string(), prev),
                None => tables.hosts.remove(hostname),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Insère ou écrase le last_seen d'un couple (hôte, service), avec le
    /// même rollback que upsert_host en cas d'échec de sauvegarde.
    pub async fn upsert_service(
        &self,
        hostname: &str,
        service_description: &str,
        last_seen: i64,
    ) -> Result<(), LedgerError> {
        let mut tables = self.tables.write().await;
        let group_existed = tables.services.contains_key(hostname);
        let previous = tables
            .services
            .entry(hostname.to_string())
            .or_default()
            .insert(service_description.to_string(), last_seen);
        if let Err(e) = self.save(&tables).await {
            match previous {
                Some(prev) => {
                    if let Some(group) = tables.services.get_mut(hostname) {
                        group.insert(service_description.to_string(), prev);
                    }
                }
                None => {
                    if let Some(group) = tables.services.get_mut(hostname) {
                        group.remove(service_description);
                    }
                    if !group_existed {
                        tables.services.remove(hostname);
                    }
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Tous les hôtes, triés par hostname.
    pub async fn list_hosts(&self) -> Result<Vec<HostRecord>, LedgerError> {
        let tables = self.tables.read().await;
        Ok(tables
            .hosts
            .iter()
            .map(|(hostname, last_seen)| HostRecord {
                hostname: hostname.clone(),
                last_seen: *last_seen,
            })
            .collect())
    }

    /// Tous les services, triés par (hostname, service_description).
    pub async fn list_services(&self) -> Result<Vec<ServiceRecord>, LedgerError> {
        let tables = self.tables.read().await;
        let mut out = Vec::new();
        for (hostname, services) in &tables.services {
            for (service_description, last_seen) in services {
                out.push(ServiceRecord {
                    hostname: hostname.clone(),
                    service_description: service_description.clone(),
                    last_seen: *last_seen,
                });
            }
        }
        Ok(out)
    }

    /// Supprime les hôtes avec last_seen < cutoff. Renvoie le nombre retiré.
    pub async fn delete_hosts_older_than(&self, cutoff: i64) -> Result<usize, LedgerError> {
        let mut tables = self.tables.write().await;
        let before = tables.hosts.len();
        tables.hosts.retain(|_, last_seen| *last_seen >= cutoff);
        let removed = before - tables.hosts.len();
        if removed > 0 {
            self.save(&tables).await?;
        }
        Ok(removed)
    }

    /// Supprime les services avec last_seen < cutoff. Renvoie le nombre retiré.
    pub async fn delete_services_older_than(&self, cutoff: i64) -> Result<usize, LedgerError> {
        let mut tables = self.tables.write().await;
        let mut removed = 0;
        for services in tables.services.values_mut() {
            let before = services.len();
            services.retain(|_, last_seen| *last_seen >= cutoff);
            removed += before - services.len();
        }
        tables.services.retain(|_, services| !services.is_empty());
        if removed > 0 {
            self.save(&tables).await?;
        }
        Ok(removed)
    }

    /// (hôtes, services) suivis — pour le health endpoint.
    pub async fn counts(&self) -> (usize, usize) {
        let tables = self.tables.read().await;
        let services = tables.services.values().map(|s| s.len()).sum();
        (tables.hosts.len(), services)
    }

    /// Réécrit le fichier complet. Écriture dans un fichier temporaire puis
    /// rename : le fichier visible est toujours une version complète.
    async fn save(&self, tables: &LedgerTables) -> Result<(), LedgerError> {
        let json = serde_json::to_string_pretty(tables)?;
        let tmp = self.data_file.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.data_file).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, Ledger) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("ledger.json")).await.unwrap();
        (dir, ledger)
    }

    #[tokio::test]
    async fn test_upsert_and_list_sorted() {
        let (_dir, ledger) = open_temp().await;
        ledger.upsert_host("beta", 100).await.unwrap();
        ledger.upsert_host("alpha", 100).await.unwrap();
        ledger.upsert_host("gamma", 100).await.unwrap();
        ledger.upsert_service("beta", "SSH", 100).await.unwrap();
        ledger.upsert_service("beta", "HTTP", 100).await.unwrap();
        ledger.upsert_service("alpha", "DISK", 100).await.unwrap();

        let hosts: Vec<String> = ledger
            .list_hosts()
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.hostname)
            .collect();
        assert_eq!(hosts, vec!["alpha", "beta", "gamma"]);

        let services: Vec<(String, String)> = ledger
            .list_services()
            .await
            .unwrap()
            .into_iter()
            .map(|s| (s.hostname, s.service_description))
            .collect();
        assert_eq!(
            services,
            vec![
                ("alpha".to_string(), "DISK".to_string()),
                ("beta".to_string(), "HTTP".to_string()),
                ("beta".to_string(), "SSH".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_last_write_wins_even_backwards() {
        // Propriété assumée : un événement en retard fait reculer last_seen,
        // ce qui peut provoquer une purge anticipée. On ne corrige pas.
        let (_dir, ledger) = open_temp().await;
        ledger.upsert_host("web1", 200).await.unwrap();
        ledger.upsert_host("web1", 150).await.unwrap();
        let hosts = ledger.list_hosts().await.unwrap();
        assert_eq!(hosts[0].last_seen, 150);
    }

    #[tokio::test]
    async fn test_delete_older_than_is_strict() {
        let (_dir, ledger) = open_temp().await;
        ledger.upsert_host("old", 99).await.unwrap();
        ledger.upsert_host("edge", 100).await.unwrap();
        ledger.upsert_host("fresh", 101).await.unwrap();

        let removed = ledger.delete_hosts_older_than(100).await.unwrap();
        assert_eq!(removed, 1);
        let hosts: Vec<String> = ledger
            .list_hosts()
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.hostname)
            .collect();
        // last_seen == cutoff survit (seul `< cutoff` est périmé)
        assert_eq!(hosts, vec!["edge", "fresh"]);
    }

    #[tokio::test]
    async fn test_delete_services_counts_and_drops_empty_groups() {
        let (_dir, ledger) = open_temp().await;
        ledger.upsert_service("web1", "HTTP", 50).await.unwrap();
        ledger.upsert_service("web1", "SSH", 150).await.unwrap();
        ledger.upsert_service("db1", "PGSQL", 50).await.unwrap();

        let removed = ledger.delete_services_older_than(100).await.unwrap();
        assert_eq!(removed, 2);
        let services = ledger.list_services().await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].service_description, "SSH");
        let (_, service_count) = ledger.counts().await;
        assert_eq!(service_count, 1);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        {
            let ledger = Ledger::open(&path).await.unwrap();
            ledger.upsert_host("web1", 123).await.unwrap();
            ledger.upsert_service("web1", "HTTP", 123).await.unwrap();
        }
        let reopened = Ledger::open(&path).await.unwrap();
        let hosts = reopened.list_hosts().await.unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].hostname, "web1");
        assert_eq!(hosts[0].last_seen, 123);
        assert_eq!(reopened.list_services().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_save_rolls_back_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store");
        let ledger = Ledger::open(store.join("ledger.json")).await.unwrap();
        ledger.upsert_host("web1", 100).await.unwrap();
        ledger.upsert_service("web1", "HTTP", 100).await.unwrap();

        // le répertoire disparaît sous nos pieds : toute sauvegarde échoue
        std::fs::remove_dir_all(&store).unwrap();
        assert!(ledger.upsert_host("web2", 200).await.is_err());
        assert!(ledger.upsert_host("web1", 300).await.is_err());
        assert!(ledger.upsert_service("web1", "SSH", 200).await.is_err());
        assert!(ledger.upsert_service("db1", "PGSQL", 200).await.is_err());

        // seules les écritures durables restent visibles
        let hosts = ledger.list_hosts().await.unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].hostname, "web1");
        assert_eq!(hosts[0].last_seen, 100);
        let services = ledger.list_services().await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].service_description, "HTTP");
        assert_eq!(services[0].last_seen, 100);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        tokio::fs::write(&path, "{pas du json").await.unwrap();
        assert!(Ledger::open(&path).await.is_err());
    }
}
