/**
 * SPOOL - Dépôt des résultats de checks pour le moteur Nagios
 *
 * RÔLE :
 * Convertit chaque résultat NRDP en fichier checkresult dans le répertoire
 * de spool, accompagné de son marqueur `.ok` (le moteur n'ingère un fichier
 * qu'une fois le marqueur présent).
 *
 * FONCTIONNEMENT :
 * - Garde-fous avant chaque écriture : espace disque minimum (statvfs) et
 *   nombre max de fichiers non consommés (attente + retry si saturé)
 * - Fichiers en 0770, chgrp vers le groupe du moteur si configuré
 * - Toute écriture partielle est nettoyée avant de remonter l'erreur
 */

use crate::models::CheckResult;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("spool io: {0}")]
    Io(#[from] std::io::Error),
    #[error("free disk space {free:.1}% below minimum {min:.1}%")]
    DiskFull { free: f64, min: f64 },
    #[error("unknown group '{0}'")]
    UnknownGroup(String),
    #[error("spool syscall: {0}")]
    Sys(#[from] nix::Error),
}

pub struct SpoolWriter {
    output_dir: PathBuf,
    group_name: Option<String>,
    max_files: usize,
    min_free_percent: f64,
    pause: Duration,
}

impl SpoolWriter {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        group_name: Option<String>,
        max_files: usize,
        min_free_percent: f64,
        pause: Duration,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            group_name,
            max_files,
            min_free_percent,
            pause,
        }
    }

    /// Vérifie au démarrage que le répertoire de spool est inscriptible.
    pub fn ensure_writable(&self) -> Result<(), SpoolError> {
        let probe = self
            .output_dir
            .join(format!(".writetest-{}", Uuid::new_v4().simple()));
        std::fs::write(&probe, b"test")?;
        std::fs::remove_file(&probe)?;
        Ok(())
    }

    /// Dépose un résultat dans le spool et renvoie le chemin du fichier créé.
    pub async fn write(&self, result: &CheckResult) -> Result<PathBuf, SpoolError> {
        self.check_free_space()?;

        // Si le moteur est en retard, on attend qu'il consomme
        while self.is_saturated()? {
            debug!("spool saturated ({} files max), waiting...", self.max_files);
            tokio::time::sleep(self.pause).await;
        }

        let name = format!("c{}", &Uuid::new_v4().simple().to_string()[..6]);
        let path = self.output_dir.join(&name);

        if let Err(e) = self.write_spool_file(&path, format_spool(result).as_bytes()).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }

        let ok_path = self.output_dir.join(format!("{name}.ok"));
        if let Err(e) = self.write_spool_file(&ok_path, b"").await {
            let _ = tokio::fs::remove_file(&path).await;
            let _ = tokio::fs::remove_file(&ok_path).await;
            return Err(e);
        }

        debug!("check result spooled to {}", path.display());
        Ok(path)
    }

    async fn write_spool_file(&self, path: &Path, contents: &[u8]) -> Result<(), SpoolError> {
        use std::os::unix::fs::PermissionsExt;

        tokio::fs::write(path, contents).await?;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o770)).await?;
        if let Some(group) = &self.group_name {
            set_group(path, group)?;
        }
        Ok(())
    }

    fn check_free_space(&self) -> Result<(), SpoolError> {
        if self.min_free_percent <= 0.0 {
            return Ok(());
        }
        let stat = nix::sys::statvfs::statvfs(&self.output_dir)?;
        let blocks = stat.blocks() as f64;
        if blocks == 0.0 {
            return Ok(());
        }
        let free = stat.blocks_available() as f64 / blocks * 100.0;
        if free < self.min_free_percent {
            return Err(SpoolError::DiskFull { free, min: self.min_free_percent });
        }
        Ok(())
    }

    /// Saturé dès que le cap est atteint : à max_files fichiers en attente,
    /// aucun nouveau dépôt avant que le moteur ne consomme.
    fn is_saturated(&self) -> Result<bool, SpoolError> {
        Ok(self.count_files()? >= self.max_files)
    }

    fn count_files(&self) -> Result<usize, SpoolError> {
        let count = std::fs::read_dir(&self.output_dir)?
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .count();
        Ok(count)
    }
}

fn set_group(path: &Path, group: &str) -> Result<(), SpoolError> {
    let grp = nix::unistd::Group::from_name(group)?
        .ok_or_else(|| SpoolError::UnknownGroup(group.to_string()))?;
    nix::unistd::chown(path, None, Some(grp.gid))?;
    Ok(())
}

/// Format checkresult attendu par le moteur. Pur, donc testable à l'octet.
pub fn format_spool(result: &CheckResult) -> String {
    use time::format_description::well_known::Rfc2822;

    let human_time = time::OffsetDateTime::from_unix_timestamp(result.time)
        .ok()
        .and_then(|t| t.format(&Rfc2822).ok())
        .unwrap_or_else(|| result.time.to_string());

    let service_line = if result.servicename.is_empty() {
        String::new()
    } else {
        format!("service_description={}\n", result.servicename)
    };

    format!(
        "### Veilleur Check ###\n\
         start_time={}.0\n\
         # Time: {}\n\
         host_name={}\n\
         {}\
         check_type=1\n\
         early_timeout=1\n\
         exited_ok=1\n\
         return_code={}\n\
         output={}\\n\n",
        result.time,
        human_time,
        result.hostname,
        service_line,
        result.state,
        result.output.replace('\n', "\\n"),
    )
}
