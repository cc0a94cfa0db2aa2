use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KernelConfig {
    #[serde(default)]
    pub server: ServerConf,
    #[serde(default)]
    pub spool: SpoolConf,
    #[serde(default)]
    pub ledger: LedgerConf,
    #[serde(default)]
    pub nagios: NagiosConf,
    #[serde(default)]
    pub logging: LoggingConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConf {
    pub listen_addr: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SpoolConf {
    /// Répertoire de spool du moteur Nagios (checkresults)
    pub output_dir: String,
    /// Groupe Unix appliqué aux fichiers déposés (None = pas de chgrp)
    pub group_name: Option<String>,
    /// Nombre max de fichiers non consommés avant mise en pause
    pub max_files: usize,
    /// Espace disque libre minimum (pourcentage)
    pub min_disk_space_percent: f64,
    /// Durée d'attente quand le spool est saturé ("10s", "1m"...)
    pub pause_duration: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LedgerConf {
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NagiosConf {
    /// Répertoire où la config générée est publiée
    pub output_dir: String,
    pub host_template: String,
    pub service_template: String,
    pub generation_interval: String,
    pub stale_threshold: String,
    /// Commande de reload (prioritaire sur pid_file si les deux sont définis)
    pub reload_command: Option<String>,
    /// Fichier PID du moteur Nagios pour l'envoi de SIGHUP
    pub pid_file: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConf {
    pub level: String,
    pub show_raw: bool,
}

impl Default for ServerConf {
    fn default() -> Self {
        Self { listen_addr: "0.0.0.0:8080".into() }
    }
}

impl Default for SpoolConf {
    fn default() -> Self {
        Self {
            output_dir: "/var/lib/nagios4/spool/checkresults".into(),
            group_name: Some("nagios".into()),
            max_files: 1000,
            min_disk_space_percent: 5.0,
            pause_duration: "10s".into(),
        }
    }
}

impl Default for LedgerConf {
    fn default() -> Self {
        Self { path: "./data/ledger.json".into() }
    }
}

impl Default for NagiosConf {
    fn default() -> Self {
        Self {
            output_dir: "/etc/nagios4/dynamic".into(),
            host_template: "linux-server".into(),
            service_template: "generic-service".into(),
            generation_interval: "30s".into(),
            stale_threshold: "6h".into(),
            reload_command: None,
            pid_file: Some("/var/run/nagios.pid".into()),
        }
    }
}

impl Default for LoggingConf {
    fn default() -> Self {
        Self { level: "info".into(), show_raw: false }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            server: ServerConf::default(),
            spool: SpoolConf::default(),
            ledger: LedgerConf::default(),
            nagios: NagiosConf::default(),
            logging: LoggingConf::default(),
        }
    }
}

impl NagiosConf {
    pub fn generation_interval(&self) -> Result<Duration> {
        humantime::parse_duration(&self.generation_interval)
            .with_context(|| format!("invalid generation_interval '{}'", self.generation_interval))
    }

    pub fn stale_threshold(&self) -> Result<Duration> {
        humantime::parse_duration(&self.stale_threshold)
            .with_context(|| format!("invalid stale_threshold '{}'", self.stale_threshold))
    }
}

impl SpoolConf {
    pub fn pause_duration(&self) -> Result<Duration> {
        humantime::parse_duration(&self.pause_duration)
            .with_context(|| format!("invalid pause_duration '{}'", self.pause_duration))
    }
}

impl KernelConfig {
    /// Vérifie la cohérence de la config. Toute erreur ici est fatale au
    /// démarrage : aucune valeur invalide ne doit atteindre les cycles.
    pub fn validate(&self) -> Result<()> {
        if self.server.listen_addr.is_empty() {
            bail!("server.listen_addr must be specified");
        }
        match self.logging.level.as_str() {
            "info" | "debug" | "trace" => {}
            other => bail!("invalid logging.level '{}' (must be info, debug or trace)", other),
        }

        if self.spool.output_dir.is_empty() {
            bail!("spool.output_dir must be specified");
        }
        if !Path::new(&self.spool.output_dir).is_absolute() {
            bail!("spool.output_dir must be an absolute path: {}", self.spool.output_dir);
        }
        if self.spool.max_files == 0 {
            bail!("spool.max_files must be greater than 0");
        }
        if self.spool.min_disk_space_percent < 0.0 || self.spool.min_disk_space_percent >= 100.0 {
            bail!("spool.min_disk_space_percent must be within [0, 100)");
        }
        self.spool.pause_duration()?;

        if self.ledger.path.is_empty() {
            bail!("ledger.path must be specified");
        }

        if self.nagios.output_dir.is_empty() {
            bail!("nagios.output_dir must be specified");
        }
        if !Path::new(&self.nagios.output_dir).is_absolute() {
            bail!("nagios.output_dir must be an absolute path: {}", self.nagios.output_dir);
        }
        check_dir_writable(&self.nagios.output_dir).with_context(|| {
            format!("nagios.output_dir '{}' must exist and be writable", self.nagios.output_dir)
        })?;
        if self.nagios.host_template.is_empty() {
            bail!("nagios.host_template must be specified");
        }
        if self.nagios.service_template.is_empty() {
            bail!("nagios.service_template must be specified");
        }
        self.nagios.generation_interval()?;
        self.nagios.stale_threshold()?;
        if let Some(cmd) = &self.nagios.reload_command {
            shell_words::split(cmd).with_context(|| format!("invalid reload_command '{}'", cmd))?;
        }

        Ok(())
    }
}

/// Un répertoire de publication inexistant ou en lecture seule doit arrêter
/// le démarrage, pas faire échouer chaque cycle.
fn check_dir_writable(dir: &str) -> Result<()> {
    if !Path::new(dir).is_dir() {
        bail!("not a directory");
    }
    let probe = Path::new(dir).join(format!(".writetest-{}", uuid::Uuid::new_v4().simple()));
    std::fs::write(&probe, b"test").context("cannot write probe file")?;
    std::fs::remove_file(&probe).context("cannot remove probe file")?;
    Ok(())
}

/// Charge la config depuis VEILLEUR_KERNEL_CONFIG (défaut: kernel.yaml).
/// Fichier absent = config par défaut ; fichier illisible ou YAML invalide =
/// erreur (le démarrage doit échouer plutôt que tourner avec une demi-config).
pub async fn load_config() -> Result<KernelConfig> {
    let path = std::env::var("VEILLEUR_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if !Path::new(&path).exists() {
        eprintln!("[kernel] pas de {path}, usage config par défaut");
        return Ok(KernelConfig::default());
    }

    let txt = fs::read_to_string(&path)
        .await
        .with_context(|| format!("cannot read config file {path}"))?;
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(&txt).with_context(|| format!("invalid config file {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid_shape() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.server.listen_addr, "0.0.0.0:8080");
        assert_eq!(cfg.nagios.generation_interval().unwrap(), Duration::from_secs(30));
        assert_eq!(cfg.nagios.stale_threshold().unwrap(), Duration::from_secs(6 * 3600));
        assert_eq!(cfg.spool.pause_duration().unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "nagios:\n  stale_threshold: 90s\n";
        let cfg: KernelConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.nagios.stale_threshold().unwrap(), Duration::from_secs(90));
        // le reste de la section garde ses défauts
        assert_eq!(cfg.nagios.host_template, "linux-server");
        assert_eq!(cfg.spool.max_files, 1000);
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = KernelConfig::default();
        cfg.nagios.output_dir = dir.path().to_string_lossy().to_string();
        cfg.nagios.generation_interval = "bientôt".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_relative_output_dir_rejected() {
        let mut cfg = KernelConfig::default();
        cfg.nagios.output_dir = "./dynamic".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_missing_output_dir_rejected_at_startup() {
        let mut cfg = KernelConfig::default();
        cfg.nagios.output_dir = "/nulle-part/dynamic".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_writable_output_dir_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = KernelConfig::default();
        cfg.nagios.output_dir = dir.path().to_string_lossy().to_string();
        assert!(cfg.validate().is_ok());
        // le probe ne laisse rien derrière lui
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_bad_logging_level_rejected() {
        let mut cfg = KernelConfig::default();
        cfg.logging.level = "verbose".into();
        assert!(cfg.validate().is_err());
    }
}
