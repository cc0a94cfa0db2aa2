/**
 * RELOAD - Notification du moteur Nagios après publication de config
 *
 * RÔLE :
 * Consomme les signaux du générateur et demande au moteur de recharger sa
 * configuration, soit via une commande externe, soit par SIGHUP sur le PID
 * lu dans le pidfile.
 *
 * FONCTIONNEMENT :
 * - reload_command prime sur pid_file quand les deux sont configurés
 * - Un reload raté est un warning, jamais une erreur fatale : la config
 *   publiée est déjà sur disque, le prochain reload la prendra
 */

use crate::config::NagiosConf;
use anyhow::{bail, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::Path;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Boucle de consommation des signaux de reload. S'arrête quand le
/// générateur (côté émetteur) est détruit.
pub fn spawn_reload_watcher(mut rx: mpsc::Receiver<()>, cfg: NagiosConf) -> JoinHandle<()> {
    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            if let Err(e) = trigger_reload(&cfg).await {
                warn!("nagios reload failed: {:#}", e);
            }
        }
        info!("reload watcher stopped");
    })
}

async fn trigger_reload(cfg: &NagiosConf) -> Result<()> {
    if let Some(command) = &cfg.reload_command {
        return run_reload_command(command).await;
    }
    if let Some(pid_file) = &cfg.pid_file {
        let pid = read_pid(Path::new(pid_file))
            .with_context(|| format!("cannot read pid from {pid_file}"))?;
        kill(Pid::from_raw(pid), Signal::SIGHUP)
            .with_context(|| format!("cannot send SIGHUP to pid {pid}"))?;
        info!("sent SIGHUP to nagios (pid {})", pid);
        return Ok(());
    }
    bail!("neither reload_command nor pid_file configured");
}

async fn run_reload_command(command: &str) -> Result<()> {
    let parts = shell_words::split(command)
        .with_context(|| format!("invalid reload command '{command}'"))?;
    let Some((program, args)) = parts.split_first() else {
        bail!("empty reload command");
    };
    let status = tokio::process::Command::new(program)
        .args(args)
        .status()
        .await
        .with_context(|| format!("cannot run reload command '{command}'"))?;
    if !status.success() {
        bail!("reload command '{command}' exited with {status}");
    }
    info!("reload command '{}' succeeded", command);
    Ok(())
}

fn read_pid(path: &Path) -> Result<i32> {
    let raw = std::fs::read_to_string(path)?;
    let pid: i32 = raw
        .trim()
        .parse()
        .with_context(|| format!("pidfile contains '{}'", raw.trim()))?;
    if pid <= 0 {
        bail!("pidfile contains non-positive pid {pid}");
    }
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_pid_with_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nagios.pid");
        std::fs::write(&path, "1234\n").unwrap();
        assert_eq!(read_pid(&path).unwrap(), 1234);
    }

    #[test]
    fn test_read_pid_rejects_junk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nagios.pid");
        std::fs::write(&path, "pas un pid").unwrap();
        assert!(read_pid(&path).is_err());
    }

    #[test]
    fn test_read_pid_rejects_non_positive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nagios.pid");
        std::fs::write(&path, "0").unwrap();
        assert!(read_pid(&path).is_err());
        std::fs::write(&path, "-5").unwrap();
        assert!(read_pid(&path).is_err());
    }

    #[test]
    fn test_read_pid_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_pid(&dir.path().join("absent.pid")).is_err());
    }

    #[tokio::test]
    async fn test_reload_command_success_and_failure() {
        let cfg = NagiosConf {
            reload_command: Some("true".into()),
            pid_file: None,
            ..Default::default()
        };
        assert!(trigger_reload(&cfg).await.is_ok());

        let cfg = NagiosConf {
            reload_command: Some("false".into()),
            pid_file: None,
            ..Default::default()
        };
        assert!(trigger_reload(&cfg).await.is_err());
    }

    #[tokio::test]
    async fn test_no_reload_target_configured() {
        let cfg = NagiosConf { reload_command: None, pid_file: None, ..Default::default() };
        assert!(trigger_reload(&cfg).await.is_err());
    }
}
