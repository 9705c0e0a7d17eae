use std::path::{Path, PathBuf};

use courier_delivery::{DnsConfig, FileMessageStore, QueueConfig, SenderConfig};
use courier_dkim::DkimConfig;
use courier_queue::StoreConfig;
use serde::Deserialize;

pub const CONFIG_ENV: &str = "COURIER_CONFIG";

/// The whole of a `courier.config.ron` file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Courier {
    #[serde(alias = "queue_store")]
    pub store: StoreConfig,
    pub messages: FileMessageStore,
    pub queue: QueueConfig,
    pub sender: SenderConfig,
    pub dns: DnsConfig,
    pub dkim: Option<DkimConfig>,
}

impl Courier {
    /// Parse a configuration from RON text.
    pub fn from_ron(text: &str) -> anyhow::Result<Self> {
        Ok(ron::from_str(text)?)
    }

    /// Locate and parse the configuration file.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let path = find_config_file(std::env::var_os(CONFIG_ENV).map(PathBuf::from), explicit)?;
        let text = std::fs::read_to_string(&path).map_err(|e| {
            anyhow::anyhow!("Failed to read config from {}: {}", path.display(), e)
        })?;

        Self::from_ron(&text)
            .map_err(|e| anyhow::anyhow!("Invalid config in {}: {}", path.display(), e))
    }
}

/// Find the configuration file using the following precedence:
/// 1. `COURIER_CONFIG` environment variable
/// 2. `--config` on the command line
/// 3. ./courier.config.ron (current working directory)
/// 4. /etc/courier/courier.config.ron (system-wide config)
fn find_config_file(env: Option<PathBuf>, explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(path) = env {
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
    }

    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        anyhow::bail!("--config points to non-existent file: {}", path.display());
    }

    let default_paths = [
        PathBuf::from("./courier.config.ron"),
        PathBuf::from("/etc/courier/courier.config.ron"),
    ];

    for path in &default_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n  - --config argument\n{paths_tried}"
    )
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const SAMPLE: &str = r#"(
        store: (type: "Memory"),
        messages: (path: "/tmp/courier/messages"),
        queue: (
            num_workers: 8,
            retry_intervals_secs: [60, 600],
        ),
        sender: (
            helo_name: "mail.example.com",
            relay: Some((
                host: "smtp.example.net",
                username: Some("user"),
                password: Some("secret"),
            )),
        ),
        dns: (timeout_secs: 2),
        dkim: Some((
            domain: "example.com",
            selector: "mail",
            private_key: "/etc/courier/dkim.pem",
            sign_at: Delivery,
        )),
    )"#;

    #[test]
    fn parses_every_section() {
        let config = Courier::from_ron(SAMPLE).unwrap();

        assert!(config.store.path().is_none());
        assert_eq!(config.messages.path(), Path::new("/tmp/courier/messages"));
        assert_eq!(config.queue.num_workers, 8);
        assert_eq!(config.queue.retry_intervals_secs, vec![60, 600]);
        assert_eq!(config.queue.batch_size, 50);
        assert_eq!(config.sender.helo_name, "mail.example.com");

        let relay = config.sender.relay.unwrap();
        assert_eq!(relay.host, "smtp.example.net");
        assert_eq!(relay.port, 587);

        assert_eq!(config.dns.timeout_secs, 2);
        assert_eq!(config.dns.smtp_port, 25);

        let dkim = config.dkim.unwrap();
        assert_eq!(dkim.selector, "mail");
        assert_eq!(dkim.sign_at, courier_dkim::SigningStage::Delivery);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = Courier::from_ron("()").unwrap();

        assert_eq!(
            config.store.path(),
            Some(Path::new("/var/spool/courier/queue"))
        );
        assert_eq!(config.queue.poll_interval_ms, 5000);
        assert!(config.sender.relay.is_none());
        assert!(config.dkim.is_none());
    }

    #[test]
    fn environment_wins_over_the_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let env = dir.path().join("env.ron");
        let cli = dir.path().join("cli.ron");
        std::fs::write(&env, "()").unwrap();
        std::fs::write(&cli, "()").unwrap();

        assert_eq!(
            find_config_file(Some(env.clone()), Some(&cli)).unwrap(),
            env
        );
        assert_eq!(find_config_file(None, Some(&cli)).unwrap(), cli);
    }

    #[test]
    fn missing_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.ron");

        let err = find_config_file(Some(missing.clone()), None).unwrap_err();
        assert!(err.to_string().contains(CONFIG_ENV));

        let err = find_config_file(None, Some(&missing)).unwrap_err();
        assert!(err.to_string().contains("--config"));
    }
}
