// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

use std::{
    fmt::{self, Display, Formatter},
    net::SocketAddr,
    path::PathBuf,
    time::Duration,
};

use clap::ArgAction;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Listener {
    pub address: SocketAddr,
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            address: ([127, 0, 0, 1], 3000).into(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Log {
    pub level: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DirectoryStore {
    /// Path to the sqlite database holding organisations, services and the
    /// job queue. `:memory:` keeps everything process local.
    pub database: String,
}

impl Default for DirectoryStore {
    fn default() -> Self {
        Self {
            database: "/var/lib/vulnd/vulnd.db".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct CryptConfig {
    /// Passphrase the credential key is derived from. Empty means a random
    /// per-process key; previously stored credentials are then unreadable.
    #[serde(default)]
    pub key: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ExternalService {
    pub base_url: String,
    /// Administrative credential set, used for calls that are not bound to
    /// one tenant.
    #[serde(default)]
    pub admin_username: String,
    #[serde(default)]
    pub admin_password: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ExternalService {
    fn default() -> Self {
        Self {
            base_url: "https://localhost:443/rest".to_string(),
            admin_username: String::new(),
            admin_password: String::new(),
            connect_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Synchronization {
    /// Repository name markers identifying backup/secondary repositories;
    /// scans and scan results in those repositories are skipped.
    pub backup_repository_markers: Vec<String>,
    /// Trailing window for scan result polling.
    pub result_lookback: Duration,
    /// Queue rows with this many attempts are left for manual inspection.
    pub max_attempts: u32,
}

impl Default for Synchronization {
    fn default() -> Self {
        Self {
            backup_repository_markers: vec!["backup".to_string()],
            result_lookback: Duration::from_secs(2 * 60 * 60),
            max_attempts: 5,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct JobSchedule {
    pub enabled: bool,
    pub interval: Duration,
}

impl Default for JobSchedule {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Jobs {
    #[serde(default)]
    pub scan_sync: JobSchedule,
    #[serde(default)]
    pub result_poll: JobSchedule,
    #[serde(default)]
    pub vuln_fetch: JobSchedule,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Sla {
    pub critical: i64,
    pub high: i64,
    pub medium: i64,
    pub low: i64,
    pub info: i64,
}

impl Default for Sla {
    fn default() -> Self {
        Self {
            critical: 3,
            high: 7,
            medium: 30,
            low: 90,
            info: 180,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Endpoints {
    /// Key the bearer identities are signed with.
    #[serde(default)]
    pub token_key: String,
    /// Scans may not be edited this close to their next scheduled run.
    pub edit_buffer_minutes: i64,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            token_key: String::new(),
            edit_buffer_minutes: 30,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub storage: DirectoryStore,
    #[serde(default)]
    pub crypt: CryptConfig,
    #[serde(default)]
    pub external: ExternalService,
    #[serde(default)]
    pub sync: Synchronization,
    #[serde(default)]
    pub jobs: Jobs,
    #[serde(default)]
    pub sla: Sla,
    #[serde(default)]
    pub endpoints: Endpoints,
}

impl Display for Config {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", toml::to_string_pretty(self).unwrap_or_default())
    }
}

impl Config {
    fn load_etc() -> Option<Self> {
        let config = std::fs::read_to_string("/etc/vulnd/vulnd.toml").unwrap_or_default();
        toml::from_str(&config).ok()
    }

    fn load_user() -> Option<Self> {
        match std::env::var("HOME") {
            Ok(home) => {
                let path = format!("{}/.config/vulnd/vulnd.toml", home);
                let config = std::fs::read_to_string(path).unwrap_or_default();
                toml::from_str(&config).ok()
            }
            Err(_) => None,
        }
    }

    fn from_file<P>(path: P) -> Self
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        tracing::debug!("loading config from {}", path);
        let config = std::fs::read_to_string(path).unwrap_or_default();
        toml::from_str(&config).unwrap_or_default()
    }

    pub fn load() -> Self {
        let cmds = clap::Command::new("vulnd")
            .arg(
                clap::Arg::new("config")
                    .short('c')
                    .env("VULND_CONFIG")
                    .long("config")
                    .action(ArgAction::Set)
                    .help("path to toml config file"),
            )
            .arg(
                clap::Arg::new("db")
                    .env("VULND_DB")
                    .long("db")
                    .action(ArgAction::Set)
                    .help("path to the sqlite database"),
            )
            .arg(
                clap::Arg::new("external-url")
                    .env("VULND_EXTERNAL_URL")
                    .long("external-url")
                    .action(ArgAction::Set)
                    .help("base url of the external scanning service"),
            )
            .arg(
                clap::Arg::new("crypt-key")
                    .env("VULND_CRYPT_KEY")
                    .long("crypt-key")
                    .action(ArgAction::Set)
                    .help("passphrase for the credential encryption key"),
            )
            .arg(
                clap::Arg::new("token-key")
                    .env("VULND_TOKEN_KEY")
                    .long("token-key")
                    .action(ArgAction::Set)
                    .help("key bearer identities are signed with"),
            )
            .arg(
                clap::Arg::new("max-attempts")
                    .env("VULND_MAX_ATTEMPTS")
                    .long("max-attempts")
                    .value_parser(clap::value_parser!(u32))
                    .help("retry ceiling for vulnerability fetch jobs"),
            )
            .arg(
                clap::Arg::new("result-lookback")
                    .env("VULND_RESULT_LOOKBACK")
                    .long("result-lookback")
                    .value_parser(clap::value_parser!(u64))
                    .value_name("SECONDS")
                    .help("trailing window for scan result polling in seconds"),
            )
            .arg(
                clap::Arg::new("listening")
                    .env("VULND_LISTENING")
                    .long("listening")
                    .short('l')
                    .value_name("IP:PORT")
                    .value_parser(clap::value_parser!(SocketAddr))
                    .help("the address to listen to (e.g. 127.0.0.1:3000)"),
            )
            .get_matches();
        let mut config = match cmds.get_one::<String>("config") {
            Some(path) => Self::from_file(path),
            None => {
                if let Some(config) = Self::load_user() {
                    config
                } else {
                    Self::load_etc().unwrap_or_default()
                }
            }
        };
        if let Some(db) = cmds.get_one::<String>("db") {
            config.storage.database = db.clone();
        }
        if let Some(url) = cmds.get_one::<String>("external-url") {
            config.external.base_url = url.clone();
        }
        if let Some(key) = cmds.get_one::<String>("crypt-key") {
            config.crypt.key = key.clone();
        }
        if let Some(key) = cmds.get_one::<String>("token-key") {
            config.endpoints.token_key = key.clone();
        }
        if let Some(attempts) = cmds.get_one::<u32>("max-attempts") {
            config.sync.max_attempts = *attempts;
        }
        if let Some(lookback) = cmds.get_one::<u64>("result-lookback") {
            config.sync.result_lookback = Duration::from_secs(*lookback);
        }
        if let Some(ip) = cmds.get_one::<SocketAddr>("listening") {
            config.listener.address = *ip;
        }
        config
    }
}
