//! Instance configuration: where the cluster lives, where the catalog lives,
//! how to reach the server, and the knobs bounding a backup session.
//!
//! Loaded from a TOML file and/or overridden from the command line; every
//! value that crosses the database boundary has a total parser here or in
//! [`crate::db`].

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::compress::CompressAlg;
use crate::error::{BackupError, Result};

pub const ARCHIVE_TIMEOUT_DEFAULT: u64 = 300;
pub const REPLICA_TIMEOUT_DEFAULT: u64 = 300;

fn default_port() -> u16 {
    5432
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionOptions {
    pub pghost: Option<String>,
    #[serde(default = "default_port")]
    pub pgport: u16,
    pub pguser: Option<String>,
    pub pgdatabase: Option<String>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            pghost: None,
            pgport: default_port(),
            pguser: None,
            pgdatabase: None,
        }
    }
}

impl ConnectionOptions {
    /// The conninfo string recorded as `primary_conninfo` in the backup's
    /// control file (no password, ever).
    pub fn conninfo_string(&self) -> String {
        let mut parts = Vec::new();
        if let Some(host) = &self.pghost {
            parts.push(format!("host={host}"));
        }
        parts.push(format!("port={}", self.pgport));
        if let Some(user) = &self.pguser {
            parts.push(format!("user={user}"));
        }
        if let Some(db) = &self.pgdatabase {
            parts.push(format!("dbname={db}"));
        }
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceConfig {
    /// The data directory of the cluster being backed up.
    pub pgdata: Option<Utf8PathBuf>,
    /// Root of the backup catalog (`-B`).
    pub backup_path: Utf8PathBuf,
    /// Instance name under `backups/` and `wal/`.
    pub instance_name: String,
    /// System identifier recorded when the instance was registered;
    /// 0 means "not recorded".
    #[serde(default)]
    pub system_identifier: u64,

    #[serde(default)]
    pub conn: ConnectionOptions,

    #[serde(default = "InstanceConfig::default_xlog_seg_size")]
    pub xlog_seg_size: usize,

    /// Seconds to wait for WAL archiving / stop-backup completion.
    #[serde(default = "InstanceConfig::default_archive_timeout")]
    pub archive_timeout: u64,
    /// Seconds to wait for a replica to reach a target LSN.
    #[serde(default = "InstanceConfig::default_replica_timeout")]
    pub replica_timeout: u64,

    #[serde(default = "InstanceConfig::default_num_threads")]
    pub num_threads: usize,

    #[serde(default)]
    pub compress_alg: CompressAlg,
    #[serde(default = "InstanceConfig::default_compress_level")]
    pub compress_level: u32,

    /// Receive WAL over a replication connection instead of relying on
    /// continuous archiving.
    #[serde(default)]
    pub stream: bool,
    /// Use a temporary replication slot for streaming.
    #[serde(default)]
    pub temp_slot: bool,

    /// Colon-separated list of extra directories to back up.
    pub external_dirs: Option<String>,
}

impl InstanceConfig {
    pub fn new(backup_path: Utf8PathBuf, instance_name: String) -> InstanceConfig {
        InstanceConfig {
            pgdata: None,
            backup_path,
            instance_name,
            system_identifier: 0,
            conn: ConnectionOptions::default(),
            xlog_seg_size: Self::default_xlog_seg_size(),
            archive_timeout: Self::default_archive_timeout(),
            replica_timeout: Self::default_replica_timeout(),
            num_threads: Self::default_num_threads(),
            compress_alg: CompressAlg::default(),
            compress_level: Self::default_compress_level(),
            stream: false,
            temp_slot: false,
            external_dirs: None,
        }
    }

    fn default_xlog_seg_size() -> usize {
        postgres_ffi::WAL_SEGMENT_SIZE
    }
    fn default_archive_timeout() -> u64 {
        ARCHIVE_TIMEOUT_DEFAULT
    }
    fn default_replica_timeout() -> u64 {
        REPLICA_TIMEOUT_DEFAULT
    }
    fn default_num_threads() -> usize {
        1
    }
    fn default_compress_level() -> u32 {
        1
    }

    pub fn load(path: &Utf8Path) -> Result<InstanceConfig> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BackupError::Config(format!("cannot read configuration file \"{path}\": {e}"))
        })?;
        toml::from_str(&text)
            .map_err(|e| BackupError::Config(format!("configuration file \"{path}\": {e}")))
    }

    /// `<backup-path>/backups/<instance>`
    pub fn backup_instance_path(&self) -> Utf8PathBuf {
        self.backup_path.join("backups").join(&self.instance_name)
    }

    /// `<backup-path>/wal/<instance>` - archived WAL location
    pub fn arclog_path(&self) -> Utf8PathBuf {
        self.backup_path.join("wal").join(&self.instance_name)
    }

    pub fn pgdata(&self) -> Result<&Utf8Path> {
        self.pgdata.as_deref().ok_or_else(|| {
            BackupError::Config("required parameter not specified: PGDATA (-D, --pgdata)".into())
        })
    }

    /// Split `external_dirs` the way the original option is spelled:
    /// absolute paths separated by colons.
    pub fn external_dir_list(&self) -> Result<Vec<Utf8PathBuf>> {
        let Some(dirs) = &self.external_dirs else {
            return Ok(Vec::new());
        };
        let mut list = Vec::new();
        for dir in dirs.split(':').filter(|d| !d.is_empty()) {
            let path = Utf8PathBuf::from(dir);
            if !path.is_absolute() {
                return Err(BackupError::Config(format!(
                    "external directory \"{path}\" is not an absolute path"
                )));
            }
            list.push(path);
        }
        list.sort();
        Ok(list)
    }
}

/// Parse a boolean GUC the way the server prints them.
pub fn parse_bool_setting(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        other => Err(BackupError::Protocol(format!(
            "invalid boolean value \"{other}\""
        ))),
    }
}

/// Parse an integer GUC with an optional time unit suffix into seconds.
/// `SHOW checkpoint_timeout` yields things like "300s", "5min", "1h".
pub fn parse_seconds_setting(value: &str) -> Result<u64> {
    let v = value.trim();
    let split = v.find(|c: char| !c.is_ascii_digit()).unwrap_or(v.len());
    let (num, unit) = v.split_at(split);
    let num: u64 = num
        .parse()
        .map_err(|_| BackupError::Protocol(format!("invalid interval value \"{v}\"")))?;
    match unit.trim() {
        "" | "s" => Ok(num),
        "ms" => Ok(num / 1000),
        "min" => Ok(num * 60),
        "h" => Ok(num * 3600),
        "d" => Ok(num * 86400),
        other => Err(BackupError::Protocol(format!(
            "unrecognized time unit \"{other}\" in \"{v}\""
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_setting() {
        assert!(parse_bool_setting("on").unwrap());
        assert!(parse_bool_setting("TRUE").unwrap());
        assert!(!parse_bool_setting("off").unwrap());
        assert!(parse_bool_setting("o").is_err());
    }

    #[test]
    fn test_parse_seconds_setting() {
        assert_eq!(parse_seconds_setting("300").unwrap(), 300);
        assert_eq!(parse_seconds_setting("300s").unwrap(), 300);
        assert_eq!(parse_seconds_setting("5min").unwrap(), 300);
        assert_eq!(parse_seconds_setting("1h").unwrap(), 3600);
        assert!(parse_seconds_setting("five").is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let config: InstanceConfig = toml::from_str(
            r#"
            pgdata = "/var/lib/postgresql/14/main"
            backup_path = "/srv/backups"
            instance_name = "main"
            stream = true
            compress_alg = "zlib"
            compress_level = 4
            [conn]
            pghost = "localhost"
            pguser = "backup"
            "#,
        )
        .unwrap();
        assert_eq!(config.instance_name, "main");
        assert_eq!(config.archive_timeout, ARCHIVE_TIMEOUT_DEFAULT);
        assert_eq!(config.compress_alg, CompressAlg::Zlib);
        assert_eq!(config.conn.pgport, 5432);
        assert_eq!(
            config.backup_instance_path(),
            Utf8PathBuf::from("/srv/backups/backups/main")
        );
        assert_eq!(
            config.conn.conninfo_string(),
            "host=localhost port=5432 user=backup"
        );
    }

    #[test]
    fn test_external_dir_list() {
        let mut config: InstanceConfig = toml::from_str(
            r#"
            backup_path = "/srv/backups"
            instance_name = "main"
            "#,
        )
        .unwrap();
        assert!(config.external_dir_list().unwrap().is_empty());

        config.external_dirs = Some("/mnt/b:/mnt/a".to_string());
        let dirs = config.external_dir_list().unwrap();
        assert_eq!(dirs, vec![Utf8PathBuf::from("/mnt/a"), "/mnt/b".into()]);

        config.external_dirs = Some("relative/dir".to_string());
        assert!(config.external_dir_list().is_err());
    }
}
