//! SQL RPCs against the backed-up cluster. Every result crosses the wire as
//! text and goes through a total parser; parse and use are never interleaved.

use std::time::Duration;

use camino::Utf8Path;
use postgres::{Client, Config, NoTls, SimpleQueryMessage};
use tracing::{debug, info, warn};
use utils::lsn::Lsn;

use crate::config::{parse_bool_setting, parse_seconds_setting, ConnectionOptions};
use crate::catalog::parse_iso_time;
use crate::error::{BackupError, IoResultExt, Result};

/// Versions below this are out of support: non-exclusive backup and the
/// WAL-layout assumptions baked into this tool need PostgreSQL 10.
pub const MIN_SUPPORTED_VERSION: u32 = 100_000;

pub struct DbConn {
    client: Client,
    opts: ConnectionOptions,
    pub server_version: u32,
    pub server_version_str: String,
}

fn build_config(opts: &ConnectionOptions, dbname_override: Option<&str>) -> Config {
    let mut config = Config::new();
    if let Some(host) = &opts.pghost {
        config.host(host);
    } else {
        config.host("/var/run/postgresql");
    }
    config.port(opts.pgport);
    let user = opts
        .pguser
        .clone()
        .or_else(|| std::env::var("PGUSER").ok())
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "postgres".to_string());
    config.user(&user);
    let dbname = dbname_override
        .map(str::to_string)
        .or_else(|| opts.pgdatabase.clone())
        .unwrap_or_else(|| "postgres".to_string());
    config.dbname(&dbname);
    config.application_name("pagebackup");
    config.connect_timeout(Duration::from_secs(30));
    config
}

impl DbConn {
    /// Open a connection and confirm that the server version is supported.
    pub fn connect(opts: &ConnectionOptions) -> Result<DbConn> {
        Self::connect_to_db(opts, None)
    }

    pub fn connect_to_db(opts: &ConnectionOptions, dbname: Option<&str>) -> Result<DbConn> {
        let client = build_config(opts, dbname).connect(NoTls)?;
        let mut conn = DbConn {
            client,
            opts: opts.clone(),
            server_version: 0,
            server_version_str: String::new(),
        };

        let version_num = conn.show("server_version_num")?;
        conn.server_version = version_num.trim().parse().map_err(|_| {
            BackupError::Protocol(format!("unknown server version \"{version_num}\""))
        })?;
        conn.server_version_str = conn.show("server_version")?.trim().to_string();

        if conn.server_version < MIN_SUPPORTED_VERSION {
            return Err(BackupError::Config(format!(
                "server version is {}, must be 10 or higher",
                conn.server_version_str
            )));
        }
        Ok(conn)
    }

    fn show(&mut self, name: &str) -> Result<String> {
        let messages = self.client.simple_query(&format!("SHOW {name}"))?;
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                return row
                    .get(0)
                    .map(str::to_string)
                    .ok_or_else(|| BackupError::Protocol(format!("cannot get {name}")));
            }
        }
        Err(BackupError::Protocol(format!("cannot get {name}")))
    }

    /// Ensure the server was compiled with the page size we were.
    pub fn confirm_block_size(&mut self, name: &str, expected: u32) -> Result<()> {
        let row = self
            .client
            .query_one("SELECT pg_catalog.current_setting($1)", &[&name])?;
        let value: String = row.get(0);
        let block_size: u32 = value.trim().parse().map_err(|_| {
            BackupError::Protocol(format!("cannot parse {name} value \"{value}\""))
        })?;
        if block_size != expected {
            return Err(BackupError::Config(format!(
                "{name}({block_size}) is not compatible({expected} expected)"
            )));
        }
        Ok(())
    }

    pub fn is_in_recovery(&mut self) -> Result<bool> {
        let row = self
            .client
            .query_one("SELECT pg_catalog.pg_is_in_recovery()", &[])?;
        Ok(row.get(0))
    }

    pub fn checksum_enabled(&mut self) -> Result<bool> {
        parse_bool_setting(&self.show("data_checksums")?)
    }

    pub fn checkpoint_timeout(&mut self) -> Result<u64> {
        parse_seconds_setting(&self.show("checkpoint_timeout")?)
    }

    pub fn current_timeline(&mut self) -> Result<u32> {
        let row = self.client.query_one(
            "SELECT timeline_id::text FROM pg_catalog.pg_control_checkpoint()",
            &[],
        )?;
        let value: String = row.get(0);
        value
            .trim()
            .parse()
            .map_err(|_| BackupError::Protocol(format!("invalid timeline id \"{value}\"")))
    }

    pub fn system_identifier(&mut self) -> Result<u64> {
        let row = self.client.query_one(
            "SELECT system_identifier::text FROM pg_catalog.pg_control_system()",
            &[],
        )?;
        let value: String = row.get(0);
        value
            .trim()
            .parse()
            .map_err(|_| BackupError::Protocol(format!("invalid system identifier \"{value}\"")))
    }

    /// Issue start-of-backup. Returns the start LSN.
    pub fn start_backup(&mut self, label: &str, smooth: bool, exclusive: bool) -> Result<Lsn> {
        self.client
            .batch_execute("SET client_min_messages = warning;")?;
        // second argument is 'fast'
        let fast = !smooth;
        let row = if exclusive {
            self.client.query_one(
                "SELECT pg_catalog.pg_start_backup($1, $2)::text",
                &[&label, &fast],
            )?
        } else {
            self.client.query_one(
                "SELECT pg_catalog.pg_start_backup($1, $2, false)::text",
                &[&label, &fast],
            )?
        };
        let value: String = row.get(0);
        value
            .parse()
            .map_err(|_| BackupError::Protocol(format!("invalid start LSN \"{value}\"")))
    }

    /// Switch to a new WAL segment. Must only be called on a primary.
    pub fn switch_wal(&mut self) -> Result<()> {
        self.client
            .batch_execute("SET client_min_messages = warning;")?;
        self.client
            .query_one("SELECT pg_catalog.pg_switch_wal()::text", &[])?;
        Ok(())
    }

    pub fn create_restore_point(&mut self, name: &str) -> Result<Lsn> {
        let row = self.client.query_one(
            "SELECT pg_catalog.pg_create_restore_point($1)::text",
            &[&name],
        )?;
        let value: String = row.get(0);
        value
            .parse()
            .map_err(|_| BackupError::Protocol(format!("invalid restore point LSN \"{value}\"")))
    }

    pub fn last_replay_lsn(&mut self) -> Result<Option<Lsn>> {
        let row = self.client.query_one(
            "SELECT pg_catalog.pg_last_wal_replay_lsn()::text",
            &[],
        )?;
        let value: Option<String> = row.get(0);
        parse_optional_lsn(value)
    }

    pub fn last_receive_lsn(&mut self) -> Result<Option<Lsn>> {
        let row = self.client.query_one(
            "SELECT pg_catalog.pg_last_wal_receive_lsn()::text",
            &[],
        )?;
        let value: Option<String> = row.get(0);
        parse_optional_lsn(value)
    }

    /// Absolute paths of all tablespaces with on-disk locations.
    pub fn tablespace_locations(&mut self) -> Result<Vec<String>> {
        let rows = self.client.query(
            "SELECT pg_catalog.pg_tablespace_location(oid) \
             FROM pg_catalog.pg_tablespace \
             WHERE pg_catalog.pg_tablespace_location(oid) <> ''",
            &[],
        )?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    // -- change-tracking extension ------------------------------------------

    /// The extension is usable if ptrack_version() exists and reports a
    /// version we know how to talk to.
    pub fn ptrack_support(&mut self) -> Result<bool> {
        let rows = self.client.query(
            "SELECT proname FROM pg_proc WHERE proname='ptrack_version'",
            &[],
        )?;
        if rows.is_empty() {
            return Ok(false);
        }
        let row = self
            .client
            .query_one("SELECT pg_catalog.ptrack_version()", &[])?;
        let version: String = row.get(0);
        match version.trim() {
            "1.5" | "1.6" | "1.7" => Ok(true),
            other => {
                warn!(
                    "update the ptrack extension to version 1.5 or upper, current version is {other}"
                );
                Ok(false)
            }
        }
    }

    pub fn ptrack_enabled(&mut self) -> Result<bool> {
        match self.show("ptrack_enable") {
            Ok(value) => parse_bool_setting(&value),
            // the GUC does not exist when the extension is not installed
            Err(_) => Ok(false),
        }
    }

    pub fn ptrack_control_lsn(&mut self) -> Result<Lsn> {
        let row = self
            .client
            .query_one("SELECT pg_catalog.ptrack_control_lsn()::text", &[])?;
        let value: String = row.get(0);
        value
            .parse()
            .map_err(|_| BackupError::Protocol(format!("invalid ptrack control LSN \"{value}\"")))
    }

    /// Clear the change maps in every database of the instance.
    pub fn ptrack_clear(&mut self) -> Result<()> {
        let dbs: Vec<(String, u32, u32)> = self
            .client
            .query(
                "SELECT datname, oid, dattablespace FROM pg_database",
                &[],
            )?
            .iter()
            .map(|row| (row.get(0), row.get(1), row.get(2)))
            .collect();

        for (datname, db_oid, tblspc_oid) in dbs {
            if datname == "template0" {
                continue;
            }
            let mut db_conn = DbConn::connect_to_db(&self.opts, Some(&datname))?;
            db_conn
                .client
                .query_one("SELECT pg_catalog.ptrack_clear()", &[])?;
            db_conn.client.query_one(
                "SELECT pg_catalog.ptrack_get_and_clear_db($1, $2)",
                &[&db_oid, &tblspc_oid],
            )?;
        }
        Ok(())
    }

    /// True when the database had a `ptrack_init` file (=> its change maps
    /// cannot be trusted and the whole database is copied).
    pub fn ptrack_get_and_clear_db(&mut self, db_oid: u32, tblspc_oid: u32) -> Result<bool> {
        let rows = self.client.query(
            "SELECT datname FROM pg_database WHERE oid=$1",
            &[&db_oid],
        )?;
        // the database may have been dropped since the previous backup
        let Some(row) = rows.first() else {
            return Ok(false);
        };
        let datname: String = row.get(0);
        // always back up all files of template0
        if datname == "template0" {
            return Ok(true);
        }

        let row = self.client.query_one(
            "SELECT pg_catalog.ptrack_get_and_clear_db($1, $2)::text",
            &[&db_oid, &tblspc_oid],
        )?;
        let value: String = row.get(0);
        parse_bool_setting(&value).map_err(|_| {
            BackupError::Protocol(format!(
                "result of ptrack_get_and_clear_db() is invalid: {value}"
            ))
        })
    }

    /// Fetch-and-clear the change bitmap of a relation: a byte string of
    /// `RELSEG_SIZE / 8` bytes per segment. `None` when no map exists.
    pub fn ptrack_get_and_clear(
        &mut self,
        tblspc_oid: u32,
        db_oid: u32,
        rel_oid: u32,
    ) -> Result<Option<Vec<u8>>> {
        // a relation outside 'global' must be asked through its database
        let map = if db_oid != 0 {
            let rows = self.client.query(
                "SELECT datname FROM pg_database WHERE oid=$1",
                &[&db_oid],
            )?;
            let Some(row) = rows.first() else {
                return Ok(None);
            };
            let datname: String = row.get(0);
            if datname == "template0" {
                return Ok(None);
            }

            let mut db_conn = DbConn::connect_to_db(&self.opts, Some(&datname))?;
            let row = db_conn.client.query_one(
                "SELECT pg_catalog.ptrack_get_and_clear($1, $2)",
                &[&tblspc_oid, &rel_oid],
            )?;
            row.get::<_, Option<Vec<u8>>>(0)
        } else {
            let row = self.client.query_one(
                "SELECT pg_catalog.ptrack_get_and_clear($1, $2)",
                &[&tblspc_oid, &rel_oid],
            )?;
            row.get::<_, Option<Vec<u8>>>(0)
        };

        match map {
            None => Ok(None),
            Some(map) if map.is_empty() => Ok(None),
            Some(map) => Ok(Some(map)),
        }
    }
}

fn parse_optional_lsn(value: Option<String>) -> Result<Option<Lsn>> {
    match value {
        None => Ok(None),
        Some(value) => {
            let lsn: Lsn = value
                .parse()
                .map_err(|_| BackupError::Protocol(format!("invalid LSN \"{value}\"")))?;
            Ok(if lsn.is_valid() { Some(lsn) } else { None })
        }
    }
}

/// Lazy per-worker connection used to fetch single blocks through the
/// change-tracking extension when rereads cannot beat a torn page.
pub struct PtrackBlockSource {
    opts: ConnectionOptions,
    conn: Option<Client>,
}

impl PtrackBlockSource {
    pub fn new(opts: ConnectionOptions) -> PtrackBlockSource {
        PtrackBlockSource { opts, conn: None }
    }

    pub fn get_block(
        &mut self,
        db_oid: u32,
        tblspc_oid: u32,
        rel_oid: u32,
        absolute_blkno: u32,
    ) -> Result<Option<Vec<u8>>> {
        if self.conn.is_none() {
            self.conn = Some(build_config(&self.opts, None).connect(NoTls)?);
        }
        let client = self.conn.as_mut().unwrap();
        let row = client.query_one(
            "SELECT pg_catalog.ptrack_get_block_2($1, $2, $3, $4)",
            &[&tblspc_oid, &db_oid, &rel_oid, &(absolute_blkno as i64)],
        )?;
        let block: Option<Vec<u8>> = row.get(0);
        if block.is_none() {
            debug!("cannot get file block for relation oid {rel_oid}");
        }
        Ok(block)
    }
}

pub struct StopBackupResult {
    pub lsn: Lsn,
    pub recovery_xid: u64,
    /// Unix seconds of the server's clock at stop time; used as the fallback
    /// recovery time when WAL has no later transaction end.
    pub recovery_time: i64,
    pub backup_label: Option<String>,
    pub tablespace_map: Option<String>,
}

/// Send stop-of-backup and poll for the result, so an interrupt or the
/// archive timeout can cancel it: if the server's archive_command is stuck,
/// a plain blocking call would hang forever.
///
/// `restore_point` names a restore point created right before stopping;
/// pass `None` on replicas (they cannot create one) and on cleanup paths.
pub fn stop_backup(
    conn: &mut DbConn,
    exclusive: bool,
    from_replica: bool,
    archive_timeout: u64,
    restore_point: Option<&str>,
) -> Result<StopBackupResult> {
    conn.client
        .batch_execute("SET client_min_messages = warning;")?;

    if let Some(name) = restore_point {
        conn.create_restore_point(name)?;
    }

    let query = if exclusive {
        "SELECT pg_catalog.txid_snapshot_xmax(pg_catalog.txid_current_snapshot())::text, \
         current_timestamp(0)::timestamptz::text, \
         pg_catalog.pg_stop_backup()::text, \
         NULL::text, \
         NULL::text"
    } else if from_replica {
        // a replica's own minRecoveryPoint is not trustworthy; the latest
        // replayed LSN is used as the stop LSN instead
        "SELECT pg_catalog.txid_snapshot_xmax(pg_catalog.txid_current_snapshot())::text, \
         current_timestamp(0)::timestamptz::text, \
         pg_catalog.pg_last_wal_replay_lsn()::text, \
         labelfile, \
         spcmapfile \
         FROM pg_catalog.pg_stop_backup(false, false)"
    } else {
        "SELECT pg_catalog.txid_snapshot_xmax(pg_catalog.txid_current_snapshot())::text, \
         current_timestamp(0)::timestamptz::text, \
         lsn::text, \
         labelfile, \
         spcmapfile \
         FROM pg_catalog.pg_stop_backup(false, false)"
    };

    let cancel = conn.client.cancel_token();
    let client = &mut conn.client;

    let row = std::thread::scope(|scope| {
        let handle = scope.spawn(move || client.query_one(query, &[]));

        let mut waited = 0u64;
        loop {
            if handle.is_finished() {
                break handle
                    .join()
                    .map_err(|_| BackupError::Protocol("pg_stop_backup() panicked".to_string()))?
                    .map_err(BackupError::from);
            }
            std::thread::sleep(Duration::from_secs(1));
            waited += 1;

            if waited == 1 {
                info!("wait for pg_stop_backup()");
            }
            if crate::interrupted() {
                let _ = cancel.cancel_query(NoTls);
                break Err(BackupError::Interrupted);
            }
            // the server hasn't answered: poke it and give up
            if waited > archive_timeout {
                let _ = cancel.cancel_query(NoTls);
                break Err(BackupError::Protocol(format!(
                    "pg_stop_backup doesn't answer in {archive_timeout} seconds, cancel it"
                )));
            }
        }
    })?;

    let xmax: String = row.get(0);
    let timestamp: String = row.get(1);
    let lsn: Option<String> = row.get(2);
    let backup_label: Option<String> = row.get(3);
    let tablespace_map: Option<String> = row.get(4);

    let recovery_xid = xmax.trim().parse().map_err(|_| {
        BackupError::Protocol(format!("result of txid_snapshot_xmax() is invalid: {xmax}"))
    })?;
    let recovery_time = parse_iso_time(&timestamp).ok_or_else(|| {
        BackupError::Protocol(format!("result of current_timestamp is invalid: {timestamp}"))
    })?;
    let lsn = lsn
        .as_deref()
        .unwrap_or("")
        .parse()
        .map_err(|_| BackupError::Protocol(format!("invalid stop LSN {lsn:?}")))?;

    Ok(StopBackupResult {
        lsn,
        recovery_xid,
        recovery_time,
        backup_label,
        tablespace_map: tablespace_map.filter(|map| !map.is_empty()),
    })
}

/// Read the cluster's system identifier straight out of `global/pg_control`;
/// it is the first field of ControlFileData.
pub fn local_system_identifier(pgdata: &Utf8Path) -> Result<u64> {
    let control_path = pgdata.join("global/pg_control");
    let bytes = std::fs::read(&control_path)
        .io_context(|| format!("cannot read control file \"{control_path}\""))?;
    if bytes.len() < 8 {
        return Err(BackupError::Catalog(format!(
            "control file \"{control_path}\" is truncated"
        )));
    }
    Ok(u64::from_le_bytes(bytes[0..8].try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_system_identifier() {
        let dir = camino_tempfile::tempdir().unwrap();
        let global = dir.path().join("global");
        std::fs::create_dir_all(&global).unwrap();

        let mut control = vec![0u8; 8192];
        control[0..8].copy_from_slice(&0x1122_3344_5566_7788u64.to_le_bytes());
        std::fs::write(global.join("pg_control"), control).unwrap();

        assert_eq!(
            local_system_identifier(dir.path()).unwrap(),
            0x1122_3344_5566_7788
        );

        // truncated control file
        std::fs::write(global.join("pg_control"), [1, 2, 3]).unwrap();
        assert!(local_system_identifier(dir.path()).is_err());
    }

    #[test]
    fn test_parse_optional_lsn() {
        assert_eq!(parse_optional_lsn(None).unwrap(), None);
        assert_eq!(parse_optional_lsn(Some("0/0".into())).unwrap(), None);
        assert_eq!(
            parse_optional_lsn(Some("1/2A".into())).unwrap(),
            Some(Lsn(0x1_0000002A))
        );
        assert!(parse_optional_lsn(Some("bogus".into())).is_err());
    }
}
