//! The WAL stream worker: a dedicated thread that receives WAL over a
//! physical replication connection and writes it into the backup's own
//! `pg_wal` directory, terminating once the orchestrator publishes a stop
//! LSN and the stream has caught up with it.

use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use futures::{SinkExt, StreamExt};
use postgres_ffi::xlog_utils::{get_current_timestamp, XLogFileName};
use tracing::{debug, info, trace};
use utils::lsn::{AtomicLsn, Lsn};

use crate::config::ConnectionOptions;
use crate::error::{BackupError, IoResultExt, Result, WalWaitError};

/// How often the worker reports its position to the server.
const STANDBY_MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

const REPLICATION_SLOT_NAME: &str = "pagebackup_slot";

pub struct StreamArgs {
    /// `<backup>/database/pg_wal`
    pub basedir: Utf8PathBuf,
    pub conn_opts: ConnectionOptions,
    /// Start LSN of the session; streaming begins at its segment boundary.
    pub startpos: Lsn,
    pub tli: u32,
    pub seg_size: usize,
    /// Published by the orchestrator at stop-of-backup; `INVALID` until then.
    pub stop_lsn: Arc<AtomicLsn>,
    /// How long to keep draining after the stop LSN became known
    /// (checkpoint-timeout plus ten percent).
    pub stream_stop_timeout: Duration,
    pub temp_slot: bool,
    pub thread_interrupted: Arc<AtomicBool>,
}

/// Writes streamed WAL into full-size segment files, zero-padded like the
/// server's own, fsynced as each one completes.
struct WalSegmentWriter {
    basedir: Utf8PathBuf,
    tli: u32,
    seg_size: usize,
    current: Option<(u64, std::fs::File)>,
}

impl WalSegmentWriter {
    fn segment_path(&self, segno: u64) -> Utf8PathBuf {
        self.basedir.join(XLogFileName(self.tli, segno, self.seg_size))
    }

    fn open_segment(&mut self, segno: u64) -> Result<()> {
        use std::io::Write;

        let path = self.segment_path(segno);
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .io_context(|| format!("could not create WAL segment \"{path}\""))?;
        // pad the whole segment up front so a restore never sees a short file
        if file
            .metadata()
            .io_context(|| format!("could not stat \"{path}\""))?
            .len()
            < self.seg_size as u64
        {
            let zeros = vec![0u8; postgres_ffi::XLOG_BLCKSZ];
            let mut written = 0usize;
            while written < self.seg_size {
                file.write_all(&zeros)
                    .io_context(|| format!("could not pad WAL segment \"{path}\""))?;
                written += zeros.len();
            }
        }
        self.current = Some((segno, file));
        Ok(())
    }

    /// Write a chunk starting at `start`, which may span segment boundaries.
    /// Returns true if at least one segment was completed by this write.
    fn write(&mut self, start: Lsn, data: &[u8]) -> Result<bool> {
        use std::io::{Seek, SeekFrom, Write};

        let mut pos = start.0;
        let mut remaining = data;
        let mut segment_finished = false;

        while !remaining.is_empty() {
            let segno = pos / self.seg_size as u64;
            let offset = (pos % self.seg_size as u64) as usize;

            let need_open = match &self.current {
                Some((current_segno, _)) => *current_segno != segno,
                None => true,
            };
            if need_open {
                self.finish_current()?;
                self.open_segment(segno)?;
            }

            let in_segment = (self.seg_size - offset).min(remaining.len());
            let (_, file) = self.current.as_mut().unwrap();
            file.seek(SeekFrom::Start(offset as u64))
                .and_then(|_| file.write_all(&remaining[..in_segment]))
                .io_context(|| {
                    format!(
                        "could not write WAL segment \"{}\"",
                        self.basedir.join(XLogFileName(self.tli, segno, self.seg_size))
                    )
                })?;

            pos += in_segment as u64;
            remaining = &remaining[in_segment..];

            if pos % self.seg_size as u64 == 0 {
                self.finish_current()?;
                segment_finished = true;
                trace!("finished segment at {}", Lsn(pos));
            }
        }
        Ok(segment_finished)
    }

    fn finish_current(&mut self) -> Result<()> {
        if let Some((segno, file)) = self.current.take() {
            file.sync_all()
                .io_context(|| format!("could not fsync \"{}\"", self.segment_path(segno)))?;
        }
        Ok(())
    }
}

fn build_replication_config(opts: &ConnectionOptions) -> tokio_postgres::Config {
    let mut config = tokio_postgres::Config::new();
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
    if let Some(db) = &opts.pgdatabase {
        config.dbname(db);
    }
    config.application_name("pagebackup");
    config.replication_mode(tokio_postgres::config::ReplicationMode::Physical);
    config
}

/// Parsed form of the two replication messages we care about.
enum ReplicationMessage {
    XLogData { wal_start: Lsn, data: Bytes },
    PrimaryKeepAlive { wal_end: Lsn, reply_requested: bool },
    Other,
}

fn parse_replication_message(buf: &Bytes) -> Result<ReplicationMessage> {
    fn be_u64(buf: &[u8], at: usize) -> u64 {
        u64::from_be_bytes(buf[at..at + 8].try_into().unwrap())
    }

    match buf.first() {
        Some(b'w') => {
            if buf.len() < 25 {
                return Err(BackupError::Protocol(
                    "short XLogData replication message".to_string(),
                ));
            }
            Ok(ReplicationMessage::XLogData {
                wal_start: Lsn(be_u64(buf, 1)),
                data: buf.slice(25..),
            })
        }
        Some(b'k') => {
            if buf.len() < 18 {
                return Err(BackupError::Protocol(
                    "short keepalive replication message".to_string(),
                ));
            }
            Ok(ReplicationMessage::PrimaryKeepAlive {
                wal_end: Lsn(be_u64(buf, 1)),
                reply_requested: buf[17] != 0,
            })
        }
        _ => Ok(ReplicationMessage::Other),
    }
}

fn standby_status_update(write_lsn: Lsn, flush_lsn: Lsn) -> Bytes {
    let mut buf = Vec::with_capacity(34);
    buf.push(b'r');
    buf.extend_from_slice(&write_lsn.0.to_be_bytes());
    buf.extend_from_slice(&flush_lsn.0.to_be_bytes());
    buf.extend_from_slice(&0u64.to_be_bytes()); // apply position: not a standby
    buf.extend_from_slice(&get_current_timestamp().to_be_bytes());
    buf.push(0); // no reply requested
    Bytes::from(buf)
}

/// Decide whether streaming may stop: the orchestrator has published the
/// stop LSN and our position passed it. Also enforces the post-stop drain
/// timeout.
struct StopCondition {
    stop_lsn: Arc<AtomicLsn>,
    timeout: Duration,
    waiting_since: Option<Instant>,
}

impl StopCondition {
    fn check(&mut self, xlogpos: Lsn) -> Result<bool> {
        let stop_lsn = self.stop_lsn.load();
        if !stop_lsn.is_valid() {
            return Ok(false);
        }
        if xlogpos >= stop_lsn {
            return Ok(true);
        }
        match self.waiting_since {
            None => {
                info!("wait for LSN {stop_lsn} to be streamed");
                self.waiting_since = Some(Instant::now());
            }
            Some(since) => {
                if since.elapsed() > self.timeout {
                    return Err(WalWaitError::NotStreamed {
                        lsn: stop_lsn,
                        timeout: self.timeout.as_secs(),
                    }
                    .into());
                }
            }
        }
        Ok(false)
    }
}

/// Body of the stream worker thread. Returns the LSN streaming stopped at.
pub fn stream_log(args: StreamArgs) -> Result<Lsn> {
    // Always start streaming at the beginning of a segment.
    let startpos = Lsn(args.startpos.0 - args.startpos.0 % args.seg_size as u64);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .io_context(|| "could not build stream worker runtime".to_string())?;

    runtime.block_on(async move {
        let config = build_replication_config(&args.conn_opts);
        let (client, connection) = config.connect(tokio_postgres::NoTls).await?;
        // the connection object performs the actual I/O; run it off to the side
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("replication connection closed: {e}");
            }
        });

        // IDENTIFY_SYSTEM, mostly as a handshake sanity check
        let identify = client.simple_query("IDENTIFY_SYSTEM").await?;
        for message in &identify {
            if let tokio_postgres::SimpleQueryMessage::Row(row) = message {
                debug!(
                    "replication connection: systemid {:?}, timeline {:?}, xlogpos {:?}",
                    row.get(0),
                    row.get(1),
                    row.get(2)
                );
            }
        }

        if args.temp_slot {
            client
                .simple_query(&format!(
                    "CREATE_REPLICATION_SLOT \"{REPLICATION_SLOT_NAME}\" TEMPORARY PHYSICAL RESERVE_WAL"
                ))
                .await?;
        }

        let query = if args.temp_slot {
            format!(
                "START_REPLICATION SLOT \"{REPLICATION_SLOT_NAME}\" PHYSICAL {startpos} TIMELINE {}",
                args.tli
            )
        } else {
            format!("START_REPLICATION PHYSICAL {startpos} TIMELINE {}", args.tli)
        };
        info!("started streaming WAL at {startpos} (timeline {})", args.tli);

        let duplex = client.copy_both_simple::<Bytes>(&query).await?;
        let mut stream: Pin<Box<tokio_postgres::CopyBothDuplex<Bytes>>> = Box::pin(duplex);

        let mut writer = WalSegmentWriter {
            basedir: args.basedir.clone(),
            tli: args.tli,
            seg_size: args.seg_size,
            current: None,
        };
        let mut stop = StopCondition {
            stop_lsn: Arc::clone(&args.stop_lsn),
            timeout: args.stream_stop_timeout,
            waiting_since: None,
        };

        let mut written_pos = startpos;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        let mut last_status_update = Instant::now();

        loop {
            let message = tokio::select! {
                message = stream.next() => message,
                _ = ticker.tick() => {
                    crate::check_interrupt(&args.thread_interrupted)?;
                    // the stop LSN may arrive while the stream is quiet
                    if stop.check(written_pos)? {
                        break;
                    }
                    if last_status_update.elapsed() >= STANDBY_MESSAGE_TIMEOUT {
                        stream
                            .send(standby_status_update(written_pos, written_pos))
                            .await?;
                        last_status_update = Instant::now();
                    }
                    continue;
                }
            };

            let Some(message) = message else {
                return Err(BackupError::Protocol(
                    "replication stream ended unexpectedly".to_string(),
                ));
            };

            match parse_replication_message(&message?)? {
                ReplicationMessage::XLogData { wal_start, data } => {
                    let segment_finished = writer.write(wal_start, &data)?;
                    written_pos = wal_start + data.len() as u64;
                    // the stop predicate runs on every segment completion,
                    // and cheaply on every message
                    if stop.check(written_pos)? {
                        break;
                    }
                    if segment_finished {
                        stream
                            .send(standby_status_update(written_pos, written_pos))
                            .await?;
                        last_status_update = Instant::now();
                    }
                }
                ReplicationMessage::PrimaryKeepAlive {
                    wal_end,
                    reply_requested,
                } => {
                    trace!("keepalive: wal_end {wal_end}, reply {reply_requested}");
                    if reply_requested {
                        stream
                            .send(standby_status_update(written_pos, written_pos))
                            .await?;
                        last_status_update = Instant::now();
                    }
                    if stop.check(written_pos)? {
                        break;
                    }
                }
                ReplicationMessage::Other => {}
            }
        }

        writer.finish_current()?;
        info!(
            "finished streaming WAL at {written_pos} (timeline {})",
            args.tli
        );
        Ok(written_pos)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_writer_splits_and_pads() {
        let dir = camino_tempfile::tempdir().unwrap();
        let seg_size = 64 * 1024;
        let mut writer = WalSegmentWriter {
            basedir: dir.path().to_owned(),
            tli: 1,
            seg_size,
            current: None,
        };

        // a write spanning the end of segment 0 into segment 1
        let start = Lsn(seg_size as u64 - 100);
        let data = vec![0xABu8; 300];
        let finished = writer.write(start, &data).unwrap();
        assert!(finished);
        writer.finish_current().unwrap();

        let seg0 = dir.path().join(XLogFileName(1, 0, seg_size));
        let seg1 = dir.path().join(XLogFileName(1, 1, seg_size));
        let seg0_data = std::fs::read(&seg0).unwrap();
        let seg1_data = std::fs::read(&seg1).unwrap();
        // both are full-size, zero-padded
        assert_eq!(seg0_data.len(), seg_size);
        assert_eq!(seg1_data.len(), seg_size);
        assert!(seg0_data[seg_size - 100..].iter().all(|&b| b == 0xAB));
        assert!(seg1_data[..200].iter().all(|&b| b == 0xAB));
        assert!(seg1_data[200..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_parse_replication_messages() {
        // XLogData: 'w' + start + end + ts + payload
        let mut msg = vec![b'w'];
        msg.extend_from_slice(&0x1_0000_0000u64.to_be_bytes());
        msg.extend_from_slice(&0x1_0000_0100u64.to_be_bytes());
        msg.extend_from_slice(&0i64.to_be_bytes());
        msg.extend_from_slice(b"walwalwal");
        match parse_replication_message(&Bytes::from(msg)).unwrap() {
            ReplicationMessage::XLogData { wal_start, data } => {
                assert_eq!(wal_start, Lsn(0x1_0000_0000));
                assert_eq!(&data[..], b"walwalwal");
            }
            _ => panic!("expected XLogData"),
        }

        // keepalive with reply requested
        let mut msg = vec![b'k'];
        msg.extend_from_slice(&0x42u64.to_be_bytes());
        msg.extend_from_slice(&0i64.to_be_bytes());
        msg.push(1);
        match parse_replication_message(&Bytes::from(msg)).unwrap() {
            ReplicationMessage::PrimaryKeepAlive {
                wal_end,
                reply_requested,
            } => {
                assert_eq!(wal_end, Lsn(0x42));
                assert!(reply_requested);
            }
            _ => panic!("expected keepalive"),
        }

        // truncated messages are protocol errors
        assert!(parse_replication_message(&Bytes::from_static(b"w12")).is_err());
    }

    #[test]
    fn test_stop_condition() {
        let stop_lsn = Arc::new(AtomicLsn::new(0));
        let mut stop = StopCondition {
            stop_lsn: Arc::clone(&stop_lsn),
            timeout: Duration::from_secs(600),
            waiting_since: None,
        };

        // no stop LSN yet: keep streaming
        assert!(!stop.check(Lsn(0x5000)).unwrap());

        // stop LSN known but not reached: keep draining
        stop_lsn.store(Lsn(0x9000));
        assert!(!stop.check(Lsn(0x5000)).unwrap());
        assert!(stop.waiting_since.is_some());

        // reached: stop
        assert!(stop.check(Lsn(0x9000)).unwrap());

        // an expired drain window turns into an error
        let mut expired = StopCondition {
            stop_lsn: Arc::clone(&stop_lsn),
            timeout: Duration::from_secs(0),
            waiting_since: Some(Instant::now() - Duration::from_secs(1)),
        };
        assert!(expired.check(Lsn(0x100)).is_err());
    }
}
