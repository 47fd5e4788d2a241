//! Uniform file operations behind a location tag.
//!
//! Every file access of the engine names the host it expects the file on:
//! `DbHost` for the cluster's data directory, `BackupHost` for the catalog.
//! Local access is implemented here; a remote implementation (the SSH-piped
//! framed protocol) plugs in through the same trait without the engine
//! noticing.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::os::unix::fs::{FileExt, MetadataExt, PermissionsExt};

use camino::{Utf8Path, Utf8PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    BackupHost,
    DbHost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Other,
}

#[derive(Debug, Clone)]
pub struct FileStat {
    pub kind: FileKind,
    pub size: u64,
    /// Unix permission bits (the low 12 bits of st_mode).
    pub mode: u32,
    pub mtime: i64,
}

#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: String,
    pub kind: FileKind,
}

/// A file opened for sequential or positional reads.
pub trait ReadableFile: Read + Send {
    /// Read at `offset` without moving the sequential cursor, like pread(2).
    /// Short reads at end-of-file are returned as the actual byte count.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

/// A file opened for writing from scratch.
pub trait WritableFile: Write + Send {
    /// Flush userspace buffers and fsync.
    fn sync(&mut self) -> io::Result<()>;
}

/// A file opened read-write for in-place page restore.
pub trait UpdatableFile: Read + Write + Seek + Send {
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn stat(&mut self) -> io::Result<FileStat>;
    fn sync(&mut self) -> io::Result<()>;
}

pub trait FileSystem: Send + Sync {
    fn open_read(&self, path: &Utf8Path) -> io::Result<Box<dyn ReadableFile>>;
    fn create_write(&self, path: &Utf8Path) -> io::Result<Box<dyn WritableFile>>;
    /// Open read-write, creating the file when absent.
    fn open_update(&self, path: &Utf8Path) -> io::Result<Box<dyn UpdatableFile>>;

    /// lstat when `follow_symlink` is false.
    fn stat(&self, path: &Utf8Path, follow_symlink: bool) -> io::Result<FileStat>;
    fn chmod(&self, path: &Utf8Path, mode: u32) -> io::Result<()>;
    fn mkdir(&self, path: &Utf8Path, mode: u32) -> io::Result<()>;
    fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> io::Result<()>;
    fn unlink(&self, path: &Utf8Path) -> io::Result<()>;
    fn read_dir(&self, path: &Utf8Path) -> io::Result<Vec<DirEntryInfo>>;
    fn read_link(&self, path: &Utf8Path) -> io::Result<Utf8PathBuf>;

    fn file_exists(&self, path: &Utf8Path) -> io::Result<bool> {
        match self.stat(path, true) {
            Ok(st) => Ok(st.kind == FileKind::Regular),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn kind_of(ft: std::fs::FileType) -> FileKind {
    if ft.is_dir() {
        FileKind::Directory
    } else if ft.is_file() {
        FileKind::Regular
    } else if ft.is_symlink() {
        FileKind::Symlink
    } else {
        FileKind::Other
    }
}

fn stat_of(md: &std::fs::Metadata) -> FileStat {
    FileStat {
        kind: kind_of(md.file_type()),
        size: md.len(),
        mode: md.mode() & 0o7777,
        mtime: md.mtime(),
    }
}

/// Plain `std::fs` implementation.
pub struct LocalFs;

impl ReadableFile for File {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        // FileExt::read_at can return short counts; loop until EOF or full
        let mut total = 0;
        while total < buf.len() {
            match FileExt::read_at(&*self, &mut buf[total..], offset + total as u64) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}

impl WritableFile for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

impl UpdatableFile for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn stat(&mut self) -> io::Result<FileStat> {
        Ok(stat_of(&self.metadata()?))
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

impl FileSystem for LocalFs {
    fn open_read(&self, path: &Utf8Path) -> io::Result<Box<dyn ReadableFile>> {
        Ok(Box::new(File::open(path)?))
    }

    fn create_write(&self, path: &Utf8Path) -> io::Result<Box<dyn WritableFile>> {
        Ok(Box::new(File::create(path)?))
    }

    fn open_update(&self, path: &Utf8Path) -> io::Result<Box<dyn UpdatableFile>> {
        Ok(Box::new(
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)?,
        ))
    }

    fn stat(&self, path: &Utf8Path, follow_symlink: bool) -> io::Result<FileStat> {
        let md = if follow_symlink {
            std::fs::metadata(path)?
        } else {
            std::fs::symlink_metadata(path)?
        };
        Ok(stat_of(&md))
    }

    fn chmod(&self, path: &Utf8Path, mode: u32) -> io::Result<()> {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }

    fn mkdir(&self, path: &Utf8Path, mode: u32) -> io::Result<()> {
        std::fs::create_dir_all(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }

    fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn unlink(&self, path: &Utf8Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn read_dir(&self, path: &Utf8Path) -> io::Result<Vec<DirEntryInfo>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let name = entry.file_name().into_string().map_err(|name| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("non-utf8 file name {name:?} in {path}"),
                )
            })?;
            entries.push(DirEntryInfo {
                name,
                kind: kind_of(entry.file_type()?),
            });
        }
        Ok(entries)
    }

    fn read_link(&self, path: &Utf8Path) -> io::Result<Utf8PathBuf> {
        let target = std::fs::read_link(path)?;
        Utf8PathBuf::from_path_buf(target).map_err(|t| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("non-utf8 symlink target {t:?} at {path}"),
            )
        })
    }
}

/// Routes an operation to the file system serving the given location. Both
/// sides default to [`LocalFs`]; a deployment with a remote data directory
/// installs its transport for `DbHost`.
pub struct FioRouter {
    backup_host: Box<dyn FileSystem>,
    db_host: Box<dyn FileSystem>,
}

impl Default for FioRouter {
    fn default() -> Self {
        FioRouter {
            backup_host: Box::new(LocalFs),
            db_host: Box::new(LocalFs),
        }
    }
}

impl FioRouter {
    pub fn new(backup_host: Box<dyn FileSystem>, db_host: Box<dyn FileSystem>) -> Self {
        FioRouter {
            backup_host,
            db_host,
        }
    }

    pub fn at(&self, location: Location) -> &dyn FileSystem {
        match location {
            Location::BackupHost => self.backup_host.as_ref(),
            Location::DbHost => self.db_host.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_fs_roundtrip() {
        let dir = camino_tempfile::tempdir().unwrap();
        let fs = LocalFs;

        let file_path = dir.path().join("data");
        {
            let mut w = fs.create_write(&file_path).unwrap();
            w.write_all(b"hello world").unwrap();
            w.sync().unwrap();
        }

        let st = fs.stat(&file_path, true).unwrap();
        assert_eq!(st.kind, FileKind::Regular);
        assert_eq!(st.size, 11);

        let mut r = fs.open_read(&file_path).unwrap();
        let mut buf = [0u8; 5];
        let n = r.read_at(&mut buf, 6).unwrap();
        assert_eq!(&buf[..n], b"world");
        // reads past EOF come back short, not as an error
        let n = r.read_at(&mut buf, 100).unwrap();
        assert_eq!(n, 0);

        let entries = fs.read_dir(dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "data");

        assert!(fs.file_exists(&file_path).unwrap());
        fs.unlink(&file_path).unwrap();
        assert!(!fs.file_exists(&file_path).unwrap());
    }

    #[test]
    fn test_update_truncate() {
        let dir = camino_tempfile::tempdir().unwrap();
        let fs = LocalFs;
        let path = dir.path().join("target");

        let mut f = fs.open_update(&path).unwrap();
        f.write_all(&[7u8; 100]).unwrap();
        f.truncate(10).unwrap();
        assert_eq!(f.stat().unwrap().size, 10);
    }
}
