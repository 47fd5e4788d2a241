//!
//! Common utilities for dealing with PostgreSQL relation files.
//!
use regex::Regex;

use crate::pg_constants;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum FilePathError {
    #[error("invalid relation fork name")]
    InvalidForkName,
    #[error("invalid relation data file name")]
    InvalidFileName,
}

impl From<core::num::ParseIntError> for FilePathError {
    fn from(_e: core::num::ParseIntError) -> Self {
        FilePathError::InvalidFileName
    }
}

/// Convert Postgres relation file's fork suffix to fork number.
pub fn forkname_to_number(forkname: Option<&str>) -> Result<u8, FilePathError> {
    match forkname {
        // "main" is not in filenames, it's implicit if the fork name is not present
        None => Ok(pg_constants::MAIN_FORKNUM),
        Some("fsm") => Ok(pg_constants::FSM_FORKNUM),
        Some("vm") => Ok(pg_constants::VISIBILITYMAP_FORKNUM),
        Some("init") => Ok(pg_constants::INIT_FORKNUM),
        Some(_) => Err(FilePathError::InvalidForkName),
    }
}

/// Convert Postgres fork number to the right suffix of the relation data file.
pub fn forknumber_to_name(forknum: u8) -> Option<&'static str> {
    match forknum {
        pg_constants::MAIN_FORKNUM => None,
        pg_constants::FSM_FORKNUM => Some("fsm"),
        pg_constants::VISIBILITYMAP_FORKNUM => Some("vm"),
        pg_constants::INIT_FORKNUM => Some("init"),
        _ => panic!("unrecognized fork number"),
    }
}

///
/// Split a filename of a relation file into (relfilenode, fork name, segno).
///
/// Formats:
/// `<oid>`
/// `<oid>_<fork name>`
/// `<oid>.<segment number>`
/// `<oid>_<fork name>.<segment number>`
///
/// See functions relpath() and _mdfd_segpath() in PostgreSQL sources.
///
/// The fork name is returned as spelled in the file name and is not
/// validated; callers that only accept real forks go through
/// [`forkname_to_number`]. That keeps extension-private forks (e.g. "ptrack")
/// distinguishable from garbage.
///
pub fn split_relfilename(fname: &str) -> Result<(u32, Option<&str>, u32), FilePathError> {
    let re = Regex::new(r"^(?P<relnode>\d+)(_(?P<forkname>[a-z]+))?(\.(?P<segno>\d+))?$").unwrap();

    let caps = re.captures(fname).ok_or(FilePathError::InvalidFileName)?;

    let relnode_str = caps.name("relnode").unwrap().as_str();
    let relnode = relnode_str.parse::<u32>()?;

    let forkname = caps.name("forkname").map(|f| f.as_str());

    let segno = match caps.name("segno") {
        None => 0,
        Some(segno) => segno.as_str().parse::<u32>()?,
    };

    Ok((relnode, forkname, segno))
}

///
/// Parse a filename of a relation file. Returns (relfilenode, forknum, segno) tuple.
///
pub fn parse_relfilename(fname: &str) -> Result<(u32, u8, u32), FilePathError> {
    let (relnode, forkname, segno) = split_relfilename(fname)?;
    let forknum = forkname_to_number(forkname)?;
    Ok((relnode, forknum, segno))
}

/// Compute the relation path, relative to the tablespace directory, the way
/// relpathperm() spells it.
pub fn relfilename(relnode: u32, forknum: u8, segno: u32) -> String {
    let mut name = relnode.to_string();
    if let Some(fork) = forknumber_to_name(forknum) {
        name.push('_');
        name.push_str(fork);
    }
    if segno != 0 {
        name.push('.');
        name.push_str(&segno.to_string());
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_relfilenames() {
        assert_eq!(parse_relfilename("1234"), Ok((1234, 0, 0)));
        assert_eq!(parse_relfilename("1234_fsm"), Ok((1234, 1, 0)));
        assert_eq!(parse_relfilename("1234_vm"), Ok((1234, 2, 0)));
        assert_eq!(parse_relfilename("1234_init"), Ok((1234, 3, 0)));

        assert_eq!(parse_relfilename("1234.12"), Ok((1234, 0, 12)));
        assert_eq!(parse_relfilename("1234_fsm.12"), Ok((1234, 1, 12)));
        assert_eq!(parse_relfilename("1234_vm.12"), Ok((1234, 2, 12)));
        assert_eq!(parse_relfilename("1234_init.12"), Ok((1234, 3, 12)));

        // relfilenode is unsigned, so it can go up to 2^32-1
        assert_eq!(parse_relfilename("3147483648"), Ok((3147483648, 0, 0)));
    }

    #[test]
    fn test_parse_invalid_relfilenames() {
        assert_eq!(
            parse_relfilename("foo"),
            Err(FilePathError::InvalidFileName)
        );
        assert_eq!(
            parse_relfilename("1.2.3"),
            Err(FilePathError::InvalidFileName)
        );
        assert_eq!(
            parse_relfilename("1234_invalid"),
            Err(FilePathError::InvalidForkName)
        );
        assert_eq!(
            parse_relfilename("1234_"),
            Err(FilePathError::InvalidFileName)
        );

        // too large for u32
        assert_eq!(
            parse_relfilename("12345678901"),
            Err(FilePathError::InvalidFileName)
        );
        assert_eq!(
            parse_relfilename("-1234"),
            Err(FilePathError::InvalidFileName)
        );
    }

    #[test]
    fn test_split_preserves_private_forks() {
        // extension-private fork names split fine but fail strict parsing
        assert_eq!(split_relfilename("16384_ptrack"), Ok((16384, Some("ptrack"), 0)));
        assert_eq!(
            parse_relfilename("16384_ptrack"),
            Err(FilePathError::InvalidForkName)
        );
    }

    #[test]
    fn test_relfilename_roundtrip() {
        for (node, fork, segno) in [(1234, 0, 0), (1234, 1, 0), (1234, 0, 3), (99999, 3, 17)] {
            let name = relfilename(node, fork, segno);
            assert_eq!(parse_relfilename(&name), Ok((node, fork, segno)));
        }
    }
}
