/// Extensions to `std::fs` types.
use std::io;

/// Turn a `NotFound` error into a success, for callers that treat a
/// missing file as already-done.
pub fn ignore_not_found(e: io::Error) -> io::Result<()> {
    if e.kind() == io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(e)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn is_not_found_passed_through() {
        let err = io::Error::new(io::ErrorKind::NotFound, "nope");
        assert!(ignore_not_found(err).is_ok());

        let err = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(ignore_not_found(err).is_err());
    }
}
