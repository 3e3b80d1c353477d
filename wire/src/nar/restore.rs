//! Materializing a parsed archive on disk.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use super::reader::{ParseOptions, ParseSink};
use super::Error;

/// A [ParseSink] that creates files, directories and symlinks under a
/// destination root.
pub struct RestoreSink {
    root: PathBuf,
    file: Option<File>,
}

impl RestoreSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        RestoreSink {
            root: root.into(),
            file: None,
        }
    }

    fn target(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }

    fn open(&mut self) -> Result<&mut File, Error> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::bad("file contents outside of a regular node"))
    }
}

impl ParseSink for RestoreSink {
    fn create_directory(&mut self, path: &Path) -> Result<(), Error> {
        fs::create_dir(self.target(path))?;
        Ok(())
    }

    fn create_regular(&mut self, path: &Path) -> Result<(), Error> {
        self.file = Some(
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.target(path))?,
        );
        Ok(())
    }

    fn is_executable(&mut self) -> Result<(), Error> {
        let file = self.open()?;
        let mut perms = file.metadata()?.permissions();
        perms.set_mode(perms.mode() | 0o111);
        file.set_permissions(perms)?;
        Ok(())
    }

    fn preallocate(&mut self, size: u64) -> Result<(), Error> {
        // best-effort; some file systems don't support it
        let _ = self.open()?.set_len(size);
        Ok(())
    }

    fn receive(&mut self, data: &[u8]) -> Result<(), Error> {
        self.open()?.write_all(data)?;
        Ok(())
    }

    fn close_regular(&mut self) -> Result<(), Error> {
        self.file = None;
        Ok(())
    }

    fn create_symlink(&mut self, path: &Path, target: Vec<u8>) -> Result<(), Error> {
        use std::os::unix::ffi::OsStringExt;
        let target = PathBuf::from(std::ffi::OsString::from_vec(target));
        symlink(&target, self.target(path))?;
        Ok(())
    }
}

/// Restore one archive from `source` into a fresh tree at `path`.
/// `path` itself is created by the archive's root node.
pub fn restore<R: Read>(source: &mut R, path: impl Into<PathBuf>) -> Result<(), Error> {
    restore_with(ParseOptions::default(), source, path)
}

pub fn restore_with<R: Read>(
    options: ParseOptions,
    source: &mut R,
    path: impl Into<PathBuf>,
) -> Result<(), Error> {
    // the root node's relative path is empty, so the archive's root
    // object is created at `path` itself
    let mut sink = RestoreSink::new(path.into());
    options.parse(source, &mut sink)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Cursor;
    use std::os::unix::fs::{symlink, PermissionsExt};

    use crate::nar;

    #[test]
    fn dump_then_restore_roundtrips() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("foo"), "hello\n").unwrap();
        let mut perms = fs::metadata(src.path().join("foo")).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(src.path().join("foo"), perms).unwrap();
        fs::create_dir(src.path().join("bar")).unwrap();
        symlink("y", src.path().join("bar/x")).unwrap();

        let mut buf = vec![];
        nar::dump(src.path(), &mut buf).unwrap();

        let dst = tempfile::tempdir().unwrap();
        let root = dst.path().join("out");
        super::restore(&mut Cursor::new(&buf), &root).unwrap();

        assert_eq!(fs::read(root.join("foo")).unwrap(), b"hello\n");
        assert!(fs::metadata(root.join("foo")).unwrap().permissions().mode() & 0o100 != 0);
        assert_eq!(fs::read_link(root.join("bar/x")).unwrap().to_str(), Some("y"));

        // and the re-serialization is byte-identical
        let mut buf2 = vec![];
        nar::dump(&root, &mut buf2).unwrap();
        assert_eq!(buf, buf2);
    }

    #[test]
    fn restore_refuses_to_overwrite() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("f"), "x").unwrap();
        let mut buf = vec![];
        nar::dump(&src.path().join("f"), &mut buf).unwrap();

        let dst = tempfile::tempdir().unwrap();
        let root = dst.path().join("out");
        fs::write(&root, "already here").unwrap();
        super::restore(&mut Cursor::new(&buf), &root).unwrap_err();
    }

    #[test]
    fn empty_symlink_target_roundtrips_as_token() {
        // an empty target is representable on the wire even though the
        // OS won't create such a link; the parser must deliver it
        let mut buf = vec![];
        for t in [
            &b"nix-archive-1"[..], b"(", b"type", b"symlink", b"target", b"", b")",
        ] {
            nar::wire::write_bytes(&mut buf, t).unwrap();
        }

        struct Grab(Vec<u8>);
        impl nar::ParseSink for Grab {
            fn create_directory(&mut self, _: &std::path::Path) -> Result<(), nar::Error> { Ok(()) }
            fn create_regular(&mut self, _: &std::path::Path) -> Result<(), nar::Error> { Ok(()) }
            fn is_executable(&mut self) -> Result<(), nar::Error> { Ok(()) }
            fn preallocate(&mut self, _: u64) -> Result<(), nar::Error> { Ok(()) }
            fn receive(&mut self, _: &[u8]) -> Result<(), nar::Error> { Ok(()) }
            fn close_regular(&mut self) -> Result<(), nar::Error> { Ok(()) }
            fn create_symlink(&mut self, _: &std::path::Path, t: Vec<u8>) -> Result<(), nar::Error> {
                self.0 = t;
                Ok(())
            }
        }

        let mut sink = Grab(vec![1]);
        nar::parse(&mut Cursor::new(&buf), &mut sink).unwrap();
        assert!(sink.0.is_empty());
    }
}
