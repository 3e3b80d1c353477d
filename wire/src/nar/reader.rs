//! Streaming NAR parser.
//!
//! The parser validates the framing and grammar and emits construction
//! events to a [ParseSink]. Restoring to disk, hashing, and plain
//! validation are all sinks over the same event stream.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use super::{wire, Error, CASE_HACK_SUFFIX};

/// Receiver of tree-construction events, in the order the serialization
/// yields them. `path` arguments are relative to the archive root; the
/// root itself is the empty path.
pub trait ParseSink {
    fn create_directory(&mut self, path: &Path) -> Result<(), Error>;
    fn create_regular(&mut self, path: &Path) -> Result<(), Error>;
    fn is_executable(&mut self) -> Result<(), Error>;
    fn preallocate(&mut self, size: u64) -> Result<(), Error>;
    fn receive(&mut self, data: &[u8]) -> Result<(), Error>;
    fn close_regular(&mut self) -> Result<(), Error>;
    fn create_symlink(&mut self, path: &Path, target: Vec<u8>) -> Result<(), Error>;
}

/// A sink that discards every event; parsing into it merely validates
/// the archive.
pub struct NullSink;

impl ParseSink for NullSink {
    fn create_directory(&mut self, _: &Path) -> Result<(), Error> {
        Ok(())
    }
    fn create_regular(&mut self, _: &Path) -> Result<(), Error> {
        Ok(())
    }
    fn is_executable(&mut self) -> Result<(), Error> {
        Ok(())
    }
    fn preallocate(&mut self, _: u64) -> Result<(), Error> {
        Ok(())
    }
    fn receive(&mut self, _: &[u8]) -> Result<(), Error> {
        Ok(())
    }
    fn close_regular(&mut self) -> Result<(), Error> {
        Ok(())
    }
    fn create_symlink(&mut self, _: &Path, _: Vec<u8>) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Default)]
pub struct ParseOptions {
    use_case_hack: bool,
}

impl ParseOptions {
    /// Append `~nix~case~hack~N` to names that collide case-insensitively
    /// with an earlier entry of the same directory.
    pub fn use_case_hack(mut self, enable: bool) -> Self {
        self.use_case_hack = enable;
        self
    }

    pub fn parse<R: Read, S: ParseSink>(&self, source: &mut R, sink: &mut S) -> Result<(), Error> {
        match wire::read_token(source) {
            Ok(tok) if tok == wire::MAGIC => {}
            _ => return Err(Error::bad("input doesn't look like an archive")),
        }
        self.parse_node(source, sink, PathBuf::new())
    }

    fn parse_node<R: Read, S: ParseSink>(
        &self,
        source: &mut R,
        sink: &mut S,
        path: PathBuf,
    ) -> Result<(), Error> {
        wire::expect_token(source, "(")?;
        wire::expect_token(source, "type")?;

        match wire::read_token(source)?.as_str() {
            "regular" => {
                sink.create_regular(&path)?;

                let mut tok = wire::read_token(source)?;
                if tok == "executable" {
                    if !wire::read_bytes(source, 0)?.is_empty() {
                        return Err(Error::bad("executable marker has non-empty value"));
                    }
                    sink.is_executable()?;
                    tok = wire::read_token(source)?;
                }
                if tok != "contents" {
                    return Err(Error::bad(format!("expected \"contents\", got {tok:?}")));
                }

                let size = wire::read_u64(source)?;
                sink.preallocate(size)?;

                let mut buf = [0u8; 65536];
                let mut left = size;
                while left > 0 {
                    let want = left.min(buf.len() as u64) as usize;
                    let n = source.read(&mut buf[..want])?;
                    if n == 0 {
                        return Err(Error::bad("archive ended inside file contents"));
                    }
                    sink.receive(&buf[..n])?;
                    left -= n as u64;
                }
                wire::read_padding(source, size)?;
                sink.close_regular()?;

                wire::expect_token(source, ")")?;
            }

            "symlink" => {
                wire::expect_token(source, "target")?;
                let target = wire::read_bytes(source, wire::MAX_TARGET_LEN)?;
                sink.create_symlink(&path, target)?;
                wire::expect_token(source, ")")?;
            }

            "directory" => {
                sink.create_directory(&path)?;
                self.parse_entries(source, sink, path)?;
            }

            tok => return Err(Error::bad(format!("unknown file type {tok:?}"))),
        }

        Ok(())
    }

    fn parse_entries<R: Read, S: ParseSink>(
        &self,
        source: &mut R,
        sink: &mut S,
        path: PathBuf,
    ) -> Result<(), Error> {
        let mut prev_name: Option<Vec<u8>> = None;
        // lowercased name -> (first spelling, collision count); only
        // consulted when the case hack is active
        let mut seen: BTreeMap<Vec<u8>, u32> = BTreeMap::new();

        loop {
            match wire::read_token(source)?.as_str() {
                ")" => return Ok(()),
                "entry" => {}
                tok => return Err(Error::bad(format!("expected an entry, got {tok:?}"))),
            }

            wire::expect_token(source, "(")?;
            wire::expect_token(source, "name")?;

            let mut name = wire::read_bytes(source, wire::MAX_NAME_LEN)?;
            validate_name(&name)?;
            if let Some(prev) = &prev_name {
                if *prev >= name {
                    return Err(Error::bad("directory entries are not sorted"));
                }
            }
            prev_name = Some(name.clone());

            if self.use_case_hack {
                let folded = name.to_ascii_lowercase();
                match seen.get_mut(&folded) {
                    Some(count) => {
                        *count += 1;
                        tracing::debug!(name = %String::from_utf8_lossy(&name), "case collision");
                        name.extend_from_slice(CASE_HACK_SUFFIX.as_bytes());
                        name.extend_from_slice(count.to_string().as_bytes());
                    }
                    None => {
                        seen.insert(folded, 0);
                    }
                }
            }

            wire::expect_token(source, "node")?;
            let child = {
                use std::ffi::OsString;
                use std::os::unix::ffi::OsStringExt;
                path.join(OsString::from_vec(name))
            };
            self.parse_node(source, sink, child)?;
            wire::expect_token(source, ")")?;
        }
    }
}

fn validate_name(name: &[u8]) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::bad("entry name is empty"));
    }
    if name == b"." || name == b".." {
        return Err(Error::bad("entry name is a reserved name"));
    }
    if name.contains(&b'/') || name.contains(&0) {
        return Err(Error::bad("entry name contains an invalid character"));
    }
    Ok(())
}

/// Parse one archive from `source`, emitting events to `sink`, with
/// default options.
pub fn parse<R: Read, S: ParseSink>(source: &mut R, sink: &mut S) -> Result<(), Error> {
    ParseOptions::default().parse(source, sink)
}

/// Re-serialize an archive: every byte read from `source` is forwarded
/// to `sink`, while the parser validates the format. On bytes produced
/// by [super::dump] this is the identity.
pub fn copy_nar<R: Read, W: Write>(source: &mut R, sink: &mut W) -> Result<(), Error> {
    struct Tee<'a, R, W> {
        source: &'a mut R,
        sink: &'a mut W,
    }

    impl<R: Read, W: Write> Read for Tee<'_, R, W> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.source.read(buf)?;
            self.sink.write_all(&buf[..n])?;
            Ok(n)
        }
    }

    let mut tee = Tee { source, sink };
    parse(&mut tee, &mut NullSink)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::path::Path;

    use crate::nar::{self, wire};

    use super::{copy_nar, parse, NullSink, ParseOptions, ParseSink};

    fn tok_archive(tokens: &[&[u8]]) -> Vec<u8> {
        let mut buf = vec![];
        for t in tokens {
            wire::write_bytes(&mut buf, t).unwrap();
        }
        buf
    }

    /// Records events as strings, for asserting on event order.
    #[derive(Default)]
    struct TraceSink(Vec<String>);

    impl ParseSink for TraceSink {
        fn create_directory(&mut self, path: &Path) -> Result<(), nar::Error> {
            self.0.push(format!("dir {}", path.display()));
            Ok(())
        }
        fn create_regular(&mut self, path: &Path) -> Result<(), nar::Error> {
            self.0.push(format!("reg {}", path.display()));
            Ok(())
        }
        fn is_executable(&mut self) -> Result<(), nar::Error> {
            self.0.push("exe".into());
            Ok(())
        }
        fn preallocate(&mut self, size: u64) -> Result<(), nar::Error> {
            self.0.push(format!("alloc {size}"));
            Ok(())
        }
        fn receive(&mut self, data: &[u8]) -> Result<(), nar::Error> {
            self.0.push(format!("data {}", data.len()));
            Ok(())
        }
        fn close_regular(&mut self) -> Result<(), nar::Error> {
            self.0.push("close".into());
            Ok(())
        }
        fn create_symlink(&mut self, path: &Path, target: Vec<u8>) -> Result<(), nar::Error> {
            self.0.push(format!(
                "sym {} -> {}",
                path.display(),
                String::from_utf8_lossy(&target)
            ));
            Ok(())
        }
    }

    #[test]
    fn single_file_events() {
        let buf = tok_archive(&[
            b"nix-archive-1",
            b"(",
            b"type",
            b"regular",
            b"executable",
            b"",
            b"contents",
            b"hello\n",
            b")",
        ]);

        let mut sink = TraceSink::default();
        parse(&mut Cursor::new(&buf), &mut sink).unwrap();
        assert_eq!(sink.0, vec!["reg ", "exe", "alloc 6", "data 6", "close"]);
    }

    #[test]
    fn directory_events() {
        let buf = tok_archive(&[
            b"nix-archive-1",
            b"(",
            b"type",
            b"directory",
            b"entry",
            b"(",
            b"name",
            b"x",
            b"node",
            b"(",
            b"type",
            b"symlink",
            b"target",
            b"y",
            b")",
            b")",
            b")",
        ]);

        let mut sink = TraceSink::default();
        parse(&mut Cursor::new(&buf), &mut sink).unwrap();
        assert_eq!(sink.0, vec!["dir ", "sym x -> y"]);
    }

    #[test]
    fn rejects_wrong_magic() {
        let buf = tok_archive(&[b"nix-archive-2", b"(", b"type", b"regular"]);
        parse(&mut Cursor::new(&buf), &mut NullSink).unwrap_err();
    }

    #[test]
    fn rejects_unknown_type() {
        let buf = tok_archive(&[b"nix-archive-1", b"(", b"type", b"fifo", b")"]);
        parse(&mut Cursor::new(&buf), &mut NullSink).unwrap_err();
    }

    #[test]
    fn rejects_unsorted_entries() {
        let buf = tok_archive(&[
            b"nix-archive-1",
            b"(", b"type", b"directory",
            b"entry", b"(", b"name", b"b", b"node",
            b"(", b"type", b"symlink", b"target", b"t", b")", b")",
            b"entry", b"(", b"name", b"a", b"node",
            b"(", b"type", b"symlink", b"target", b"t", b")", b")",
            b")",
        ]);
        match parse(&mut Cursor::new(&buf), &mut NullSink) {
            Err(nar::Error::BadArchive(msg)) => assert!(msg.contains("sorted")),
            other => panic!("expected BadArchive, got {other:?}"),
        }
    }

    #[test]
    fn rejects_invalid_names() {
        for name in [&b""[..], b".", b"..", b"a/b", b"a\0b"] {
            let buf = tok_archive(&[
                b"nix-archive-1",
                b"(", b"type", b"directory",
                b"entry", b"(", b"name", name, b"node",
                b"(", b"type", b"symlink", b"target", b"t", b")", b")",
                b")",
            ]);
            parse(&mut Cursor::new(&buf), &mut NullSink).unwrap_err();
        }
    }

    #[test]
    fn case_hack_renames_collisions() {
        let buf = tok_archive(&[
            b"nix-archive-1",
            b"(", b"type", b"directory",
            b"entry", b"(", b"name", b"README", b"node",
            b"(", b"type", b"symlink", b"target", b"t", b")", b")",
            b"entry", b"(", b"name", b"readme", b"node",
            b"(", b"type", b"symlink", b"target", b"t", b")", b")",
            b")",
        ]);

        let mut sink = TraceSink::default();
        ParseOptions::default()
            .use_case_hack(true)
            .parse(&mut Cursor::new(&buf), &mut sink)
            .unwrap();
        assert_eq!(
            sink.0,
            vec!["dir ", "sym README -> t", "sym readme~nix~case~hack~1 -> t"]
        );
    }

    #[test]
    fn copy_is_identity_on_dump_output() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), "contents").unwrap();

        let mut original = vec![];
        nar::dump(dir.path(), &mut original).unwrap();

        let mut copied = vec![];
        copy_nar(&mut Cursor::new(&original), &mut copied).unwrap();
        assert_eq!(original, copied);
    }

    #[test]
    fn zero_byte_file_has_fixed_overhead() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), "").unwrap();

        let mut buf = vec![];
        nar::dump(&dir.path().join("f"), &mut buf).unwrap();
        // magic, "(", "type", "regular", "contents", "", ")" - each a
        // padded length-prefixed token, the empty contents just a length
        assert_eq!(buf.len(), 112);

        parse(&mut Cursor::new(&buf), &mut NullSink).unwrap();
    }

    #[test]
    fn one_byte_name_is_padded() {
        let buf = tok_archive(&[
            b"nix-archive-1",
            b"(", b"type", b"directory",
            b"entry", b"(", b"name", b"a", b"node",
            b"(", b"type", b"symlink", b"target", b"t", b")", b")",
            b")",
        ]);
        // the name token occupies 8 (length) + 8 (payload + padding)
        parse(&mut Cursor::new(&buf), &mut NullSink).unwrap();
    }
}
