//! Scanning artifact bytes for embedded store-path digests.
//!
//! A reference to another artifact can only appear as its 32-character
//! digest part, so scanning reduces to finding those digests as
//! contiguous substrings. The sinks here are [std::io::Write] adapters
//! so they can sit directly under the NAR serializer.

use std::collections::{BTreeSet, HashSet};
use std::io::{self, Write};

use nixwire::base32;
use nixwire::hash::{Algo, Hash, HashSink};

/// Length of a digest part, in characters.
pub const REF_LEN: usize = 32;

/// Streaming scanner: feed it the artifact's bytes, collect which of
/// the candidate digests occurred. Each candidate is reported at most
/// once.
pub struct RefScanSink {
    candidates: HashSet<[u8; REF_LEN]>,
    found: BTreeSet<[u8; REF_LEN]>,
    /// Last `< REF_LEN` bytes of the previous chunk; a reference may
    /// straddle the chunk boundary.
    tail: Vec<u8>,
}

impl RefScanSink {
    pub fn new(candidates: impl IntoIterator<Item = [u8; REF_LEN]>) -> Self {
        RefScanSink {
            candidates: candidates.into_iter().collect(),
            found: BTreeSet::new(),
            tail: Vec::with_capacity(REF_LEN),
        }
    }

    /// Digests seen so far, in sorted order.
    pub fn found(&self) -> &BTreeSet<[u8; REF_LEN]> {
        &self.found
    }

    pub fn into_found(self) -> BTreeSet<[u8; REF_LEN]> {
        self.found
    }

    fn search(&mut self, s: &[u8]) {
        let mut i = 0;
        while i + REF_LEN <= s.len() {
            // scan the window right-to-left so one foreign byte skips
            // the whole window
            let mut skip = 0;
            for j in (0..REF_LEN).rev() {
                if !base32::is_alphabet_byte(s[i + j]) {
                    skip = j + 1;
                    break;
                }
            }
            if skip != 0 {
                i += skip;
                continue;
            }

            let window: [u8; REF_LEN] = s[i..i + REF_LEN].try_into().expect("window length fixed");
            if self.candidates.remove(&window) {
                tracing::debug!(digest = %String::from_utf8_lossy(&window), offset = i, "found reference");
                self.found.insert(window);
            }
            i += 1;
        }
    }

    fn scan(&mut self, data: &[u8]) {
        // search the seam between the previous and the current chunk
        let boundary_len = data.len().min(REF_LEN);
        let mut seam = self.tail.clone();
        seam.extend_from_slice(&data[..boundary_len]);
        self.search(&seam);

        self.search(data);

        let keep = REF_LEN - boundary_len;
        if keep < self.tail.len() {
            let cut = self.tail.len() - keep;
            self.tail.drain(..cut);
        }
        self.tail.extend_from_slice(&data[data.len() - boundary_len..]);
    }
}

impl Write for RefScanSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.scan(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Replaces every occurrence of one fixed-length byte string while
/// streaming, recording the positions of the replacements.
pub struct RewritingSink<W: Write> {
    from: Vec<u8>,
    to: Vec<u8>,
    inner: W,
    /// Carry-over that may contain a partial match.
    prev: Vec<u8>,
    /// Bytes emitted so far.
    pos: u64,
    matches: Vec<u64>,
}

impl<W: Write> RewritingSink<W> {
    pub fn new(from: impl Into<Vec<u8>>, to: impl Into<Vec<u8>>, inner: W) -> Self {
        let from = from.into();
        let to = to.into();
        assert_eq!(from.len(), to.len(), "rewrites must preserve length");
        RewritingSink {
            from,
            to,
            inner,
            prev: Vec::new(),
            pos: 0,
            matches: Vec::new(),
        }
    }

    pub fn matches(&self) -> &[u64] {
        &self.matches
    }

    /// Total bytes accepted and forwarded once [flush_tail] ran.
    pub fn len(&self) -> u64 {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    /// Emit the held-back carry-over. Must be called once after the
    /// last write.
    pub fn flush_tail(&mut self) -> io::Result<()> {
        if !self.prev.is_empty() {
            self.pos += self.prev.len() as u64;
            self.inner.write_all(&self.prev)?;
            self.prev.clear();
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for RewritingSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut s = std::mem::take(&mut self.prev);
        s.extend_from_slice(buf);

        if !self.from.is_empty() {
            let mut i = 0;
            while i + self.from.len() <= s.len() {
                if s[i..i + self.from.len()] == self.from[..] {
                    self.matches.push(self.pos + i as u64);
                    s[i..i + self.from.len()].copy_from_slice(&self.to);
                    i += self.from.len();
                } else {
                    i += 1;
                }
            }
        }

        // hold back one potential partial match
        let keep = self.from.len().saturating_sub(1).min(s.len());
        let consumed = s.len() - keep;
        self.prev = s.split_off(consumed);
        if consumed > 0 {
            self.pos += consumed as u64;
            self.inner.write_all(&s)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Hash of a serialization with the artifact's own digest zeroed out,
/// making the result independent of the path's final location. The
/// replacement positions are mixed back in so that a serialization
/// that already contains zeros cannot collide with one that had
/// self-references.
pub struct HashModuloSink {
    rewriting: RewritingSink<HashSink<io::Sink>>,
}

impl HashModuloSink {
    pub fn new(algo: Algo, modulus: &str) -> Self {
        HashModuloSink {
            rewriting: RewritingSink::new(
                modulus.as_bytes().to_vec(),
                vec![0u8; modulus.len()],
                HashSink::sink(algo),
            ),
        }
    }

    pub fn finish(mut self) -> io::Result<(Hash, u64)> {
        self.rewriting.flush_tail()?;
        let len = self.rewriting.len();
        let matches = self.rewriting.matches().to_vec();
        let mut hash_sink = self.rewriting.into_inner();
        for pos in matches {
            hash_sink.write_all(format!("|{pos}").as_bytes())?;
        }
        let (hash, _) = hash_sink.finish();
        Ok((hash, len))
    }
}

impl Write for HashModuloSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.rewriting.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.rewriting.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use nixwire::hash::{hash_bytes, Algo};

    use super::{HashModuloSink, RefScanSink, RewritingSink, REF_LEN};

    fn digest(c: u8) -> [u8; REF_LEN] {
        [c; REF_LEN]
    }

    #[test]
    fn finds_candidate_exactly_once() {
        let candidate = *b"7f6g3kq2wvsdcbc2yyz4gx48ak44la01";
        let mut sink = RefScanSink::new([candidate]);

        let mut bytes = b"header ".to_vec();
        bytes.extend_from_slice(&candidate);
        bytes.extend_from_slice(b" trailer ");
        bytes.extend_from_slice(&candidate);

        sink.write_all(&bytes).unwrap();
        assert_eq!(sink.found().len(), 1);
        assert!(sink.found().contains(&candidate));
    }

    #[test]
    fn finds_across_chunk_boundary() {
        let candidate = digest(b'a');
        let mut sink = RefScanSink::new([candidate]);

        // split in the middle of the digest
        let mut bytes = b"xx".to_vec();
        bytes.extend_from_slice(&candidate);
        let (head, tail) = bytes.split_at(10);
        sink.write_all(head).unwrap();
        sink.write_all(tail).unwrap();

        assert!(sink.found().contains(&candidate));
    }

    #[test]
    fn one_byte_writes() {
        let candidate = digest(b'z');
        let mut sink = RefScanSink::new([candidate]);
        for b in candidate {
            sink.write_all(&[b]).unwrap();
        }
        assert!(sink.found().contains(&candidate));
    }

    #[test]
    fn rejects_non_alphabet_bytes() {
        // 'e' is not in the digest alphabet, so this window never matches
        let mut near_miss = digest(b'a');
        near_miss[13] = b'e';
        let mut sink = RefScanSink::new([digest(b'a')]);
        sink.write_all(&near_miss).unwrap();
        assert!(sink.found().is_empty());
    }

    #[test]
    fn reports_only_candidates() {
        let mut sink = RefScanSink::new([digest(b'a')]);
        sink.write_all(&digest(b'b')).unwrap();
        assert!(sink.found().is_empty());
    }

    #[test]
    fn rewriting_replaces_and_records() {
        let mut out = vec![];
        {
            let mut sink = RewritingSink::new(&b"needle"[..], &b"------"[..], &mut out);
            sink.write_all(b"one needle, two nee").unwrap();
            sink.write_all(b"dles").unwrap();
            sink.flush_tail().unwrap();
            assert_eq!(sink.matches(), &[4, 16]);
        }
        assert_eq!(out, b"one ------, two ------s");
    }

    #[test]
    fn hash_modulo_differs_from_plain_zeroes() {
        let modulus = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let data = format!("prefix {modulus} suffix");

        let mut sink = HashModuloSink::new(Algo::Sha256, modulus);
        sink.write_all(data.as_bytes()).unwrap();
        let (with_ref, len) = sink.finish().unwrap();
        assert_eq!(len, data.len() as u64);

        // the same bytes with the reference already zeroed hash
        // differently, because the match positions are mixed in
        let zeroed = data.replace(modulus, &"\0".repeat(32));
        let plain = hash_bytes(Algo::Sha256, zeroed.as_bytes());
        assert_ne!(with_ref, plain);

        // and two identical inputs agree
        let mut sink = HashModuloSink::new(Algo::Sha256, modulus);
        sink.write_all(data.as_bytes()).unwrap();
        let (again, _) = sink.finish().unwrap();
        assert_eq!(with_ref, again);
    }
}
