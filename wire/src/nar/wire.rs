//! NAR framing: every token is a length-prefixed byte string.
//!
//! Lengths are 64-bit little-endian; payloads are padded with zero
//! bytes to the next 8-byte boundary. The zero-length string is thus
//! eight zero bytes of length and nothing else.

use std::io::{self, Read, Write};

use super::Error;

pub const MAGIC: &str = "nix-archive-1";

// Standard Linux limits; also bound allocations while parsing.
pub const MAX_NAME_LEN: u64 = 255;
pub const MAX_TARGET_LEN: u64 = 4095;

/// Upper bound for syntactic tokens ("type", "entry", ...).
pub(crate) const MAX_TOKEN_LEN: u64 = 32;

pub fn write_bytes<W: Write>(w: &mut W, data: &[u8]) -> io::Result<()> {
    w.write_all(&(data.len() as u64).to_le_bytes())?;
    w.write_all(data)?;
    write_padding(w, data.len() as u64)
}

pub fn write_token<W: Write>(w: &mut W, token: &str) -> io::Result<()> {
    write_bytes(w, token.as_bytes())
}

pub(crate) fn write_padding<W: Write>(w: &mut W, len: u64) -> io::Result<()> {
    match (len & 7) as usize {
        0 => Ok(()),
        n => w.write_all(&[0u8; 8][n..]),
    }
}

pub fn read_u64<R: Read>(r: &mut R) -> Result<u64, Error> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Read one length-prefixed byte string of at most `max_len` bytes,
/// verifying that the padding is zero.
pub fn read_bytes<R: Read>(r: &mut R, max_len: u64) -> Result<Vec<u8>, Error> {
    let len = read_u64(r)?;
    if len > max_len {
        return Err(Error::bad(format!(
            "token of {len} bytes exceeds limit of {max_len}"
        )));
    }

    let padded = (len + 7) & !7;
    let mut buf = vec![0u8; padded as usize];
    r.read_exact(&mut buf)?;

    for b in buf.drain(len as usize..) {
        if b != 0 {
            return Err(Error::bad("non-zero padding"));
        }
    }

    Ok(buf)
}

/// Read a syntactic token, which must be valid UTF-8.
pub fn read_token<R: Read>(r: &mut R) -> Result<String, Error> {
    let bytes = read_bytes(r, MAX_TOKEN_LEN)?;
    String::from_utf8(bytes).map_err(|_| Error::bad("token is not UTF-8"))
}

/// Read a token and fail unless it matches `expected`.
pub fn expect_token<R: Read>(r: &mut R, expected: &str) -> Result<(), Error> {
    let tok = read_token(r)?;
    if tok != expected {
        return Err(Error::bad(format!("expected {expected:?}, got {tok:?}")));
    }
    Ok(())
}

/// Verify that the padding after `len` content bytes is zero.
pub fn read_padding<R: Read>(r: &mut R, len: u64) -> Result<(), Error> {
    match (len & 7) as usize {
        0 => Ok(()),
        n => {
            let mut buf = [0u8; 8];
            r.read_exact(&mut buf[n..])?;
            if buf[n..].iter().any(|b| *b != 0) {
                return Err(Error::bad("non-zero padding"));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    #[test]
    fn bytes_roundtrip() {
        let mut buf = vec![];
        super::write_bytes(&mut buf, b"type").unwrap();
        // 8 bytes length + 4 bytes payload + 4 bytes padding
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[..12], b"\x04\0\0\0\0\0\0\0type");

        let out = super::read_bytes(&mut Cursor::new(&buf), 32).unwrap();
        assert_eq!(out, b"type");
    }

    #[test]
    fn empty_string_is_just_a_length() {
        let mut buf = vec![];
        super::write_bytes(&mut buf, b"").unwrap();
        assert_eq!(buf, vec![0u8; 8]);
    }

    #[test]
    fn rejects_dirty_padding() {
        let mut buf = vec![];
        super::write_bytes(&mut buf, b"x").unwrap();
        buf[10] = 1;
        super::read_bytes(&mut Cursor::new(&buf), 32).unwrap_err();
    }

    #[test]
    fn rejects_oversized() {
        let mut buf = vec![];
        super::write_bytes(&mut buf, b"0123456789").unwrap();
        super::read_bytes(&mut Cursor::new(&buf), 4).unwrap_err();
    }
}
