//! Byte and string helpers for the wire codec.
use bytes::{Buf, BufMut, Bytes};
use std::str::Utf8Error;

use crate::protocol::ProtocolError;

/// A str slice backed by shared [`Bytes`].
///
/// Parameter statuses, notification payloads and connection options are
/// sliced out of a larger buffer; `ByteStr` keeps those slices cheap to
/// clone and hand around without reallocating into `String`.
#[derive(Clone, Default)]
pub struct ByteStr {
    bytes: Bytes,
}

impl ByteStr {
    /// Validate `bytes` as UTF-8 and wrap it.
    pub fn from_utf8(bytes: Bytes) -> Result<Self, Utf8Error> {
        std::str::from_utf8(&bytes)?;
        Ok(Self { bytes })
    }

    /// Copy a str slice into a freshly allocated `ByteStr`.
    pub fn copy_from_str(string: &str) -> Self {
        Self { bytes: Bytes::copy_from_slice(string.as_bytes()) }
    }

    /// Wrap a static str without copying.
    pub const fn from_static(string: &'static str) -> Self {
        Self { bytes: Bytes::from_static(string.as_bytes()) }
    }

    /// Reslice to `subset` without copying.
    ///
    /// # Panics
    ///
    /// Panics when `subset` is not a sub-slice of `self`.
    pub fn slice_ref(&self, subset: &str) -> Self {
        Self { bytes: self.bytes.slice_ref(subset.as_bytes()) }
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: UTF-8 is validated on construction and never mutated
        unsafe { std::str::from_utf8_unchecked(&self.bytes) }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::ops::Deref for ByteStr {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl From<String> for ByteStr {
    fn from(value: String) -> Self {
        Self { bytes: Bytes::from(value.into_bytes()) }
    }
}

impl From<&'static str> for ByteStr {
    fn from(value: &'static str) -> Self {
        Self::from_static(value)
    }
}

impl PartialEq for ByteStr {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl PartialEq<&str> for ByteStr {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl PartialEq<str> for ByteStr {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl std::fmt::Display for ByteStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for ByteStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self.as_str(), f)
    }
}

/// Wire length of `s` encoded as a nul terminated protocol String.
pub(crate) fn nul_str_len(s: &str) -> usize {
    s.len() + 1
}

/// Writer-side protocol primitives.
pub(crate) trait BufMutExt {
    /// Append `s` with its nul terminator.
    fn put_nul_str(&mut self, s: &str);
}

impl<B: BufMut> BufMutExt for B {
    fn put_nul_str(&mut self, s: &str) {
        self.put_slice(s.as_bytes());
        self.put_u8(0);
    }
}

/// Reader-side protocol primitives.
pub(crate) trait BytesExt: Sized {
    /// split off bytes up to (not including) the next nul, consuming it
    fn get_nul_bytes(&mut self, msg: &'static str) -> Result<Self, ProtocolError>;

    fn get_nul_bytestr(&mut self, msg: &'static str) -> Result<ByteStr, ProtocolError>;
}

impl BytesExt for Bytes {
    fn get_nul_bytes(&mut self, msg: &'static str) -> Result<Self, ProtocolError> {
        let Some(end) = memchr::memchr(b'\0', self) else {
            return Err(ProtocolError::missing_nul(msg));
        };
        let me = self.split_to(end);
        self.advance(1); // nul
        Ok(me)
    }

    fn get_nul_bytestr(&mut self, msg: &'static str) -> Result<ByteStr, ProtocolError> {
        ByteStr::from_utf8(self.get_nul_bytes(msg)?).map_err(|_| ProtocolError::non_utf8(msg))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nul_bytes() {
        let mut b = Bytes::from_static(b"abc\0rest");
        let s = b.get_nul_bytes("field").unwrap();
        assert_eq!(&s[..], b"abc");
        // what remains is not terminated
        assert!(b.get_nul_bytes("field").is_err());
    }

    #[test]
    fn bytestr_reslice() {
        let url = ByteStr::from_static("postgres://u@h/db");
        let user = url.slice_ref(&url.as_str()[11..12]);
        assert_eq!(user, "u");
    }

    #[test]
    fn put_and_measure() {
        let mut buf = bytes::BytesMut::new();
        buf.put_nul_str("ok");
        assert_eq!(&buf[..], b"ok\0");
        assert_eq!(nul_str_len("ok"), buf.len());
    }
}
