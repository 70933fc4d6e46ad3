use anyhow::{Context as _, Result, bail};
use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom, Write};
use tracing::instrument;

pub trait Readable {
    fn de<S: Read>(stream: &mut S) -> Result<Self>
    where
        Self: Sized;
    fn de_vec<S: Read>(len: usize, stream: &mut S) -> Result<Vec<Self>>
    where
        Self: Sized,
    {
        read_array(len, stream, Self::de)
    }
}
pub trait Writeable {
    fn ser<S: Write>(&self, stream: &mut S) -> Result<()>;
    fn ser_array<S: Write, T: AsRef<[Self]>>(this: T, stream: &mut S) -> Result<()>
    where
        Self: Sized,
    {
        for i in this.as_ref() {
            Self::ser(i, stream)?;
        }
        Ok(())
    }
}
/// Readable whose element count is stored elsewhere, usually in the summary.
pub trait ReadableCtx<C> {
    fn de<S: Read>(stream: &mut S, ctx: C) -> Result<Self>
    where
        Self: Sized;
}

impl<T> ReadExt for T where T: Read {}
pub trait ReadExt: Read {
    #[instrument(skip_all)]
    fn de<T: Readable>(&mut self) -> Result<T>
    where
        Self: Sized,
    {
        T::de(self)
    }
    #[instrument(skip_all)]
    fn de_ctx<T: ReadableCtx<C>, C>(&mut self, ctx: C) -> Result<T>
    where
        Self: Sized,
    {
        T::de(self, ctx)
    }
}
impl<T> WriteExt for T where T: Write {}
pub trait WriteExt: Write {
    #[instrument(skip_all)]
    fn ser<T: Writeable>(&mut self, value: &T) -> Result<()>
    where
        Self: Sized,
    {
        value.ser(self)
    }
    /// Writes the elements of a table whose count lives in the summary.
    #[instrument(skip_all)]
    fn ser_no_length<T: Writeable, S: AsRef<[T]>>(&mut self, value: &S) -> Result<()>
    where
        Self: Sized,
    {
        T::ser_array(value.as_ref(), self)
    }
}

impl Readable for String {
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        read_string_data(s.de()?, s)
    }
}
impl Writeable for String {
    fn ser<S: Write>(&self, stream: &mut S) -> Result<()> {
        write_string(stream, self)
    }
}
impl Writeable for &str {
    fn ser<S: Write>(&self, stream: &mut S) -> Result<()> {
        write_string(stream, self)
    }
}

impl<T: Readable> Readable for Vec<T> {
    fn de<S: Read>(stream: &mut S) -> Result<Self> {
        T::de_vec(stream.read_u32::<LE>()? as usize, stream)
    }
}
impl<T: Readable> ReadableCtx<usize> for Vec<T> {
    fn de<S: Read>(stream: &mut S, ctx: usize) -> Result<Self> {
        T::de_vec(ctx, stream)
    }
}
impl<T: Writeable> Writeable for Vec<T> {
    fn ser<S: Write>(&self, stream: &mut S) -> Result<()> {
        stream.write_u32::<LE>(self.len() as u32)?;
        T::ser_array(self, stream)
    }
}

impl Readable for bool {
    fn de<S: Read>(stream: &mut S) -> Result<Self> {
        Ok(stream.read_u32::<LE>()? != 0)
    }
}
impl Writeable for bool {
    fn ser<S: Write>(&self, stream: &mut S) -> Result<()> {
        Ok(stream.write_u32::<LE>(if *self { 1 } else { 0 })?)
    }
}
impl Readable for u8 {
    fn de<S: Read>(stream: &mut S) -> Result<Self> {
        Ok(stream.read_u8()?)
    }
    fn de_vec<S: Read>(len: usize, stream: &mut S) -> Result<Vec<Self>> {
        let mut buf = vec![0; len];
        stream.read_exact(&mut buf)?;
        Ok(buf)
    }
}
impl Writeable for u8 {
    fn ser<S: Write>(&self, stream: &mut S) -> Result<()> {
        Ok(stream.write_u8(*self)?)
    }
    fn ser_array<S: Write, T: AsRef<[Self]>>(this: T, stream: &mut S) -> Result<()> {
        Ok(stream.write_all(this.as_ref())?)
    }
}

macro_rules! impl_le_primitive {
    ($($ty:ty => $read:ident, $write:ident;)*) => {
        $(
            impl Readable for $ty {
                fn de<S: Read>(stream: &mut S) -> Result<Self> {
                    Ok(stream.$read::<LE>()?)
                }
            }
            impl Writeable for $ty {
                fn ser<S: Write>(&self, stream: &mut S) -> Result<()> {
                    Ok(stream.$write::<LE>(*self)?)
                }
            }
        )*
    };
}
impl_le_primitive! {
    u16 => read_u16, write_u16;
    u32 => read_u32, write_u32;
    i32 => read_i32, write_i32;
    i64 => read_i64, write_i64;
}

#[instrument(skip_all)]
pub fn read_array<S: Read, T, F>(len: usize, stream: &mut S, mut f: F) -> Result<Vec<T>>
where
    F: FnMut(&mut S) -> Result<T>,
{
    let mut array = Vec::with_capacity(len);
    for _ in 0..len {
        array.push(f(stream)?);
    }
    Ok(array)
}

#[instrument(skip_all)]
pub fn read_string_data<S: Read>(len: i32, stream: &mut S) -> Result<String> {
    if len < 0 {
        let chars = read_array((-len) as usize, stream, |r| Ok(r.read_u16::<LE>()?))?;
        let length = chars.iter().position(|&c| c == 0).unwrap_or(chars.len());
        String::from_utf16(&chars[..length]).context("invalid UTF-16 string data")
    } else {
        let mut chars = vec![0; len as usize];
        stream.read_exact(&mut chars)?;
        let length = chars.iter().position(|&c| c == 0).unwrap_or(chars.len());
        Ok(String::from_utf8_lossy(&chars[..length]).into_owned())
    }
}

pub fn write_string<S: Write>(stream: &mut S, value: &str) -> Result<()> {
    if value.is_empty() {
        stream.write_u32::<LE>(0)?;
    } else if value.is_ascii() {
        stream.write_u32::<LE>(value.len() as u32 + 1)?;
        stream.write_all(value.as_bytes())?;
        stream.write_u8(0)?;
    } else {
        let chars: Vec<u16> = value.encode_utf16().collect();
        stream.write_i32::<LE>(-(chars.len() as i32 + 1))?;
        for c in chars {
            stream.write_u16::<LE>(c)?;
        }
        stream.write_u16::<LE>(0)?;
    }
    Ok(())
}

/// Stream position reserved for a value that is only known after later data has been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchToken {
    offset: u64,
    size: u64,
}
impl PatchToken {
    pub fn offset(&self) -> u64 {
        self.offset
    }
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Seekable writer that hands out [`PatchToken`]s for placeholder regions and fills them in later
/// without disturbing the append position.
pub struct PatchWriter<W: Write + Seek> {
    inner: W,
}
impl<W: Write + Seek> PatchWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
    pub fn tell(&mut self) -> Result<u64> {
        Ok(self.inner.stream_position()?)
    }
    /// Writes `size` zero bytes at the current position and returns a token for them.
    pub fn reserve(&mut self, size: u64) -> Result<PatchToken> {
        let offset = self.tell()?;
        std::io::copy(&mut std::io::repeat(0).take(size), &mut self.inner)?;
        Ok(PatchToken { offset, size })
    }
    /// Reserves exactly as many bytes as `value` serializes to. The value is a placeholder and is
    /// overwritten by a later [`Self::patch_with`].
    pub fn reserve_for<T: Writeable>(&mut self, value: &T) -> Result<PatchToken> {
        let offset = self.tell()?;
        self.inner.ser(value)?;
        let size = self.tell()? - offset;
        Ok(PatchToken { offset, size })
    }
    /// Overwrites the reserved region with `bytes`, which must be exactly the reserved size.
    pub fn patch(&mut self, token: PatchToken, bytes: &[u8]) -> Result<()> {
        if bytes.len() as u64 != token.size {
            bail!("patch size mismatch at offset {}: reserved {} bytes, got {}", token.offset, token.size, bytes.len());
        }
        let end = self.tell()?;
        self.inner.seek(SeekFrom::Start(token.offset))?;
        self.inner.write_all(bytes)?;
        self.inner.seek(SeekFrom::Start(end))?;
        Ok(())
    }
    pub fn patch_with<F>(&mut self, token: PatchToken, f: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<u8>) -> Result<()>,
    {
        let mut buf = Vec::with_capacity(token.size as usize);
        f(&mut buf)?;
        self.patch(token, &buf)
    }
    pub fn into_inner(self) -> W {
        self.inner
    }
}
impl<W: Write + Seek> Write for PatchWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_string_encoding() -> Result<()> {
        let mut cur = Cursor::new(vec![]);
        cur.ser(&"")?;
        cur.ser(&"abc".to_string())?;
        cur.ser(&"d\u{e9}j\u{e0}".to_string())?;
        let buf = cur.get_ref();
        assert_eq!(&buf[..4], &[0, 0, 0, 0]);
        assert_eq!(&buf[4..12], &[4, 0, 0, 0, b'a', b'b', b'c', 0]);
        assert_eq!(i32::from_le_bytes(buf[12..16].try_into()?), -5);

        cur.set_position(0);
        assert_eq!(cur.de::<String>()?, "");
        assert_eq!(cur.de::<String>()?, "abc");
        assert_eq!(cur.de::<String>()?, "d\u{e9}j\u{e0}");
        Ok(())
    }

    #[test]
    fn test_patch_writer() -> Result<()> {
        let mut w = PatchWriter::new(Cursor::new(vec![]));
        w.ser(&1u32)?;
        let token = w.reserve_for(&0i64)?;
        w.ser(&3u32)?;
        assert_eq!(token.offset(), 4);
        assert_eq!(token.size(), 8);

        w.patch_with(token, |b| b.ser(&0x0102_0304_0506_0708i64))?;
        assert_eq!(w.tell()?, 16);
        w.ser(&4u32)?;

        let mut cur = Cursor::new(w.into_inner().into_inner());
        assert_eq!(cur.de::<u32>()?, 1);
        assert_eq!(cur.de::<i64>()?, 0x0102_0304_0506_0708);
        assert_eq!(cur.de::<u32>()?, 3);
        assert_eq!(cur.de::<u32>()?, 4);
        Ok(())
    }

    #[test]
    fn test_patch_size_mismatch() -> Result<()> {
        let mut w = PatchWriter::new(Cursor::new(vec![]));
        let token = w.reserve(4)?;
        assert!(w.patch(token, &[0; 8]).is_err());
        Ok(())
    }
}
