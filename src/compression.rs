use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::str::FromStr;
use zstd::stream::read::Decoder;
use zstd::stream::write::Encoder;

use crate::config::ConfigError;

/// Output compression codec.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    Zstd,
}

impl Compression {
    /// Canonical file extension including the leading dot; empty for `None`.
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Zstd => ".zst",
        }
    }

    pub fn compress(&self, file: File, buf_bytes: usize) -> io::Result<Sink> {
        let buffered = BufWriter::with_capacity(buf_bytes.max(8 * 1024), file);
        Ok(match self {
            Compression::None => Sink::Plain(buffered),
            Compression::Zstd => Sink::Zstd(Encoder::new(buffered, 3)?),
        })
    }

    pub fn decompress<'a, R: Read + 'a>(&self, input: R) -> io::Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Compression::None => Box::new(input),
            Compression::Zstd => {
                let mut decoder = Decoder::new(input)?;
                // Large frames otherwise fail with "Frame requires too much memory".
                decoder.window_log_max(31)?;
                Box::new(decoder)
            }
        })
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Compression::None => "none",
            Compression::Zstd => "zstd",
        })
    }
}

impl FromStr for Compression {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "identity" | "" => Ok(Compression::None),
            "zstd" | "zst" => Ok(Compression::Zstd),
            other => Err(ConfigError::UnknownCompression(other.to_string())),
        }
    }
}

/// Buffered, optionally compressed output file. Must be finished to be complete.
pub enum Sink {
    Plain(BufWriter<File>),
    Zstd(Encoder<'static, BufWriter<File>>),
}

impl Sink {
    /// Flush buffers, write the compression trailer, and sync to disk.
    pub fn finish(self) -> io::Result<()> {
        let mut inner = match self {
            Sink::Plain(w) => w,
            Sink::Zstd(enc) => enc.finish()?,
        };
        inner.flush()?;
        inner.get_ref().sync_all()
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Plain(w) => w.write(buf),
            Sink::Zstd(enc) => enc.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Zstd(enc) => enc.flush(),
        }
    }
}
