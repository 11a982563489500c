//! Tar-split indexing.
//!
//! Drivers that rebuild diffs from the filesystem cannot reproduce the
//! exact tar bytes a layer was registered with, so the diff id of an
//! exported layer would not match. While a layer is applied, the
//! [`Disassembler`] records everything in the stream except regular file
//! contents as an NDJSON index:
//!
//! - `{"type":1,"name":"etc/hosts","size":12,"position":N}`: file payload,
//!   read back from the layer's mounted contents.
//! - `{"type":2,"payload":"<base64>","position":N}`: raw bytes (headers,
//!   padding, extension records, end-of-archive trailer).
//!
//! The [`Assembler`] replays the index over a mounted layer and yields the
//! original stream byte for byte.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use strata_common::error::{Result, StrataError};
use strata_graphdriver::Driver;

use crate::metadata::TarSplitSink;

const BLOCK_SIZE: u64 = 512;
const FILE_ENTRY: u8 = 1;
const SEGMENT_ENTRY: u8 = 2;

/// One line of the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Entry {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    #[serde(default)]
    position: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Extension {
    LongName,
    Pax,
    Opaque,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header,
    Extension {
        kind: Extension,
        remaining: u64,
        padding: u64,
    },
    Content {
        remaining: u64,
        padding: u64,
    },
    Padding {
        remaining: u64,
    },
    Trailer,
}

/// Pass-through reader that indexes the tar stream flowing through it.
pub struct Disassembler<R> {
    inner: R,
    sink: Box<dyn TarSplitSink>,
    state: State,
    header: Vec<u8>,
    raw: Vec<u8>,
    extension: Vec<u8>,
    pending_name: Option<String>,
    position: u64,
}

impl<R: Read> Disassembler<R> {
    /// Wraps `inner`, writing the index to `sink`.
    pub fn new(inner: R, sink: Box<dyn TarSplitSink>) -> Self {
        Self {
            inner,
            sink,
            state: State::Header,
            header: Vec::with_capacity(BLOCK_SIZE as usize),
            raw: Vec::new(),
            extension: Vec::new(),
            pending_name: None,
            position: 0,
        }
    }

    /// Flushes the remaining raw bytes and closes the index.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream ended inside an entry or the index
    /// cannot be written.
    pub fn finish(mut self) -> Result<()> {
        if !matches!(self.state, State::Header | State::Trailer) || !self.header.is_empty() {
            return Err(StrataError::Config {
                message: "tar stream ended inside an entry".into(),
            });
        }
        self.flush_raw()
            .map_err(|e| StrataError::io("tar-split", e))?;
        self.sink.finish()
    }

    fn observe(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            match self.state {
                State::Header => {
                    let want = BLOCK_SIZE as usize - self.header.len();
                    let take = want.min(data.len());
                    self.header.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    if self.header.len() == BLOCK_SIZE as usize {
                        let block = std::mem::take(&mut self.header);
                        self.on_header(&block)?;
                        self.header = block;
                        self.header.clear();
                    }
                }
                State::Extension {
                    kind,
                    remaining,
                    padding,
                } => {
                    let take = chunk(remaining, data.len());
                    self.raw.extend_from_slice(&data[..take]);
                    self.extension.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    let remaining = remaining - take as u64;
                    if remaining == 0 {
                        self.on_extension(kind);
                        self.state = after_payload(padding);
                    } else {
                        self.state = State::Extension {
                            kind,
                            remaining,
                            padding,
                        };
                    }
                }
                State::Content { remaining, padding } => {
                    let take = chunk(remaining, data.len());
                    data = &data[take..];
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        after_payload(padding)
                    } else {
                        State::Content { remaining, padding }
                    };
                }
                State::Padding { remaining } => {
                    let take = chunk(remaining, data.len());
                    self.raw.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    self.state = after_payload(remaining - take as u64);
                }
                State::Trailer => {
                    self.raw.extend_from_slice(data);
                    data = &[];
                }
            }
        }
        Ok(())
    }

    fn on_header(&mut self, block: &[u8]) -> io::Result<()> {
        self.raw.extend_from_slice(block);
        if block.iter().all(|b| *b == 0) {
            self.state = State::Trailer;
            return Ok(());
        }

        let header = tar::Header::from_byte_slice(block);
        let size = header.entry_size()?;
        let padding = (BLOCK_SIZE - size % BLOCK_SIZE) % BLOCK_SIZE;
        let entry_type = header.entry_type();

        let extension = match entry_type {
            tar::EntryType::GNULongName => Some(Extension::LongName),
            tar::EntryType::XHeader => Some(Extension::Pax),
            tar::EntryType::GNULongLink | tar::EntryType::XGlobalHeader => {
                Some(Extension::Opaque)
            }
            _ => None,
        };
        if let Some(kind) = extension {
            self.extension.clear();
            self.state = State::Extension {
                kind,
                remaining: size,
                padding,
            };
            if size == 0 {
                self.on_extension(kind);
                self.state = State::Header;
            }
            return Ok(());
        }

        let name = self
            .pending_name
            .take()
            .unwrap_or_else(|| String::from_utf8_lossy(&header.path_bytes()).into_owned());
        let indexed = matches!(
            entry_type,
            tar::EntryType::Regular | tar::EntryType::Continuous
        );
        self.flush_raw()?;
        self.emit(Entry {
            kind: FILE_ENTRY,
            name: Some(name),
            size: Some(if indexed { size } else { 0 }),
            payload: None,
            position: self.position,
        })?;

        self.state = if size == 0 {
            State::Header
        } else if indexed {
            State::Content {
                remaining: size,
                padding,
            }
        } else {
            self.extension.clear();
            State::Extension {
                kind: Extension::Opaque,
                remaining: size,
                padding,
            }
        };
        Ok(())
    }

    fn on_extension(&mut self, kind: Extension) {
        match kind {
            Extension::LongName => {
                let end = self
                    .extension
                    .iter()
                    .position(|b| *b == 0)
                    .unwrap_or(self.extension.len());
                self.pending_name = Some(String::from_utf8_lossy(&self.extension[..end]).into_owned());
            }
            Extension::Pax => {
                if let Some(path) = pax_path(&self.extension) {
                    self.pending_name = Some(path);
                }
            }
            Extension::Opaque => {}
        }
    }

    fn flush_raw(&mut self) -> io::Result<()> {
        if self.raw.is_empty() {
            return Ok(());
        }
        let payload = BASE64_STANDARD.encode(&self.raw);
        self.raw.clear();
        self.emit(Entry {
            kind: SEGMENT_ENTRY,
            name: None,
            size: None,
            payload: Some(payload),
            position: self.position,
        })
    }

    fn emit(&mut self, entry: Entry) -> io::Result<()> {
        serde_json::to_writer(&mut self.sink, &entry).map_err(io::Error::other)?;
        self.sink.write_all(b"\n")?;
        self.position += 1;
        Ok(())
    }
}

impl<R: Read> Read for Disassembler<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.observe(&buf[..n])?;
        Ok(n)
    }
}

fn chunk(remaining: u64, available: usize) -> usize {
    usize::try_from(remaining).map_or(available, |r| r.min(available))
}

const fn after_payload(padding: u64) -> State {
    if padding == 0 {
        State::Header
    } else {
        State::Padding { remaining: padding }
    }
}

/// Extracts the `path` record from a PAX extended header.
fn pax_path(data: &[u8]) -> Option<String> {
    let mut rest = data;
    let mut path = None;
    while !rest.is_empty() {
        let space = rest.iter().position(|b| *b == b' ')?;
        let len: usize = std::str::from_utf8(&rest[..space]).ok()?.parse().ok()?;
        if len <= space || len > rest.len() {
            return path;
        }
        let record = &rest[space + 1..len];
        let record = record.strip_suffix(b"\n").unwrap_or(record);
        if let Some(value) = record.strip_prefix(b"path=") {
            path = Some(String::from_utf8_lossy(value).into_owned());
        }
        rest = &rest[len..];
    }
    path
}

enum Chunk {
    Bytes(Cursor<Vec<u8>>),
    File {
        file: io::Take<File>,
        remaining: u64,
        name: String,
    },
}

/// Rebuilds a layer's original tar stream from its index.
///
/// The layer stays mounted (`Driver::get`) until the assembler is dropped.
pub struct Assembler {
    index: Box<dyn BufRead + Send>,
    root: PathBuf,
    driver: Arc<dyn Driver>,
    cache_id: String,
    current: Option<Chunk>,
    line: String,
}

impl Assembler {
    /// Mounts `cache_id` and prepares to replay `index` over it.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer cannot be mounted.
    pub fn new(
        driver: Arc<dyn Driver>,
        cache_id: &str,
        index: Box<dyn Read + Send>,
    ) -> Result<Self> {
        let root = driver
            .get(cache_id, "")
            .map_err(|e| StrataError::backend("driver get", e))?;
        Ok(Self {
            index: Box::new(BufReader::new(index)),
            root,
            driver,
            cache_id: cache_id.to_string(),
            current: None,
            line: String::new(),
        })
    }

    /// Loads the next chunk. Returns `false` at the end of the index.
    fn advance(&mut self) -> io::Result<bool> {
        self.line.clear();
        if self.index.read_line(&mut self.line)? == 0 {
            return Ok(false);
        }
        if self.line.trim().is_empty() {
            return Ok(true);
        }
        let entry: Entry = serde_json::from_str(&self.line).map_err(invalid)?;
        self.current = match entry.kind {
            SEGMENT_ENTRY => {
                let payload = entry.payload.unwrap_or_default();
                let bytes = BASE64_STANDARD.decode(payload).map_err(invalid)?;
                Some(Chunk::Bytes(Cursor::new(bytes)))
            }
            FILE_ENTRY => match (entry.name, entry.size.unwrap_or(0)) {
                (_, 0) => None,
                (Some(name), size) => {
                    let path = self.resolve(&name)?;
                    let file = File::open(&path)?;
                    Some(Chunk::File {
                        file: file.take(size),
                        remaining: size,
                        name,
                    })
                }
                (None, _) => return Err(invalid("file entry without a name")),
            },
            other => return Err(invalid(format!("unknown tar-split entry type {other}"))),
        };
        Ok(true)
    }

    fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        let relative = Path::new(name.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(invalid(format!("tar-split entry escapes layer: {name}")));
        }
        Ok(self.root.join(relative))
    }
}

impl Read for Assembler {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match &mut self.current {
                Some(Chunk::Bytes(cursor)) => {
                    let n = cursor.read(buf)?;
                    if n > 0 {
                        return Ok(n);
                    }
                }
                Some(Chunk::File {
                    file,
                    remaining,
                    name,
                }) => {
                    let n = file.read(buf)?;
                    if n > 0 {
                        *remaining -= n as u64;
                        return Ok(n);
                    }
                    if *remaining > 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("{name} is shorter than its recorded size"),
                        ));
                    }
                }
                None => {}
            }
            self.current = None;
            if !self.advance()? {
                return Ok(0);
            }
        }
    }
}

impl Drop for Assembler {
    fn drop(&mut self) {
        if let Err(e) = self.driver.put(&self.cache_id) {
            tracing::warn!(cache_id = %self.cache_id, error = %e, "failed to unmount layer after assembly");
        }
    }
}

fn invalid(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
