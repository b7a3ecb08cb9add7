//! Structural checks for untrusted v1 payloads.
//!
//! Yrs sizes its collections from the counts a payload declares before it
//! reads a single element. These walkers follow the same layout and reject a
//! payload as soon as a declared count cannot fit in the bytes that follow,
//! so nothing reaches the Yrs decoders that would make them over-allocate.
//!
//! ```text
//! update       = [clients] { [blocks] [client] [clock] block* }* delete_set
//! delete_set   = [clients] { [client] [ranges] { [clock] [len] }* }*
//! state_vector = [entries] { [client] [clock] }*
//! ```

use thiserror::Error;
use yrs::encoding::read::{self, Cursor, Read};

const BLOCK_GC: u8 = 0;
const BLOCK_SKIP: u8 = 10;

const HAS_ORIGIN: u8 = 0b1000_0000;
const HAS_RIGHT_ORIGIN: u8 = 0b0100_0000;
const HAS_PARENT_SUB: u8 = 0b0010_0000;
const CONTENT_MASK: u8 = 0b0001_1111;

const CONTENT_DELETED: u8 = 1;
const CONTENT_JSON: u8 = 2;
const CONTENT_BINARY: u8 = 3;
const CONTENT_STRING: u8 = 4;
const CONTENT_EMBED: u8 = 5;
const CONTENT_FORMAT: u8 = 6;
const CONTENT_TYPE: u8 = 7;
const CONTENT_ANY: u8 = 8;
const CONTENT_DOC: u8 = 9;

const TYPE_ARRAY: u64 = 0;
const TYPE_MAP: u64 = 1;
const TYPE_TEXT: u64 = 2;
const TYPE_XML_ELEMENT: u64 = 3;
const TYPE_XML_FRAGMENT: u64 = 4;
const TYPE_XML_HOOK: u64 = 5;
const TYPE_XML_TEXT: u64 = 6;

const MAX_ANY_DEPTH: usize = 64;
const MAX_VARINT_BYTES: usize = 10;

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("{what} count {count} cannot fit in the {remaining} bytes left")]
    Count {
        what: &'static str,
        count: u64,
        remaining: usize,
    },
    #[error("unsupported {what} tag {tag}")]
    UnknownTag { what: &'static str, tag: u64 },
    #[error("values nested deeper than 64 levels")]
    TooDeep,
    #[error("varint longer than 10 bytes")]
    VarIntTooLong,
    #[error("{0}")]
    Read(String),
}

impl From<read::Error> for PreflightError {
    fn from(e: read::Error) -> Self {
        PreflightError::Read(e.to_string())
    }
}

/// Check an encoded state vector.
pub fn check_state_vector(bytes: &[u8]) -> Result<(), PreflightError> {
    let mut walker = Walker::new(bytes);
    let entries = walker.count("state vector entry", 2)?;
    for _ in 0..entries {
        walker.var()?;
        walker.var()?;
    }
    Ok(())
}

/// Check a v1 update: every block list and the delete set.
pub fn check_update(bytes: &[u8]) -> Result<(), PreflightError> {
    let mut walker = Walker::new(bytes);
    let clients = walker.count("client", 3)?;
    for _ in 0..clients {
        let blocks = walker.count("block", 2)?;
        walker.var()?; // client
        walker.var()?; // clock
        for _ in 0..blocks {
            walker.block()?;
        }
    }
    walker.delete_set()
}

struct Walker<'a> {
    cursor: Cursor<'a>,
    len: usize,
}

impl<'a> Walker<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(bytes),
            len: bytes.len(),
        }
    }

    fn remaining(&self) -> usize {
        self.len.saturating_sub(self.cursor.next)
    }

    fn var(&mut self) -> Result<u64, PreflightError> {
        Ok(self.cursor.read_var::<u64>()?)
    }

    fn byte(&mut self) -> Result<u8, PreflightError> {
        Ok(self.cursor.read_u8()?)
    }

    /// Read a count whose elements each take at least `min_bytes`.
    fn count(&mut self, what: &'static str, min_bytes: u64) -> Result<u64, PreflightError> {
        let count = self.var()?;
        let remaining = self.remaining();
        if count.saturating_mul(min_bytes) > remaining as u64 {
            return Err(PreflightError::Count {
                what,
                count,
                remaining,
            });
        }
        Ok(count)
    }

    fn string(&mut self) -> Result<(), PreflightError> {
        self.cursor.read_string()?;
        Ok(())
    }

    fn buf(&mut self) -> Result<(), PreflightError> {
        self.cursor.read_buf()?;
        Ok(())
    }

    fn skip(&mut self, len: usize) -> Result<(), PreflightError> {
        self.cursor.read_exact(len)?;
        Ok(())
    }

    fn id(&mut self) -> Result<(), PreflightError> {
        self.var()?;
        self.var()?;
        Ok(())
    }

    fn signed_var(&mut self) -> Result<(), PreflightError> {
        for _ in 0..MAX_VARINT_BYTES {
            if self.byte()? & 0x80 == 0 {
                return Ok(());
            }
        }
        Err(PreflightError::VarIntTooLong)
    }

    fn block(&mut self) -> Result<(), PreflightError> {
        let info = self.byte()?;
        if info == BLOCK_GC || info == BLOCK_SKIP {
            self.var()?;
            return Ok(());
        }

        if info & HAS_ORIGIN != 0 {
            self.id()?;
        }
        if info & HAS_RIGHT_ORIGIN != 0 {
            self.id()?;
        }
        // Parent info is only written when neither origin is
        if info & (HAS_ORIGIN | HAS_RIGHT_ORIGIN) == 0 {
            if self.var()? == 1 {
                self.string()?;
            } else {
                self.id()?;
            }
            if info & HAS_PARENT_SUB != 0 {
                self.string()?;
            }
        }
        self.content(info & CONTENT_MASK)
    }

    fn content(&mut self, tag: u8) -> Result<(), PreflightError> {
        match tag {
            CONTENT_DELETED => {
                self.var()?;
            }
            CONTENT_JSON => {
                let values = self.count("json value", 1)?;
                for _ in 0..values {
                    self.string()?;
                }
            }
            CONTENT_BINARY => self.buf()?,
            CONTENT_STRING | CONTENT_EMBED => self.string()?,
            CONTENT_FORMAT => {
                self.string()?;
                self.string()?;
            }
            CONTENT_TYPE => match self.var()? {
                TYPE_ARRAY | TYPE_MAP | TYPE_TEXT | TYPE_XML_FRAGMENT | TYPE_XML_TEXT => {}
                TYPE_XML_ELEMENT | TYPE_XML_HOOK => self.string()?,
                tag => return Err(PreflightError::UnknownTag { what: "type", tag }),
            },
            CONTENT_ANY => {
                let values = self.count("any value", 1)?;
                for _ in 0..values {
                    self.any(0)?;
                }
            }
            CONTENT_DOC => {
                self.string()?;
                self.any(0)?;
            }
            tag => {
                return Err(PreflightError::UnknownTag {
                    what: "content",
                    tag: tag.into(),
                })
            }
        }
        Ok(())
    }

    fn any(&mut self, depth: usize) -> Result<(), PreflightError> {
        if depth > MAX_ANY_DEPTH {
            return Err(PreflightError::TooDeep);
        }
        match self.byte()? {
            // undefined, null, false, true
            127 | 126 | 121 | 120 => {}
            125 => self.signed_var()?,
            124 => self.skip(4)?,
            123 | 122 => self.skip(8)?,
            119 => self.string()?,
            118 => {
                let fields = self.count("map field", 2)?;
                for _ in 0..fields {
                    self.string()?;
                    self.any(depth + 1)?;
                }
            }
            117 => {
                let items = self.count("array item", 1)?;
                for _ in 0..items {
                    self.any(depth + 1)?;
                }
            }
            116 => self.buf()?,
            tag => {
                return Err(PreflightError::UnknownTag {
                    what: "value",
                    tag: tag.into(),
                })
            }
        }
        Ok(())
    }

    fn delete_set(&mut self) -> Result<(), PreflightError> {
        let clients = self.count("delete set client", 2)?;
        for _ in 0..clients {
            self.var()?; // client
            let ranges = self.count("delete range", 2)?;
            for _ in 0..ranges {
                self.var()?;
                self.var()?;
            }
        }
        Ok(())
    }
}
