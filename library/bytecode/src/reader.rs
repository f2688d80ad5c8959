use std::io::Read;

use log::debug;

use crate::ops::{Cursor, DecodeError, Opcode};
use crate::{chunk, Export, Image, Import, Lambda, ValidateError, MAGIC, VERSION};

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("unexpected end of image")]
    Eof,
    #[error("invalid magic")]
    Magic,
    #[error("unsupported image version {0}")]
    Version(u32),
    #[error("chunk {0} appears more than once")]
    DuplicateChunk(String),
    #[error("required chunk {0} is missing")]
    MissingChunk(String),
    #[error("chunk {tag} length {len} overflows the image")]
    ChunkOverflow { tag: String, len: usize },
    #[error("malformed {0} chunk")]
    Malformed(&'static str),
    #[error("atom table entry is not valid UTF-8")]
    InvalidAtom,
    #[error("literal table failed to decompress: {0}")]
    Literals(#[from] std::io::Error),
    #[error("code section: {0}")]
    Code(#[from] DecodeError),
    #[error(transparent)]
    Validate(#[from] ValidateError),
}

fn tag_name(tag: &[u8; 4]) -> String {
    String::from_utf8_lossy(tag).into_owned()
}

/// Parses a module image from a byte slice.
///
/// The reader consumes the header, then each chunk in sequence; unknown
/// chunk tags are skipped so future format revisions can add sections
/// without breaking older runtimes. The parsed image is validated before it
/// is returned, so a successful read implies a well-formed code section.
pub struct ImageReader<'a> {
    input: &'a [u8],
    image: Image,
}

impl<'a> ImageReader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, image: Image::default() }
    }

    pub fn read(mut self) -> Result<Image, ReadError> {
        self.read_magic()?;
        let version = self.read_u32()?;
        if version != VERSION {
            return Err(ReadError::Version(version));
        }
        self.image.version = version;

        let mut seen: Vec<[u8; 4]> = Vec::new();
        while !self.input.is_empty() {
            let tag: [u8; 4] = self
                .read_bytes(4)?
                .try_into()
                .map_err(|_| ReadError::Eof)?;
            let len = self.read_u32()? as usize;
            if len > self.input.len() {
                return Err(ReadError::ChunkOverflow { tag: tag_name(&tag), len });
            }
            if seen.contains(&tag) {
                return Err(ReadError::DuplicateChunk(tag_name(&tag)));
            }
            seen.push(tag);
            let payload = self.read_bytes(len)?;
            // Chunks are padded to the next 4-byte boundary
            let pad = (4 - (len % 4)) % 4;
            if pad > 0 && !self.input.is_empty() {
                self.read_bytes(pad.min(self.input.len()))?;
            }

            match &tag {
                t if t == chunk::ATOMS => self.image.atoms = read_atoms(payload)?,
                t if t == chunk::IMPORTS => self.image.imports = read_imports(payload)?,
                t if t == chunk::EXPORTS => self.image.exports = read_exports(payload)?,
                t if t == chunk::LITERALS => self.image.literals = read_literals(payload)?,
                t if t == chunk::CODE => self.image.code = read_code(payload)?,
                t if t == chunk::STRINGS => self.image.strings = payload.to_vec(),
                t if t == chunk::FUNS => self.image.funs = read_funs(payload)?,
                t if t == chunk::LINES => self.image.lines = Some(payload.to_vec()),
                t if t == chunk::ATTRIBUTES => self.image.attributes = Some(payload.to_vec()),
                other => {
                    debug!(target: "loader", "skipping unknown chunk {}", tag_name(other));
                }
            }
        }

        for required in chunk::REQUIRED {
            if !seen.contains(required) {
                return Err(ReadError::MissingChunk(tag_name(required)));
            }
        }

        self.image.validate()?;
        Ok(self.image)
    }

    fn read_magic(&mut self) -> Result<(), ReadError> {
        let magic = self.read_bytes(MAGIC.len()).map_err(|_| ReadError::Magic)?;
        if magic == MAGIC {
            Ok(())
        } else {
            Err(ReadError::Magic)
        }
    }

    fn read_u32(&mut self) -> Result<u32, ReadError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ReadError> {
        if self.input.len() >= len {
            let (bytes, rest) = self.input.split_at(len);
            self.input = rest;
            Ok(bytes)
        } else {
            Err(ReadError::Eof)
        }
    }
}

struct Payload<'a>(&'a [u8]);

impl<'a> Payload<'a> {
    fn read_bytes(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], ReadError> {
        if self.0.len() >= len {
            let (bytes, rest) = self.0.split_at(len);
            self.0 = rest;
            Ok(bytes)
        } else {
            Err(ReadError::Malformed(what))
        }
    }

    fn read_u8(&mut self, what: &'static str) -> Result<u8, ReadError> {
        Ok(self.read_bytes(1, what)?[0])
    }

    fn read_u32(&mut self, what: &'static str) -> Result<u32, ReadError> {
        Ok(u32::from_be_bytes(self.read_bytes(4, what)?.try_into().unwrap()))
    }
}

fn read_atoms(payload: &[u8]) -> Result<Vec<String>, ReadError> {
    let mut p = Payload(payload);
    let count = p.read_u32("AtU8")? as usize;
    let mut atoms = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let len = p.read_u8("AtU8")? as usize;
        let bytes = p.read_bytes(len, "AtU8")?;
        let name = std::str::from_utf8(bytes).map_err(|_| ReadError::InvalidAtom)?;
        atoms.push(name.to_string());
    }
    Ok(atoms)
}

fn read_imports(payload: &[u8]) -> Result<Vec<Import>, ReadError> {
    let mut p = Payload(payload);
    let count = p.read_u32("ImpT")? as usize;
    let mut imports = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        imports.push(Import {
            module: p.read_u32("ImpT")?,
            function: p.read_u32("ImpT")?,
            arity: p.read_u8("ImpT")?,
        });
    }
    Ok(imports)
}

fn read_exports(payload: &[u8]) -> Result<Vec<Export>, ReadError> {
    let mut p = Payload(payload);
    let count = p.read_u32("ExpT")? as usize;
    let mut exports = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        exports.push(Export {
            function: p.read_u32("ExpT")?,
            arity: p.read_u8("ExpT")?,
            offset: p.read_u32("ExpT")?,
        });
    }
    Ok(exports)
}

fn read_literals(payload: &[u8]) -> Result<Vec<Vec<u8>>, ReadError> {
    let mut p = Payload(payload);
    let uncompressed_len = p.read_u32("LitT")? as usize;
    let mut decoder = libflate::zlib::Decoder::new(p.0)?;
    let mut table = Vec::with_capacity(uncompressed_len);
    decoder.read_to_end(&mut table)?;
    if table.len() != uncompressed_len {
        return Err(ReadError::Malformed("LitT"));
    }

    let mut p = Payload(&table);
    let count = p.read_u32("LitT")? as usize;
    let mut literals = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let size = p.read_u32("LitT")? as usize;
        literals.push(p.read_bytes(size, "LitT")?.to_vec());
    }
    Ok(literals)
}

fn read_funs(payload: &[u8]) -> Result<Vec<Lambda>, ReadError> {
    let mut p = Payload(payload);
    let count = p.read_u32("FunT")? as usize;
    let mut funs = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        funs.push(Lambda {
            function: p.read_u32("FunT")?,
            arity: p.read_u8("FunT")?,
            env_len: p.read_u8("FunT")?,
            offset: p.read_u32("FunT")?,
        });
    }
    Ok(funs)
}

fn read_code(payload: &[u8]) -> Result<Vec<Opcode>, ReadError> {
    let mut p = Payload(payload);
    let count = p.read_u32("Code")? as usize;
    let mut cursor = Cursor::new(p.0);
    let mut code = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        code.push(Opcode::decode(&mut cursor)?);
    }
    if !cursor.is_empty() {
        return Err(ReadError::Malformed("Code"));
    }
    Ok(code)
}
