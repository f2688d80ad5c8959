use std::io::Write;

use crate::{chunk, Image, MAGIC};

/// Serializes an [`Image`] into the chunked container format understood by
/// [`ImageReader`](crate::ImageReader).
pub struct ImageWriter<'a> {
    image: &'a Image,
}

impl<'a> ImageWriter<'a> {
    pub fn new(image: &'a Image) -> Self {
        Self { image }
    }

    pub fn write(&self) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&self.image.version.to_be_bytes());

        write_chunk(&mut out, chunk::ATOMS, &self.atoms_payload());
        write_chunk(&mut out, chunk::IMPORTS, &self.imports_payload());
        write_chunk(&mut out, chunk::EXPORTS, &self.exports_payload());
        write_chunk(&mut out, chunk::LITERALS, &self.literals_payload()?);
        write_chunk(&mut out, chunk::CODE, &self.code_payload());
        write_chunk(&mut out, chunk::STRINGS, &self.image.strings);
        write_chunk(&mut out, chunk::FUNS, &self.funs_payload());
        if let Some(lines) = &self.image.lines {
            write_chunk(&mut out, chunk::LINES, lines);
        }
        if let Some(attributes) = &self.image.attributes {
            write_chunk(&mut out, chunk::ATTRIBUTES, attributes);
        }

        Ok(out)
    }

    fn atoms_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.image.atoms.len() as u32).to_be_bytes());
        for atom in &self.image.atoms {
            debug_assert!(atom.len() <= u8::MAX as usize, "atom name too long for image");
            buf.push(atom.len() as u8);
            buf.extend_from_slice(atom.as_bytes());
        }
        buf
    }

    fn imports_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.image.imports.len() as u32).to_be_bytes());
        for import in &self.image.imports {
            buf.extend_from_slice(&import.module.to_be_bytes());
            buf.extend_from_slice(&import.function.to_be_bytes());
            buf.push(import.arity);
        }
        buf
    }

    fn exports_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.image.exports.len() as u32).to_be_bytes());
        for export in &self.image.exports {
            buf.extend_from_slice(&export.function.to_be_bytes());
            buf.push(export.arity);
            buf.extend_from_slice(&export.offset.to_be_bytes());
        }
        buf
    }

    fn literals_payload(&self) -> std::io::Result<Vec<u8>> {
        let mut table = Vec::new();
        table.extend_from_slice(&(self.image.literals.len() as u32).to_be_bytes());
        for literal in &self.image.literals {
            table.extend_from_slice(&(literal.len() as u32).to_be_bytes());
            table.extend_from_slice(literal);
        }

        let mut buf = Vec::new();
        buf.extend_from_slice(&(table.len() as u32).to_be_bytes());
        let mut encoder = libflate::zlib::Encoder::new(&mut buf)?;
        encoder.write_all(&table)?;
        encoder.finish().into_result()?;
        Ok(buf)
    }

    fn code_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.image.code.len() as u32).to_be_bytes());
        for op in &self.image.code {
            op.encode(&mut buf);
        }
        buf
    }

    fn funs_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.image.funs.len() as u32).to_be_bytes());
        for lambda in &self.image.funs {
            buf.extend_from_slice(&lambda.function.to_be_bytes());
            buf.push(lambda.arity);
            buf.push(lambda.env_len);
            buf.extend_from_slice(&lambda.offset.to_be_bytes());
        }
        buf
    }
}

fn write_chunk(out: &mut Vec<u8>, tag: &[u8; 4], payload: &[u8]) {
    out.extend_from_slice(tag);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    let pad = (4 - (payload.len() % 4)) % 4;
    out.extend_from_slice(&[0u8; 3][..pad]);
}

#[cfg(test)]
mod tests {
    use crate::{Export, Image, ImageReader, Opcode, ReadError, VERSION};

    use super::*;

    fn sample_image() -> Image {
        Image {
            version: VERSION,
            atoms: vec!["sample".into(), "f".into()],
            imports: vec![],
            exports: vec![Export { function: 1, arity: 0, offset: 0 }],
            literals: vec![vec![1, 2, 3], vec![]],
            strings: b"hello".to_vec(),
            funs: vec![],
            code: vec![
                Opcode::FuncInfo { function: 1, arity: 0, frame_size: 1 },
                Opcode::LoadInt { dst: 0, value: 42 },
                Opcode::Ret { src: 0 },
            ],
            lines: None,
            attributes: Some(b"vsn".to_vec()),
        }
    }

    #[test]
    fn image_roundtrip() {
        let image = sample_image();
        let bytes = ImageWriter::new(&image).write().unwrap();
        let parsed = ImageReader::new(&bytes).read().unwrap();
        assert_eq!(image.atoms, parsed.atoms);
        assert_eq!(image.exports, parsed.exports);
        assert_eq!(image.literals, parsed.literals);
        assert_eq!(image.strings, parsed.strings);
        assert_eq!(image.code, parsed.code);
        assert_eq!(image.attributes, parsed.attributes);
    }

    #[test]
    fn truncated_image_is_rejected() {
        let bytes = ImageWriter::new(&sample_image()).write().unwrap();
        let truncated = &bytes[..bytes.len() - 6];
        assert!(ImageReader::new(truncated).read().is_err());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = ImageWriter::new(&sample_image()).write().unwrap();
        bytes[0] = b'X';
        assert!(matches!(ImageReader::new(&bytes).read(), Err(ReadError::Magic)));
    }

    #[test]
    fn missing_required_chunk_is_rejected() {
        // Header only, no chunks at all
        let mut bytes = Vec::new();
        bytes.extend_from_slice(crate::MAGIC);
        bytes.extend_from_slice(&VERSION.to_be_bytes());
        assert!(matches!(
            ImageReader::new(&bytes).read(),
            Err(ReadError::MissingChunk(_))
        ));
    }
}
