//! Interchangeable sparse expansion backends.

use std::fs::File;
use std::io::{Read, Write};

use tempfile::NamedTempFile;

use super::{declared_size, SparseImage, Sink};
use crate::error::{Error, Result};
use crate::process::Cmd;

const COPY_BUFFER_LEN: usize = 1024 * 1024;

/// Something that can expand a sparse blob into a sink.
pub trait SparseCodec: Send + Sync {
    fn name(&self) -> &'static str;

    /// Expand `blob` into `sink`, returning the expanded size.
    fn expand_into(&self, blob: &[u8], sink: &mut dyn Sink) -> Result<u64>;

    /// Host programs this backend needs.
    fn required_programs(&self) -> Vec<String> {
        Vec::new()
    }
}

/// In-process decoder.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeCodec;

impl SparseCodec for NativeCodec {
    fn name(&self) -> &'static str {
        "native"
    }

    fn expand_into(&self, blob: &[u8], sink: &mut dyn Sink) -> Result<u64> {
        let image = SparseImage::parse(blob)?;
        image.expand_into(image.expanded_size(), sink)
    }
}

/// Expands through the `simg2img` program.
#[derive(Debug, Clone)]
pub struct Simg2img {
    program: String,
}

impl Simg2img {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for Simg2img {
    fn default() -> Self {
        Self::new("simg2img")
    }
}

fn scratch_err(e: std::io::Error) -> Error {
    Error::SparseDecode(format!("scratch file: {}", e))
}

impl SparseCodec for Simg2img {
    fn name(&self) -> &'static str {
        "simg2img"
    }

    fn expand_into(&self, blob: &[u8], sink: &mut dyn Sink) -> Result<u64> {
        let expected = declared_size(blob)?;

        let mut input = NamedTempFile::new().map_err(scratch_err)?;
        input.write_all(blob).map_err(scratch_err)?;
        input.flush().map_err(scratch_err)?;
        let output = NamedTempFile::new().map_err(scratch_err)?;

        Cmd::new(&self.program)
            .arg_path(input.path())
            .arg_path(output.path())
            .error_msg("simg2img failed to expand sparse image")
            .run()
            .map_err(|e| Error::SparseDecode(e.to_string()))?;

        let mut file = File::open(output.path()).map_err(scratch_err)?;
        let mut buf = vec![0u8; COPY_BUFFER_LEN];
        let mut offset = 0u64;
        loop {
            let n = file.read(&mut buf).map_err(scratch_err)?;
            if n == 0 {
                break;
            }
            sink.write_at(offset, &buf[..n])?;
            offset += n as u64;
        }

        if offset != expected {
            return Err(Error::SparseDecode(format!(
                "simg2img produced {} bytes, expected {}",
                offset, expected
            )));
        }
        Ok(offset)
    }

    fn required_programs(&self) -> Vec<String> {
        vec![self.program.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::{encode, EncodeOptions};

    #[test]
    fn native_codec_expands_into_slice() {
        let data: Vec<u8> = (0..8192u32).map(|i| (i % 7) as u8).collect();
        let blob = encode(&data, EncodeOptions::default()).unwrap();
        let mut out = vec![0u8; data.len()];
        let n = NativeCodec.expand_into(&blob, &mut out).unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(out, data);
    }

    #[test]
    fn missing_simg2img_is_a_decode_error() {
        let blob = encode(&vec![1u8; 4096], EncodeOptions::default()).unwrap();
        let mut out = vec![0u8; 4096];
        let err = Simg2img::new("nonexistent_simg2img_12345")
            .expand_into(&blob, &mut out)
            .unwrap_err();
        assert!(matches!(err, Error::SparseDecode(_)));
    }
}
