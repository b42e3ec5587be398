// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The single-file model format.
//!
//! ```text
//! magic        b"IRTM"
//! version      u32 = 1
//! n_vocab      u32
//! n_embd       u32
//! n_head       u32
//! n_layer      u32
//! n_ff         u32
//! n_ctx        u32
//! weight_dtype u32 (DType code, f32 or f16)
//! has_scores   u32 (0 or 1)
//! vocabulary   n_vocab token records
//! weights      weight records in graph order, data 32-byte aligned
//! ```
//!
//! All integers are little-endian. [`synthesize`] writes a complete model
//! with random weights, used by the CLI and the tests.

use crate::gpt::build_graph;
use crate::{RuntimeError, TokenScore, Vocab};
use device::{CpuDevice, Device};
use op_graph::weights::{write_weight, WeightHeader};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tensor_core::{DType, InputFile};

/// File signature.
pub const MAGIC: [u8; 4] = *b"IRTM";

/// Current format version.
pub const VERSION: u32 = 1;

/// Architecture hyper-parameters stored in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HyperParams {
    pub n_vocab: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
    pub n_ff: usize,
    pub n_ctx: usize,
    pub weight_dtype: DType,
    pub has_scores: bool,
}

impl HyperParams {
    /// Reads and validates the magic, version and hyper-parameters.
    pub fn read(stream: &InputFile) -> Result<Self, RuntimeError> {
        let mut magic = [0u8; 4];
        stream.read_raw(&mut magic)?;
        if magic != MAGIC {
            return Err(RuntimeError::ModelFormat(format!("bad magic {magic:02x?}, expected \"IRTM\"")));
        }
        let version = stream.read_u32()?;
        if version != VERSION {
            return Err(RuntimeError::ModelFormat(format!("unsupported version {version}, expected {VERSION}")));
        }

        let next = || stream.read_u32().map(|v| v as usize);
        let (n_vocab, n_embd, n_head, n_layer, n_ff, n_ctx) = (next()?, next()?, next()?, next()?, next()?, next()?);
        let code = stream.read_u32()?;
        let weight_dtype = DType::from_code(code)
            .ok_or_else(|| RuntimeError::ModelFormat(format!("unknown weight dtype code {code}")))?;
        let has_scores = match stream.read_u32()? {
            0 => false,
            1 => true,
            other => return Err(RuntimeError::ModelFormat(format!("has_scores flag is {other}"))),
        };

        let hparams = Self {
            n_vocab,
            n_embd,
            n_head,
            n_layer,
            n_ff,
            n_ctx,
            weight_dtype,
            has_scores,
        };
        hparams.validate()?;
        Ok(hparams)
    }

    /// Writes magic, version and hyper-parameters.
    pub fn write(&self, out: &mut impl Write) -> std::io::Result<()> {
        out.write_all(&MAGIC)?;
        let fields = [
            VERSION,
            self.n_vocab as u32,
            self.n_embd as u32,
            self.n_head as u32,
            self.n_layer as u32,
            self.n_ff as u32,
            self.n_ctx as u32,
            self.weight_dtype.code(),
            u32::from(self.has_scores),
        ];
        for v in fields {
            out.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }

    /// Checks the parameters describe a buildable decoder.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        let fail = |detail: String| Err(RuntimeError::ModelFormat(detail));
        if [self.n_vocab, self.n_embd, self.n_head, self.n_ff, self.n_ctx].contains(&0) {
            return fail(format!("zero-sized hyper-parameter in {self:?}"));
        }
        if self.n_embd % self.n_head != 0 {
            return fail(format!("n_embd {} is not divisible by n_head {}", self.n_embd, self.n_head));
        }
        if !matches!(self.weight_dtype, DType::F32 | DType::F16) {
            return Err(RuntimeError::Unsupported(format!("{} weights", self.weight_dtype)));
        }
        Ok(())
    }

    /// Approximate parameter count.
    pub fn nr_params(&self) -> usize {
        let (v, d, f, c) = (self.n_vocab, self.n_embd, self.n_ff, self.n_ctx);
        let per_layer = 4 * d + (3 * d * d + 3 * d) + (d * d + d) + (d * f + f) + (f * d + d);
        v * d + c * d + self.n_layer * per_layer + 2 * d + d * v
    }
}

/// One weight record, as listed by [`inspect`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct WeightEntry {
    pub name: String,
    pub dtype: DType,
    pub dims: Vec<usize>,
    pub offset: u64,
    pub bytes: usize,
}

/// Header, vocabulary size and weight index of a model file.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelInfo {
    pub hparams: HyperParams,
    pub vocab_size: usize,
    pub file_bytes: u64,
    pub weights: Vec<WeightEntry>,
}

impl ModelInfo {
    /// Total bytes of weight data.
    pub fn weight_bytes(&self) -> usize {
        self.weights.iter().map(|w| w.bytes).sum()
    }
}

/// Reads a model file's structure without materializing any weight.
pub fn inspect(path: impl AsRef<Path>) -> Result<ModelInfo, RuntimeError> {
    let stream = InputFile::open(path, false)?;
    let hparams = HyperParams::read(&stream)?;
    let vocab = Vocab::load(&stream, hparams.n_vocab, hparams.has_scores)?;

    let mut weights = Vec::new();
    while !stream.is_eof()? {
        let header = WeightHeader::read(&stream)?;
        stream.skip(header.data_len() as u64)?;
        weights.push(WeightEntry {
            bytes: header.data_len(),
            name: header.name,
            dtype: header.dtype,
            dims: header.dims,
            offset: header.data_offset,
        });
    }
    Ok(ModelInfo {
        hparams,
        vocab_size: vocab.len(),
        file_bytes: stream.len(),
        weights,
    })
}

/// Writes a model file: header, vocabulary, then weight records.
pub struct ModelWriter<W: Write + Seek> {
    out: W,
    records: usize,
}

impl<W: Write + Seek> ModelWriter<W> {
    /// Writes the header and vocabulary.
    pub fn new(mut out: W, hparams: &HyperParams, vocab: &Vocab) -> Result<Self, RuntimeError> {
        hparams.validate()?;
        if vocab.len() != hparams.n_vocab {
            return Err(RuntimeError::ModelFormat(format!(
                "vocabulary has {} tokens, header says {}",
                vocab.len(),
                hparams.n_vocab
            )));
        }
        hparams.write(&mut out)?;
        vocab.write(&mut out, hparams.has_scores)?;
        Ok(Self { out, records: 0 })
    }

    /// Appends the next weight record.
    pub fn write_weight(&mut self, name: &str, dtype: DType, dims: &[usize], data: &[u8]) -> Result<(), RuntimeError> {
        write_weight(&mut self.out, name, dtype, dims, data)?;
        self.records += 1;
        Ok(())
    }

    /// Number of weight records written.
    pub fn records(&self) -> usize {
        self.records
    }

    /// Flushes and returns the writer.
    pub fn finish(mut self) -> Result<W, RuntimeError> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// A printable vocabulary: single ASCII characters, then letter pairs.
pub fn synthetic_vocab(n_vocab: usize) -> Vocab {
    let singles = (b' '..=b'~').map(|c| (c as char).to_string());
    let letters = || b'a'..=b'z';
    let pairs = letters().flat_map(move |a| letters().map(move |b| format!("{}{}", a as char, b as char)));
    Vocab::from_tokens(
        singles
            .chain(pairs)
            .chain((0..).map(|i| format!("<{i}>")))
            .take(n_vocab)
            .enumerate()
            .map(|(i, text)| TokenScore {
                text,
                score: -(i as f32),
            }),
    )
}

/// Writes a model with random weights to `path`.
///
/// Layer norms start at identity; every other weight is uniform in
/// `[-0.1, 0.1)` from a `seed`-ed generator.
pub fn synthesize(path: impl AsRef<Path>, hparams: &HyperParams, seed: u64) -> Result<(), RuntimeError> {
    let start = Instant::now();
    let path = path.as_ref();
    let vocab = synthetic_vocab(hparams.n_vocab);
    let file = BufWriter::new(File::create(path)?);
    let mut writer = ModelWriter::new(file, hparams, &vocab)?;

    // Only the weight list is needed; the graph is never built.
    let device: Arc<dyn Device> = Arc::new(CpuDevice::new(1));
    let graph = build_graph(device, hparams, hparams.n_ctx);
    let mut rng = StdRng::seed_from_u64(seed);

    for op in graph.ops() {
        for w in op.base().weights() {
            let n = w.num_elements();
            let identity = op.kind() == "layer_norm" && w.name().ends_with(".weight");
            let values: Vec<f32> = if identity {
                vec![1.0; n]
            } else if op.kind() == "layer_norm" {
                vec![0.0; n]
            } else {
                (0..n).map(|_| rng.gen_range(-0.1f32..0.1)).collect()
            };
            let bytes: Vec<u8> = match w.dtype() {
                DType::F16 => values
                    .iter()
                    .flat_map(|&v| half::f16::from_f32(v).to_le_bytes())
                    .collect(),
                _ => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            };
            writer.write_weight(w.name(), w.dtype(), w.shape().dims(), &bytes)?;
        }
    }

    let records = writer.records();
    writer.finish()?;
    tracing::info!(
        path = %path.display(),
        records,
        params = hparams.nr_params(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "synthetic model written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny(dtype: DType) -> HyperParams {
        HyperParams {
            n_vocab: 120,
            n_embd: 8,
            n_head: 2,
            n_layer: 1,
            n_ff: 16,
            n_ctx: 32,
            weight_dtype: dtype,
            has_scores: true,
        }
    }

    #[test]
    fn test_header_round_trip() {
        let hp = tiny(DType::F16);
        let mut f = tempfile::NamedTempFile::new().unwrap();
        hp.write(f.as_file_mut()).unwrap();
        let stream = InputFile::open(f.path(), false).unwrap();
        assert_eq!(HyperParams::read(&stream).unwrap(), hp);
    }

    #[test]
    fn test_bad_magic() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"GGML\x01\0\0\0").unwrap();
        let stream = InputFile::open(f.path(), false).unwrap();
        assert!(matches!(HyperParams::read(&stream), Err(RuntimeError::ModelFormat(_))));
    }

    #[test]
    fn test_validation() {
        let mut hp = tiny(DType::F32);
        hp.n_head = 3;
        assert!(matches!(hp.validate(), Err(RuntimeError::ModelFormat(_))));
        let hp = tiny(DType::I8);
        assert!(matches!(hp.validate(), Err(RuntimeError::Unsupported(_))));
    }

    #[test]
    fn test_synthetic_vocab() {
        let v = synthetic_vocab(120);
        assert_eq!(v.len(), 120);
        assert_eq!(v.map_to_id(" "), Some(0));
        assert_eq!(v.map_to_id("aa"), Some(95));
        assert_eq!(synthetic_vocab(10).len(), 10);
        // Past every pair, numbered placeholders fill the table.
        assert_eq!(synthetic_vocab(800).unmap_to_token(799), Some("<28>"));
    }

    #[test]
    fn test_synthesize_then_inspect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.irtm");
        let hp = tiny(DType::F32);
        synthesize(&path, &hp, 7).unwrap();

        let info = inspect(&path).unwrap();
        assert_eq!(info.hparams, hp);
        assert_eq!(info.vocab_size, 120);
        assert_eq!(info.weights.first().unwrap().name, "embed.wte");
        assert_eq!(info.weights.last().unwrap().name, "lm_head.weight");
        assert!(info.weights.iter().all(|w| w.offset % 32 == 0));
        assert_eq!(info.weight_bytes(), hp.nr_params() * 4);
    }

    #[test]
    fn test_writer_rejects_vocab_mismatch() {
        let f = tempfile::tempfile().unwrap();
        let err = ModelWriter::new(f, &tiny(DType::F32), &synthetic_vocab(3)).err().unwrap();
        assert!(matches!(err, RuntimeError::ModelFormat(_)));
    }
}
