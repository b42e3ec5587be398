// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Weight records in the model file.
//!
//! Each record is laid out as:
//!
//! ```text
//! n_dims   u32
//! name_len u32
//! dtype    u32           (DType::code)
//! dims     u32 × n_dims
//! name     name_len bytes
//! padding  zeros up to the next 32-byte file offset
//! data     raw little-endian elements
//! ```
//!
//! Records follow the graph's operator order, and within an operator the
//! order of its weight tensors.

use std::io::{self, Seek, Write};
use std::sync::Arc;
use tensor_core::{DType, InputFile, StreamError, Tensor, WeightSource};

/// File alignment of every record's data section.
pub const WEIGHT_ALIGN: u64 = 32;

/// Upper bound on a record's rank.
const MAX_DIMS: u32 = 4;

/// Zero bytes needed to bring `pos` up to [`WEIGHT_ALIGN`].
pub fn padding(pos: u64) -> u64 {
    (WEIGHT_ALIGN - pos % WEIGHT_ALIGN) % WEIGHT_ALIGN
}

/// The header of one weight record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightHeader {
    pub name: String,
    pub dtype: DType,
    pub dims: Vec<usize>,
    /// File offset of the first data byte.
    pub data_offset: u64,
}

impl WeightHeader {
    /// Reads a header and its padding, leaving the stream at the data.
    pub fn read(stream: &InputFile) -> Result<Self, StreamError> {
        let n_dims = stream.read_u32()?;
        let name_len = stream.read_u32()?;
        let code = stream.read_u32()?;
        if n_dims > MAX_DIMS {
            return Err(StreamError::WeightMismatch {
                name: format!("<record at {}>", stream.tell()?),
                detail: format!("implausible rank {n_dims}"),
            });
        }
        let dims = (0..n_dims)
            .map(|_| stream.read_u32().map(|d| d as usize))
            .collect::<Result<Vec<_>, _>>()?;
        let name = stream.read_string(name_len as usize)?;
        let dtype = DType::from_code(code).ok_or_else(|| StreamError::WeightMismatch {
            name: name.clone(),
            detail: format!("unknown dtype code {code}"),
        })?;

        stream.skip(padding(stream.tell()?))?;
        Ok(Self {
            name,
            dtype,
            dims,
            data_offset: stream.tell()?,
        })
    }

    /// Bytes in the data section.
    pub fn data_len(&self) -> usize {
        self.dtype.bytes_for(self.dims.iter().product())
    }

    /// Checks that this record can fill `tensor`.
    pub fn check(&self, tensor: &Tensor) -> Result<(), StreamError> {
        let mismatch = |detail: String| StreamError::WeightMismatch {
            name: tensor.name().to_string(),
            detail,
        };
        if self.name != tensor.name() {
            return Err(mismatch(format!("record is named '{}'", self.name)));
        }
        if self.dtype != tensor.dtype() {
            return Err(mismatch(format!("record is {}, tensor is {}", self.dtype, tensor.dtype())));
        }
        if self.dims != tensor.shape().dims() {
            return Err(mismatch(format!("record dims {:?}, tensor is {}", self.dims, tensor.shape())));
        }
        Ok(())
    }
}

/// Reads the next record into `tensor`.
///
/// The data is not read: the tensor records its offset and materializes on
/// first use. The stream is left at the next record.
pub fn load_weight(tensor: &Tensor, stream: &Arc<InputFile>) -> Result<(), StreamError> {
    let header = WeightHeader::read(stream)?;
    header.check(tensor)?;

    let end = header.data_offset + header.data_len() as u64;
    if end > stream.len() {
        return Err(StreamError::Truncated {
            offset: header.data_offset,
            needed: header.data_len(),
            len: stream.len(),
        });
    }
    tensor.set_weight_source(WeightSource {
        file: Arc::clone(stream),
        offset: header.data_offset,
    });
    stream.skip(header.data_len() as u64)?;
    Ok(())
}

/// Appends one weight record to `out`.
pub fn write_weight<W: Write + Seek>(
    out: &mut W,
    name: &str,
    dtype: DType,
    dims: &[usize],
    data: &[u8],
) -> io::Result<()> {
    let expected = dtype.bytes_for(dims.iter().product());
    if data.len() != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("weight '{name}' has {} bytes, dims {dims:?} need {expected}", data.len()),
        ));
    }

    out.write_all(&(dims.len() as u32).to_le_bytes())?;
    out.write_all(&(name.len() as u32).to_le_bytes())?;
    out.write_all(&dtype.code().to_le_bytes())?;
    for &d in dims {
        out.write_all(&(d as u32).to_le_bytes())?;
    }
    out.write_all(name.as_bytes())?;

    let pad = padding(out.stream_position()?);
    out.write_all(&[0u8; WEIGHT_ALIGN as usize][..pad as usize])?;
    out.write_all(data)
}
