// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Supported tensor element data types.

use std::fmt;
use std::str::FromStr;

/// Enumerates the numeric types a [`crate::Tensor`] can hold.
///
/// The model configuration names these `"float32"`, `"float16"`, `"int8"`
/// and `"int4"`; the short forms (`"f32"`, ...) are accepted too. `I32` is
/// used for token ids. The model file stores the [`code`](DType::code).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DType {
    /// 32-bit IEEE 754 floating point.
    #[serde(rename = "float32", alias = "f32")]
    F32,
    /// 16-bit IEEE 754 floating point.
    #[serde(rename = "float16", alias = "f16")]
    F16,
    /// 32-bit signed integer (token ids).
    #[serde(rename = "int32", alias = "i32")]
    I32,
    /// 8-bit signed integer (quantised weights).
    #[serde(rename = "int8", alias = "i8")]
    I8,
    /// 4-bit signed integer, two per byte (quantised weights).
    #[serde(rename = "int4", alias = "i4")]
    I4,
}

impl DType {
    /// Returns the storage size of `n` elements in bytes.
    pub fn bytes_for(self, n: usize) -> usize {
        match self {
            DType::F32 | DType::I32 => n * 4,
            DType::F16 => n * 2,
            DType::I8 => n,
            DType::I4 => n.div_ceil(2),
        }
    }

    /// Returns the configuration label for this data type.
    pub fn as_str(self) -> &'static str {
        match self {
            DType::F32 => "float32",
            DType::F16 => "float16",
            DType::I32 => "int32",
            DType::I8 => "int8",
            DType::I4 => "int4",
        }
    }

    /// Numeric code used by the model file.
    pub fn code(self) -> u32 {
        match self {
            DType::F32 => 0,
            DType::F16 => 1,
            DType::I32 => 2,
            DType::I8 => 3,
            DType::I4 => 4,
        }
    }

    /// Inverse of [`code`](DType::code).
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => DType::F32,
            1 => DType::F16,
            2 => DType::I32,
            3 => DType::I8,
            4 => DType::I4,
            _ => return None,
        })
    }

    /// Returns `true` for floating-point types.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F16)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "float32" | "f32" => Ok(DType::F32),
            "float16" | "f16" => Ok(DType::F16),
            "int32" | "i32" => Ok(DType::I32),
            "int8" | "i8" => Ok(DType::I8),
            "int4" | "i4" => Ok(DType::I4),
            other => Err(format!("unknown dtype '{other}'")),
        }
    }
}

/// A Rust type that can be viewed as tensor data.
pub trait Element: Copy + Send + Sync + 'static {
    /// The matching tensor dtype.
    const DTYPE: DType;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
}

impl Element for half::f16 {
    const DTYPE: DType = DType::F16;
}

impl Element for i32 {
    const DTYPE: DType = DType::I32;
}

impl Element for i8 {
    const DTYPE: DType = DType::I8;
}
