// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # tensor-core
//!
//! Tensor slots for the operator graph and the weight stream that fills them.
//!
//! This crate provides:
//! - [`Tensor`]: a named, typed, lazily materialized buffer on a device,
//!   with per-pass user counting that returns memory to the pool as soon as
//!   the last consumer is done.
//! - [`Shape`] and [`DType`]: shape descriptors and element types
//!   (f32, f16, i32, i8, i4).
//! - [`InputFile`]: a little-endian model-file reader with positional reads
//!   and an optional memory map.
//!
//! # Design Goals
//! - Nothing is allocated until an operator is about to write it.
//! - A weight can live in the memory map instead of the pool.
//! - Recoverable failures (I/O, truncated files) are [`StreamError`]s;
//!   protocol violations are fatal.

mod dtype;
mod error;
mod shape;
mod stream;
mod tensor;

pub use dtype::{DType, Element};
pub use error::StreamError;
pub use shape::Shape;
pub use stream::InputFile;
pub use tensor::{OpId, Tensor, WeightSource};
