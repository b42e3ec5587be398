// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Graph tensors with per-pass user counting.
//!
//! A [`Tensor`] is a named, typed slot in the operator graph. Its buffer is
//! materialized lazily by [`prepare_data`](Tensor::prepare_data) and handed
//! back to the device pool as soon as the last consumer of the current pass
//! is done with it:
//!
//! ```text
//! build:        add_user() once per consuming operator   → user_count = k
//! producer:     resume_user_count(); prepare_data()      → curr = k, buffer live
//! consumer i:   decrease_curr_user_count()               → curr = k - i
//! last one:     curr hits 0                              → buffer back to pool
//! ```
//!
//! Shared tensors (the KV cache) skip the release on the zero crossing and
//! live as long as the graph.

use crate::{DType, Element, InputFile, Shape, StreamError};
use device::{fatal, infer_assert, CopyMode, Device, DeviceKind, DevicePtr};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};

/// Identity of the operator that produces a tensor.
///
/// A back reference for diagnostics only; it never keeps the operator alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub usize);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Where a weight tensor's bytes live in the model file.
#[derive(Debug, Clone)]
pub struct WeightSource {
    pub file: Arc<InputFile>,
    pub offset: u64,
}

#[derive(Debug, Clone)]
struct Meta {
    shape: Shape,
    dtype: DType,
}

#[derive(Debug, Clone, Copy)]
enum Storage {
    /// A block from the device pool, `capacity` bytes requested.
    Pooled { ptr: DevicePtr, capacity: usize },
    /// Points into the memory-mapped model file.
    Mapped { ptr: DevicePtr },
}

impl Storage {
    fn ptr(self) -> DevicePtr {
        match self {
            Storage::Pooled { ptr, .. } | Storage::Mapped { ptr } => ptr,
        }
    }
}

/// A tensor slot in the operator graph.
///
/// All state changes go through `&self` so that a tensor can be shared as
/// `Arc<Tensor>` between its producer and its consumers. Only the thread
/// driving the graph mutates tensors; kernels on pool workers only touch the
/// data behind slices obtained before dispatch.
pub struct Tensor {
    name: String,
    device: Arc<dyn Device>,
    meta: RwLock<Meta>,
    data: Mutex<Option<Storage>>,
    owner: OnceLock<OpId>,
    shared: AtomicBool,
    user_count: AtomicUsize,
    curr_user_count: AtomicUsize,
    source: Mutex<Option<WeightSource>>,
}

impl Tensor {
    /// Creates an unmaterialized tensor.
    pub fn new(device: Arc<dyn Device>, name: impl Into<String>, shape: Shape, dtype: DType) -> Self {
        Self {
            name: name.into(),
            device,
            meta: RwLock::new(Meta { shape, dtype }),
            data: Mutex::new(None),
            owner: OnceLock::new(),
            shared: AtomicBool::new(false),
            user_count: AtomicUsize::new(0),
            curr_user_count: AtomicUsize::new(0),
            source: Mutex::new(None),
        }
    }

    /// Creates a tensor that is never released by user counting.
    pub fn new_shared(device: Arc<dyn Device>, name: impl Into<String>, shape: Shape, dtype: DType) -> Self {
        let t = Self::new(device, name, shape, dtype);
        t.set_shared(true);
        t
    }

    // ── Metadata ───────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn shape(&self) -> Shape {
        self.meta().shape.clone()
    }

    pub fn dtype(&self) -> DType {
        self.meta().dtype
    }

    /// Bytes covered by the current shape and dtype.
    pub fn length_in_bytes(&self) -> usize {
        let meta = self.meta();
        meta.shape.size_bytes(meta.dtype)
    }

    /// Number of elements in the current shape.
    pub fn num_elements(&self) -> usize {
        self.meta().shape.num_elements()
    }

    /// Changes the shape.
    ///
    /// A materialized buffer too small for the new shape is returned to the
    /// pool; the next [`prepare_data`](Tensor::prepare_data) allocates a
    /// fitting one. Shared tensors must never outgrow their buffer.
    pub fn set_shape(&self, shape: Shape) {
        let new_len = {
            let mut meta = self.meta.write().unwrap_or_else(PoisonError::into_inner);
            meta.shape = shape;
            meta.shape.size_bytes(meta.dtype)
        };
        self.fit_buffer(new_len);
    }

    /// Changes the dtype, with the same buffer rule as [`set_shape`](Tensor::set_shape).
    pub fn set_dtype(&self, dtype: DType) {
        let new_len = {
            let mut meta = self.meta.write().unwrap_or_else(PoisonError::into_inner);
            meta.dtype = dtype;
            meta.shape.size_bytes(dtype)
        };
        self.fit_buffer(new_len);
    }

    fn fit_buffer(&self, new_len: usize) {
        let storage = *self.data();
        if let Some(Storage::Pooled { capacity, .. }) = storage {
            if new_len > capacity {
                infer_assert!(
                    !self.shared(),
                    "shared tensor '{}' grew from {capacity} to {new_len} bytes",
                    self.name
                );
                self.recall_data();
            }
        }
    }

    fn meta(&self) -> std::sync::RwLockReadGuard<'_, Meta> {
        self.meta.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn data(&self) -> MutexGuard<'_, Option<Storage>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Ownership ──────────────────────────────────────────────

    /// Records the producing operator. Set once.
    pub fn set_owner(&self, op: OpId) {
        if self.owner.set(op).is_err() {
            let existing = self.owner();
            infer_assert!(existing == Some(op), "tensor '{}' already owned by {existing:?}", self.name);
        }
    }

    pub fn owner(&self) -> Option<OpId> {
        self.owner.get().copied()
    }

    pub fn set_shared(&self, shared: bool) {
        self.shared.store(shared, Ordering::Release);
    }

    pub fn shared(&self) -> bool {
        self.shared.load(Ordering::Acquire)
    }

    // ── User counting ──────────────────────────────────────────

    /// Registers one more consumer. Called once per consuming operator at
    /// graph build time.
    pub fn add_user(&self) {
        self.user_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn user_count(&self) -> usize {
        self.user_count.load(Ordering::Acquire)
    }

    pub fn curr_user_count(&self) -> usize {
        self.curr_user_count.load(Ordering::Acquire)
    }

    /// Resets the per-pass countdown to `user_count`.
    pub fn resume_user_count(&self) {
        self.curr_user_count.store(self.user_count(), Ordering::Release);
    }

    /// Marks one consumer finished. The last one releases the buffer unless
    /// the tensor is shared.
    pub fn decrease_curr_user_count(&self) {
        let prev = self.curr_user_count.fetch_sub(1, Ordering::AcqRel);
        infer_assert!(prev > 0, "user count underflow on tensor '{}'", self.name);
        if prev == 1 && !self.shared() {
            self.recall_data();
        }
    }

    // ── Data ───────────────────────────────────────────────────

    /// Attaches the model-file location this weight is read from.
    pub fn set_weight_source(&self, source: WeightSource) {
        *self.source.lock().unwrap_or_else(PoisonError::into_inner) = Some(source);
    }

    pub fn weight_source(&self) -> Option<WeightSource> {
        self.source.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_materialized(&self) -> bool {
        self.data().is_some()
    }

    /// Materializes the buffer if it is not already.
    ///
    /// Weight tensors read their bytes from the model file, or point into
    /// the map when the file is mapped and the device is the CPU. Other
    /// tensors get an uninitialized block from the device pool.
    ///
    /// # Panics
    /// Reading a weight that fails is fatal: the file was validated when the
    /// graph was loaded.
    pub fn prepare_data(&self) {
        let mut data = self.data();
        if data.is_some() {
            return;
        }
        let len = self.length_in_bytes();

        let Some(source) = self.weight_source() else {
            *data = Some(Storage::Pooled {
                ptr: self.device.allocate(len),
                capacity: len,
            });
            return;
        };

        if self.device.kind() == DeviceKind::Cpu {
            if let Some(bytes) = source.file.mapped(source.offset, len) {
                let ptr = DevicePtr::from_addr(bytes.as_ptr() as usize);
                if let Some(ptr) = ptr {
                    *data = Some(Storage::Mapped { ptr });
                    return;
                }
            }
        }

        let ptr = self.device.allocate(len);
        if let Err(e) = self.read_weight(&source, ptr, len) {
            self.device.free_device(ptr);
            fatal!("failed to read weight '{}': {e}", self.name);
        }
        *data = Some(Storage::Pooled { ptr, capacity: len });
    }

    fn read_weight(&self, source: &WeightSource, ptr: DevicePtr, len: usize) -> Result<(), StreamError> {
        if self.device.kind() == DeviceKind::Cpu {
            // SAFETY: `ptr` is a fresh block of at least `len` bytes.
            let dst = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) };
            return source.file.read_at(source.offset, dst);
        }

        let staging = self.device.allocate_host(len);
        // SAFETY: host staging memory of `len` bytes.
        let buf = unsafe { std::slice::from_raw_parts_mut(staging.as_ptr(), len) };
        let read = source.file.read_at(source.offset, buf);
        if read.is_ok() {
            // SAFETY: both regions hold `len` bytes; the copy is synchronous.
            unsafe {
                self.device
                    .host2device_copy(ptr, staging.as_ptr(), len, CopyMode::Sync)
            };
        }
        self.device.free_host(staging);
        read
    }

    /// Returns the buffer to the device pool (mapped data is just dropped).
    pub fn recall_data(&self) {
        if let Some(storage) = self.data().take() {
            if let Storage::Pooled { ptr, .. } = storage {
                self.device.free_device(ptr);
            }
        }
    }

    /// Address of the materialized buffer.
    pub fn ptr(&self) -> Option<DevicePtr> {
        self.data().map(Storage::ptr)
    }

    fn host_ptr<T: Element>(&self) -> (*mut T, usize) {
        let (dtype, len) = {
            let meta = self.meta();
            (meta.dtype, meta.shape.num_elements())
        };
        infer_assert!(
            dtype == T::DTYPE,
            "tensor '{}' is {dtype}, viewed as {}",
            self.name,
            T::DTYPE
        );
        infer_assert!(
            self.device.kind() == DeviceKind::Cpu,
            "tensor '{}' lives on {}",
            self.name,
            self.device.name()
        );
        let Some(ptr) = self.ptr() else {
            fatal!("tensor '{}' used before prepare_data", self.name);
        };
        (ptr.as_ptr().cast::<T>(), len)
    }

    /// Views the data as `&[T]`.
    ///
    /// # Safety
    /// No mutable view of this tensor may be live, and the buffer must not be
    /// released or reshaped while the slice is in use.
    pub unsafe fn as_slice<T: Element>(&self) -> &[T] {
        let (ptr, len) = self.host_ptr::<T>();
        std::slice::from_raw_parts(ptr, len)
    }

    /// Views the data as `&mut [T]`.
    ///
    /// # Safety
    /// No other view of this tensor may be live, and the buffer must not be
    /// released or reshaped while the slice is in use.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice<T: Element>(&self) -> &mut [T] {
        let (ptr, len) = self.host_ptr::<T>();
        std::slice::from_raw_parts_mut(ptr, len)
    }

    /// Copies the data out to the host.
    pub fn to_vec<T: Element>(&self) -> Vec<T> {
        let len = self.num_elements();
        infer_assert!(self.dtype() == T::DTYPE, "tensor '{}' is {}", self.name, self.dtype());
        let Some(ptr) = self.ptr() else {
            fatal!("tensor '{}' read before prepare_data", self.name);
        };
        let mut out = Vec::<T>::with_capacity(len);
        // SAFETY: the buffer holds at least `len` elements of `T`; the copy
        // initializes all of them.
        unsafe {
            self.device.device2host_copy(
                out.as_mut_ptr().cast::<u8>(),
                ptr,
                len * std::mem::size_of::<T>(),
                CopyMode::Sync,
            );
            out.set_len(len);
        }
        out
    }

    /// Materializes the tensor and fills it from `values`.
    pub fn copy_from<T: Element>(&self, values: &[T]) {
        infer_assert!(self.dtype() == T::DTYPE, "tensor '{}' is {}", self.name, self.dtype());
        infer_assert!(
            values.len() == self.num_elements(),
            "tensor '{}' holds {} elements, got {}",
            self.name,
            self.num_elements(),
            values.len()
        );
        self.prepare_data();
        if let Some(ptr) = self.ptr() {
            // SAFETY: the buffer holds `values.len()` elements.
            unsafe {
                self.device.host2device_copy(
                    ptr,
                    values.as_ptr().cast::<u8>(),
                    std::mem::size_of_val(values),
                    CopyMode::Sync,
                )
            };
        }
    }
}

impl Drop for Tensor {
    fn drop(&mut self) {
        self.recall_data();
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("name", &self.name)
            .field("shape", &self.shape())
            .field("dtype", &self.dtype())
            .field("owner", &self.owner())
            .field("shared", &self.shared())
            .field("users", &self.user_count())
            .field("materialized", &self.is_materialized())
            .finish()
    }
}
