//! Read-only view over a safetensors checkpoint image.
//!
//! Layout: 8-byte little-endian header length, UTF-8 JSON object mapping
//! tensor names to `{dtype, shape, data_offsets}`, then the concatenated
//! tensor bytes. The store validates every offset at load and hands out
//! f32 copies on demand; weights are immutable and may be read from any
//! thread.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::tensor::Tensor;

#[derive(Debug, Deserialize)]
struct RawTensorInfo {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: (usize, usize),
}

/// Bytes-per-element for the dtypes the container can carry. Only F32 is
/// readable; the rest are validated and surfaced as unsupported on
/// access.
fn dtype_size(dtype: &str) -> Option<usize> {
    match dtype {
        "F64" | "I64" | "U64" => Some(8),
        "F32" | "I32" | "U32" => Some(4),
        "F16" | "BF16" | "I16" | "U16" => Some(2),
        "I8" | "U8" | "BOOL" => Some(1),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub dtype: String,
    pub shape: Vec<usize>,
    /// Byte range relative to the data segment.
    pub start: usize,
    pub end: usize,
}

enum Blob {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

impl std::ops::Deref for Blob {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Blob::Owned(v) => v,
            Blob::Mapped(m) => m,
        }
    }
}

pub struct WeightStore {
    blob: Blob,
    data_start: usize,
    tensors: HashMap<String, TensorInfo>,
}

impl WeightStore {
    /// Memory-maps a checkpoint file and parses its header.
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let file = std::fs::File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Self::parse(Blob::Mapped(mmap))
    }

    /// Builds a store over an owned byte image.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Arc<Self>> {
        Self::parse(Blob::Owned(bytes))
    }

    fn parse(blob: Blob) -> Result<Arc<Self>> {
        if blob.len() < 8 {
            return Err(Error::HeaderParse("blob shorter than the 8-byte length prefix".into()));
        }
        let header_len = u64::from_le_bytes(blob[..8].try_into().unwrap()) as usize;
        let data_start = 8usize
            .checked_add(header_len)
            .filter(|&ds| ds <= blob.len())
            .ok_or_else(|| Error::HeaderParse(format!("header length {header_len} exceeds blob")))?;
        let header: HashMap<String, serde_json::Value> = serde_json::from_slice(&blob[8..data_start])
            .map_err(|e| Error::HeaderParse(e.to_string()))?;

        let data_len = blob.len() - data_start;
        let mut tensors = HashMap::with_capacity(header.len());
        for (name, value) in header {
            if name == "__metadata__" {
                continue;
            }
            let raw: RawTensorInfo = serde_json::from_value(value)
                .map_err(|e| Error::HeaderParse(format!("{name}: {e}")))?;
            let (start, end) = raw.data_offsets;
            if start > end || end > data_len {
                return Err(Error::InvalidOffsets { name, start, end, len: data_len });
            }
            let elems = raw
                .shape
                .iter()
                .try_fold(1usize, |acc, &d| acc.checked_mul(d))
                .ok_or_else(|| Error::HeaderParse(format!("{name}: element count overflows usize")))?;
            if let Some(size) = dtype_size(&raw.dtype) {
                if end - start != elems * size {
                    return Err(Error::InvalidOffsets { name, start, end, len: data_len });
                }
            }
            tensors.insert(name, TensorInfo { dtype: raw.dtype, shape: raw.shape, start, end });
        }
        log::debug!("weight store: {} tensors, {} data bytes", tensors.len(), data_len);
        Ok(Arc::new(Self { blob, data_start, tensors }))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn info(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Copies the named tensor's bytes out into a fresh f32 `Tensor`.
    pub fn tensor(&self, name: &str) -> Result<Tensor> {
        let info = self
            .tensors
            .get(name)
            .ok_or_else(|| Error::TensorNotFound(name.to_string()))?;
        if info.dtype != "F32" {
            return Err(Error::UnsupportedDtype { name: name.to_string(), dtype: info.dtype.clone() });
        }
        let bytes = &self.blob[self.data_start + info.start..self.data_start + info.end];
        let data: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        Tensor::new(data, &info.shape)
    }
}

impl std::fmt::Debug for WeightStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightStore")
            .field("tensors", &self.tensors.len())
            .field("data_bytes", &(self.blob.len() - self.data_start))
            .finish()
    }
}
