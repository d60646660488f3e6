use std::sync::Arc;

use crate::{CoreError, DType, Device, Result};

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaDevice, CudaSlice, DeviceSlice};

/// Backing storage for tensor data.
///
/// Storage is reference-counted (`Arc`) so multiple tensors can share the same
/// underlying data. Tied parameters rely on this: two parameter names sharing
/// one `Storage` alias the same bytes, and the storage address is their
/// aliasing identity.
#[derive(Debug, Clone)]
pub enum StorageData {
    /// CPU heap-allocated storage.
    Cpu(Vec<u8>),
    /// CUDA GPU storage with device handle and raw byte buffer.
    #[cfg(feature = "cuda")]
    Cuda {
        device: Arc<CudaDevice>,
        buffer: Arc<CudaSlice<u8>>,
        device_idx: usize,
    },
}

/// Shared, reference-counted tensor storage.
#[derive(Debug, Clone)]
pub struct Storage {
    data: Arc<StorageData>,
    dtype: DType,
    device: Device,
    /// Number of logical elements (not bytes).
    numel: usize,
}

impl Storage {
    /// Allocate new CPU storage for `numel` elements of the given dtype.
    pub fn zeros(dtype: DType, numel: usize) -> Self {
        let nbytes = dtype.storage_bytes(numel);
        Self {
            data: Arc::new(StorageData::Cpu(vec![0u8; nbytes])),
            dtype,
            device: Device::Cpu,
            numel,
        }
    }

    /// Create storage from raw little-endian bytes (CPU).
    pub fn from_bytes(dtype: DType, numel: usize, bytes: Vec<u8>) -> Result<Self> {
        let expected = dtype.storage_bytes(numel);
        if bytes.len() != expected {
            return Err(CoreError::Storage(format!(
                "expected {} bytes for {} elements of {}, got {}",
                expected,
                numel,
                dtype,
                bytes.len()
            )));
        }
        Ok(Self {
            data: Arc::new(StorageData::Cpu(bytes)),
            dtype,
            device: Device::Cpu,
            numel,
        })
    }

    /// Create storage from a slice of f32 values.
    pub fn from_f32(data: &[f32]) -> Self {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self {
            data: Arc::new(StorageData::Cpu(bytes)),
            dtype: DType::F32,
            device: Device::Cpu,
            numel: data.len(),
        }
    }

    /// Get the dtype of this storage.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Get the device of this storage.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Number of logical elements.
    pub fn numel(&self) -> usize {
        self.numel
    }

    /// Size in bytes.
    pub fn nbytes(&self) -> usize {
        match self.data.as_ref() {
            StorageData::Cpu(v) => v.len(),
            #[cfg(feature = "cuda")]
            StorageData::Cuda { buffer, .. } => buffer.len(),
        }
    }

    /// Stable identity address of the underlying allocation.
    ///
    /// Two storages returning the same address alias the same bytes. Valid as
    /// an identity key for as long as any clone of this storage is alive.
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.data) as *const u8 as usize
    }

    /// Whether another storage aliases the same allocation.
    pub fn same_allocation(&self, other: &Storage) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Get a read-only reference to the raw bytes.
    /// Panics if storage is on GPU — transfer to CPU first.
    pub fn as_bytes(&self) -> &[u8] {
        match self.data.as_ref() {
            StorageData::Cpu(v) => v,
            #[cfg(feature = "cuda")]
            StorageData::Cuda { .. } => {
                panic!("cannot access GPU storage as bytes — transfer to CPU first")
            }
        }
    }

    /// Get a mutable reference to the raw bytes (copy-on-write).
    /// Panics if storage is on GPU.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let data = Arc::make_mut(&mut self.data);
        match data {
            StorageData::Cpu(v) => v,
            #[cfg(feature = "cuda")]
            StorageData::Cuda { .. } => {
                panic!("cannot mutate GPU storage as bytes — transfer to CPU first")
            }
        }
    }

    /// Interpret storage as a slice of f32 values.
    /// Returns None if dtype is not F32 or the data lives on the GPU.
    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        if self.dtype != DType::F32 || !self.device.is_cpu() {
            return None;
        }
        Some(bytemuck::cast_slice(self.as_bytes()))
    }

    /// Whether this storage is uniquely owned (no other Arc references).
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.data) == 1
    }

    /// Move this storage to the given device.
    ///
    /// Moving to the current device is a no-op that shares the allocation.
    /// `non_blocking` may let the copy complete after this call returns, but
    /// never after the returned storage is first used.
    pub fn to_device(&self, device: Device, non_blocking: bool) -> Result<Self> {
        let _ = non_blocking; // CPU copies are synchronous
        if self.device == device {
            return Ok(self.clone());
        }
        match device {
            Device::Cpu => self.to_cpu(),
            Device::Cuda(idx) => self.to_cuda(idx),
        }
    }

    #[cfg(feature = "cuda")]
    fn to_cuda(&self, device_idx: usize) -> Result<Self> {
        let host_bytes = self.to_cpu()?;
        let host_bytes = host_bytes.as_bytes();
        let cuda_dev = cudarc::driver::CudaDevice::new(device_idx)
            .map_err(|e| CoreError::DeviceUnavailable(Device::Cuda(device_idx), e.to_string()))?;
        let gpu_buf = cuda_dev
            .htod_copy(host_bytes.to_vec())
            .map_err(|e| CoreError::Storage(format!("H2D copy: {}", e)))?;
        Ok(Self {
            data: Arc::new(StorageData::Cuda {
                device: cuda_dev,
                buffer: Arc::new(gpu_buf),
                device_idx,
            }),
            dtype: self.dtype,
            device: Device::Cuda(device_idx),
            numel: self.numel,
        })
    }

    #[cfg(not(feature = "cuda"))]
    fn to_cuda(&self, device_idx: usize) -> Result<Self> {
        Err(CoreError::DeviceUnavailable(
            Device::Cuda(device_idx),
            "built without the `cuda` feature".into(),
        ))
    }

    #[cfg(feature = "cuda")]
    fn to_cpu(&self) -> Result<Self> {
        match self.data.as_ref() {
            StorageData::Cpu(_) => Ok(self.clone()),
            StorageData::Cuda { device, buffer, .. } => {
                let host_data: Vec<u8> = device
                    .dtoh_sync_copy(buffer.as_ref())
                    .map_err(|e| CoreError::Storage(format!("D2H copy: {}", e)))?;
                Ok(Self {
                    data: Arc::new(StorageData::Cpu(host_data)),
                    dtype: self.dtype,
                    device: Device::Cpu,
                    numel: self.numel,
                })
            }
        }
    }

    #[cfg(not(feature = "cuda"))]
    fn to_cpu(&self) -> Result<Self> {
        Ok(self.clone())
    }
}
