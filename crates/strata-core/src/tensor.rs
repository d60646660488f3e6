use crate::{CoreError, DType, Device, Result, Storage};

/// An n-dimensional tensor: shape and dtype metadata plus optional storage.
///
/// A tensor without storage is a *meta placeholder*: it remembers its shape
/// and dtype but owns no bytes. Offloaded parameters rest as meta tensors
/// between forward passes; materialization swaps a real tensor back in.
#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Vec<usize>,
    dtype: DType,
    storage: Option<Storage>,
}

impl Tensor {
    /// Create a zero-filled CPU tensor.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let numel = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            dtype,
            storage: Some(Storage::zeros(dtype, numel)),
        }
    }

    /// Create an F32 CPU tensor from a slice of values.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        Self {
            shape: shape.to_vec(),
            dtype: DType::F32,
            storage: Some(Storage::from_f32(data)),
        }
    }

    /// Create a CPU tensor from raw little-endian bytes.
    pub fn from_le_bytes(dtype: DType, shape: &[usize], bytes: Vec<u8>) -> Result<Self> {
        let numel = shape.iter().product();
        Ok(Self {
            shape: shape.to_vec(),
            dtype,
            storage: Some(Storage::from_bytes(dtype, numel, bytes)?),
        })
    }

    /// Create a meta placeholder: shape/dtype metadata, no allocated memory.
    pub fn meta(shape: &[usize], dtype: DType) -> Self {
        Self {
            shape: shape.to_vec(),
            dtype,
            storage: None,
        }
    }

    /// A meta placeholder with this tensor's shape and dtype.
    pub fn to_meta(&self) -> Self {
        Self::meta(&self.shape, self.dtype)
    }

    /// Whether this tensor is a meta placeholder (no storage).
    pub fn is_meta(&self) -> bool {
        self.storage.is_none()
    }

    /// Tensor dimensions.
    pub fn dims(&self) -> &[usize] {
        &self.shape
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Element dtype.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Device holding the data, or None for meta placeholders.
    pub fn device(&self) -> Option<Device> {
        self.storage.as_ref().map(|s| s.device())
    }

    /// Whether the tensor's data is resident on `device`.
    pub fn is_on(&self, device: Device) -> bool {
        self.device() == Some(device)
    }

    /// The backing storage, if allocated.
    pub fn storage(&self) -> Option<&Storage> {
        self.storage.as_ref()
    }

    /// Identity address of the backing allocation, if any.
    pub fn storage_addr(&self) -> Option<usize> {
        self.storage.as_ref().map(|s| s.addr())
    }

    /// Size of the tensor data in bytes, computed from metadata.
    ///
    /// Valid for meta placeholders too (it is the size the tensor *would*
    /// occupy once materialized).
    pub fn size_bytes(&self) -> usize {
        self.dtype.storage_bytes(self.numel())
    }

    /// Move the tensor to the given device.
    ///
    /// Errors on meta placeholders: there are no bytes to move.
    pub fn to_device(&self, device: Device, non_blocking: bool) -> Result<Self> {
        let storage = self.storage.as_ref().ok_or(CoreError::MetaTensor)?;
        Ok(Self {
            shape: self.shape.clone(),
            dtype: self.dtype,
            storage: Some(storage.to_device(device, non_blocking)?),
        })
    }

    /// Cast the tensor to another dtype.
    ///
    /// Float-to-float casts go through f32. Casting a meta placeholder only
    /// rewrites its metadata. The result stays on the source device.
    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        if dtype == self.dtype {
            return Ok(self.clone());
        }
        if !(self.dtype.is_float() && dtype.is_float()) {
            return Err(CoreError::UnsupportedCast {
                from: self.dtype,
                to: dtype,
            });
        }
        if self.is_meta() {
            return Ok(Self::meta(&self.shape, dtype));
        }
        let device = self.device().unwrap_or_default();
        let values = self.to_f32_vec()?;
        let bytes = f32_to_le_bytes(&values, dtype);
        let cast = Tensor::from_le_bytes(dtype, &self.shape, bytes)?;
        cast.to_device(device, false)
    }

    /// View the data as an f32 slice (F32 dtype, CPU resident only).
    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        self.storage.as_ref().and_then(|s| s.as_f32_slice())
    }

    /// Copy the data out as f32 values, converting from the source dtype.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let storage = self.storage.as_ref().ok_or(CoreError::MetaTensor)?;
        let cpu = storage.to_device(Device::Cpu, false)?;
        let bytes = cpu.as_bytes();
        let values = match self.dtype {
            DType::F32 => bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            DType::F16 => bytes
                .chunks_exact(2)
                .map(|b| half::f16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
                .collect(),
            DType::BF16 => bytes
                .chunks_exact(2)
                .map(|b| half::bf16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
                .collect(),
            DType::F64 => bytes
                .chunks_exact(8)
                .map(|b| {
                    f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32
                })
                .collect(),
            DType::I64 => {
                return Err(CoreError::UnsupportedCast {
                    from: DType::I64,
                    to: DType::F32,
                })
            }
        };
        Ok(values)
    }

    /// Copy the raw data bytes out (little-endian, via CPU).
    pub fn to_le_bytes(&self) -> Result<Vec<u8>> {
        let storage = self.storage.as_ref().ok_or(CoreError::MetaTensor)?;
        let cpu = storage.to_device(Device::Cpu, false)?;
        Ok(cpu.as_bytes().to_vec())
    }
}

fn f32_to_le_bytes(values: &[f32], dtype: DType) -> Vec<u8> {
    match dtype {
        DType::F32 => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        DType::F16 => values
            .iter()
            .flat_map(|v| half::f16::from_f32(*v).to_bits().to_le_bytes())
            .collect(),
        DType::BF16 => values
            .iter()
            .flat_map(|v| half::bf16::from_f32(*v).to_bits().to_le_bytes())
            .collect(),
        DType::F64 => values
            .iter()
            .flat_map(|v| (*v as f64).to_le_bytes())
            .collect(),
        // Callers check float-ness before converting.
        DType::I64 => unreachable!("integer cast rejected earlier"),
    }
}
