use tch::{Device, Kind, Tensor};

#[cfg(debug_assertions)]
pub fn validate_tensor(tensor: &Tensor, expected_dims: &[i64], name: &str) {
    let actual_dims = tensor.size();
    assert_eq!(
        actual_dims.len(),
        expected_dims.len(),
        "{} has {} dimensions, expected {}",
        name,
        actual_dims.len(),
        expected_dims.len()
    );

    for (i, (&actual, &expected)) in actual_dims.iter().zip(expected_dims.iter()).enumerate() {
        assert_eq!(
            actual,
            expected,
            "{} dimension {} is {}, expected {}",
            name,
            i,
            actual,
            expected
        );
    }

    assert!(tensor.is_contiguous(), "{} must be contiguous", name);
}

#[cfg(not(debug_assertions))]
pub fn validate_tensor(_tensor: &Tensor, _expected_dims: &[i64], _name: &str) {
    // Shape checks are debug-only; the kernels trust their callers in release
}

#[cfg(debug_assertions)]
pub fn validate_tensor_type(tensor: &Tensor, expected_kind: Kind, name: &str) {
    assert_eq!(tensor.kind(), expected_kind, "{name}: Expected tensor kind `{:?}`, got `{:?}`", expected_kind, tensor.kind());
}

#[cfg(not(debug_assertions))]
pub fn validate_tensor_type(_tensor: &Tensor, _expected_kind: Kind, _name: &str) {
    // Kind checks are debug-only; the kernels trust their callers in release
}

/// Copies a tensor of any shape into a flat `Vec<f32>`, converting kind and
/// device as needed. The CPU kernels operate on these flat buffers.
pub fn to_vec_f32(tensor: &Tensor) -> Vec<f32> {
    let flat = tensor
        .contiguous()
        .to_device(Device::Cpu)
        .to_kind(Kind::Float)
        .view(-1);
    let numel = flat.numel();
    let mut out = vec![0f32; numel];
    flat.copy_data(&mut out, numel);
    out
}

pub fn to_vec_i64(tensor: &Tensor) -> Vec<i64> {
    let flat = tensor
        .contiguous()
        .to_device(Device::Cpu)
        .to_kind(Kind::Int64)
        .view(-1);
    let numel = flat.numel();
    let mut out = vec![0i64; numel];
    flat.copy_data(&mut out, numel);
    out
}

pub fn to_vec_bool(tensor: &Tensor) -> Vec<bool> {
    let flat = tensor
        .contiguous()
        .to_device(Device::Cpu)
        .to_kind(Kind::Bool)
        .view(-1);
    let numel = flat.numel();
    let mut out = vec![false; numel];
    flat.copy_data(&mut out, numel);
    out
}

/// Rebuilds a tensor from a flat kernel buffer on the requested device.
pub fn from_vec_f32(data: &[f32], shape: &[i64], device: Device) -> Tensor {
    Tensor::from_slice(data).view(shape).to_device(device)
}

pub fn from_vec_i64(data: &[i64], shape: &[i64], device: Device) -> Tensor {
    Tensor::from_slice(data).view(shape).to_device(device)
}

pub fn from_vec_bool(data: &[bool], shape: &[i64], device: Device) -> Tensor {
    Tensor::from_slice(data).view(shape).to_device(device)
}
