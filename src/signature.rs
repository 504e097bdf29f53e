//! Optional dtype/shape validation of emitted tensors.
use crate::error::{Result, SamplerError};
use crate::tensor::{Dtype, Tensor};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Expected dtype and shape of one output tensor.
///
/// `shape` is `None` for unknown rank (compatible with anything); a known
/// rank lists one entry per dimension, `None` marking a wildcard.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: Dtype,
    pub shape: Option<Vec<Option<usize>>>,
}

impl TensorSpec {
    /// Spec with a fully known shape.
    pub fn exact(dtype: Dtype, shape: &[usize]) -> Self {
        Self {
            dtype,
            shape: Some(shape.iter().map(|&d| Some(d)).collect()),
        }
    }

    /// Spec matching any shape of the given dtype.
    pub fn any_shape(dtype: Dtype) -> Self {
        Self { dtype, shape: None }
    }

    fn matches_shape(&self, shape: &[usize]) -> bool {
        match &self.shape {
            None => true,
            Some(dims) => {
                dims.len() == shape.len()
                    && dims
                        .iter()
                        .zip(shape)
                        .all(|(spec, &dim)| spec.map_or(true, |s| s == dim))
            }
        }
    }
}

/// Expected layout of every emitted tensor, metadata slots included.
///
/// The four metadata slots (key, probability, table size, priority) must be
/// present in the signature so that flattened indices line up, but their
/// dtypes and shapes are never compared; validation starts at index 4. This
/// mirrors the behavior consumers already rely on.
pub type Signature = Vec<TensorSpec>;

/// The four leading metadata slots every signature starts with.
pub fn metadata_specs() -> Signature {
    vec![
        TensorSpec::any_shape(Dtype::U64),
        TensorSpec::any_shape(Dtype::F64),
        TensorSpec::any_shape(Dtype::I64),
        TensorSpec::any_shape(Dtype::F64),
    ]
}

/// Which view of the sample is being validated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ValidationMode {
    /// One row at a time; tensors carry no time dimension.
    Timestep,
    /// A whole sample batched along a leading time dimension, which is
    /// stripped before comparing against the signature.
    BatchedTimestep,
    /// A trajectory; tensors are compared as-is.
    Trajectory,
}

/// Validates emitted tensors against the signature, if one was configured.
pub(crate) fn validate_output(
    data: &[Tensor],
    signature: Option<&Signature>,
    table: &str,
    mode: ValidationMode,
) -> Result<()> {
    let Some(signature) = signature else {
        return Ok(());
    };

    if data.len() != signature.len() {
        return Err(SamplerError::invalid_argument(format!(
            "inconsistent number of tensors received from table '{}': specification has {} \
             tensors, but the sampled data has {}; table signature: {}; incoming tensor \
             signature: {}",
            table,
            signature.len(),
            data.len(),
            format_signature(signature),
            format_tensors(data),
        )));
    }

    for (i, (tensor, spec)) in data.iter().zip(signature).enumerate().skip(4) {
        let shape = tensor.shape();
        let compared_shape: &[usize] = match mode {
            ValidationMode::BatchedTimestep => {
                if shape.is_empty() {
                    return Err(SamplerError::invalid_argument(format!(
                        "invalid tensor shape received from table '{}': data[{}] has scalar \
                         shape (no time dimension)",
                        table, i
                    )));
                }
                &shape[1..]
            }
            ValidationMode::Timestep | ValidationMode::Trajectory => shape,
        };

        if tensor.dtype() != spec.dtype || !spec.matches_shape(compared_shape) {
            return Err(SamplerError::invalid_argument(format!(
                "received incompatible tensor at flattened index {} from table '{}': \
                 specification has (dtype, shape): ({}, {}), tensor has (dtype, shape): \
                 ({}, {}); table signature: {}",
                i,
                table,
                spec.dtype,
                format_spec_shape(&spec.shape),
                tensor.dtype(),
                format_shape(compared_shape),
                format_signature(signature),
            )));
        }
    }
    Ok(())
}

fn format_shape(shape: &[usize]) -> String {
    let mut out = String::from("[");
    for (i, dim) in shape.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{}", dim);
    }
    out.push(']');
    out
}

fn format_spec_shape(shape: &Option<Vec<Option<usize>>>) -> String {
    match shape {
        None => "<unknown>".to_string(),
        Some(dims) => {
            let mut out = String::from("[");
            for (i, dim) in dims.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                match dim {
                    Some(d) => {
                        let _ = write!(out, "{}", d);
                    }
                    None => out.push('?'),
                }
            }
            out.push(']');
            out
        }
    }
}

fn format_signature(signature: &Signature) -> String {
    let specs: Vec<String> = signature
        .iter()
        .map(|s| format!("({}, {})", s.dtype, format_spec_shape(&s.shape)))
        .collect();
    format!("[{}]", specs.join(", "))
}

fn format_tensors(data: &[Tensor]) -> String {
    let specs: Vec<String> = data
        .iter()
        .map(|t| format!("({}, {})", t.dtype(), format_shape(t.shape())))
        .collect();
    format!("[{}]", specs.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn f32_tensor(shape: &[usize]) -> Tensor {
        Tensor::F32(ArrayD::from_elem(IxDyn(shape), 0.0))
    }

    fn metadata_tensors(batched: Option<usize>) -> Vec<Tensor> {
        match batched {
            None => vec![
                Tensor::scalar_u64(1),
                Tensor::scalar_f64(0.5),
                Tensor::scalar_i64(10),
                Tensor::scalar_f64(1.0),
            ],
            Some(n) => vec![
                Tensor::broadcast_u64(1, n),
                Tensor::broadcast_f64(0.5, n),
                Tensor::broadcast_i64(10, n),
                Tensor::broadcast_f64(1.0, n),
            ],
        }
    }

    fn signature_with(spec: TensorSpec) -> Signature {
        let mut sig = metadata_specs();
        sig.push(spec);
        sig
    }

    #[test]
    fn no_signature_accepts_anything() {
        let data = vec![f32_tensor(&[3])];
        assert!(validate_output(&data, None, "t", ValidationMode::Trajectory).is_ok());
    }

    #[test]
    fn count_mismatch_is_invalid_argument() {
        let sig = signature_with(TensorSpec::any_shape(Dtype::F32));
        let data = metadata_tensors(None);
        let err =
            validate_output(&data, Some(&sig), "t", ValidationMode::Trajectory).unwrap_err();
        match err {
            SamplerError::InvalidArgument(msg) => {
                assert!(msg.contains("table 't'"), "message was: {}", msg)
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn metadata_slots_are_not_compared() {
        // Deliberately wrong metadata specs; only index 4 onwards counts.
        let mut sig = vec![
            TensorSpec::exact(Dtype::U8, &[9]),
            TensorSpec::exact(Dtype::U8, &[9]),
            TensorSpec::exact(Dtype::U8, &[9]),
            TensorSpec::exact(Dtype::U8, &[9]),
        ];
        sig.push(TensorSpec::exact(Dtype::F32, &[2]));
        let mut data = metadata_tensors(None);
        data.push(f32_tensor(&[2]));
        assert!(validate_output(&data, Some(&sig), "t", ValidationMode::Timestep).is_ok());
    }

    #[test]
    fn wildcard_dims_match_any_size() {
        let sig = signature_with(TensorSpec {
            dtype: Dtype::F32,
            shape: Some(vec![None, Some(4)]),
        });
        let mut data = metadata_tensors(None);
        data.push(f32_tensor(&[7, 4]));
        assert!(validate_output(&data, Some(&sig), "t", ValidationMode::Trajectory).is_ok());
    }

    #[test]
    fn shape_mismatch_names_index_and_table() {
        let sig = signature_with(TensorSpec {
            dtype: Dtype::F32,
            shape: Some(vec![None, Some(4)]),
        });
        let mut data = metadata_tensors(None);
        data.push(f32_tensor(&[7, 5]));
        let err =
            validate_output(&data, Some(&sig), "demo", ValidationMode::Trajectory).unwrap_err();
        match err {
            SamplerError::InvalidArgument(msg) => {
                assert!(msg.contains("flattened index 4"), "message was: {}", msg);
                assert!(msg.contains("table 'demo'"), "message was: {}", msg);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn batched_mode_strips_time_dimension() {
        let sig = signature_with(TensorSpec::exact(Dtype::F32, &[4]));
        let mut data = metadata_tensors(Some(6));
        data.push(f32_tensor(&[6, 4]));
        assert!(
            validate_output(&data, Some(&sig), "t", ValidationMode::BatchedTimestep).is_ok()
        );
        // The same data fails in trajectory mode, where no dimension is
        // stripped.
        let err =
            validate_output(&data, Some(&sig), "t", ValidationMode::Trajectory).unwrap_err();
        assert!(matches!(err, SamplerError::InvalidArgument(_)));
    }

    #[test]
    fn batched_mode_rejects_scalar_data() {
        let sig = signature_with(TensorSpec::any_shape(Dtype::F32));
        let mut data = metadata_tensors(Some(1));
        data.push(Tensor::F32(ArrayD::from_elem(IxDyn(&[]), 0.0)));
        let err = validate_output(&data, Some(&sig), "t", ValidationMode::BatchedTimestep)
            .unwrap_err();
        match err {
            SamplerError::InvalidArgument(msg) => {
                assert!(msg.contains("no time dimension"), "message was: {}", msg)
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn dtype_mismatch_is_rejected() {
        let sig = signature_with(TensorSpec::any_shape(Dtype::I64));
        let mut data = metadata_tensors(None);
        data.push(f32_tensor(&[3]));
        let err =
            validate_output(&data, Some(&sig), "t", ValidationMode::Trajectory).unwrap_err();
        assert!(matches!(err, SamplerError::InvalidArgument(_)));
    }
}
