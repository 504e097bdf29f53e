//! Dense tensor values exchanged between the engine and its consumers.
//!
//! The engine assembles trajectories out of row-major [`ndarray`] storage. A
//! [`Tensor`] owns its data; slicing helpers copy the selected rows so that a
//! consumer never aliases the chunk buffers a sample was assembled from.
use crate::error::{Result, SamplerError};
use ndarray::{concatenate, ArrayD, Axis, IxDyn, Slice};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Element types supported on the wire and in assembled samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dtype {
    U8,
    I32,
    I64,
    U64,
    F32,
    F64,
}

impl Dtype {
    /// Size of one element in bytes.
    pub fn size_of(self) -> usize {
        match self {
            Dtype::U8 => 1,
            Dtype::I32 | Dtype::F32 => 4,
            Dtype::I64 | Dtype::U64 | Dtype::F64 => 8,
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dtype::U8 => "u8",
            Dtype::I32 => "i32",
            Dtype::I64 => "i64",
            Dtype::U64 => "u64",
            Dtype::F32 => "f32",
            Dtype::F64 => "f64",
        };
        write!(f, "{}", name)
    }
}

/// An owned dense array with dynamic rank and one of the supported dtypes.
#[derive(Clone, Debug, PartialEq)]
pub enum Tensor {
    U8(ArrayD<u8>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
    U64(ArrayD<u64>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
}

/// Applies `$body` to the wrapped array regardless of dtype.
macro_rules! with_array {
    ($tensor:expr, $arr:ident => $body:expr) => {
        match $tensor {
            Tensor::U8($arr) => $body,
            Tensor::I32($arr) => $body,
            Tensor::I64($arr) => $body,
            Tensor::U64($arr) => $body,
            Tensor::F32($arr) => $body,
            Tensor::F64($arr) => $body,
        }
    };
}

/// Applies `$body` to the wrapped array and rewraps the result in the same
/// dtype variant.
macro_rules! map_array {
    ($tensor:expr, $arr:ident => $body:expr) => {
        match $tensor {
            Tensor::U8($arr) => Tensor::U8($body),
            Tensor::I32($arr) => Tensor::I32($body),
            Tensor::I64($arr) => Tensor::I64($body),
            Tensor::U64($arr) => Tensor::U64($body),
            Tensor::F32($arr) => Tensor::F32($body),
            Tensor::F64($arr) => Tensor::F64($body),
        }
    };
}

impl Tensor {
    pub fn dtype(&self) -> Dtype {
        match self {
            Tensor::U8(_) => Dtype::U8,
            Tensor::I32(_) => Dtype::I32,
            Tensor::I64(_) => Dtype::I64,
            Tensor::U64(_) => Dtype::U64,
            Tensor::F32(_) => Dtype::F32,
            Tensor::F64(_) => Dtype::F64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        with_array!(self, a => a.shape())
    }

    pub fn num_elements(&self) -> usize {
        with_array!(self, a => a.len())
    }

    /// Leading dimension, or `None` for a rank-0 tensor.
    pub fn leading_dim(&self) -> Option<usize> {
        self.shape().first().copied()
    }

    /// Rank-0 tensor holding a single `u64`.
    pub fn scalar_u64(value: u64) -> Self {
        Tensor::U64(ArrayD::from_elem(IxDyn(&[]), value))
    }

    /// Rank-0 tensor holding a single `i64`.
    pub fn scalar_i64(value: i64) -> Self {
        Tensor::I64(ArrayD::from_elem(IxDyn(&[]), value))
    }

    /// Rank-0 tensor holding a single `f64`.
    pub fn scalar_f64(value: f64) -> Self {
        Tensor::F64(ArrayD::from_elem(IxDyn(&[]), value))
    }

    /// Rank-1 tensor of length `len`, every element set to `value`.
    pub fn broadcast_u64(value: u64, len: usize) -> Self {
        Tensor::U64(ArrayD::from_elem(IxDyn(&[len]), value))
    }

    /// Rank-1 tensor of length `len`, every element set to `value`.
    pub fn broadcast_i64(value: i64, len: usize) -> Self {
        Tensor::I64(ArrayD::from_elem(IxDyn(&[len]), value))
    }

    /// Rank-1 tensor of length `len`, every element set to `value`.
    pub fn broadcast_f64(value: f64, len: usize) -> Self {
        Tensor::F64(ArrayD::from_elem(IxDyn(&[len]), value))
    }

    /// Owned copy of the rows in `range` along the leading axis.
    pub fn slice_rows(&self, range: Range<usize>) -> Tensor {
        map_array!(self, a => a
            .slice_axis(Axis(0), Slice::from(range.clone()))
            .to_owned())
    }

    /// Owned copy of row `index`, with the leading axis dropped.
    pub fn row(&self, index: usize) -> Tensor {
        map_array!(self, a => a.index_axis(Axis(0), index).to_owned())
    }

    /// Drops a unit leading dimension.
    pub fn squeeze_leading(&self) -> Result<Tensor> {
        match self.leading_dim() {
            Some(1) => Ok(map_array!(self, a => a.index_axis(Axis(0), 0).to_owned())),
            Some(n) => Err(SamplerError::internal(format!(
                "tried to squeeze column with batch size {}",
                n
            ))),
            None => Err(SamplerError::internal(
                "tried to squeeze a scalar tensor".to_string(),
            )),
        }
    }

    /// Concatenates `parts` along the leading axis.
    ///
    /// All parts must share dtype and trailing shape.
    pub fn concat_rows(parts: &[Tensor]) -> Result<Tensor> {
        macro_rules! concat_as {
            ($variant:ident) => {{
                let mut views = Vec::with_capacity(parts.len());
                for part in parts {
                    match part {
                        Tensor::$variant(a) => views.push(a.view()),
                        other => {
                            return Err(SamplerError::internal(format!(
                                "cannot concatenate {} tensor with {} tensor",
                                parts[0].dtype(),
                                other.dtype()
                            )))
                        }
                    }
                }
                concatenate(Axis(0), &views)
                    .map(Tensor::$variant)
                    .map_err(|e| {
                        SamplerError::internal(format!("tensor concatenation failed: {}", e))
                    })
            }};
        }

        match parts.first() {
            None => Err(SamplerError::internal(
                "cannot concatenate an empty tensor list".to_string(),
            )),
            Some(Tensor::U8(_)) => concat_as!(U8),
            Some(Tensor::I32(_)) => concat_as!(I32),
            Some(Tensor::I64(_)) => concat_as!(I64),
            Some(Tensor::U64(_)) => concat_as!(U64),
            Some(Tensor::F32(_)) => concat_as!(F32),
            Some(Tensor::F64(_)) => concat_as!(F64),
        }
    }

    /// Replaces every row past the first with its difference from the
    /// previous row. Inverse of [`Tensor::delta_decode`].
    pub fn delta_encode(&mut self) {
        with_array!(self, a => delta_encode_array(a))
    }

    /// Running sum along the leading axis, undoing [`Tensor::delta_encode`].
    pub fn delta_decode(&mut self) {
        with_array!(self, a => delta_decode_array(a))
    }
}

/// Element arithmetic for the delta transform. Integer types wrap so the
/// transform is lossless for any input.
trait DeltaElem: Copy {
    fn delta_add(self, other: Self) -> Self;
    fn delta_sub(self, other: Self) -> Self;
}

macro_rules! delta_elem_int {
    ($($ty:ty),+) => {
        $(impl DeltaElem for $ty {
            fn delta_add(self, other: Self) -> Self {
                self.wrapping_add(other)
            }
            fn delta_sub(self, other: Self) -> Self {
                self.wrapping_sub(other)
            }
        })+
    };
}

macro_rules! delta_elem_float {
    ($($ty:ty),+) => {
        $(impl DeltaElem for $ty {
            fn delta_add(self, other: Self) -> Self {
                self + other
            }
            fn delta_sub(self, other: Self) -> Self {
                self - other
            }
        })+
    };
}

delta_elem_int!(u8, i32, i64, u64);
delta_elem_float!(f32, f64);

fn delta_encode_array<T: DeltaElem>(a: &mut ArrayD<T>) {
    if a.ndim() == 0 {
        return;
    }
    for i in (1..a.shape()[0]).rev() {
        let prev = a.index_axis(Axis(0), i - 1).to_owned();
        let mut row = a.index_axis_mut(Axis(0), i);
        row.zip_mut_with(&prev, |r, &p| *r = r.delta_sub(p));
    }
}

fn delta_decode_array<T: DeltaElem>(a: &mut ArrayD<T>) {
    if a.ndim() == 0 {
        return;
    }
    a.accumulate_axis_inplace(Axis(0), |&prev, cur| *cur = cur.delta_add(prev));
}

/// A tensor packed for transmission: dtype, shape and little-endian payload.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedTensor {
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

macro_rules! encode_as {
    ($arr:expr, $dtype:expr) => {{
        let mut data = Vec::with_capacity($arr.len() * $dtype.size_of());
        for v in $arr.iter() {
            data.extend_from_slice(&v.to_le_bytes());
        }
        EncodedTensor {
            dtype: $dtype,
            shape: $arr.shape().to_vec(),
            data,
        }
    }};
}

macro_rules! decode_as {
    ($this:expr, $ty:ty, $variant:ident) => {{
        const WIDTH: usize = std::mem::size_of::<$ty>();
        let values: Vec<$ty> = $this
            .data
            .chunks_exact(WIDTH)
            .map(|c| {
                let mut buf = [0u8; WIDTH];
                buf.copy_from_slice(c);
                <$ty>::from_le_bytes(buf)
            })
            .collect();
        ArrayD::from_shape_vec(IxDyn(&$this.shape), values)
            .map(Tensor::$variant)
            .map_err(|e| SamplerError::internal(format!("malformed tensor payload: {}", e)))
    }};
}

impl EncodedTensor {
    /// Packs a tensor for transmission.
    pub fn encode(tensor: &Tensor) -> EncodedTensor {
        match tensor {
            Tensor::U8(a) => encode_as!(a, Dtype::U8),
            Tensor::I32(a) => encode_as!(a, Dtype::I32),
            Tensor::I64(a) => encode_as!(a, Dtype::I64),
            Tensor::U64(a) => encode_as!(a, Dtype::U64),
            Tensor::F32(a) => encode_as!(a, Dtype::F32),
            Tensor::F64(a) => encode_as!(a, Dtype::F64),
        }
    }

    /// Unpacks the payload, validating its length against dtype and shape.
    pub fn decode(&self) -> Result<Tensor> {
        let elements: usize = self.shape.iter().product();
        let expected = elements * self.dtype.size_of();
        if self.data.len() != expected {
            return Err(SamplerError::internal(format!(
                "tensor payload holds {} bytes but dtype {} with shape {:?} requires {}",
                self.data.len(),
                self.dtype,
                self.shape,
                expected
            )));
        }
        match self.dtype {
            Dtype::U8 => decode_as!(self, u8, U8),
            Dtype::I32 => decode_as!(self, i32, I32),
            Dtype::I64 => decode_as!(self, i64, I64),
            Dtype::U64 => decode_as!(self, u64, U64),
            Dtype::F32 => decode_as!(self, f32, F32),
            Dtype::F64 => decode_as!(self, f64, F64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::{Rng, SeedableRng};

    fn f32_rows(rows: &[[f32; 2]]) -> Tensor {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::F32(
            ArrayD::from_shape_vec(IxDyn(&[rows.len(), 2]), flat).expect("valid test shape"),
        )
    }

    #[test]
    fn slice_and_row() {
        let t = f32_rows(&[[0., 1.], [2., 3.], [4., 5.]]);
        assert_eq!(t.slice_rows(1..3), f32_rows(&[[2., 3.], [4., 5.]]));
        assert_eq!(t.row(1), Tensor::F32(array![2.0_f32, 3.0].into_dyn()));
    }

    #[test]
    fn concat_restores_order() {
        let a = f32_rows(&[[0., 1.]]);
        let b = f32_rows(&[[2., 3.], [4., 5.]]);
        let c = Tensor::concat_rows(&[a, b]).unwrap();
        assert_eq!(c, f32_rows(&[[0., 1.], [2., 3.], [4., 5.]]));
    }

    #[test]
    fn concat_rejects_mixed_dtypes() {
        let a = f32_rows(&[[0., 1.]]);
        let b = Tensor::I64(array![[1_i64, 2]].into_dyn());
        let err = Tensor::concat_rows(&[a, b]).unwrap_err();
        assert!(matches!(err, SamplerError::Internal(_)));
    }

    #[test]
    fn delta_roundtrip_is_lossless() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let values: Vec<i64> = (0..24).map(|_| rng.gen_range(-1000..1000)).collect();
        let original = Tensor::I64(
            ArrayD::from_shape_vec(IxDyn(&[6, 4]), values).expect("valid test shape"),
        );
        let mut t = original.clone();
        t.delta_encode();
        assert_ne!(t, original);
        t.delta_decode();
        assert_eq!(t, original);
    }

    #[test]
    fn delta_encode_wraps_unsigned() {
        let mut t = Tensor::U8(array![[10_u8], [5], [250]].into_dyn());
        t.delta_encode();
        assert_eq!(t, Tensor::U8(array![[10_u8], [251], [245]].into_dyn()));
        t.delta_decode();
        assert_eq!(t, Tensor::U8(array![[10_u8], [5], [250]].into_dyn()));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let t = f32_rows(&[[1.5, -2.5], [0.25, 8.0]]);
        let encoded = EncodedTensor::encode(&t);
        assert_eq!(encoded.dtype, Dtype::F32);
        assert_eq!(encoded.shape, vec![2, 2]);
        assert_eq!(encoded.decode().unwrap(), t);
    }

    #[test]
    fn decode_rejects_short_payload() {
        let mut encoded = EncodedTensor::encode(&f32_rows(&[[1.0, 2.0]]));
        encoded.data.pop();
        let err = encoded.decode().unwrap_err();
        assert!(matches!(err, SamplerError::Internal(_)));
    }

    #[test]
    fn squeeze_requires_unit_batch() {
        let ok = f32_rows(&[[1., 2.]]).squeeze_leading().unwrap();
        assert_eq!(ok.shape(), &[2]);
        let err = f32_rows(&[[1., 2.], [3., 4.]])
            .squeeze_leading()
            .unwrap_err();
        assert!(matches!(err, SamplerError::Internal(_)));
    }

    #[test]
    fn scalar_and_broadcast_metadata() {
        assert_eq!(Tensor::scalar_u64(3).shape(), &[] as &[usize]);
        let b = Tensor::broadcast_f64(0.5, 4);
        assert_eq!(b.shape(), &[4]);
        assert_eq!(b, Tensor::F64(array![0.5, 0.5, 0.5, 0.5].into_dyn()));
    }
}
