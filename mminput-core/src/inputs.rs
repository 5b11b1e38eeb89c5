use std::ops::{Deref, DerefMut};

use candle_core::{Device, Tensor};
use indexmap::IndexMap;

use crate::error::Result;

/// Flat host buffer produced by a format processor, before it becomes a tensor.
#[derive(Clone, Debug, PartialEq)]
pub enum ArrayData {
    F32(Vec<f32>),
    I64(Vec<i64>),
    U32(Vec<u32>),
}

/// A multi-dimensional numeric array living in host memory.
#[derive(Clone, Debug, PartialEq)]
pub struct HostArray {
    pub data: ArrayData,
    pub shape: Vec<usize>,
}

impl HostArray {
    pub fn f32(data: Vec<f32>, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            data: ArrayData::F32(data),
            shape: shape.into(),
        }
    }

    pub fn i64(data: Vec<i64>, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            data: ArrayData::I64(data),
            shape: shape.into(),
        }
    }

    pub fn u32(data: Vec<u32>, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            data: ArrayData::U32(data),
            shape: shape.into(),
        }
    }

    /// Move the buffer into a CPU tensor without copying it.
    pub fn into_tensor(self) -> Result<Tensor> {
        let Self { data, shape } = self;
        let device = Device::Cpu;
        Ok(match data {
            ArrayData::F32(v) => Tensor::from_vec(v, shape, &device)?,
            ArrayData::I64(v) => Tensor::from_vec(v, shape, &device)?,
            ArrayData::U32(v) => Tensor::from_vec(v, shape, &device)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scalar {
    Int(i64),
    Float(f64),
}

impl Scalar {
    /// Zero-dimensional tensor: I64 for integers, F32 for floats.
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_tensor(self) -> Result<Tensor> {
        Ok(match self {
            Self::Int(v) => Tensor::new(v, &Device::Cpu)?,
            Self::Float(v) => Tensor::new(v as f32, &Device::Cpu)?,
        })
    }
}

/// Uses a list instead of a tensor if the dimensions of each element do not match.
#[derive(Clone, Debug)]
pub enum NestedTensors {
    Tensor(Tensor),
    Array(HostArray),
    Scalar(Scalar),
    List(Vec<NestedTensors>),
}

impl NestedTensors {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[NestedTensors]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Apply `f` to every leaf, turning arrays and scalars into tensors first.
    /// The list structure is preserved.
    pub fn map_leaves<F>(self, f: &mut F) -> Result<Self>
    where
        F: FnMut(Tensor) -> Result<Tensor>,
    {
        Ok(match self {
            Self::Tensor(t) => Self::Tensor(f(t)?),
            Self::Array(a) => Self::Tensor(f(a.into_tensor()?)?),
            Self::Scalar(s) => Self::Tensor(f(s.to_tensor()?)?),
            Self::List(items) => {
                let mut mapped = Vec::with_capacity(items.len());
                for item in items {
                    mapped.push(item.map_leaves(f)?);
                }
                Self::List(mapped)
            }
        })
    }
}

impl From<Tensor> for NestedTensors {
    fn from(value: Tensor) -> Self {
        Self::Tensor(value)
    }
}

impl From<HostArray> for NestedTensors {
    fn from(value: HostArray) -> Self {
        Self::Array(value)
    }
}

impl From<Scalar> for NestedTensors {
    fn from(value: Scalar) -> Self {
        Self::Scalar(value)
    }
}

impl From<i64> for NestedTensors {
    fn from(value: i64) -> Self {
        Self::Scalar(Scalar::Int(value))
    }
}

impl From<f64> for NestedTensors {
    fn from(value: f64) -> Self {
        Self::Scalar(Scalar::Float(value))
    }
}

impl From<Vec<NestedTensors>> for NestedTensors {
    fn from(value: Vec<NestedTensors>) -> Self {
        Self::List(value)
    }
}

/// A dictionary containing nested tensors which have been batched via [`MultiModalInputs::batch`].
pub type BatchedTensorInputs = IndexMap<String, NestedTensors>;

/// The keyword inputs of one request, as produced by an input mapper.
#[derive(Clone, Debug, Default)]
pub struct MultiModalInputs(IndexMap<String, NestedTensors>);

impl MultiModalInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> IndexMap<String, NestedTensors> {
        self.0
    }

    /// Recursively stacks lists of tensors when they all have the same shape.
    ///
    /// Lists whose elements cannot all be reduced to tensors, or whose tensors differ in shape,
    /// dtype or device, come back as lists.
    pub fn try_stack(nested: NestedTensors) -> Result<NestedTensors> {
        let items = match nested {
            NestedTensors::Tensor(t) => return Ok(NestedTensors::Tensor(t)),
            NestedTensors::Array(a) => return Ok(NestedTensors::Tensor(a.into_tensor()?)),
            NestedTensors::Scalar(s) => return Ok(NestedTensors::Tensor(s.to_tensor()?)),
            NestedTensors::List(items) => items,
        };

        let stacked = items
            .into_iter()
            .map(Self::try_stack)
            .collect::<Result<Vec<_>>>()?;
        // Only tensors (not lists) can be stacked.
        let mut tensors = Vec::with_capacity(stacked.len());
        for item in &stacked {
            match item {
                NestedTensors::Tensor(t) => tensors.push(t.clone()),
                _ => return Ok(NestedTensors::List(stacked)),
            }
        }

        let Some(first) = tensors.first() else {
            return Ok(NestedTensors::List(stacked));
        };
        let compatible = tensors.iter().all(|t| {
            t.shape() == first.shape()
                && t.dtype() == first.dtype()
                && t.device().same_device(first.device())
        });
        if !compatible {
            return Ok(NestedTensors::List(stacked));
        }

        Ok(NestedTensors::Tensor(Tensor::stack(&tensors, 0)?))
    }

    /// Batch multiple inputs together into a dictionary.
    ///
    /// The resulting dictionary has the keys of all inputs. If the corresponding value from each
    /// input is a tensor and they all share the same shape, the output value is a single batched
    /// tensor; otherwise, the output value is a list containing the original value from each
    /// input. A key missing from some inputs only collects the values that are present.
    pub fn batch(
        inputs_list: impl IntoIterator<Item = MultiModalInputs>,
    ) -> Result<BatchedTensorInputs> {
        let mut item_lists: IndexMap<String, Vec<NestedTensors>> = IndexMap::new();

        for inputs in inputs_list {
            // Models with several modalities produce different keys per request, so the key
            // sets are not required to match.
            for (k, v) in inputs.0 {
                item_lists.entry(k).or_default().push(v);
            }
        }

        item_lists
            .into_iter()
            .map(|(k, items)| Ok((k, Self::try_stack(NestedTensors::List(items))?)))
            .collect()
    }

    /// Move every tensor in `batched_inputs` to `device`, keeping the nesting intact.
    pub fn as_kwargs(
        batched_inputs: BatchedTensorInputs,
        device: &Device,
    ) -> Result<BatchedTensorInputs> {
        batched_inputs
            .into_iter()
            .map(|(k, v)| {
                let relocated =
                    v.map_leaves(&mut |t: Tensor| -> Result<Tensor> { Ok(t.to_device(device)?) })?;
                Ok((k, relocated))
            })
            .collect()
    }
}

impl Deref for MultiModalInputs {
    type Target = IndexMap<String, NestedTensors>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for MultiModalInputs {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<IndexMap<String, NestedTensors>> for MultiModalInputs {
    fn from(value: IndexMap<String, NestedTensors>) -> Self {
        Self(value)
    }
}

impl<K: Into<String>, V: Into<NestedTensors>> FromIterator<(K, V)> for MultiModalInputs {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl IntoIterator for MultiModalInputs {
    type Item = (String, NestedTensors);
    type IntoIter = indexmap::map::IntoIter<String, NestedTensors>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
