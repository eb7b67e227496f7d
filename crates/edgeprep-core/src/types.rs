//! Core types for tensors, parameters, attributes and packed parameter contexts.

use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;

/// Operator attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Int(i64),
    Float(f32),
    Ints(Vec<i64>),
    Bool(bool),
    String(String),
}

impl AttributeValue {
    /// Get the value as a float, widening integers.
    pub fn as_float(&self) -> Option<f32> {
        match self {
            AttributeValue::Float(v) => Some(*v),
            AttributeValue::Int(v) => Some(*v as f32),
            _ => None,
        }
    }

    /// Get the value as a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the value as a string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Int(v) => write!(f, "{}", v),
            AttributeValue::Float(v) => write!(f, "{}", v),
            AttributeValue::Ints(v) => write!(f, "{:?}", v),
            AttributeValue::Bool(v) => write!(f, "{}", v),
            AttributeValue::String(v) => write!(f, "{}", v),
        }
    }
}

/// Physical memory layout of a tensor's data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MemoryFormat {
    /// Row-major layout matching the logical shape (NCHW for 4-D tensors).
    #[default]
    Contiguous,

    /// NHWC physical layout for 4-D tensors; the logical shape stays NCHW.
    ChannelsLast,
}

impl MemoryFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryFormat::Contiguous => "contiguous",
            MemoryFormat::ChannelsLast => "channels_last",
        }
    }
}

/// A dense `f32` tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    /// Logical shape.
    pub shape: Vec<usize>,

    /// Element data in the physical order given by `memory_format`.
    pub data: Vec<f32>,

    /// Physical layout of `data`.
    pub memory_format: MemoryFormat,
}

impl Tensor {
    /// Create a contiguous tensor, checking that `data` matches `shape`.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(Error::Shape(format!(
                "shape {:?} requires {} elements, got {}",
                shape,
                numel,
                data.len()
            )));
        }
        Ok(Self {
            shape,
            data,
            memory_format: MemoryFormat::Contiguous,
        })
    }

    /// Create a contiguous tensor filled with zeros.
    pub fn zeros(shape: Vec<usize>) -> Self {
        let numel = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; numel],
            memory_format: MemoryFormat::Contiguous,
        }
    }

    /// Create a contiguous tensor filled with `value`.
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let numel = shape.iter().product();
        Self {
            shape,
            data: vec![value; numel],
            memory_format: MemoryFormat::Contiguous,
        }
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Check if the data is stored channels-last.
    pub fn is_channels_last(&self) -> bool {
        self.memory_format == MemoryFormat::ChannelsLast
    }

    /// Fail if the public fields were edited so that data no longer fits shape.
    fn check_len(&self) -> Result<()> {
        let expected: usize = self.shape.iter().product();
        if self.data.len() != expected {
            return Err(Error::Shape(format!(
                "shape {:?} expects {} elements, got {}",
                self.shape,
                expected,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Return a copy of this 4-D tensor with NHWC physical layout.
    ///
    /// Tensors that are already channels-last are returned unchanged.
    pub fn to_channels_last(&self) -> Result<Tensor> {
        if self.is_channels_last() {
            return Ok(self.clone());
        }
        let [n, c, h, w] = self.shape[..] else {
            return Err(Error::Shape(format!(
                "channels_last requires a 4-D tensor, got shape {:?}",
                self.shape
            )));
        };
        self.check_len()?;

        let mut data = vec![0.0; self.data.len()];
        for in_n in 0..n {
            for in_c in 0..c {
                for in_h in 0..h {
                    for in_w in 0..w {
                        let src = ((in_n * c + in_c) * h + in_h) * w + in_w;
                        let dst = ((in_n * h + in_h) * w + in_w) * c + in_c;
                        data[dst] = self.data[src];
                    }
                }
            }
        }

        Ok(Tensor {
            shape: self.shape.clone(),
            data,
            memory_format: MemoryFormat::ChannelsLast,
        })
    }

    /// Read the element at a logical NCHW index, honoring the memory format.
    pub fn get4(&self, index: [usize; 4]) -> Result<f32> {
        let [n, c, h, w] = self.shape[..] else {
            return Err(Error::Shape(format!(
                "get4 requires a 4-D tensor, got shape {:?}",
                self.shape
            )));
        };
        self.check_len()?;
        let [i_n, i_c, i_h, i_w] = index;
        if i_n >= n || i_c >= c || i_h >= h || i_w >= w {
            return Err(Error::Shape(format!(
                "index {:?} out of bounds for shape {:?}",
                index, self.shape
            )));
        }
        let offset = match self.memory_format {
            MemoryFormat::Contiguous => ((i_n * c + i_c) * h + i_h) * w + i_w,
            MemoryFormat::ChannelsLast => ((i_n * h + i_h) * w + i_w) * c + i_c,
        };
        Ok(self.data[offset])
    }
}

/// A named module parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub value: Tensor,
    pub requires_grad: bool,
}

impl Parameter {
    /// Create a trainable parameter (gradient tracking enabled).
    pub fn new(value: Tensor) -> Self {
        Self {
            value,
            requires_grad: true,
        }
    }

    /// Create a parameter with gradient tracking disabled.
    pub fn frozen(value: Tensor) -> Self {
        Self {
            value,
            requires_grad: false,
        }
    }
}

/// Ordered parameter table.
///
/// Iteration follows insertion order; replacing an existing parameter keeps
/// its position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterStore {
    entries: Vec<(String, Parameter)>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a parameter.
    pub fn insert(&mut self, name: impl Into<String>, parameter: Parameter) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = parameter,
            None => self.entries.push((name, parameter)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, p)| p)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.entries
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<Parameter> {
        let index = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(index).1)
    }

    /// Keep only the parameters for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&str, &Parameter) -> bool) {
        self.entries.retain(|(name, param)| keep(name, param));
    }

    /// Iterate over `(name, parameter)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Parameter)> {
        self.entries.iter().map(|(n, p)| (n.as_str(), p))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Parameter)> {
        self.entries.iter_mut().map(|(n, p)| (n.as_str(), p))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return `base` if unused, otherwise `base_1`, `base_2`, ...
    pub fn unique_name(&self, base: &str) -> String {
        if !self.contains(base) {
            return base.to_string();
        }
        (1..)
            .map(|i| format!("{}_{}", base, i))
            .find(|candidate| !self.contains(candidate))
            .unwrap_or_else(|| base.to_string())
    }
}

/// Operator family a packed parameter context was prepared for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackedOp {
    Conv2d,
    Linear,
}

impl PackedOp {
    /// The prepacked run operator consuming this context.
    pub fn run_op_type(&self) -> &'static str {
        match self {
            PackedOp::Conv2d => "prepacked::conv2d_clamp_run",
            PackedOp::Linear => "prepacked::linear_clamp_run",
        }
    }

    /// The operator this context replaces.
    pub fn source_op_type(&self) -> &'static str {
        match self {
            PackedOp::Conv2d => "aten::conv2d",
            PackedOp::Linear => "aten::linear",
        }
    }
}

/// Weights pre-packed at optimization time for a mobile kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedParams {
    pub op: PackedOp,
    pub weight: Tensor,
    pub bias: Option<Tensor>,

    /// Convolution geometry (stride, padding, ...) copied from the source node.
    pub attributes: BTreeMap<String, AttributeValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_shape_mismatch() {
        let err = Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, Error::Shape(_)));
    }

    #[test]
    fn test_channels_last_permutes_data() {
        // N=1, C=2, H=1, W=2
        let t = Tensor::new(vec![1, 2, 1, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let cl = t.to_channels_last().unwrap();

        assert_eq!(cl.shape, vec![1, 2, 1, 2]);
        assert_eq!(cl.data, vec![1.0, 3.0, 2.0, 4.0]);
        assert!(cl.is_channels_last());

        for c in 0..2 {
            for w in 0..2 {
                assert_eq!(t.get4([0, c, 0, w]).unwrap(), cl.get4([0, c, 0, w]).unwrap());
            }
        }
    }

    #[test]
    fn test_channels_last_rejects_non_4d() {
        let t = Tensor::zeros(vec![3, 4]);
        assert!(t.to_channels_last().is_err());
    }

    #[test]
    fn test_data_shorter_than_shape_is_rejected() {
        let mut t = Tensor::zeros(vec![2, 2, 2, 2]);
        t.data.truncate(1);
        assert!(matches!(t.to_channels_last(), Err(Error::Shape(_))));
        assert!(matches!(t.get4([1, 1, 1, 1]), Err(Error::Shape(_))));
    }

    #[test]
    fn test_parameter_store_keeps_insertion_order() {
        let mut store = ParameterStore::new();
        store.insert("b", Parameter::new(Tensor::zeros(vec![1])));
        store.insert("a", Parameter::new(Tensor::zeros(vec![1])));
        store.insert("b", Parameter::frozen(Tensor::zeros(vec![2])));

        let names: Vec<_> = store.names().collect();
        assert_eq!(names, vec!["b", "a"]);
        assert!(!store.get("b").unwrap().requires_grad);
    }

    #[test]
    fn test_unique_name() {
        let mut store = ParameterStore::new();
        assert_eq!(store.unique_name("w"), "w");
        store.insert("w", Parameter::new(Tensor::zeros(vec![1])));
        store.insert("w_1", Parameter::new(Tensor::zeros(vec![1])));
        assert_eq!(store.unique_name("w"), "w_2");
    }
}
