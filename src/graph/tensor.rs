// Element types and constant tensors
//
// Constant values are always held as f32 regardless of the declared element
// type, the same way constant introspection reads them back as floats. The
// element type decides how Convert folds and how values are rounded.

use anyhow::{anyhow, Result};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tensor element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    F32,
    F16,
    I64,
    I32,
    I8,
    U8,
}

impl ElementType {
    pub fn name(&self) -> &'static str {
        match self {
            ElementType::F32 => "f32",
            ElementType::F16 => "f16",
            ElementType::I64 => "i64",
            ElementType::I32 => "i32",
            ElementType::I8 => "i8",
            ElementType::U8 => "u8",
        }
    }

    pub fn is_real(&self) -> bool {
        matches!(self, ElementType::F32 | ElementType::F16)
    }

    pub fn is_integral(&self) -> bool {
        !self.is_real()
    }

    pub fn is_signed(&self) -> bool {
        !matches!(self, ElementType::U8)
    }

    /// Saturation bounds for integral types
    pub fn bounds(&self) -> Option<(f32, f32)> {
        match self {
            ElementType::U8 => Some((0.0, 255.0)),
            ElementType::I8 => Some((-128.0, 127.0)),
            ElementType::I32 => Some((i32::MIN as f32, i32::MAX as f32)),
            ElementType::I64 => Some((i64::MIN as f32, i64::MAX as f32)),
            ElementType::F32 | ElementType::F16 => None,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ElementType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "f32" => Ok(ElementType::F32),
            "f16" => Ok(ElementType::F16),
            "i64" => Ok(ElementType::I64),
            "i32" => Ok(ElementType::I32),
            "i8" => Ok(ElementType::I8),
            "u8" => Ok(ElementType::U8),
            other => Err(anyhow!("Unknown element type: {}", other)),
        }
    }
}

/// Constant tensor value
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    element_type: ElementType,
    values: ArrayD<f32>,
}

impl Tensor {
    pub fn new(element_type: ElementType, values: ArrayD<f32>) -> Self {
        Self { element_type, values }
    }

    /// Rank-0 tensor
    pub fn scalar(element_type: ElementType, value: f32) -> Self {
        Self::new(element_type, ArrayD::from_elem(IxDyn(&[]), value))
    }

    pub fn from_vec(element_type: ElementType, shape: &[usize], data: Vec<f32>) -> Result<Self> {
        let values = ArrayD::from_shape_vec(IxDyn(shape), data)
            .map_err(|e| anyhow!("Invalid constant shape {:?}: {}", shape, e))?;
        Ok(Self::new(element_type, values))
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn shape(&self) -> &[usize] {
        self.values.shape()
    }

    pub fn values(&self) -> &ArrayD<f32> {
        &self.values
    }

    pub fn into_values(self) -> ArrayD<f32> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values in logical (row-major) order
    pub fn to_vec(&self) -> Vec<f32> {
        self.values.iter().copied().collect()
    }

    /// Same values, different declared element type
    pub fn with_element_type(mut self, element_type: ElementType) -> Self {
        self.element_type = element_type;
        self
    }

    /// All elements are bitwise identical
    pub fn is_scalar_like(&self) -> bool {
        let mut iter = self.values.iter();
        match iter.next() {
            Some(first) => iter.all(|v| v.to_bits() == first.to_bits()),
            None => false,
        }
    }

    /// Reduce a scalar-like tensor to rank 0
    pub fn to_scalar(&self) -> Option<Tensor> {
        if !self.is_scalar_like() {
            return None;
        }
        self.values.iter().next().map(|&v| Tensor::scalar(self.element_type, v))
    }

    /// Every element equals `value`
    pub fn is_equal_to(&self, value: f32) -> bool {
        !self.values.is_empty() && self.values.iter().all(|&v| v == value)
    }

    /// First element, if any
    pub fn first(&self) -> Option<f32> {
        self.values.iter().next().copied()
    }
}
