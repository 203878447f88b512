// Elementary constant folding
//
// Broadcasting arithmetic and Convert on constant tensors. These are the
// primitives the low-precision passes fold scales, shifts and limits with.

use super::tensor::{ElementType, Tensor};
use anyhow::{anyhow, Result};
use ndarray::{ArrayD, IxDyn, Zip};

/// Binary elementwise operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl BinaryOp {
    pub fn apply(&self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Subtract => a - b,
            BinaryOp::Multiply => a * b,
            BinaryOp::Divide => a / b,
        }
    }
}

/// Numpy-style broadcast of two shapes
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut result = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        result[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(result)
}

/// Apply `op` elementwise over two broadcast-compatible arrays
pub fn broadcast_binary(a: &ArrayD<f32>, b: &ArrayD<f32>, op: BinaryOp) -> Result<ArrayD<f32>> {
    let shape = broadcast_shape(a.shape(), b.shape())
        .ok_or_else(|| anyhow!("Shapes {:?} and {:?} are not broadcast compatible", a.shape(), b.shape()))?;
    let dim = IxDyn(&shape);
    let lhs = a
        .broadcast(dim.clone())
        .ok_or_else(|| anyhow!("Cannot broadcast {:?} to {:?}", a.shape(), shape))?;
    let rhs = b
        .broadcast(dim)
        .ok_or_else(|| anyhow!("Cannot broadcast {:?} to {:?}", b.shape(), shape))?;
    Ok(Zip::from(&lhs).and(&rhs).map_collect(|&x, &y| op.apply(x, y)))
}

/// Fold a binary op over two constants; the result keeps the left operand's type
pub fn fold_binary(op: BinaryOp, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let values = broadcast_binary(a.values(), b.values(), op)?;
    Ok(Tensor::new(a.element_type(), values))
}

pub fn fold_add(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    fold_binary(BinaryOp::Add, a, b)
}

pub fn fold_subtract(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    fold_binary(BinaryOp::Subtract, a, b)
}

pub fn fold_multiply(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    fold_binary(BinaryOp::Multiply, a, b)
}

pub fn fold_divide(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    fold_binary(BinaryOp::Divide, a, b)
}

/// Convert a single value: truncation toward zero with saturation for integral targets
pub fn convert_value(value: f32, target: ElementType) -> f32 {
    match target.bounds() {
        Some((low, high)) => value.trunc().clamp(low, high),
        None => value,
    }
}

/// Fold a Convert to `target`
pub fn fold_convert(tensor: &Tensor, target: ElementType) -> Tensor {
    Tensor::new(target, tensor.values().mapv(|v| convert_value(v, target)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_shape() {
        assert_eq!(broadcast_shape(&[1, 3, 1, 1], &[]), Some(vec![1, 3, 1, 1]));
        assert_eq!(broadcast_shape(&[2, 3], &[3]), Some(vec![2, 3]));
        assert_eq!(broadcast_shape(&[1, 3, 4, 4], &[1, 3, 1, 1]), Some(vec![1, 3, 4, 4]));
        assert_eq!(broadcast_shape(&[2, 3], &[4]), None);
    }

    #[test]
    fn test_fold_per_channel_divide() {
        let high = Tensor::from_vec(ElementType::F32, &[1, 2, 1, 1], vec![2.55, 5.1]).unwrap();
        let range = Tensor::scalar(ElementType::F32, 255.0);
        let scale = fold_divide(&high, &range).unwrap();
        assert_eq!(scale.shape(), &[1, 2, 1, 1]);
        let values = scale.to_vec();
        assert!((values[0] - 0.01).abs() < 1e-6);
        assert!((values[1] - 0.02).abs() < 1e-6);
    }

    #[test]
    fn test_fold_incompatible_shapes() {
        let a = Tensor::from_vec(ElementType::F32, &[3], vec![1.0, 2.0, 3.0]).unwrap();
        let b = Tensor::from_vec(ElementType::F32, &[2], vec![1.0, 2.0]).unwrap();
        assert!(fold_add(&a, &b).is_err());
    }

    #[test]
    fn test_convert_truncates_and_saturates() {
        let t = Tensor::from_vec(ElementType::F32, &[4], vec![2.9, -1.7, 300.0, 127.5]).unwrap();
        assert_eq!(fold_convert(&t, ElementType::U8).to_vec(), vec![2.0, 0.0, 255.0, 127.0]);
        assert_eq!(fold_convert(&t, ElementType::I8).to_vec(), vec![2.0, -1.0, 127.0, 127.0]);
        assert_eq!(fold_convert(&t, ElementType::F32).to_vec(), t.to_vec());
    }
}
