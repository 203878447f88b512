//! Dequantization chain records
//!
//! A dequantization chain maps a low-precision tensor back to its real range:
//! `output = (convert(data) - shift) * scale`, where the Convert and the
//! Subtract are optional.

use crate::error::Result;
use crate::graph::{ElementType, LptGraph, NodeId, Op, Output, Tensor};

/// Nodes of a dequantization chain found in, or appended to, a graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeQuantizeDequantization {
    /// Low-precision tensor feeding the chain
    pub data: Output,
    pub convert: Option<NodeId>,
    pub subtract: Option<NodeId>,
    pub multiply: Option<NodeId>,
}

impl FakeQuantizeDequantization {
    /// Chain with no matched stage
    pub fn empty(data: Output) -> Self {
        Self {
            data,
            convert: None,
            subtract: None,
            multiply: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.convert.is_none() && self.subtract.is_none() && self.multiply.is_none()
    }

    /// Last node of the chain, or the data when nothing matched
    pub fn tail(&self) -> Output {
        self.multiply
            .or(self.subtract)
            .or(self.convert)
            .map(|node| (node, 0))
            .unwrap_or(self.data)
    }

    /// Constant node holding the shift
    pub fn subtract_constant(&self, graph: &LptGraph) -> Option<NodeId> {
        self.subtract
            .and_then(|subtract| graph.input_node(subtract, 1))
            .filter(|&constant| graph.is_constant(constant))
    }

    /// Constant node holding the scale
    pub fn multiply_constant(&self, graph: &LptGraph) -> Option<NodeId> {
        let multiply = self.multiply?;
        graph.inputs(multiply).into_iter().map(|(source, _)| source).find(|&source| graph.is_constant(source))
    }

    pub fn shift<'g>(&self, graph: &'g LptGraph) -> Option<&'g Tensor> {
        self.subtract_constant(graph).and_then(|constant| graph.constant(constant))
    }

    pub fn scale<'g>(&self, graph: &'g LptGraph) -> Option<&'g Tensor> {
        self.multiply_constant(graph).and_then(|constant| graph.constant(constant))
    }
}

/// Dequantization parameters not yet attached to a graph
#[derive(Debug, Clone, PartialEq)]
pub struct DequantizationValues {
    /// Real type the chain restores
    pub original_type: ElementType,
    /// Low precision the chain starts from
    pub precision: ElementType,
    pub shift: Option<Tensor>,
    pub scale: Tensor,
}

impl DequantizationValues {
    /// Append `Convert -> [Subtract] -> Multiply` after `data`
    ///
    /// The Convert is only emitted with `with_convert`; node names are
    /// derived from `name`.
    pub fn materialize(
        &self,
        graph: &mut LptGraph,
        data: Output,
        name: &str,
        with_convert: bool,
    ) -> Result<FakeQuantizeDequantization> {
        let mut chain = FakeQuantizeDequantization::empty(data);
        let mut parent = data;

        if with_convert {
            let convert = graph
                .add_op(Op::Convert {
                    destination: self.original_type,
                })
                .name(format!("{}_Convert", name))
                .input(parent.0, parent.1, 0)
                .finish()?;
            chain.convert = Some(convert);
            parent = (convert, 0);
        }

        if let Some(shift) = &self.shift {
            let shift = graph.add_op(Op::Constant(shift.clone())).finish()?;
            let subtract = graph
                .add_op(Op::Subtract)
                .name(format!("{}_Subtract", name))
                .input(parent.0, parent.1, 0)
                .input(shift, 0, 1)
                .finish()?;
            chain.subtract = Some(subtract);
            parent = (subtract, 0);
        }

        let scale = graph.add_op(Op::Constant(self.scale.clone())).finish()?;
        let multiply = graph
            .add_op(Op::Multiply)
            .name(format!("{}_Multiply", name))
            .input(parent.0, parent.1, 0)
            .input(scale, 0, 1)
            .finish()?;
        chain.multiply = Some(multiply);

        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_materialize_full_chain() {
        let mut graph = LptGraph::new();
        let input = graph
            .add_op(Op::Parameter)
            .name("q")
            .output(ElementType::U8, vec![1, 2])
            .finish()
            .unwrap();
        let values = DequantizationValues {
            original_type: ElementType::F32,
            precision: ElementType::U8,
            shift: Some(Tensor::scalar(ElementType::F32, 128.0)),
            scale: Tensor::scalar(ElementType::F32, 0.01),
        };

        let chain = values.materialize(&mut graph, (input, 0), "q", true).unwrap();

        let convert = chain.convert.unwrap();
        assert_eq!(graph.name(convert), "q_Convert");
        assert_eq!(graph.element_type(convert), Some(ElementType::F32));
        assert_eq!(graph.name(chain.subtract.unwrap()), "q_Subtract");
        assert_eq!(chain.tail(), (chain.multiply.unwrap(), 0));
        assert_eq!(chain.shift(&graph).and_then(Tensor::first), Some(128.0));
        assert_eq!(chain.scale(&graph).and_then(Tensor::first), Some(0.01));
    }

    #[test]
    fn test_materialize_without_convert_or_shift() {
        let mut graph = LptGraph::new();
        let input = graph
            .add_op(Op::Parameter)
            .output(ElementType::F32, vec![4])
            .finish()
            .unwrap();
        let values = DequantizationValues {
            original_type: ElementType::F32,
            precision: ElementType::U8,
            shift: None,
            scale: Tensor::scalar(ElementType::F32, 0.5),
        };

        let chain = values.materialize(&mut graph, (input, 0), "x", false).unwrap();
        assert!(chain.convert.is_none());
        assert!(chain.subtract.is_none());
        assert_eq!(graph.input(chain.multiply.unwrap(), 0), Some((input, 0)));
        assert!(FakeQuantizeDequantization::empty((input, 0)).is_empty());
    }
}
