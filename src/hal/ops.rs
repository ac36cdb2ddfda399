use std::borrow::Cow;

use derive_more::Display;
use weft_derive::Operands;

use crate::loom::{
    error::{DTypeMismatchError, EngineError, ShapeMismatchError, UnsupportedFeatureError},
    num::DataType,
    ops::{Operand, Operands, TensorOp},
    shape::Shape,
    tensor::{Tensor, TensorInfo},
};

fn reject_bool(operand: &str, tensor: &Tensor) -> Result<(), EngineError> {
    match tensor.data_type() {
        DataType::Bool => {
            let err = DTypeMismatchError::new(operand, "float32 or int32", DataType::Bool);
            Err(err.into())
        }
        _ => Ok(()),
    }
}

fn expect_type(operand: &str, tensor: &Tensor, r#type: DataType) -> Result<(), EngineError> {
    match tensor.data_type() {
        x if x == r#type => Ok(()),
        x => Err(DTypeMismatchError::new(operand, r#type, x).into()),
    }
}

/// Only the last axis is supported by reductions over an axis.
fn check_last_axis(op: &str, x: &Tensor, axis: Option<usize>) -> Result<(), EngineError> {
    let rank = x.rank();
    if rank == 0 {
        let op = op.to_string();
        return Err(UnsupportedFeatureError::Axis { op, axis: 0, rank }.into());
    }
    match axis {
        Some(axis) if axis != rank - 1 => {
            let op = op.to_string();
            Err(UnsupportedFeatureError::Axis { op, axis, rank }.into())
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BinaryKind {
    #[display("add")]
    Add,
    #[display("sub")]
    Sub,
    #[display("mul")]
    Mul,
    #[display("div")]
    Div,
    #[display("pow")]
    Pow,
    #[display("maximum")]
    Maximum,
    #[display("minimum")]
    Minimum,
    #[display("equal")]
    Equal,
    #[display("greater")]
    Greater,
    #[display("less")]
    Less,
}

impl BinaryKind {
    pub const ALL: [BinaryKind; 10] = [
        BinaryKind::Add,
        BinaryKind::Sub,
        BinaryKind::Mul,
        BinaryKind::Div,
        BinaryKind::Pow,
        BinaryKind::Maximum,
        BinaryKind::Minimum,
        BinaryKind::Equal,
        BinaryKind::Greater,
        BinaryKind::Less,
    ];

    #[inline]
    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinaryKind::Add | BinaryKind::Sub | BinaryKind::Mul | BinaryKind::Div | BinaryKind::Pow
        )
    }

    #[inline]
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryKind::Equal | BinaryKind::Greater | BinaryKind::Less
        )
    }
}

/// An element-wise op on two operands that broadcast against each other.
#[derive(Debug, Clone)]
pub struct BinaryOp {
    pub kind: BinaryKind,
    pub a: Tensor,
    pub b: Tensor,
}

impl Operands for BinaryOp {
    fn name(&self) -> Cow<'static, str> {
        self.kind.to_string().into()
    }

    fn operands(&self) -> Vec<Operand<'_>> {
        vec![
            Operand {
                name: "a",
                tensor: &self.a,
            },
            Operand {
                name: "b",
                tensor: &self.b,
            },
        ]
    }
}

impl TensorOp for BinaryOp {
    fn infer(&self) -> Result<Vec<TensorInfo>, EngineError> {
        let (a, b) = (self.a.data_type(), self.b.data_type());
        if self.kind.is_arithmetic() {
            reject_bool("a", &self.a)?;
            reject_bool("b", &self.b)?;
        }
        match (self.kind, a, b) {
            // float base with an integer exponent is fine; the reverse is not
            (BinaryKind::Pow, DataType::F32, DataType::I32) => {}
            (_, a, b) if a != b => return Err(DTypeMismatchError::new("b", a, b).into()),
            _ => {}
        }

        let shape = self.a.shape().broadcast(self.b.shape()).ok_or_else(|| {
            let expected = format!("a shape broadcastable with {}", self.a.shape());
            ShapeMismatchError::new("b", expected, self.b.shape())
        })?;
        let r#type = match self.kind {
            BinaryKind::Div => DataType::F32,
            kind if kind.is_comparison() => DataType::Bool,
            _ => a,
        };
        Ok(vec![TensorInfo::new(shape, r#type)])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UnaryKind {
    #[display("neg")]
    Neg,
    #[display("abs")]
    Abs,
    #[display("exp")]
    Exp,
    #[display("log")]
    Log,
    #[display("sqrt")]
    Sqrt,
    #[display("square")]
    Square,
    #[display("relu")]
    Relu,
    #[display("sigmoid")]
    Sigmoid,
    #[display("tanh")]
    Tanh,
}

impl UnaryKind {
    pub const ALL: [UnaryKind; 9] = [
        UnaryKind::Neg,
        UnaryKind::Abs,
        UnaryKind::Exp,
        UnaryKind::Log,
        UnaryKind::Sqrt,
        UnaryKind::Square,
        UnaryKind::Relu,
        UnaryKind::Sigmoid,
        UnaryKind::Tanh,
    ];

    /// Whether the result is always a float, whatever the input type.
    #[inline]
    pub fn is_transcendental(self) -> bool {
        matches!(
            self,
            UnaryKind::Exp | UnaryKind::Log | UnaryKind::Sqrt | UnaryKind::Sigmoid | UnaryKind::Tanh
        )
    }
}

#[derive(Debug, Clone)]
pub struct UnaryOp {
    pub kind: UnaryKind,
    pub x: Tensor,
}

impl Operands for UnaryOp {
    fn name(&self) -> Cow<'static, str> {
        self.kind.to_string().into()
    }

    fn operands(&self) -> Vec<Operand<'_>> {
        vec![Operand {
            name: "x",
            tensor: &self.x,
        }]
    }
}

impl TensorOp for UnaryOp {
    fn infer(&self) -> Result<Vec<TensorInfo>, EngineError> {
        reject_bool("x", &self.x)?;
        let r#type = match self.kind.is_transcendental() {
            true => DataType::F32,
            false => self.x.data_type(),
        };
        Ok(vec![TensorInfo::new(self.x.shape(), r#type)])
    }
}

/// Joins two tensors along `axis`. All other dimensions must agree.
#[derive(Debug, Clone, Operands)]
#[operands(crate = "crate")]
pub struct ConcatOp {
    #[operand]
    pub a: Tensor,
    #[operand]
    pub b: Tensor,
    pub axis: usize,
}

impl TensorOp for ConcatOp {
    fn infer(&self) -> Result<Vec<TensorInfo>, EngineError> {
        expect_type("b", &self.b, self.a.data_type())?;

        let (a, b) = (self.a.shape(), self.b.shape());
        if a.rank() != b.rank() {
            let expected = format!("rank {}", a.rank());
            let actual = format!("rank {}", b.rank());
            return Err(ShapeMismatchError::new("b", expected, actual).into());
        }
        let (axis, rank) = (self.axis, a.rank());
        if axis >= rank {
            let op = self.name().into_owned();
            return Err(UnsupportedFeatureError::Axis { op, axis, rank }.into());
        }

        let mismatch = a
            .iter()
            .zip(b.iter())
            .enumerate()
            .any(|(index, (x, y))| index != axis && x != y);
        if mismatch {
            let mut expected = a.to_vec();
            expected[axis] = b[axis];
            return Err(ShapeMismatchError::new("b", Shape::from(expected), b).into());
        }

        let mut shape = a.to_vec();
        shape[axis] += b[axis];
        Ok(vec![TensorInfo::new(shape, self.a.data_type())])
    }
}

/// Softmax over the last axis.
#[derive(Debug, Clone, Operands)]
#[operands(crate = "crate")]
pub struct SoftmaxOp {
    #[operand(name = "logits")]
    pub x: Tensor,
    /// Must be the last axis when given.
    pub axis: Option<usize>,
}

impl TensorOp for SoftmaxOp {
    fn infer(&self) -> Result<Vec<TensorInfo>, EngineError> {
        expect_type("logits", &self.x, DataType::F32)?;
        check_last_axis("softmax", &self.x, self.axis)?;
        Ok(vec![TensorInfo::new(self.x.shape(), DataType::F32)])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ReduceKind {
    #[display("sum")]
    Sum,
    #[display("max")]
    Max,
    #[display("min")]
    Min,
}

/// Reduces the last axis away.
#[derive(Debug, Clone)]
pub struct ReduceOp {
    pub kind: ReduceKind,
    pub x: Tensor,
}

impl Operands for ReduceOp {
    fn name(&self) -> Cow<'static, str> {
        format!("reduce_{}", self.kind).into()
    }

    fn operands(&self) -> Vec<Operand<'_>> {
        vec![Operand {
            name: "x",
            tensor: &self.x,
        }]
    }
}

impl TensorOp for ReduceOp {
    fn infer(&self) -> Result<Vec<TensorInfo>, EngineError> {
        check_last_axis(&self.name(), &self.x, None)?;
        let r#type = match (self.kind, self.x.data_type()) {
            (ReduceKind::Sum, DataType::Bool) => DataType::I32,
            (_, r#type) => r#type,
        };
        Ok(vec![TensorInfo::new(self.x.shape().without_last(), r#type)])
    }
}

/// `[m, k] x [k, n] -> [m, n]`.
#[derive(Debug, Clone, Operands)]
#[operands(crate = "crate", name = "matmul")]
pub struct MatMulOp {
    #[operand]
    pub a: Tensor,
    #[operand]
    pub b: Tensor,
}

impl TensorOp for MatMulOp {
    fn infer(&self) -> Result<Vec<TensorInfo>, EngineError> {
        reject_bool("a", &self.a)?;
        expect_type("b", &self.b, self.a.data_type())?;

        let (a, b) = (self.a.shape(), self.b.shape());
        if a.rank() != 2 {
            return Err(ShapeMismatchError::new("a", "rank 2", format!("rank {}", a.rank())).into());
        }
        if b.rank() != 2 {
            return Err(ShapeMismatchError::new("b", "rank 2", format!("rank {}", b.rank())).into());
        }
        if a[1] != b[0] {
            let expected = format!("[{}, _]", a[1]);
            return Err(ShapeMismatchError::new("b", expected, b).into());
        }
        Ok(vec![TensorInfo::new([a[0], b[1]], self.a.data_type())])
    }
}

/// Picks from `a` where `cond` is true and from `b` elsewhere.
#[derive(Debug, Clone, Operands)]
#[operands(crate = "crate")]
pub struct SelectOp {
    #[operand]
    pub cond: Tensor,
    #[operand]
    pub a: Tensor,
    #[operand]
    pub b: Tensor,
}

impl TensorOp for SelectOp {
    fn infer(&self) -> Result<Vec<TensorInfo>, EngineError> {
        expect_type("cond", &self.cond, DataType::Bool)?;
        expect_type("b", &self.b, self.a.data_type())?;
        if self.a.shape() != self.cond.shape() {
            return Err(ShapeMismatchError::new("a", self.cond.shape(), self.a.shape()).into());
        }
        if self.b.shape() != self.cond.shape() {
            return Err(ShapeMismatchError::new("b", self.cond.shape(), self.b.shape()).into());
        }
        Ok(vec![TensorInfo::new(self.a.shape(), self.a.data_type())])
    }
}

/// Converts to another data type. Floats truncate toward zero into `int32`; any
/// nonzero value is `true`.
#[derive(Debug, Clone, Operands)]
#[operands(crate = "crate")]
pub struct CastOp {
    #[operand]
    pub x: Tensor,
    pub r#type: DataType,
}

impl TensorOp for CastOp {
    fn infer(&self) -> Result<Vec<TensorInfo>, EngineError> {
        Ok(vec![TensorInfo::new(self.x.shape(), self.r#type)])
    }
}

/// Copies a tensor into fresh storage.
#[derive(Debug, Clone, Operands)]
#[operands(crate = "crate")]
pub struct CloneOp {
    #[operand]
    pub x: Tensor,
}

impl TensorOp for CloneOp {
    fn infer(&self) -> Result<Vec<TensorInfo>, EngineError> {
        Ok(vec![self.x.info().clone()])
    }
}

/// Copies a tensor into a new shape of the same size.
#[derive(Debug, Clone, Operands)]
#[operands(crate = "crate")]
pub struct ReshapeOp {
    #[operand]
    pub x: Tensor,
    pub shape: Shape,
}

impl TensorOp for ReshapeOp {
    fn infer(&self) -> Result<Vec<TensorInfo>, EngineError> {
        if self.shape.size() != self.x.size() {
            let expected = format!("{} elements", self.shape.size());
            let actual = format!("{} elements", self.x.size());
            return Err(ShapeMismatchError::new("x", expected, actual).into());
        }
        Ok(vec![TensorInfo::new(&self.shape, self.x.data_type())])
    }
}
