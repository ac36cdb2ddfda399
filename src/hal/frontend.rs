use crate::{
    hal::ops::{
        BinaryKind, BinaryOp, CastOp, CloneOp, ConcatOp, MatMulOp, ReduceKind, ReduceOp,
        ReshapeOp, SelectOp, SoftmaxOp, UnaryKind, UnaryOp,
    },
    loom::{
        engine::Dispatch,
        error::{EngineError, ShapeMismatchError},
        num::{DataBuffer, DataType},
        ops::TensorOp,
        shape::Shape,
        tensor::Tensor,
    },
};

/// Runs a single-output op.
fn unique(dispatch: &(impl Dispatch + ?Sized), op: &dyn TensorOp) -> Result<Tensor, EngineError> {
    let outputs = dispatch.dispatch(op)?;
    let count = outputs.len();
    outputs.into_iter().next().ok_or_else(|| {
        let err = ShapeMismatchError::new(op.name(), "1 output", format!("{count} outputs"));
        err.into()
    })
}

/// The math namespace. Every op validates its operands, runs on the backend and
/// returns a new tensor tracked by the scope of `self`.
pub trait TensorOps: Dispatch {
    fn binary(&self, kind: BinaryKind, a: &Tensor, b: &Tensor) -> Result<Tensor, EngineError> {
        let op = BinaryOp {
            kind,
            a: a.clone(),
            b: b.clone(),
        };
        unique(self, &op)
    }

    fn unary(&self, kind: UnaryKind, x: &Tensor) -> Result<Tensor, EngineError> {
        let x = x.clone();
        unique(self, &UnaryOp { kind, x })
    }

    /// A rank 0 float tensor.
    fn scalar(&self, value: f32) -> Result<Tensor, EngineError> {
        self.constant(Shape::scalar(), DataBuffer::from([value]))
    }

    /// Element-wise `a + b`, broadcasting.
    #[inline]
    fn add(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, EngineError> {
        self.binary(BinaryKind::Add, a, b)
    }

    #[inline]
    fn sub(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, EngineError> {
        self.binary(BinaryKind::Sub, a, b)
    }

    #[inline]
    fn mul(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, EngineError> {
        self.binary(BinaryKind::Mul, a, b)
    }

    /// Element-wise `a / b`. Always returns float32.
    #[inline]
    fn div(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, EngineError> {
        self.binary(BinaryKind::Div, a, b)
    }

    /// Element-wise `a ^ b`. An int32 base needs an int32 exponent.
    #[inline]
    fn pow(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, EngineError> {
        self.binary(BinaryKind::Pow, a, b)
    }

    #[inline]
    fn maximum(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, EngineError> {
        self.binary(BinaryKind::Maximum, a, b)
    }

    #[inline]
    fn minimum(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, EngineError> {
        self.binary(BinaryKind::Minimum, a, b)
    }

    #[inline]
    fn equal(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, EngineError> {
        self.binary(BinaryKind::Equal, a, b)
    }

    #[inline]
    fn greater(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, EngineError> {
        self.binary(BinaryKind::Greater, a, b)
    }

    #[inline]
    fn less(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, EngineError> {
        self.binary(BinaryKind::Less, a, b)
    }

    #[inline]
    fn neg(&self, x: &Tensor) -> Result<Tensor, EngineError> {
        self.unary(UnaryKind::Neg, x)
    }

    #[inline]
    fn abs(&self, x: &Tensor) -> Result<Tensor, EngineError> {
        self.unary(UnaryKind::Abs, x)
    }

    #[inline]
    fn exp(&self, x: &Tensor) -> Result<Tensor, EngineError> {
        self.unary(UnaryKind::Exp, x)
    }

    /// Natural logarithm. NaN for negative inputs.
    #[inline]
    fn log(&self, x: &Tensor) -> Result<Tensor, EngineError> {
        self.unary(UnaryKind::Log, x)
    }

    #[inline]
    fn sqrt(&self, x: &Tensor) -> Result<Tensor, EngineError> {
        self.unary(UnaryKind::Sqrt, x)
    }

    #[inline]
    fn square(&self, x: &Tensor) -> Result<Tensor, EngineError> {
        self.unary(UnaryKind::Square, x)
    }

    #[inline]
    fn relu(&self, x: &Tensor) -> Result<Tensor, EngineError> {
        self.unary(UnaryKind::Relu, x)
    }

    #[inline]
    fn sigmoid(&self, x: &Tensor) -> Result<Tensor, EngineError> {
        self.unary(UnaryKind::Sigmoid, x)
    }

    #[inline]
    fn tanh(&self, x: &Tensor) -> Result<Tensor, EngineError> {
        self.unary(UnaryKind::Tanh, x)
    }

    /// Joins `a` and `b` along `axis`.
    fn concat(&self, a: &Tensor, b: &Tensor, axis: usize) -> Result<Tensor, EngineError> {
        let (a, b) = (a.clone(), b.clone());
        unique(self, &ConcatOp { a, b, axis })
    }

    /// Softmax over the last axis.
    fn softmax(&self, x: &Tensor) -> Result<Tensor, EngineError> {
        let x = x.clone();
        unique(self, &SoftmaxOp { x, axis: None })
    }

    /// Softmax over `axis`, which must be the last one.
    fn softmax_axis(&self, x: &Tensor, axis: usize) -> Result<Tensor, EngineError> {
        let x = x.clone();
        let axis = Some(axis);
        unique(self, &SoftmaxOp { x, axis })
    }

    /// Sums the last axis away.
    fn sum(&self, x: &Tensor) -> Result<Tensor, EngineError> {
        let x = x.clone();
        let kind = ReduceKind::Sum;
        unique(self, &ReduceOp { kind, x })
    }

    fn max(&self, x: &Tensor) -> Result<Tensor, EngineError> {
        let x = x.clone();
        let kind = ReduceKind::Max;
        unique(self, &ReduceOp { kind, x })
    }

    fn min(&self, x: &Tensor) -> Result<Tensor, EngineError> {
        let x = x.clone();
        let kind = ReduceKind::Min;
        unique(self, &ReduceOp { kind, x })
    }

    /// Mean over the last axis.
    fn mean(&self, x: &Tensor) -> Result<Tensor, EngineError> {
        let count = x.shape().last().copied().unwrap_or(1) as f32;
        self.nested("mean", |scope| {
            let x = scope.cast(x, DataType::F32)?;
            let sum = scope.sum(&x)?;
            let count = scope.scalar(count)?;
            scope.div(&sum, &count)
        })
    }

    /// `log(sum(exp(x)))` over the last axis, shifted by the maximum for stability.
    fn log_sum_exp(&self, x: &Tensor) -> Result<Tensor, EngineError> {
        self.nested("log_sum_exp", |scope| {
            let max = TensorOps::max(scope, x)?;
            let mut shape = max.shape().to_vec();
            shape.push(1);
            let shift = scope.reshape(&max, shape)?;
            let shifted = scope.sub(x, &shift)?;
            let exp = scope.exp(&shifted)?;
            let sum = scope.sum(&exp)?;
            let log = scope.log(&sum)?;
            scope.add(&log, &max)
        })
    }

    /// `[m, k] x [k, n] -> [m, n]`.
    fn matmul(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, EngineError> {
        let (a, b) = (a.clone(), b.clone());
        unique(self, &MatMulOp { a, b })
    }

    /// Picks from `a` where `cond` holds and from `b` elsewhere.
    fn select(&self, cond: &Tensor, a: &Tensor, b: &Tensor) -> Result<Tensor, EngineError> {
        let (cond, a, b) = (cond.clone(), a.clone(), b.clone());
        unique(self, &SelectOp { cond, a, b })
    }

    fn cast(&self, x: &Tensor, r#type: DataType) -> Result<Tensor, EngineError> {
        let x = x.clone();
        unique(self, &CastOp { x, r#type })
    }

    /// A copy of `x` in new storage.
    fn clone_tensor(&self, x: &Tensor) -> Result<Tensor, EngineError> {
        let x = x.clone();
        unique(self, &CloneOp { x })
    }

    fn reshape(&self, x: &Tensor, shape: impl Into<Shape>) -> Result<Tensor, EngineError> {
        let x = x.clone();
        let shape = shape.into();
        unique(self, &ReshapeOp { x, shape })
    }
}

impl<D: Dispatch> TensorOps for D {}
