//! Ops on top of the `loom` runtime: their definitions and validation in [`ops`],
//! the math namespace in [`frontend`], and kernels per backend.

#[cfg(test)]
macro_rules! assert_approx_eq {
    ($i:expr, $a:expr, $b:expr, $eps:expr) => {
        assert!(
            ($a - $b).abs() < $eps,
            "assertion failed at {}: `(left ~= right)`\n  left: `{}`\n right: `{}`",
            $i,
            $a,
            $b
        );
    };
}

pub mod cpu;
pub mod frontend;
pub mod gpu;
pub mod ops;
