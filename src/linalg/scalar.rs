//! Floating-point element types of vectors and matrices.

use std::fmt::Debug;

use num_traits::Float;

use crate::distributor::Combinable;

pub trait Scalar: Float + Combinable + Debug + Default + Send + Sync + 'static {
    fn from_f64(v: f64) -> Self;
}

impl Scalar for f64 {
    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }
}

impl Scalar for f32 {
    #[inline]
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}
