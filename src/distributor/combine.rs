//! How transferred values merge into existing target values.

use bytemuck::Pod;
use serde::{Deserialize, Serialize};

/// Merge rule applied to every contribution of a transfer: identical-prefix
/// copies, local permutes and remote receives alike.
///
/// For dense data `Insert` and `Replace` both overwrite. Sparse row transfers
/// land in open rows: `Insert`, `Add` and `Zero` append entries (repeated
/// columns are summed at fill-complete), while `Replace` and `AbsMax` merge
/// with an entry of the same column that has already arrived and append the
/// column otherwise.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum CombineMode {
    #[default]
    Insert,
    Replace,
    Add,
    /// Keep the larger magnitude; the result is an absolute value.
    AbsMax,
    /// Target entries are set to zero.
    Zero,
}

/// Element types a transfer can combine.
pub trait Combinable: Pod + Send + Sync {
    fn add_to(self, other: Self) -> Self;
    fn abs_max(self, other: Self) -> Self;
}

macro_rules! impl_combinable_float {
    ($($t:ty),*) => {$(
        impl Combinable for $t {
            #[inline]
            fn add_to(self, other: Self) -> Self {
                self + other
            }
            #[inline]
            fn abs_max(self, other: Self) -> Self {
                self.abs().max(other.abs())
            }
        }
    )*};
}

macro_rules! impl_combinable_signed {
    ($($t:ty),*) => {$(
        impl Combinable for $t {
            #[inline]
            fn add_to(self, other: Self) -> Self {
                self.wrapping_add(other)
            }
            #[inline]
            fn abs_max(self, other: Self) -> Self {
                self.wrapping_abs().max(other.wrapping_abs())
            }
        }
    )*};
}

macro_rules! impl_combinable_unsigned {
    ($($t:ty),*) => {$(
        impl Combinable for $t {
            #[inline]
            fn add_to(self, other: Self) -> Self {
                self.wrapping_add(other)
            }
            #[inline]
            fn abs_max(self, other: Self) -> Self {
                self.max(other)
            }
        }
    )*};
}

impl_combinable_float!(f32, f64);
impl_combinable_signed!(i32, i64);
impl_combinable_unsigned!(u8, u32, u64);

impl CombineMode {
    /// Merge `incoming` into `target`.
    #[inline]
    pub fn apply<T: Combinable>(self, target: &mut T, incoming: T) {
        *target = match self {
            CombineMode::Insert | CombineMode::Replace => incoming,
            CombineMode::Add => target.add_to(incoming),
            CombineMode::AbsMax => target.abs_max(incoming),
            CombineMode::Zero => T::zeroed(),
        };
    }

    /// Element-wise [`apply`](Self::apply) over equally sized slices.
    #[inline]
    pub fn apply_slice<T: Combinable>(self, target: &mut [T], incoming: &[T]) {
        debug_assert_eq!(target.len(), incoming.len());
        match self {
            CombineMode::Insert | CombineMode::Replace => target.copy_from_slice(incoming),
            _ => {
                for (t, &v) in target.iter_mut().zip(incoming) {
                    self.apply(t, v);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_on_floats() {
        let mut x = 2.0f64;
        CombineMode::Add.apply(&mut x, 3.0);
        assert_eq!(x, 5.0);
        CombineMode::AbsMax.apply(&mut x, -7.0);
        assert_eq!(x, 7.0);
        CombineMode::Replace.apply(&mut x, -1.0);
        assert_eq!(x, -1.0);
        CombineMode::Zero.apply(&mut x, 9.0);
        assert_eq!(x, 0.0);
    }

    #[test]
    fn slices_and_integers() {
        let mut t = [1u64, 2, 3];
        CombineMode::Add.apply_slice(&mut t, &[10, 10, 10]);
        assert_eq!(t, [11, 12, 13]);
        let mut s = [-3i64, 1];
        CombineMode::AbsMax.apply_slice(&mut s, &[2, -4]);
        assert_eq!(s, [3, 4]);
    }

    #[test]
    fn serde_names_are_stable() {
        let json = serde_json::to_string(&CombineMode::AbsMax).unwrap();
        assert_eq!(json, "\"AbsMax\"");
        let back: CombineMode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, CombineMode::AbsMax);
    }
}
