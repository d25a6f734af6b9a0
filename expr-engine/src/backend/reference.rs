//! Reference implementations built from the host's own math routines.

use std::sync::Arc;

use super::{BinaryFn, BinaryOp, Constant, UnaryFn, UnaryFunction};

fn double_binary_fn(op: BinaryOp) -> fn(f64, f64) -> f64 {
    match op {
        BinaryOp::Add => |a, b| a + b,
        BinaryOp::Subtract => |a, b| a - b,
        BinaryOp::Multiply => |a, b| a * b,
        BinaryOp::Divide => |a, b| a / b,
        BinaryOp::Pow => f64::powf,
        // Truncated remainder, same as C `fmod`.
        BinaryOp::Remainder => |a, b| a % b,
    }
}

fn double_unary_fn(function: UnaryFunction) -> fn(f64) -> f64 {
    match function {
        UnaryFunction::Abs => f64::abs,
        UnaryFunction::Sqrt => f64::sqrt,
        UnaryFunction::Exp => f64::exp,
        UnaryFunction::Ln => f64::ln,
        UnaryFunction::Log => f64::log10,
        UnaryFunction::Sin => f64::sin,
        UnaryFunction::Cos => f64::cos,
        UnaryFunction::Tan => f64::tan,
        UnaryFunction::Asin => f64::asin,
        UnaryFunction::Acos => f64::acos,
        UnaryFunction::Atan => f64::atan,
        UnaryFunction::Sinh => f64::sinh,
        UnaryFunction::Cosh => f64::cosh,
        UnaryFunction::Tanh => f64::tanh,
        UnaryFunction::Round => f64::round_ties_even,
        UnaryFunction::Floor => f64::floor,
        UnaryFunction::Ceil => f64::ceil,
    }
}

pub fn double_constant(constant: Constant) -> f64 {
    match constant {
        Constant::E => std::f64::consts::E,
        Constant::Pi => std::f64::consts::PI,
    }
}

pub fn double_binary(op: BinaryOp) -> BinaryFn {
    Arc::new(double_binary_fn(op))
}

pub fn double_unary(function: UnaryFunction) -> UnaryFn {
    Arc::new(double_unary_fn(function))
}

fn to_float(value: f64) -> f64 {
    value as f32 as f64
}

pub fn float_constant(constant: Constant) -> f64 {
    to_float(double_constant(constant))
}

pub fn float_binary(op: BinaryOp) -> BinaryFn {
    let function = double_binary_fn(op);
    Arc::new(move |a, b| to_float(function(to_float(a), to_float(b))))
}

pub fn float_unary(function: UnaryFunction) -> UnaryFn {
    let function = double_unary_fn(function);
    Arc::new(move |a| to_float(function(to_float(a))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_round_half_to_even() {
        let round = double_unary(UnaryFunction::Round);
        assert_eq!(round(6.5), 6.0);
        assert_eq!(round(7.5), 8.0);
        assert_eq!(round(6.51), 7.0);
        assert_eq!(round(6.49), 6.0);
        assert_eq!(round(-2.5), -2.0);
    }

    #[test]
    fn test_remainder_is_truncated() {
        let rem = double_binary(BinaryOp::Remainder);
        assert_eq!(rem(7.0, 5.0), 2.0);
        assert_eq!(rem(-7.0, 5.0), -2.0);
        assert_eq!(rem(7.0, -5.0), 2.0);
        assert!(rem(1.0, 0.0).is_nan());
    }

    #[test]
    fn test_logarithms() {
        assert_eq!(double_unary(UnaryFunction::Log)(10_000.0), 4.0);
        assert_eq!(double_unary(UnaryFunction::Ln)(std::f64::consts::E), 1.0);
    }

    #[test]
    fn test_float_constants() {
        assert_eq!(float_constant(Constant::Pi), std::f32::consts::PI as f64);
        assert_ne!(float_constant(Constant::Pi), std::f64::consts::PI);
    }

    proptest! {
        #[test]
        fn float_matches_rounded_double(a in -1.0e6f64..1.0e6, b in 1.0e-3f64..1.0e3) {
            for op in BinaryOp::ALL {
                let expected = to_float(double_binary(op)(to_float(a), to_float(b)));
                let actual = float_binary(op)(a, b);
                prop_assert!(actual == expected || (actual.is_nan() && expected.is_nan()));
                prop_assert!(actual.is_nan() || actual == actual as f32 as f64);
            }
        }

        #[test]
        fn float_unary_results_are_representable(a in -100.0f64..100.0) {
            for function in UnaryFunction::ALL {
                let value = float_unary(function)(a);
                prop_assert!(value.is_nan() || value == value as f32 as f64);
            }
        }
    }
}
