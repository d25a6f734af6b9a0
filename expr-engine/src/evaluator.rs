use smallvec::SmallVec;

use crate::backend::Backend;
use crate::parser::Token;

pub struct RpnEvaluator;

impl RpnEvaluator {
    /// Reduce a postfix sequence with `x` as the value of the variable.
    ///
    /// Returns NaN if the sequence does not reduce to exactly one value.
    pub fn evaluate(tokens: &[Token], x: f64) -> f64 {
        let mut stack: SmallVec<[f64; 16]> = SmallVec::new();

        for token in tokens {
            match token {
                Token::Number(value) | Token::Constant(_, value) => stack.push(*value),
                Token::Variable => stack.push(x),
                Token::Binary(_, function) => {
                    let (Some(b), Some(a)) = (stack.pop(), stack.pop()) else {
                        return f64::NAN;
                    };
                    stack.push(function(a, b));
                }
                Token::Unary(_, function) => {
                    let Some(a) = stack.pop() else {
                        return f64::NAN;
                    };
                    stack.push(function(a));
                }
            }
        }

        match stack.as_slice() {
            [value] => *value,
            _ => f64::NAN,
        }
    }

    /// Re-resolve every operator, function and constant against `backend`.
    pub fn rebind(tokens: &mut [Token], backend: &Backend) {
        for token in tokens.iter_mut() {
            match token {
                Token::Constant(constant, value) => *value = backend.constant(*constant),
                Token::Binary(op, function) => *function = backend.binary(*op).clone(),
                Token::Unary(unary, function) => *function = backend.unary(*unary).clone(),
                Token::Number(_) | Token::Variable => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::{self, BinaryOp, UnaryFunction};
    use Token::*;

    fn binary(op: BinaryOp) -> Token {
        Binary(op, Backend::double().binary(op).clone())
    }

    fn unary(function: UnaryFunction) -> Token {
        Unary(function, Backend::double().unary(function).clone())
    }

    #[test]
    fn test_rpn_evaluator() {
        let tokens = vec![Number(1.0), Number(2.0), binary(BinaryOp::Add)];
        assert_eq!(RpnEvaluator::evaluate(&tokens, f64::NAN), 3.0);

        let tokens = vec![Number(1.0), Number(2.0), binary(BinaryOp::Subtract)];
        assert_eq!(RpnEvaluator::evaluate(&tokens, f64::NAN), -1.0);

        let tokens = vec![Number(6.0), Number(3.0), binary(BinaryOp::Divide)];
        assert_eq!(RpnEvaluator::evaluate(&tokens, f64::NAN), 2.0);

        let tokens = vec![Number(2.0), Number(3.0), binary(BinaryOp::Pow), Number(2.0), binary(BinaryOp::Pow)];
        assert_eq!(RpnEvaluator::evaluate(&tokens, f64::NAN), 64.0);

        let tokens = vec![Variable, unary(UnaryFunction::Sqrt), Number(5.0), binary(BinaryOp::Multiply)];
        assert_eq!(RpnEvaluator::evaluate(&tokens, 16.0), 20.0);
    }

    #[test]
    fn test_unreducible_is_nan() {
        assert!(RpnEvaluator::evaluate(&[], 0.0).is_nan());
        assert!(RpnEvaluator::evaluate(&[Number(1.0), Number(2.0)], 0.0).is_nan());
        assert!(RpnEvaluator::evaluate(&[Number(1.0), binary(BinaryOp::Add)], 0.0).is_nan());
        assert!(RpnEvaluator::evaluate(&[unary(UnaryFunction::Abs)], 0.0).is_nan());
    }

    #[test]
    fn test_deep_expression() {
        let mut tokens = vec![Number(0.0)];
        for _ in 0..1000 {
            tokens.push(Variable);
            tokens.push(binary(BinaryOp::Add));
        }
        assert_eq!(RpnEvaluator::evaluate(&tokens, 1.0), 1000.0);
    }

    #[test]
    fn test_rebind() {
        let mut tokens = vec![
            Token::Constant(backend::Constant::Pi, std::f64::consts::PI),
            Variable,
            binary(BinaryOp::Multiply),
        ];
        let float = Arc::new(Backend::float());
        RpnEvaluator::rebind(&mut tokens, &float);

        let Token::Constant(_, pi) = tokens[0] else {
            panic!("constant was replaced");
        };
        assert_eq!(pi, std::f32::consts::PI as f64);
        assert_eq!(RpnEvaluator::evaluate(&tokens, 1.0), std::f32::consts::PI as f64);
    }
}
