//! Infix to postfix conversion with the shunting-yard algorithm.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

use crate::backend::{Backend, BinaryFn, BinaryOp, Constant, UnaryFn, UnaryFunction};
use crate::tokenizer::{Lexeme, Lexer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntaxErrorKind {
    Unknown,
    InvalidNumber,
    DistinctVariableCountExceeded,
    ParenthesesCountMismatch,
}

impl fmt::Display for SyntaxErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SyntaxErrorKind::Unknown => write!(f, "Invalid expression"),
            SyntaxErrorKind::InvalidNumber => write!(f, "Invalid number format"),
            SyntaxErrorKind::DistinctVariableCountExceeded => write!(f, "Only one variable name is allowed"),
            SyntaxErrorKind::ParenthesesCountMismatch => write!(f, "Parentheses do not match"),
        }
    }
}

/// A malformed expression, with the index of the offending character.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} at index {index}")]
pub struct SyntaxError {
    pub kind: SyntaxErrorKind,
    pub input: String,
    /// Zero-based character index into `input`.
    pub index: usize,
}

impl SyntaxError {
    /// The input with a `^` marker under the offending character.
    pub fn caret(&self) -> String {
        format!("{}\n{}^", self.input, " ".repeat(self.index))
    }
}

/// Element of a postfix token sequence.
#[derive(Clone)]
pub enum Token {
    Number(f64),
    /// A named constant with the value it had in the bound backend.
    Constant(Constant, f64),
    Variable,
    Binary(BinaryOp, BinaryFn),
    Unary(UnaryFunction, UnaryFn),
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Token::Number(value) => write!(f, "Number({})", value),
            Token::Constant(constant, value) => write!(f, "Constant({:?}, {})", constant, value),
            Token::Variable => write!(f, "Variable"),
            Token::Binary(op, _) => write!(f, "Binary({:?})", op),
            Token::Unary(function, _) => write!(f, "Unary({:?})", function),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Token::Number(value) => write!(f, "{}", value),
            Token::Constant(constant, _) => write!(f, "{}", constant.name()),
            Token::Variable => write!(f, "x"),
            Token::Binary(op, _) => write!(f, "{}", op.as_char()),
            Token::Unary(function, _) => write!(f, "{}", function.name()),
        }
    }
}

/// Result of a successful parse.
#[derive(Debug, Clone)]
pub struct Parsed {
    /// Tokens in postfix order.
    pub tokens: Vec<Token>,
    pub variable: Option<String>,
    /// Native symbol names of every primitive the expression references.
    pub used: BTreeSet<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Preceding {
    Number,
    Operator,
    Function,
    GroupStart,
    GroupEnd,
}

/// Entry of the pending operator stack.
#[derive(Debug, Clone, Copy)]
enum Pending {
    Group,
    Binary(BinaryOp),
    Unary(UnaryFunction),
}

impl Pending {
    fn precedence(self) -> u8 {
        match self {
            Pending::Binary(op) => op.precedence(),
            Pending::Unary(_) => UnaryFunction::PRECEDENCE,
            Pending::Group => 5,
        }
    }
}

pub struct Parser<'a> {
    input: &'a str,
    backend: &'a Backend,
    output: Vec<Token>,
    pending: Vec<Pending>,
    preceding: Preceding,
    depth: usize,
    variable: Option<&'a str>,
    used: BTreeSet<&'static str>,
}

impl<'a> Parser<'a> {
    /// Parse `input`, resolving operators and constants through `backend`.
    pub fn parse(input: &'a str, backend: &'a Backend) -> Result<Parsed, SyntaxError> {
        let mut parser = Parser {
            input,
            backend,
            output: Vec::new(),
            pending: Vec::new(),
            preceding: Preceding::GroupStart,
            depth: 0,
            variable: None,
            used: BTreeSet::new(),
        };

        for (index, lexeme) in Lexer::new(input) {
            parser.step(index, lexeme)?;
        }
        parser.finish()
    }

    fn error(&self, kind: SyntaxErrorKind, index: usize) -> SyntaxError {
        SyntaxError {
            kind,
            input: self.input.to_string(),
            index,
        }
    }

    fn last_index(&self) -> usize {
        self.input.chars().count().saturating_sub(1)
    }

    fn expects_operand(&self) -> bool {
        matches!(
            self.preceding,
            Preceding::Operator | Preceding::Function | Preceding::GroupStart
        )
    }

    fn step(&mut self, index: usize, lexeme: Lexeme<'a>) -> Result<(), SyntaxError> {
        use SyntaxErrorKind::*;

        match lexeme {
            Lexeme::Number(value) => {
                if !matches!(self.preceding, Preceding::Operator | Preceding::GroupStart) {
                    return Err(self.error(Unknown, index));
                }
                let value = value.ok_or_else(|| self.error(InvalidNumber, index))?;
                self.output.push(Token::Number(value));
                self.preceding = Preceding::Number;
            }
            Lexeme::Name(name) => {
                if matches!(self.preceding, Preceding::Function | Preceding::GroupEnd) {
                    // Reported at the name's last character.
                    let last = index + name.chars().count() - 1;
                    return Err(self.error(Unknown, last));
                }
                if self.preceding == Preceding::Number {
                    self.push_binary(BinaryOp::Multiply, index)?;
                }

                if let Some(function) = UnaryFunction::from_name(name) {
                    self.used.insert(function.symbol());
                    self.pending.push(Pending::Unary(function));
                    self.preceding = Preceding::Function;
                } else if let Some(constant) = Constant::from_name(name) {
                    self.used.insert(constant.symbol());
                    self.output
                        .push(Token::Constant(constant, self.backend.constant(constant)));
                    self.preceding = Preceding::Number;
                } else {
                    match self.variable {
                        Some(variable) if variable != name => {
                            return Err(self.error(DistinctVariableCountExceeded, index));
                        }
                        _ => self.variable = Some(name),
                    }
                    self.output.push(Token::Variable);
                    self.preceding = Preceding::Number;
                }
            }
            Lexeme::OpenParen => {
                if matches!(self.preceding, Preceding::Number | Preceding::GroupEnd) {
                    return Err(self.error(Unknown, index));
                }
                self.pending.push(Pending::Group);
                self.depth += 1;
                self.preceding = Preceding::GroupStart;
            }
            Lexeme::CloseParen => {
                if self.expects_operand() {
                    return Err(self.error(Unknown, index));
                }

                loop {
                    match self.pending.pop() {
                        Some(Pending::Group) => break,
                        Some(pending) => self.emit(pending),
                        None => return Err(self.error(ParenthesesCountMismatch, index)),
                    }
                }
                self.depth -= 1;
                self.preceding = Preceding::GroupEnd;
            }
            Lexeme::Symbol(c) => match BinaryOp::from_char(c) {
                Some(op) => self.push_binary(op, index)?,
                None => return Err(self.error(Unknown, index)),
            },
        }

        Ok(())
    }

    /// Push a binary operator, first moving every pending operator that binds at
    /// least as tightly to the output. All operators are left associative.
    fn push_binary(&mut self, op: BinaryOp, index: usize) -> Result<(), SyntaxError> {
        if self.expects_operand() {
            return Err(self.error(SyntaxErrorKind::Unknown, index));
        }

        self.used.insert(op.symbol());
        while let Some(&top) = self.pending.last() {
            if matches!(top, Pending::Group) || top.precedence() < op.precedence() {
                break;
            }
            self.pending.pop();
            self.emit(top);
        }

        self.pending.push(Pending::Binary(op));
        self.preceding = Preceding::Operator;
        Ok(())
    }

    fn emit(&mut self, pending: Pending) {
        match pending {
            Pending::Binary(op) => self
                .output
                .push(Token::Binary(op, self.backend.binary(op).clone())),
            Pending::Unary(function) => self
                .output
                .push(Token::Unary(function, self.backend.unary(function).clone())),
            Pending::Group => {}
        }
    }

    fn finish(mut self) -> Result<Parsed, SyntaxError> {
        if self.depth > 0 {
            return Err(self.error(SyntaxErrorKind::ParenthesesCountMismatch, self.last_index()));
        }
        if self.expects_operand() {
            return Err(self.error(SyntaxErrorKind::Unknown, self.last_index()));
        }

        while let Some(pending) = self.pending.pop() {
            self.emit(pending);
        }

        if !Parser::verify(&self.output) {
            return Err(self.error(SyntaxErrorKind::Unknown, self.last_index()));
        }

        Ok(Parsed {
            tokens: self.output,
            variable: self.variable.map(str::to_string),
            used: self.used,
        })
    }

    /// Check that a postfix sequence reduces to exactly one value.
    fn verify(tokens: &[Token]) -> bool {
        let mut operands = 0usize;
        for token in tokens {
            match token {
                Token::Number(_) | Token::Constant(..) | Token::Variable => operands += 1,
                Token::Binary(..) => {
                    if operands < 2 {
                        return false;
                    }
                    operands -= 1;
                }
                Token::Unary(..) => {
                    if operands < 1 {
                        return false;
                    }
                }
            }
        }
        operands == 1
    }
}

/// Render postfix tokens separated by spaces, e.g. `1 2 3 * +`.
pub fn render(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(Token::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use SyntaxErrorKind::*;

    fn rpn(input: &str) -> String {
        render(&Parser::parse(input, &Backend::double()).unwrap().tokens)
    }

    fn fails(input: &str) -> (SyntaxErrorKind, usize) {
        let err = Parser::parse(input, &Backend::double()).unwrap_err();
        assert_eq!(err.input, input);
        (err.kind, err.index)
    }

    #[test]
    fn test_precedence() {
        assert_eq!(rpn("1 + 2 * 3"), "1 2 3 * +");
        assert_eq!(rpn("1 * 2 + 3"), "1 2 * 3 +");
        assert_eq!(rpn("1 / (2 * 4) ^ 2"), "1 2 4 * 2 ^ /");
        assert_eq!(rpn("7 % 4 - 1"), "7 4 % 1 -");
    }

    #[test]
    fn test_left_associative() {
        assert_eq!(rpn("2 ^ 3 ^ 2"), "2 3 ^ 2 ^");
        assert_eq!(rpn("8 - 4 - 2"), "8 4 - 2 -");
        assert_eq!(rpn("8 / 4 / 2"), "8 4 / 2 /");
    }

    #[test]
    fn test_functions() {
        assert_eq!(rpn("sin(x) ^ 2"), "x sin 2 ^");
        assert_eq!(rpn("sqrt(x + 1)"), "x 1 + sqrt");
        assert_eq!(rpn("abs(cos(x))"), "x cos abs");
    }

    #[test]
    fn test_implicit_multiply() {
        assert_eq!(rpn("2pi"), "2 pi *");
        assert_eq!(rpn("5sqrt(x)"), "5 x sqrt *");
        assert_eq!(rpn("2x"), "2 x *");
        assert_eq!(rpn("-x"), "-1 x *");
        assert_eq!(rpn("1 + 2x ^ 2"), "1 2 x 2 ^ * +");
    }

    #[test]
    fn test_parentheses() {
        assert_eq!(rpn("((( ((( ((( 1 + 2 ))) + 3 ))) + 4 ))) + 5"), "1 2 + 3 + 4 + 5 +");
        assert_eq!(rpn("(+1) * (-2) * 3"), "1 -2 * 3 *");
    }

    #[test]
    fn test_variable() {
        let parsed = Parser::parse("cos(custom) + custom", &Backend::double()).unwrap();
        assert_eq!(parsed.variable.as_deref(), Some("custom"));

        let parsed = Parser::parse("1 + 2", &Backend::double()).unwrap();
        assert_eq!(parsed.variable, None);
    }

    #[test]
    fn test_used_symbols() {
        let parsed = Parser::parse("2pi + sin(x)", &Backend::double()).unwrap();
        let used: Vec<_> = parsed.used.into_iter().collect();
        assert_eq!(
            used,
            vec!["constant_pi", "operator_add", "operator_multiply", "operator_sin"]
        );
    }

    #[test]
    fn test_errors() {
        assert_eq!(fails(""), (Unknown, 0));
        assert_eq!(fails("x * y"), (DistinctVariableCountExceeded, 4));
        assert_eq!(fails("unknown(x)"), (Unknown, 7));
        assert_eq!(fails("(1+2"), (ParenthesesCountMismatch, 3));
        assert_eq!(fails("((1+2)))"), (ParenthesesCountMismatch, 7));
        assert_eq!(fails("5,5"), (InvalidNumber, 0));
        assert_eq!(fails("* 9"), (Unknown, 0));
    }

    #[test]
    fn test_invalid_inputs() {
        assert_eq!(fails("sin"), (Unknown, 2));
        assert_eq!(fails("55 +"), (Unknown, 3));
        assert_eq!(fails("44 */ 33"), (Unknown, 4));
        assert_eq!(fails("10 20 + 30"), (Unknown, 3));
        assert_eq!(fails("(2 +)"), (Unknown, 4));
        assert_eq!(fails("sin sin(x)"), (Unknown, 6));
        assert_eq!(fails("(5 * 5) sqrt(16)"), (Unknown, 11));
        assert_eq!(fails("(5 * 5) pi"), (Unknown, 9));
        assert_eq!(fails("50 50"), (Unknown, 3));
        assert_eq!(fails("2 $ 3"), (Unknown, 2));
        assert_eq!(fails("()"), (Unknown, 1));
        assert_eq!(fails("sqrt -4"), (Unknown, 5));
        assert_eq!(fails("sqrt x"), (Unknown, 5));
        assert_eq!(fails("1 + 1.2.3"), (InvalidNumber, 4));
        assert_eq!(fails("sqrt cos(x)"), (Unknown, 7));
        assert_eq!(fails("(x) x"), (Unknown, 4));
    }

    #[test]
    fn test_only_space_separates() {
        assert_eq!(fails("1\t+ 2"), (Unknown, 1));
        assert_eq!(fails("1\n+ 2"), (Unknown, 1));
        assert_eq!(fails("\u{a0}1"), (Unknown, 0));
        assert!(Parser::parse(" 1 +  2 ", &Backend::double()).is_ok());
    }

    #[test]
    fn test_caret() {
        let err = Parser::parse("1 + $", &Backend::double()).unwrap_err();
        assert_eq!(err.caret(), "1 + $\n    ^");
        assert_eq!(err.to_string(), "Invalid expression at index 4");
    }
}
