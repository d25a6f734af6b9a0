use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::backend::{Backend, Constant};
use crate::evaluator::RpnEvaluator;
use crate::parser::{self, Parser, SyntaxError, Token};

/// A parsed formula bound to a backend.
///
/// Changing `x` never needs a re-parse. Switching backends re-resolves the
/// operator tokens in place, see [`Expression::set_backend`].
#[derive(Clone)]
pub struct Expression {
    source: String,
    tokens: Vec<Token>,
    variable: Option<String>,
    used: BTreeSet<&'static str>,
    backend: Arc<Backend>,
}

impl Expression {
    /// Parse `input` against the shared double precision backend.
    pub fn parse(input: &str) -> Result<Expression, SyntaxError> {
        Expression::parse_with(input, Backend::shared_double())
    }

    pub fn parse_with(input: &str, backend: Arc<Backend>) -> Result<Expression, SyntaxError> {
        let parsed = Parser::parse(input, &backend)?;
        Ok(Expression {
            source: input.to_string(),
            tokens: parsed.tokens,
            variable: parsed.variable,
            used: parsed.used,
            backend,
        })
    }

    /// Evaluate with `x` bound to the variable. Never fails; NaN signals a
    /// result that does not exist for this input.
    pub fn evaluate(&self, x: f64) -> f64 {
        RpnEvaluator::evaluate(&self.tokens, x)
    }

    pub fn variable_name(&self) -> Option<&str> {
        self.variable.as_deref()
    }

    /// True for a lone literal or named constant, e.g. `-5` or `pi`.
    pub fn is_simple_constant_only(&self) -> bool {
        matches!(self.tokens.as_slice(), [Token::Number(_)] | [Token::Constant(..)])
    }

    /// Whether the expression references the primitive `symbol`, e.g. `operator_sin`.
    pub fn uses_symbol(&self, symbol: &str) -> bool {
        self.used.contains(symbol)
    }

    pub fn used_symbols(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.used.iter().copied()
    }

    /// Symbols this expression uses that the bound backend had to fall back on.
    pub fn missing_used(&self) -> Vec<&'static str> {
        self.used_symbols()
            .filter(|symbol| self.backend.is_missing(symbol))
            .collect()
    }

    pub fn uses_constant(&self, constant: Constant) -> bool {
        self.uses_symbol(constant.symbol())
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// A copy of this expression bound to `backend`.
    pub fn with_backend(&self, backend: Arc<Backend>) -> Expression {
        let mut expression = self.clone();
        expression.set_backend(backend);
        expression
    }

    /// Re-bind every operator, function and constant to `backend`. The previous
    /// backend is released once nothing else refers to it.
    pub fn set_backend(&mut self, backend: Arc<Backend>) {
        RpnEvaluator::rebind(&mut self.tokens, &backend);
        self.backend = backend;
    }
}

impl FromStr for Expression {
    type Err = SyntaxError;

    fn from_str(s: &str) -> Result<Expression, SyntaxError> {
        Expression::parse(s)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Expression")
            .field("source", &self.source)
            .field("rpn", &parser::render(&self.tokens))
            .field("variable", &self.variable)
            .field("backend", &self.backend.name())
            .finish()
    }
}
