//! Lexer for infix expressions.
//!
//! Produces lexemes tagged with the character index they start at. The lexer
//! does not validate the order of lexemes, that is the parser's job.

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Lexeme<'a> {
    /// A number literal, `None` if its text is not a valid number.
    Number(Option<f64>),
    /// A run of letters: function, constant or variable name.
    Name(&'a str),
    OpenParen,
    CloseParen,
    /// Any other character. Binary operators are among these.
    Symbol(char),
}

/// Lexer over an input string.
///
/// A `+` or `-` is the start of a signed number literal when it follows an
/// operator, an opening parenthesis or the start of the input, and a binary
/// operator otherwise. Whitespace is skipped and `#` ends the input.
pub struct Lexer<'a> {
    input: &'a str,
    pos: usize,
    index: usize,
    prev: Option<Lexeme<'a>>,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Lexer<'a> {
        Lexer {
            input,
            pos: 0,
            index: 0,
            prev: None,
        }
    }

    fn peek_nth(&self, n: usize) -> Option<char> {
        self.input[self.pos..].chars().nth(n)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek_nth(0)?;
        self.pos += c.len_utf8();
        self.index += 1;
        Some(c)
    }

    fn sign_starts_number(&self) -> bool {
        !matches!(
            self.prev,
            Some(Lexeme::Number(_)) | Some(Lexeme::Name(_)) | Some(Lexeme::CloseParen)
        )
    }

    /// Consume the rest of a number literal whose first character was already taken.
    fn number(&mut self, start: usize) -> Option<f64> {
        loop {
            match self.peek_nth(0) {
                Some(c) if c.is_ascii_digit() || c == '.' || c == ',' => {
                    self.bump();
                }
                Some('e' | 'E')
                    if matches!(self.peek_nth(1), Some(c) if c.is_ascii_digit() || c == '+' || c == '-') =>
                {
                    self.bump();
                    self.bump();
                }
                _ => break,
            }
        }

        match &self.input[start..self.pos] {
            "+" => Some(1.0),
            "-" => Some(-1.0),
            text => text.parse().ok(),
        }
    }

    fn name(&mut self, start: usize) -> &'a str {
        while matches!(self.peek_nth(0), Some(c) if c.is_alphabetic()) {
            self.bump();
        }
        &self.input[start..self.pos]
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = (usize, Lexeme<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        let (start, index, c) = loop {
            let start = self.pos;
            let index = self.index;
            match self.bump()? {
                '#' => {
                    self.pos = self.input.len();
                    return None;
                }
                ' ' => continue,
                c => break (start, index, c),
            }
        };

        let lexeme = match c {
            c if c.is_ascii_digit() || c == '.' => Lexeme::Number(self.number(start)),
            '+' | '-' if self.sign_starts_number() => Lexeme::Number(self.number(start)),
            c if c.is_alphabetic() => Lexeme::Name(self.name(start)),
            '(' => Lexeme::OpenParen,
            ')' => Lexeme::CloseParen,
            c => Lexeme::Symbol(c),
        };

        self.prev = Some(lexeme);
        Some((index, lexeme))
    }
}
