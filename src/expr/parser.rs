use super::lexer::{tokenize, Token};
use super::value::EvalError;

/// Expression AST for the validator/template sublanguage: arithmetic,
/// comparisons, boolean logic, calls with keyword arguments, tuple and list
/// literals, indexing, attribute access, and filter pipes.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Name(String),
    Tuple(Vec<Expr>),
    List(Vec<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Index(Box<Expr>, Box<Expr>),
    Attr(Box<Expr>, String),
    /// `lhs | rhs` applies `rhs` (a call or name) to `lhs` as its first
    /// argument, the filter convention of the template renderer.
    Pipe(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

/// Parse one expression; trailing tokens are a syntax error.
pub fn parse(src: &str) -> Result<Expr, EvalError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.pipe()?;
    if parser.pos != parser.tokens.len() {
        return Err(EvalError::Syntax(format!(
            "unexpected trailing input near token #{}",
            parser.pos + 1
        )));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), EvalError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(EvalError::Syntax(format!(
                "expected {expected:?}, found {:?}",
                self.peek()
            )))
        }
    }

    fn pipe(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.or_expr()?;
        while self.eat(&Token::Pipe) {
            let right = self.or_expr()?;
            left = Expr::Pipe(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn or_expr(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.and_expr()?;
        while self.eat(&Token::Or) {
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.not_expr()?;
        while self.eat(&Token::And) {
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, EvalError> {
        if self.eat(&Token::Not) {
            let inner = self.not_expr()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.arith()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinOp::Eq,
                Some(Token::Ne) => BinOp::Ne,
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                Some(Token::In) => BinOp::In,
                _ => break,
            };
            self.advance();
            let right = self.arith()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn arith(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, EvalError> {
        if self.eat(&Token::Minus) {
            let inner = self.unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        if self.eat(&Token::Plus) {
            return self.unary();
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, EvalError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::LParen) => {
                    self.advance();
                    let (args, kwargs) = self.call_args()?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                        kwargs,
                    };
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let index = self.pipe()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Some(Token::Dot) => {
                    self.advance();
                    match self.advance() {
                        Some(Token::Name(name)) => expr = Expr::Attr(Box::new(expr), name),
                        other => {
                            return Err(EvalError::Syntax(format!(
                                "expected attribute name after '.', found {other:?}"
                            )))
                        }
                    }
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), EvalError> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok((args, kwargs));
        }
        loop {
            // keyword argument: name '=' expr
            let is_kwarg = matches!(
                (self.peek(), self.tokens.get(self.pos + 1)),
                (Some(Token::Name(_)), Some(Token::Assign))
            );
            if is_kwarg {
                let name = match self.advance() {
                    Some(Token::Name(n)) => n,
                    _ => unreachable!(),
                };
                self.advance(); // '='
                let value = self.pipe()?;
                kwargs.push((name, value));
            } else {
                if !kwargs.is_empty() {
                    return Err(EvalError::Syntax(
                        "positional argument follows keyword argument".into(),
                    ));
                }
                args.push(self.pipe()?);
            }
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(Token::RParen)?;
            return Ok((args, kwargs));
        }
    }

    fn primary(&mut self) -> Result<Expr, EvalError> {
        match self.advance() {
            Some(Token::Int(n)) => Ok(Expr::Int(n)),
            Some(Token::Float(f)) => Ok(Expr::Float(f)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Name(name)) => Ok(Expr::Name(name)),
            Some(Token::LParen) => {
                if self.eat(&Token::RParen) {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.pipe()?;
                if self.eat(&Token::Comma) {
                    let mut items = vec![first];
                    while self.peek() != Some(&Token::RParen) {
                        items.push(self.pipe()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(Token::RParen)?;
                    Ok(Expr::Tuple(items))
                } else {
                    self.expect(Token::RParen)?;
                    Ok(first)
                }
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                while self.peek() != Some(&Token::RBracket) {
                    items.push(self.pipe()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(Token::RBracket)?;
                Ok(Expr::List(items))
            }
            other => Err(EvalError::Syntax(format!(
                "unexpected token {other:?}"
            ))),
        }
    }
}
