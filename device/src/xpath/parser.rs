use super::XPathError;
use super::lexer::Tok;

#[derive(Debug, Clone)]
pub(super) enum Expr {
    Path(LocationPath),
    /// `primary[pred]...` optionally continued by `/steps`.
    Filter {
        primary: Box<Expr>,
        predicates: Vec<Expr>,
        steps: Vec<Step>,
    },
    Union(Box<Expr>, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Negate(Box<Expr>),
    Call(Function, Vec<Expr>),
    Literal(String),
    Number(f64),
}

#[derive(Debug, Clone)]
pub(super) struct LocationPath {
    pub absolute: bool,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone)]
pub(super) struct Step {
    pub axis: Axis,
    pub test: NodeTest,
    pub predicates: Vec<Expr>,
}

impl Step {
    fn descendant_or_self() -> Self {
        Step {
            axis: Axis::DescendantOrSelf,
            test: NodeTest::AnyNode,
            predicates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Axis {
    Child,
    Descendant,
    DescendantOrSelf,
    Parent,
    Ancestor,
    AncestorOrSelf,
    FollowingSibling,
    PrecedingSibling,
    Following,
    Preceding,
    SelfAxis,
    Attribute,
}

impl Axis {
    fn from_name(name: &str) -> Option<Axis> {
        Some(match name {
            "child" => Axis::Child,
            "descendant" => Axis::Descendant,
            "descendant-or-self" => Axis::DescendantOrSelf,
            "parent" => Axis::Parent,
            "ancestor" => Axis::Ancestor,
            "ancestor-or-self" => Axis::AncestorOrSelf,
            "following-sibling" => Axis::FollowingSibling,
            "preceding-sibling" => Axis::PrecedingSibling,
            "following" => Axis::Following,
            "preceding" => Axis::Preceding,
            "self" => Axis::SelfAxis,
            "attribute" => Axis::Attribute,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(super) enum NodeTest {
    Name(String),
    Wildcard,
    AnyNode,
    Text,
    Comment,
    ProcessingInstruction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Function {
    Last,
    Position,
    Count,
    LocalName,
    Name,
    String,
    Concat,
    StartsWith,
    EndsWith,
    Contains,
    SubstringBefore,
    SubstringAfter,
    Substring,
    StringLength,
    NormalizeSpace,
    Translate,
    Boolean,
    Not,
    True,
    False,
    Number,
    Sum,
    Floor,
    Ceiling,
    Round,
}

impl Function {
    fn lookup(name: &str) -> Option<(Function, usize, Option<usize>)> {
        use Function::*;
        let (f, min, max) = match name {
            "last" => (Last, 0, Some(0)),
            "position" => (Position, 0, Some(0)),
            "count" => (Count, 1, Some(1)),
            "local-name" => (LocalName, 0, Some(1)),
            "name" => (Name, 0, Some(1)),
            "string" => (String, 0, Some(1)),
            "concat" => (Concat, 2, None),
            "starts-with" => (StartsWith, 2, Some(2)),
            "ends-with" => (EndsWith, 2, Some(2)),
            "contains" => (Contains, 2, Some(2)),
            "substring-before" => (SubstringBefore, 2, Some(2)),
            "substring-after" => (SubstringAfter, 2, Some(2)),
            "substring" => (Substring, 2, Some(3)),
            "string-length" => (StringLength, 0, Some(1)),
            "normalize-space" => (NormalizeSpace, 0, Some(1)),
            "translate" => (Translate, 3, Some(3)),
            "boolean" => (Boolean, 1, Some(1)),
            "not" => (Not, 1, Some(1)),
            "true" => (True, 0, Some(0)),
            "false" => (False, 0, Some(0)),
            "number" => (Number, 0, Some(1)),
            "sum" => (Sum, 1, Some(1)),
            "floor" => (Floor, 1, Some(1)),
            "ceiling" => (Ceiling, 1, Some(1)),
            "round" => (Round, 1, Some(1)),
            _ => return None,
        };
        Some((f, min, max))
    }
}

fn is_node_type(name: &str) -> bool {
    matches!(name, "node" | "text" | "comment" | "processing-instruction")
}

pub(super) struct Parser<'a> {
    source: &'a str,
    toks: Vec<Tok>,
    pos: usize,
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a str, toks: Vec<Tok>) -> Self {
        Self { source, toks, pos: 0 }
    }

    pub fn parse(mut self) -> Result<Expr, XPathError> {
        if self.toks.is_empty() {
            return Err(self.error("empty expression"));
        }
        let expr = self.or_expr()?;
        if let Some(tok) = self.peek() {
            return Err(self.error(format!("unexpected trailing token {tok:?}")));
        }
        Ok(expr)
    }

    fn error(&self, reason: impl Into<String>) -> XPathError {
        XPathError::syntax(self.source, reason.into())
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Tok> {
        self.toks.get(self.pos + offset)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok) -> Result<(), XPathError> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(self.error(format!("expected {tok:?}, found {:?}", self.peek())))
        }
    }

    fn binary_level(
        &mut self,
        ops: &[(Tok, BinOp)],
        next: fn(&mut Self) -> Result<Expr, XPathError>,
    ) -> Result<Expr, XPathError> {
        let mut left = next(self)?;
        'outer: loop {
            for (tok, op) in ops {
                if self.eat(tok) {
                    let right = next(self)?;
                    left = Expr::Binary(*op, Box::new(left), Box::new(right));
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn or_expr(&mut self) -> Result<Expr, XPathError> {
        self.binary_level(&[(Tok::Or, BinOp::Or)], Self::and_expr)
    }

    fn and_expr(&mut self) -> Result<Expr, XPathError> {
        self.binary_level(&[(Tok::And, BinOp::And)], Self::equality_expr)
    }

    fn equality_expr(&mut self) -> Result<Expr, XPathError> {
        self.binary_level(
            &[(Tok::Eq, BinOp::Eq), (Tok::Ne, BinOp::Ne)],
            Self::relational_expr,
        )
    }

    fn relational_expr(&mut self) -> Result<Expr, XPathError> {
        self.binary_level(
            &[
                (Tok::Lt, BinOp::Lt),
                (Tok::Le, BinOp::Le),
                (Tok::Gt, BinOp::Gt),
                (Tok::Ge, BinOp::Ge),
            ],
            Self::additive_expr,
        )
    }

    fn additive_expr(&mut self) -> Result<Expr, XPathError> {
        self.binary_level(
            &[(Tok::Plus, BinOp::Add), (Tok::Minus, BinOp::Sub)],
            Self::multiplicative_expr,
        )
    }

    fn multiplicative_expr(&mut self) -> Result<Expr, XPathError> {
        self.binary_level(
            &[
                (Tok::Mul, BinOp::Mul),
                (Tok::Div, BinOp::Div),
                (Tok::Mod, BinOp::Mod),
            ],
            Self::unary_expr,
        )
    }

    fn unary_expr(&mut self) -> Result<Expr, XPathError> {
        if self.eat(&Tok::Minus) {
            return Ok(Expr::Negate(Box::new(self.unary_expr()?)));
        }
        self.union_expr()
    }

    fn union_expr(&mut self) -> Result<Expr, XPathError> {
        let mut left = self.path_expr()?;
        while self.eat(&Tok::Pipe) {
            let right = self.path_expr()?;
            left = Expr::Union(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn starts_primary(&self) -> bool {
        match self.peek() {
            Some(Tok::LParen | Tok::Literal(_) | Tok::Number(_)) => true,
            Some(Tok::Name(name)) => {
                self.peek_at(1) == Some(&Tok::LParen) && !is_node_type(name)
            }
            _ => false,
        }
    }

    fn path_expr(&mut self) -> Result<Expr, XPathError> {
        if !self.starts_primary() {
            return Ok(Expr::Path(self.location_path()?));
        }

        let primary = self.primary_expr()?;
        let predicates = self.predicates()?;
        let mut steps = Vec::new();
        self.relative_steps(&mut steps)?;
        if predicates.is_empty() && steps.is_empty() {
            return Ok(primary);
        }
        Ok(Expr::Filter {
            primary: Box::new(primary),
            predicates,
            steps,
        })
    }

    fn starts_step(&self) -> bool {
        match self.peek() {
            Some(Tok::Name(_) | Tok::Star | Tok::At | Tok::Dot | Tok::DoubleDot) => true,
            _ => false,
        }
    }

    fn location_path(&mut self) -> Result<LocationPath, XPathError> {
        let mut steps = Vec::new();
        let absolute = match self.peek() {
            Some(Tok::Slash) => {
                self.bump();
                if self.starts_step() {
                    steps.push(self.step()?);
                }
                true
            }
            Some(Tok::DoubleSlash) => {
                self.bump();
                steps.push(Step::descendant_or_self());
                steps.push(self.step()?);
                true
            }
            _ => {
                steps.push(self.step()?);
                false
            }
        };
        self.relative_steps(&mut steps)?;
        Ok(LocationPath { absolute, steps })
    }

    /// Consumes `/step` and `//step` continuations.
    fn relative_steps(&mut self, steps: &mut Vec<Step>) -> Result<(), XPathError> {
        loop {
            if self.eat(&Tok::Slash) {
                steps.push(self.step()?);
            } else if self.eat(&Tok::DoubleSlash) {
                steps.push(Step::descendant_or_self());
                steps.push(self.step()?);
            } else {
                return Ok(());
            }
        }
    }

    fn step(&mut self) -> Result<Step, XPathError> {
        if self.eat(&Tok::Dot) {
            return Ok(Step {
                axis: Axis::SelfAxis,
                test: NodeTest::AnyNode,
                predicates: Vec::new(),
            });
        }
        if self.eat(&Tok::DoubleDot) {
            return Ok(Step {
                axis: Axis::Parent,
                test: NodeTest::AnyNode,
                predicates: Vec::new(),
            });
        }

        let axis = if self.eat(&Tok::At) {
            Axis::Attribute
        } else if self.peek_at(1) == Some(&Tok::DoubleColon) {
            let Some(Tok::Name(name)) = self.bump() else {
                return Err(self.error("expected axis name"));
            };
            self.bump();
            Axis::from_name(&name).ok_or_else(|| self.error(format!("unknown axis '{name}'")))?
        } else {
            Axis::Child
        };

        let test = match self.bump() {
            Some(Tok::Star) => NodeTest::Wildcard,
            Some(Tok::Name(name)) if is_node_type(&name) && self.peek() == Some(&Tok::LParen) => {
                self.bump();
                if name == "processing-instruction" {
                    if let Some(Tok::Literal(_)) = self.peek() {
                        self.bump();
                    }
                }
                self.expect(&Tok::RParen)?;
                match name.as_str() {
                    "text" => NodeTest::Text,
                    "comment" => NodeTest::Comment,
                    "processing-instruction" => NodeTest::ProcessingInstruction,
                    _ => NodeTest::AnyNode,
                }
            }
            Some(Tok::Name(name)) => NodeTest::Name(name),
            other => return Err(self.error(format!("expected node test, found {other:?}"))),
        };

        Ok(Step {
            axis,
            test,
            predicates: self.predicates()?,
        })
    }

    fn predicates(&mut self) -> Result<Vec<Expr>, XPathError> {
        let mut predicates = Vec::new();
        while self.eat(&Tok::LBracket) {
            predicates.push(self.or_expr()?);
            self.expect(&Tok::RBracket)?;
        }
        Ok(predicates)
    }

    fn primary_expr(&mut self) -> Result<Expr, XPathError> {
        match self.bump() {
            Some(Tok::LParen) => {
                let inner = self.or_expr()?;
                self.expect(&Tok::RParen)?;
                Ok(inner)
            }
            Some(Tok::Literal(s)) => Ok(Expr::Literal(s)),
            Some(Tok::Number(n)) => Ok(Expr::Number(n)),
            Some(Tok::Name(name)) => {
                self.expect(&Tok::LParen)?;
                let mut args = Vec::new();
                if !self.eat(&Tok::RParen) {
                    loop {
                        args.push(self.or_expr()?);
                        if self.eat(&Tok::Comma) {
                            continue;
                        }
                        self.expect(&Tok::RParen)?;
                        break;
                    }
                }
                let Some((function, min, max)) = Function::lookup(&name) else {
                    return Err(self.error(format!("unknown function '{name}()'")));
                };
                if args.len() < min || max.is_some_and(|max| args.len() > max) {
                    return Err(self.error(format!(
                        "wrong number of arguments to '{name}()': {}",
                        args.len()
                    )));
                }
                Ok(Expr::Call(function, args))
            }
            other => Err(self.error(format!("unexpected token {other:?}"))),
        }
    }
}
