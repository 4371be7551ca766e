use super::XPathError;
use super::document::Document;
use super::parser::{Axis, BinOp, Expr, Function, LocationPath, NodeTest, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(super) enum XNode {
    Element(usize),
    /// (owner element, attribute slot)
    Attribute(usize, usize),
}

impl XNode {
    fn order_key(self) -> (usize, usize) {
        match self {
            XNode::Element(e) => (e, 0),
            XNode::Attribute(e, a) => (e, a + 1),
        }
    }

    fn owner(self) -> usize {
        match self {
            XNode::Element(e) | XNode::Attribute(e, _) => e,
        }
    }
}

#[derive(Debug, Clone)]
pub(super) enum Value {
    Nodes(Vec<XNode>),
    Str(String),
    Num(f64),
    Bool(bool),
}

fn sort_document_order(nodes: &mut Vec<XNode>) {
    nodes.sort_by_key(|n| n.order_key());
    nodes.dedup();
}

pub(super) fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".into()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity".into() } else { "-Infinity".into() }
    } else if n == n.trunc() {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn parse_number(s: &str) -> f64 {
    let s = s.trim();
    if s.is_empty() || s.starts_with('+') || s.contains(['e', 'E']) {
        return f64::NAN;
    }
    s.parse().unwrap_or(f64::NAN)
}

#[derive(Clone, Copy)]
pub(super) struct Ctx<'d> {
    pub doc: &'d Document,
    pub node: XNode,
    pub position: usize,
    pub size: usize,
}

impl<'d> Ctx<'d> {
    pub fn root(doc: &'d Document) -> Self {
        Ctx {
            doc,
            node: XNode::Element(0),
            position: 1,
            size: 1,
        }
    }

    fn at(&self, node: XNode, position: usize, size: usize) -> Self {
        Ctx {
            doc: self.doc,
            node,
            position,
            size,
        }
    }

    fn node_string(&self, node: XNode) -> String {
        match node {
            XNode::Element(e) => self.doc.string_value(e),
            XNode::Attribute(e, a) => self.doc.nodes[e].attributes[a].1.clone(),
        }
    }

    fn node_name(&self, node: XNode) -> &'d str {
        match node {
            XNode::Element(e) => &self.doc.nodes[e].name,
            XNode::Attribute(e, a) => &self.doc.nodes[e].attributes[a].0,
        }
    }

    fn string(&self, v: &Value) -> String {
        match v {
            Value::Str(s) => s.clone(),
            Value::Num(n) => format_number(*n),
            Value::Bool(b) => b.to_string(),
            Value::Nodes(ns) => ns.first().map(|n| self.node_string(*n)).unwrap_or_default(),
        }
    }

    fn number(&self, v: &Value) -> f64 {
        match v {
            Value::Num(n) => *n,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Str(s) => parse_number(s),
            Value::Nodes(_) => parse_number(&self.string(v)),
        }
    }

    fn boolean(v: &Value) -> bool {
        match v {
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::Nodes(ns) => !ns.is_empty(),
        }
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value, XPathError> {
        match expr {
            Expr::Literal(s) => Ok(Value::Str(s.clone())),
            Expr::Number(n) => Ok(Value::Num(*n)),
            Expr::Path(path) => self.location_path(path).map(Value::Nodes),
            Expr::Filter {
                primary,
                predicates,
                steps,
            } => {
                let Value::Nodes(mut nodes) = self.eval(primary)? else {
                    return Err(XPathError::Eval("predicate applied to a non node-set".into()));
                };
                sort_document_order(&mut nodes);
                for predicate in predicates {
                    nodes = self.filter(nodes, predicate)?;
                }
                self.apply_steps(nodes, steps).map(Value::Nodes)
            }
            Expr::Union(left, right) => match (self.eval(left)?, self.eval(right)?) {
                (Value::Nodes(mut a), Value::Nodes(b)) => {
                    a.extend(b);
                    sort_document_order(&mut a);
                    Ok(Value::Nodes(a))
                }
                _ => Err(XPathError::Eval("'|' needs node-sets on both sides".into())),
            },
            Expr::Negate(inner) => Ok(Value::Num(-self.number(&self.eval(inner)?))),
            Expr::Binary(BinOp::And, l, r) => {
                Ok(Value::Bool(Self::boolean(&self.eval(l)?) && Self::boolean(&self.eval(r)?)))
            }
            Expr::Binary(BinOp::Or, l, r) => {
                Ok(Value::Bool(Self::boolean(&self.eval(l)?) || Self::boolean(&self.eval(r)?)))
            }
            Expr::Binary(op, l, r) => {
                let (l, r) = (self.eval(l)?, self.eval(r)?);
                match op {
                    BinOp::Add => Ok(Value::Num(self.number(&l) + self.number(&r))),
                    BinOp::Sub => Ok(Value::Num(self.number(&l) - self.number(&r))),
                    BinOp::Mul => Ok(Value::Num(self.number(&l) * self.number(&r))),
                    BinOp::Div => Ok(Value::Num(self.number(&l) / self.number(&r))),
                    BinOp::Mod => Ok(Value::Num(self.number(&l) % self.number(&r))),
                    _ => Ok(Value::Bool(self.compare(*op, &l, &r))),
                }
            }
            Expr::Call(f, args) => self.call(*f, args),
        }
    }

    fn location_path(&self, path: &LocationPath) -> Result<Vec<XNode>, XPathError> {
        let start = if path.absolute {
            XNode::Element(0)
        } else {
            self.node
        };
        self.apply_steps(vec![start], &path.steps)
    }

    fn apply_steps(&self, mut current: Vec<XNode>, steps: &[Step]) -> Result<Vec<XNode>, XPathError> {
        for step in steps {
            let mut next = Vec::new();
            for &node in &current {
                let mut matched: Vec<XNode> = self
                    .axis(node, step.axis)
                    .into_iter()
                    .filter(|&n| self.node_test(n, step.axis, &step.test))
                    .collect();
                for predicate in &step.predicates {
                    matched = self.filter(matched, predicate)?;
                }
                next.extend(matched);
            }
            sort_document_order(&mut next);
            current = next;
        }
        Ok(current)
    }

    /// Keeps the nodes for which `predicate` holds, positions taken in the given order.
    fn filter(&self, nodes: Vec<XNode>, predicate: &Expr) -> Result<Vec<XNode>, XPathError> {
        let size = nodes.len();
        let mut kept = Vec::new();
        for (i, node) in nodes.into_iter().enumerate() {
            let ctx = self.at(node, i + 1, size);
            let keep = match ctx.eval(predicate)? {
                Value::Num(n) => n == (i + 1) as f64,
                other => Self::boolean(&other),
            };
            if keep {
                kept.push(node);
            }
        }
        Ok(kept)
    }

    fn axis(&self, node: XNode, axis: Axis) -> Vec<XNode> {
        let nodes = &self.doc.nodes;
        let parent_of = |n: XNode| match n {
            XNode::Element(e) => nodes[e].parent,
            XNode::Attribute(e, _) => Some(e),
        };
        let mut out = Vec::new();
        match axis {
            Axis::SelfAxis => out.push(node),
            Axis::Attribute => {
                if let XNode::Element(e) = node {
                    out.extend((0..nodes[e].attributes.len()).map(|a| XNode::Attribute(e, a)));
                }
            }
            Axis::Child => {
                if let XNode::Element(e) = node {
                    out.extend(nodes[e].children.iter().map(|&c| XNode::Element(c)));
                }
            }
            Axis::Descendant | Axis::DescendantOrSelf => {
                if axis == Axis::DescendantOrSelf {
                    out.push(node);
                }
                if let XNode::Element(e) = node {
                    self.descendants(e, &mut out);
                }
            }
            Axis::Parent => out.extend(parent_of(node).map(XNode::Element)),
            Axis::Ancestor | Axis::AncestorOrSelf => {
                if axis == Axis::AncestorOrSelf {
                    out.push(node);
                }
                let mut cur = parent_of(node);
                while let Some(p) = cur {
                    out.push(XNode::Element(p));
                    cur = nodes[p].parent;
                }
            }
            Axis::FollowingSibling | Axis::PrecedingSibling => {
                let XNode::Element(e) = node else {
                    return out;
                };
                let Some(p) = nodes[e].parent else {
                    return out;
                };
                let siblings = &nodes[p].children;
                let at = siblings.iter().position(|&s| s == e).unwrap_or(0);
                if axis == Axis::FollowingSibling {
                    out.extend(siblings[at + 1..].iter().map(|&s| XNode::Element(s)));
                } else {
                    out.extend(siblings[..at].iter().rev().map(|&s| XNode::Element(s)));
                }
            }
            Axis::Following => {
                // everything after the subtree of the context node
                let owner = node.owner();
                let end = match node {
                    XNode::Element(e) => self.subtree_end(e),
                    XNode::Attribute(..) => owner + 1,
                };
                out.extend((end..nodes.len()).map(XNode::Element));
            }
            Axis::Preceding => {
                let owner = node.owner();
                let mut ancestors = Vec::new();
                let mut cur = nodes[owner].parent;
                while let Some(p) = cur {
                    ancestors.push(p);
                    cur = nodes[p].parent;
                }
                out.extend(
                    (1..owner)
                        .rev()
                        .filter(|i| !ancestors.contains(i))
                        .map(XNode::Element),
                );
            }
        }
        out
    }

    fn descendants(&self, element: usize, out: &mut Vec<XNode>) {
        let end = self.subtree_end(element);
        out.extend((element + 1..end).map(XNode::Element));
    }

    /// One past the last slot of `element`'s subtree; slots are pre-order.
    fn subtree_end(&self, element: usize) -> usize {
        let mut last = element;
        while let Some(&child) = self.doc.nodes[last].children.last() {
            last = child;
        }
        last + 1
    }

    fn node_test(&self, node: XNode, axis: Axis, test: &NodeTest) -> bool {
        let principal_is_attribute = axis == Axis::Attribute;
        match (node, test) {
            (_, NodeTest::AnyNode) => true,
            (XNode::Element(0), _) => false,
            (XNode::Element(_), NodeTest::Wildcard) => !principal_is_attribute,
            (XNode::Attribute(..), NodeTest::Wildcard) => principal_is_attribute,
            (n, NodeTest::Name(name)) => {
                let kind_ok = matches!(n, XNode::Attribute(..)) == principal_is_attribute;
                kind_ok && self.node_name(n) == name
            }
            (_, NodeTest::Text | NodeTest::Comment | NodeTest::ProcessingInstruction) => false,
        }
    }

    fn compare(&self, op: BinOp, l: &Value, r: &Value) -> bool {
        match (l, r) {
            (Value::Nodes(a), Value::Nodes(b)) => {
                let rs: Vec<String> = b.iter().map(|n| self.node_string(*n)).collect();
                a.iter().any(|n| {
                    let ls = self.node_string(*n);
                    rs.iter().any(|rs| self.compare_atoms(op, &Value::Str(ls.clone()), &Value::Str(rs.clone())))
                })
            }
            (Value::Nodes(ns), Value::Bool(_)) => {
                self.compare_atoms(op, &Value::Bool(!ns.is_empty()), r)
            }
            (Value::Bool(_), Value::Nodes(ns)) => {
                self.compare_atoms(op, l, &Value::Bool(!ns.is_empty()))
            }
            (Value::Nodes(ns), other) => ns.iter().any(|n| {
                let atom = self.atomize(*n, other);
                self.compare_atoms(op, &atom, other)
            }),
            (other, Value::Nodes(ns)) => ns.iter().any(|n| {
                let atom = self.atomize(*n, other);
                self.compare_atoms(op, other, &atom)
            }),
            _ => self.compare_atoms(op, l, r),
        }
    }

    /// A node's value converted to the type of the other operand.
    fn atomize(&self, node: XNode, like: &Value) -> Value {
        let s = self.node_string(node);
        match like {
            Value::Num(_) => Value::Num(parse_number(&s)),
            _ => Value::Str(s),
        }
    }

    fn compare_atoms(&self, op: BinOp, l: &Value, r: &Value) -> bool {
        match op {
            BinOp::Eq | BinOp::Ne => {
                let equal = if matches!(l, Value::Bool(_)) || matches!(r, Value::Bool(_)) {
                    Self::boolean(l) == Self::boolean(r)
                } else if matches!(l, Value::Num(_)) || matches!(r, Value::Num(_)) {
                    self.number(l) == self.number(r)
                } else {
                    self.string(l) == self.string(r)
                };
                equal == (op == BinOp::Eq)
            }
            _ => {
                let (a, b) = (self.number(l), self.number(r));
                match op {
                    BinOp::Lt => a < b,
                    BinOp::Le => a <= b,
                    BinOp::Gt => a > b,
                    BinOp::Ge => a >= b,
                    _ => false,
                }
            }
        }
    }

    fn arg_string(&self, args: &[Expr], i: usize) -> Result<String, XPathError> {
        match args.get(i) {
            Some(e) => Ok(self.string(&self.eval(e)?)),
            None => Ok(self.node_string(self.node)),
        }
    }

    fn arg_number(&self, args: &[Expr], i: usize) -> Result<f64, XPathError> {
        match args.get(i) {
            Some(e) => Ok(self.number(&self.eval(e)?)),
            None => Ok(parse_number(&self.node_string(self.node))),
        }
    }

    fn arg_nodes(&self, args: &[Expr], i: usize) -> Result<Vec<XNode>, XPathError> {
        match args.get(i) {
            Some(e) => match self.eval(e)? {
                Value::Nodes(ns) => Ok(ns),
                _ => Err(XPathError::Eval("argument is not a node-set".into())),
            },
            None => Ok(vec![self.node]),
        }
    }

    fn call(&self, f: Function, args: &[Expr]) -> Result<Value, XPathError> {
        use Function as F;
        let v = match f {
            F::Last => Value::Num(self.size as f64),
            F::Position => Value::Num(self.position as f64),
            F::Count => Value::Num(self.arg_nodes(args, 0)?.len() as f64),
            F::Name | F::LocalName => {
                let nodes = self.arg_nodes(args, 0)?;
                let name = nodes.first().map(|n| self.node_name(*n)).unwrap_or_default();
                let name = match f {
                    F::LocalName => name.rsplit(':').next().unwrap_or(name),
                    _ => name,
                };
                Value::Str(name.to_string())
            }
            F::String => Value::Str(self.arg_string(args, 0)?),
            F::Concat => {
                let mut out = String::new();
                for i in 0..args.len() {
                    out.push_str(&self.arg_string(args, i)?);
                }
                Value::Str(out)
            }
            F::StartsWith => Value::Bool(self.arg_string(args, 0)?.starts_with(&self.arg_string(args, 1)?)),
            F::EndsWith => Value::Bool(self.arg_string(args, 0)?.ends_with(&self.arg_string(args, 1)?)),
            F::Contains => Value::Bool(self.arg_string(args, 0)?.contains(&self.arg_string(args, 1)?)),
            F::SubstringBefore => {
                let (s, sep) = (self.arg_string(args, 0)?, self.arg_string(args, 1)?);
                Value::Str(s.split_once(sep.as_str()).map(|(a, _)| a.to_string()).unwrap_or_default())
            }
            F::SubstringAfter => {
                let (s, sep) = (self.arg_string(args, 0)?, self.arg_string(args, 1)?);
                Value::Str(s.split_once(sep.as_str()).map(|(_, b)| b.to_string()).unwrap_or_default())
            }
            F::Substring => {
                let s = self.arg_string(args, 0)?;
                let start = xpath_round(self.arg_number(args, 1)?);
                let end = if args.len() > 2 {
                    start + xpath_round(self.arg_number(args, 2)?)
                } else {
                    f64::INFINITY
                };
                let out: String = s
                    .chars()
                    .enumerate()
                    .filter(|(i, _)| {
                        let p = (*i + 1) as f64;
                        p >= start && p < end
                    })
                    .map(|(_, c)| c)
                    .collect();
                Value::Str(out)
            }
            F::StringLength => Value::Num(self.arg_string(args, 0)?.chars().count() as f64),
            F::NormalizeSpace => {
                let s = self.arg_string(args, 0)?;
                Value::Str(s.split_whitespace().collect::<Vec<_>>().join(" "))
            }
            F::Translate => {
                let s = self.arg_string(args, 0)?;
                let from: Vec<char> = self.arg_string(args, 1)?.chars().collect();
                let to: Vec<char> = self.arg_string(args, 2)?.chars().collect();
                let out: String = s
                    .chars()
                    .filter_map(|c| match from.iter().position(|&f| f == c) {
                        Some(i) => to.get(i).copied(),
                        None => Some(c),
                    })
                    .collect();
                Value::Str(out)
            }
            F::Boolean => Value::Bool(Self::boolean(&self.eval(&args[0])?)),
            F::Not => Value::Bool(!Self::boolean(&self.eval(&args[0])?)),
            F::True => Value::Bool(true),
            F::False => Value::Bool(false),
            F::Number => Value::Num(self.arg_number(args, 0)?),
            F::Sum => {
                let nodes = self.arg_nodes(args, 0)?;
                Value::Num(nodes.iter().map(|n| parse_number(&self.node_string(*n))).sum())
            }
            F::Floor => Value::Num(self.arg_number(args, 0)?.floor()),
            F::Ceiling => Value::Num(self.arg_number(args, 0)?.ceil()),
            F::Round => Value::Num(xpath_round(self.arg_number(args, 0)?)),
        };
        Ok(v)
    }
}

fn xpath_round(n: f64) -> f64 {
    if n.is_nan() || n.is_infinite() {
        n
    } else {
        (n + 0.5).floor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_format_like_xpath() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert!(parse_number(" 12 ") == 12.0);
        assert!(parse_number("1e3").is_nan());
    }

    #[test]
    fn round_goes_half_up() {
        assert_eq!(xpath_round(2.5), 3.0);
        assert_eq!(xpath_round(-2.5), -2.0);
    }
}
