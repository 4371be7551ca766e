//! XPath 1.0 over page-source documents.
//!
//! Only element and attribute nodes exist in a dump, so text/comment node
//! tests never match and string values come from attributes.

mod document;
mod eval;
mod lexer;
mod parser;

use std::collections::BTreeSet;

pub use document::Document;

use eval::{Ctx, Value, XNode};
use parser::{Axis, Expr, NodeTest, Parser, Step};

#[derive(Debug, thiserror::Error)]
pub enum XPathError {
    #[error("invalid xpath expression '{expr}': {reason}")]
    Syntax { expr: String, reason: String },
    #[error("xpath evaluation failed: {0}")]
    Eval(String),
    #[error("malformed xml: {0}")]
    Xml(String),
}

impl XPathError {
    fn syntax(expr: &str, reason: String) -> Self {
        XPathError::Syntax {
            expr: expr.to_string(),
            reason,
        }
    }
}

/// Attribute names an expression can look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeRefs {
    All,
    Names(BTreeSet<String>),
}

#[derive(Debug, Clone)]
pub struct XPath {
    source: String,
    expr: Expr,
}

impl XPath {
    pub fn compile(source: &str) -> Result<XPath, XPathError> {
        let toks = lexer::tokenize(source)?;
        let expr = Parser::new(source, toks).parse()?;
        Ok(XPath {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn referenced_attributes(&self) -> AttributeRefs {
        let mut names = BTreeSet::new();
        if collect_attribute_refs(&self.expr, &mut names) {
            AttributeRefs::All
        } else {
            AttributeRefs::Names(names)
        }
    }

    /// Element slots selected by the expression, in document order.
    pub fn select(&self, doc: &Document) -> Result<Vec<usize>, XPathError> {
        match Ctx::root(doc).eval(&self.expr)? {
            Value::Nodes(nodes) => Ok(nodes
                .into_iter()
                .filter_map(|n| match n {
                    XNode::Element(e) if e != 0 => Some(e),
                    _ => None,
                })
                .collect()),
            _ => Err(XPathError::Eval(format!(
                "'{}' does not select nodes",
                self.source
            ))),
        }
    }
}

/// Returns true when any attribute could be read (`@*`, `attribute::node()`).
fn collect_attribute_refs(expr: &Expr, names: &mut BTreeSet<String>) -> bool {
    match expr {
        Expr::Path(path) => steps_refs(&path.steps, names),
        Expr::Filter {
            primary,
            predicates,
            steps,
        } => {
            let mut all = collect_attribute_refs(primary, names);
            for p in predicates {
                all |= collect_attribute_refs(p, names);
            }
            all | steps_refs(steps, names)
        }
        Expr::Union(a, b) | Expr::Binary(_, a, b) => {
            let left = collect_attribute_refs(a, names);
            collect_attribute_refs(b, names) | left
        }
        Expr::Negate(inner) => collect_attribute_refs(inner, names),
        Expr::Call(_, args) => args
            .iter()
            .fold(false, |all, a| collect_attribute_refs(a, names) | all),
        Expr::Literal(_) | Expr::Number(_) => false,
    }
}

fn steps_refs(steps: &[Step], names: &mut BTreeSet<String>) -> bool {
    let mut all = false;
    for step in steps {
        if step.axis == Axis::Attribute {
            match &step.test {
                NodeTest::Name(n) => {
                    names.insert(n.clone());
                }
                _ => all = true,
            }
        }
        for p in &step.predicates {
            all |= collect_attribute_refs(p, names);
        }
    }
    all
}
