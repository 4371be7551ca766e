//! The `-android uiautomator` predicate language.
//!
//! ```text
//! new UiSelector().className("android.widget.Button").textContains("OK");
//! resourceId("com.example:id/list").childSelector(new UiSelector().instance(2))
//! ```
//!
//! Statements are separated by `;` and each one is an independent selector; a
//! locator matches the union of its statements. Matching walks the native tree
//! the same way a snapshot does, so invisible subtrees are skipped unless the
//! session allows them.

use regex::Regex;

use crate::error::{AppError, Result};
use crate::native::{AxNode, NodeHandle, SearchSpace, WalkOptions, dedup_by_identity};

#[derive(Debug, Clone)]
enum StrMatch {
    Equals(String),
    Contains(String),
    StartsWith(String),
    Matches(Regex),
}

impl StrMatch {
    fn is_match(&self, value: Option<String>) -> bool {
        let Some(value) = value else {
            return false;
        };
        match self {
            StrMatch::Equals(s) => value == *s,
            StrMatch::Contains(s) => value.contains(s.as_str()),
            StrMatch::StartsWith(s) => value.starts_with(s.as_str()),
            StrMatch::Matches(re) => re.is_match(&value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flag {
    Checkable,
    Checked,
    Clickable,
    Enabled,
    Focusable,
    Focused,
    LongClickable,
    Scrollable,
    Selected,
}

impl Flag {
    fn read(self, node: &dyn AxNode) -> bool {
        match self {
            Flag::Checkable => node.is_checkable(),
            Flag::Checked => node.is_checked(),
            Flag::Clickable => node.is_clickable(),
            Flag::Enabled => node.is_enabled(),
            Flag::Focusable => node.is_focusable(),
            Flag::Focused => node.is_focused(),
            Flag::LongClickable => node.is_long_clickable(),
            Flag::Scrollable => node.is_scrollable(),
            Flag::Selected => node.is_selected(),
        }
    }
}

#[derive(Debug, Clone)]
enum Criterion {
    Text(StrMatch),
    ClassName(StrMatch),
    Description(StrMatch),
    ResourceId(StrMatch),
    Package(StrMatch),
    Flag(Flag, bool),
}

impl Criterion {
    fn is_match(&self, node: &dyn AxNode) -> bool {
        match self {
            Criterion::Text(m) => m.is_match(node.text()),
            Criterion::ClassName(m) => m.is_match(node.class_name()),
            Criterion::Description(m) => m.is_match(node.content_description()),
            Criterion::ResourceId(m) => m.is_match(node.resource_id()),
            Criterion::Package(m) => m.is_match(node.package_name()),
            Criterion::Flag(flag, expected) => flag.read(node) == *expected,
        }
    }
}

#[derive(Debug, Clone)]
enum Retarget {
    Child(Box<UiSelector>),
    Sibling(Box<UiSelector>),
}

#[derive(Debug, Clone, Default)]
pub struct UiSelector {
    criteria: Vec<Criterion>,
    index: Option<usize>,
    instance: Option<usize>,
    retarget: Option<Retarget>,
}

impl UiSelector {
    /// Parses every `;`-separated statement. Blank statements are skipped.
    pub fn parse_all(src: &str) -> Result<Vec<UiSelector>> {
        let mut parser = SelectorParser { src, pos: 0 };
        let mut out = Vec::new();
        loop {
            if parser.eat(';') {
                continue;
            }
            parser.skip_ws();
            if parser.at_end() {
                break;
            }
            out.push(parser.selector()?);
            if !parser.eat(';') {
                parser.skip_ws();
                if !parser.at_end() {
                    return Err(parser.error("expected ';' or end of input"));
                }
                break;
            }
        }
        if out.is_empty() {
            return Err(AppError::InvalidSelector(format!(
                "'{src}' does not contain a selector"
            )));
        }
        Ok(out)
    }

    fn target(&self) -> &UiSelector {
        match &self.retarget {
            Some(Retarget::Child(sub) | Retarget::Sibling(sub)) => sub.target(),
            None => self,
        }
    }

    fn target_mut(&mut self) -> &mut UiSelector {
        match self.retarget {
            Some(Retarget::Child(ref mut sub) | Retarget::Sibling(ref mut sub)) => sub.target_mut(),
            None => self,
        }
    }

    /// True when the element being selected is pinned to one instance.
    pub fn has_instance(&self) -> bool {
        self.target().instance.is_some()
    }

    /// Copy of this selector that picks the `n`-th match of its target.
    pub fn with_instance(&self, n: usize) -> UiSelector {
        let mut sel = self.clone();
        sel.target_mut().instance = Some(n);
        sel
    }

    fn matches(&self, node: &dyn AxNode, position: usize) -> bool {
        if self.index.is_some_and(|i| i != position) {
            return false;
        }
        self.criteria.iter().all(|c| c.is_match(node))
    }

    /// Every node the selector picks, in pre-order.
    pub fn find_all(&self, space: &SearchSpace, opts: WalkOptions) -> Vec<NodeHandle> {
        self.resolve(std::slice::from_ref(space), opts)
    }

    pub fn find_first(&self, space: &SearchSpace, opts: WalkOptions) -> Option<NodeHandle> {
        self.find_all(space, opts).into_iter().next()
    }

    fn resolve(&self, spaces: &[SearchSpace], opts: WalkOptions) -> Vec<NodeHandle> {
        let mut matched = Vec::new();
        for space in spaces {
            space.walk(opts, &mut |node, position| {
                if self.matches(node.as_ref(), position) {
                    matched.push(node.clone());
                }
                true
            });
        }
        let mut matched = dedup_by_identity(matched);
        if let Some(n) = self.instance {
            matched = matched.into_iter().nth(n).into_iter().collect();
        }

        match &self.retarget {
            None => matched,
            Some(Retarget::Child(sub)) => {
                let spaces: Vec<_> = matched.into_iter().map(SearchSpace::Under).collect();
                sub.resolve(&spaces, opts)
            }
            Some(Retarget::Sibling(sub)) => {
                let parents = dedup_by_identity(matched.iter().filter_map(|n| n.parent()));
                let spaces: Vec<_> = parents.into_iter().map(SearchSpace::Under).collect();
                sub.resolve(&spaces, opts)
            }
        }
    }
}

struct SelectorParser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> SelectorParser<'a> {
    fn error(&self, reason: &str) -> AppError {
        AppError::InvalidSelector(format!(
            "cannot parse UiSelector '{}' at offset {}: {reason}",
            self.src, self.pos
        ))
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn eat(&mut self, c: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{c}'")))
        }
    }

    fn ident(&mut self) -> Result<&'a str> {
        self.skip_ws();
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.bump();
        }
        if start == self.pos {
            return Err(self.error("expected a method name"));
        }
        Ok(&self.src[start..self.pos])
    }

    fn string(&mut self) -> Result<String> {
        self.skip_ws();
        if self.bump() != Some('"') {
            return Err(self.error("expected a string literal"));
        }
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some(c @ ('"' | '\\')) => out.push(c),
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c) => {
                        out.push('\\');
                        out.push(c);
                    }
                    None => break,
                },
                Some(c) => out.push(c),
                None => break,
            }
        }
        Err(self.error("unterminated string literal"))
    }

    fn regex(&mut self) -> Result<Regex> {
        let pattern = self.string()?;
        // matches() semantics: the whole value must match
        Regex::new(&format!("^(?:{pattern})$"))
            .map_err(|e| self.error(&format!("invalid regex '{pattern}': {e}")))
    }

    fn count(&mut self) -> Result<usize> {
        self.skip_ws();
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
        self.src[start..self.pos]
            .parse()
            .map_err(|_| self.error("expected a non-negative integer"))
    }

    fn boolean(&mut self) -> Result<bool> {
        match self.ident() {
            Ok("true") => Ok(true),
            Ok("false") => Ok(false),
            _ => Err(self.error("expected true or false")),
        }
    }

    fn selector(&mut self) -> Result<UiSelector> {
        let mut sel = UiSelector::default();
        let save = self.pos;
        if self.ident().ok() == Some("new") {
            let class = self.ident()?;
            if class != "UiSelector" {
                return Err(self.error(&format!("unsupported class '{class}'")));
            }
            self.expect('(')?;
            self.expect(')')?;
            if !self.eat('.') {
                return Ok(sel);
            }
        } else {
            self.pos = save;
        }

        loop {
            self.method(&mut sel)?;
            if !self.eat('.') {
                return Ok(sel);
            }
        }
    }

    fn method(&mut self, sel: &mut UiSelector) -> Result<()> {
        let name = self.ident()?;
        self.expect('(')?;
        let criterion = match name {
            "text" => Some(Criterion::Text(StrMatch::Equals(self.string()?))),
            "textContains" => Some(Criterion::Text(StrMatch::Contains(self.string()?))),
            "textStartsWith" => Some(Criterion::Text(StrMatch::StartsWith(self.string()?))),
            "textMatches" => Some(Criterion::Text(StrMatch::Matches(self.regex()?))),
            "className" => Some(Criterion::ClassName(StrMatch::Equals(self.string()?))),
            "classNameMatches" => Some(Criterion::ClassName(StrMatch::Matches(self.regex()?))),
            "description" => Some(Criterion::Description(StrMatch::Equals(self.string()?))),
            "descriptionContains" => {
                Some(Criterion::Description(StrMatch::Contains(self.string()?)))
            }
            "descriptionStartsWith" => {
                Some(Criterion::Description(StrMatch::StartsWith(self.string()?)))
            }
            "descriptionMatches" => Some(Criterion::Description(StrMatch::Matches(self.regex()?))),
            "resourceId" => Some(Criterion::ResourceId(StrMatch::Equals(self.string()?))),
            "resourceIdMatches" => Some(Criterion::ResourceId(StrMatch::Matches(self.regex()?))),
            "packageName" => Some(Criterion::Package(StrMatch::Equals(self.string()?))),
            "packageNameMatches" => Some(Criterion::Package(StrMatch::Matches(self.regex()?))),
            "checkable" => Some(Criterion::Flag(Flag::Checkable, self.boolean()?)),
            "checked" => Some(Criterion::Flag(Flag::Checked, self.boolean()?)),
            "clickable" => Some(Criterion::Flag(Flag::Clickable, self.boolean()?)),
            "enabled" => Some(Criterion::Flag(Flag::Enabled, self.boolean()?)),
            "focusable" => Some(Criterion::Flag(Flag::Focusable, self.boolean()?)),
            "focused" => Some(Criterion::Flag(Flag::Focused, self.boolean()?)),
            "longClickable" => Some(Criterion::Flag(Flag::LongClickable, self.boolean()?)),
            "scrollable" => Some(Criterion::Flag(Flag::Scrollable, self.boolean()?)),
            "selected" => Some(Criterion::Flag(Flag::Selected, self.boolean()?)),
            "index" => {
                sel.index = Some(self.count()?);
                None
            }
            "instance" => {
                sel.instance = Some(self.count()?);
                None
            }
            "childSelector" => {
                sel.retarget = Some(Retarget::Child(Box::new(self.selector()?)));
                None
            }
            "fromParent" => {
                sel.retarget = Some(Retarget::Sibling(Box::new(self.selector()?)));
                None
            }
            other => return Err(self.error(&format!("unknown method '{other}'"))),
        };
        sel.criteria.extend(criterion);
        self.expect(')')
    }
}
