use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

/// Element attributes, declared in the order they appear in page source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Attribute {
    Index,
    Package,
    Class,
    Text,
    OriginalText,
    ContentDesc,
    ResourceId,
    Checkable,
    Checked,
    Clickable,
    Enabled,
    Focusable,
    Focused,
    LongClickable,
    Password,
    Scrollable,
    SelectionStart,
    SelectionEnd,
    Selected,
    Bounds,
    Displayed,
    ContentSize,
}

impl Attribute {
    pub const ALL: [Attribute; 22] = [
        Attribute::Index,
        Attribute::Package,
        Attribute::Class,
        Attribute::Text,
        Attribute::OriginalText,
        Attribute::ContentDesc,
        Attribute::ResourceId,
        Attribute::Checkable,
        Attribute::Checked,
        Attribute::Clickable,
        Attribute::Enabled,
        Attribute::Focusable,
        Attribute::Focused,
        Attribute::LongClickable,
        Attribute::Password,
        Attribute::Scrollable,
        Attribute::SelectionStart,
        Attribute::SelectionEnd,
        Attribute::Selected,
        Attribute::Bounds,
        Attribute::Displayed,
        Attribute::ContentSize,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Attribute::Index => "index",
            Attribute::Package => "package",
            Attribute::Class => "class",
            Attribute::Text => "text",
            Attribute::OriginalText => "original-text",
            Attribute::ContentDesc => "content-desc",
            Attribute::ResourceId => "resource-id",
            Attribute::Checkable => "checkable",
            Attribute::Checked => "checked",
            Attribute::Clickable => "clickable",
            Attribute::Enabled => "enabled",
            Attribute::Focusable => "focusable",
            Attribute::Focused => "focused",
            Attribute::LongClickable => "long-clickable",
            Attribute::Password => "password",
            Attribute::Scrollable => "scrollable",
            Attribute::SelectionStart => "selection-start",
            Attribute::SelectionEnd => "selection-end",
            Attribute::Selected => "selected",
            Attribute::Bounds => "bounds",
            Attribute::Displayed => "displayed",
            Attribute::ContentSize => "contentSize",
        }
    }

    fn aliases(self) -> &'static [&'static str] {
        match self {
            Attribute::Class => &["className"],
            Attribute::ContentDesc => &["contentDescription", "name"],
            Attribute::ResourceId => &["resourceId"],
            Attribute::LongClickable => &["longClickable"],
            Attribute::SelectionStart => &["selectionStart"],
            Attribute::SelectionEnd => &["selectionEnd"],
            Attribute::OriginalText => &["originalText"],
            Attribute::ContentSize => &["content-size"],
            _ => &[],
        }
    }

    pub fn exposable_to_xml(self) -> bool {
        !matches!(self, Attribute::OriginalText | Attribute::ContentSize)
    }

    pub fn from_name(name: &str) -> Option<Attribute> {
        Self::ALL
            .into_iter()
            .find(|attr| attr.name() == name || attr.aliases().contains(&name))
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.left >= self.right || self.top >= self.bottom
    }

    /// Clips to `other`. Leaves `self` untouched and returns false if they don't overlap.
    pub fn intersect(&mut self, other: &Rect) -> bool {
        if self.left < other.right
            && other.left < self.right
            && self.top < other.bottom
            && other.top < self.bottom
        {
            self.left = self.left.max(other.left);
            self.top = self.top.max(other.top);
            self.right = self.right.min(other.right);
            self.bottom = self.bottom.min(other.bottom);
            true
        } else {
            false
        }
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}][{},{}]", self.left, self.top, self.right, self.bottom)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Str(String),
    Bool(bool),
    Int(i64),
    Rect(Rect),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Str(s) => f.write_str(s),
            AttrValue::Bool(b) => write!(f, "{b}"),
            AttrValue::Int(i) => write!(f, "{i}"),
            AttrValue::Rect(r) => write!(f, "{r}"),
        }
    }
}

/// Immutable, ordered attribute values of one snapshot node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeBag(BTreeMap<Attribute, AttrValue>);

impl AttributeBag {
    pub fn get(&self, attr: Attribute) -> Option<&AttrValue> {
        self.0.get(&attr)
    }

    pub fn get_str(&self, attr: Attribute) -> Option<&str> {
        match self.0.get(&attr) {
            Some(AttrValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Attribute, &AttrValue)> {
        self.0.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn class_name(&self) -> &str {
        self.get_str(Attribute::Class).unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub(crate) struct AttributeBagBuilder(BTreeMap<Attribute, AttrValue>);

impl AttributeBagBuilder {
    pub fn set(&mut self, attr: Attribute, value: Option<AttrValue>) {
        if let Some(value) = value {
            self.0.insert(attr, value);
        }
    }

    pub fn build(self) -> AttributeBag {
        AttributeBag(self.0)
    }
}

/// Which attributes a snapshot collects. An empty filter collects everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeFilter(BTreeSet<Attribute>);

impl AttributeFilter {
    pub fn all() -> Self {
        Self(BTreeSet::new())
    }

    pub fn only(attrs: impl IntoIterator<Item = Attribute>) -> Self {
        let mut set: BTreeSet<Attribute> = attrs.into_iter().collect();
        if !set.is_empty() {
            // class names the xml node, so it must always be there
            set.insert(Attribute::Class);
        }
        Self(set)
    }

    pub fn includes(&self, attr: Attribute) -> bool {
        self.0.is_empty() || self.0.contains(&attr)
    }
}
