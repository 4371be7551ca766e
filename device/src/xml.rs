use std::borrow::Cow;

use once_cell::sync::Lazy;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use regex::Regex;

use crate::error::{AppError, Result};
use crate::snapshot::{DEFAULT_CLASS, ROOT_CLASS, Snapshot};

/// Reserved attribute that ties an indexed dump back to its snapshot node.
pub const INDEX_ATTRIBUTE: &str = "uiElementIndex";

static SEPARATORS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[$@#&]").unwrap());
static DOTS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.+").unwrap());
static NON_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\p{L}\p{N}\-._]").unwrap());
static NON_ASCII_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9\-._]").unwrap());

#[derive(Debug, Clone, Copy, Default)]
pub struct XmlOptions {
    /// Adds [`INDEX_ATTRIBUTE`] to every element. Never for public page source.
    pub indexed: bool,
    pub normalize_tag_names: bool,
}

/// Element name for a class name: `$`, `@`, `#`, `&` become `.`, runs of dots
/// collapse, outer dots go away.
pub fn tag_name(class_name: &str, normalize: bool) -> String {
    let fixed = SEPARATORS_RE.replace_all(class_name, ".");
    let fixed = DOTS_RE.replace_all(&fixed, ".");
    let fixed = fixed.trim_matches('.');

    let fixed: Cow<str> = if normalize {
        let ascii = deunicode::deunicode(fixed);
        Cow::Owned(NON_ASCII_NAME_RE.replace_all(&ascii, "_").into_owned())
    } else {
        NON_NAME_RE.replace_all(fixed, "_")
    };

    let mut fixed = fixed.into_owned();
    if fixed.is_empty() {
        return DEFAULT_CLASS.to_string();
    }
    if fixed.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
        fixed.insert(0, '_');
    }
    if fixed != class_name {
        tracing::debug!(from = class_name, to = %fixed, "rewrote class name into a valid tag");
    }
    fixed
}

fn is_xml_char(c: char) -> bool {
    matches!(c,
        '\u{9}' | '\u{A}' | '\u{D}'
        | '\u{20}'..='\u{D7FF}'
        | '\u{E000}'..='\u{FFFD}'
        | '\u{10000}'..='\u{10FFFF}')
}

/// Replaces characters XML 1.0 cannot carry with `?`.
pub fn safe_xml_string(s: &str) -> Cow<'_, str> {
    if s.chars().all(is_xml_char) {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(s.chars().map(|c| if is_xml_char(c) { c } else { '?' }).collect())
    }
}

fn xml_error(e: impl std::fmt::Display) -> AppError {
    AppError::new(format!("cannot serialize page source: {e}"))
}

pub fn to_xml(snapshot: &Snapshot, opts: &XmlOptions) -> Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), Some("yes"))))
        .map_err(xml_error)?;
    if !snapshot.is_empty() {
        write_node(&mut writer, snapshot, 0, opts)?;
    }
    String::from_utf8(writer.into_inner()).map_err(xml_error)
}

fn write_node(
    writer: &mut Writer<Vec<u8>>,
    snapshot: &Snapshot,
    index: usize,
    opts: &XmlOptions,
) -> Result<()> {
    let node = &snapshot.nodes()[index];
    let synthetic_root = index == 0 && !snapshot.is_scoped();

    let tag = if synthetic_root {
        ROOT_CLASS.to_string()
    } else {
        tag_name(node.class_name(), opts.normalize_tag_names)
    };
    let mut start = BytesStart::new(tag.as_str());

    if synthetic_root {
        let display = snapshot.display();
        start.push_attribute(("rotation", display.rotation.to_string().as_str()));
        start.push_attribute(("width", display.width.to_string().as_str()));
        start.push_attribute(("height", display.height.to_string().as_str()));
    } else {
        for (attr, value) in node.attributes.iter() {
            if !attr.exposable_to_xml() {
                continue;
            }
            let value = value.to_string();
            start.push_attribute((attr.name(), safe_xml_string(&value).as_ref()));
        }
    }
    if opts.indexed {
        start.push_attribute((INDEX_ATTRIBUTE, node.index.to_string().as_str()));
    }

    if node.children.is_empty() {
        writer.write_event(Event::Empty(start)).map_err(xml_error)?;
        return Ok(());
    }
    writer.write_event(Event::Start(start)).map_err(xml_error)?;
    for &child in &node.children {
        write_node(writer, snapshot, child, opts)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(tag.as_str())))
        .map_err(xml_error)?;
    Ok(())
}
