use anyhow::Result;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::collections::{HashMap, HashSet};

/// One element of the page source, attributes already unescaped.
struct SourceNode {
    tag: String,
    attrs: HashMap<String, String>,
}

impl SourceNode {
    fn parse(e: &BytesStart) -> Result<Self> {
        let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        let mut attrs = HashMap::new();
        for attr in e.attributes() {
            let attr = attr?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            attrs.insert(key, attr.unescape_value()?.into_owned());
        }
        Ok(Self { tag, attrs })
    }

    fn string(&self, name: &str) -> Option<&str> {
        self.attrs
            .get(name)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    fn text(&self) -> Option<&str> {
        self.string("text")
    }

    fn desc(&self) -> Option<&str> {
        self.string("content-desc")
    }

    fn flag(&self, name: &str) -> bool {
        self.string(name) == Some("true")
    }
}

struct Frame {
    printed: bool,
    texts: HashSet<String>,
}

impl Frame {
    fn hidden() -> Self {
        Self {
            printed: false,
            texts: HashSet::new(),
        }
    }
}

const FLAGS: &[&str] = &[
    "long-clickable",
    "scrollable",
    "checkable",
    "checked",
    "focused",
    "selected",
    "password",
];

/// Compact outline of the interesting nodes in a page source dump.
pub fn render_outline(xml: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut lines = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let frame = visit(&SourceNode::parse(&e)?, &stack, &mut lines);
                stack.push(frame);
            }
            Event::Empty(e) => {
                visit(&SourceNode::parse(&e)?, &stack, &mut lines);
            }
            Event::End(_) => {
                stack.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(lines.join("\n"))
}

fn is_interesting(node: &SourceNode) -> bool {
    node.text().is_some()
        || node.desc().is_some()
        || node.flag("clickable")
        || node.flag("scrollable")
        || node.flag("checkable")
        || node.flag("long-clickable")
        || node.flag("focused")
        || node.flag("selected")
}

fn short_class(node: &SourceNode) -> Option<&str> {
    let cls = node.string("class").unwrap_or(&node.tag);
    let name = cls.rsplit('.').next().unwrap_or(cls);
    match name {
        "ViewGroup" | "FrameLayout" | "LinearLayout" | "RelativeLayout" | "ConstraintLayout" => {
            None
        }
        _ => Some(name),
    }
}

fn visit(node: &SourceNode, stack: &[Frame], lines: &mut Vec<String>) -> Frame {
    if node.tag == "hierarchy" {
        return Frame::hidden();
    }
    let parent_texts = stack.last().filter(|f| f.printed).map(|f| &f.texts);

    let only_text = node.text().is_some()
        && node.desc().is_none()
        && !node.flag("clickable")
        && !FLAGS.iter().any(|f| node.flag(f));
    if only_text {
        if let (Some(text), Some(pt)) = (node.text(), parent_texts) {
            if pt.contains(text) {
                return Frame::hidden();
            }
        }
    }

    if !is_interesting(node) {
        return Frame::hidden();
    }

    let indent = "  ".repeat(stack.iter().filter(|f| f.printed).count());
    let cls = short_class(node).unwrap_or("View");
    let mut line = format!("{indent}{cls}");

    if let Some(text) = node.text() {
        line.push_str(&format!(" \"{}\"", text.replace('\n', "\\n")));
    }
    if let Some(desc) = node.desc() {
        line.push_str(&format!(" [{}]", desc.replace('\n', "\\n")));
    }
    if let Some(id) = node.string("resource-id") {
        line.push_str(&format!(" #{}", id.rsplit('/').next().unwrap_or(id)));
    }

    let mut flags = Vec::new();
    let implicitly_clickable = cls == "Button";
    if node.flag("clickable") && !implicitly_clickable {
        flags.push("clickable");
    }
    if !node.flag("clickable") && implicitly_clickable {
        flags.push("NOT-clickable");
    }
    flags.extend(FLAGS.iter().copied().filter(|f| node.flag(f)));
    if !flags.is_empty() {
        line.push_str(&format!(" {}", flags.join(" ")));
    }
    if let Some(bounds) = node.string("bounds") {
        line.push_str(&format!(" {bounds}"));
    }
    lines.push(line);

    let texts = node.text().into_iter().chain(node.desc()).map(String::from).collect();
    Frame {
        printed: true,
        texts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outline_keeps_interesting_nodes() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<hierarchy rotation="0" width="1080" height="1920">
  <android.widget.FrameLayout class="android.widget.FrameLayout" bounds="[0,0][1080,1920]">
    <android.widget.Button class="android.widget.Button" text="OK" clickable="true" resource-id="com.app:id/ok" bounds="[10,10][100,60]">
      <android.widget.TextView class="android.widget.TextView" text="OK" bounds="[12,12][98,58]"/>
    </android.widget.Button>
    <android.widget.ScrollView class="android.widget.ScrollView" scrollable="true" bounds="[0,100][1080,1900]">
      <android.widget.CheckBox class="android.widget.CheckBox" text="A &amp; B" checkable="true" checked="true" clickable="true" bounds="[0,100][500,200]"/>
    </android.widget.ScrollView>
  </android.widget.FrameLayout>
</hierarchy>"#;
        let outline = render_outline(xml).unwrap();
        assert_eq!(
            outline,
            [
                "Button \"OK\" #ok [10,10][100,60]",
                "ScrollView scrollable [0,100][1080,1900]",
                "  CheckBox \"A & B\" clickable checkable checked [0,100][500,200]",
            ]
            .join("\n")
        );
    }

    #[test]
    fn malformed_source_is_an_error() {
        assert!(render_outline("<hierarchy><a></b></hierarchy>").is_err());
    }
}
