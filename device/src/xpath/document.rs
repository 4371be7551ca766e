use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use super::XPathError;

/// Read-only element tree parsed back from a page-source dump.
///
/// Slot 0 is the document node; elements follow in document order, so
/// comparing slots compares document position.
#[derive(Debug)]
pub struct Document {
    pub(super) nodes: Vec<DocNode>,
}

#[derive(Debug)]
pub(super) struct DocNode {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

impl Document {
    pub fn parse(xml: &str) -> Result<Document, XPathError> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut nodes = vec![DocNode {
            name: String::new(),
            attributes: Vec::new(),
            text: String::new(),
            parent: None,
            children: Vec::new(),
        }];
        let mut open = vec![0usize];

        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) => {
                    let idx = push_element(&mut nodes, &open, e)?;
                    open.push(idx);
                }
                Ok(Event::Empty(ref e)) => {
                    push_element(&mut nodes, &open, e)?;
                }
                Ok(Event::End(_)) => {
                    if open.len() <= 1 {
                        return Err(XPathError::Xml("unbalanced closing tag".into()));
                    }
                    open.pop();
                }
                Ok(Event::Text(ref e)) => {
                    let text = e.unescape().map_err(|err| XPathError::Xml(err.to_string()))?;
                    if let Some(&current) = open.last() {
                        nodes[current].text.push_str(&text);
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(XPathError::Xml(format!(
                        "at position {}: {e}",
                        reader.buffer_position()
                    )));
                }
            }
        }

        if open.len() != 1 {
            return Err(XPathError::Xml("unclosed element at end of input".into()));
        }
        Ok(Document { nodes })
    }

    /// Element slots in document order, excluding the document node.
    pub fn elements(&self) -> impl Iterator<Item = usize> + '_ {
        1..self.nodes.len()
    }

    pub fn name(&self, element: usize) -> &str {
        &self.nodes[element].name
    }

    pub fn attribute(&self, element: usize, name: &str) -> Option<&str> {
        self.nodes
            .get(element)?
            .attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub(super) fn string_value(&self, element: usize) -> String {
        let mut out = String::new();
        self.collect_text(element, &mut out);
        out
    }

    fn collect_text(&self, element: usize, out: &mut String) {
        let node = &self.nodes[element];
        out.push_str(&node.text);
        for &child in &node.children {
            self.collect_text(child, out);
        }
    }
}

fn push_element(nodes: &mut Vec<DocNode>, open: &[usize], e: &BytesStart) -> Result<usize, XPathError> {
    let name = std::str::from_utf8(e.name().as_ref())
        .map_err(|err| XPathError::Xml(format!("bad element name: {err}")))?
        .to_string();
    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| XPathError::Xml(err.to_string()))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|err| XPathError::Xml(format!("bad attribute name: {err}")))?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|err| XPathError::Xml(err.to_string()))?
            .into_owned();
        attributes.push((key, value));
    }

    let parent = open.last().copied().unwrap_or(0);
    let idx = nodes.len();
    nodes.push(DocNode {
        name,
        attributes,
        text: String::new(),
        parent: Some(parent),
        children: Vec::new(),
    });
    nodes[parent].children.push(idx);
    Ok(idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elements_are_stored_in_document_order() {
        let doc = Document::parse(
            r#"<?xml version="1.0"?><hierarchy><a x="1"><b/></a><c y="&lt;2&gt;"/></hierarchy>"#,
        )
        .unwrap();
        let names: Vec<_> = doc.elements().map(|e| doc.name(e)).collect();
        assert_eq!(names, vec!["hierarchy", "a", "b", "c"]);
        assert_eq!(doc.attribute(4, "y"), Some("<2>"));
        assert_eq!(doc.nodes[3].parent, Some(2));
    }

    #[test]
    fn truncated_documents_are_rejected() {
        assert!(Document::parse("<a><b></b>").is_err());
    }
}
