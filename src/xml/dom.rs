//! Owned, namespace-aware element tree.
//!
//! Parsing is done with `quick-xml`. Every element records the namespace
//! bindings in scope at that point in the source document, so any subtree can
//! later be canonicalized on its own.

use std::collections::BTreeMap;

use quick_xml::{
    escape::unescape,
    events::{BytesStart, Event},
    reader::Reader,
};

use super::{MAX_DEPTH, MAX_DOCUMENT_SIZE, NS_XML, XmlError, escape_attr, escape_text};

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
    Comment(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub prefix: Option<String>,
    pub name: String,
    pub namespace: Option<String>,
    pub value: String,
}

impl Attribute {
    pub fn qualified_name(&self) -> String {
        match &self.prefix {
            Some(p) => format!("{p}:{}", self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub prefix: Option<String>,
    pub name: String,
    pub namespace: Option<String>,
    pub attributes: Vec<Attribute>,
    /// Declarations written on this element. `None` is the default namespace.
    pub namespace_decls: Vec<(Option<String>, String)>,
    /// Prefix bindings in scope here, `""` for the default namespace.
    pub in_scope: BTreeMap<String, String>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn qualified_name(&self) -> String {
        match &self.prefix {
            Some(p) => format!("{p}:{}", self.name),
            None => self.name.clone(),
        }
    }

    pub fn is(&self, namespace: &str, name: &str) -> bool {
        self.name == name && self.namespace.as_deref() == Some(namespace)
    }

    /// Value of an unqualified attribute.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.namespace.is_none() && a.name == name)
            .map(|a| a.value.as_str())
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            _ => None,
        })
    }

    pub fn children_named<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> impl Iterator<Item = &'a Element> + 'a {
        self.elements().filter(move |e| e.is(namespace, name))
    }

    pub fn child(&self, namespace: &str, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.is(namespace, name))
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn trimmed_text(&self) -> String {
        self.text().trim().to_string()
    }

    /// Depth-first visit of this element and all descendants.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Element)) {
        visit(self);
        for child in self.elements() {
            child.walk(visit);
        }
    }

    /// Number of elements in this subtree whose `ID` equals `id`.
    pub fn count_ids(&self, id: &str) -> usize {
        let mut count = 0;
        self.walk(&mut |e| {
            if e.attr("ID") == Some(id) {
                count += 1;
            }
        });
        count
    }

    /// Insert an element as the `index`-th child node.
    pub fn insert_child(&mut self, index: usize, element: Element) {
        let index = index.min(self.children.len());
        self.children.insert(index, Node::Element(element));
    }

    /// Child-node index of the first element child matching the name.
    pub fn position_of(&self, namespace: &str, name: &str) -> Option<usize> {
        self.children
            .iter()
            .position(|n| matches!(n, Node::Element(e) if e.is(namespace, name)))
    }

    /// Serialize this element as written, with no XML declaration.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.qualified_name());
        for (prefix, uri) in &self.namespace_decls {
            match prefix {
                Some(p) => out.push_str(&format!(" xmlns:{p}=\"{}\"", escape_attr(uri))),
                None => out.push_str(&format!(" xmlns=\"{}\"", escape_attr(uri))),
            }
        }
        for attr in &self.attributes {
            out.push_str(&format!(
                " {}=\"{}\"",
                attr.qualified_name(),
                escape_attr(&attr.value)
            ));
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            match child {
                Node::Element(e) => e.write_xml(out),
                Node::Text(t) => out.push_str(&escape_text(t)),
                Node::Comment(c) => {
                    out.push_str("<!--");
                    out.push_str(c);
                    out.push_str("-->");
                }
            }
        }
        out.push_str("</");
        out.push_str(&self.qualified_name());
        out.push('>');
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Parse a document into its root element.
///
/// Document type declarations are refused outright, which also rules out
/// entity expansion. Processing instructions are dropped.
pub fn parse(xml: &str) -> Result<Element, XmlError> {
    if xml.len() > MAX_DOCUMENT_SIZE {
        return Err(XmlError::TooLarge);
    }

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                let element = open_element(e, stack.last().map(|p| &p.in_scope))?;
                if stack.len() >= MAX_DEPTH {
                    return Err(XmlError::Forbidden("excessive nesting"));
                }
                if root.is_some() {
                    return Err(XmlError::Parse("multiple root elements".into()));
                }
                stack.push(element);
            }
            Ok(Event::Empty(ref e)) => {
                let element = open_element(e, stack.last().map(|p| &p.in_scope))?;
                close_element(element, &mut stack, &mut root)?;
            }
            Ok(Event::End(_)) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| XmlError::Parse("unexpected end tag".into()))?;
                close_element(element, &mut stack, &mut root)?;
            }
            Ok(Event::Text(ref t)) => {
                let raw = std::str::from_utf8(t.as_ref())
                    .map_err(|e| XmlError::Parse(e.to_string()))?;
                let text = unescape(&normalize_newlines(raw))
                    .map_err(|e| XmlError::Parse(e.to_string()))?
                    .into_owned();
                push_text(&mut stack, text)?;
            }
            Ok(Event::CData(ref c)) => {
                let raw = std::str::from_utf8(c.as_ref())
                    .map_err(|e| XmlError::Parse(e.to_string()))?;
                push_text(&mut stack, normalize_newlines(raw))?;
            }
            Ok(Event::Comment(ref c)) => {
                if let Some(parent) = stack.last_mut() {
                    let raw = std::str::from_utf8(c.as_ref())
                        .map_err(|e| XmlError::Parse(e.to_string()))?;
                    parent.children.push(Node::Comment(normalize_newlines(raw)));
                }
            }
            Ok(Event::DocType(_)) => return Err(XmlError::Forbidden("DOCTYPE")),
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) => {}
            Ok(Event::Eof) => break,
            Err(e) => return Err(XmlError::Parse(e.to_string())),
        }
    }

    if !stack.is_empty() {
        return Err(XmlError::Parse("unclosed element".into()));
    }
    root.ok_or_else(|| XmlError::Parse("document has no root element".into()))
}

fn normalize_newlines(raw: &str) -> String {
    raw.replace("\r\n", "\n").replace('\r', "\n")
}

fn split_qname(qname: &str) -> (Option<&str>, &str) {
    match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, qname),
    }
}

fn open_element(
    start: &BytesStart<'_>,
    parent_scope: Option<&BTreeMap<String, String>>,
) -> Result<Element, XmlError> {
    let qname = std::str::from_utf8(start.name().as_ref())
        .map_err(|e| XmlError::Parse(e.to_string()))?
        .to_string();
    let (prefix, local) = split_qname(&qname);

    let mut in_scope = parent_scope.cloned().unwrap_or_default();
    let mut namespace_decls = Vec::new();
    let mut raw_attributes = Vec::new();

    for attr in start.attributes() {
        let attr = attr.map_err(|e| XmlError::Parse(e.to_string()))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| XmlError::Parse(e.to_string()))?
            .to_string();
        let raw = std::str::from_utf8(&attr.value).map_err(|e| XmlError::Parse(e.to_string()))?;
        // Attribute-value normalization: literal whitespace becomes a space,
        // character references survive.
        let normalized = normalize_newlines(raw).replace(['\n', '\t'], " ");
        let value = unescape(&normalized)
            .map_err(|e| XmlError::Parse(e.to_string()))?
            .into_owned();

        if key == "xmlns" {
            if value.is_empty() {
                in_scope.remove("");
            } else {
                in_scope.insert(String::new(), value.clone());
            }
            namespace_decls.push((None, value));
        } else if let Some(p) = key.strip_prefix("xmlns:") {
            if value.is_empty() {
                return Err(XmlError::Parse(format!("empty binding for prefix {p}")));
            }
            in_scope.insert(p.to_string(), value.clone());
            namespace_decls.push((Some(p.to_string()), value));
        } else {
            raw_attributes.push((key, value));
        }
    }

    let namespace = match prefix {
        Some("xml") => Some(NS_XML.to_string()),
        Some(p) => Some(
            in_scope
                .get(p)
                .cloned()
                .ok_or_else(|| XmlError::Parse(format!("unbound prefix {p}")))?,
        ),
        None => in_scope.get("").cloned(),
    };

    let mut attributes = Vec::with_capacity(raw_attributes.len());
    for (key, value) in raw_attributes {
        let (attr_prefix, attr_local) = split_qname(&key);
        let attr_namespace = match attr_prefix {
            None => None,
            Some("xml") => Some(NS_XML.to_string()),
            Some(p) => Some(
                in_scope
                    .get(p)
                    .cloned()
                    .ok_or_else(|| XmlError::Parse(format!("unbound prefix {p}")))?,
            ),
        };
        attributes.push(Attribute {
            prefix: attr_prefix.map(str::to_string),
            name: attr_local.to_string(),
            namespace: attr_namespace,
            value,
        });
    }

    Ok(Element {
        prefix: prefix.map(str::to_string),
        name: local.to_string(),
        namespace,
        attributes,
        namespace_decls,
        in_scope,
        children: Vec::new(),
    })
}

fn close_element(
    element: Element,
    stack: &mut [Element],
    root: &mut Option<Element>,
) -> Result<(), XmlError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(Node::Element(element));
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(element);
            Ok(())
        }
        None => Err(XmlError::Parse("multiple root elements".into())),
    }
}

fn push_text(stack: &mut [Element], text: String) -> Result<(), XmlError> {
    match stack.last_mut() {
        Some(parent) => {
            if let Some(Node::Text(existing)) = parent.children.last_mut() {
                existing.push_str(&text);
            } else {
                parent.children.push(Node::Text(text));
            }
            Ok(())
        }
        None if text.trim().is_empty() => Ok(()),
        None => Err(XmlError::Parse("text outside the root element".into())),
    }
}
