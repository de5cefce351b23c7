//! Canonical XML 1.0 and Exclusive XML Canonicalization 1.0 over an element
//! subtree, as needed for enveloped signatures.

use std::collections::BTreeMap;

use super::dom::{Element, Node};

pub const C14N: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
pub const C14N_WITH_COMMENTS: &str =
    "http://www.w3.org/TR/2001/REC-xml-c14n-20010315#WithComments";
pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const EXC_C14N_WITH_COMMENTS: &str = "http://www.w3.org/2001/10/xml-exc-c14n#WithComments";
pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Inclusive { with_comments: bool },
    Exclusive {
        with_comments: bool,
        /// Prefixes from `InclusiveNamespaces PrefixList`; `#default` is `""`.
        inclusive_prefixes: Vec<String>,
    },
}

impl Method {
    /// Map an algorithm URI to a method. Returns `None` for anything that is
    /// not a canonicalization algorithm.
    pub fn from_uri(uri: &str, inclusive_prefixes: Vec<String>) -> Option<Self> {
        match uri {
            C14N => Some(Method::Inclusive {
                with_comments: false,
            }),
            C14N_WITH_COMMENTS => Some(Method::Inclusive {
                with_comments: true,
            }),
            EXC_C14N => Some(Method::Exclusive {
                with_comments: false,
                inclusive_prefixes,
            }),
            EXC_C14N_WITH_COMMENTS => Some(Method::Exclusive {
                with_comments: true,
                inclusive_prefixes,
            }),
            _ => None,
        }
    }

    fn with_comments(&self) -> bool {
        match self {
            Method::Inclusive { with_comments } | Method::Exclusive { with_comments, .. } => {
                *with_comments
            }
        }
    }
}

/// Parse an `InclusiveNamespaces` `PrefixList` attribute.
pub fn parse_prefix_list(list: &str) -> Vec<String> {
    list.split_whitespace()
        .map(|p| if p == "#default" { String::new() } else { p.to_string() })
        .collect()
}

/// Canonicalize `element` and its descendants.
///
/// `exclude` names one element inside the subtree (compared by identity) that
/// is omitted along with its descendants; this is the enveloped-signature
/// transform.
pub fn canonicalize(element: &Element, method: &Method, exclude: Option<&Element>) -> String {
    let mut out = String::new();
    write_element(element, method, exclude, &BTreeMap::new(), &mut out);
    out
}

fn write_element(
    element: &Element,
    method: &Method,
    exclude: Option<&Element>,
    rendered: &BTreeMap<String, String>,
    out: &mut String,
) {
    let decls = namespace_declarations(element, method, rendered);

    let mut rendered_here = rendered.clone();
    for (prefix, uri) in &decls {
        rendered_here.insert(prefix.clone(), uri.clone());
    }

    let name = element.qualified_name();
    out.push('<');
    out.push_str(&name);
    for (prefix, uri) in &decls {
        if prefix.is_empty() {
            out.push_str(" xmlns=\"");
        } else {
            out.push_str(" xmlns:");
            out.push_str(prefix);
            out.push_str("=\"");
        }
        out.push_str(&escape_attr(uri));
        out.push('"');
    }

    let mut attributes: Vec<_> = element.attributes.iter().collect();
    attributes.sort_by(|a, b| {
        let a_ns = a.namespace.as_deref().unwrap_or("");
        let b_ns = b.namespace.as_deref().unwrap_or("");
        a_ns.cmp(b_ns).then_with(|| a.name.cmp(&b.name))
    });
    for attr in attributes {
        out.push(' ');
        out.push_str(&attr.qualified_name());
        out.push_str("=\"");
        out.push_str(&escape_attr(&attr.value));
        out.push('"');
    }
    out.push('>');

    for child in &element.children {
        match child {
            Node::Element(e) => {
                if exclude.is_some_and(|x| std::ptr::eq(x, e)) {
                    continue;
                }
                write_element(e, method, exclude, &rendered_here, out);
            }
            Node::Text(t) => out.push_str(&escape_text(t)),
            Node::Comment(c) if method.with_comments() => {
                out.push_str("<!--");
                out.push_str(c);
                out.push_str("-->");
            }
            Node::Comment(_) => {}
        }
    }

    out.push_str("</");
    out.push_str(&name);
    out.push('>');
}

/// Namespace declarations to emit on `element`, sorted with the default
/// namespace first and then by prefix.
fn namespace_declarations(
    element: &Element,
    method: &Method,
    rendered: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    let mut decls: BTreeMap<String, String> = BTreeMap::new();

    let mut consider = |prefix: &str| {
        let uri = element.in_scope.get(prefix).cloned().unwrap_or_default();
        let current = rendered.get(prefix).cloned().unwrap_or_default();
        if uri != current {
            decls.insert(prefix.to_string(), uri);
        }
    };

    match method {
        Method::Inclusive { .. } => {
            for prefix in element.in_scope.keys() {
                consider(prefix);
            }
            // An inherited default namespace that is no longer in scope.
            if !element.in_scope.contains_key("") {
                consider("");
            }
        }
        Method::Exclusive {
            inclusive_prefixes, ..
        } => {
            consider(element.prefix.as_deref().unwrap_or(""));
            for attr in &element.attributes {
                if let Some(p) = &attr.prefix
                    && p != "xml"
                {
                    consider(p);
                }
            }
            for prefix in inclusive_prefixes {
                if prefix.is_empty() || element.in_scope.contains_key(prefix) {
                    consider(prefix);
                }
            }
        }
    }

    decls.remove("xml");
    decls.into_iter().collect()
}

fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
    out
}

fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::dom::parse;

    fn exclusive() -> Method {
        Method::Exclusive {
            with_comments: false,
            inclusive_prefixes: Vec::new(),
        }
    }

    #[test]
    fn test_exclusive_renders_only_used_namespaces() {
        let doc = parse(
            r#"<root xmlns:a="urn:a" xmlns:b="urn:b"><a:child b="1" z="2"   y="3"><x/></a:child></root>"#,
        )
        .unwrap();
        let child = doc.elements().next().unwrap();
        assert_eq!(
            canonicalize(child, &exclusive(), None),
            r#"<a:child xmlns:a="urn:a" b="1" y="3" z="2"><x></x></a:child>"#
        );
    }

    #[test]
    fn test_exclusive_honours_prefix_list() {
        let doc = parse(r#"<root xmlns:a="urn:a" xmlns:b="urn:b"><a:child/></root>"#).unwrap();
        let child = doc.elements().next().unwrap();
        let method = Method::Exclusive {
            with_comments: false,
            inclusive_prefixes: parse_prefix_list("b"),
        };
        assert_eq!(
            canonicalize(child, &method, None),
            r#"<a:child xmlns:a="urn:a" xmlns:b="urn:b"></a:child>"#
        );
    }

    #[test]
    fn test_inclusive_renders_inherited_namespaces() {
        let doc = parse(r#"<root xmlns="urn:d" xmlns:b="urn:b"><child/></root>"#).unwrap();
        let child = doc.elements().next().unwrap();
        let method = Method::Inclusive {
            with_comments: false,
        };
        assert_eq!(
            canonicalize(child, &method, None),
            r#"<child xmlns="urn:d" xmlns:b="urn:b"></child>"#
        );
    }

    #[test]
    fn test_nested_declarations_are_not_repeated() {
        let doc = parse(r#"<a:r xmlns:a="urn:a"><a:c xmlns:a="urn:a"><a:d/></a:c></a:r>"#).unwrap();
        assert_eq!(
            canonicalize(&doc, &exclusive(), None),
            r#"<a:r xmlns:a="urn:a"><a:c><a:d></a:d></a:c></a:r>"#
        );
    }

    #[test]
    fn test_comments_and_escaping() {
        let doc = parse("<r a=\"&quot;&#9;\"><!--c-->1 &gt; 0 &amp; &#13;</r>").unwrap();
        assert_eq!(
            canonicalize(&doc, &exclusive(), None),
            "<r a=\"&quot;&#x9;\">1 &gt; 0 &amp; &#xD;</r>"
        );
        let with_comments = Method::Exclusive {
            with_comments: true,
            inclusive_prefixes: Vec::new(),
        };
        assert_eq!(
            canonicalize(&doc, &with_comments, None),
            "<r a=\"&quot;&#x9;\"><!--c-->1 &gt; 0 &amp; &#xD;</r>"
        );
    }

    #[test]
    fn test_excluded_element_is_omitted() {
        let doc = parse(r#"<r><keep/><drop><inner/></drop></r>"#).unwrap();
        let drop = doc.elements().nth(1).unwrap();
        assert_eq!(
            canonicalize(&doc, &exclusive(), Some(drop)),
            "<r><keep></keep></r>"
        );
    }
}
