//! Owned XML tree with namespace resolution and Exclusive XML Canonicalization.
//!
//! SAML responses are small, so the whole document is parsed into an arena of
//! nodes up front. Signature verification needs random access (find the
//! signed element by ID, canonicalize a subtree while leaving out the
//! enveloped signature) which a streaming reader cannot give.
//!
//! Parsing rejects any `<!DOCTYPE>`, so no entity expansion ever happens.

use std::collections::{BTreeMap, BTreeSet};

use quick_xml::{Reader, escape::unescape, events::Event};
use thiserror::Error;

pub const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// Nesting depth beyond which a document is refused.
const MAX_DEPTH: usize = 128;

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("XML syntax error: {0}")]
    Syntax(String),

    #[error("document type declarations are not allowed")]
    DoctypeForbidden,

    #[error("document is not valid UTF-8")]
    Encoding,

    #[error("undeclared namespace prefix '{0}'")]
    UnboundPrefix(String),

    #[error("document nesting exceeds {MAX_DEPTH} levels")]
    TooDeep,

    #[error("document has no root element")]
    NoRoot,

    #[error("content outside the root element")]
    TrailingContent,
}

pub type NodeId = usize;

#[derive(Debug)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    kind: NodeKind,
}

#[derive(Debug)]
enum NodeKind {
    Element(Element),
    Text(String),
    ProcessingInstruction(String),
}

#[derive(Debug)]
struct Element {
    prefix: Option<String>,
    local: String,
    namespace: Option<String>,
    /// Namespace declarations made on this element, keyed by prefix
    /// (empty string for the default namespace). An empty URI undeclares.
    namespace_decls: Vec<(String, String)>,
    attributes: Vec<Attribute>,
}

#[derive(Debug)]
struct Attribute {
    prefix: Option<String>,
    local: String,
    namespace: Option<String>,
    value: String,
}

impl Attribute {
    fn qualified_name(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{}", self.local),
            None => self.local.clone(),
        }
    }
}

/// A parsed XML document.
#[derive(Debug)]
pub struct Document {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Document {
    pub fn parse(input: &str) -> Result<Self, XmlError> {
        Parser::default().parse(input)
    }

    pub fn root(&self) -> ElementRef<'_> {
        ElementRef {
            doc: self,
            id: self.root,
        }
    }

    fn element(&self, id: NodeId) -> Option<&Element> {
        match &self.nodes.get(id)?.kind {
            NodeKind::Element(element) => Some(element),
            _ => None,
        }
    }

    /// Namespace URI bound to `prefix` in scope at `id`. Walks the full
    /// ancestor chain, including ancestors outside any canonicalized subset.
    fn lookup_namespace(&self, id: NodeId, prefix: &str) -> Option<&str> {
        lookup_namespace(&self.nodes, id, prefix)
    }
}

/// Borrowed handle to an element node.
#[derive(Debug, Clone, Copy)]
pub struct ElementRef<'a> {
    doc: &'a Document,
    id: NodeId,
}

impl<'a> ElementRef<'a> {
    pub fn node_id(self) -> NodeId {
        self.id
    }

    fn data(self) -> &'a Element {
        match &self.doc.nodes[self.id].kind {
            NodeKind::Element(element) => element,
            // ElementRef is only ever built for element nodes
            _ => unreachable!("ElementRef points at a non-element node"),
        }
    }

    pub fn local_name(self) -> &'a str {
        &self.data().local
    }

    pub fn namespace(self) -> Option<&'a str> {
        self.data().namespace.as_deref()
    }

    pub fn is(self, namespace: &str, local: &str) -> bool {
        self.local_name() == local && self.namespace() == Some(namespace)
    }

    /// Value of an attribute without a namespace prefix.
    pub fn attribute(self, local: &str) -> Option<&'a str> {
        self.data()
            .attributes
            .iter()
            .find(|attr| attr.prefix.is_none() && attr.local == local)
            .map(|attr| attr.value.as_str())
    }

    pub fn parent(self) -> Option<ElementRef<'a>> {
        let parent = self.doc.nodes[self.id].parent?;
        self.doc.element(parent)?;
        Some(ElementRef {
            doc: self.doc,
            id: parent,
        })
    }

    /// Child elements in document order.
    pub fn children(self) -> impl Iterator<Item = ElementRef<'a>> {
        let doc = self.doc;
        doc.nodes[self.id]
            .children
            .iter()
            .filter(move |&&child| doc.element(child).is_some())
            .map(move |&child| ElementRef { doc, id: child })
    }

    pub fn children_named(
        self,
        namespace: &'static str,
        local: &'static str,
    ) -> impl Iterator<Item = ElementRef<'a>> {
        self.children()
            .filter(move |child| child.is(namespace, local))
    }

    pub fn child(self, namespace: &'static str, local: &'static str) -> Option<ElementRef<'a>> {
        self.children_named(namespace, local).next()
    }

    /// Every element below this one, in document order.
    pub fn descendants(self) -> Vec<ElementRef<'a>> {
        let mut out = Vec::new();
        let mut stack: Vec<ElementRef<'a>> = self.children().collect();
        stack.reverse();
        while let Some(element) = stack.pop() {
            out.push(element);
            let mut children: Vec<_> = element.children().collect();
            children.reverse();
            stack.extend(children);
        }
        out
    }

    /// Concatenated character data of the direct text children.
    pub fn text(self) -> String {
        self.doc.nodes[self.id]
            .children
            .iter()
            .filter_map(|&child| match &self.doc.nodes[child].kind {
                NodeKind::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Exclusive XML Canonicalization (without comments) of this subtree.
    ///
    /// `exclude` drops one descendant subtree from the output, which is how
    /// the enveloped-signature transform removes the `Signature` element.
    /// `inclusive_prefixes` is the `InclusiveNamespaces PrefixList`; the
    /// token `#default` stands for the default namespace.
    pub fn canonicalize(self, exclude: Option<NodeId>, inclusive_prefixes: &[String]) -> String {
        let mut out = String::new();
        let inclusive: Vec<&str> = inclusive_prefixes
            .iter()
            .map(|prefix| if prefix == "#default" { "" } else { prefix.as_str() })
            .collect();
        Canonicalizer {
            doc: self.doc,
            exclude,
            inclusive: &inclusive,
            out: &mut out,
        }
        .element(self.id, &BTreeMap::new());
        out
    }
}

struct Canonicalizer<'a, 'o> {
    doc: &'a Document,
    exclude: Option<NodeId>,
    inclusive: &'a [&'a str],
    out: &'o mut String,
}

impl<'a> Canonicalizer<'a, '_> {
    fn element(&mut self, id: NodeId, rendered: &BTreeMap<&'a str, &'a str>) {
        let doc = self.doc;
        let Some(element) = doc.element(id) else {
            return;
        };

        // Prefixes visibly utilized by the element name and its attributes,
        // plus the inclusive list. BTreeSet order puts the default ("") first.
        let mut prefixes: BTreeSet<&str> = BTreeSet::new();
        prefixes.insert(element.prefix.as_deref().unwrap_or(""));
        for attr in &element.attributes {
            if let Some(prefix) = attr.prefix.as_deref() {
                prefixes.insert(prefix);
            }
        }
        for &prefix in self.inclusive {
            if doc.lookup_namespace(id, prefix).is_some() {
                prefixes.insert(prefix);
            }
        }

        let mut in_scope = rendered.clone();
        let mut decls: Vec<(&str, &str)> = Vec::new();
        for prefix in prefixes {
            if prefix == "xml" {
                continue;
            }
            let uri = doc.lookup_namespace(id, prefix).unwrap_or("");
            if prefix.is_empty() {
                if uri != rendered.get("").copied().unwrap_or("") {
                    decls.push(("", uri));
                    in_scope.insert("", uri);
                }
            } else if !uri.is_empty() && rendered.get(prefix) != Some(&uri) {
                decls.push((prefix, uri));
                in_scope.insert(prefix, uri);
            }
        }

        let name = qualified_name(element.prefix.as_deref(), &element.local);
        self.out.push('<');
        self.out.push_str(&name);
        for (prefix, uri) in decls {
            if prefix.is_empty() {
                self.out.push_str(" xmlns=\"");
            } else {
                self.out.push_str(" xmlns:");
                self.out.push_str(prefix);
                self.out.push_str("=\"");
            }
            escape_attribute(uri, self.out);
            self.out.push('"');
        }

        let mut attributes: Vec<&Attribute> = element.attributes.iter().collect();
        attributes.sort_by(|a, b| {
            (a.namespace.as_deref().unwrap_or(""), a.local.as_str())
                .cmp(&(b.namespace.as_deref().unwrap_or(""), b.local.as_str()))
        });
        for attr in attributes {
            self.out.push(' ');
            self.out.push_str(&attr.qualified_name());
            self.out.push_str("=\"");
            escape_attribute(&attr.value, self.out);
            self.out.push('"');
        }
        self.out.push('>');

        for &child in &doc.nodes[id].children {
            if Some(child) == self.exclude {
                continue;
            }
            match &doc.nodes[child].kind {
                NodeKind::Element(_) => self.element(child, &in_scope),
                NodeKind::Text(text) => escape_text(text, self.out),
                NodeKind::ProcessingInstruction(pi) => {
                    self.out.push_str("<?");
                    self.out.push_str(pi);
                    self.out.push_str("?>");
                }
            }
        }

        self.out.push_str("</");
        self.out.push_str(&name);
        self.out.push('>');
    }
}

fn qualified_name(prefix: Option<&str>, local: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}:{local}"),
        None => local.to_string(),
    }
}

fn escape_text(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
}

fn escape_attribute(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
}

/// XML 1.0 end-of-line handling: `\r\n` and lone `\r` become `\n`.
fn normalize_line_endings(raw: &str) -> String {
    raw.replace("\r\n", "\n").replace('\r', "\n")
}

#[derive(Default)]
struct Parser {
    nodes: Vec<Node>,
    /// Open elements, innermost last.
    open: Vec<NodeId>,
    root: Option<NodeId>,
}

impl Parser {
    fn parse(mut self, input: &str) -> Result<Document, XmlError> {
        let mut reader = Reader::from_str(input);
        reader.config_mut().trim_text(false);

        loop {
            match reader
                .read_event()
                .map_err(|e| XmlError::Syntax(e.to_string()))?
            {
                Event::Start(start) => {
                    let id = self.start_element(&start)?;
                    self.open.push(id);
                    if self.open.len() > MAX_DEPTH {
                        return Err(XmlError::TooDeep);
                    }
                }
                Event::Empty(start) => {
                    self.start_element(&start)?;
                }
                Event::End(_) => {
                    self.open.pop();
                }
                Event::Text(text) => {
                    let raw = std::str::from_utf8(&text).map_err(|_| XmlError::Encoding)?;
                    let normalized = normalize_line_endings(raw);
                    let value =
                        unescape(&normalized).map_err(|e| XmlError::Syntax(e.to_string()))?;
                    self.push_text(&value)?;
                }
                Event::CData(cdata) => {
                    let raw = std::str::from_utf8(&cdata).map_err(|_| XmlError::Encoding)?;
                    self.push_text(&normalize_line_endings(raw))?;
                }
                Event::PI(pi) => {
                    if let Some(&parent) = self.open.last() {
                        let raw = std::str::from_utf8(&pi).map_err(|_| XmlError::Encoding)?;
                        self.push_node(
                            parent,
                            NodeKind::ProcessingInstruction(normalize_line_endings(raw)),
                        );
                    }
                }
                Event::DocType(_) => return Err(XmlError::DoctypeForbidden),
                Event::Decl(_) | Event::Comment(_) => {}
                Event::Eof => break,
            }
        }

        if !self.open.is_empty() {
            return Err(XmlError::Syntax("unexpected end of document".into()));
        }
        let root = self.root.ok_or(XmlError::NoRoot)?;
        Ok(Document {
            nodes: self.nodes,
            root,
        })
    }

    fn push_node(&mut self, parent: NodeId, kind: NodeKind) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            parent: Some(parent),
            children: Vec::new(),
            kind,
        });
        self.nodes[parent].children.push(id);
        id
    }

    fn push_text(&mut self, text: &str) -> Result<(), XmlError> {
        match self.open.last() {
            Some(&parent) => {
                // Merge adjacent character data (text followed by CDATA)
                if let Some(&last) = self.nodes[parent].children.last()
                    && let NodeKind::Text(existing) = &mut self.nodes[last].kind
                {
                    existing.push_str(text);
                } else {
                    self.push_node(parent, NodeKind::Text(text.to_string()));
                }
                Ok(())
            }
            None if text.trim().is_empty() => Ok(()),
            None => Err(XmlError::TrailingContent),
        }
    }

    fn start_element(
        &mut self,
        start: &quick_xml::events::BytesStart<'_>,
    ) -> Result<NodeId, XmlError> {
        let parent = self.open.last().copied();
        if parent.is_none() && self.root.is_some() {
            return Err(XmlError::TrailingContent);
        }

        let name = std::str::from_utf8(start.name().as_ref())
            .map_err(|_| XmlError::Encoding)?
            .to_string();

        let mut namespace_decls = Vec::new();
        let mut raw_attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| XmlError::Syntax(e.to_string()))?;
            let key = std::str::from_utf8(attr.key.as_ref())
                .map_err(|_| XmlError::Encoding)?
                .to_string();
            let raw = std::str::from_utf8(&attr.value).map_err(|_| XmlError::Encoding)?;
            // Attribute-value normalization: literal whitespace becomes a space
            // before character references are expanded
            let normalized: String = normalize_line_endings(raw)
                .chars()
                .map(|c| if matches!(c, '\t' | '\n') { ' ' } else { c })
                .collect();
            let value = unescape(&normalized)
                .map_err(|e| XmlError::Syntax(e.to_string()))?
                .into_owned();

            if key == "xmlns" {
                namespace_decls.push((String::new(), value));
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                if value.is_empty() {
                    return Err(XmlError::Syntax(format!(
                        "prefix '{prefix}' cannot be undeclared"
                    )));
                }
                namespace_decls.push((prefix.to_string(), value));
            } else {
                raw_attributes.push((key, value));
            }
        }

        let id = self.nodes.len();
        self.nodes.push(Node {
            parent,
            children: Vec::new(),
            kind: NodeKind::Element(Element {
                prefix: None,
                local: String::new(),
                namespace: None,
                namespace_decls,
                attributes: Vec::new(),
            }),
        });
        match parent {
            Some(parent) => self.nodes[parent].children.push(id),
            None => self.root = Some(id),
        }

        let (prefix, local) = split_qname(&name);
        let namespace = self.resolve(id, prefix.unwrap_or(""), prefix.is_some())?;

        let mut attributes = Vec::with_capacity(raw_attributes.len());
        for (key, value) in raw_attributes {
            let (attr_prefix, attr_local) = split_qname(&key);
            // Unprefixed attributes are in no namespace
            let attr_namespace = match attr_prefix {
                Some(p) => self.resolve(id, p, true)?,
                None => None,
            };
            attributes.push(Attribute {
                prefix: attr_prefix.map(str::to_string),
                local: attr_local.to_string(),
                namespace: attr_namespace,
                value,
            });
        }

        if let NodeKind::Element(element) = &mut self.nodes[id].kind {
            element.prefix = prefix.map(str::to_string);
            element.local = local.to_string();
            element.namespace = namespace;
            element.attributes = attributes;
        }
        Ok(id)
    }

    fn resolve(
        &self,
        id: NodeId,
        prefix: &str,
        required: bool,
    ) -> Result<Option<String>, XmlError> {
        match lookup_namespace(&self.nodes, id, prefix) {
            Some(uri) if uri.is_empty() => Ok(None),
            Some(uri) => Ok(Some(uri.to_string())),
            None if required => Err(XmlError::UnboundPrefix(prefix.to_string())),
            None => Ok(None),
        }
    }
}

fn lookup_namespace<'n>(nodes: &'n [Node], id: NodeId, prefix: &str) -> Option<&'n str> {
    if prefix == "xml" {
        return Some(XML_NS);
    }
    let mut current = Some(id);
    while let Some(node_id) = current {
        if let NodeKind::Element(element) = &nodes[node_id].kind
            && let Some((_, uri)) = element
                .namespace_decls
                .iter()
                .find(|(declared, _)| declared == prefix)
        {
            return Some(uri.as_str());
        }
        current = nodes[node_id].parent;
    }
    None
}

fn split_qname(name: &str) -> (Option<&str>, &str) {
    match name.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, name),
    }
}
