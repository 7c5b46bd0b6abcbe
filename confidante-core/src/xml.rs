use std::collections::HashMap;

pub mod namespaces;
pub mod stream_parser;
pub mod stream_writer;

#[derive(Debug, Clone)]
enum Node {
    Element(Element),
    Text(String),
    CData(String),
    Comment(String),
    ProcessingInstruction(String),
}

#[derive(Debug, Clone)]
pub struct Element {
    name: String,
    namespace: Option<String>,
    attributes: HashMap<(String, Option<String>), String>,
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: &str, namespace: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.map(|s| s.to_string()),
            attributes: HashMap::new(),
            children: Vec::new(),
        }
    }

    pub fn validate(&self, name: &str, namespace: Option<&str>) -> bool {
        self.name == name && self.namespace == namespace.map(|s| s.to_string())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|child| match child {
            Node::Element(element) => Some(element),
            _ => None,
        })
    }

    pub fn attribute(&self, name: &str, namespace: Option<&str>) -> Option<&str> {
        self.attributes
            .get(&(name.to_string(), namespace.map(|s| s.to_string())))
            .map(|s| s.as_str())
    }

    pub fn set_attribute(&mut self, name: &str, namespace: Option<&str>, value: String) {
        self.attributes.insert(
            (name.to_string(), namespace.map(|s| s.to_string())),
            value.to_string(),
        );
    }

    pub fn remove_attribute(&mut self, name: &str, namespace: Option<&str>) {
        self.attributes
            .remove(&(name.to_string(), namespace.map(|s| s.to_string())));
    }

    pub fn find_child(&self, name: &str, namespace: Option<&str>) -> Option<&Element> {
        self.children.iter().find_map(|child| match child {
            Node::Element(element) => {
                if element.name == name && element.namespace == namespace.map(|s| s.to_string()) {
                    Some(element)
                } else {
                    None
                }
            }
            _ => None,
        })
    }

    pub fn text(&self) -> String {
        let mut text = String::new();
        for child in &self.children {
            match child {
                Node::Element(element) => text.push_str(&element.text()),
                Node::Text(s) => text.push_str(s),
                Node::CData(s) => text.push_str(s),
                _ => {}
            }
        }
        text
    }

    pub fn add_child(&mut self, element: Element) {
        self.children.push(Node::Element(element));
    }

    pub fn with_child<F>(&mut self, name: &str, namespace: Option<&str>, f: F)
    where
        F: FnOnce(&mut Element),
    {
        let mut element = Element::new(name, namespace);
        f(&mut element);
        self.children.push(Node::Element(element));
    }

    pub fn add_text(&mut self, text: String) {
        self.children.push(Node::Text(text));
    }
}
