//! DOM operations used by the rule engine
//!
//! Thin layer over `scraper`: parse, query by selector, remove nodes,
//! swap a node's outer markup for a literal, walk text nodes, serialize.

use scraper::node::{Comment, Node};
use scraper::{Html, Selector};
use uuid::Uuid;

/// Mutable HTML document
pub struct HtmlDocument {
    html: Html,
    /// Comment markers standing in for replacement markup until serialization
    replacements: Vec<(String, String)>,
    nonce: String,
    modified: bool,
}

impl HtmlDocument {
    /// Parse a full document; html5ever recovers from any malformed input
    pub fn parse(content: &str) -> Self {
        Self {
            html: Html::parse_document(content),
            replacements: Vec::new(),
            nonce: Uuid::new_v4().simple().to_string(),
            modified: false,
        }
    }

    /// Number of elements matching `selector`
    pub fn count(&self, selector: &Selector) -> usize {
        self.html.select(selector).count()
    }

    /// Detach every element matching `selector`, returning how many matched
    pub fn remove_matching(&mut self, selector: &Selector) -> usize {
        let ids: Vec<_> = self.html.select(selector).map(|el| el.id()).collect();

        for id in &ids {
            if let Some(mut node) = self.html.tree.get_mut(*id) {
                node.detach();
            }
        }

        if !ids.is_empty() {
            self.modified = true;
        }
        ids.len()
    }

    /// Replace the outer markup of every element matching `selector` with `replacement`
    ///
    /// The replacement is inserted verbatim, it is not parsed into the tree.
    pub fn replace_matching(&mut self, selector: &Selector, replacement: &str) -> usize {
        let ids: Vec<_> = self.html.select(selector).map(|el| el.id()).collect();

        for id in &ids {
            let marker = format!("subtract-{}-{}", self.nonce, self.replacements.len());
            if let Some(mut node) = self.html.tree.get_mut(*id) {
                node.insert_before(Node::Comment(Comment {
                    comment: marker.as_str().into(),
                }));
                node.detach();
                self.replacements.push((marker, replacement.to_string()));
            }
        }

        if !ids.is_empty() {
            self.modified = true;
        }
        ids.len()
    }

    /// Rewrite each text node under `<body>`
    ///
    /// `rewrite` returns `None` to leave a node untouched. Markup is never
    /// visited.
    pub fn rewrite_text_nodes<F>(&mut self, mut rewrite: F)
    where
        F: FnMut(&str) -> Option<String>,
    {
        let body = self
            .html
            .tree
            .root()
            .descendants()
            .find(|node| node.value().as_element().is_some_and(|el| el.name() == "body"));

        let text_ids: Vec<_> = match body {
            Some(body) => body
                .descendants()
                .filter(|node| node.value().is_text())
                .map(|node| node.id())
                .collect(),
            None => return,
        };

        for id in text_ids {
            let Some(mut node) = self.html.tree.get_mut(id) else {
                continue;
            };
            if let Node::Text(text) = node.value() {
                if let Some(updated) = rewrite(&text.text) {
                    if *updated != *text.text {
                        text.text = updated.as_str().into();
                        self.modified = true;
                    }
                }
            }
        }
    }

    /// Whether any operation changed the tree
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Render the document back to markup
    pub fn serialize(&self) -> String {
        let mut out = self.html.html();
        for (marker, replacement) in &self.replacements {
            out = out.replace(&format!("<!--{marker}-->"), replacement);
        }
        out
    }
}
