//! The spider queue for one run, including the keyword cross-product:
//! each keyword token clones every keyword-capable spider once.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::spider::Spider;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<([^<>]*)>").expect("static regex"));

#[derive(Default)]
pub struct SpiderQueue {
    list: Vec<Arc<Spider>>,
}

impl SpiderQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.list.clear();
    }

    pub fn add(&mut self, spider: Spider) {
        spider.set_id(self.list.len());
        self.list.push(Arc::new(spider));
    }

    /// Splits `keywords` into tokens and cross-products them with every
    /// keyword-capable spider that has no keyword yet; each clone gets one
    /// token. Spiders that cannot take keywords are re-appended unchanged.
    pub fn add_keywords(&mut self, keywords: &str) {
        let tokens = parse_tokens(keywords);
        if tokens.is_empty() {
            return;
        }

        let mut fixed: Vec<Arc<Spider>> = Vec::new();
        let mut capable: Vec<Arc<Spider>> = Vec::new();
        for spider in self.list.drain(..) {
            if spider.accepts_keyword && spider.keyword().is_empty() {
                capable.push(spider);
            } else {
                fixed.push(spider);
            }
        }

        if capable.is_empty() {
            warn!("keyword input given but no spider accepts keywords");
            self.list = fixed;
            return;
        }

        for token in &tokens {
            for spider in &capable {
                let clone = spider.copy();
                clone.set_keyword(token);
                self.add_arc_inner(clone);
            }
        }
        for spider in fixed {
            let id = self.list.len();
            spider.set_id(id);
            self.list.push(spider);
        }
    }

    fn add_arc_inner(&mut self, spider: Spider) {
        spider.set_id(self.list.len());
        self.list.push(Arc::new(spider));
    }

    pub fn get(&self, index: usize) -> Option<Arc<Spider>> {
        self.list.get(index).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Spider>> {
        self.list.iter().find(|s| s.name == name).cloned()
    }

    pub fn all(&self) -> &[Arc<Spider>] {
        &self.list
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

/// `<a><b>` yields the bracketed tokens; anything else is one token.
fn parse_tokens(keywords: &str) -> Vec<String> {
    let trimmed = keywords.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let wrapped: Vec<String> = TOKEN_RE
        .captures_iter(trimmed)
        .map(|c| c[1].trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if wrapped.is_empty() {
        vec![trimmed.to_string()]
    } else {
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::spider::ParseFn;

    fn noop() -> ParseFn {
        Arc::new(|_ctx: &mut Context| {})
    }

    #[test]
    fn token_parsing() {
        assert_eq!(parse_tokens("rust"), ["rust"]);
        assert_eq!(parse_tokens("<a><b c>"), ["a", "b c"]);
        assert!(parse_tokens("  ").is_empty());
    }

    #[test]
    fn cross_product_clones_capable_spiders() {
        let mut queue = SpiderQueue::new();
        queue.add(Spider::new("keyed", noop()).keyword_capable());
        queue.add(Spider::new("plain", noop()));

        queue.add_keywords("<x><y>");
        assert_eq!(queue.len(), 3);

        let keywords: Vec<String> = queue
            .all()
            .iter()
            .filter(|s| s.name == "keyed")
            .map(|s| s.keyword())
            .collect();
        assert_eq!(keywords, ["x", "y"]);
        assert!(queue.get_by_name("plain").unwrap().keyword().is_empty());
        // ids follow queue order
        for (i, spider) in queue.all().iter().enumerate() {
            assert_eq!(spider.id(), i);
        }
    }

    #[test]
    fn no_capable_spiders_keeps_queue() {
        let mut queue = SpiderQueue::new();
        queue.add(Spider::new("plain", noop()));
        queue.add_keywords("rust");
        assert_eq!(queue.len(), 1);
    }
}
