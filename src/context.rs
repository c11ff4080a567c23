//! Per-request parse state. A context carries the response through the
//! rule callback, buffering produced items, file artifacts and follow-up
//! requests; the crawler drains the buffers after the callback returns.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Local;
use once_cell::sync::OnceCell;
use serde_json::Value;
use tracing::{error, warn};

use crate::downloader::Response;
use crate::output::{DataCell, FileCell};
use crate::request::{DownloaderKind, Request};
use crate::spider::Spider;

pub struct Context {
    spider: Arc<Spider>,
    request: Request,
    response: Option<Response>,
    /// Response body as UTF-8, transcoded on first use.
    text: OnceCell<String>,
    items: Vec<DataCell>,
    files: Vec<FileCell>,
    queued: Vec<Request>,
}

impl Context {
    pub fn new(spider: Arc<Spider>, request: Request, response: Option<Response>) -> Self {
        Self {
            spider,
            request,
            response,
            text: OnceCell::new(),
            items: Vec::new(),
            files: Vec::new(),
            queued: Vec::new(),
        }
    }

    pub fn spider(&self) -> &Arc<Spider> {
        &self.spider
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn status(&self) -> u16 {
        self.response.as_ref().map(|r| r.status).unwrap_or(0)
    }

    /// The requested URL, as the rule built it.
    pub fn url(&self) -> &str {
        &self.request.url
    }

    pub fn keyword(&self) -> String {
        self.spider.keyword()
    }

    pub fn temp_get(&self, key: &str) -> Option<&Value> {
        self.request.temp_get(key)
    }

    /// Validates a follow-up request and buffers it for admission. The
    /// spider name and cookie flag are stamped on; Referer defaults to
    /// the current response URL.
    pub fn add_queue(&mut self, mut req: Request) {
        if self.spider.is_stopping() {
            return;
        }
        req.spider = self.spider.name.clone();
        req.enable_cookie = self.spider.enable_cookie;
        if let Err(err) = req.prepare() {
            error!(url = %req.url, %err, "dropping malformed request");
            return;
        }
        if req.referer().is_none() {
            if let Some(resp) = &self.response {
                req.set_referer(resp.url.clone());
            }
        }
        self.queued.push(req);
    }

    /// Collects a name-keyed record. Unknown fields are registered on the
    /// rule, preserving encounter order. `rule_name` defaults to the
    /// current rule.
    pub fn output(&mut self, item: HashMap<String, Value>, rule_name: Option<&str>) {
        let name = match self.resolve_rule(rule_name) {
            Some(n) => n,
            None => return,
        };
        if let Some(rule) = self.spider.get_rule(&name) {
            for field in item.keys() {
                rule.upsert_field(field);
            }
        }
        self.push_item(name, item);
    }

    /// Collects an index-keyed record, mapping positions onto the rule's
    /// ordered field names.
    pub fn output_indexed(&mut self, item: HashMap<usize, Value>, rule_name: Option<&str>) {
        let name = match self.resolve_rule(rule_name) {
            Some(n) => n,
            None => return,
        };
        let mapped = self.make_item(&name, item);
        self.push_item(name, mapped);
    }

    /// Maps index-keyed cells onto field names via the rule's ordered
    /// field list. Indexes past the declared fields are dropped.
    pub fn make_item(&self, rule_name: &str, item: HashMap<usize, Value>) -> HashMap<String, Value> {
        let Some(rule) = self.spider.get_rule(rule_name) else {
            error!(spider = %self.spider.name, rule = rule_name, "unknown rule in make_item");
            return HashMap::new();
        };
        let mut mapped = HashMap::with_capacity(item.len());
        for (index, value) in item {
            match rule.field_at(index) {
                Some(field) => {
                    mapped.insert(field, value);
                }
                None => warn!(
                    spider = %self.spider.name,
                    rule = rule_name,
                    index,
                    "no field declared for output index"
                ),
            }
        }
        mapped
    }

    fn push_item(&mut self, rule: String, data: HashMap<String, Value>) {
        let cell = if self.spider.omit_default_fields {
            DataCell {
                rule,
                data,
                url: String::new(),
                parent_url: String::new(),
                download_time: String::new(),
            }
        } else {
            DataCell {
                rule,
                data,
                url: self.url().to_string(),
                parent_url: self.request.referer().unwrap_or_default().to_string(),
                download_time: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            }
        };
        self.items.push(cell);
    }

    /// Collects the response body as a file artifact. `name_or_ext` may
    /// override the name, the extension, or both; defaults derive from
    /// the URL with `.html` as the fallback extension.
    pub fn file_output(&mut self, name_or_ext: Option<&str>) {
        let Some(resp) = &self.response else {
            warn!(url = %self.url(), "file_output without a response");
            return;
        };
        let bytes = resp.body.clone();

        let url_name = self
            .url()
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .split('?')
            .next()
            .unwrap_or_default()
            .to_string();

        let (mut base, mut ext) = (String::new(), String::new());
        if let Some(hint) = name_or_ext {
            let (dir, file) = match hint.rfind('/') {
                Some(i) => (&hint[..=i], &hint[i + 1..]),
                None => ("", hint),
            };
            let (stem, hint_ext) = split_ext(file);
            if !stem.is_empty() {
                base = format!("{dir}{stem}");
            }
            ext = hint_ext;
        }
        if base.is_empty() {
            base = split_ext(&url_name).0;
        }
        if ext.is_empty() {
            ext = split_ext(&url_name).1;
        }
        if ext.is_empty() {
            ext = ".html".to_string();
        }

        self.files.push(FileCell {
            rule: self.request.rule.clone(),
            name: format!("{base}{ext}"),
            bytes,
        });
    }

    /// Appends a field to a rule's ordered list, returning its index.
    pub fn upsert_item_field(&mut self, field: &str, rule_name: Option<&str>) -> Option<usize> {
        let name = self.resolve_rule(rule_name)?;
        self.spider.get_rule(&name).map(|r| r.upsert_field(field))
    }

    /// Invokes a rule's auxiliary callback by name.
    pub fn aid(&mut self, args: HashMap<String, Value>, rule_name: Option<&str>) -> Option<Value> {
        if self.spider.is_stopping() {
            return None;
        }
        let name = self.resolve_rule(rule_name)?;
        let aid = match self.spider.get_rule(&name).and_then(|r| r.aid.clone()) {
            Some(aid) => aid,
            None => {
                error!(spider = %self.spider.name, rule = %name, "rule has no aid callback");
                return None;
            }
        };
        aid(self, args)
    }

    /// Dispatches the response to the named rule's parse callback; an
    /// unknown name falls back to the root entrypoint.
    pub fn run_rule(&mut self, rule_name: &str) {
        if self.spider.is_stopping() {
            return;
        }
        match self.spider.get_rule(rule_name).and_then(|r| r.parse.clone()) {
            Some(parse) => {
                if self.response.is_some() {
                    self.request.rule = rule_name.to_string();
                }
                parse(self);
            }
            None => {
                let root = self.spider.tree.root.clone();
                root(self);
            }
        }
    }

    /// The response body as UTF-8 text, read and transcoded once. The
    /// charset comes from the response Content-Type, then the request's;
    /// only the fast downloader's bodies are transcoded.
    pub fn text(&self) -> &str {
        self.text.get_or_init(|| {
            let Some(resp) = &self.response else {
                return String::new();
            };
            let label = charset_of(resp.content_type())
                .or_else(|| {
                    charset_of(
                        self.request
                            .header
                            .get("Content-Type")
                            .and_then(|v| v.first())
                            .map(String::as_str),
                    )
                });

            let transcode = self.request.downloader == DownloaderKind::Fast
                && label.as_deref().map(is_utf8) == Some(false);
            if transcode {
                let label = label.unwrap_or_default();
                match encoding_rs::Encoding::for_label(label.as_bytes()) {
                    Some(encoding) => {
                        let (text, _, _) = encoding.decode(&resp.body);
                        return text.into_owned();
                    }
                    None => {
                        warn!(url = %self.url(), charset = %label, "unknown charset, keeping raw bytes");
                    }
                }
            }
            String::from_utf8_lossy(&resp.body).into_owned()
        })
    }

    /// Parses the body into an HTML document. The document is rebuilt per
    /// call; the decoded text behind it is cached.
    pub fn dom(&self) -> scraper::Html {
        scraper::Html::parse_document(self.text())
    }

    pub(crate) fn take_items(&mut self) -> Vec<DataCell> {
        std::mem::take(&mut self.items)
    }

    pub(crate) fn take_files(&mut self) -> Vec<FileCell> {
        std::mem::take(&mut self.files)
    }

    pub(crate) fn take_queued(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.queued)
    }

    fn resolve_rule(&self, rule_name: Option<&str>) -> Option<String> {
        let name = match rule_name {
            Some(n) => n.to_string(),
            None => self.request.rule.clone(),
        };
        if self.spider.get_rule(&name).is_none() {
            error!(spider = %self.spider.name, rule = %name, "unknown rule");
            return None;
        }
        Some(name)
    }
}

fn split_ext(name: &str) -> (String, String) {
    match name.rfind('.') {
        None => (name.to_string(), String::new()),
        Some(i) => (name[..i].to_string(), name[i..].to_string()),
    }
}

fn charset_of(content_type: Option<&str>) -> Option<String> {
    let ct = content_type?;
    ct.split(';').find_map(|part| {
        let part = part.trim();
        part.strip_prefix("charset=")
            .map(|cs| cs.trim_matches('"').trim().to_ascii_lowercase())
    })
}

fn is_utf8(charset: &str) -> bool {
    matches!(charset, "utf8" | "utf-8" | "unicode-1-1-utf-8")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spider::{ParseFn, Rule};
    use serde_json::json;

    fn noop() -> ParseFn {
        Arc::new(|_ctx: &mut Context| {})
    }

    fn spider() -> Arc<Spider> {
        Arc::new(
            Spider::new("demo", noop()).rule("list", Rule::new(&["title", "price"], noop())),
        )
    }

    fn response(body: &[u8], content_type: &str) -> Response {
        Response {
            url: "http://example.test/page".to_string(),
            status: 200,
            headers: HashMap::from([(
                "content-type".to_string(),
                vec![content_type.to_string()],
            )]),
            body: body.to_vec(),
        }
    }

    fn context_with(body: &[u8], content_type: &str) -> Context {
        let mut req = Request::new("http://example.test/page", "list");
        req.spider = "demo".to_string();
        req.prepare().unwrap();
        Context::new(spider(), req, Some(response(body, content_type)))
    }

    #[test]
    fn add_queue_fills_spider_and_referer() {
        let mut ctx = context_with(b"", "text/html");
        ctx.add_queue(Request::new("http://example.test/next", "list"));
        let queued = ctx.take_queued();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].spider, "demo");
        assert_eq!(queued[0].referer(), Some("http://example.test/page"));
    }

    #[test]
    fn add_queue_drops_malformed_urls() {
        let mut ctx = context_with(b"", "text/html");
        ctx.add_queue(Request::new("::: not a url", "list"));
        assert!(ctx.take_queued().is_empty());
    }

    #[test]
    fn output_appends_default_columns() {
        let mut ctx = context_with(b"", "text/html");
        ctx.output(HashMap::from([("title".to_string(), json!("x"))]), None);
        let items = ctx.take_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].url, "http://example.test/page");
        assert!(!items[0].download_time.is_empty());
    }

    #[test]
    fn output_registers_new_fields_in_order() {
        let mut ctx = context_with(b"", "text/html");
        ctx.output(
            HashMap::from([("fresh_field".to_string(), json!(1))]),
            Some("list"),
        );
        let fields = ctx.spider().get_rule("list").unwrap().fields();
        assert_eq!(fields[..2], ["title".to_string(), "price".to_string()]);
        assert!(fields.contains(&"fresh_field".to_string()));
    }

    #[test]
    fn indexed_output_maps_to_declared_fields() {
        let mut ctx = context_with(b"", "text/html");
        ctx.output_indexed(
            HashMap::from([(0, json!("a title")), (1, json!(5)), (7, json!("dropped"))]),
            Some("list"),
        );
        let items = ctx.take_items();
        assert_eq!(items[0].data["title"], json!("a title"));
        assert_eq!(items[0].data["price"], json!(5));
        assert!(!items[0].data.contains_key("dropped"));
    }

    #[test]
    fn file_output_derives_name_and_extension() {
        let mut ctx = context_with(b"bytes", "application/octet-stream");
        ctx.file_output(None);
        ctx.file_output(Some(".pdf"));
        ctx.file_output(Some("renamed"));
        let files = ctx.take_files();
        assert_eq!(files[0].name, "page.html");
        assert_eq!(files[1].name, "page.pdf");
        assert_eq!(files[2].name, "renamed.html");
        assert_eq!(files[0].bytes, b"bytes");
    }

    #[test]
    fn text_transcodes_declared_charset() {
        // "caf\xe9" in latin-1
        let mut body = b"caf".to_vec();
        body.push(0xE9);
        let ctx = context_with(&body, "text/html; charset=iso-8859-1");
        assert_eq!(ctx.text(), "café");
    }

    #[test]
    fn utf8_bodies_pass_through() {
        let ctx = context_with("héllo".as_bytes(), "text/html; charset=utf-8");
        assert_eq!(ctx.text(), "héllo");
    }

    #[test]
    fn dom_parses_from_text() {
        let ctx = context_with(b"<html><body><p id='x'>hi</p></body></html>", "text/html");
        let dom = ctx.dom();
        let sel = scraper::Selector::parse("p#x").unwrap();
        let text: String = dom.select(&sel).next().unwrap().text().collect();
        assert_eq!(text, "hi");
    }

    #[test]
    fn stopping_spider_blocks_queueing() {
        let mut ctx = context_with(b"", "text/html");
        ctx.spider().stop();
        ctx.add_queue(Request::new("http://example.test/next", "list"));
        assert!(ctx.take_queued().is_empty());
    }
}
