//! Conversion of the platform's HTML subset to markdown and Jira wiki, plus
//! redirect unwrapping and attachment URL scrubbing.

use percent_encoding::percent_decode_str;
use regex::Regex;
use std::sync::OnceLock;
use url::Url;
use url::form_urlencoded;

/// Code-block languages Jira renders; anything else is emitted untagged.
const JIRA_CODE_LANGUAGES: &[&str] = &[
    "actionscript",
    "ada",
    "applescript",
    "bash",
    "c",
    "c#",
    "c++",
    "cpp",
    "css",
    "erlang",
    "go",
    "groovy",
    "haskell",
    "html",
    "java",
    "javascript",
    "js",
    "json",
    "lua",
    "none",
    "nyan",
    "objc",
    "perl",
    "php",
    "python",
    "r",
    "rainbow",
    "ruby",
    "scala",
    "sh",
    "sql",
    "swift",
    "visualbasic",
    "xml",
    "yaml",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Markdown,
    Jira,
}

/// Convert platform HTML to markdown, preserving line structure (no
/// wrapping). Fenced code blocks carry the language hint extracted from a
/// `language-*` class on the nested `<code>` tag.
pub fn html_to_markdown(html: &str) -> String {
    Converter::new(Dialect::Markdown).convert(html)
}

/// Convert platform HTML to the Jira wiki dialect. `<img>` becomes
/// `!alt|src!` and `<code>` blocks become `{code:LANG}…{code}` with their
/// contents carried over verbatim.
pub fn html_to_jira(html: &str) -> String {
    Converter::new(Dialect::Jira).convert(html)
}

#[derive(Debug)]
enum ListKind {
    Bullet,
    Numbered(u32),
}

#[derive(Debug, Default)]
struct TableState {
    rows: Vec<Vec<String>>,
    header_row: bool,
    current_row: Option<Vec<String>>,
    current_cell: Option<String>,
}

struct Converter {
    dialect: Dialect,
    out: String,
    list_stack: Vec<ListKind>,
    quote_depth: usize,
    in_pre: bool,
    code_block: Option<(String, String)>,
    in_inline_code: bool,
    link_hrefs: Vec<String>,
    table: Option<TableState>,
}

impl Converter {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            out: String::new(),
            list_stack: Vec::new(),
            quote_depth: 0,
            in_pre: false,
            code_block: None,
            in_inline_code: false,
            link_hrefs: Vec::new(),
            table: None,
        }
    }

    fn convert(mut self, html: &str) -> String {
        let mut rest = html;
        while let Some(open) = rest.find('<') {
            let (text, tail) = rest.split_at(open);
            self.push_text(text);
            match tag_at(tail) {
                Some(tag) => {
                    self.handle_tag(tag);
                    rest = &tail[tag.len()..];
                }
                None => {
                    // A bare '<' that does not open a tag.
                    self.push_text("<");
                    rest = &tail[1..];
                }
            }
        }
        self.push_text(rest);
        normalize_blank_lines(self.out.trim_matches('\n'))
    }

    fn handle_tag(&mut self, tag: &str) {
        let closing = tag.starts_with("</");
        let name = tag_name(tag);
        match (name.as_str(), closing) {
            ("p", false) | ("div", false) => self.paragraph_break(),
            ("p", true) | ("div", true) => self.newline(),
            ("br", _) => self.newline(),
            ("h1", false) | ("h2", false) | ("h3", false) | ("h4", false) | ("h5", false)
            | ("h6", false) => {
                let level = name.as_bytes()[1] - b'0';
                self.paragraph_break();
                match self.dialect {
                    Dialect::Markdown => {
                        for _ in 0..level {
                            self.out.push('#');
                        }
                        self.out.push(' ');
                    }
                    Dialect::Jira => {
                        self.out.push('h');
                        self.out.push((b'0' + level) as char);
                        self.out.push_str(". ");
                    }
                }
            }
            ("h1", true) | ("h2", true) | ("h3", true) | ("h4", true) | ("h5", true)
            | ("h6", true) => self.newline(),
            ("strong", _) | ("b", _) => self.push_raw(match self.dialect {
                Dialect::Markdown => "**",
                Dialect::Jira => "*",
            }),
            ("em", _) | ("i", _) => self.push_raw(match self.dialect {
                Dialect::Markdown => "*",
                Dialect::Jira => "_",
            }),
            ("del", _) | ("s", _) | ("strike", _) => self.push_raw(match self.dialect {
                Dialect::Markdown => "~~",
                Dialect::Jira => "-",
            }),
            ("a", false) => {
                self.link_hrefs.push(attribute(tag, "href").unwrap_or_default());
                self.push_raw("[");
            }
            ("a", true) => {
                let href = self.link_hrefs.pop().unwrap_or_default();
                match self.dialect {
                    Dialect::Markdown => self.push_raw(&format!("]({href})")),
                    Dialect::Jira => self.push_raw(&format!("|{href}]")),
                }
            }
            ("img", false) => {
                let alt = attribute(tag, "alt").unwrap_or_default();
                let src = attribute(tag, "src").unwrap_or_default();
                match self.dialect {
                    Dialect::Markdown => self.push_raw(&format!("![{alt}]({src})")),
                    Dialect::Jira => self.push_raw(&format!("!{alt}|{src}!")),
                }
            }
            ("ul", false) => self.list_stack.push(ListKind::Bullet),
            ("ol", false) => self.list_stack.push(ListKind::Numbered(0)),
            ("ul", true) | ("ol", true) => {
                self.list_stack.pop();
                if self.list_stack.is_empty() {
                    self.newline();
                }
            }
            ("li", false) => {
                self.newline();
                let depth = self.list_stack.len().max(1);
                match self.list_stack.last_mut() {
                    Some(ListKind::Numbered(counter)) => {
                        *counter += 1;
                        let counter = *counter;
                        match self.dialect {
                            Dialect::Markdown => {
                                self.out.push_str(&"  ".repeat(depth - 1));
                                self.out.push_str(&format!("{counter}. "));
                            }
                            Dialect::Jira => {
                                self.out.push_str(&"#".repeat(depth));
                                self.out.push(' ');
                            }
                        }
                    }
                    _ => match self.dialect {
                        Dialect::Markdown => {
                            self.out.push_str(&"  ".repeat(depth - 1));
                            self.out.push_str("* ");
                        }
                        Dialect::Jira => {
                            self.out.push_str(&"*".repeat(depth));
                            self.out.push(' ');
                        }
                    },
                }
            }
            ("li", true) => {}
            ("blockquote", false) => {
                self.quote_depth += 1;
                if self.out.is_empty() {
                    self.push_quote_prefix();
                } else {
                    self.paragraph_break();
                }
            }
            ("blockquote", true) => {
                self.quote_depth = self.quote_depth.saturating_sub(1);
                self.newline();
            }
            ("pre", false) => self.in_pre = true,
            ("pre", true) => {
                self.in_pre = false;
                self.newline();
            }
            ("code", false) => {
                if self.in_pre {
                    let language = attribute(tag, "class")
                        .unwrap_or_default()
                        .split_whitespace()
                        .find_map(|class| class.strip_prefix("language-").map(str::to_string))
                        .unwrap_or_default();
                    self.code_block = Some((language, String::new()));
                } else {
                    self.in_inline_code = true;
                    self.push_raw(match self.dialect {
                        Dialect::Markdown => "`",
                        Dialect::Jira => "{{",
                    });
                }
            }
            ("code", true) => {
                if let Some((language, content)) = self.code_block.take() {
                    self.emit_code_block(&language, &content);
                } else if self.in_inline_code {
                    self.in_inline_code = false;
                    self.push_raw(match self.dialect {
                        Dialect::Markdown => "`",
                        Dialect::Jira => "}}",
                    });
                }
            }
            ("table", false) => self.table = Some(TableState::default()),
            ("table", true) => {
                if let Some(table) = self.table.take() {
                    self.emit_table(table);
                }
            }
            ("tr", false) => {
                if let Some(table) = self.table.as_mut() {
                    table.current_row = Some(Vec::new());
                }
            }
            ("tr", true) => {
                if let Some(table) = self.table.as_mut()
                    && let Some(row) = table.current_row.take()
                {
                    table.rows.push(row);
                }
            }
            ("th", false) => {
                if let Some(table) = self.table.as_mut() {
                    if table.rows.is_empty() {
                        table.header_row = true;
                    }
                    table.current_cell = Some(String::new());
                }
            }
            ("td", false) => {
                if let Some(table) = self.table.as_mut() {
                    table.current_cell = Some(String::new());
                }
            }
            ("th", true) | ("td", true) => {
                if let Some(table) = self.table.as_mut()
                    && let Some(cell) = table.current_cell.take()
                {
                    table
                        .current_row
                        .get_or_insert_with(Vec::new)
                        .push(cell.trim().to_string());
                }
            }
            _ => {}
        }
    }

    fn emit_code_block(&mut self, language: &str, content: &str) {
        let content = content.trim_matches('\n');
        self.paragraph_break();
        match self.dialect {
            Dialect::Markdown => {
                self.out.push_str("```");
                self.out.push_str(language);
                self.out.push('\n');
                self.out.push_str(content);
                self.out.push_str("\n```");
            }
            Dialect::Jira => {
                let language = language.to_lowercase();
                if JIRA_CODE_LANGUAGES.contains(&language.as_str()) {
                    self.out.push_str(&format!("{{code:{language}}}"));
                } else {
                    self.out.push_str("{code}");
                }
                self.out.push('\n');
                self.out.push_str(content);
                self.out.push_str("\n{code}");
            }
        }
        self.newline();
    }

    fn emit_table(&mut self, table: TableState) {
        if table.rows.is_empty() {
            return;
        }
        let width = table.rows.iter().map(Vec::len).max().unwrap_or(0);
        self.paragraph_break();
        match self.dialect {
            Dialect::Markdown => {
                let mut rows = table.rows.into_iter();
                let header = if table.header_row {
                    rows.next().unwrap_or_default()
                } else {
                    vec![String::new(); width]
                };
                self.out.push_str(&markdown_table_row(&header, width));
                self.newline();
                self.out
                    .push_str(&markdown_table_row(&vec!["---".to_string(); width], width));
                for row in rows {
                    self.newline();
                    self.out.push_str(&markdown_table_row(&row, width));
                }
            }
            Dialect::Jira => {
                let mut rows = table.rows.into_iter();
                if table.header_row
                    && let Some(header) = rows.next()
                {
                    self.out.push_str(&format!("||{}||", header.join("||")));
                    self.newline();
                }
                let mut first = true;
                for row in rows {
                    if !first {
                        self.newline();
                    }
                    first = false;
                    self.out.push_str(&format!("|{}|", row.join("|")));
                }
            }
        }
        self.newline();
    }

    fn in_capture(&self) -> bool {
        self.code_block.is_some()
            || self
                .table
                .as_ref()
                .is_some_and(|table| table.current_cell.is_some())
    }

    fn paragraph_break(&mut self) {
        if self.in_capture() || self.out.is_empty() {
            return;
        }
        while !self.out.ends_with("\n\n") {
            self.out.push('\n');
        }
        self.push_quote_prefix();
    }

    fn newline(&mut self) {
        if self.in_capture() {
            return;
        }
        self.out.push('\n');
        self.push_quote_prefix();
    }

    fn push_quote_prefix(&mut self) {
        if self.quote_depth > 0 && self.dialect == Dialect::Markdown {
            self.out.push_str(&"> ".repeat(self.quote_depth));
        } else if self.quote_depth > 0 && self.dialect == Dialect::Jira {
            self.out.push_str("bq. ");
        }
    }

    fn push_raw(&mut self, text: &str) {
        if let Some((_, buffer)) = self.code_block.as_mut() {
            buffer.push_str(text);
            return;
        }
        if let Some(table) = self.table.as_mut()
            && let Some(cell) = table.current_cell.as_mut()
        {
            cell.push_str(text);
            return;
        }
        self.out.push_str(text);
    }

    fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some((_, buffer)) = self.code_block.as_mut() {
            buffer.push_str(&decode_entities(text));
            return;
        }
        if self.in_pre {
            // Raw text inside <pre> without a nested <code>.
            let decoded = decode_entities(text);
            self.push_raw(&decoded);
            return;
        }
        let decoded = decode_entities(text);
        // Inter-tag whitespace carries no structure; structure comes from the
        // tags themselves.
        if decoded.trim().is_empty()
            && (self.out.is_empty()
                || self.out.ends_with('\n')
                || self
                    .table
                    .as_ref()
                    .is_some_and(|table| table.current_cell.is_none()))
        {
            return;
        }
        self.push_raw(&decoded);
    }
}

fn markdown_table_row(cells: &[String], width: usize) -> String {
    let mut padded: Vec<&str> = cells.iter().map(String::as_str).collect();
    padded.resize(width, "");
    format!("| {} |", padded.join(" | "))
}

fn normalize_blank_lines(text: &str) -> String {
    static BLANKS_RE: OnceLock<Regex> = OnceLock::new();
    let re = BLANKS_RE.get_or_init(|| Regex::new(r"\n{3,}").expect("valid regex"));
    re.replace_all(text, "\n\n").into_owned()
}

/// Match a tag at the start of `input`, returning the full `<...>` slice.
fn tag_at(input: &str) -> Option<&str> {
    static TAG_RE: OnceLock<Regex> = OnceLock::new();
    let re = TAG_RE.get_or_init(|| {
        Regex::new(r#"^</?[a-zA-Z][a-zA-Z0-9]*(?:\s+[^<>]*?)?/?>"#).expect("valid regex")
    });
    re.find(input).map(|found| found.as_str())
}

fn tag_name(tag: &str) -> String {
    tag.trim_start_matches('<')
        .trim_start_matches('/')
        .chars()
        .take_while(|character| character.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

fn attribute(tag: &str, name: &str) -> Option<String> {
    let pattern = format!(r#"(?i){}\s*=\s*(?:"([^"]*)"|'([^']*)')"#, regex::escape(name));
    let re = Regex::new(&pattern).ok()?;
    let captures = re.captures(tag)?;
    captures
        .get(1)
        .or_else(|| captures.get(2))
        .map(|group| decode_entities(group.as_str()))
}

fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Unwrap platform redirects found in `href`/`src` attributes (and anywhere
/// else the quoted form appears) of an HTML blob.
pub fn cleanup_redirects_in_html(ywh_domain: &str, html: &str) -> String {
    let base = format!("https://{ywh_domain}/redirect?url=");
    let pattern = Regex::new(&format!("\"({})([^ \"]*)\"", regex::escape(&base)))
        .expect("valid redirect regex");
    let wrapped: Vec<(String, String)> = pattern
        .captures_iter(html)
        .map(|captures| (captures[1].to_string(), captures[2].to_string()))
        .collect();
    let mut html = html.to_string();
    for (base_url, redirect_url) in wrapped {
        html = replace_redirect(&html, &base_url, &redirect_url);
    }
    html
}

/// Unwrap platform redirects appearing as bare URLs in plain text.
pub fn cleanup_redirects_in_text(ywh_domain: &str, text: &str) -> String {
    let base = format!("https://{ywh_domain}/redirect?url=");
    let pattern = Regex::new(&format!(r"({})(\S*)", regex::escape(&base)))
        .expect("valid redirect regex");
    let wrapped: Vec<(String, String)> = pattern
        .captures_iter(text)
        .map(|captures| (captures[1].to_string(), captures[2].to_string()))
        .collect();
    let mut text = text.to_string();
    for (base_url, redirect_url) in wrapped {
        text = replace_redirect(&text, &base_url, &redirect_url);
    }
    text
}

fn replace_redirect(text: &str, base_url: &str, redirect_url: &str) -> String {
    let Some(clean_url) = unwrap_redirect(redirect_url) else {
        return text.to_string();
    };
    text.replace(&format!("{base_url}{redirect_url}"), &clean_url)
}

/// Decode the wrapped URL (twice, to resist nested encodings) and strip the
/// redirector's `expires` and `token` query parameters, keeping every other
/// parameter intact.
fn unwrap_redirect(redirect_url: &str) -> Option<String> {
    let once = percent_decode_str(redirect_url).decode_utf8().ok()?;
    let twice = percent_decode_str(&once).decode_utf8().ok()?;
    let url = Url::parse(&twice).ok()?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| name != "expires" && name != "token")
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    let mut clean = url.clone();
    if kept.is_empty() {
        clean.set_query(None);
    } else {
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(kept)
            .finish();
        clean.set_query(Some(&query));
    }
    Some(clean.to_string())
}

/// Strip query-string noise from links whose prefix matches one of the
/// report's attachment URLs. URLs hosted outside the platform are left
/// untouched.
pub fn scrub_attachment_urls(html: &str, attachment_urls: &[String], platform_host: &str) -> String {
    let mut html = html.to_string();
    for attachment_url in attachment_urls {
        let Ok(parsed) = Url::parse(attachment_url) else {
            continue;
        };
        if parsed.host_str() != Some(platform_host) {
            continue;
        }
        let pattern = Regex::new(&format!(
            r#"{}\?[^"'\s)<>]*"#,
            regex::escape(attachment_url)
        ))
        .expect("valid scrub regex");
        html = pattern.replace_all(&html, attachment_url.as_str()).into_owned();
    }
    html
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_basic_structure_to_markdown() {
        let html = "<h2>Steps</h2><p>First, open the <strong>admin</strong> panel.</p>\
                    <ul><li>step one</li><li>step two</li></ul>";
        let markdown = html_to_markdown(html);
        assert_eq!(
            markdown,
            "## Steps\n\nFirst, open the **admin** panel.\n\n* step one\n* step two"
        );
    }

    #[test]
    fn converts_links_and_images() {
        let html = r#"<p>See <a href="https://example.com/doc">the doc</a> and <img alt="proof" src="https://example.com/proof.png">.</p>"#;
        let markdown = html_to_markdown(html);
        assert_eq!(
            markdown,
            "See [the doc](https://example.com/doc) and ![proof](https://example.com/proof.png)."
        );
    }

    #[test]
    fn fenced_code_block_keeps_language_hint() {
        let html = "<p>PoC:</p><pre><code class=\"language-python\">print(1)\nprint(2)</code></pre>";
        let markdown = html_to_markdown(html);
        assert_eq!(markdown, "PoC:\n\n```python\nprint(1)\nprint(2)\n```");
    }

    #[test]
    fn code_block_content_is_not_reinterpreted() {
        let html = "<pre><code>**not bold** &lt;tag&gt;</code></pre>";
        let markdown = html_to_markdown(html);
        assert_eq!(markdown, "```\n**not bold** <tag>\n```");
    }

    #[test]
    fn nested_lists_indent_two_spaces_per_level() {
        let html = "<ul><li>a<ul><li>a1</li><li>a2</li></ul></li><li>b</li></ul>";
        let markdown = html_to_markdown(html);
        assert_eq!(markdown, "* a\n  * a1\n  * a2\n* b");
    }

    #[test]
    fn ordered_list_is_numbered() {
        let html = "<ol><li>first</li><li>second</li></ol>";
        assert_eq!(html_to_markdown(html), "1. first\n2. second");
    }

    #[test]
    fn table_with_header_row() {
        let html = "<table><tr><th>Name</th><th>Value</th></tr>\
                    <tr><td>a</td><td>1</td></tr></table>";
        let markdown = html_to_markdown(html);
        assert_eq!(markdown, "| Name | Value |\n| --- | --- |\n| a | 1 |");
    }

    #[test]
    fn blockquote_gets_angle_prefix() {
        let html = "<blockquote>quoted line</blockquote>";
        assert_eq!(html_to_markdown(html), "> quoted line");
    }

    #[test]
    fn jira_dialect_images_and_code() {
        let html = "<p><img alt=\"shot\" src=\"https://x/1.png\"></p>\
                    <pre><code class=\"language-python\">print(1)</code></pre>";
        let jira = html_to_jira(html);
        assert_eq!(jira, "!shot|https://x/1.png!\n\n{code:python}\nprint(1)\n{code}");
    }

    #[test]
    fn jira_unknown_language_is_dropped() {
        let html = "<pre><code class=\"language-brainfuck\">+-</code></pre>";
        assert_eq!(html_to_jira(html), "{code}\n+-\n{code}");
    }

    #[test]
    fn jira_links_and_emphasis() {
        let html = r#"<p><strong>bold</strong> <em>it</em> <a href="https://x/y">label</a></p>"#;
        assert_eq!(html_to_jira(html), "*bold* _it_ [label|https://x/y]");
    }

    #[test]
    fn markdown_conversion_is_idempotent() {
        let html = "<h1>Title</h1><p>Text with <code>inline</code> and a \
                    <a href=\"https://e.com/?a=1&amp;b=2\">link</a>.</p>\
                    <pre><code class=\"language-sh\">ls -la</code></pre>\
                    <ul><li>one</li><li>two</li></ul>";
        let first = html_to_markdown(html);
        let second = html_to_markdown(&first);
        assert_eq!(first, second);
        let third = html_to_markdown(&second);
        assert_eq!(second, third);
    }

    #[test]
    fn unwraps_redirect_and_strips_expiry_params() {
        let inner = "https://target.example.com/page?keep=yes&expires=123&token=abc";
        let encoded: String = form_urlencoded::byte_serialize(inner.as_bytes()).collect();
        let html = format!(
            r#"<a href="https://www.yeswehack.com/redirect?url={encoded}">link</a>"#
        );
        let cleaned = cleanup_redirects_in_html("www.yeswehack.com", &html);
        assert!(cleaned.contains("https://target.example.com/page?keep=yes"));
        assert!(!cleaned.contains("expires"));
        assert!(!cleaned.contains("token=abc"));
    }

    #[test]
    fn redirect_cleanup_is_idempotent() {
        let inner = "https://target.example.com/page?keep=yes&expires=1&token=t";
        let encoded: String = form_urlencoded::byte_serialize(inner.as_bytes()).collect();
        let text = format!("see https://www.yeswehack.com/redirect?url={encoded} here");
        let first = cleanup_redirects_in_text("www.yeswehack.com", &text);
        let second = cleanup_redirects_in_text("www.yeswehack.com", &first);
        assert_eq!(first, second);
        assert_eq!(first, "see https://target.example.com/page?keep=yes here");
    }

    #[test]
    fn redirect_cleanup_resists_nested_encoding() {
        let inner = "https://target.example.com/a?x=1&expires=9&token=z";
        let once: String = form_urlencoded::byte_serialize(inner.as_bytes()).collect();
        let twice: String = form_urlencoded::byte_serialize(once.as_bytes()).collect();
        let text = format!("https://www.yeswehack.com/redirect?url={twice}");
        let cleaned = cleanup_redirects_in_text("www.yeswehack.com", &text);
        assert_eq!(cleaned, "https://target.example.com/a?x=1");
    }

    #[test]
    fn scrub_cleans_only_platform_hosted_attachments() {
        let ours = "https://apps.yeswehack.com/attachments/42".to_string();
        let foreign = "https://evil.example.com/attachments/42".to_string();
        let html = format!("<a href=\"{ours}?token=zzz&sig=1\">f</a> <a href=\"{foreign}?token=zzz\">g</a>");
        let scrubbed = scrub_attachment_urls(
            &html,
            &[ours.clone(), foreign.clone()],
            "apps.yeswehack.com",
        );
        assert!(scrubbed.contains(&format!("\"{ours}\"")));
        assert!(scrubbed.contains(&format!("{foreign}?token=zzz")));
    }
}
