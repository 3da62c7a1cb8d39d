//! Conversion of Jira wiki markup to markdown.
//!
//! Used when mirroring tracker-side comments back to the platform. The
//! conversion is an ordered chain of replacements; code blocks are lifted
//! out first and substituted back last so their contents survive untouched.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::OnceLock;

macro_rules! static_regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).expect("valid regex"))
        }
    };
}

static_regex!(re_blockquote, r"(?m)^bq\.\s+");
static_regex!(re_bold, r"(?m)(^|\s|_)\*(\S.*)(\S)\*");
static_regex!(
    re_code,
    r"^\{code(?::(?P<lang>[a-z]+))?(?:[:|]?(?:title|borderStyle|borderColor|borderWidth|bgColor|titleBGColor)=.+?)*\}"
);
static_regex!(re_citation, r"(^|\s)\?\?((?:[^?])+)\?\?");
static_regex!(re_color, r"(?ms)\{color:([^}]+)\}(.*)\{color\}");
static_regex!(re_header, r"(?m)^h([0-6])\.(.*)");
static_regex!(re_insert, r"(^|\s)\+([^+]*)(\S)\+");
static_regex!(re_image, r"!([^!|]+)(\|[^!]*)?!");
static_regex!(re_italic, r"(^|\s|\*)_(\S.*)(\S)_");
static_regex!(re_list, r"(?m)^[ \t]*(\*+)\s+");
static_regex!(re_monospace, r"(^|\s)\{\{([^}]+)\}\}($|\s)");
static_regex!(
    re_named_link,
    r"\[(.+?)\|((www\.|(https?|ftp|ssh)://)[^\s/$.?#].[^\s]*)\]"
);
static_regex!(re_numbered_list, r"(?m)^[ \t]*(#+)\s+");
static_regex!(re_panel, r"(?ms)\{panel:title=([^}]*)\}\n?(.*?)\n?\{panel\}");
static_regex!(re_quote, r"(?ms)\{quote\}(.*)\{quote\}");
static_regex!(
    re_simple_link,
    r"\[((www\.|(https?|ftp|ssh)://)[^\s/$.?#].[^\s]*)\]"
);
static_regex!(re_strikethrough, r"(^|\s)-(\S+.*?\S)-($|\s)");
static_regex!(re_subscript, r"(^|\s)~([^~]*)(\S)~");
static_regex!(re_superscript, r"(^|\s)\^([^^]*)(\S)\^");
static_regex!(re_table_cell, r"\|[^|]+");
static_regex!(re_table_header, r"(?m)^[ \t]*((?:\|\|.*?)+\|\|)[ \t]*$");
static_regex!(re_table_no_header, r"(?m)^[ \t]*((?:\|[^\|\n]+)+\|)[ \t]*$");

/// Convert a Jira wiki string to markdown.
pub fn jira_to_markdown(src: &str) -> String {
    JiraToMarkdown::default().convert(src)
}

#[derive(Default)]
struct JiraToMarkdown {
    replacement_map: BTreeMap<String, String>,
}

impl JiraToMarkdown {
    fn convert(mut self, src: &str) -> String {
        // Order matters: code first, placeholder substitution last.
        let src = self.extract_code_blocks(src);
        let src = replace_quote(&src);
        let src = replace_list(&src);
        let src = replace_numbered_list(&src);
        let src = replace_header(&src);
        let src = re_bold().replace_all(&src, "${1}**${2}${3}**");
        let src = re_italic().replace_all(&src, "${1}*${2}${3}*");
        let src = re_image().replace_all(&src, "![${1}](${1})");
        let src = re_monospace().replace_all(&src, "${1}`${2}`${3}");
        let src = re_citation().replace_all(&src, "${1}*&mdash; ${2}*");
        let src = re_insert().replace_all(&src, "${1}<ins>${2}${3}</ins>");
        let src = re_superscript().replace_all(&src, "${1}<sup>${2}${3}</sup>");
        let src = re_subscript().replace_all(&src, "${1}<sub>${2}${3}</sub>");
        let src = re_strikethrough().replace_all(&src, "${1}~~${2}~~${3}");
        let src = src.replace("{noformat}", "```");
        let src = re_simple_link().replace_all(&src, "<${1}>");
        let src = re_named_link().replace_all(&src, "[${1}](${2})");
        let src = re_blockquote().replace_all(&src, "> ");
        let src = re_color().replace_all(
            &src,
            "<span style=\"color:${1}\" class=\"text-color-${1}\">${2}</span>",
        );
        let src = replace_table_no_header(&src);
        let src = re_panel().replace_all(&src, "\n| ${1} |\n| --- |\n| ${2} |");
        let src = replace_table_header(&src);
        self.apply_replacement_map(&src)
    }

    /// Scan word by word for `{code...}` delimiters. Content between a pair
    /// of delimiters is stashed under a placeholder key so none of the later
    /// replacements can touch it.
    fn extract_code_blocks(&mut self, src: &str) -> String {
        let characters: Vec<char> = src.chars().collect();
        let length = characters.len();
        let mut result = String::new();
        let mut current_word = String::new();
        let mut collecting = false;
        let mut index: i64 = -1;
        for (position, &character) in characters.iter().enumerate() {
            let is_separator = matches!(character, ' ' | '\t' | '\n' | '\r' | '\x0b');
            if !is_separator && position < length - 1 {
                current_word.push(character);
                continue;
            }
            let mut boundary = String::new();
            if position == length - 1 {
                current_word.push(character);
            } else {
                boundary.push(character);
            }
            if let Some(captures) = re_code().captures(&current_word) {
                let language = captures
                    .name("lang")
                    .map(|group| group.as_str())
                    .unwrap_or("");
                result.push_str("```");
                result.push_str(language);
                result.push_str(&boundary);
                collecting = !collecting;
                if collecting {
                    index += 1;
                }
            } else if collecting {
                let key = format!("@code_({index})_code@");
                let chunk = format!("{current_word}{boundary}");
                match self.replacement_map.get_mut(&key) {
                    Some(existing) => existing.push_str(&chunk),
                    None => {
                        self.replacement_map.insert(key.clone(), chunk);
                        result.push_str(&key);
                    }
                }
            } else {
                result.push_str(&current_word);
                result.push_str(&boundary);
            }
            current_word.clear();
        }
        result
    }

    fn apply_replacement_map(&self, src: &str) -> String {
        let mut src = src.to_string();
        for (key, replacement) in &self.replacement_map {
            src = src.replace(key, replacement);
        }
        src
    }
}

fn replace_quote(src: &str) -> String {
    re_quote()
        .replace_all(src, |captures: &Captures| {
            let lines: Vec<&str> = captures[1].trim().split('\n').collect();
            let joined = lines.join("\n> ");
            format!("> {}\n", joined.trim())
        })
        .into_owned()
}

fn replace_header(src: &str) -> String {
    re_header()
        .replace_all(src, |captures: &Captures| {
            let level: usize = captures[1].parse().unwrap_or(1);
            format!("{}{}", "#".repeat(level), &captures[2])
        })
        .into_owned()
}

fn replace_list(src: &str) -> String {
    re_list()
        .replace_all(src, |captures: &Captures| {
            format!("{}* ", "  ".repeat(captures[1].len() - 1))
        })
        .into_owned()
}

fn replace_numbered_list(src: &str) -> String {
    re_numbered_list()
        .replace_all(src, |captures: &Captures| {
            format!("{}1. ", "  ".repeat(captures[1].len() - 1))
        })
        .into_owned()
}

/// A table row with no `||` header row above it gets an injected empty
/// header and separator; rows directly below another table row are left
/// alone.
fn replace_table_no_header(src: &str) -> String {
    let source_bytes = src.as_bytes();
    re_table_no_header()
        .replace_all(src, |captures: &Captures| {
            let row_start = captures.get(1).expect("group 1").start();
            let mut lookup_offset = row_start as i64 - 1;
            let mut breaks_count = 0;
            loop {
                let space = lookup_offset > 0
                    && matches!(source_bytes[lookup_offset as usize], b' ' | b'\n' | b'\t');
                if !(space && breaks_count < 2) {
                    break;
                }
                if source_bytes[lookup_offset as usize] == b'\n' {
                    breaks_count += 1;
                }
                lookup_offset -= 1;
            }
            if lookup_offset > 0 && source_bytes[lookup_offset as usize] == b'|' {
                return captures[0].trim().to_string();
            }
            let row = captures[1].trim().to_string();
            let empty_header = re_table_cell().replace_all(&row, "| ");
            let separator = re_table_cell().replace_all(&row, "| --- ");
            format!("{empty_header}\n{separator}\n{row}")
        })
        .into_owned()
}

fn replace_table_header(src: &str) -> String {
    re_table_header()
        .replace_all(src, |captures: &Captures| {
            let single_barred = captures[1].replace("||", "|");
            let separator = re_table_cell().replace_all(&single_barred, "| --- ");
            format!("{single_barred}\n{separator}")
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_emphasis() {
        assert_eq!(jira_to_markdown("*bold*"), "**bold**");
        assert_eq!(jira_to_markdown("_italic_"), "*italic*");
        assert_eq!(jira_to_markdown("{{monospaced}}"), "`monospaced`");
        assert_eq!(jira_to_markdown("-deleted-"), "~~deleted~~");
        assert_eq!(jira_to_markdown("+inserted+"), "<ins>inserted</ins>");
        assert_eq!(jira_to_markdown("^superscript^"), "<sup>superscript</sup>");
        assert_eq!(jira_to_markdown("~subscript~"), "<sub>subscript</sub>");
    }

    #[test]
    fn converts_bold_italic_combined() {
        assert_eq!(
            jira_to_markdown("This is _*emphatically bold*_!"),
            "This is ***emphatically bold***!"
        );
    }

    #[test]
    fn converts_headers() {
        assert_eq!(jira_to_markdown("h1. Biggest heading"), "# Biggest heading");
        assert_eq!(jira_to_markdown("h3. Big heading"), "### Big heading");
        assert_eq!(
            jira_to_markdown("h6. Smallest heading"),
            "###### Smallest heading"
        );
    }

    #[test]
    fn converts_code_blocks() {
        assert_eq!(
            jira_to_markdown("{code}\nso *no* further _formatting_ is done here\n{code}"),
            "```\nso *no* further _formatting_ is done here\n```"
        );
        assert_eq!(
            jira_to_markdown("{code:javascript}\nvar hello = 'world';\n{code}"),
            "```javascript\nvar hello = 'world';\n```"
        );
        assert_eq!(
            jira_to_markdown(
                "{code:title=Foo.java}\nclass Foo {\n  public static void main() {\n  }\n}\n{code}"
            ),
            "```\nclass Foo {\n  public static void main() {\n  }\n}\n```"
        );
    }

    #[test]
    fn converts_fully_configured_code_block() {
        assert_eq!(
            jira_to_markdown(
                "{code:xml|title=MyTitle|borderStyle=dashed|borderColor=#ccc|titleBGColor=#F7D6C1|bgColor=#FFFFCE}\n    <test>\n        <another tag=\"attribute\"/>\n    </test>\n{code}"
            ),
            "```xml\n    <test>\n        <another tag=\"attribute\"/>\n    </test>\n```"
        );
    }

    #[test]
    fn converts_links() {
        assert_eq!(
            jira_to_markdown("[http://google.com]"),
            "<http://google.com>"
        );
        assert_eq!(
            jira_to_markdown("[Google|http://google.com]"),
            "[Google](http://google.com)"
        );
        assert_eq!(
            jira_to_markdown("[this is really not a link]"),
            "[this is really not a link]"
        );
    }

    #[test]
    fn converts_images() {
        assert_eq!(
            jira_to_markdown("!screenshot.png|thumbnail!"),
            "![screenshot.png](screenshot.png)"
        );
    }

    #[test]
    fn converts_blockquotes() {
        assert_eq!(
            jira_to_markdown("bq. This is a long blockquote type thingy that needs to be converted."),
            "> This is a long blockquote type thingy that needs to be converted."
        );
        assert_eq!(
            jira_to_markdown("{quote}\nfirst line\nsecond line\n{quote}"),
            "> first line\n> second line\n"
        );
    }

    #[test]
    fn converts_lists_with_two_space_indent_per_level() {
        assert_eq!(
            jira_to_markdown("* Foo\n* Bar\n** FooBar\n*** FooBarBaz\n* Starting Over"),
            "* Foo\n* Bar\n  * FooBar\n    * FooBarBaz\n* Starting Over"
        );
        assert_eq!(
            jira_to_markdown("# Foo\n## FooBar\n# Baz"),
            "1. Foo\n  1. FooBar\n1. Baz"
        );
    }

    #[test]
    fn converts_color_spans() {
        assert_eq!(
            jira_to_markdown("A text with{color:blue} blue \n lines {color} is not necessary."),
            "A text with<span style=\"color:blue\" class=\"text-color-blue\"> blue \n lines </span> is not necessary."
        );
    }

    #[test]
    fn converts_table_with_header() {
        assert_eq!(
            jira_to_markdown("||Heading 1||Heading 2||\n|Col A1|Col A2|\n|Col B1|Col B2|\n"),
            "|Heading 1|Heading 2|\n| --- | --- |\n|Col A1|Col A2|\n|Col B1|Col B2|\n"
        );
    }

    #[test]
    fn header_less_table_gets_injected_header() {
        assert_eq!(
            jira_to_markdown("|Row 1|a|\n|Row 2|b|\n"),
            "| | |\n| --- | --- |\n|Row 1|a|\n|Row 2|b|\n"
        );
    }

    #[test]
    fn converts_noformat_to_fences() {
        assert_eq!(
            jira_to_markdown("{noformat}\nraw text\n{noformat}"),
            "```\nraw text\n```"
        );
    }

    #[test]
    fn conversion_reaches_a_fixed_point_after_the_second_pass() {
        let jira =
            "h1. Title\n\n{code:js}\nvar x = 1;\n{code}\n\n* one\n* two\n\n[Google|http://google.com]";
        let first = jira_to_markdown(jira);
        let second = jira_to_markdown(&first);
        let third = jira_to_markdown(&second);
        assert_eq!(second, third);
    }
}
