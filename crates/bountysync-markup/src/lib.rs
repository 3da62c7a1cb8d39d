//! Markup dialect conversion between the platform's HTML, markdown and the
//! Jira wiki syntax.
//!
//! Report descriptions and log messages arrive from the platform as a
//! constrained HTML subset (headings, lists, links, tables, inline and
//! fenced code, images, blockquotes). Trackers speak either markdown or the
//! Jira wiki dialect, and tracker-side comments come back as one of those
//! dialects and must be turned into platform markdown again.
//!
//! - [`html::html_to_markdown`] and [`html::html_to_jira`] convert outbound
//!   content; fenced code blocks keep their `language-*` hint.
//! - [`jira::jira_to_markdown`] converts inbound Jira comments.
//! - [`html::cleanup_redirects_in_html`] / [`html::cleanup_redirects_in_text`]
//!   unwrap the platform's outbound-link redirector.
//! - [`html::scrub_attachment_urls`] strips query noise from attachment
//!   links before URL rewriting.
//!
//! Every converter is a fixed point on its own output: feeding a result back
//! in leaves it unchanged.

pub mod html;
pub mod jira;

pub use html::{
    cleanup_redirects_in_html, cleanup_redirects_in_text, html_to_jira, html_to_markdown,
    scrub_attachment_urls,
};
pub use jira::jira_to_markdown;
