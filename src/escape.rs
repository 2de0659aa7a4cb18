// Output escaping strategies

use crate::error::{Result, TemplateError};
use crate::value::Value;

/// Converts a value into text that is safe to place in the output.
pub trait Escaper: Send + Sync {
    fn escape(&self, value: &Value) -> String;
    fn strategy(&self) -> &str;
}

/// Charsets the HTML escaper accepts. Rust strings are always UTF-8.
const UTF8_ALIASES: &[&str] = &["utf-8", "utf8"];

/// HTML body/attribute escaping for `& < > " '`.
#[derive(Debug, Clone)]
pub struct HtmlEscaper {
    charset: String,
}

impl HtmlEscaper {
    pub fn new(charset: &str) -> Result<Self> {
        if !UTF8_ALIASES.contains(&charset.to_ascii_lowercase().as_str()) {
            return Err(TemplateError::Config(format!(
                "unsupported charset for HTML escaping: {}",
                charset
            )));
        }
        Ok(Self {
            charset: charset.to_string(),
        })
    }

    pub fn charset(&self) -> &str {
        &self.charset
    }

    pub fn escape_str(text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for ch in text.chars() {
            match ch {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '"' => out.push_str("&quot;"),
                '\'' => out.push_str("&#039;"),
                _ => out.push(ch),
            }
        }
        out
    }
}

impl Default for HtmlEscaper {
    fn default() -> Self {
        Self {
            charset: "UTF-8".to_string(),
        }
    }
}

impl Escaper for HtmlEscaper {
    fn escape(&self, value: &Value) -> String {
        Self::escape_str(&value.to_output())
    }

    fn strategy(&self) -> &str {
        "html"
    }
}
