//! `attrs.slug` / `attrs['slug']` expansion.
//!
//! Runs on expression text before parsing. String literals and back-quoted
//! names are matched first and copied through untouched, so a shorthand
//! inside quotes is never rewritten.
use regex::Regex;

use super::DomainConfig;
use crate::error::{Result, TranslateError};

pub struct Shorthand {
    pattern: Regex,
    expansion_prefix: String,
    value_field: String,
}

impl Shorthand {
    pub fn new(config: &DomainConfig) -> Result<Self> {
        let name = regex::escape(&config.attributes);
        let pattern = Regex::new(&format!(
            r#"'(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*"|`[^`]*`|\b{name}\s*\[\s*(?:'(?P<sq>[^']*)'|"(?P<dq>[^"]*)")\s*\]|\b{name}\.(?P<bare>[A-Za-z_][A-Za-z0-9_]*)"#
        ))
        .map_err(|e| TranslateError::schema(format!("invalid attribute shorthand: {}", e)))?;
        Ok(Shorthand {
            pattern,
            expansion_prefix: format!(
                "{}[{}.{} = ",
                config.attributes, config.definition, config.slug_field
            ),
            value_field: config.value_field.clone(),
        })
    }

    /// Rewrite every shorthand in `expression` into the generic form
    /// `attrs[attrDef.slug = '<namespace>:<slug>'].value`.
    pub fn expand(&self, expression: &str, namespace: &str) -> String {
        let mut out = String::with_capacity(expression.len());
        let mut last = 0;
        for caps in self.pattern.captures_iter(expression) {
            let Some(whole) = caps.get(0) else { continue };
            let preceded_by_path = expression[..whole.start()]
                .chars()
                .next_back()
                .is_some_and(|c| c == '.' || c == '$');
            let slug = if let Some(quoted) = caps.name("sq").or_else(|| caps.name("dq")) {
                Some(quoted.as_str())
            } else if let Some(bare) = caps.name("bare") {
                let continues = expression[whole.end()..]
                    .trim_start()
                    .starts_with(['.', '[', '(']);
                (!continues).then_some(bare.as_str())
            } else {
                None
            };
            let Some(slug) = slug.filter(|_| !preceded_by_path) else {
                continue;
            };
            out.push_str(&expression[last..whole.start()]);
            out.push_str(&self.expansion(slug, namespace));
            last = whole.end();
        }
        out.push_str(&expression[last..]);
        out
    }

    fn expansion(&self, slug: &str, namespace: &str) -> String {
        let slug = slug.to_lowercase();
        let qualified = if namespace.is_empty() {
            slug
        } else {
            format!("{}:{}", namespace, slug)
        };
        let escaped = qualified.replace('\\', "\\\\").replace('\'', "\\'");
        format!("{}'{}'].{}", self.expansion_prefix, escaped, self.value_field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expand(expression: &str) -> String {
        Shorthand::new(&DomainConfig::default())
            .unwrap()
            .expand(expression, "ns")
    }

    #[test]
    fn test_bare_form() {
        assert_eq!(
            expand("attrs.Title = 'x'"),
            "attrs[attrDef.slug = 'ns:title'].value = 'x'"
        );
    }

    #[test]
    fn test_bracket_form_matches_bare_form() {
        assert_eq!(expand("attrs['title']"), expand("attrs.title"));
        assert_eq!(
            expand("attrs[\"due-date\"] > '2024'"),
            "attrs[attrDef.slug = 'ns:due-date'].value > '2024'"
        );
    }

    #[test]
    fn test_string_literals_untouched() {
        assert_eq!(expand("title = 'attrs.title'"), "title = 'attrs.title'");
        assert_eq!(
            expand("title = \"it's attrs.x\" and attrs.x = 1"),
            "title = \"it's attrs.x\" and attrs[attrDef.slug = 'ns:x'].value = 1"
        );
    }

    #[test]
    fn test_continued_paths_untouched() {
        assert_eq!(expand("attrs.meta.author"), "attrs.meta.author");
        assert_eq!(expand("attrs.meta[0]"), "attrs.meta[0]");
        assert_eq!(expand("pub.attrs.title"), "pub.attrs.title");
        assert_eq!(expand("myattrs.title"), "myattrs.title");
    }

    #[test]
    fn test_inside_function_call() {
        assert_eq!(
            expand("$exists(attrs.description)"),
            "$exists(attrs[attrDef.slug = 'ns:description'].value)"
        );
    }

    #[test]
    fn test_empty_namespace_and_quote_escaping() {
        let shorthand = Shorthand::new(&DomainConfig::default()).unwrap();
        assert_eq!(
            shorthand.expand("attrs.title", ""),
            "attrs[attrDef.slug = 'title'].value"
        );
        assert_eq!(
            shorthand.expand("attrs[\"it's\"]", ""),
            "attrs[attrDef.slug = 'it\\'s'].value"
        );
    }
}
