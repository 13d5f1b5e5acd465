//! HTML minification, using [`minify_html`] under the hood.

use minify_html::{Cfg, minify};
use serde::Deserialize;
use serde_json::Value;

use super::Stage;
use crate::pipeline::{Input, Minified};

/// Id of the built-in HTML minimizer.
pub const HTML: &str = "minify-html";

#[derive(Debug, Deserialize)]
#[serde(default)]
struct HtmlOptions {
    keep_comments: bool,
    keep_closing_tags: bool,
    minify_css: bool,
    minify_js: bool,
}

impl Default for HtmlOptions {
    fn default() -> Self {
        Self {
            keep_comments: false,
            keep_closing_tags: true,
            minify_css: true,
            minify_js: true,
        }
    }
}

pub(super) fn stage() -> Stage {
    Stage::new(HTML, run)
}

fn run(input: Input<'_>, options: &Value) -> anyhow::Result<Minified> {
    let options = match options {
        Value::Null => HtmlOptions::default(),
        other => HtmlOptions::deserialize(other)?,
    };

    let mut cfg = Cfg::new();
    cfg.keep_comments = options.keep_comments;
    cfg.keep_closing_tags = options.keep_closing_tags;
    cfg.minify_css = options.minify_css;
    cfg.minify_js = options.minify_js;

    let code = String::from_utf8(minify(input.code.as_bytes(), &cfg))?;
    Ok(Minified::Code(code))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn call(code: &str, options: Value) -> String {
        match stage()
            .call(
                Input {
                    name: "index.html",
                    code,
                },
                &options,
            )
            .unwrap()
        {
            Minified::Code(code) => code,
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn strips_comments_and_whitespace() {
        let input = "<!-- c -->\n<div>\n    <p>  hello  </p>\n</div>\n";
        let output = call(input, json!({}));

        assert!(!output.contains("<!--"), "{output}");
        assert!(output.contains("hello"));
        assert!(output.len() < input.len());
    }

    #[test]
    fn comments_can_be_kept() {
        let output = call("<!-- c --><p>x</p>", json!({ "keep_comments": true }));
        assert!(output.contains("<!--"), "{output}");
    }

    #[test]
    fn rejects_malformed_options() {
        let result = stage().call(
            Input {
                name: "index.html",
                code: "<p>x</p>",
            },
            &json!({ "keep_comments": "yes" }),
        );

        assert!(result.is_err());
    }
}
