//! Minimal HTML scanning for feed content.
//!
//! Feed bodies are HTML fragments. We only need their visible text, the
//! targets of their anchors and the sources of their images, so a single pass
//! over the tags is enough.

use url::Url;

/// What a fragment contains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HtmlContent {
    /// Visible text with whitespace normalized.
    pub text: String,
    /// Absolute http(s) targets of `<a href>`, in document order.
    pub links: Vec<String>,
    /// Absolute http(s) sources of `<img src>`, in document order.
    pub images: Vec<String>,
}

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "br", "li", "tr", "h1", "h2", "h3", "h4", "h5", "h6", "blockquote",
];

/// Scan an HTML fragment. Relative URLs are resolved against `base`.
pub fn extract(html: &str, base: Option<&Url>) -> HtmlContent {
    let mut content = HtmlContent::default();
    let mut text = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(open) = rest.find('<') {
        text.push_str(&decode_entities(&rest[..open]));
        let after = &rest[open + 1..];
        let Some(close) = after.find('>') else {
            rest = "";
            break;
        };
        let tag = &after[..close];
        rest = &after[close + 1..];

        let closing = tag.starts_with('/');
        let name = tag
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();

        match name.as_str() {
            "a" if !closing => {
                if let Some(href) = attribute(tag, "href").and_then(|h| resolve(base, &h)) {
                    push_unique(&mut content.links, href);
                }
            }
            "img" => {
                if let Some(src) = attribute(tag, "src").and_then(|s| resolve(base, &s)) {
                    push_unique(&mut content.images, src);
                }
            }
            "script" | "style" if !closing => {
                let end_tag = format!("</{name}");
                rest = match rest.to_ascii_lowercase().find(&end_tag) {
                    Some(end) => &rest[end..],
                    None => "",
                };
            }
            name if BLOCK_TAGS.contains(&name) => text.push('\n'),
            _ => {}
        }
    }
    text.push_str(&decode_entities(rest));

    content.text = normalize(&text);
    content
}

/// Visible text of a fragment.
pub fn strip_tags(html: &str) -> String {
    extract(html, None).text
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

fn resolve(base: Option<&Url>, reference: &str) -> Option<String> {
    let reference = reference.trim();
    let url = match Url::parse(reference) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => base?.join(reference).ok()?,
        Err(_) => return None,
    };
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

/// Value of attribute `name` inside the raw tag text.
fn attribute(tag: &str, name: &str) -> Option<String> {
    // ASCII lowercasing keeps byte offsets, so indices into `lower` are valid in `tag`.
    let lower = tag.to_ascii_lowercase();
    let mut from = 0;
    while let Some(found) = lower[from..].find(name) {
        let start = from + found;
        from = start + name.len();
        if !lower[..start].ends_with(|c: char| c.is_ascii_whitespace()) {
            continue;
        }
        let Some(value) = tag[from..].trim_start().strip_prefix('=') else {
            continue;
        };
        let value = value.trim_start();
        let raw = match value.chars().next() {
            Some(quote @ ('"' | '\'')) => value[1..].split(quote).next()?,
            Some(_) => value
                .split(|c: char| c.is_ascii_whitespace() || c == '/')
                .next()?,
            None => return None,
        };
        return Some(decode_entities(raw));
    }
    None
}

/// Decode the character references commonly found in feeds.
pub fn decode_entities(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let decoded = rest
            .find(';')
            .filter(|&end| end <= 10)
            .and_then(|end| entity(&rest[1..end]).map(|c| (c, end)));
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => {
            let code = if let Some(hex) = name.strip_prefix("#x").or(name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok()?
            } else {
                name.strip_prefix('#')?.parse().ok()?
            };
            char::from_u32(code)
        }
    }
}

/// Collapse whitespace inside lines and keep at most one blank line between paragraphs.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_blank = false;
    for line in text.lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.is_empty() {
            pending_blank = !out.is_empty();
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
            if pending_blank {
                out.push('\n');
            }
        }
        out.push_str(&line);
        pending_blank = false;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_and_entities() {
        let content = extract("<p>Fish &amp; chips</p><p>&lt;hot&gt; &#39;now&#x21;</p>", None);
        assert_eq!(content.text, "Fish & chips\n\n<hot> 'now!");
    }

    #[test]
    fn test_links_and_images() {
        let html = r#"Read <a href="https://example.com/a">this</a> and
            <A HREF='/b?x=1&amp;y=2'>that</A> <img alt="x" src="pic.png">
            <a href="mailto:someone@example.com">mail</a>"#;
        let base = Url::parse("https://example.com/posts/1").unwrap();
        let content = extract(html, Some(&base));

        assert_eq!(
            content.links,
            vec!["https://example.com/a", "https://example.com/b?x=1&y=2"]
        );
        assert_eq!(content.images, vec!["https://example.com/posts/pic.png"]);
        assert_eq!(content.text, "Read this and\nthat\nmail");
    }

    #[test]
    fn test_relative_without_base_is_dropped() {
        let content = extract(r#"<img src="/x.png"><a href="rel">r</a>"#, None);
        assert!(content.images.is_empty());
        assert!(content.links.is_empty());
    }

    #[test]
    fn test_script_is_skipped() {
        assert_eq!(
            strip_tags("before<script>var a = '<b>';</script>after"),
            "beforeafter"
        );
    }

    #[test]
    fn test_attribute_name_must_stand_alone() {
        assert_eq!(attribute(r#"img data-src="a" src="b""#, "src"), Some("b".to_string()));
        assert_eq!(attribute("img srcset=x", "src"), None);
    }

    #[test]
    fn test_unknown_entity_is_kept() {
        assert_eq!(decode_entities("a &bogus; b & c"), "a &bogus; b & c");
    }

    #[test]
    fn test_unterminated_tag() {
        assert_eq!(strip_tags("text <b"), "text");
    }
}
