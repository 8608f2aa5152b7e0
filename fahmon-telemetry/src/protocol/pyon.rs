//! PyON to JSON rewriting.
//!
//! Message bodies are JSON with Python literals: `None`, `True` and `False`
//! appear as bare words. They are rewritten outside string literals only.

/// Rewrite a PyON body into JSON text.
pub fn to_json(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut after_word = false;
    let mut rest = body;

    while let Some(c) = rest.chars().next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            rest = &rest[c.len_utf8()..];
            continue;
        }

        if c == '"' {
            in_string = true;
            out.push(c);
            after_word = false;
            rest = &rest[1..];
            continue;
        }

        if !after_word {
            if let Some((word, json)) = literal_at(rest) {
                out.push_str(json);
                rest = &rest[word.len()..];
                continue;
            }
        }

        after_word = is_word_char(c);
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }
    out
}

const LITERALS: &[(&str, &str)] = &[("None", "null"), ("True", "true"), ("False", "false")];

fn literal_at(text: &str) -> Option<(&'static str, &'static str)> {
    LITERALS.iter().copied().find(|(word, _)| {
        text.starts_with(word)
            && !text[word.len()..]
                .chars()
                .next()
                .is_some_and(is_word_char)
    })
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
