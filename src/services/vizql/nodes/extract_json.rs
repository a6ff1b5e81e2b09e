//! Pulls the first balanced `{...}` object or `[...]` array out of an LLM
//! response, tolerating surrounding prose or a markdown code fence - LLMs
//! asked for "JSON only" still sometimes wrap it (spec.md §4.5).

pub fn extract_first_balanced_json(text: &str) -> Option<String> {
    let obj_start = text.find('{');
    let arr_start = text.find('[');
    let start = match (obj_start, arr_start) {
        (Some(o), Some(a)) => o.min(a),
        (Some(o), None) => o,
        (None, Some(a)) => a,
        (None, None) => return None,
    };

    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        let ch = byte as char;
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + 1;
                    return Some(text[start..end].to_string());
                }
            },
            _ => {},
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_json_from_prose() {
        let text = "Sure, here's the query:\n```json\n{\"a\": 1, \"b\": {\"c\": 2}}\n```\nLet me know if you need changes.";
        let extracted = extract_first_balanced_json(text).unwrap();
        assert_eq!(extracted, r#"{"a": 1, "b": {"c": 2}}"#);
    }

    #[test]
    fn ignores_braces_inside_strings() {
        let text = r#"{"note": "a { b } c", "value": 1}"#;
        let extracted = extract_first_balanced_json(text).unwrap();
        assert_eq!(extracted, text);
    }

    #[test]
    fn returns_none_without_json() {
        assert!(extract_first_balanced_json("no json here").is_none());
    }

    #[test]
    fn extracts_top_level_array() {
        let text = "Here you go:\n```json\n[{\"a\": 1}, {\"b\": [1, 2]}]\n```\n";
        let extracted = extract_first_balanced_json(text).unwrap();
        assert_eq!(extracted, r#"[{"a": 1}, {"b": [1, 2]}]"#);
    }

    #[test]
    fn picks_whichever_bracket_type_appears_first() {
        let text = r#"prose then {"a": [1, 2]} then more prose"#;
        let extracted = extract_first_balanced_json(text).unwrap();
        assert_eq!(extracted, r#"{"a": [1, 2]}"#);
    }
}
