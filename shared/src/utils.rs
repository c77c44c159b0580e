use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref HEX_KEY: Regex = Regex::new(r"^(?:0x)?[0-9a-fA-F]{64}$").unwrap();
    static ref LENGTH_HINT: Regex = Regex::new(r"^(\d+)([KMBT]?)$").unwrap();
    static ref HTML_TAG: Regex = Regex::new(r"<[^>]+>").unwrap();
}

pub fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s)
}

/// 64 hex digits with an optional `0x` prefix
pub fn is_hex_key(s: &str) -> bool {
    HEX_KEY.is_match(s)
}

/// Parses a block length hint such as `500B` or `2t` into a key count.
pub fn parse_length_to_count(hint: &str) -> Option<u128> {
    let text = hint.trim().to_uppercase();
    let caps = LENGTH_HINT.captures(&text)?;
    let value: u128 = caps[1].parse().ok()?;
    let multiplier: u128 = match &caps[2] {
        "K" => 1_000,
        "M" => 1_000_000,
        "B" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        _ => 1,
    };
    value.checked_mul(multiplier)
}

/// Splits user supplied program arguments the way a POSIX shell would:
/// whitespace separates, quotes group, backslash escapes outside single quotes.
pub fn split_args(line: &str) -> Vec<String> {
    let mut args = vec![];
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for c in chars.by_ref() {
                    if c == '\'' {
                        break;
                    }
                    current.push(c);
                }
            }
            '"' => {
                in_word = true;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' => {
                            if let Some(next) = chars.next() {
                                current.push(next);
                            }
                        }
                        _ => current.push(c),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        args.push(current);
    }
    args
}

pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

pub fn strip_tags(s: &str) -> String {
    HTML_TAG.replace_all(s, "").into_owned()
}

/// first `max` chars of a response body on a single line
pub fn snippet(body: &str, max: usize) -> String {
    body.chars().take(max).collect::<String>().replace('\n', " ")
}
