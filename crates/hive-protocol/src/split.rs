//! Quote-aware tokenizer for event arguments.

/// Split an argument string on whitespace, keeping quoted spans together.
///
/// `"..."` and `'...'` spans are atomic and lose their quotes; text directly
/// adjacent to a quote joins the same token. Backslash escapes are decoded
/// both inside and outside quotes. An empty quoted string produces an empty
/// token, and an unterminated quote runs to the end of the input.
#[must_use]
pub fn split_quoted(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (_, '\\') => {
                in_token = true;
                match chars.next() {
                    Some(escaped) => current.push(unescape(escaped)),
                    None => current.push('\\'),
                }
            }
            (Some(open), c) if c == open => quote = None,
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                in_token = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if in_token {
        tokens.push(current);
    }
    tokens
}

const fn unescape(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        other => other,
    }
}
