//! Command line splitting.
//!
//! - spaces and tabs separate tokens
//! - single or double quotes group everything up to the matching quote into
//!   one token, which also ends any token right before the opening quote
//! - a backslash takes the next character literally, inside quotes too

pub fn tokenize_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => current.push(chars.next().unwrap_or('\\')),
            '"' | '\'' if quote == Some(c) => {
                flush(&mut tokens, &mut current);
                quote = None;
            }
            '"' | '\'' if quote.is_none() => {
                flush(&mut tokens, &mut current);
                quote = Some(c);
            }
            ' ' | '\t' if quote.is_none() => flush(&mut tokens, &mut current),
            _ => current.push(c),
        }
    }
    flush(&mut tokens, &mut current);
    tokens
}

fn flush(tokens: &mut Vec<String>, current: &mut String) {
    if !current.is_empty() {
        tokens.push(std::mem::take(current));
    }
}
