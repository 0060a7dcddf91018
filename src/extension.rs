//! Parsing of `Sec-WebSocket-Extensions` header values.
//!
//! Each header value holds a comma-separated list of extension tokens of the
//! form `name (";" key ["=" value])*`, where a value is either a bare token
//! or a quoted string with backslash escapes. The parser here is
//! deliberately hand-written; the grammar is small and the failure mode
//! matters: a malformed parameter list makes the whole extension count as
//! absent rather than producing an error visible to either peer.

use std::collections::HashMap;

/// A parsed extension token: its name and parameter mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub name: Vec<u8>,
    pub params: HashMap<Vec<u8>, Vec<u8>>,
}

impl Extension {
    /// Look up a parameter value by name.
    pub fn param(&self, name: &[u8]) -> Option<&[u8]> {
        self.params.get(name).map(|v| v.as_slice())
    }
}

fn trim_bytes(mut input: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = input {
        if first.is_ascii_whitespace() {
            input = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = input {
        if last.is_ascii_whitespace() {
            input = rest;
        } else {
            break;
        }
    }
    input
}

fn find_next(input: &[u8], set: &[u8], start: usize) -> Option<usize> {
    input[start..]
        .iter()
        .position(|b| set.contains(b))
        .map(|i| start + i)
}

fn find_byte(input: &[u8], byte: u8, start: usize) -> Option<usize> {
    input[start..]
        .iter()
        .position(|&b| b == byte)
        .map(|i| start + i)
}

/// Parse a `key=value(;key=value)*` parameter list. Returns `None` if the
/// list is malformed (dangling `=`, unterminated quote, or truncated
/// escape).
pub fn parse_params(input: &[u8]) -> Option<HashMap<Vec<u8>, Vec<u8>>> {
    let mut out = HashMap::new();

    let mut start = 0;
    while start < input.len() {
        let var;
        let mut val = Vec::new();

        match find_next(input, b"=;", start) {
            Some(mut at) => {
                var = trim_bytes(&input[start..at]).to_vec();
                if input[at] == b'=' {
                    if at + 1 >= input.len() {
                        return None;
                    }
                    at += 1;

                    if input[at] == b'"' {
                        at += 1;

                        let mut complete = false;
                        let mut n = at;
                        while n < input.len() {
                            if input[n] == b'\\' {
                                if n + 1 >= input.len() {
                                    return None;
                                }
                                n += 1;
                                val.push(input[n]);
                            } else if input[n] == b'"' {
                                complete = true;
                                at = n + 1;
                                break;
                            } else {
                                val.push(input[n]);
                            }
                            n += 1;
                        }

                        if !complete {
                            return None;
                        }

                        match find_byte(input, b';', at) {
                            Some(semi) => start = semi + 1,
                            None => start = input.len(),
                        }
                    } else {
                        let vstart = at;
                        match find_byte(input, b';', vstart) {
                            Some(semi) => {
                                val = trim_bytes(&input[vstart..semi]).to_vec();
                                start = semi + 1;
                            }
                            None => {
                                val = trim_bytes(&input[vstart..]).to_vec();
                                start = input.len();
                            }
                        }
                    }
                } else {
                    start = at + 1;
                }
            }
            None => {
                var = trim_bytes(&input[start..]).to_vec();
                start = input.len();
            }
        }

        out.insert(var, val);
    }

    Some(out)
}

/// Split one header value into extension tokens on commas, ignoring commas
/// inside quoted parameter values.
fn split_tokens(value: &[u8]) -> Vec<&[u8]> {
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;

    for (i, &b) in value.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_quotes => escaped = true,
            b'"' => in_quotes = !in_quotes,
            b',' if !in_quotes => {
                tokens.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }

    tokens.push(&value[start..]);
    tokens
}

/// Search a list of `Sec-WebSocket-Extensions` values for an extension by
/// name. A matching token with a malformed parameter list makes the
/// extension count as absent.
pub fn find_extension<I>(values: I, name: &[u8]) -> Option<Extension>
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    for value in values {
        for token in split_tokens(value.as_ref()) {
            let (token_name, params_part) = match find_byte(token, b';', 0) {
                Some(at) => (trim_bytes(&token[..at]), Some(&token[at + 1..])),
                None => (trim_bytes(token), None),
            };

            if token_name == name {
                let params = match params_part {
                    Some(part) => parse_params(part)?,
                    None => HashMap::new(),
                };
                return Some(Extension { name: name.to_vec(), params });
            }
        }
    }

    None
}
