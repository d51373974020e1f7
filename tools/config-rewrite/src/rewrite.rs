//! Text rewrites for agent config and topology files.

use anyhow::{anyhow, bail, Result};
use serde_json::Value;

const PUBLIC_IP_KEY: &str = "p2p_public_ip";
const PUBLIC_IP_ENV_KEY: &str = "P2P_PUBLIC_IP";

/// Keys the cluster values file must define.
pub const REQUIRED_KEYS: [&str; 5] = [
    "p2p-public-ip",
    "p2p-public-port",
    "node-name-lsa",
    "node-name-sa-1",
    "node-name-sa-2",
];

/// Concrete values for one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterValues {
    pub public_ip: String,
    pub public_port: String,
    pub node_lsa: String,
    pub node_sa1: String,
    pub node_sa2: String,
}

impl ClusterValues {
    /// Read the required keys from a JSON object, reporting every missing key.
    pub fn from_json(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| anyhow!("expected JSON object at top-level"))?;

        let missing: Vec<&str> = REQUIRED_KEYS
            .iter()
            .copied()
            .filter(|key| !object.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            bail!("missing keys: {}", missing.join(", "));
        }

        let get = |key: &str| object.get(key).map(scalar).unwrap_or_default();
        Ok(Self {
            public_ip: get("p2p-public-ip"),
            public_port: get("p2p-public-port"),
            node_lsa: get("node-name-lsa"),
            node_sa1: get("node-name-sa-1"),
            node_sa2: get("node-name-sa-2"),
        })
    }

    /// Placeholder to replacement pairs for `<prefix>-lsa`, `<prefix>-sa-1`, `<prefix>-sa-2`.
    pub fn tokens(&self, prefix: &str) -> Vec<(String, String)> {
        [
            ("lsa", &self.node_lsa),
            ("sa-1", &self.node_sa1),
            ("sa-2", &self.node_sa2),
        ]
        .into_iter()
        .map(|(placeholder, node)| {
            (
                format!("{}-{}", prefix, placeholder),
                format!("{}-{}", prefix, node),
            )
        })
        .collect()
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Set `p2p_public_ip` in a JSON object document.
///
/// Returns `None` when the text is not a JSON object or lacks the key.
pub fn update_json_public_ip(text: &str, ip: &str) -> Option<String> {
    if !text.trim_start().starts_with('{') {
        return None;
    }
    let mut value: Value = serde_json::from_str(text).ok()?;
    let object = value.as_object_mut()?;
    if !object.contains_key(PUBLIC_IP_KEY) {
        return None;
    }
    object.insert(PUBLIC_IP_KEY.to_string(), Value::String(ip.to_string()));

    let mut out = serde_json::to_string_pretty(&value).ok()?;
    out.push('\n');
    Some(out)
}

/// Rewrite `p2p_public_ip` assignments line by line.
///
/// Recognizes `"p2p_public_ip": "..."`, `p2p_public_ip: ...`,
/// `p2p_public_ip = ...` and `P2P_PUBLIC_IP = ...`. The new value is always
/// double quoted. Returns the new text and the number of lines changed.
pub fn update_public_ip_assignments(text: &str, ip: &str) -> (String, usize) {
    let quoted = format!("\"{}\"", ip);
    let mut out = String::with_capacity(text.len() + quoted.len());
    let mut replaced = 0;

    for line in text.split_inclusive('\n') {
        let (body, ending) = split_line_ending(line);
        match rewrite_assignment(body, &quoted) {
            Some(rewritten) => {
                out.push_str(&rewritten);
                replaced += 1;
            }
            None => out.push_str(body),
        }
        out.push_str(ending);
    }

    (out, replaced)
}

fn split_line_ending(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

fn rewrite_assignment(line: &str, quoted: &str) -> Option<String> {
    if let Some((start, end)) = json_string_value(line) {
        return Some(format!("{}{}{}", &line[..start], quoted, &line[end..]));
    }

    [
        (PUBLIC_IP_KEY, ':'),
        (PUBLIC_IP_KEY, '='),
        (PUBLIC_IP_ENV_KEY, '='),
    ]
    .into_iter()
    .find_map(|(key, separator)| {
        let value_start = assignment_value(line, key, separator)?;
        Some(format!("{}{}", &line[..value_start], quoted))
    })
}

/// Byte range of the quoted string value in `"p2p_public_ip": "..."`.
fn json_string_value(line: &str) -> Option<(usize, usize)> {
    let key = format!("\"{}\"", PUBLIC_IP_KEY);
    line.match_indices(key.as_str()).find_map(|(at, _)| {
        let after_key = at + key.len();
        let colon = after_key + leading_whitespace(&line[after_key..]);
        if !line[colon..].starts_with(':') {
            return None;
        }
        let open = colon + 1 + leading_whitespace(&line[colon + 1..]);
        if !line[open..].starts_with('"') {
            return None;
        }

        let mut escaped = false;
        for (offset, c) in line[open + 1..].char_indices() {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => return Some((open, open + 1 + offset + 1)),
                _ => {}
            }
        }
        None
    })
}

/// Offset where the value of `key <separator>` begins, skipping
/// occurrences glued to a preceding word and values that are comments.
fn assignment_value(line: &str, key: &str, separator: char) -> Option<usize> {
    line.match_indices(key).find_map(|(at, _)| {
        if line[..at].chars().next_back().is_some_and(is_word_char) {
            return None;
        }
        let after_key = at + key.len();
        let sep = after_key + leading_whitespace(&line[after_key..]);
        if !line[sep..].starts_with(separator) {
            return None;
        }
        let value = sep + 1 + leading_whitespace(&line[sep + 1..]);
        if line[value..].starts_with('#') {
            return None;
        }
        Some(value)
    })
}

fn leading_whitespace(s: &str) -> usize {
    s.len() - s.trim_start().len()
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_token_char(c: char) -> bool {
    is_word_char(c) || c == '-'
}

/// Replace whole-token occurrences of `token`.
///
/// A match must not touch a letter, digit, `_` or `-` on either side, so
/// `config-sa-1` leaves `config-sa-10` alone.
pub fn replace_token(text: &str, token: &str, replacement: &str) -> (String, usize) {
    if token.is_empty() {
        return (text.to_string(), 0);
    }

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut count = 0;

    for (start, _) in text.match_indices(token) {
        let end = start + token.len();
        let before = text[..start].chars().next_back();
        let after = text[end..].chars().next();
        if before.is_some_and(is_token_char) || after.is_some_and(is_token_char) {
            continue;
        }
        out.push_str(&text[last..start]);
        out.push_str(replacement);
        last = end;
        count += 1;
    }
    out.push_str(&text[last..]);

    (out, count)
}

/// Apply [`replace_token`] for each pair in order.
pub fn replace_tokens(text: &str, pairs: &[(String, String)]) -> (String, usize) {
    pairs
        .iter()
        .fold((text.to_string(), 0), |(text, total), (token, replacement)| {
            let (text, n) = replace_token(&text, token, replacement);
            (text, total + n)
        })
}

/// Replace every line containing `p2p_public_ip:` with a quoted assignment,
/// keeping whatever precedes the key.
pub fn set_public_ip_lines(text: &str, ip: &str) -> (String, usize) {
    let marker = format!("{}:", PUBLIC_IP_KEY);
    let mut replaced = 0;

    let lines: Vec<String> = text
        .lines()
        .map(|line| match line.find(&marker) {
            Some(at) => {
                replaced += 1;
                format!("{}{} \"{}\"", &line[..at], marker, ip)
            }
            None => line.to_string(),
        })
        .collect();

    let mut out = lines.join("\n");
    out.push('\n');
    (out, replaced)
}
