//! Control protocol framing and parsing.
//!
//! Replies are sequences of `NNN-text` mid lines, `NNN+text` lines followed by
//! a dot-terminated data block, and a final `NNN text` line. Codes in the 6xx
//! range are asynchronous events.

use std::collections::HashMap;

use chrono::NaiveDateTime;

use super::{Circuit, CircuitNode, ControlError, StatusEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub code: u16,
    pub text: String,
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub lines: Vec<ReplyLine>,
}

impl Reply {
    /// Status code of the final line.
    pub fn code(&self) -> u16 {
        self.lines.last().map(|l| l.code).unwrap_or(0)
    }

    pub fn is_ok(&self) -> bool {
        self.code() == 250
    }

    pub fn is_event(&self) -> bool {
        (600..700).contains(&self.code())
    }

    /// Text of the final line.
    pub fn message(&self) -> &str {
        self.lines.last().map(|l| l.text.as_str()).unwrap_or("")
    }

    /// Convert a non-250 reply into an error.
    pub fn into_result(self) -> Result<Reply, ControlError> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(ControlError::Rejected {
                code: self.code(),
                message: self.message().to_string(),
            })
        }
    }
}

/// Incrementally assembles replies from lines.
#[derive(Debug, Default)]
pub struct ReplyAssembler {
    lines: Vec<ReplyLine>,
    data: Option<(ReplyLine, Vec<String>)>,
}

impl ReplyAssembler {
    /// Feed one line (without CRLF). Returns a reply once it is complete.
    pub fn push(&mut self, raw: &str) -> Result<Option<Reply>, ControlError> {
        let line = raw.trim_end_matches(['\r', '\n']);

        if self.data.is_some() {
            if line == "." {
                if let Some((mut head, body)) = self.data.take() {
                    head.data = Some(body.join("\n"));
                    self.lines.push(head);
                }
            } else if let Some((_, body)) = self.data.as_mut() {
                let unescaped = line.strip_prefix('.').filter(|l| l.starts_with('.'));
                body.push(unescaped.unwrap_or(line).to_string());
            }
            return Ok(None);
        }

        let code = line.get(..3).and_then(|c| c.parse::<u16>().ok());
        let separator = line.as_bytes().get(3).copied();
        let (Some(code), Some(separator), Some(text)) = (code, separator, line.get(4..)) else {
            return Err(ControlError::Protocol(line.to_string()));
        };
        let entry = ReplyLine {
            code,
            text: text.to_string(),
            data: None,
        };

        match separator {
            b'-' => self.lines.push(entry),
            b'+' => self.data = Some((entry, Vec::new())),
            b' ' => {
                self.lines.push(entry);
                return Ok(Some(Reply {
                    lines: std::mem::take(&mut self.lines),
                }));
            }
            _ => return Err(ControlError::Protocol(line.to_string())),
        }
        Ok(None)
    }
}

/// Quote a value for use in a command.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Strip surrounding quotes and unescape, if the value is quoted.
pub fn unquote(value: &str) -> String {
    let Some(inner) = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
    else {
        return value.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Split on spaces, keeping quoted sections (with escapes) together.
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in input.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                current.push(c);
                in_quotes = !in_quotes;
            }
            ' ' if !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Parse `KEY=value` tokens, returning positional tokens separately.
pub fn parse_args(input: &str) -> (Vec<String>, HashMap<String, String>) {
    let mut positional = Vec::new();
    let mut args = HashMap::new();
    for token in tokenize(input) {
        match token.split_once('=') {
            Some((key, value)) if !key.starts_with('"') => {
                args.insert(key.to_string(), unquote(value));
            }
            _ => positional.push(token),
        }
    }
    (positional, args)
}

/// Parse a `650 STATUS_*` event.
pub fn parse_status_event(reply: &Reply) -> Option<StatusEvent> {
    let first = reply.lines.first()?;
    let (positional, args) = parse_args(&first.text);
    let mut positional = positional.into_iter();
    let kind = positional.next()?;
    if !kind.starts_with("STATUS_") {
        return None;
    }
    Some(StatusEvent {
        kind,
        severity: positional.next()?,
        action: positional.next()?,
        args,
    })
}

/// Extract `GETINFO` values in the order of `keys`.
pub fn parse_get_info(reply: &Reply, keys: &[&str]) -> Result<Vec<String>, ControlError> {
    let mut values = HashMap::new();
    for line in &reply.lines {
        if let Some(data) = &line.data {
            let key = line.text.trim_end_matches('=');
            values.insert(key.to_string(), data.clone());
        } else if let Some((key, value)) = line.text.split_once('=') {
            values.insert(key.to_string(), value.to_string());
        }
    }
    keys.iter()
        .map(|key| {
            values
                .remove(*key)
                .ok_or_else(|| ControlError::Protocol(format!("GETINFO reply lacks {}", key)))
        })
        .collect()
}

fn parse_node(entry: &str) -> CircuitNode {
    let entry = entry.trim_start_matches('$');
    match entry.split_once(['~', '=']) {
        Some((fp, nick)) => CircuitNode {
            fingerprint: fp.to_string(),
            nickname: Some(nick.to_string()),
        },
        None => CircuitNode {
            fingerprint: entry.to_string(),
            nickname: None,
        },
    }
}

/// Parse one line of `circuit-status`.
pub fn parse_circuit(line: &str) -> Option<Circuit> {
    let (positional, args) = parse_args(line);
    let mut positional = positional.into_iter();
    let id = positional.next()?;
    let status = positional.next()?;
    let path = positional
        .next()
        .map(|p| p.split(',').map(parse_node).collect())
        .unwrap_or_default();
    let time_created = args
        .get("TIME_CREATED")
        .and_then(|t| NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S%.f").ok());

    Some(Circuit {
        id,
        status,
        path,
        purpose: args.get("PURPOSE").cloned(),
        time_created,
    })
}

/// Parse the `circuit-status` block.
pub fn parse_circuits(block: &str) -> Vec<Circuit> {
    block
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(parse_circuit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(lines: &[&str]) -> Reply {
        let mut asm = ReplyAssembler::default();
        let mut out = None;
        for line in lines {
            if let Some(reply) = asm.push(line).unwrap() {
                out = Some(reply);
            }
        }
        out.expect("reply should be complete")
    }

    #[test]
    fn test_single_line_reply() {
        let reply = assemble(&["250 OK"]);
        assert!(reply.is_ok());
        assert_eq!(reply.message(), "OK");
    }

    #[test]
    fn test_error_reply_to_result() {
        let reply = assemble(&["515 Authentication failed"]);
        match reply.into_result() {
            Err(ControlError::Rejected { code, message }) => {
                assert_eq!(code, 515);
                assert_eq!(message, "Authentication failed");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_get_info_single_value() {
        let reply = assemble(&["250-net/listeners/socks=\"127.0.0.1:9050\"", "250 OK"]);
        let values = parse_get_info(&reply, &["net/listeners/socks"]).unwrap();
        assert_eq!(values, vec!["\"127.0.0.1:9050\"".to_string()]);
    }

    #[test]
    fn test_get_info_data_block() {
        let reply = assemble(&[
            "250+circuit-status=",
            "1 BUILT $AAAA~alpha,$BBBB~beta PURPOSE=GENERAL",
            "2 LAUNCHED PURPOSE=GENERAL",
            ".",
            "250 OK",
        ]);
        let values = parse_get_info(&reply, &["circuit-status"]).unwrap();
        let circuits = parse_circuits(&values[0]);
        assert_eq!(circuits.len(), 2);
        assert_eq!(circuits[0].path.len(), 2);
        assert_eq!(circuits[0].path[1].nickname.as_deref(), Some("beta"));
        assert!(circuits[1].path.is_empty());
    }

    #[test]
    fn test_get_info_missing_key() {
        let reply = assemble(&["250 OK"]);
        assert!(parse_get_info(&reply, &["version"]).is_err());
    }

    #[test]
    fn test_bootstrap_event() {
        let reply = assemble(&[
            "650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=40 TAG=loading_keys SUMMARY=\"Loading authority key certs\"",
        ]);
        assert!(reply.is_event());
        let event = parse_status_event(&reply).unwrap();
        assert_eq!(event.bootstrap_progress(), Some(40));
        assert_eq!(
            event.args.get("SUMMARY").map(String::as_str),
            Some("Loading authority key certs")
        );
    }

    #[test]
    fn test_circuit_established_event() {
        let reply = assemble(&["650 STATUS_CLIENT NOTICE CIRCUIT_ESTABLISHED"]);
        let event = parse_status_event(&reply).unwrap();
        assert_eq!(event.circuit_established(), Some(true));
        assert_eq!(event.bootstrap_progress(), None);
    }

    #[test]
    fn test_non_status_event_ignored() {
        let reply = assemble(&["650 CIRC 5 BUILT"]);
        assert!(parse_status_event(&reply).is_none());
    }

    #[test]
    fn test_circuit_time_created() {
        let circuit = parse_circuit(
            "12 BUILT $ABCD~relay PURPOSE=GENERAL TIME_CREATED=2024-05-01T12:30:45.123456",
        )
        .unwrap();
        assert_eq!(circuit.id, "12");
        assert_eq!(circuit.purpose.as_deref(), Some("GENERAL"));
        assert!(circuit.time_created.is_some());
    }

    #[test]
    fn test_quote_unquote() {
        let quoted = quote("obfs4 1.2.3.4:443 \"x\"");
        assert_eq!(quoted, "\"obfs4 1.2.3.4:443 \\\"x\\\"\"");
        assert_eq!(unquote(&quoted), "obfs4 1.2.3.4:443 \"x\"");
        assert_eq!(unquote("bare"), "bare");
    }

    #[test]
    fn test_malformed_line() {
        let mut asm = ReplyAssembler::default();
        assert!(asm.push("25").is_err());
        assert!(asm.push("abc OK").is_err());
    }

    #[test]
    fn test_multibyte_separator_is_an_error() {
        let mut asm = ReplyAssembler::default();
        assert!(matches!(asm.push("250\u{e9}x"), Err(ControlError::Protocol(_))));
        assert!(matches!(asm.push("2\u{e9}0 OK"), Err(ControlError::Protocol(_))));
        assert_eq!(asm.push("250 OK").unwrap().unwrap().code(), 250);
    }
}
