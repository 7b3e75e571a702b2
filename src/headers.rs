use std::cmp::Ordering;

/// One `ptype.property=value` pair inside a structured fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthProp {
    pub key: String,
    pub value: String,
    pub comment: Option<String>,
}

/// A structured Authentication-Results entry: `key=value` plus ordered
/// properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEntry {
    key: String,
    value: String,
    comment: Option<String>,
    props: Vec<AuthProp>,
}

impl AuthEntry {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
            comment: None,
            props: Vec::new(),
        }
    }

    pub fn with_comment(mut self, comment: &str) -> Self {
        self.comment = Some(comment.to_string());
        self
    }

    pub fn with_prop(mut self, key: &str, value: &str) -> Self {
        self.props.push(AuthProp {
            key: key.to_string(),
            value: value.to_string(),
            comment: None,
        });
        self
    }

    pub fn with_prop_comment(mut self, key: &str, value: &str, comment: &str) -> Self {
        self.props.push(AuthProp {
            key: key.to_string(),
            value: value.to_string(),
            comment: Some(comment.to_string()),
        });
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn as_string(&self) -> String {
        let mut out = format!("{}={}", self.key, self.value);
        if let Some(comment) = &self.comment {
            out.push_str(&format!(" ({comment})"));
        }
        for prop in &self.props {
            out.push_str(&format!(" {}={}", prop.key, prop.value));
            if let Some(comment) = &prop.comment {
                out.push_str(&format!(" ({comment})"));
            }
        }
        out
    }
}

/// A handler's contribution to the Authentication-Results header.
///
/// Legacy fragments are opaque strings kept for older handlers; new code
/// produces structured entries only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFragment {
    Legacy(String),
    Structured(AuthEntry),
}

impl AuthFragment {
    /// The method key used for handler-aware sorting, lower-cased.
    pub fn key(&self) -> String {
        match self {
            AuthFragment::Structured(entry) => entry.key().to_lowercase(),
            AuthFragment::Legacy(text) => text
                .split('=')
                .next()
                .unwrap_or_default()
                .trim()
                .to_lowercase(),
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, AuthFragment::Legacy(_))
    }

    pub fn as_string(&self) -> String {
        match self {
            AuthFragment::Legacy(text) => text.clone(),
            AuthFragment::Structured(entry) => entry.as_string(),
        }
    }
}

/// A queued header mutation, flushed to the transport after the eom event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderOp {
    Insert {
        index: u32,
        name: String,
        value: String,
    },
    Add {
        name: String,
        value: String,
    },
    Change {
        name: String,
        occurrence: u32,
        value: String,
    },
}

/// Rendering options for the composed header, from configuration.
#[derive(Debug, Clone)]
pub struct HeaderStyle {
    pub indent_style: String,
    pub indent_by: usize,
    pub fold_at: Option<usize>,
}

impl Default for HeaderStyle {
    fn default() -> Self {
        Self {
            indent_style: "entry".to_string(),
            indent_by: 4,
            fold_at: None,
        }
    }
}

/// Decides ordering between two fragments that share a key. Returns `None`
/// when no loaded handler claims the key.
pub type FragmentSorter<'a> = &'a dyn Fn(&str, &str, &str) -> Option<Ordering>;

/// Ordered accumulator for authentication fragments and queued header
/// mutations.
///
/// Connection-scope fragments are re-emitted on every message of the
/// connection; everything else lives for a single message.
#[derive(Debug, Default)]
pub struct HeaderAccumulator {
    c_auth_headers: Vec<AuthFragment>,
    auth_headers: Vec<AuthFragment>,
    pre_headers: Vec<(String, String)>,
    add_headers: Vec<(String, String)>,
    change_headers: Vec<HeaderOp>,
}

impl HeaderAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_auth_header(&mut self, fragment: AuthFragment) {
        self.auth_headers.push(fragment);
    }

    pub fn add_c_auth_header(&mut self, fragment: AuthFragment) {
        self.c_auth_headers.push(fragment);
    }

    /// Queue a header for insertion near the top of the message.
    pub fn prepend_header(&mut self, name: &str, value: &str) {
        self.pre_headers.push((name.to_string(), value.to_string()));
    }

    /// Queue a header for appending at the end of the message.
    pub fn append_header(&mut self, name: &str, value: &str) {
        self.add_headers.push((name.to_string(), value.to_string()));
    }

    /// Queue a change to the nth occurrence of an existing header.
    pub fn change_header(&mut self, name: &str, occurrence: u32, value: &str) {
        self.change_headers.push(HeaderOp::Change {
            name: name.to_string(),
            occurrence,
            value: value.to_string(),
        });
    }

    pub fn pre_headers(&self) -> &[(String, String)] {
        &self.pre_headers
    }

    pub fn add_headers(&self) -> &[(String, String)] {
        &self.add_headers
    }

    /// Connection-scope fragments first, then message fragments, under the
    /// handler-aware stable sort, with exact duplicates collapsed.
    fn sorted_fragments(&self, sorter: FragmentSorter) -> Vec<AuthFragment> {
        let mut fragments: Vec<AuthFragment> = self
            .c_auth_headers
            .iter()
            .chain(self.auth_headers.iter())
            .cloned()
            .collect();
        fragments.sort_by(|a, b| {
            let (ka, kb) = (a.key(), b.key());
            if ka == kb {
                if let Some(ord) = sorter(&ka, &a.as_string(), &b.as_string()) {
                    return ord;
                }
            }
            a.as_string().cmp(&b.as_string())
        });
        fragments.dedup_by(|a, b| a.as_string() == b.as_string());
        fragments
    }

    /// Render the Authentication-Results value. The first folded line is
    /// the AuthServID; every fragment follows on its own indented line,
    /// `none` when there are no fragments.
    pub fn serialize_auth_results(
        &self,
        hostname: &str,
        style: &HeaderStyle,
        sorter: FragmentSorter,
    ) -> String {
        let fragments = self.sorted_fragments(sorter);
        let indent = " ".repeat(style.indent_by);
        if fragments.is_empty() {
            return format!("{hostname};\n{indent}none");
        }

        let strings: Vec<String> = fragments.iter().map(|f| f.as_string()).collect();
        let legacy = fragments.iter().any(|f| f.is_legacy());
        let mut value = if legacy || style.indent_style == "entry" {
            format!("{hostname};\n{indent}{}", strings.join(&format!(";\n{indent}")))
        } else {
            format!("{hostname}; {}", strings.join("; "))
        };
        if let Some(fold_at) = style.fold_at {
            value = fold_lines(&value, fold_at, &" ".repeat(style.indent_by * 2));
        }
        value
    }

    /// Produce the ordered mutation packets for the current message.
    /// Authentication-Results is always the first insertion, landing at
    /// index 1; the quarantine marker and other queued prepends follow it.
    pub fn emit_ops(
        &self,
        hostname: &str,
        style: &HeaderStyle,
        quarantine_reason: Option<&str>,
        sorter: FragmentSorter,
    ) -> Vec<HeaderOp> {
        let mut ops = Vec::new();
        ops.push(HeaderOp::Insert {
            index: 1,
            name: "Authentication-Results".to_string(),
            value: self.serialize_auth_results(hostname, style, sorter),
        });
        if let Some(reason) = quarantine_reason {
            ops.push(HeaderOp::Insert {
                index: 2,
                name: "X-Disposition-Quarantine".to_string(),
                value: reason.to_string(),
            });
        }
        let base = ops.len() as u32 + 1;
        for (offset, (name, value)) in self.pre_headers.iter().enumerate() {
            ops.push(HeaderOp::Insert {
                index: base + offset as u32,
                name: name.clone(),
                value: value.clone(),
            });
        }
        ops.extend(self.change_headers.iter().cloned());
        for (name, value) in &self.add_headers {
            ops.push(HeaderOp::Add {
                name: name.clone(),
                value: value.clone(),
            });
        }
        ops
    }

    /// Drop message-scope state; connection-scope fragments survive.
    pub fn reset_message(&mut self) {
        self.auth_headers.clear();
        self.pre_headers.clear();
        self.add_headers.clear();
        self.change_headers.clear();
    }

    pub fn reset_all(&mut self) {
        self.reset_message();
        self.c_auth_headers.clear();
    }
}

fn fold_lines(value: &str, fold_at: usize, continuation: &str) -> String {
    let mut out = Vec::new();
    for line in value.split('\n') {
        if line.len() <= fold_at {
            out.push(line.to_string());
            continue;
        }
        let mut rest = line;
        let mut first = true;
        while rest.len() > fold_at {
            let cut = match rest.as_bytes()[..fold_at].iter().rposition(|&b| b == b' ') {
                Some(pos) if pos > 0 => pos,
                _ => break,
            };
            let (head, tail) = rest.split_at(cut);
            out.push(if first {
                head.to_string()
            } else {
                format!("{continuation}{head}")
            });
            rest = tail.trim_start();
            first = false;
        }
        out.push(if first {
            rest.to_string()
        } else {
            format!("{continuation}{rest}")
        });
    }
    out.join("\n")
}
