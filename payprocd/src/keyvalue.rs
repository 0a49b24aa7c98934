//! The ordered dictionary used throughout the daemon.
//!
//! A [`Dict`] carries the data items of a protocol request from the codec
//! through the command handlers into sessions, database rows and the reply.
//! Entries keep their insertion order and the case of their names.  Names
//! starting with `_` are internal and never echoed to a client by default;
//! names starting with an uppercase ASCII letter are client-visible.
//!
//! The module also implements the meta-field wire form (`k1=v1&k2=v2` with
//! percent escaping) shared by the journal, the preorder database and the
//! PayPal IPN payload.

use std::fmt;

use thiserror::Error;

/// Characters escaped in journal fields and meta values.
const ESCAPE_SET: &[u8] = b":&%\r\n";

/// Additional characters escaped inside meta `k=v` pairs.
const META_ESCAPE_SET: &[u8] = b":&%\r\n= \t";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetaError {
    #[error("invalid meta name")]
    InvalidName,
    #[error("invalid form data")]
    InvalidForm,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Entry {
    name: String,
    value: String,
}

/// Ordered, case-preserving mapping of data item names to values.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Dict {
    entries: Vec<Entry>,
}

/// True if NAME is visible to clients, i.e. starts with an uppercase
/// ASCII letter.
pub fn is_client_visible(name: &str) -> bool {
    name.as_bytes().first().is_some_and(u8::is_ascii_uppercase)
}

// --- impl Dict --- //

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterate over all `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|e| (e.name.as_str(), e.value.as_str()))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }

    /// Like [`get`](Self::get) but returns the empty string for a missing
    /// entry.
    pub fn get_str(&self, name: &str) -> &str {
        self.get(name).unwrap_or("")
    }

    /// Integer value of an entry; 0 when missing or unparsable.  Like
    /// `atoi`, leading digits are honored and trailing junk is ignored.
    pub fn get_int(&self, name: &str) -> i64 {
        let s = self.get_str(name).trim_start();
        let (sign, digits) = match s.strip_prefix('-') {
            Some(rest) => (-1, rest),
            None => (1, s.strip_prefix('+').unwrap_or(s)),
        };
        let end = digits
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(digits.len());
        digits[..end].parse::<i64>().map(|n| sign * n).unwrap_or(0)
    }

    /// Insert or update an entry.  An update keeps the entry's position.
    pub fn put(&mut self, name: &str, value: &str) {
        if name.is_empty() {
            return;
        }
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(e) => e.value = value.to_string(),
            None => self.entries.push(Entry {
                name: name.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Insert or update an entry with an index attached to the name:
    /// `Desc` with index 7 becomes `Desc[7]`, `Meta[Name]` becomes
    /// `Meta[Name.7]`.  Without an index this is a plain [`put`](Self::put).
    pub fn put_idx(&mut self, name: &str, idx: Option<usize>, value: &str) {
        match idx {
            None => self.put(name, value),
            Some(i) => {
                let key = match name.strip_suffix(']') {
                    Some(prefix) if name.len() > 2 => format!("{prefix}.{i}]"),
                    _ => format!("{name}[{i}]"),
                };
                self.put(&key, value);
            }
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|e| e.name != name);
    }

    /// Remove an entry and hand its value to the caller.
    pub fn snatch(&mut self, name: &str) -> Option<String> {
        let pos = self.entries.iter().position(|e| e.name == name)?;
        Some(self.entries.remove(pos).value)
    }

    /// Append VALUE to the most recently inserted entry, separated by a
    /// newline.  Used by the codec for continuation lines.  Returns false
    /// if the dictionary is still empty.
    pub fn append_with_nl(&mut self, value: &str) -> bool {
        match self.entries.last_mut() {
            Some(e) => {
                e.value.push('\n');
                e.value.push_str(value);
                true
            }
            None => false,
        }
    }

    /// Strip all newlines from the value of the named entry.
    pub fn remove_nl(&mut self, name: &str) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.name == name) {
            e.value.retain(|c| c != '\n');
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    /// Expand a serialized meta string (`k1=v1&k2=v2`, percent escaped)
    /// into `Meta[k]` entries.
    pub fn put_meta(&mut self, string: &str) -> Result<(), MetaError> {
        for pair in string.split('&') {
            if pair.is_empty() {
                break;
            }
            let (name, value) = pair.split_once('=').ok_or(MetaError::InvalidName)?;
            if name.is_empty()
                || name.len() > 56
                || name.bytes().any(|b| ESCAPE_SET.contains(&b))
            {
                return Err(MetaError::InvalidName);
            }
            self.put(&format!("Meta[{name}]"), &percent_unescape(value));
        }
        Ok(())
    }

    /// Serialize all well-formed `Meta[...]` entries into the `k1=v1&k2=v2`
    /// wire form.  Returns None if there is no meta data at all.
    pub fn meta_to_string(&self) -> Option<String> {
        let mut out = String::new();
        for (name, value) in self.iter() {
            let Some(key) = valid_meta_key(name) else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push('&');
            }
            out.push_str(&percent_escape_meta(key));
            out.push('=');
            out.push_str(&percent_escape_meta(value));
        }
        (!out.is_empty()).then_some(out)
    }
}

impl fmt::Debug for Dict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|e| (&e.name, &e.value)))
            .finish()
    }
}

/// Return the key of a well-formed `Meta[key]` name, i.e. a non-empty key
/// free of `=`, `&`, space and tab, with nothing after the bracket.
fn valid_meta_key(name: &str) -> Option<&str> {
    let key = name.strip_prefix("Meta[")?.strip_suffix(']')?;
    if key.is_empty() || key.bytes().any(|b| b"=& \t]".contains(&b)) {
        return None;
    }
    Some(key)
}

// --- Percent escaping --- //

fn escape_with(s: &str, set: &[u8]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii() && set.contains(&(c as u8)) {
            out.push_str(&format!("%{:02X}", c as u8));
        } else {
            out.push(c);
        }
    }
    out
}

/// Escape `:`, `&`, `%`, CR and LF as `%HH` so that a string can be
/// embedded in a colon delimited journal field.
pub fn percent_escape(s: &str) -> String {
    escape_with(s, ESCAPE_SET)
}

/// Like [`percent_escape`] but additionally escapes `=`, space and tab for
/// use inside meta `k=v` pairs.
pub fn percent_escape_meta(s: &str) -> String {
    escape_with(s, META_ESCAPE_SET)
}

/// Reverse of [`percent_escape`].  Invalid escape sequences are kept
/// verbatim.
pub fn percent_unescape(s: &str) -> String {
    unescape(s, false)
}

/// Unescape www-form-urlencoded data: `%HH` plus `+` for space.
pub fn percent_plus_unescape(s: &str) -> String {
    unescape(s, true)
}

fn unescape(s: &str, with_plus: bool) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' if with_plus => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse www-form-urlencoded DATA into a new dictionary.  Names must be
/// non-empty; a pair without `=` gets an empty value.
pub fn parse_www_form_urlencoded(data: &str) -> Result<Dict, MetaError> {
    let mut dict = Dict::new();
    for field in data.split('&') {
        let (name, value) = match field.split_once('=') {
            Some((n, v)) => (n, Some(v)),
            None => (field, None),
        };
        let name = percent_plus_unescape(name);
        if name.is_empty() || name.contains('\0') {
            return Err(MetaError::InvalidForm);
        }
        let value = value.map(percent_plus_unescape).unwrap_or_default();
        if value.contains('\0') {
            return Err(MetaError::InvalidForm);
        }
        dict.put(&name, &value);
    }
    Ok(dict)
}
