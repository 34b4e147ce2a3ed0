//! Multi-valued metadata tag collection.
//!
//! A [`TagList`] maps tag names to ordered value lists. Besides merging it
//! supports diffing against a reference list ([`calculate_new_tags`]), which
//! the controller uses to report only tags that actually changed.
//!
//! The text form mirrors the usual structure notation:
//! `taglist, title=(string)"A", genre={ (string)"Rock", (string)"Pop" };`

use std::collections::BTreeMap;
use std::fmt;

pub const TAG_TITLE: &str = "title";
pub const TAG_ARTIST: &str = "artist";
pub const TAG_ALBUM: &str = "album";
pub const TAG_GENRE: &str = "genre";
pub const TAG_TRACK_NUMBER: &str = "track-number";
pub const TAG_DATE: &str = "date";
pub const TAG_BITRATE: &str = "bitrate";
pub const TAG_NOMINAL_BITRATE: &str = "nominal-bitrate";
pub const TAG_MINIMUM_BITRATE: &str = "minimum-bitrate";
pub const TAG_MAXIMUM_BITRATE: &str = "maximum-bitrate";

/// A single tag value.
#[derive(Clone, Debug, PartialEq)]
pub enum TagValue {
    String(String),
    UInt(u64),
    Int(i64),
    Double(f64),
    Boolean(bool),
}

impl TagValue {
    fn type_name(&self) -> &'static str {
        match self {
            TagValue::String(_) => "string",
            TagValue::UInt(_) => "uint",
            TagValue::Int(_) => "int",
            TagValue::Double(_) => "double",
            TagValue::Boolean(_) => "boolean",
        }
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::String(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::String(value)
    }
}

impl From<u64> for TagValue {
    fn from(value: u64) -> Self {
        TagValue::UInt(value)
    }
}

impl From<u32> for TagValue {
    fn from(value: u32) -> Self {
        TagValue::UInt(u64::from(value))
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::Int(value)
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        TagValue::Double(value)
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Boolean(value)
    }
}

/// How values of an incoming list combine with existing ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeMode {
    /// Drop everything and take the incoming list.
    ReplaceAll,
    /// Incoming values replace existing values of the same tag.
    Replace,
    /// Incoming values are added after existing ones.
    Append,
    /// Incoming values are added before existing ones.
    Prepend,
    /// Existing tags win; only missing tags are taken over.
    Keep,
    /// Nothing changes.
    KeepAll,
}

/// Ordered map of tag name to values. Tags never hold an empty value list.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TagList {
    tags: BTreeMap<String, Vec<TagValue>>,
}

impl TagList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Number of distinct tag names.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tags.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[TagValue])> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn add_value(&mut self, name: &str, value: impl Into<TagValue>, mode: MergeMode) {
        if name.is_empty() {
            return;
        }
        let value = value.into();
        match mode {
            MergeMode::ReplaceAll | MergeMode::Replace => {
                self.tags.insert(name.to_string(), vec![value]);
            }
            MergeMode::Append => self.tags.entry(name.to_string()).or_default().push(value),
            MergeMode::Prepend => self.tags.entry(name.to_string()).or_default().insert(0, value),
            MergeMode::Keep | MergeMode::KeepAll => {
                self.tags.entry(name.to_string()).or_insert_with(|| vec![value]);
            }
        }
    }

    /// Merge `other` into this list.
    pub fn insert(&mut self, other: &TagList, mode: MergeMode) {
        match mode {
            MergeMode::ReplaceAll => self.tags = other.tags.clone(),
            MergeMode::Replace => {
                for (name, values) in &other.tags {
                    self.tags.insert(name.clone(), values.clone());
                }
            }
            MergeMode::Append => {
                for (name, values) in &other.tags {
                    self.tags
                        .entry(name.clone())
                        .or_default()
                        .extend(values.iter().cloned());
                }
            }
            MergeMode::Prepend => {
                for (name, values) in &other.tags {
                    let slot = self.tags.entry(name.clone()).or_default();
                    let mut merged = values.clone();
                    merged.append(slot);
                    *slot = merged;
                }
            }
            MergeMode::Keep => {
                for (name, values) in &other.tags {
                    self.tags
                        .entry(name.clone())
                        .or_insert_with(|| values.clone());
                }
            }
            MergeMode::KeepAll => {}
        }
    }

    pub fn remove_tag(&mut self, name: &str) -> Option<Vec<TagValue>> {
        self.tags.remove(name)
    }

    pub fn has_value(&self, name: &str) -> bool {
        self.tags.contains_key(name)
    }

    pub fn num_values(&self, name: &str) -> usize {
        self.tags.get(name).map_or(0, Vec::len)
    }

    pub fn values(&self, name: &str) -> &[TagValue] {
        self.tags.get(name).map_or(&[], Vec::as_slice)
    }

    pub fn value(&self, name: &str, index: usize) -> Option<&TagValue> {
        self.tags.get(name).and_then(|v| v.get(index))
    }

    pub fn string(&self, name: &str, index: usize) -> Option<&str> {
        match self.value(name, index)? {
            TagValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn uint(&self, name: &str, index: usize) -> Option<u64> {
        match self.value(name, index)? {
            TagValue::UInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn int(&self, name: &str, index: usize) -> Option<i64> {
        match self.value(name, index)? {
            TagValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn double(&self, name: &str, index: usize) -> Option<f64> {
        match self.value(name, index)? {
            TagValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn boolean(&self, name: &str, index: usize) -> Option<bool> {
        match self.value(name, index)? {
            TagValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// Parse the text form. Malformed input yields an empty list.
    pub fn from_string(text: &str) -> TagList {
        match Parser::new(text).parse() {
            Some(list) => list,
            None => {
                tracing::debug!(text, "could not parse tag list");
                TagList::default()
            }
        }
    }
}

/// Tags of `other` that are new relative to `reference`.
///
/// A tag counts as new if `reference` lacks it, holds a different number of
/// values for it, or holds at least one different value at the same index.
pub fn calculate_new_tags(reference: &TagList, other: &TagList) -> TagList {
    let mut result = TagList::default();
    for (name, values) in &other.tags {
        if let Some(ref_values) = reference.tags.get(name) {
            if ref_values == values {
                continue;
            }
        }
        result.tags.insert(name.clone(), values.clone());
    }
    result
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.type_name())?;
        match self {
            TagValue::String(s) => {
                f.write_str("\"")?;
                for c in s.chars() {
                    if c == '"' || c == '\\' {
                        f.write_str("\\")?;
                    }
                    write!(f, "{c}")?;
                }
                f.write_str("\"")
            }
            TagValue::UInt(v) => write!(f, "{v}"),
            TagValue::Int(v) => write!(f, "{v}"),
            TagValue::Double(v) => write!(f, "{v:?}"),
            TagValue::Boolean(v) => write!(f, "{v}"),
        }
    }
}

impl fmt::Display for TagList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("taglist")?;
        for (name, values) in &self.tags {
            write!(f, ", {name}=")?;
            if let [single] = values.as_slice() {
                write!(f, "{single}")?;
            } else {
                f.write_str("{ ")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str(" }")?;
            }
        }
        f.write_str(";")
    }
}

struct Parser<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().peekable(),
        }
    }

    fn parse(mut self) -> Option<TagList> {
        self.skip_ws();
        let header = self.word();
        if header != "taglist" {
            return None;
        }
        let mut list = TagList::default();
        loop {
            self.skip_ws();
            match self.chars.next() {
                None | Some(';') => break,
                Some(',') => {}
                Some(_) => return None,
            }
            self.skip_ws();
            let name = self.word();
            if name.is_empty() {
                return None;
            }
            self.skip_ws();
            if self.chars.next() != Some('=') {
                return None;
            }
            self.skip_ws();
            if self.chars.peek() == Some(&'{') {
                self.chars.next();
                loop {
                    self.skip_ws();
                    let value = self.value()?;
                    list.add_value(&name, value, MergeMode::Append);
                    self.skip_ws();
                    match self.chars.next() {
                        Some(',') => continue,
                        Some('}') => break,
                        _ => return None,
                    }
                }
            } else {
                let value = self.value()?;
                list.add_value(&name, value, MergeMode::Append);
            }
        }
        self.skip_ws();
        if self.chars.next().is_some() {
            return None;
        }
        Some(list)
    }

    fn skip_ws(&mut self) {
        while self.chars.peek().is_some_and(|c| c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn word(&mut self) -> String {
        let mut out = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | ':' | '.' | '+') {
                out.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        out
    }

    fn value(&mut self) -> Option<TagValue> {
        let type_name = if self.chars.peek() == Some(&'(') {
            self.chars.next();
            let t = self.word();
            if self.chars.next() != Some(')') {
                return None;
            }
            self.skip_ws();
            Some(t)
        } else {
            None
        };

        if self.chars.peek() == Some(&'"') {
            self.chars.next();
            let mut s = String::new();
            loop {
                match self.chars.next()? {
                    '\\' => s.push(self.chars.next()?),
                    '"' => break,
                    c => s.push(c),
                }
            }
            return match type_name.as_deref() {
                None | Some("string") => Some(TagValue::String(s)),
                _ => None,
            };
        }

        let raw = self.word();
        if raw.is_empty() {
            return None;
        }
        match type_name.as_deref() {
            Some("string") => Some(TagValue::String(raw)),
            Some("uint") => raw.parse().ok().map(TagValue::UInt),
            Some("int") => raw.parse().ok().map(TagValue::Int),
            Some("double") => raw.parse().ok().map(TagValue::Double),
            Some("boolean") => parse_bool(&raw).map(TagValue::Boolean),
            Some(_) => None,
            None => Some(infer_value(raw)),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn infer_value(raw: String) -> TagValue {
    if let Ok(v) = raw.parse::<u64>() {
        TagValue::UInt(v)
    } else if let Ok(v) = raw.parse::<i64>() {
        TagValue::Int(v)
    } else if let Ok(v) = raw.parse::<f64>() {
        TagValue::Double(v)
    } else if let Some(b) = parse_bool(&raw) {
        TagValue::Boolean(b)
    } else {
        TagValue::String(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(pairs: &[(&str, &str)]) -> TagList {
        let mut l = TagList::new();
        for (k, v) in pairs {
            l.add_value(k, *v, MergeMode::Append);
        }
        l
    }

    #[test]
    fn new_tags_only_reports_additions() {
        let reference = list(&[(TAG_TITLE, "A")]);
        let other = list(&[(TAG_TITLE, "A"), (TAG_ARTIST, "B")]);
        let diff = calculate_new_tags(&reference, &other);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff.string(TAG_ARTIST, 0), Some("B"));
        assert!(!diff.has_value(TAG_TITLE));
    }

    #[test]
    fn new_tags_detects_changed_values_and_counts() {
        let reference = list(&[(TAG_TITLE, "A"), (TAG_GENRE, "Rock")]);
        let other = list(&[(TAG_TITLE, "B"), (TAG_GENRE, "Rock"), (TAG_GENRE, "Pop")]);
        let diff = calculate_new_tags(&reference, &other);
        assert_eq!(diff.string(TAG_TITLE, 0), Some("B"));
        assert_eq!(diff.num_values(TAG_GENRE), 2);
    }

    #[test]
    fn new_tags_against_empty_other_is_empty() {
        let reference = list(&[(TAG_TITLE, "A")]);
        assert!(calculate_new_tags(&reference, &TagList::new()).is_empty());
    }

    #[test]
    fn merge_modes() {
        let base = list(&[(TAG_TITLE, "A"), (TAG_ALBUM, "X")]);
        let incoming = list(&[(TAG_TITLE, "B"), (TAG_ARTIST, "C")]);

        let mut replace = base.clone();
        replace.insert(&incoming, MergeMode::Replace);
        assert_eq!(replace.values(TAG_TITLE), &[TagValue::from("B")]);
        assert!(replace.has_value(TAG_ALBUM));

        let mut replace_all = base.clone();
        replace_all.insert(&incoming, MergeMode::ReplaceAll);
        assert!(!replace_all.has_value(TAG_ALBUM));

        let mut append = base.clone();
        append.insert(&incoming, MergeMode::Append);
        assert_eq!(append.values(TAG_TITLE), &[TagValue::from("A"), TagValue::from("B")]);

        let mut prepend = base.clone();
        prepend.insert(&incoming, MergeMode::Prepend);
        assert_eq!(prepend.values(TAG_TITLE), &[TagValue::from("B"), TagValue::from("A")]);

        let mut keep = base.clone();
        keep.insert(&incoming, MergeMode::Keep);
        assert_eq!(keep.string(TAG_TITLE, 0), Some("A"));
        assert_eq!(keep.string(TAG_ARTIST, 0), Some("C"));

        let mut keep_all = base.clone();
        keep_all.insert(&incoming, MergeMode::KeepAll);
        assert_eq!(keep_all, base);
    }

    #[test]
    fn text_form_round_trips_mixed_types() {
        let mut l = TagList::new();
        l.add_value(TAG_TITLE, "Say \"hi\"", MergeMode::Append);
        l.add_value(TAG_BITRATE, 128_000u32, MergeMode::Append);
        l.add_value(TAG_GENRE, "Rock", MergeMode::Append);
        l.add_value(TAG_GENRE, "Pop", MergeMode::Append);
        l.add_value("replaygain-track-gain", -3.5f64, MergeMode::Append);
        l.add_value("compilation", true, MergeMode::Append);

        let text = l.to_string();
        assert!(text.starts_with("taglist, "));
        assert!(text.contains("bitrate=(uint)128000"));
        assert!(text.contains("genre={ (string)\"Rock\", (string)\"Pop\" }"));
        assert_eq!(TagList::from_string(&text), l);
    }

    #[test]
    fn empty_list_text() {
        assert_eq!(TagList::new().to_string(), "taglist;");
        assert!(TagList::from_string("taglist;").is_empty());
    }

    #[test]
    fn malformed_text_yields_empty_list() {
        assert!(TagList::from_string("tags, title=(string)\"A\";").is_empty());
        assert!(TagList::from_string("taglist, title=(string)\"A").is_empty());
        assert!(TagList::from_string("taglist, bitrate=(uint)abc;").is_empty());
    }

    #[test]
    fn untyped_values_are_inferred() {
        let l = TagList::from_string("taglist, track-number=3, title=\"A\", gain=-1.5;");
        assert_eq!(l.uint(TAG_TRACK_NUMBER, 0), Some(3));
        assert_eq!(l.string(TAG_TITLE, 0), Some("A"));
        assert_eq!(l.double("gain", 0), Some(-1.5));
    }

    #[test]
    fn typed_accessors_reject_other_types() {
        let l = list(&[(TAG_TITLE, "A")]);
        assert!(l.uint(TAG_TITLE, 0).is_none());
        assert!(l.string(TAG_TITLE, 1).is_none());
        assert!(l.value(TAG_ARTIST, 0).is_none());
        assert_eq!(l.num_values(TAG_ARTIST), 0);
    }
}
