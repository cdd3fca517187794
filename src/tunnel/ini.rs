//! Minimal INI reader/writer that keeps section and option order.

use crate::error::{DepotError, Result};
use std::fmt;

/// 一个 INI 段落
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub comments: Vec<String>,
    options: Vec<(String, String)>,
}

impl Section {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// 读取选项（重复的键以最后一次出现为准）
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// 设置选项，已存在则覆盖，否则追加
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.options.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.options.push((key, value)),
        }
    }

    /// 追加选项，不检查重复
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.options.push((key.into(), value.into()));
    }

    pub fn options(&self) -> impl Iterator<Item = (&str, &str)> {
        self.options.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}

/// 解析后的 INI 文件
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniFile {
    sections: Vec<Section>,
}

impl IniFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析 INI 文本
    pub fn parse(text: &str) -> Result<Self> {
        let mut file = IniFile::new();
        let mut current: Option<Section> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('#') || line.starts_with(';') {
                let comment = line.trim_start_matches([';', '#', ' ']).to_string();
                if let Some(section) = current.as_mut() {
                    section.comments.push(comment);
                }
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') && line.len() > 2 {
                if let Some(done) = current.take() {
                    file.add_section(done)?;
                }
                current = Some(Section::new(line[1..line.len() - 1].trim()));
                continue;
            }

            let section = current.as_mut().ok_or_else(|| {
                DepotError::format(format!("line {}: option outside of any section", idx + 1))
            })?;

            let (key, value) = line.split_once('=').ok_or_else(|| {
                DepotError::format(format!("line {}: malformed line '{}'", idx + 1, line))
            })?;
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() || key.contains(char::is_whitespace) {
                return Err(DepotError::format(format!(
                    "line {}: malformed option name '{}'",
                    idx + 1,
                    key
                )));
            }
            if value.is_empty() {
                continue;
            }
            section.push(key, unquote(value));
        }

        if let Some(done) = current.take() {
            file.add_section(done)?;
        }
        Ok(file)
    }

    fn add_section(&mut self, section: Section) -> Result<()> {
        if self.section(&section.name).is_some() {
            return Err(DepotError::format(format!(
                "duplicate section [{}]",
                section.name
            )));
        }
        self.sections.push(section);
        Ok(())
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter()
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// 获取段落，不存在时追加一个新段落
    pub fn section_mut(&mut self, name: &str) -> &mut Section {
        let pos = match self.sections.iter().position(|s| s.name == name) {
            Some(pos) => pos,
            None => {
                self.sections.push(Section::new(name));
                self.sections.len() - 1
            }
        };
        &mut self.sections[pos]
    }

    pub fn into_sections(self) -> Vec<Section> {
        self.sections
    }
}

impl fmt::Display for IniFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for section in &self.sections {
            writeln!(f, "[{}]", section.name)?;
            for comment in &section.comments {
                writeln!(f, "; {}", comment)?;
            }
            for (key, value) in section.options() {
                if value.is_empty() {
                    continue;
                }
                writeln!(f, "{} = {}", key, quote(value))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

fn needs_quotes(value: &str) -> bool {
    value.starts_with(' ')
        || value.ends_with(' ')
        || value.starts_with('"')
        || value.contains('\n')
        || value.contains('\\')
}

fn quote(value: &str) -> String {
    if !needs_quotes(value) {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

fn unquote(value: &str) -> String {
    let quoted = value.len() >= 2 && value.starts_with('"') && value.ends_with('"');
    if !quoted {
        return value.to_string();
    }

    let inner = &value[1..value.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sections_in_order() {
        let text = "[general]\nversion = 3\n; note\n[hosts.a]\naddr=10.0.0.1\nuser = root\n";
        let ini = IniFile::parse(text).unwrap();
        let names: Vec<&str> = ini.sections().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["general", "hosts.a"]);
        assert_eq!(ini.section("hosts.a").unwrap().get("addr"), Some("10.0.0.1"));
        assert_eq!(ini.section("general").unwrap().comments, vec!["note"]);
    }

    #[test]
    fn test_quoted_values_with_newlines() {
        let mut ini = IniFile::new();
        ini.section_mut("hosts.a").set("key", "line one\nline \"two\"");
        let text = ini.to_string();
        assert!(text.contains("key = \"line one\\nline \\\"two\\\"\""));

        let parsed = IniFile::parse(&text).unwrap();
        assert_eq!(
            parsed.section("hosts.a").unwrap().get("key"),
            Some("line one\nline \"two\"")
        );
    }

    #[test]
    fn test_backslashes_survive_round_trip() {
        let mut ini = IniFile::new();
        ini.section_mut("general").set("description", "C:\\new files");
        ini.section_mut("general").set("note", "literal \\n and \\\\ stay");
        let text = ini.to_string();
        assert!(text.contains("description = \"C:\\\\new files\""));

        let parsed = IniFile::parse(&text).unwrap();
        let general = parsed.section("general").unwrap();
        assert_eq!(general.get("description"), Some("C:\\new files"));
        assert_eq!(general.get("note"), Some("literal \\n and \\\\ stay"));
    }

    #[test]
    fn test_unquoted_backslash_is_literal() {
        let parsed = IniFile::parse("[general]\ndescription = C:\\new files\n").unwrap();
        assert_eq!(
            parsed.section("general").unwrap().get("description"),
            Some("C:\\new files")
        );
    }

    #[test]
    fn test_rejects_option_before_section() {
        assert!(IniFile::parse("a = b\n").unwrap_err().is_format());
    }

    #[test]
    fn test_rejects_duplicate_section() {
        let err = IniFile::parse("[general]\n[general]\n").unwrap_err();
        assert!(err.to_string().contains("duplicate section"));
    }

    #[test]
    fn test_rejects_garbage_line() {
        assert!(IniFile::parse("[general]\nnot an option\n").is_err());
    }
}
