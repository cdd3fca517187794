//! Port range encoding: `3000-3005` <-> `[3000, 3001, ..., 3005]`.

use crate::error::{DepotError, Result};

/// 解析单个端口或 `a-b` 形式的端口范围
pub fn expand(text: &str) -> Result<Vec<u16>> {
    let text = text.trim();
    match text.split_once('-') {
        None => Ok(vec![parse_port(text)?]),
        Some((start, end)) => {
            let start = parse_port(start)?;
            let end = parse_port(end)?;
            if start > end {
                return Err(DepotError::format(format!(
                    "Invalid range '{}': start is greater than end",
                    text
                )));
            }
            Ok((start..=end).collect())
        }
    }
}

/// 将端口列表压缩为范围字符串
///
/// 输入先排序去重；少于 3 个值时原样返回，不尝试合并。
pub fn compress(values: &[u16]) -> Vec<String> {
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    if sorted.len() < 3 {
        return sorted.iter().map(u16::to_string).collect();
    }

    let mut out = Vec::new();
    let mut start = sorted[0];
    let mut prev = sorted[0];
    for &value in &sorted[1..] {
        if u32::from(value) != u32::from(prev) + 1 {
            out.push(format_run(start, prev));
            start = value;
        }
        prev = value;
    }
    out.push(format_run(start, prev));
    out
}

fn format_run(start: u16, end: u16) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}-{}", start, end)
    }
}

fn parse_port(token: &str) -> Result<u16> {
    let token = token.trim();
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DepotError::format(format!("Invalid port '{}'", token)));
    }
    token
        .parse::<u16>()
        .map_err(|_| DepotError::format(format!("Port '{}' out of range", token)))
}
