use chrono::{DateTime, Local};
use regex::Regex;
use std::collections::HashMap;

pub const SEQUENCE_FIELD: &str = "序号";
pub const TIMESTAMP_FIELD: &str = "时间";
pub const DATE_FIELD: &str = "日期";

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Computes the file-name stem for one row from a `{field}` name template.
///
/// Row fields are substituted with case-insensitive token matching, then the
/// three synthetic fields by literal token; characters illegal in a file name
/// become `_`. A result that is empty or all underscores falls back to
/// `Document_{index+1}_{timestamp}`.
pub fn output_base_name(
    template: &str,
    row: &HashMap<String, String>,
    index: usize,
    now: &DateTime<Local>,
) -> String {
    let mut name = template.to_string();

    // sorted keys keep the substitution order deterministic
    let mut keys: Vec<&String> = row.keys().collect();
    keys.sort();
    for key in keys {
        let token = format!("{{{}}}", key);
        if let Ok(re) = Regex::new(&format!("(?i){}", regex::escape(&token))) {
            name = re
                .replace_all(&name, regex::NoExpand(row[key].as_str()))
                .into_owned();
        }
    }

    let sequence = (index + 1).to_string();
    let timestamp = now.format(TIMESTAMP_FORMAT).to_string();
    let date = now.format(DATE_FORMAT).to_string();
    name = name.replace(&format!("{{{}}}", SEQUENCE_FIELD), &sequence);
    name = name.replace(&format!("{{{}}}", TIMESTAMP_FIELD), &timestamp);
    name = name.replace(&format!("{{{}}}", DATE_FIELD), &date);

    let name: String = name
        .chars()
        .map(|c| if is_illegal_in_file_name(c) { '_' } else { c })
        .collect();

    if name.trim().is_empty() || name.chars().all(|c| c == '_') {
        format!("Document_{}_{}", index + 1, now.format("%Y%m%d%H%M%S"))
    } else {
        name
    }
}

fn is_illegal_in_file_name(c: char) -> bool {
    matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || c.is_control()
}
