//! Auxiliary field extraction from Chinese resident identity numbers.
//!
//! Derived fields are added to a row before rendering when extraction is
//! enabled; any failure simply yields no fields, never a row failure.

use chrono::{Datelike, Local, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

pub const GENDER_FIELD: &str = "身份证性别";
pub const BIRTH_DATE_FIELD: &str = "身份证出生日期";
pub const AGE_FIELD: &str = "身份证年龄";

static ID18_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{17}[\dXx]$").unwrap());
static ID15_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{15}$").unwrap());

/// `男` for odd sequence digits, `女` for even; `None` when the number is
/// not a well-formed ID.
pub fn extract_gender(id: &str) -> Option<&'static str> {
    let id = id.trim();
    let digit = if ID18_RE.is_match(id) {
        id.as_bytes()[16] - b'0'
    } else if ID15_RE.is_match(id) {
        id.as_bytes()[14] - b'0'
    } else {
        return None;
    };
    Some(if digit % 2 == 1 { "男" } else { "女" })
}

pub fn extract_birth_date(id: &str) -> Option<NaiveDate> {
    let id = id.trim();
    let (year, month, day) = if ID18_RE.is_match(id) {
        (
            id[6..10].parse().ok()?,
            id[10..12].parse().ok()?,
            id[12..14].parse().ok()?,
        )
    } else if ID15_RE.is_match(id) {
        // 15-digit numbers encode a two-digit 19xx year
        (
            1900 + id[6..8].parse::<i32>().ok()?,
            id[8..10].parse().ok()?,
            id[10..12].parse().ok()?,
        )
    } else {
        return None;
    };
    NaiveDate::from_ymd_opt(year, month, day)
}

pub fn extract_age(id: &str) -> Option<u32> {
    age_on(extract_birth_date(id)?, Local::now().date_naive())
}

fn age_on(birth: NaiveDate, today: NaiveDate) -> Option<u32> {
    if birth > today {
        return None;
    }
    let mut age = today.year() - birth.year();
    if (today.month(), today.day()) < (birth.month(), birth.day()) {
        age -= 1;
    }
    u32::try_from(age).ok()
}

/// Adds every derivable field to `row`; silently adds nothing when the value
/// is not a parsable ID number.
pub fn extract_fields(id: &str, row: &mut HashMap<String, String>) {
    if let Some(gender) = extract_gender(id) {
        row.insert(GENDER_FIELD.to_string(), gender.to_string());
    }
    if let Some(date) = extract_birth_date(id) {
        row.insert(
            BIRTH_DATE_FIELD.to_string(),
            date.format("%Y-%m-%d").to_string(),
        );
    }
    if let Some(age) = extract_age(id) {
        row.insert(AGE_FIELD.to_string(), age.to_string());
    }
}
