use chrono::{DateTime, NaiveDate};

/// Format a phone number for display.
/// Handles Brazilian numbers with or without the +55 country code and with
/// 8 or 9 digit subscriber numbers.
pub fn format_phone(phone: &str) -> String {
    // Extract just the digits
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();

    match digits.len() {
        12 | 13 if digits.starts_with("55") => format!("+55 {}", format_national(&digits[2..])),
        10 | 11 => format_national(&digits),
        _ => phone.to_string(), // Return original if can't format
    }
}

/// `(AA) NNNN-NNNN` or `(AA) NNNNN-NNNN`
fn format_national(digits: &str) -> String {
    let split = digits.len() - 4;
    format!("({}) {}-{}", &digits[0..2], &digits[2..split], &digits[split..])
}

/// Truncate a string to a maximum number of characters, adding ellipsis if needed
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        s.chars().take(max_len).collect()
    } else {
        let truncated: String = s.chars().take(max_len - 3).collect();
        format!("{}...", truncated)
    }
}

/// Format a backend timestamp as `dd/mm/yyyy HH:MM`, in the timestamp's own offset
pub fn format_date(date: &str) -> String {
    if let Ok(dt) = DateTime::parse_from_rfc3339(date) {
        dt.format("%d/%m/%Y %H:%M").to_string()
    } else if let Ok(day) = NaiveDate::parse_from_str(date.get(..10).unwrap_or(date), "%Y-%m-%d") {
        day.format("%d/%m/%Y").to_string()
    } else {
        date.to_string()
    }
}
