// Input validation utilities

use regex::Regex;
use std::sync::OnceLock;

pub const USERNAME_ERROR: &str = "Username can only contain letters, numbers, underscores, and must be between 3 and 20 characters long.";

fn username_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]{3,20}$").expect("static username regex"))
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("static markup regex"))
}

/// Letters, numbers and underscores only, 3 to 20 characters.
pub fn is_valid_username(name: &str) -> bool {
    username_regex().is_match(name)
}

/// True when the value is missing or whitespace only.
pub fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

/// Remove markup from a message before it is shown to the user.
///
/// Errors coming out of the driver, the structure installer and extension hooks can
/// carry HTML fragments; they are displayed as plain text.
pub fn strip_tags(message: &str) -> String {
    tag_regex().replace_all(message, "").trim().to_string()
}

/// Minimal email shape check: something@something.
pub fn looks_like_email(value: &str) -> bool {
    let v = value.trim();
    match v.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !v.contains(' '),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_accepts_letters_digits_underscore() {
        assert!(is_valid_username("admin1"));
        assert!(is_valid_username("the_admin"));
        assert!(is_valid_username("abc"));
        assert!(is_valid_username("a".repeat(20).as_str()));
    }

    #[test]
    fn username_rejects_bad_length_and_characters() {
        assert!(!is_valid_username("a"));
        assert!(!is_valid_username("ab"));
        assert!(!is_valid_username("a".repeat(21).as_str()));
        assert!(!is_valid_username("admin user"));
        assert!(!is_valid_username("admin-1"));
        assert!(!is_valid_username("ädmin"));
    }

    #[test]
    fn strip_tags_removes_markup() {
        assert_eq!(
            strip_tags("Table <code>GDN_User</code> could not be <b>created</b>."),
            "Table GDN_User could not be created."
        );
        assert_eq!(strip_tags("<p>\nmulti\nline</p>"), "multi\nline");
        assert_eq!(strip_tags("no markup"), "no markup");
    }

    #[test]
    fn blank_detection() {
        assert!(is_blank(""));
        assert!(is_blank("   "));
        assert!(!is_blank(" x "));
    }

    #[test]
    fn email_shape() {
        assert!(looks_like_email("admin@example.com"));
        assert!(!looks_like_email("admin"));
        assert!(!looks_like_email("@example.com"));
        assert!(!looks_like_email("ad min@example.com"));
    }
}
