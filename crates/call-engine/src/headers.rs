//! SIP header scanning over the raw header block the management channel
//! hands us in `E_UA_SESSION` events, grounded on `utils.py`'s `get_header`/
//! `get_address`/`get_user`/`indialog`. We never need a real SIP parser here
//! - just enough regex matching to pull a user part and a `tag=` parameter
//! off a `To`/`From` line.

use regex::Regex;
use std::sync::OnceLock;

const COMPACT_FORMS: &[(&str, &str)] = &[
    ("From", "f"),
    ("To", "t"),
    ("Call-ID", "i"),
    ("Contact", "m"),
    ("Via", "v"),
    ("CSeq", "c"),
    ("Content-Length", "l"),
    ("Supported", "k"),
];

fn compact_form(header: &str) -> Option<&'static str> {
    COMPACT_FORMS.iter().find(|(long, _)| *long == header).map(|(_, short)| *short)
}

/// Returns the value portion of the first header line matching `header`
/// (long or compact form), case-insensitively.
pub fn get_header(headers: &str, header: &str) -> Option<String> {
    let compact = compact_form(header);
    headers.lines().find_map(|line| {
        let (name, rest) = line.split_once(':')?;
        let name = name.trim();
        if name.eq_ignore_ascii_case(header) || compact.is_some_and(|c| name.eq_ignore_ascii_case(c))
        {
            Some(rest.trim().to_string())
        } else {
            None
        }
    })
}

fn user_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"sip(?:s)?:([^@;:>\s]+)").unwrap())
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r";tag=([^;>\s]+)").unwrap())
}

/// Extracts the SIP URI's user part from a header line such as
/// `"Bot" <sip:sales@example.com>;tag=abc`.
pub fn get_user(headers: &str, header: &str) -> Option<String> {
    let line = get_header(headers, header)?;
    user_regex().captures(&line).map(|c| c[1].to_ascii_lowercase())
}

/// Extracts the SIP URI's host part from the same header line.
pub fn get_domain(headers: &str, header: &str) -> Option<String> {
    let line = get_header(headers, header)?;
    let captures = Regex::new(r"sip(?:s)?:[^@]+@([^;:>\s]+)").unwrap().captures(&line)?;
    Some(captures[1].to_ascii_lowercase())
}

/// An in-dialog request carries a `tag=` parameter on its `To` header
/// (the dialog already exists); an initial INVITE does not.
pub fn in_dialog(headers: &str) -> bool {
    let Some(to_line) = get_header(headers, "To") else { return false };
    tag_regex().is_match(&to_line)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADERS: &str = "From: \"Caller\" <sip:alice@192.0.2.1>;tag=111\r\n\
To: \"Bot\" <sip:sales@example.com>\r\n\
Call-ID: abc123\r\n";

    #[test]
    fn reads_long_form_header() {
        assert_eq!(get_header(HEADERS, "Call-ID").as_deref(), Some("abc123"));
    }

    #[test]
    fn reads_compact_form_header() {
        let headers = "t: <sip:sales@example.com>\r\n";
        assert_eq!(get_header(headers, "To").as_deref(), Some("<sip:sales@example.com>"));
    }

    #[test]
    fn extracts_user_and_domain() {
        assert_eq!(get_user(HEADERS, "To").as_deref(), Some("sales"));
        assert_eq!(get_domain(HEADERS, "To").as_deref(), Some("example.com"));
    }

    #[test]
    fn initial_invite_is_not_in_dialog() {
        assert!(!in_dialog(HEADERS));
    }

    #[test]
    fn re_invite_carries_a_to_tag() {
        let headers = "To: <sip:sales@example.com>;tag=999\r\n";
        assert!(in_dialog(headers));
    }
}
