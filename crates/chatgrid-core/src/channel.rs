//! Channel name handling.
//!
//! Channels are lowercase, `#`-prefixed strings everywhere inside the
//! cluster. Sanitization is idempotent, so records merged from several
//! sources can be sanitized again without changing.

/// Normalize a channel name: lowercase, `#`-prefixed.
///
/// Idempotent: `sanitize(sanitize(c)) == sanitize(c)`.
pub fn sanitize(channel: &str) -> String {
    let channel = channel.trim();
    if channel.starts_with('#') {
        channel.to_lowercase()
    } else {
        format!("#{}", channel.to_lowercase())
    }
}

/// The bare login behind a channel name: `#` stripped, lowercase.
///
/// Used to key dedicated-client registrations, which store logins
/// rather than channel names.
pub fn channel_login(channel: &str) -> String {
    channel.replace('#', "").to_lowercase()
}

/// Sanitize a list of channels, dropping empties and duplicates while
/// preserving first-seen order.
pub fn sanitize_all<I, T>(channels: I) -> Vec<String>
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for channel in channels {
        let channel = channel.as_ref().trim();
        if channel.is_empty() || channel == "#" {
            continue;
        }
        let channel = sanitize(channel);
        if seen.insert(channel.clone()) {
            out.push(channel);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_prefixes_and_lowercases() {
        assert_eq!(sanitize("Forsen"), "#forsen");
        assert_eq!(sanitize("#Forsen"), "#forsen");
        assert_eq!(sanitize("#already"), "#already");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for raw in ["Chan", "#Chan", "#chan", "MIXED_case"] {
            let once = sanitize(raw);
            assert_eq!(sanitize(&once), once);
        }
    }

    #[test]
    fn login_strips_hash() {
        assert_eq!(channel_login("#Forsen"), "forsen");
        assert_eq!(channel_login("forsen"), "forsen");
    }

    #[test]
    fn sanitize_all_dedupes_and_drops_empty() {
        let out = sanitize_all(["#a", "A", "", "b", "#"]);
        assert_eq!(out, vec!["#a", "#b"]);
    }
}
