/// Suffix WAHA expects on individual (non-group) chat ids.
pub const WHATSAPP_USER_SUFFIX: &str = "@c.us";

/// Converts a stored phone number into a WhatsApp chat id.
///
/// Ids that already carry `suffix` pass through untouched, so the result can be
/// fed back in without change. Anything else is reduced to its digits before
/// the suffix is appended, which drops `+`, spaces, dashes and parentheses.
pub fn to_chat_id(recipient: &str, suffix: &str) -> String {
    if recipient.ends_with(suffix) {
        return recipient.to_string();
    }
    let digits: String = recipient.chars().filter(|c| c.is_ascii_digit()).collect();
    format!("{digits}{suffix}")
}
