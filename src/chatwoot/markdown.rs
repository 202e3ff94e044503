//! Markdown conversion between WhatsApp and Chatwoot dialects.
//!
//! WhatsApp: `*bold*`, `_italic_`, `~strike~`.
//! Chatwoot:  `**bold**`, `*italic*`, `~~strike~~`.
//!
//! The reverse direction is the tricky one: a lone `*` delimiter must not
//! match the `*` that is part of `**`. Conversion therefore runs in two
//! passes: bold pairs are replaced with a sentinel first, then single-star
//! italics, then the sentinel becomes WhatsApp bold.

use once_cell::sync::Lazy;
use regex::Regex;

static WA_BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*([^*\n]+)\*").unwrap());
static WA_ITALIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"_([^_\n]+)_").unwrap());
static WA_STRIKE: Lazy<Regex> = Lazy::new(|| Regex::new(r"~([^~\n]+)~").unwrap());

static CW_BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*([^*\n]+)\*\*").unwrap());
static CW_ITALIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*([^*\n]+)\*").unwrap());
static CW_STRIKE: Lazy<Regex> = Lazy::new(|| Regex::new(r"~~([^~\n]+)~~").unwrap());

/// Placeholder for bold delimiters during the reverse two-pass. U+0001 never
/// occurs in chat text.
const BOLD_SENTINEL: char = '\u{1}';

/// Converts WhatsApp markdown to Chatwoot markdown.
pub fn whatsapp_to_chatwoot(text: &str) -> String {
    let out = WA_BOLD.replace_all(text, "**$1**");
    let out = WA_ITALIC.replace_all(&out, "*$1*");
    let out = WA_STRIKE.replace_all(&out, "~~$1~~");
    out.into_owned()
}

/// Converts Chatwoot markdown back to WhatsApp markdown.
pub fn chatwoot_to_whatsapp(text: &str) -> String {
    let out = CW_BOLD.replace_all(text, &format!("{s}$1{s}", s = BOLD_SENTINEL));
    let out = CW_ITALIC.replace_all(&out, "_$1_");
    let out = CW_STRIKE.replace_all(&out, "~$1~");
    out.replace(BOLD_SENTINEL, "*")
}

/// Prefixes quoted text as blockquote lines before new content.
pub fn quote_block(quoted: &str, content: &str) -> String {
    let mut out = String::with_capacity(quoted.len() + content.len() + 8);
    for line in quoted.lines() {
        out.push_str("> ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out.push_str(content);
    out
}

/// Emoji+label header for media message types.
pub fn media_header(message_type: &str) -> Option<&'static str> {
    match message_type {
        "image" => Some("📷 Image"),
        "video" => Some("🎥 Video"),
        "audio" => Some("🎵 Audio"),
        "document" => Some("📄 Document"),
        "sticker" => Some("😊 Sticker"),
        "contact" => Some("👤 Contact"),
        "contacts" => Some("👥 Contacts"),
        "location" => Some("📍 Location"),
        _ => None,
    }
}

/// Detailed card for a shared contact.
pub fn format_contact(name: &str, phone: &str) -> String {
    format!(
        "📞 **Contact Shared**\n**Name:** {}\n**Phone:** {}",
        name, phone
    )
}

/// Detailed card for a shared location.
pub fn format_location(latitude: f64, longitude: f64, address: Option<&str>) -> String {
    let mut out = String::from("📍 **Location Shared**\n");
    if let Some(address) = address {
        if !address.is_empty() {
            out.push_str(&format!("**Address:** {}\n", address));
        }
    }
    out.push_str(&format!(
        "**Coordinates:** {}, {}\n**Map:** https://maps.google.com/?q={},{}",
        latitude, longitude, latitude, longitude
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whatsapp_to_chatwoot_basic() {
        assert_eq!(whatsapp_to_chatwoot("*bold*"), "**bold**");
        assert_eq!(whatsapp_to_chatwoot("_italic_"), "*italic*");
        assert_eq!(whatsapp_to_chatwoot("~strike~"), "~~strike~~");
        assert_eq!(
            whatsapp_to_chatwoot("*b* and _i_ and ~s~"),
            "**b** and *i* and ~~s~~"
        );
    }

    #[test]
    fn test_chatwoot_to_whatsapp_basic() {
        assert_eq!(chatwoot_to_whatsapp("**bold**"), "*bold*");
        assert_eq!(chatwoot_to_whatsapp("*italic*"), "_italic_");
        assert_eq!(chatwoot_to_whatsapp("~~strike~~"), "~strike~");
    }

    #[test]
    fn test_reverse_bold_not_confused_with_italic() {
        // The `*` inside `**bold**` must not become italic delimiters.
        assert_eq!(
            chatwoot_to_whatsapp("**bold** and *italic*"),
            "*bold* and _italic_"
        );
        assert_eq!(chatwoot_to_whatsapp("x **a** y *b* z"), "x *a* y _b_ z");
    }

    #[test]
    fn test_roundtrip_chatwoot_text() {
        // Chatwoot → WhatsApp → Chatwoot is the identity for balanced text.
        for text in [
            "**bold**",
            "*italic*",
            "~~strike~~",
            "**b** then *i* then ~~s~~",
            "plain text untouched",
            "multi\n**line**\n*text*",
        ] {
            let wa = chatwoot_to_whatsapp(text);
            assert_eq!(whatsapp_to_chatwoot(&wa), text, "roundtrip of {:?}", text);
        }
    }

    #[test]
    fn test_unbalanced_left_alone() {
        assert_eq!(whatsapp_to_chatwoot("5 * 3 = 15"), "5 * 3 = 15");
        assert_eq!(chatwoot_to_whatsapp("a ** b"), "a ** b");
        assert_eq!(whatsapp_to_chatwoot("snake_case"), "snake_case");
    }

    #[test]
    fn test_delimiters_do_not_span_lines() {
        assert_eq!(whatsapp_to_chatwoot("*a\nb*"), "*a\nb*");
        assert_eq!(chatwoot_to_whatsapp("**a\nb**"), "**a\nb**");
    }

    #[test]
    fn test_quote_block() {
        assert_eq!(quote_block("hello", "reply"), "> hello\n\nreply");
        assert_eq!(
            quote_block("line1\nline2", "reply"),
            "> line1\n> line2\n\nreply"
        );
    }

    #[test]
    fn test_media_headers() {
        assert_eq!(media_header("image"), Some("📷 Image"));
        assert_eq!(media_header("video"), Some("🎥 Video"));
        assert_eq!(media_header("audio"), Some("🎵 Audio"));
        assert_eq!(media_header("document"), Some("📄 Document"));
        assert_eq!(media_header("sticker"), Some("😊 Sticker"));
        assert_eq!(media_header("location"), Some("📍 Location"));
        assert_eq!(media_header("text"), None);
    }

    #[test]
    fn test_format_contact() {
        assert_eq!(
            format_contact("Maria", "+5511999999999"),
            "📞 **Contact Shared**\n**Name:** Maria\n**Phone:** +5511999999999"
        );
    }

    #[test]
    fn test_format_location_with_address() {
        let out = format_location(-23.55, -46.63, Some("Av. Paulista"));
        assert!(out.starts_with("📍 **Location Shared**\n"));
        assert!(out.contains("**Address:** Av. Paulista\n"));
        assert!(out.contains("**Coordinates:** -23.55, -46.63"));
        assert!(out.contains("**Map:** https://maps.google.com/?q=-23.55,-46.63"));
    }

    #[test]
    fn test_format_location_without_address() {
        let out = format_location(1.0, 2.0, None);
        assert!(!out.contains("**Address:**"));
        assert!(out.contains("https://maps.google.com/?q=1,2"));
    }
}
