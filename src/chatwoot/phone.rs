//! Phone extraction from JIDs and Brazilian number normalization.
//!
//! Brazilian mobile numbers exist in the wild with and without the extra `9`
//! prefix, so one person can appear as two Chatwoot contacts. With
//! `merge_brazil` enabled the bridge looks contacts up under both the
//! 13-digit and 14-digit E.164 variants and merges when both exist.

/// Extracts the bare digits of a phone number from a JID.
///
/// Strips the `@domain` part and any `:device` suffix; for group JIDs of the
/// `creatorphone-timestamp@g.us` shape, takes the creator phone. Returns
/// `None` when no digits remain (e.g. `status@broadcast`-style JIDs).
pub fn extract_phone(jid: &str) -> Option<String> {
    let local = jid.split('@').next()?;
    let local = local.split(':').next()?;
    let local = if jid.ends_with("@g.us") {
        local.split('-').next()?
    } else {
        local
    };
    let digits: String = local.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// E.164 lookup variants for a bare digit string.
///
/// Without Brazil handling (or for non-`55` numbers) this is just `+digits`.
/// For Brazilian numbers:
/// - a 10-digit national number gets the mobile `9` inserted after the
///   2-digit area code;
/// - an 11-digit national number yields both the 13-digit form and the
///   14-digit form (area code followed by an extra `9`).
///
/// The first element is the canonical form used when creating contacts.
pub fn lookup_variants(digits: &str, merge_brazil: bool) -> Vec<String> {
    if !merge_brazil || !digits.starts_with("55") {
        return vec![format!("+{}", digits)];
    }

    let mut national = digits[2..].to_string();
    if national.len() == 10 {
        national.insert(2, '9');
    }
    if national.len() != 11 {
        return vec![format!("+55{}", national)];
    }

    let area = &national[..2];
    let subscriber = &national[2..];
    vec![
        format!("+55{}{}", area, subscriber),
        format!("+55{}9{}", area, subscriber),
    ]
}
