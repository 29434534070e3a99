//! Command-line parsing: verb extraction, `MAIL FROM`/`RCPT TO` address
//! extraction, and the base64 decoding used by `AUTH`.

use base64::Engine;

/// The SMTP verbs this session understands. `Unknown` carries no payload —
/// the caller still has the raw line for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandVerb {
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    Bdat,
    Rset,
    Noop,
    Vrfy,
    Expn,
    Help,
    Auth,
    Starttls,
    Quit,
    Unknown,
}

/// Splits a command line into its verb and the remainder of the line
/// (trimmed of leading whitespace). The verb match is case-insensitive per
/// RFC 5321 §2.4.
pub fn split_verb(line: &str) -> (CommandVerb, &str) {
    let trimmed = line.trim_start();
    let (word, rest) = match trimmed.find(char::is_whitespace) {
        Some(i) => (&trimmed[..i], trimmed[i..].trim_start()),
        None => (trimmed, ""),
    };
    let verb = match word.to_ascii_uppercase().as_str() {
        "HELO" => CommandVerb::Helo,
        "EHLO" => CommandVerb::Ehlo,
        "MAIL" => CommandVerb::Mail,
        "RCPT" => CommandVerb::Rcpt,
        "DATA" => CommandVerb::Data,
        "BDAT" => CommandVerb::Bdat,
        "RSET" => CommandVerb::Rset,
        "NOOP" => CommandVerb::Noop,
        "VRFY" => CommandVerb::Vrfy,
        "EXPN" => CommandVerb::Expn,
        "HELP" => CommandVerb::Help,
        "AUTH" => CommandVerb::Auth,
        "STARTTLS" => CommandVerb::Starttls,
        "QUIT" => CommandVerb::Quit,
        _ => CommandVerb::Unknown,
    };
    (verb, rest)
}

/// Extracts the address between the first `<` and `>` in a `MAIL FROM:`/
/// `RCPT TO:` parameter string. Returns `None` if the brackets are absent or
/// out of order — the null reverse-path `<>` still yields `Some("")`.
pub fn extract_address(params: &str) -> Option<String> {
    let start = params.find('<')?;
    let end = params.find('>')?;
    if start >= end {
        return None;
    }
    Some(params[start + 1..end].to_string())
}

/// Decodes an `AUTH PLAIN` response: base64 of
/// `[authzid] NUL authcid NUL password`.
pub fn decode_plain(encoded: &str) -> Option<(Option<String>, String, String)> {
    let raw = decode_base64_bytes(encoded)?;
    let mut parts = raw.split(|&b| b == 0);
    let authzid = parts.next()?;
    let authcid = parts.next()?;
    let password = parts.next()?;

    let authzid = std::str::from_utf8(authzid).ok()?.to_string();
    let authcid = std::str::from_utf8(authcid).ok()?.to_string();
    let password = std::str::from_utf8(password).ok()?.to_string();

    let authzid = if authzid.is_empty() { None } else { Some(authzid) };
    Some((authzid, authcid, password))
}

/// Decodes a single base64-encoded `AUTH LOGIN` challenge response.
pub fn decode_base64(encoded: &str) -> Option<String> {
    let bytes = decode_base64_bytes(encoded)?;
    String::from_utf8(bytes).ok()
}

fn decode_base64_bytes(encoded: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()
}
