use crate::error::PayloadError;

/// Parses a hex payload such as `"01 ff"` or `"0x01FF"`. Whitespace is ignored; odd-length or
/// non-hex input is rejected as a whole.
pub fn decode_hex(text: &str) -> Result<Vec<u8>, PayloadError> {
    let text = text.trim();
    let text = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")).unwrap_or(text);
    let digits: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();

    if digits.is_empty() {
        return Err(PayloadError::Empty);
    }

    Ok(hex::decode(digits)?)
}

pub fn encode_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}
