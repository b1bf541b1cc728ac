//! Allow-listed functions callable from expressions

use chrono::{SecondsFormat, Utc};
use serde_json::Value as JsonValue;

use super::value::render_value;

/// Names of every function an expression may call
pub const ALLOWED_FUNCTIONS: &[&str] = &["currentTime", "extractCryptoSymbol"];

const CRYPTO_SYMBOLS: &[(&str, &str)] = &[
    ("bitcoin", "BTC"),
    ("ethereum", "ETH"),
    ("solana", "SOL"),
    ("cardano", "ADA"),
    ("dogecoin", "DOGE"),
    ("ripple", "XRP"),
    ("litecoin", "LTC"),
    ("polkadot", "DOT"),
];

pub fn is_allowed(name: &str) -> bool {
    ALLOWED_FUNCTIONS.contains(&name)
}

/// Invoke an allow-listed function. Returns `None` for unknown names.
pub fn call(name: &str, args: &[JsonValue]) -> Option<JsonValue> {
    match name {
        "currentTime" => Some(JsonValue::String(current_time())),
        "extractCryptoSymbol" => {
            let text = args.first().map(render_value).unwrap_or_default();
            Some(
                extract_crypto_symbol(&text)
                    .map(JsonValue::String)
                    .unwrap_or(JsonValue::Null),
            )
        }
        _ => None,
    }
}

pub fn current_time() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Find a cryptocurrency ticker in free text, by name or by ticker
pub fn extract_crypto_symbol(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    for (name, symbol) in CRYPTO_SYMBOLS {
        if lower.contains(name) {
            return Some((*symbol).to_string());
        }
    }
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .map(|word| word.to_ascii_uppercase())
        .find(|word| CRYPTO_SYMBOLS.iter().any(|(_, symbol)| symbol == word))
}
