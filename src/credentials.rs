// =============================================================================
// Credential file parsing
// =============================================================================
//
// Credentials are deliberately kept out of `ExecutionConfig` (which is
// checked into version control and hot-reloaded) and instead parsed from a
// line-oriented text file, one venue's material per section. The format
// favors copy-paste from exchange dashboards over a strict schema:
//
//   Api Key: <base64 public key>
//   API Secret: <base64 seed>
//
//   api_key_private_key: <hex>
//   account_index: 3
//   api_key_index: 0
//
//   bot_token: <telegram token>
//   chat_id: <telegram chat id>
// =============================================================================

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;

/// Credential material for the Ed25519-signed venue.
#[derive(Debug, Clone)]
pub struct Ed25519Credentials {
    pub api_key: String,
    pub api_secret: String,
}

/// Credential material for the nonce/API-key-scoped venue.
#[derive(Debug, Clone)]
pub struct NonceVenueCredentials {
    pub api_key_private_key: String,
    pub account_index: u32,
    pub api_key_index: u32,
}

/// Optional notifier credentials (Telegram-shaped, consumed outside the
/// execution core — parsed here only because it shares the credential file).
#[derive(Debug, Clone)]
pub struct NotifierCredentials {
    pub bot_token: String,
    pub chat_id: String,
}

/// All credential material recognised from one file.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub ed25519: Option<Ed25519Credentials>,
    pub nonce_venue: Option<NonceVenueCredentials>,
    pub notifier: Option<NotifierCredentials>,
}

/// Parse `key: value` / `Key Name: value` lines into a lowercase-keyed map.
/// Blank lines and lines without a `:` separator are ignored.
fn parse_kv_lines(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_lowercase().replace(' ', "_");
            let value = value.trim().to_string();
            if !value.is_empty() {
                map.insert(key, value);
            }
        }
    }
    map
}

impl Credentials {
    /// Load and parse a credentials file. Missing or unparseable files are a
    /// `config_error`-class fatal condition (ground truth: spec §7) — the
    /// caller at the CLI boundary is expected to translate this into exit
    /// code 1.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read credentials file {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("failed to parse credentials file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let map = parse_kv_lines(content);

        let ed25519 = match (map.get("api_key"), map.get("api_secret")) {
            (Some(key), Some(secret)) => Some(Ed25519Credentials {
                api_key: key.clone(),
                api_secret: secret.clone(),
            }),
            _ => None,
        };

        let nonce_venue = match (
            map.get("api_key_private_key"),
            map.get("account_index"),
            map.get("api_key_index"),
        ) {
            (Some(priv_key), Some(account_index), Some(key_index)) => Some(NonceVenueCredentials {
                api_key_private_key: priv_key.clone(),
                account_index: account_index
                    .parse()
                    .context("account_index is not a valid integer")?,
                api_key_index: key_index
                    .parse()
                    .context("api_key_index is not a valid integer")?,
            }),
            _ => None,
        };

        let notifier = match (map.get("bot_token"), map.get("chat_id")) {
            (Some(token), Some(chat_id)) => Some(NotifierCredentials {
                bot_token: token.clone(),
                chat_id: chat_id.clone(),
            }),
            _ => None,
        };

        Ok(Self {
            ed25519,
            nonce_venue,
            notifier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ed25519_section() {
        let creds = Credentials::parse("Api Key: pub123\nAPI Secret: seed456\n").unwrap();
        let ed = creds.ed25519.expect("ed25519 creds parsed");
        assert_eq!(ed.api_key, "pub123");
        assert_eq!(ed.api_secret, "seed456");
    }

    #[test]
    fn parses_nonce_venue_section() {
        let content = "api_key_private_key: abcdef\naccount_index: 3\napi_key_index: 0\n";
        let creds = Credentials::parse(content).unwrap();
        let nonce = creds.nonce_venue.expect("nonce venue creds parsed");
        assert_eq!(nonce.api_key_private_key, "abcdef");
        assert_eq!(nonce.account_index, 3);
        assert_eq!(nonce.api_key_index, 0);
    }

    #[test]
    fn parses_both_sections_from_one_file() {
        let content = "Api Key: pub\nAPI Secret: sec\n\napi_key_private_key: priv\naccount_index: 1\napi_key_index: 2\n\nbot_token: t\nchat_id: c\n";
        let creds = Credentials::parse(content).unwrap();
        assert!(creds.ed25519.is_some());
        assert!(creds.nonce_venue.is_some());
        assert!(creds.notifier.is_some());
    }

    #[test]
    fn missing_fields_leave_section_none() {
        let creds = Credentials::parse("Api Key: pub\n").unwrap();
        assert!(creds.ed25519.is_none());
    }

    #[test]
    fn blank_lines_and_comments_ignored() {
        let content = "\n# comment\nApi Key: pub\n\nAPI Secret: sec\n";
        let creds = Credentials::parse(content).unwrap();
        assert!(creds.ed25519.is_some());
    }

    #[test]
    fn invalid_integer_field_is_an_error() {
        let content = "api_key_private_key: abc\naccount_index: not-a-number\napi_key_index: 0\n";
        assert!(Credentials::parse(content).is_err());
    }
}
