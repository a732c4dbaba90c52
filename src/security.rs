//! Internal-user credential handling: password generation, bcrypt hashing
//! for the security plugin config, and decoding of the credentials Secret.

use serde_json::Value;

use std::collections::BTreeMap;
use std::fmt::{self, Display};

/// The internal users provisioned in every managed cluster. `metrics` shares
/// one operator-global password; the rest are generated per cluster.
pub const INTERNAL_USERS: [&str; 7] = [
    "admin",
    "kibanaserver",
    "kibanaro",
    "logstash",
    "readall",
    "snapshotrestore",
    "metrics",
];

pub const METRICS_USER: &str = "metrics";

#[derive(Debug)]
pub enum CredentialsError {
    MissingUser(String),
    InvalidEncoding(String),
    Hash(bcrypt::BcryptError),
}

impl Display for CredentialsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CredentialsError::MissingUser(user) => {
                write!(f, "Credentials secret has no entry for user '{}'", user)
            }
            CredentialsError::InvalidEncoding(key) => {
                write!(f, "Credentials secret entry '{}' is not valid base64 utf8", key)
            }
            CredentialsError::Hash(e) => write!(f, "Password hashing failed: {}", e),
        }
    }
}
impl std::error::Error for CredentialsError {}

impl From<bcrypt::BcryptError> for CredentialsError {
    fn from(e: bcrypt::BcryptError) -> CredentialsError {
        CredentialsError::Hash(e)
    }
}

/// 16 random bytes, hex encoded.
pub fn random_password() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

/// bcrypt hash in the form the security plugin's internal_users.yml expects.
pub fn hash_password(password: &str) -> Result<String, CredentialsError> {
    Ok(bcrypt::hash(password, bcrypt::DEFAULT_COST)?)
}

/// Decodes the `data` section of the credentials Secret into a
/// user → password map, requiring every internal user to be present.
pub fn decode_credentials_secret(secret: &Value) -> Result<BTreeMap<String, String>, CredentialsError> {
    let mut passwords = BTreeMap::new();
    for user in INTERNAL_USERS {
        let encoded = secret
            .pointer(&format!("/data/{}", user))
            .and_then(Value::as_str)
            .ok_or_else(|| CredentialsError::MissingUser(user.to_owned()))?;
        passwords.insert(user.to_owned(), decode_secret_value(user, encoded)?);
    }
    Ok(passwords)
}

/// Decodes one base64 Secret `data` value into utf8 text.
pub fn decode_secret_value(key: &str, encoded: &str) -> Result<String, CredentialsError> {
    let bytes = base64::decode(encoded)
        .map_err(|_| CredentialsError::InvalidEncoding(key.to_owned()))?;
    String::from_utf8(bytes).map_err(|_| CredentialsError::InvalidEncoding(key.to_owned()))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn random_passwords_are_32_hex_chars() {
        let password = random_password();
        assert_eq!(32, password.len());
        assert!(password.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(password, random_password());
    }

    #[test]
    fn hashes_verify_against_the_source_password() {
        let password = "correct-horse";
        let hash = hash_password(password).unwrap();
        assert!(hash.starts_with("$2"));
        assert!(bcrypt::verify(password, &hash).unwrap());
        assert!(!bcrypt::verify("wrong", &hash).unwrap());
    }

    #[test]
    fn decodes_a_complete_credentials_secret() {
        let mut data = serde_json::Map::new();
        for user in INTERNAL_USERS {
            data.insert(user.to_owned(), json!(base64::encode(format!("{}-pw", user))));
        }
        let secret = json!({ "data": data });
        let passwords = decode_credentials_secret(&secret).unwrap();
        assert_eq!("admin-pw", passwords["admin"]);
        assert_eq!("metrics-pw", passwords["metrics"]);
        assert_eq!(INTERNAL_USERS.len(), passwords.len());
    }

    #[test]
    fn missing_users_are_rejected() {
        let secret = json!({"data": {"admin": base64::encode("x")}});
        assert!(matches!(
            decode_credentials_secret(&secret),
            Err(CredentialsError::MissingUser(_))
        ));
    }
}
