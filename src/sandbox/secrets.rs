/// Secret property codec and log masking
///
/// Secret values are decoded through [`SecretCodec`] and masked out of
/// captured logs, longest value first.

use anyhow::Result;

/// Fixed-length replacement for secret values in logs
pub const SECRET_MASK: &str = "********";

/// Encrypts and decrypts property values declared as secrets
///
/// Implemented by the embedding application; the engine only ever decrypts.
pub trait SecretCodec: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String>;
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// Codec for deployments that keep secret properties in clear text
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCodec;

impl SecretCodec for PassthroughCodec {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        Ok(plaintext.to_string())
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        Ok(ciphertext.to_string())
    }
}

/// Replace every occurrence of every secret with [`SECRET_MASK`]
pub fn mask_secrets(text: &str, secrets: &[String]) -> String {
    // Longest first so a secret containing another is masked whole
    let mut ordered: Vec<&String> = secrets.iter().filter(|s| !s.is_empty()).collect();
    ordered.sort_by(|a, b| b.len().cmp(&a.len()));

    ordered
        .into_iter()
        .fold(text.to_string(), |masked, secret| masked.replace(secret.as_str(), SECRET_MASK))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_all_occurrences() {
        let secrets = vec!["s3cr3t".to_string(), String::new()];
        let masked = mask_secrets("token=s3cr3t, again s3cr3t", &secrets);
        assert_eq!(masked, "token=********, again ********");
        assert!(!masked.contains("s3cr3t"));
    }

    #[test]
    fn overlapping_secrets_leave_no_plaintext() {
        let secrets = vec!["abc".to_string(), "abcdef".to_string()];
        let masked = mask_secrets("key abcdef", &secrets);
        assert_eq!(masked, "key ********");
    }

    #[test]
    fn passthrough_is_identity() {
        let codec = PassthroughCodec;
        let cipher = codec.encrypt("pw").unwrap();
        assert_eq!(codec.decrypt(&cipher).unwrap(), "pw");
    }
}
