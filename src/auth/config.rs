use sha2::{Digest, Sha256};

/// Admin credentials loaded from environment variables.
///
/// Only a digest of the token is kept in memory.
#[derive(Clone)]
pub struct AdminConfig {
    token_digest: Option<[u8; 32]>,
}

impl AdminConfig {
    pub fn from_env() -> Self {
        let token = std::env::var("ADMIN_API_TOKEN")
            .ok()
            .filter(|value| !value.trim().is_empty());
        if token.is_none() {
            log::warn!("ADMIN_API_TOKEN is not set; admin endpoints will reject every request");
        }
        Self::with_token(token.as_deref())
    }

    pub fn with_token(token: Option<&str>) -> Self {
        Self {
            token_digest: token.map(digest),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.token_digest.is_some()
    }

    /// Compare fixed-length digests so the check does not leak the token length.
    pub fn verify(&self, presented: &str) -> bool {
        match &self.token_digest {
            Some(expected) => {
                let presented = digest(presented);
                expected
                    .iter()
                    .zip(presented.iter())
                    .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                    == 0
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for AdminConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminConfig")
            .field("configured", &self.is_configured())
            .finish()
    }
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}
