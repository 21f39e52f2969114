//! Client authentication. Three methods are spoken on the wire: `NONE`
//! (anonymous), `PLAIN` (self-asserted user name), and `HTPASSWD` (framed
//! username/password checked against an htpasswd file).

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use htpasswd_verify::Htpasswd;
use squawkbus_protocol::v1::frame::FrameReader;

use crate::BrokerError;

/// The parsed password file: one `user:hash` record per user, `#` comments
/// skipped. Verification is delegated to the htpasswd hash formats.
pub struct PasswordRepository {
    entries: HashMap<String, String>,
}

impl PasswordRepository {
    pub fn load(path: &Path) -> Result<Self, BrokerError> {
        tracing::info!("loading password file {}", path.display());

        let contents = fs::read_to_string(path)?;
        let mut entries = HashMap::new();
        for line in contents.lines() {
            if line.starts_with('#') || line.trim().is_empty() {
                continue;
            }
            let (user, _) = line
                .split_once(':')
                .ok_or_else(|| BrokerError::Config("invalid password record".into()))?;
            entries.insert(user.to_string(), line.to_string());
        }

        Ok(PasswordRepository { entries })
    }

    pub fn from_entries(entries: HashMap<String, String>) -> Self {
        PasswordRepository { entries }
    }

    pub fn verify(&self, user: &str, password: &str) -> bool {
        let Some(record) = self.entries.get(user) else {
            return false;
        };
        Htpasswd::from(record.as_str()).check(user, password)
    }
}

pub struct AuthenticationManager {
    passwords: Option<PasswordRepository>,
}

impl AuthenticationManager {
    pub fn new(password_file: Option<&Path>) -> Result<Self, BrokerError> {
        let passwords = match password_file {
            Some(path) => Some(PasswordRepository::load(path)?),
            None => None,
        };
        Ok(AuthenticationManager { passwords })
    }

    pub fn with_repository(passwords: PasswordRepository) -> Self {
        AuthenticationManager {
            passwords: Some(passwords),
        }
    }

    /// Returns the authenticated user name, or `None` to reject the session.
    pub fn authenticate(&self, method: &str, data: &[u8]) -> Option<String> {
        tracing::debug!(method, "authenticating");

        match method {
            "NONE" => Some("nobody".into()),
            "PLAIN" => {
                if data.is_empty() {
                    Some("nobody".into())
                } else {
                    String::from_utf8(data.to_vec()).ok()
                }
            }
            "HTPASSWD" => self.authenticate_htpasswd(data),
            _ => None,
        }
    }

    /// The credential blob is itself one frame: `string username, string
    /// password`.
    fn authenticate_htpasswd(&self, data: &[u8]) -> Option<String> {
        let passwords = self.passwords.as_ref()?;

        let mut reader = FrameReader::new();
        reader.write(data);
        if !reader.has_frame().ok()? {
            tracing::error!("invalid authentication data");
            return None;
        }
        let mut frame = reader.read().ok()?;
        let username = frame.get_string().ok()?;
        let password = frame.get_string().ok()?;

        if !passwords.verify(&username, &password) {
            return None;
        }
        Some(username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use squawkbus_protocol::v1::frame::FrameBuffer;

    // "password" hashed with the htpasswd SHA-1 scheme.
    const ALICE_RECORD: &str = "alice:{SHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g=";

    fn manager_with_alice() -> AuthenticationManager {
        AuthenticationManager::with_repository(PasswordRepository::from_entries(HashMap::from([(
            "alice".to_string(),
            ALICE_RECORD.to_string(),
        )])))
    }

    fn credential_blob(username: &str, password: &str) -> Vec<u8> {
        let mut body = FrameBuffer::new();
        body.put_str(username);
        body.put_str(password);
        let body = body.into_vec();

        let mut blob = (body.len() as u32).to_be_bytes().to_vec();
        blob.extend_from_slice(&body);
        blob
    }

    #[test]
    fn none_is_nobody() {
        let manager = AuthenticationManager::new(None).unwrap();
        assert_eq!(manager.authenticate("NONE", b""), Some("nobody".into()));
    }

    #[test]
    fn plain_takes_the_data_as_user() {
        let manager = AuthenticationManager::new(None).unwrap();
        assert_eq!(manager.authenticate("PLAIN", b"joe"), Some("joe".into()));
        assert_eq!(manager.authenticate("PLAIN", b""), Some("nobody".into()));
    }

    #[test]
    fn unknown_method_is_rejected() {
        let manager = AuthenticationManager::new(None).unwrap();
        assert_eq!(manager.authenticate("KERBEROS", b"blob"), None);
    }

    #[test]
    fn htpasswd_verifies_the_framed_credentials() {
        let manager = manager_with_alice();

        assert_eq!(
            manager.authenticate("HTPASSWD", &credential_blob("alice", "password")),
            Some("alice".into())
        );
        assert_eq!(
            manager.authenticate("HTPASSWD", &credential_blob("alice", "wrong")),
            None
        );
        assert_eq!(
            manager.authenticate("HTPASSWD", &credential_blob("mallory", "password")),
            None
        );
    }

    #[test]
    fn htpasswd_rejects_unframed_data() {
        let manager = manager_with_alice();
        assert_eq!(manager.authenticate("HTPASSWD", b"alice:password"), None);
    }

    #[test]
    fn htpasswd_without_password_file_is_rejected() {
        let manager = AuthenticationManager::new(None).unwrap();
        assert_eq!(
            manager.authenticate("HTPASSWD", &credential_blob("alice", "password")),
            None
        );
    }
}
