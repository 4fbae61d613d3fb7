use std::path::Path;

use s3fuse_base::error::{Error, Result};
use s3fuse_crypto::private_file;

/// An access-key / secret-key pair.
#[derive(Clone)]
pub struct Credentials {
    /// Public access key id.
    pub key: String,
    /// Secret signing key.
    pub secret: String,
}

impl Credentials {
    /// Loads credentials from a 0600 file holding one line of two
    /// whitespace-separated fields: `<access-key> <secret-key>`.
    pub fn load(path: &Path) -> Result<Self> {
        let data = private_file::read(path)?;
        let line = data.lines().next().unwrap_or("");
        let fields: Vec<&str> = line.split_whitespace().collect();

        if fields.len() != 2 {
            return Err(Error::InvalidArgument(format!(
                "expected 2 fields in credentials file, found {}",
                fields.len()
            )));
        }

        Ok(Self {
            key: fields[0].to_string(),
            secret: fields[1].to_string(),
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // the secret never reaches the log
        f.debug_struct("Credentials").field("key", &self.key).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn secret_file(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        std::fs::set_permissions(f.path(), std::fs::Permissions::from_mode(0o600)).unwrap();
        f
    }

    #[test]
    fn test_load_two_fields() {
        let f = secret_file("AKIAEXAMPLE  wJalrXUtnFEMI\n");
        let creds = Credentials::load(f.path()).unwrap();
        assert_eq!(creds.key, "AKIAEXAMPLE");
        assert_eq!(creds.secret, "wJalrXUtnFEMI");
    }

    #[test]
    fn test_tabs_separate_fields() {
        let f = secret_file("key\tsecret\n");
        let creds = Credentials::load(f.path()).unwrap();
        assert_eq!(creds.key, "key");
        assert_eq!(creds.secret, "secret");
    }

    #[test]
    fn test_wrong_field_count_rejected() {
        let f = secret_file("only-one-field\n");
        assert!(matches!(
            Credentials::load(f.path()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_debug_hides_secret() {
        let creds = Credentials {
            key: "AKIA".to_string(),
            secret: "terribly-secret".to_string(),
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("AKIA"));
        assert!(!rendered.contains("terribly-secret"));
    }
}
