use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use russh::keys::ssh_key::{HashAlg, LineEnding};
use russh::keys::{Algorithm, PrivateKey};
use tracing::info;

use crate::error::HostKeyError;

/// Loads the server's host key, generating one on first use.
pub struct KeyManager {
    key_path: PathBuf,
}

impl KeyManager {
    pub fn new(key_path: &Path) -> Self {
        Self {
            key_path: key_path.to_path_buf(),
        }
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// 公钥文件路径: `<key_path>.pub`
    pub fn public_key_path(&self) -> PathBuf {
        let mut path: OsString = self.key_path.as_os_str().to_owned();
        path.push(".pub");
        PathBuf::from(path)
    }

    /// Read the private key at `key_path`, or generate and persist a new
    /// Ed25519 key pair if it does not exist yet.
    pub fn load_or_generate(&self) -> Result<PrivateKey, HostKeyError> {
        let key = if self.key_path.exists() {
            let key_data = fs::read_to_string(&self.key_path)?;
            let key = PrivateKey::from_openssh(&key_data)?;
            info!(path = %self.key_path.display(), "使用已存在的主机密钥");
            key
        } else {
            info!(path = %self.key_path.display(), "正在生成新的 ed25519 主机密钥");
            self.generate_ed25519_keypair()?
        };

        info!(
            fingerprint = %key.public_key().fingerprint(HashAlg::Sha256),
            "主机密钥已加载"
        );
        Ok(key)
    }

    fn generate_ed25519_keypair(&self) -> Result<PrivateKey, HostKeyError> {
        if let Some(parent) = self.key_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)?;

        let private_pem = key.to_openssh(LineEnding::LF)?;
        fs::write(&self.key_path, private_pem.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.key_path, fs::Permissions::from_mode(0o600))?;
        }

        let public_key = key.public_key().to_openssh()?;
        fs::write(self.public_key_path(), format!("{}\n", public_key))?;

        Ok(key)
    }

    /// Get the public key as a string (for display/configuration)
    pub fn public_key_string(&self) -> Result<String, HostKeyError> {
        let public_key = fs::read_to_string(self.public_key_path())?;
        Ok(public_key.trim().to_string())
    }

    /// Check if key files exist
    pub fn key_files_exist(&self) -> bool {
        self.key_path.exists() && self.public_key_path().exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let manager = KeyManager::new(&dir.path().join(".ssh").join("term_info_ed25519"));
        assert!(!manager.key_files_exist());

        let generated = manager.load_or_generate().unwrap();
        assert!(manager.key_files_exist());
        assert!(manager.public_key_string().unwrap().starts_with("ssh-ed25519 "));

        let reloaded = manager.load_or_generate().unwrap();
        assert_eq!(
            generated.public_key().fingerprint(HashAlg::Sha256),
            reloaded.public_key().fingerprint(HashAlg::Sha256)
        );
    }

    #[test]
    fn test_public_key_path() {
        let manager = KeyManager::new(Path::new("keys/host.key"));
        assert_eq!(manager.public_key_path(), PathBuf::from("keys/host.key.pub"));
    }

    #[test]
    fn test_rejects_garbage_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken");
        fs::write(&path, "not a key").unwrap();
        let manager = KeyManager::new(&path);
        assert!(matches!(manager.load_or_generate(), Err(HostKeyError::Key(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let manager = KeyManager::new(&dir.path().join("host_ed25519"));
        manager.load_or_generate().unwrap();
        let mode = fs::metadata(manager.key_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
