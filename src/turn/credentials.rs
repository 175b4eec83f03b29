//! Persisted TURN credentials (`spec.md` §4.4, §6.4).
//!
//! A fixed username and a 16-byte hex-encoded random password, generated on
//! first start and reused thereafter. Credentials survive restarts because
//! in-flight browser sessions cache them — rotating them on every restart
//! would break reconnects (`spec.md` §9).

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use rand::RngCore;

/// The fixed username baked into every deployment's credential file.
pub const DEFAULT_USERNAME: &str = "meetbridge";

const USERNAME_FILE: &str = "turn-username.key";
const PASSWORD_FILE: &str = "turn-password.key";

pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Load credentials from `keys_dir`, generating and persisting a fresh pair
/// on first start. The directory is created with mode `0700`; the key files
/// with mode `0600` (`spec.md` §6.4).
pub fn load_or_generate(keys_dir: &Path) -> io::Result<Credentials> {
    fs::create_dir_all(keys_dir)?;
    fs::set_permissions(keys_dir, fs::Permissions::from_mode(0o700))?;

    let username_path = keys_dir.join(USERNAME_FILE);
    let password_path = keys_dir.join(PASSWORD_FILE);

    let username = read_or_write(&username_path, DEFAULT_USERNAME.to_string())?;
    let password = read_or_write(&password_path, generate_password())?;

    Ok(Credentials { username, password })
}

fn read_or_write(path: &Path, fresh_value: String) -> io::Result<String> {
    if let Ok(existing) = fs::read_to_string(path) {
        let trimmed = existing.trim().to_string();
        if !trimmed.is_empty() {
            return Ok(trimmed);
        }
    }

    fs::write(path, &fresh_value)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(fresh_value)
}

fn generate_password() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
