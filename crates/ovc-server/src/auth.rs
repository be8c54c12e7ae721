use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rand::rngs::OsRng;
use rand::Rng;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use ovc_protocol::types::PlayerId;

/// Code alphabet: 32 symbols, no `0/O` or `1/I`.
pub const CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Auth codes are 6 characters.
pub const CODE_LEN: usize = 6;

struct Entry {
    code: Zeroizing<String>,
    player_id: PlayerId,
}

/// Persistent mapping `username -> (code, player id)` backing `/vc login`.
///
/// The in-memory map is authoritative; the properties file is a best-effort
/// mirror rewritten with an atomic replace. A failed write is logged and the
/// store keeps serving from memory.
pub struct AuthCodeStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, Entry>>,
}

impl AuthCodeStore {
    /// Load the store from `path`, ignoring lines that do not parse.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut entries = HashMap::new();

        if let Ok(content) = fs::read_to_string(&path) {
            let mut codes: HashMap<String, String> = HashMap::new();
            let mut players: HashMap<String, PlayerId> = HashMap::new();

            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let Some((key, value)) = line.split_once('=') else {
                    continue;
                };
                let (key, value) = (key.trim(), value.trim());
                if let Some(username) = key.strip_suffix(".code") {
                    codes.insert(username.to_string(), value.to_string());
                } else if let Some(username) = key.strip_suffix(".uuid") {
                    if let Ok(id) = value.parse() {
                        players.insert(username.to_string(), id);
                    }
                }
            }

            for (username, code) in codes {
                if let Some(&player_id) = players.get(&username) {
                    entries.insert(
                        username,
                        Entry {
                            code: Zeroizing::new(code),
                            player_id,
                        },
                    );
                }
            }
            debug!(count = entries.len(), path = %path.display(), "loaded auth codes");
        }

        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    /// Return the existing code for `username`, minting one if absent.
    pub fn get_or_create(&self, username: &str, player_id: PlayerId) -> String {
        let username = canonicalize(username);
        let mut entries = self.entries.lock().unwrap();

        if let Some(entry) = entries.get_mut(&username) {
            entry.player_id = player_id;
            return entry.code.to_string();
        }

        let code = mint_code(&entries);
        entries.insert(
            username,
            Entry {
                code: Zeroizing::new(code.clone()),
                player_id,
            },
        );
        self.persist(&entries);
        code
    }

    /// Mint a fresh code, replacing any prior one.
    pub fn reset(&self, username: &str, player_id: PlayerId) -> String {
        let username = canonicalize(username);
        let mut entries = self.entries.lock().unwrap();

        let code = mint_code(&entries);
        entries.insert(
            username,
            Entry {
                code: Zeroizing::new(code.clone()),
                player_id,
            },
        );
        self.persist(&entries);
        code
    }

    /// Case-insensitive, constant-time comparison against the stored code.
    pub fn validate(&self, username: &str, code: &str) -> bool {
        let entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get(&canonicalize(username)) else {
            return false;
        };
        let stored = entry.code.to_ascii_uppercase();
        let submitted = code.to_ascii_uppercase();
        if stored.len() != submitted.len() {
            return false;
        }
        stored.as_bytes().ct_eq(submitted.as_bytes()).into()
    }

    pub fn lookup_player(&self, username: &str) -> Option<PlayerId> {
        let entries = self.entries.lock().unwrap();
        entries.get(&canonicalize(username)).map(|e| e.player_id)
    }

    pub fn remove(&self, username: &str) {
        let mut entries = self.entries.lock().unwrap();
        if entries.remove(&canonicalize(username)).is_some() {
            self.persist(&entries);
        }
    }

    /// Rewrite the properties file via write-temp-then-rename.
    fn persist(&self, entries: &HashMap<String, Entry>) {
        let mut lines: Vec<String> = entries
            .iter()
            .flat_map(|(username, entry)| {
                [
                    format!("{}.code = {}", username, entry.code.as_str()),
                    format!("{}.uuid = {}", username, entry.player_id),
                ]
            })
            .collect();
        lines.sort();
        let content = lines.join("\n") + "\n";

        if let Err(e) = write_atomically(&self.path, &content) {
            warn!(path = %self.path.display(), "failed to persist auth codes: {e}");
        }
    }
}

fn canonicalize(username: &str) -> String {
    username.trim().to_lowercase()
}

/// Sample a 6-character code from a cryptographically strong RNG, retrying
/// on the (negligible) chance of colliding with an active code.
fn mint_code(entries: &HashMap<String, Entry>) -> String {
    loop {
        let code: String = (0..CODE_LEN)
            .map(|_| CODE_ALPHABET[OsRng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        if !entries.values().any(|e| e.code.as_str() == code) {
            return code;
        }
    }
}

fn write_atomically(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("properties.tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn store(dir: &TempDir) -> AuthCodeStore {
        AuthCodeStore::load(dir.path().join("voice-chat-auth.properties"))
    }

    #[test]
    fn get_or_create_is_stable() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let player = Uuid::new_v4();
        let first = store.get_or_create("Alice", player);
        let second = store.get_or_create("alice", player);
        assert_eq!(first, second);
    }

    #[test]
    fn code_uses_reduced_alphabet() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let code = store.get_or_create("alice", Uuid::new_v4());
        assert_eq!(code.len(), CODE_LEN);
        for c in code.bytes() {
            assert!(CODE_ALPHABET.contains(&c), "unexpected symbol {}", c as char);
            assert!(![b'0', b'O', b'1', b'I'].contains(&c));
        }
    }

    #[test]
    fn reset_replaces_code() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let player = Uuid::new_v4();
        let first = store.get_or_create("alice", player);
        let second = store.reset("alice", player);
        // Collisions between two random 6-char codes are effectively impossible.
        assert_ne!(first, second);
        assert!(store.validate("alice", &second));
        assert!(!store.validate("alice", &first));
    }

    #[test]
    fn validate_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let code = store.get_or_create("alice", Uuid::new_v4());
        assert!(store.validate("alice", &code.to_lowercase()));
        assert!(store.validate("ALICE", &code));
    }

    #[test]
    fn validate_rejects_wrong_and_unknown() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.get_or_create("alice", Uuid::new_v4());
        assert!(!store.validate("alice", "WRONG2"));
        assert!(!store.validate("alice", ""));
        assert!(!store.validate("nobody", "ABCDEF"));
    }

    #[test]
    fn lookup_player_and_remove() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let player = Uuid::new_v4();
        store.get_or_create("alice", player);
        assert_eq!(store.lookup_player("Alice"), Some(player));
        store.remove("alice");
        assert_eq!(store.lookup_player("alice"), None);
    }

    #[test]
    fn persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("voice-chat-auth.properties");
        let player = Uuid::new_v4();
        let code = {
            let store = AuthCodeStore::load(&path);
            store.get_or_create("alice", player)
        };

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains(&format!("alice.code = {code}")));
        assert!(content.contains(&format!("alice.uuid = {player}")));

        let reloaded = AuthCodeStore::load(&path);
        assert!(reloaded.validate("alice", &code));
        assert_eq!(reloaded.lookup_player("alice"), Some(player));
    }

    #[test]
    fn unwritable_path_is_soft_error() {
        let store = AuthCodeStore::load("/nonexistent-dir/voice-chat-auth.properties");
        let code = store.get_or_create("alice", Uuid::new_v4());
        // Persist failed, but the in-memory map still serves.
        assert!(store.validate("alice", &code));
    }

    #[test]
    fn ignores_garbage_lines_on_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("voice-chat-auth.properties");
        let player = Uuid::new_v4();
        std::fs::write(
            &path,
            format!(
                "# comment\nnot a property line\nalice.code = ABC234\nalice.uuid = {player}\nbob.code = DEF567\n"
            ),
        )
        .unwrap();
        let store = AuthCodeStore::load(&path);
        assert!(store.validate("alice", "abc234"));
        // bob has no uuid line, so the pair is incomplete and dropped.
        assert_eq!(store.lookup_player("bob"), None);
    }
}
