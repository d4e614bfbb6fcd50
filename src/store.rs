//! Persistent store: four append-only collections behind one writer lock,
//! committed as a single JSON snapshot with atomic replace.

use crate::types::{ChannelMessage, UserLogin, UserMessage};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// Outcome of an insert into a uniqueness-checked collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    Inserted,
    Duplicate,
}

/// The on-disk document. Field names are part of the snapshot format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    logins: Vec<UserLogin>,
    channels: Vec<String>,
    channel_messages: Vec<ChannelMessage>,
    user_messages: Vec<UserMessage>,
}

/// All four collections share one lock: mutations are rare and dominated by
/// the snapshot write anyway, so coarse serialization is enough.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    data: Mutex<Snapshot>,
}

impl Store {
    /// Load the snapshot at `path`. A missing file yields an empty store,
    /// persisted immediately; an unreadable or unparseable file is an error
    /// (the caller treats it as fatal).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        match fs::read(&path) {
            Ok(bytes) => {
                let snapshot = serde_json::from_slice(&bytes)?;
                Ok(Self {
                    path,
                    data: Mutex::new(snapshot),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let store = Self {
                    path,
                    data: Mutex::new(Snapshot::default()),
                };
                store.commit(&Snapshot::default())?;
                Ok(store)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Insert a login iff the username is not taken
    pub fn add_login(&self, login: UserLogin) -> Result<Insert, StoreError> {
        let mut data = self.data.lock().unwrap();
        if data.logins.iter().any(|l| l.username == login.username) {
            return Ok(Insert::Duplicate);
        }
        data.logins.push(login);
        self.commit(&data)?;
        Ok(Insert::Inserted)
    }

    /// Insert a channel iff the name is not taken
    pub fn add_channel(&self, channel: &str) -> Result<Insert, StoreError> {
        let mut data = self.data.lock().unwrap();
        if data.channels.iter().any(|c| c == channel) {
            return Ok(Insert::Duplicate);
        }
        data.channels.push(channel.to_string());
        self.commit(&data)?;
        Ok(Insert::Inserted)
    }

    pub fn append_channel_message(&self, message: ChannelMessage) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();
        data.channel_messages.push(message);
        self.commit(&data)
    }

    pub fn append_user_message(&self, message: UserMessage) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();
        data.user_messages.push(message);
        self.commit(&data)
    }

    pub fn user_exists(&self, username: &str) -> bool {
        self.data
            .lock()
            .unwrap()
            .logins
            .iter()
            .any(|l| l.username == username)
    }

    pub fn channel_exists(&self, channel: &str) -> bool {
        self.data.lock().unwrap().channels.iter().any(|c| c == channel)
    }

    /// Distinct usernames, in registration order
    pub fn users(&self) -> Vec<String> {
        let data = self.data.lock().unwrap();
        let mut users: Vec<String> = Vec::with_capacity(data.logins.len());
        for login in &data.logins {
            if !users.contains(&login.username) {
                users.push(login.username.clone());
            }
        }
        users
    }

    pub fn channels(&self) -> Vec<String> {
        self.data.lock().unwrap().channels.clone()
    }

    /// (logins, channels, channel messages, direct messages)
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let data = self.data.lock().unwrap();
        (
            data.logins.len(),
            data.channels.len(),
            data.channel_messages.len(),
            data.user_messages.len(),
        )
    }

    /// Write the full snapshot via temp file + rename, so a crash mid-write
    /// never leaves a truncated document behind. The in-memory state is
    /// already mutated when this fails; the caller decides what to surface.
    fn commit(&self, data: &Snapshot) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(data)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "snapshot committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(tag: &str) -> (Store, PathBuf) {
        let path = std::env::temp_dir().join(format!("tagarela_store_{tag}_{}.json", std::process::id()));
        let _ = fs::remove_file(&path);
        (Store::open(&path).unwrap(), path)
    }

    fn login(name: &str) -> UserLogin {
        UserLogin {
            username: name.to_string(),
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn duplicate_logins_are_rejected() {
        let (store, path) = temp_store("dup_login");
        assert_eq!(store.add_login(login("alice")).unwrap(), Insert::Inserted);
        assert_eq!(store.add_login(login("alice")).unwrap(), Insert::Duplicate);
        assert_eq!(store.users(), vec!["alice"]);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn duplicate_channels_are_rejected() {
        let (store, path) = temp_store("dup_channel");
        assert_eq!(store.add_channel("general").unwrap(), Insert::Inserted);
        assert_eq!(store.add_channel("general").unwrap(), Insert::Duplicate);
        assert_eq!(store.channels(), vec!["general"]);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn snapshot_survives_reopen() {
        let (store, path) = temp_store("reopen");
        store.add_login(login("alice")).unwrap();
        store.add_channel("general").unwrap();
        store
            .append_channel_message(ChannelMessage {
                user: "alice".into(),
                channel: "general".into(),
                message: "hi".into(),
                timestamp: 1,
            })
            .unwrap();
        store
            .append_user_message(UserMessage {
                src: "alice".into(),
                dst: "bob".into(),
                message: "oi".into(),
                timestamp: 2,
            })
            .unwrap();
        drop(store);

        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.counts(), (1, 1, 1, 1));
        assert!(reopened.user_exists("alice"));
        assert!(reopened.channel_exists("general"));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn missing_file_creates_empty_snapshot() {
        let (store, path) = temp_store("fresh");
        assert_eq!(store.counts(), (0, 0, 0, 0));
        // open() persists the empty document right away
        assert!(path.exists());
        let _ = fs::remove_file(path);
    }

    #[test]
    fn corrupt_snapshot_is_an_error() {
        let path = std::env::temp_dir().join(format!("tagarela_store_bad_{}.json", std::process::id()));
        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(Store::open(&path), Err(StoreError::Snapshot(_))));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn snapshot_is_human_readable_json() {
        let (store, path) = temp_store("readable");
        store.add_login(login("alice")).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"logins\""));
        assert!(text.contains("\"channels\""));
        assert!(text.contains("\"channel_messages\""));
        assert!(text.contains("\"user_messages\""));
        let _ = fs::remove_file(path);
    }
}
