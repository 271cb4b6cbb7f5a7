/// Configuration management
use crate::error::{Result, SyncError};
use crate::model::Participant;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const DEFAULT_CHAT_COLLECTION: &str = "chat";
const DEFAULT_CONVERSATIONS_COLLECTION: &str = "conversations";

/// How sends behave while a summary create has not been acknowledged yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CreatePolicy {
    /// Every send before resolution issues its own create. Rapid sends can
    /// produce duplicate summaries.
    #[default]
    Unguarded,
    /// At most one create in flight per session; later sends are held and
    /// applied as an update once the create is acknowledged. Does not help
    /// against two different clients creating concurrently.
    SerializePending,
}

/// Settings shared by every chat session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Collection holding message records
    pub chat_collection: String,

    /// Collection holding conversation summaries
    pub conversations_collection: String,

    pub create_policy: CreatePolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chat_collection: DEFAULT_CHAT_COLLECTION.to_string(),
            conversations_collection: DEFAULT_CONVERSATIONS_COLLECTION.to_string(),
            create_policy: CreatePolicy::Unguarded,
        }
    }
}

/// Client configuration for the terminal chat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Signed-in user
    pub local: Participant,

    /// User on the other side of the chat
    pub peer: Participant,

    /// Directory for the document store (defaults to `.chatsync/<user-id>`)
    pub data_dir: Option<PathBuf>,

    pub sync: SyncConfig,
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 3 {
            return Err(SyncError::Config(format!(
                "Usage: {} <user-id> <peer-id> [--name <name>] [--image <ref>] [--peer-name <name>] [--peer-image <ref>] [--data-dir <path>] [--serialize-creates]",
                args.first().map(String::as_str).unwrap_or("chatsync")
            )));
        }

        let user_id = args[1].trim().to_string();
        let peer_id = args[2].trim().to_string();
        if user_id.is_empty() || peer_id.is_empty() {
            return Err(SyncError::Config("User ids must not be empty".to_string()));
        }
        if user_id == peer_id {
            return Err(SyncError::Config(
                "User id and peer id must differ".to_string(),
            ));
        }

        let mut name: Option<String> = None;
        let mut image = String::new();
        let mut peer_name: Option<String> = None;
        let mut peer_image = String::new();
        let mut data_dir: Option<PathBuf> = None;
        let mut create_policy = CreatePolicy::Unguarded;

        let mut i = 3;
        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "--serialize-creates" => {
                    create_policy = CreatePolicy::SerializePending;
                    i += 1;
                }
                "--name" | "--image" | "--peer-name" | "--peer-image" | "--data-dir" => {
                    let value = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config(format!("{} requires an argument", flag))
                    })?;
                    match flag {
                        "--name" => name = Some(value.clone()),
                        "--image" => image = value.clone(),
                        "--peer-name" => peer_name = Some(value.clone()),
                        "--peer-image" => peer_image = value.clone(),
                        _ => data_dir = Some(PathBuf::from(value)),
                    }
                    i += 2;
                }
                other => {
                    return Err(SyncError::Config(format!("Unknown argument: {}", other)));
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(dir) = std::env::var("CHATSYNC_DATA_DIR") {
            if !dir.is_empty() {
                data_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(n) = std::env::var("CHATSYNC_USER_NAME") {
            if !n.is_empty() {
                name = Some(n);
            }
        }
        if std::env::var("CHATSYNC_SERIALIZE_CREATES").is_ok() {
            create_policy = CreatePolicy::SerializePending;
        }

        Ok(Self {
            local: Participant::new(&user_id, name.unwrap_or_else(|| user_id.clone()), image),
            peer: Participant::new(&peer_id, peer_name.unwrap_or_else(|| peer_id.clone()), peer_image),
            data_dir,
            sync: SyncConfig {
                create_policy,
                ..Default::default()
            },
        })
    }

    /// Store directory, falling back to `.chatsync/<user-id>`
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(".chatsync").join(&self.local.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_minimal_args() {
        let config = Config::from_args(&args(&["chatsync", "alice", "bob"])).unwrap();
        assert_eq!(config.local.id, "alice");
        assert_eq!(config.peer.display_name, "bob");
        assert_eq!(config.sync.chat_collection, "chat");
        assert_eq!(config.sync.conversations_collection, "conversations");
    }

    #[test]
    fn test_flags() {
        let config = Config::from_args(&args(&[
            "chatsync",
            "alice",
            "bob",
            "--peer-name",
            "Bob B.",
            "--image",
            "aGk=",
            "--data-dir",
            "/tmp/chat",
            "--serialize-creates",
        ]))
        .unwrap();
        assert_eq!(config.peer.display_name, "Bob B.");
        assert_eq!(config.local.image_ref, "aGk=");
        assert_eq!(config.resolved_data_dir(), PathBuf::from("/tmp/chat"));
        assert_eq!(config.sync.create_policy, CreatePolicy::SerializePending);
    }

    #[test]
    fn test_rejects_bad_args() {
        assert!(Config::from_args(&args(&["chatsync", "alice"])).is_err());
        assert!(Config::from_args(&args(&["chatsync", "alice", "alice"])).is_err());
        assert!(Config::from_args(&args(&["chatsync", "alice", "bob", "--name"])).is_err());
        assert!(Config::from_args(&args(&["chatsync", "alice", "bob", "--bogus"])).is_err());
    }
}
