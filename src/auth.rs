use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;

/// Stretching factor for stored credentials. Changing this invalidates
/// every stored hash, so it is part of the workspace format.
const HASH_ROUNDS: u32 = 12_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Instructor,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Instructor => "instructor",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "admin" => Some(Role::Admin),
            "instructor" => Some(Role::Instructor),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub email: String,
    pub role: Role,
}

/// In-memory session store. Tokens are opaque UUIDs; restarting the
/// daemon invalidates all of them.
#[derive(Default)]
pub struct Sessions {
    by_token: HashMap<String, Session>,
}

impl Sessions {
    pub fn issue(&mut self, user_id: &str, email: &str, role: Role) -> String {
        let token = Uuid::new_v4().to_string();
        self.by_token.insert(
            token.clone(),
            Session {
                user_id: user_id.to_string(),
                email: email.to_string(),
                role,
            },
        );
        token
    }

    pub fn get(&self, token: &str) -> Option<&Session> {
        self.by_token.get(token)
    }

    pub fn revoke(&mut self, token: &str) -> bool {
        self.by_token.remove(token).is_some()
    }

    /// Drops every session belonging to the user (password change, delete).
    pub fn revoke_user(&mut self, user_id: &str) {
        self.by_token.retain(|_, s| s.user_id != user_id);
    }
}

pub fn new_salt() -> String {
    Uuid::new_v4().to_string()
}

pub fn hash_password(salt: &str, password: &str) -> String {
    let mut digest = {
        let mut h = Sha256::new();
        h.update(salt.as_bytes());
        h.update(password.as_bytes());
        h.finalize()
    };
    for _ in 1..HASH_ROUNDS {
        let mut h = Sha256::new();
        h.update(digest);
        digest = h.finalize();
    }
    hex_string(&digest)
}

pub fn verify_password(salt: &str, password: &str, stored_hash: &str) -> bool {
    hash_password(salt, password) == stored_hash
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
