//! User authentication policy and credentials.

use std::collections::HashMap;

use protocol::messages::AuthMethod;

/// An authentication attempt as seen by the responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// Claimed user name.
    pub username: String,
    /// Service the peer wants after authentication.
    pub service: String,
    /// Method and credential.
    pub method: AuthMethod,
    /// 1-based attempt number on this connection.
    pub attempt: u32,
}

/// Verdict on an authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    /// Let the user in.
    Accept,
    /// Refuse this attempt; the peer may try again.
    Reject,
}

/// Decides authentication attempts on the responder.
pub trait Authenticator: Send {
    /// Judge one attempt.
    fn authenticate(&mut self, request: &AuthRequest) -> AuthDecision;
}

impl<F> Authenticator for F
where
    F: FnMut(&AuthRequest) -> AuthDecision + Send,
{
    fn authenticate(&mut self, request: &AuthRequest) -> AuthDecision {
        self(request)
    }
}

/// Policy used when no authenticator is registered.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectAll;

impl Authenticator for RejectAll {
    fn authenticate(&mut self, _request: &AuthRequest) -> AuthDecision {
        AuthDecision::Reject
    }
}

/// Accepts password attempts matching a fixed user table.
#[derive(Debug, Clone, Default)]
pub struct PasswordTable {
    users: HashMap<String, String>,
}

impl PasswordTable {
    /// Build from `(user, password)` pairs.
    pub fn new<I, U, P>(users: I) -> Self
    where
        I: IntoIterator<Item = (U, P)>,
        U: Into<String>,
        P: Into<String>,
    {
        Self {
            users: users
                .into_iter()
                .map(|(user, password)| (user.into(), password.into()))
                .collect(),
        }
    }

    /// Number of known users.
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl Authenticator for PasswordTable {
    fn authenticate(&mut self, request: &AuthRequest) -> AuthDecision {
        match (&request.method, self.users.get(&request.username)) {
            (AuthMethod::Password { password }, Some(expected)) if password == expected => {
                AuthDecision::Accept
            }
            _ => AuthDecision::Reject,
        }
    }
}

/// What the initiator presents when authenticating.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name.
    pub username: String,
    /// Method and credential.
    pub method: AuthMethod,
}

impl Credentials {
    /// Password credentials.
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            method: AuthMethod::Password {
                password: password.into(),
            },
        }
    }

    /// The `none` method, used to list methods or for passwordless accounts.
    pub fn none(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            method: AuthMethod::None,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("method", &self.method.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(username: &str, method: AuthMethod) -> AuthRequest {
        AuthRequest {
            username: username.to_string(),
            service: "shellwire-connection".to_string(),
            method,
            attempt: 1,
        }
    }

    #[test]
    fn test_reject_all() {
        let mut auth = RejectAll;
        assert_eq!(
            auth.authenticate(&request("root", AuthMethod::None)),
            AuthDecision::Reject
        );
    }

    #[test]
    fn test_closure_authenticator() {
        let mut seen = 0;
        let mut auth = |req: &AuthRequest| {
            seen += 1;
            if req.username == "alice" {
                AuthDecision::Accept
            } else {
                AuthDecision::Reject
            }
        };
        assert_eq!(
            auth.authenticate(&request("alice", AuthMethod::None)),
            AuthDecision::Accept
        );
        assert_eq!(
            auth.authenticate(&request("bob", AuthMethod::None)),
            AuthDecision::Reject
        );
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_password_table() {
        let mut table = PasswordTable::new([("alice", "secret")]);
        assert_eq!(table.len(), 1);

        let good = Credentials::password("alice", "secret");
        let bad = Credentials::password("alice", "guess");
        assert_eq!(
            table.authenticate(&request(&good.username, good.method)),
            AuthDecision::Accept
        );
        assert_eq!(
            table.authenticate(&request(&bad.username, bad.method)),
            AuthDecision::Reject
        );
        assert_eq!(
            table.authenticate(&request("alice", AuthMethod::None)),
            AuthDecision::Reject
        );
        assert_eq!(
            table.authenticate(&request("mallory", AuthMethod::None)),
            AuthDecision::Reject
        );
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let debug = format!("{:?}", Credentials::password("alice", "hunter2"));
        assert!(debug.contains("alice"));
        assert!(debug.contains("password"));
        assert!(!debug.contains("hunter2"));
    }
}
