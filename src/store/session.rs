use std::time::SystemTime;

use rusqlite::{params, OptionalExtension};
use tracing::instrument;

use crate::error::FsResult;
use crate::store::entry::{from_seconds, to_seconds};
use crate::store::MetadataStore;

/// OAuth credential of the mounted account.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthSession {
    pub token_type: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expiry: SystemTime,
}

impl AuthSession {
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expiry <= now
    }
}

/// Opaque position in the remote change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeCursor(String);

impl ChangeCursor {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ChangeCursor {
    fn from(value: String) -> Self {
        ChangeCursor(value)
    }
}

impl From<&str> for ChangeCursor {
    fn from(value: &str) -> Self {
        ChangeCursor(value.to_string())
    }
}

impl std::fmt::Display for ChangeCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl MetadataStore {
    #[instrument(skip(self))]
    pub fn load_auth_session(&self) -> FsResult<Option<AuthSession>> {
        self.read(|conn| {
            let session = conn
                .query_row(
                    "SELECT token_type, access_token, refresh_token, expiry
                     FROM auth_session WHERE id = 1",
                    [],
                    |row| {
                        Ok(AuthSession {
                            token_type: row.get(0)?,
                            access_token: row.get(1)?,
                            refresh_token: row.get(2)?,
                            expiry: from_seconds(row.get(3)?),
                        })
                    },
                )
                .optional()?;
            Ok(session)
        })
    }

    #[instrument(skip(self, session))]
    pub fn save_auth_session(&self, session: &AuthSession) -> FsResult<()> {
        self.write(|conn| {
            conn.execute(
                "INSERT INTO auth_session (id, token_type, access_token, refresh_token, expiry)
                 VALUES (1, ?1, ?2, ?3, ?4)
                 ON CONFLICT (id) DO UPDATE SET
                    token_type = excluded.token_type,
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    expiry = excluded.expiry",
                params![
                    session.token_type,
                    session.access_token,
                    session.refresh_token,
                    to_seconds(session.expiry)
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self))]
    pub fn load_change_cursor(&self) -> FsResult<Option<ChangeCursor>> {
        self.read(|conn| {
            let token: Option<String> = conn
                .query_row("SELECT token FROM change_cursor WHERE id = 1", [], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(token.map(ChangeCursor::from))
        })
    }

    #[instrument(skip(self))]
    pub fn save_change_cursor(&self, cursor: &ChangeCursor) -> FsResult<()> {
        self.write(|conn| {
            conn.execute(
                "INSERT INTO change_cursor (id, token) VALUES (1, ?1)
                 ON CONFLICT (id) DO UPDATE SET token = excluded.token",
                params![cursor.as_str()],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    #[test]
    fn session_and_cursor_survive_reopen() {
        crate::tests::init_logs();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drivefs.db");
        let session = AuthSession {
            token_type: "Bearer".into(),
            access_token: "access".into(),
            refresh_token: "refresh".into(),
            expiry: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        };
        {
            let store = MetadataStore::open(&path).unwrap();
            assert_eq!(None, store.load_auth_session().unwrap());
            assert_eq!(None, store.load_change_cursor().unwrap());
            store.save_auth_session(&session).unwrap();
            store.save_change_cursor(&"41".into()).unwrap();
            store.save_change_cursor(&"42".into()).unwrap();
        }
        let store = MetadataStore::open(&path).unwrap();
        assert_eq!(Some(session), store.load_auth_session().unwrap());
        assert_eq!(
            Some(ChangeCursor::from("42")),
            store.load_change_cursor().unwrap()
        );
    }

    #[test]
    fn expiry_is_inclusive() {
        let now = SystemTime::now();
        let session = AuthSession {
            token_type: "Bearer".into(),
            access_token: String::new(),
            refresh_token: String::new(),
            expiry: now,
        };
        assert!(session.is_expired(now));
        assert!(!session.is_expired(now - Duration::from_secs(1)));
    }
}
