// SPDX-License-Identifier: MIT OR Apache-2.0
//! Delegation issuance/revocation storage, with a shared default
//! `revoke_cascade` implementation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use asap_error::AsapError;
use asap_storage::SharedConnection;
use chrono::{DateTime, Utc};

use crate::MAX_CASCADE_DEPTH;

/// A summary of one token issued by a delegator, for listing endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedSummary {
    /// Token id.
    pub id: String,
    /// Delegate URN, if any.
    pub delegate_urn: Option<String>,
    /// Issuance time.
    pub created_at: DateTime<Utc>,
}

/// Full detail of one issued token, including revocation status.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenDetail {
    /// Token id.
    pub id: String,
    /// Delegator URN.
    pub delegator_urn: String,
    /// Delegate URN, if any.
    pub delegate_urn: Option<String>,
    /// Issuance time.
    pub created_at: DateTime<Utc>,
    /// Whether the token has been revoked.
    pub is_revoked: bool,
    /// Revocation time, if revoked.
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Tracks issued delegation tokens and their revocation state.
///
/// `revoke_cascade` has a single, shared implementation (an iterative
/// breadth-first walk bounded by [`MAX_CASCADE_DEPTH`]) built on top of the
/// other trait methods, matching the distilled system's storage interface.
#[async_trait]
pub trait DelegationStorage: Send + Sync {
    /// Mark `token_id` revoked, recording an optional human-readable
    /// `reason`.
    async fn revoke(&self, token_id: &str, reason: Option<&str>) -> Result<(), AsapError>;

    /// Whether `token_id` has been revoked.
    async fn is_revoked(&self, token_id: &str) -> Result<bool, AsapError>;

    /// Record that `token_id` was issued by `delegator_urn`, optionally to
    /// `delegate_urn`.
    async fn register_issued(
        &self,
        token_id: &str,
        delegator_urn: &str,
        delegate_urn: Option<&str>,
    ) -> Result<(), AsapError>;

    /// The delegator that issued `token_id`, if known.
    async fn get_delegator(&self, token_id: &str) -> Result<Option<String>, AsapError>;

    /// The delegate `token_id` was issued to, if any.
    async fn get_delegate(&self, token_id: &str) -> Result<Option<String>, AsapError>;

    /// All token ids issued by `delegator_urn`.
    async fn list_token_ids_issued_by(&self, delegator_urn: &str) -> Result<Vec<String>, AsapError>;

    /// Summaries of every token issued by `delegator_urn`.
    async fn list_issued_summaries(&self, delegator_urn: &str) -> Result<Vec<IssuedSummary>, AsapError>;

    /// When `token_id` was issued.
    async fn get_issued_at(&self, token_id: &str) -> Result<Option<DateTime<Utc>>, AsapError>;

    /// When `token_id` was revoked, if it was.
    async fn get_revoked_at(&self, token_id: &str) -> Result<Option<DateTime<Utc>>, AsapError>;

    /// Batched revocation check; one call per validator hot path instead
    /// of N.
    async fn are_revoked(&self, token_ids: &[String]) -> Result<HashMap<String, bool>, AsapError>;

    /// Full detail for `token_id`, or `None` if never issued.
    async fn get_token_detail(&self, token_id: &str) -> Result<Option<TokenDetail>, AsapError>;

    /// Revoke `token_id` and every descendant delegation reachable by
    /// following `delegate -> tokens they issued`, iteratively
    /// (breadth-first via an explicit stack, not recursion) so pathological
    /// or cyclic chains terminate. Bounded by [`MAX_CASCADE_DEPTH`].
    async fn revoke_cascade(&self, token_id: &str, reason: Option<&str>) -> Result<(), AsapError> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut stack: Vec<(String, u32)> = vec![(token_id.to_string(), 0)];

        while let Some((tid, depth)) = stack.pop() {
            if visited.contains(&tid) || depth > MAX_CASCADE_DEPTH {
                continue;
            }
            visited.insert(tid.clone());

            if let Some(delegate) = self.get_delegate(&tid).await? {
                for child in self.list_token_ids_issued_by(&delegate).await? {
                    stack.push((child, depth + 1));
                }
            }
            self.revoke(&tid, reason).await?;
        }
        Ok(())
    }
}

#[derive(Default, Clone)]
struct IssuedEntry {
    delegator_urn: String,
    delegate_urn: Option<String>,
    created_at: DateTime<Utc>,
}

/// In-memory [`DelegationStorage`] for tests and single-process
/// deployments.
#[derive(Default)]
pub struct InMemoryDelegationStorage {
    revoked: Mutex<BTreeMap<String, (DateTime<Utc>, Option<String>)>>,
    issued: Mutex<BTreeMap<String, IssuedEntry>>,
}

impl InMemoryDelegationStorage {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DelegationStorage for InMemoryDelegationStorage {
    async fn revoke(&self, token_id: &str, reason: Option<&str>) -> Result<(), AsapError> {
        self.revoked
            .lock()
            .unwrap()
            .insert(token_id.to_string(), (Utc::now(), reason.map(str::to_string)));
        Ok(())
    }

    async fn is_revoked(&self, token_id: &str) -> Result<bool, AsapError> {
        Ok(self.revoked.lock().unwrap().contains_key(token_id))
    }

    async fn register_issued(
        &self,
        token_id: &str,
        delegator_urn: &str,
        delegate_urn: Option<&str>,
    ) -> Result<(), AsapError> {
        self.issued.lock().unwrap().insert(
            token_id.to_string(),
            IssuedEntry {
                delegator_urn: delegator_urn.to_string(),
                delegate_urn: delegate_urn.map(str::to_string),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_delegator(&self, token_id: &str) -> Result<Option<String>, AsapError> {
        Ok(self.issued.lock().unwrap().get(token_id).map(|e| e.delegator_urn.clone()))
    }

    async fn get_delegate(&self, token_id: &str) -> Result<Option<String>, AsapError> {
        Ok(self.issued.lock().unwrap().get(token_id).and_then(|e| e.delegate_urn.clone()))
    }

    async fn list_token_ids_issued_by(&self, delegator_urn: &str) -> Result<Vec<String>, AsapError> {
        Ok(self
            .issued
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.delegator_urn == delegator_urn)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn list_issued_summaries(&self, delegator_urn: &str) -> Result<Vec<IssuedSummary>, AsapError> {
        Ok(self
            .issued
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.delegator_urn == delegator_urn)
            .map(|(id, e)| IssuedSummary {
                id: id.clone(),
                delegate_urn: e.delegate_urn.clone(),
                created_at: e.created_at,
            })
            .collect())
    }

    async fn get_issued_at(&self, token_id: &str) -> Result<Option<DateTime<Utc>>, AsapError> {
        Ok(self.issued.lock().unwrap().get(token_id).map(|e| e.created_at))
    }

    async fn get_revoked_at(&self, token_id: &str) -> Result<Option<DateTime<Utc>>, AsapError> {
        Ok(self.revoked.lock().unwrap().get(token_id).map(|(at, _)| *at))
    }

    async fn are_revoked(&self, token_ids: &[String]) -> Result<HashMap<String, bool>, AsapError> {
        let revoked = self.revoked.lock().unwrap();
        Ok(token_ids.iter().map(|t| (t.clone(), revoked.contains_key(t))).collect())
    }

    async fn get_token_detail(&self, token_id: &str) -> Result<Option<TokenDetail>, AsapError> {
        let Some(entry) = self.issued.lock().unwrap().get(token_id).cloned() else {
            return Ok(None);
        };
        let revoked = self.revoked.lock().unwrap().get(token_id).cloned();
        Ok(Some(TokenDetail {
            id: token_id.to_string(),
            delegator_urn: entry.delegator_urn,
            delegate_urn: entry.delegate_urn,
            created_at: entry.created_at,
            is_revoked: revoked.is_some(),
            revoked_at: revoked.map(|(at, _)| at),
        }))
    }
}

/// SQLite-backed [`DelegationStorage`]; durable across restarts, sharing
/// its connection with the snapshot and metering stores.
pub struct SqliteDelegationStorage {
    conn: SharedConnection,
}

impl SqliteDelegationStorage {
    /// Wrap a [`SharedConnection`] as a delegation store.
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl DelegationStorage for SqliteDelegationStorage {
    async fn revoke(&self, token_id: &str, reason: Option<&str>) -> Result<(), AsapError> {
        let token_id = token_id.to_string();
        let reason = reason.map(str::to_string);
        let now = Utc::now().to_rfc3339();
        self.conn
            .with(move |c| {
                c.execute(
                    "INSERT OR REPLACE INTO revocations (id, revoked_at, reason) VALUES (?1, ?2, ?3)",
                    rusqlite::params![token_id, now, reason],
                )?;
                Ok(())
            })
            .await
    }

    async fn is_revoked(&self, token_id: &str) -> Result<bool, AsapError> {
        let token_id = token_id.to_string();
        self.conn
            .with(move |c| {
                let exists: Option<i64> = c
                    .query_row("SELECT 1 FROM revocations WHERE id = ?1", rusqlite::params![token_id], |r| r.get(0))
                    .ok();
                Ok(exists.is_some())
            })
            .await
    }

    async fn register_issued(
        &self,
        token_id: &str,
        delegator_urn: &str,
        delegate_urn: Option<&str>,
    ) -> Result<(), AsapError> {
        let token_id = token_id.to_string();
        let delegator_urn = delegator_urn.to_string();
        let delegate_urn = delegate_urn.map(str::to_string);
        let now = Utc::now().to_rfc3339();
        self.conn
            .with(move |c| {
                c.execute(
                    "INSERT OR REPLACE INTO issued_delegations (id, delegator_urn, delegate_urn, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![token_id, delegator_urn, delegate_urn, now],
                )?;
                Ok(())
            })
            .await
    }

    async fn get_delegator(&self, token_id: &str) -> Result<Option<String>, AsapError> {
        let token_id = token_id.to_string();
        self.conn
            .with(move |c| {
                c.query_row(
                    "SELECT delegator_urn FROM issued_delegations WHERE id = ?1",
                    rusqlite::params![token_id],
                    |r| r.get(0),
                )
                .map(Some)
                .or_else(|e| if matches!(e, rusqlite::Error::QueryReturnedNoRows) { Ok(None) } else { Err(e) })
            })
            .await
    }

    async fn get_delegate(&self, token_id: &str) -> Result<Option<String>, AsapError> {
        let token_id = token_id.to_string();
        self.conn
            .with(move |c| {
                c.query_row(
                    "SELECT delegate_urn FROM issued_delegations WHERE id = ?1",
                    rusqlite::params![token_id],
                    |r| r.get::<_, Option<String>>(0),
                )
                .or_else(|e| if matches!(e, rusqlite::Error::QueryReturnedNoRows) { Ok(None) } else { Err(e) })
            })
            .await
    }

    async fn list_token_ids_issued_by(&self, delegator_urn: &str) -> Result<Vec<String>, AsapError> {
        let delegator_urn = delegator_urn.to_string();
        self.conn
            .with(move |c| {
                let mut stmt = c.prepare("SELECT id FROM issued_delegations WHERE delegator_urn = ?1")?;
                let rows = stmt.query_map(rusqlite::params![delegator_urn], |r| r.get(0))?;
                rows.collect::<rusqlite::Result<Vec<String>>>()
            })
            .await
    }

    async fn list_issued_summaries(&self, delegator_urn: &str) -> Result<Vec<IssuedSummary>, AsapError> {
        let delegator_urn = delegator_urn.to_string();
        self.conn
            .with(move |c| {
                let mut stmt = c.prepare(
                    "SELECT id, delegate_urn, created_at FROM issued_delegations
                     WHERE delegator_urn = ?1 ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map(rusqlite::params![delegator_urn], |r| {
                    let id: String = r.get(0)?;
                    let delegate_urn: Option<String> = r.get(1)?;
                    let created_at: String = r.get(2)?;
                    Ok((id, delegate_urn, created_at))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (id, delegate_urn, created_at) = row?;
                    out.push(IssuedSummary {
                        id,
                        delegate_urn,
                        created_at: parse_rfc3339(&created_at),
                    });
                }
                Ok(out)
            })
            .await
    }

    async fn get_issued_at(&self, token_id: &str) -> Result<Option<DateTime<Utc>>, AsapError> {
        let token_id = token_id.to_string();
        self.conn
            .with(move |c| {
                c.query_row(
                    "SELECT created_at FROM issued_delegations WHERE id = ?1",
                    rusqlite::params![token_id],
                    |r| r.get::<_, String>(0),
                )
                .map(|s| Some(parse_rfc3339(&s)))
                .or_else(|e| if matches!(e, rusqlite::Error::QueryReturnedNoRows) { Ok(None) } else { Err(e) })
            })
            .await
    }

    async fn get_revoked_at(&self, token_id: &str) -> Result<Option<DateTime<Utc>>, AsapError> {
        let token_id = token_id.to_string();
        self.conn
            .with(move |c| {
                c.query_row(
                    "SELECT revoked_at FROM revocations WHERE id = ?1",
                    rusqlite::params![token_id],
                    |r| r.get::<_, String>(0),
                )
                .map(|s| Some(parse_rfc3339(&s)))
                .or_else(|e| if matches!(e, rusqlite::Error::QueryReturnedNoRows) { Ok(None) } else { Err(e) })
            })
            .await
    }

    async fn are_revoked(&self, token_ids: &[String]) -> Result<HashMap<String, bool>, AsapError> {
        if token_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let ids = token_ids.to_vec();
        self.conn
            .with(move |c| {
                let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
                let sql = format!("SELECT id FROM revocations WHERE id IN ({placeholders})");
                let mut stmt = c.prepare(&sql)?;
                let params: Vec<&dyn rusqlite::ToSql> = ids.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
                let rows = stmt.query_map(params.as_slice(), |r| r.get::<_, String>(0))?;
                let revoked: HashSet<String> = rows.collect::<rusqlite::Result<_>>()?;
                Ok(ids.iter().map(|id| (id.clone(), revoked.contains(id))).collect())
            })
            .await
    }

    async fn get_token_detail(&self, token_id: &str) -> Result<Option<TokenDetail>, AsapError> {
        let token_id = token_id.to_string();
        self.conn
            .with(move |c| {
                let row = c.query_row(
                    "SELECT i.id, i.delegator_urn, i.delegate_urn, i.created_at, r.revoked_at
                     FROM issued_delegations i LEFT JOIN revocations r ON i.id = r.id
                     WHERE i.id = ?1",
                    rusqlite::params![token_id],
                    |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, Option<String>>(2)?,
                            r.get::<_, String>(3)?,
                            r.get::<_, Option<String>>(4)?,
                        ))
                    },
                );
                match row {
                    Ok((id, delegator_urn, delegate_urn, created_at, revoked_at)) => Ok(Some(TokenDetail {
                        id,
                        delegator_urn,
                        delegate_urn,
                        created_at: parse_rfc3339(&created_at),
                        is_revoked: revoked_at.is_some(),
                        revoked_at: revoked_at.map(|s| parse_rfc3339(&s)),
                    })),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await
    }
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn cascade_fixture(store: &dyn DelegationStorage) {
        store.register_issued("root", "urn:a", Some("urn:b")).await.unwrap();
        store.register_issued("child1", "urn:b", Some("urn:c")).await.unwrap();
        store.register_issued("child2", "urn:b", None).await.unwrap();
        store.register_issued("grandchild", "urn:c", None).await.unwrap();
    }

    #[tokio::test]
    async fn in_memory_revoke_cascade_reaches_all_descendants() {
        let store = InMemoryDelegationStorage::new();
        cascade_fixture(&store).await;
        store.revoke_cascade("root", Some("test")).await.unwrap();
        for id in ["root", "child1", "child2", "grandchild"] {
            assert!(store.is_revoked(id).await.unwrap(), "{id} should be revoked");
        }
    }

    #[tokio::test]
    async fn in_memory_revoke_cascade_terminates_on_cycle() {
        let store = InMemoryDelegationStorage::new();
        store.register_issued("a", "urn:x", Some("urn:y")).await.unwrap();
        store.register_issued("b", "urn:y", Some("urn:x")).await.unwrap();
        store.revoke_cascade("a", None).await.unwrap();
        assert!(store.is_revoked("a").await.unwrap());
        assert!(store.is_revoked("b").await.unwrap());
    }

    #[tokio::test]
    async fn in_memory_are_revoked_is_batched() {
        let store = InMemoryDelegationStorage::new();
        store.revoke("a", None).await.unwrap();
        let result = store.are_revoked(&["a".to_string(), "b".to_string()]).await.unwrap();
        assert_eq!(result.get("a"), Some(&true));
        assert_eq!(result.get("b"), Some(&false));
    }

    #[tokio::test]
    async fn sqlite_revoke_cascade_reaches_all_descendants() {
        let conn = SharedConnection::open_in_memory().unwrap();
        let store = SqliteDelegationStorage::new(conn);
        cascade_fixture(&store).await;
        store.revoke_cascade("root", Some("test")).await.unwrap();
        for id in ["root", "child1", "child2", "grandchild"] {
            assert!(store.is_revoked(id).await.unwrap(), "{id} should be revoked");
        }
    }

    #[tokio::test]
    async fn sqlite_token_detail_reports_revocation() {
        let conn = SharedConnection::open_in_memory().unwrap();
        let store = SqliteDelegationStorage::new(conn);
        store.register_issued("t1", "urn:a", Some("urn:b")).await.unwrap();
        assert!(!store.get_token_detail("t1").await.unwrap().unwrap().is_revoked);
        store.revoke("t1", Some("bye")).await.unwrap();
        let detail = store.get_token_detail("t1").await.unwrap().unwrap();
        assert!(detail.is_revoked);
        assert!(detail.revoked_at.is_some());
    }
}
