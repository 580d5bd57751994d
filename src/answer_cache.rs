//! Short-TTL answer cache
//!
//! Caches a previously computed protocol answer per `(query name, address
//! family)` key so the query-handling front end does not invoke the
//! upstream resolver on every request. A stale entry whose refresh attempt
//! fails keeps serving the last good answer rather than surfacing an error.
//!
//! Backed by a capacity-bounded `moka` cache, so memory does not grow
//! without bound with the number of distinct query names ever seen.
//! Staleness is checked manually against the injected clock; the cache
//! itself never expires entries, it only evicts on capacity pressure.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use moka::sync::Cache;
use tracing::warn;

use crate::clock::Clock;

/// Cache key: query name plus address family
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnswerKey {
    /// Query name
    pub name: String,
    /// Address family discriminator (e.g. 1 for IPv4, 2 for IPv6)
    pub family: u8,
}

impl AnswerKey {
    /// Create a key from a name and family
    #[must_use]
    pub fn new(name: impl Into<String>, family: u8) -> Self {
        Self {
            name: name.into(),
            family,
        }
    }
}

/// One cached answer with its refresh timestamp
#[derive(Debug, Clone)]
struct CachedAnswer<A> {
    answer: A,
    last_update_millis: i64,
}

/// Capacity-bounded cache of computed answers with a short TTL
///
/// Generic over the answer type so the protocol front end decides what an
/// answer is; this crate only manages freshness and eviction.
pub struct AnswerCache<A> {
    cache: Cache<AnswerKey, CachedAnswer<A>>,
    ttl_millis: i64,
    clock: Arc<dyn Clock>,
}

impl<A: Clone + Send + Sync + 'static> AnswerCache<A> {
    /// Create a cache holding at most `capacity` answers, each fresh for
    /// `ttl_millis` after its last successful update
    #[must_use]
    pub fn new(capacity: u64, ttl_millis: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: Cache::new(capacity),
            ttl_millis,
            clock,
        }
    }

    /// Look up `key`, refreshing through `fetch_upstream` when stale
    ///
    /// - Fresh hit: the cached answer is returned unchanged, upstream is
    ///   not invoked.
    /// - Stale hit: upstream is invoked; only a `Some` result overwrites
    ///   the entry and its timestamp. A failed refresh returns the stale
    ///   answer; the last good answer beats an error.
    /// - Miss: upstream is invoked and any `Some` result is inserted.
    pub async fn lookup_or_refresh<F, Fut>(&self, key: &AnswerKey, fetch_upstream: F) -> Option<A>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<A>>,
    {
        let now = self.clock.now_millis();

        if let Some(entry) = self.cache.get(key) {
            if now - entry.last_update_millis < self.ttl_millis {
                return Some(entry.answer);
            }

            return match fetch_upstream().await {
                Some(answer) => {
                    self.cache.insert(
                        key.clone(),
                        CachedAnswer {
                            answer: answer.clone(),
                            last_update_millis: now,
                        },
                    );
                    Some(answer)
                }
                None => {
                    warn!("upstream refresh failed for {}, serving stale answer", key.name);
                    Some(entry.answer)
                }
            };
        }

        let answer = fetch_upstream().await?;
        self.cache.insert(
            key.clone(),
            CachedAnswer {
                answer: answer.clone(),
                last_update_millis: now,
            },
        );
        Some(answer)
    }

    /// Number of cached answers (approximate under concurrency)
    #[must_use]
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
