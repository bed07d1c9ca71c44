//! Domain block filter
//!
//! Drops activities whose actors live on an operator-blocked domain.
//! The blocked set is a snapshot published through a `watch` channel and
//! reloaded from the database by [`DomainBlockRefresher`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::activity::Activity;
use crate::data::Database;
use crate::error::AppError;

/// Immutable set of blocked domains (lowercased)
#[derive(Debug, Clone, Default)]
pub struct BlockedDomainSet {
    domains: HashSet<String>,
}

impl BlockedDomainSet {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|d| d.as_ref().trim().to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    fn contains(&self, candidate: &str) -> bool {
        self.domains.contains(candidate)
    }
}

fn format_authority_host(host: &str) -> String {
    let bare_host = host.trim_start_matches('[').trim_end_matches(']');
    if bare_host.contains(':') {
        format!("[{}]", bare_host)
    } else {
        bare_host.to_string()
    }
}

fn push_unique_domain_candidate(candidates: &mut Vec<String>, candidate: String) {
    if !candidate.is_empty() && !candidates.contains(&candidate) {
        candidates.push(candidate);
    }
}

/// Block-list keys an actor URI can match: `host`, and `host:port` when the port is explicit.
fn actor_domains_for_blocklist(actor_uri: &str) -> Vec<String> {
    let mut candidates = Vec::new();

    let Ok(parsed) = url::Url::parse(actor_uri) else {
        return candidates;
    };
    let Some(host) = parsed.host_str() else {
        return candidates;
    };

    let normalized_host = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    push_unique_domain_candidate(&mut candidates, normalized_host.clone());

    if normalized_host.contains(':') {
        let bracketed_host = format_authority_host(&normalized_host);
        push_unique_domain_candidate(&mut candidates, bracketed_host.clone());
        if let Some(port) = parsed.port() {
            push_unique_domain_candidate(&mut candidates, format!("{}:{}", bracketed_host, port));
        }
        return candidates;
    }

    if let Some(port) = parsed.port() {
        push_unique_domain_candidate(&mut candidates, format!("{}:{}", normalized_host, port));
    }

    candidates
}

/// Read side of the blocked-domain snapshot
#[derive(Debug, Clone)]
pub struct DomainBlockFilter {
    snapshot: watch::Receiver<Arc<BlockedDomainSet>>,
}

impl DomainBlockFilter {
    pub fn new(snapshot: watch::Receiver<Arc<BlockedDomainSet>>) -> Self {
        Self { snapshot }
    }

    /// Filter over a fixed list, without a refresher
    pub fn fixed<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (_tx, rx) = watch::channel(Arc::new(BlockedDomainSet::new(domains)));
        Self::new(rx)
    }

    /// Whether any actor of the activity is on a blocked domain.
    ///
    /// When no actor URI yields a host the activity is let through.
    pub fn is_blocked(&self, activity: &Activity) -> bool {
        let blocked = self.snapshot.borrow().clone();
        let mut any_parsed = false;

        for actor in &activity.actor {
            let candidates = actor_domains_for_blocklist(actor);
            if candidates.is_empty() {
                continue;
            }
            any_parsed = true;
            if let Some(domain) = candidates.iter().find(|c| blocked.contains(c)) {
                tracing::info!(
                    activity_id = %activity.id,
                    actor = %actor,
                    domain = %domain,
                    "Activity from blocked domain"
                );
                return true;
            }
        }

        if !any_parsed {
            tracing::warn!(
                activity_id = %activity.id,
                actors = ?activity.actor,
                "No actor URI could be resolved to a host; not filtering"
            );
        }

        false
    }
}

/// Reloads the blocked-domain snapshot from the database
pub struct DomainBlockRefresher {
    db: Arc<Database>,
    sender: watch::Sender<Arc<BlockedDomainSet>>,
}

impl DomainBlockRefresher {
    pub fn new(db: Arc<Database>) -> Self {
        let (sender, _rx) = watch::channel(Arc::new(BlockedDomainSet::default()));
        Self { db, sender }
    }

    /// A filter that observes every published snapshot
    pub fn filter(&self) -> DomainBlockFilter {
        DomainBlockFilter::new(self.sender.subscribe())
    }

    /// Load the block list and publish it. Returns the number of blocked domains.
    pub async fn refresh(&self) -> Result<usize, AppError> {
        let domains = self.db.get_blocked_domains().await?;
        let set = BlockedDomainSet::new(domains);
        let count = set.len();
        self.sender.send_replace(Arc::new(set));
        tracing::debug!(count, "Blocked domain snapshot refreshed");
        Ok(count)
    }

    /// Refresh every `interval` until `shutdown` flips to true.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.refresh().await {
                            tracing::error!(error = %e, "Failed to refresh blocked domains");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn activity_from(actor: serde_json::Value) -> Activity {
        Activity::try_from(json!({
            "id": "https://x.example/activities/1",
            "type": "Follow",
            "actor": actor,
            "object": "https://photos.example/actors/bob"
        }))
        .expect("activity parses")
    }

    #[test]
    fn blocks_exact_host_case_insensitively() {
        let filter = DomainBlockFilter::fixed(["Bad.Example"]);
        assert!(filter.is_blocked(&activity_from(json!("https://BAD.example/users/x"))));
        assert!(!filter.is_blocked(&activity_from(json!("https://good.example/users/x"))));
    }

    #[test]
    fn subdomains_are_not_blocked_by_parent_entry() {
        let filter = DomainBlockFilter::fixed(["bad.example"]);
        assert!(!filter.is_blocked(&activity_from(json!("https://sub.bad.example/users/x"))));
    }

    #[test]
    fn any_blocked_actor_blocks_the_activity() {
        let filter = DomainBlockFilter::fixed(["bad.example"]);
        let activity = activity_from(json!([
            "https://good.example/users/a",
            "https://bad.example/users/b"
        ]));
        assert!(filter.is_blocked(&activity));
    }

    #[test]
    fn explicit_port_matches_host_and_host_port_entries() {
        let by_host = DomainBlockFilter::fixed(["bad.example"]);
        let by_port = DomainBlockFilter::fixed(["bad.example:8443"]);
        let other_port = DomainBlockFilter::fixed(["bad.example:9999"]);
        let activity = activity_from(json!("https://bad.example:8443/users/x"));

        assert!(by_host.is_blocked(&activity));
        assert!(by_port.is_blocked(&activity));
        assert!(!other_port.is_blocked(&activity));
    }

    #[test]
    fn unparseable_actor_fails_open() {
        let filter = DomainBlockFilter::fixed(["bad.example"]);
        assert!(!filter.is_blocked(&activity_from(json!("not a uri"))));
    }

    #[test]
    fn ipv6_actor_hosts_produce_bracketed_candidates() {
        let candidates = actor_domains_for_blocklist("https://[2001:db8::1]:8443/users/x");
        assert!(candidates.contains(&"2001:db8::1".to_string()));
        assert!(candidates.contains(&"[2001:db8::1]:8443".to_string()));
    }

    #[tokio::test]
    async fn refresher_publishes_database_changes() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let db = Arc::new(
            Database::connect(&dir.path().join("test.db"))
                .await
                .expect("database"),
        );
        let refresher = DomainBlockRefresher::new(db.clone());
        let filter = refresher.filter();
        let activity = activity_from(json!("https://bad.example/users/x"));

        assert!(!filter.is_blocked(&activity));

        db.block_domain("bad.example", Some("spam")).await.expect("block");
        assert_eq!(refresher.refresh().await.expect("refresh"), 1);
        assert!(filter.is_blocked(&activity));

        db.unblock_domain("bad.example").await.expect("unblock");
        refresher.refresh().await.expect("refresh");
        assert!(!filter.is_blocked(&activity));
    }
}
