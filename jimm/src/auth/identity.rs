use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::Error;
use crate::rebac::{Authorizer, Relation};
use crate::tag::{Kind, Tag};

pub const SERVICE_ACCOUNT_DOMAIN: &str = "serviceaccount";
const DEFAULT_DOMAIN: &str = "canonical.com";

/// Normalizes an externally supplied username:
/// `bob` → `bob@canonical.com`, a bare client UUID → `<uuid>@serviceaccount`,
/// anything already carrying a domain is untouched.
pub fn normalize_username(name: &str) -> String {
    if name.contains('@') {
        return name.to_owned();
    }

    if Uuid::parse_str(name).is_ok() {
        return format!("{name}@{SERVICE_ACCOUNT_DOMAIN}");
    }

    format!("{name}@{DEFAULT_DOMAIN}")
}

/// Principal tag for an external name, after normalization.
pub fn user_tag_for(name: &str) -> Tag {
    let normalized = normalize_username(name);

    if normalized.ends_with(&format!("@{SERVICE_ACCOUNT_DOMAIN}")) {
        Tag::service_account(normalized)
    } else {
        Tag::user(normalized)
    }
}

/// Internal identity record, interned on first sight.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: u64,
    pub name: String,
    pub tag: Tag,
    pub created_at: OffsetDateTime,
    pub last_login: Option<OffsetDateTime>,
    pub disabled: bool,
}

/// Maps verified external identities to internal records and resolves group
/// memberships through the relation graph.
#[derive(Clone)]
pub struct IdentityResolver {
    inner: Arc<RwLock<HashMap<String, Identity>>>,
    next_id: Arc<AtomicU64>,
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Returns the identity for a verified external name, creating the
    /// record on first sight and stamping the login time.
    pub fn resolve(&self, external_name: &str) -> Result<Identity, Error> {
        let name = normalize_username(external_name);
        let now = OffsetDateTime::now_utc();

        let mut identities = self.inner.write();

        let identity = identities.entry(name.clone()).or_insert_with(|| {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            debug!(%name, id, "Interning new identity");

            Identity {
                id,
                tag: user_tag_for(&name),
                name,
                created_at: now,
                last_login: None,
                disabled: false,
            }
        });

        if identity.disabled {
            return Err(Error::unauthorized(format!("{} is disabled", identity.name)));
        }

        identity.last_login = Some(now);

        Ok(identity.clone())
    }

    pub fn lookup(&self, external_name: &str) -> Option<Identity> {
        self.inner.read().get(&normalize_username(external_name)).cloned()
    }

    pub fn set_disabled(&self, external_name: &str, disabled: bool) -> Result<(), Error> {
        let name = normalize_username(external_name);
        let mut identities = self.inner.write();

        let identity = identities
            .get_mut(&name)
            .ok_or_else(|| Error::not_found(format!("unknown identity {name}")))?;

        identity.disabled = disabled;
        Ok(())
    }

    /// Groups the identity belongs to, from `(user, member, group)` tuples.
    pub async fn groups(&self, authorizer: &Authorizer, identity: &Identity) -> Result<Vec<Tag>, Error> {
        authorizer
            .list_objects(&identity.tag, Relation::Member, Kind::Group)
            .await
    }
}
