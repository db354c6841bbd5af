//! Relation-based access control: the tuple store and the authorization
//! engine composed on top of it.

pub mod memory;
pub mod openfga;
pub mod relation;
pub mod store;

pub use relation::{Relation, Tuple};
pub use store::{RelationBackend, RelationStore};

use std::sync::Arc;

use crate::error::Error;
use crate::tag::{Kind, Tag};

/// The single point of truth for "may X do Y to Z?".
#[derive(Clone)]
pub struct Authorizer {
    store: RelationStore,
    /// Tag under which this gateway itself appears in the relation graph.
    jimm_tag: Tag,
}

impl Authorizer {
    pub fn new(store: RelationStore, jimm_tag: Tag) -> Self {
        Self { store, jimm_tag }
    }

    pub fn from_conf(conf: &crate::config::Conf) -> anyhow::Result<Self> {
        let backend: Arc<dyn RelationBackend> = match &conf.openfga {
            Some(openfga) => Arc::new(openfga::OpenFgaBackend::new(openfga)?),
            None => Arc::new(memory::MemoryBackend::new()),
        };

        Ok(Self::new(RelationStore::new(backend), conf.controller_tag.clone()))
    }

    pub fn store(&self) -> &RelationStore {
        &self.store
    }

    pub fn jimm_tag(&self) -> &Tag {
        &self.jimm_tag
    }

    /// Groups acting as principals are expanded to their member set before
    /// the store is consulted.
    fn as_principal(user: &Tag) -> Tag {
        if user.kind() == Kind::Group && !user.is_member_set() {
            user.member_set()
        } else {
            user.clone()
        }
    }

    pub async fn check(&self, user: &Tag, relation: Relation, target: &Tag) -> Result<bool, Error> {
        let tuple = Tuple::new(Self::as_principal(user), relation, target.clone());
        self.store.check_relation(&tuple, false).await
    }

    /// All targets of `kind` on which `user` holds at least `relation`.
    /// List operations use this to filter backend replies.
    pub async fn list_objects(&self, user: &Tag, relation: Relation, kind: Kind) -> Result<Vec<Tag>, Error> {
        self.store.list_objects(&Self::as_principal(user), relation, kind).await
    }

    /// Whether `user` holds the given wire access level on `target`.
    /// Unknown levels cannot be verified and answer false.
    pub async fn check_access_level(&self, user: &Tag, level: &str, target: &Tag) -> Result<bool, Error> {
        let Some(relation) = Relation::from_access_level(level) else {
            return Ok(false);
        };

        // "superuser" is only meaningful on controller tags.
        if level == "superuser" && target.kind() != Kind::Controller {
            return Ok(false);
        }

        self.check(user, relation, target).await
    }

    pub async fn is_jimm_admin(&self, user: &Tag) -> Result<bool, Error> {
        self.check(user, Relation::Administrator, &self.jimm_tag).await
    }

    /// Grants `relation` on `target`, gated by the actor's own administrator
    /// relation on the target.
    pub async fn grant(&self, actor: &Tag, object: &Tag, relation: Relation, target: &Tag) -> Result<(), Error> {
        self.ensure_administers(actor, target).await?;
        self.store
            .add_relation(&[Tuple::new(Self::as_principal(object), relation, target.clone())])
            .await
    }

    pub async fn revoke(&self, actor: &Tag, object: &Tag, relation: Relation, target: &Tag) -> Result<(), Error> {
        self.ensure_administers(actor, target).await?;
        self.store
            .remove_relation(&[Tuple::new(Self::as_principal(object), relation, target.clone())])
            .await
    }

    async fn ensure_administers(&self, actor: &Tag, target: &Tag) -> Result<(), Error> {
        let allowed = self.check(actor, Relation::Administrator, target).await? || self.is_jimm_admin(actor).await?;

        if allowed {
            Ok(())
        } else {
            Err(Error::unauthorized(format!("{actor} does not administer {target}")))
        }
    }

    /// Reconciles the configured controller admins to tuples: every admin
    /// missing the administrator relation on the gateway tag gets it added.
    pub async fn reconcile_admins(&self, admins: &[String]) -> Result<(), Error> {
        for admin in admins {
            let user = crate::auth::identity::user_tag_for(admin);

            if !self.check(&user, Relation::Administrator, &self.jimm_tag).await? {
                info!(%user, "Reconciling controller admin");
                self.store
                    .add_relation(&[Tuple::new(user, Relation::Administrator, self.jimm_tag.clone())])
                    .await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn authorizer() -> Authorizer {
        let backend = Arc::new(memory::MemoryBackend::new());
        Authorizer::new(
            RelationStore::new(backend),
            Tag::controller(Uuid::parse_str("11111111-1111-1111-1111-111111111111").expect("literal uuid")),
        )
    }

    fn alice() -> Tag {
        Tag::user("alice@canonical.com")
    }

    #[tokio::test]
    async fn reconcile_admins_is_idempotent() {
        let authorizer = authorizer();
        let admins = vec!["alice".to_owned()];

        authorizer.reconcile_admins(&admins).await.expect("reconcile");
        authorizer.reconcile_admins(&admins).await.expect("reconcile again");

        assert!(authorizer.is_jimm_admin(&alice()).await.expect("check"));
        assert!(
            !authorizer
                .is_jimm_admin(&Tag::user("bob@canonical.com"))
                .await
                .expect("check")
        );
    }

    #[tokio::test]
    async fn grant_requires_administrator_on_target() {
        let authorizer = authorizer();
        let model = Tag::model(Uuid::new_v4());
        let bob = Tag::user("bob@canonical.com");

        let denied = authorizer
            .grant(&alice(), &bob, Relation::Reader, &model)
            .await
            .expect_err("alice administers nothing yet");
        assert_eq!(denied.kind(), crate::error::ErrorKind::Unauthorized);

        authorizer
            .store()
            .add_relation(&[Tuple::new(alice(), Relation::Administrator, model.clone())])
            .await
            .expect("seed");

        authorizer
            .grant(&alice(), &bob, Relation::Reader, &model)
            .await
            .expect("alice administers the model now");
        assert!(authorizer.check(&bob, Relation::Reader, &model).await.expect("check"));

        authorizer
            .revoke(&alice(), &bob, Relation::Reader, &model)
            .await
            .expect("revoke");
        assert!(!authorizer.check(&bob, Relation::Reader, &model).await.expect("check"));
    }

    #[tokio::test]
    async fn check_access_level_maps_levels() {
        let authorizer = authorizer();
        let model = Tag::model(Uuid::new_v4());

        authorizer
            .store()
            .add_relation(&[
                Tuple::new(alice(), Relation::Administrator, authorizer.jimm_tag().clone()),
                Tuple::new(alice(), Relation::Writer, model.clone()),
            ])
            .await
            .expect("seed");

        assert!(
            authorizer
                .check_access_level(&alice(), "superuser", authorizer.jimm_tag())
                .await
                .expect("check")
        );
        assert!(authorizer.check_access_level(&alice(), "write", &model).await.expect("check"));
        assert!(authorizer.check_access_level(&alice(), "read", &model).await.expect("check"));
        assert!(!authorizer.check_access_level(&alice(), "admin", &model).await.expect("check"));
        assert!(
            !authorizer
                .check_access_level(&alice(), "superuser", &model)
                .await
                .expect("superuser is controller-scoped")
        );
        assert!(
            !authorizer
                .check_access_level(&alice(), "frobnicate", &model)
                .await
                .expect("unknown level")
        );
    }
}
