use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, retry_unavailable};
use crate::rebac::relation::{Relation, Tuple};
use crate::tag::{Kind, Tag};

/// Persistence seam for relation tuples.
#[async_trait]
pub trait RelationBackend: Send + Sync {
    async fn add(&self, tuples: &[Tuple]) -> Result<(), Error>;
    async fn remove(&self, tuples: &[Tuple]) -> Result<(), Error>;
    async fn check(&self, tuple: &Tuple, trace: bool) -> Result<bool, Error>;
    async fn list_objects(&self, object: &Tag, relation: Relation, kind: Kind) -> Result<Vec<Tag>, Error>;
}

/// The relation store: tuple validation and availability retries in front of
/// whichever backend the deployment runs.
#[derive(Clone)]
pub struct RelationStore {
    backend: Arc<dyn RelationBackend>,
}

impl RelationStore {
    pub fn new(backend: Arc<dyn RelationBackend>) -> Self {
        Self { backend }
    }

    fn validate(tuple: &Tuple) -> Result<(), Error> {
        if tuple.relation == Relation::Member && tuple.target.kind() != Kind::Group {
            return Err(Error::invalid(format!(
                "member relation requires a group target, got {}",
                tuple.target,
            )));
        }

        if tuple.target.is_member_set() {
            return Err(Error::invalid(format!(
                "member sets cannot be relation targets: {}",
                tuple.target,
            )));
        }

        Ok(())
    }

    pub async fn add_relation(&self, tuples: &[Tuple]) -> Result<(), Error> {
        for tuple in tuples {
            Self::validate(tuple)?;
        }

        retry_unavailable(|| self.backend.add(tuples)).await
    }

    pub async fn remove_relation(&self, tuples: &[Tuple]) -> Result<(), Error> {
        retry_unavailable(|| self.backend.remove(tuples)).await
    }

    pub async fn check_relation(&self, tuple: &Tuple, trace: bool) -> Result<bool, Error> {
        Self::validate(tuple)?;
        retry_unavailable(|| self.backend.check(tuple, trace)).await
    }

    pub async fn list_objects(&self, object: &Tag, relation: Relation, kind: Kind) -> Result<Vec<Tag>, Error> {
        retry_unavailable(|| self.backend.list_objects(object, relation, kind)).await
    }
}
