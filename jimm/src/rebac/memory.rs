//! In-memory relation backend.
//!
//! Authoritative for tests and single-node deployments; the OpenFGA backend
//! delegates the same closure to the remote engine. Reads dominate writes,
//! so the tuple set sits behind a read-write lock.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Error;
use crate::rebac::relation::{Relation, Tuple};
use crate::rebac::store::RelationBackend;
use crate::tag::{Kind, Tag};

/// Traversal bound for member and delegation edges. Relation graphs are
/// shallow in practice; the cap only exists to terminate on cycles.
const MAX_DEPTH: usize = 32;

#[derive(Default)]
pub struct MemoryBackend {
    tuples: RwLock<HashSet<Tuple>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expands a principal to the set of principal-shaped tags it speaks for:
    /// itself plus the member set of every group it belongs to, transitively.
    fn principal_closure(tuples: &HashSet<Tuple>, principal: &Tag) -> HashSet<Tag> {
        let mut closure = HashSet::from([principal.clone()]);
        let mut frontier = vec![principal.clone()];
        let mut depth = 0;

        while let Some(current) = frontier.pop() {
            depth += 1;
            if depth > MAX_DEPTH {
                break;
            }

            for tuple in tuples {
                if tuple.relation == Relation::Member && tuple.object == current && tuple.target.kind() == Kind::Group {
                    let member_set = tuple.target.member_set();
                    if closure.insert(member_set.clone()) {
                        frontier.push(member_set);
                    }
                }
            }
        }

        closure
    }

    fn check_closure(
        tuples: &HashSet<Tuple>,
        principals: &HashSet<Tag>,
        relation: Relation,
        target: &Tag,
        trace: bool,
        depth: usize,
    ) -> bool {
        if depth > MAX_DEPTH {
            return false;
        }

        for satisfying in relation.satisfied_by(target.kind()) {
            for tuple in tuples {
                if tuple.relation != *satisfying || tuple.target != *target {
                    continue;
                }

                if principals.contains(&tuple.object) {
                    if trace {
                        debug!(%tuple, "Check satisfied by direct tuple");
                    }
                    return true;
                }

                // A non-principal object delegates: whoever holds the tuple's
                // relation on the object holds it on the target too. This is
                // how "administrator on the controller administrates every
                // model it hosts" is encoded.
                if !tuple.object.is_principal()
                    && Self::check_closure(tuples, principals, tuple.relation, &tuple.object, trace, depth + 1)
                {
                    if trace {
                        debug!(%tuple, "Check satisfied through delegation edge");
                    }
                    return true;
                }
            }
        }

        false
    }
}

#[async_trait]
impl RelationBackend for MemoryBackend {
    async fn add(&self, tuples: &[Tuple]) -> Result<(), Error> {
        let mut guard = self.tuples.write();
        for tuple in tuples {
            guard.insert(tuple.clone());
        }
        Ok(())
    }

    async fn remove(&self, tuples: &[Tuple]) -> Result<(), Error> {
        let mut guard = self.tuples.write();
        for tuple in tuples {
            // Removing an absent tuple is not an error.
            guard.remove(tuple);
        }
        Ok(())
    }

    async fn check(&self, tuple: &Tuple, trace: bool) -> Result<bool, Error> {
        let tuples = self.tuples.read();
        let principals = Self::principal_closure(&tuples, &tuple.object);
        Ok(Self::check_closure(
            &tuples,
            &principals,
            tuple.relation,
            &tuple.target,
            trace,
            0,
        ))
    }

    async fn list_objects(&self, object: &Tag, relation: Relation, kind: Kind) -> Result<Vec<Tag>, Error> {
        let candidates: HashSet<Tag> = {
            let tuples = self.tuples.read();
            tuples
                .iter()
                .map(|tuple| &tuple.target)
                .filter(|target| target.kind() == kind)
                .cloned()
                .collect()
        };

        let mut objects = Vec::new();
        for candidate in candidates {
            let probe = Tuple::new(object.clone(), relation, candidate.clone());
            if self.check(&probe, false).await? {
                objects.push(candidate);
            }
        }

        Ok(objects)
    }
}
