//! Requests the gateway answers itself instead of forwarding: relation
//! management spoken over the same WebSocket under its own facade type.

use serde::Deserialize;
use serde_json::Value;

use crate::error::Error;
use crate::proxy::rpc::RpcMessage;
use crate::rebac::{Authorizer, Relation, Tuple};
use crate::tag::Tag;

/// Facade type the gateway terminates locally.
pub const FACADE_TYPE: &str = "JIMM";

#[derive(Debug, Deserialize)]
struct WireTuple {
    object: String,
    relation: String,
    #[serde(rename = "target_object")]
    target: String,
}

impl WireTuple {
    fn parse(&self) -> Result<Tuple, Error> {
        let object: Tag = self
            .object
            .parse()
            .map_err(|e| Error::invalid("malformed object tag").with_source(e))?;
        let relation: Relation = self
            .relation
            .parse()
            .map_err(|e| Error::invalid("unknown relation").with_source(e))?;
        let target: Tag = self
            .target
            .parse()
            .map_err(|e| Error::invalid("malformed target tag").with_source(e))?;

        Ok(Tuple::new(object, relation, target))
    }
}

#[derive(Debug, Deserialize)]
struct TuplesParams {
    #[serde(default)]
    tuples: Vec<WireTuple>,
}

#[derive(Debug, Deserialize)]
struct TupleParams {
    tuple: WireTuple,
}

fn params<T: serde::de::DeserializeOwned>(request: &RpcMessage) -> Result<T, Error> {
    let value = request.params.clone().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| Error::invalid("malformed parameters").with_source(e))
}

/// Dispatches one locally terminated request on behalf of `principal`.
pub(super) async fn dispatch(
    authorizer: &Authorizer,
    principal: &Tag,
    request: &RpcMessage,
) -> Result<Value, Error> {
    match request.request.as_str() {
        "AddRelation" => {
            let params: TuplesParams = params(request)?;

            for wire in &params.tuples {
                let tuple = wire.parse()?;
                authorizer
                    .grant(principal, &tuple.object, tuple.relation, &tuple.target)
                    .await?;
            }

            Ok(Value::Object(serde_json::Map::new()))
        }
        "RemoveRelation" => {
            let params: TuplesParams = params(request)?;

            for wire in &params.tuples {
                let tuple = wire.parse()?;
                authorizer
                    .revoke(principal, &tuple.object, tuple.relation, &tuple.target)
                    .await?;
            }

            Ok(Value::Object(serde_json::Map::new()))
        }
        "CheckRelation" => {
            let params: TupleParams = params(request)?;
            let tuple = params.tuple.parse()?;

            // Admins may probe anything; everyone else only themself.
            if tuple.object != *principal && !authorizer.is_jimm_admin(principal).await? {
                return Err(Error::unauthorized("insufficient access to check relations"));
            }

            let allowed = authorizer
                .check(&tuple.object, tuple.relation, &tuple.target)
                .await?;

            Ok(serde_json::json!({ "allowed": allowed }))
        }
        unknown => Err(Error::unsupported(format!("unknown facade request: {unknown}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;
    use crate::rebac::RelationStore;
    use crate::rebac::memory::MemoryBackend;

    fn authorizer() -> Authorizer {
        Authorizer::new(
            RelationStore::new(Arc::new(MemoryBackend::new())),
            Tag::controller(Uuid::new_v4()),
        )
    }

    fn request(name: &str, params: Value) -> RpcMessage {
        RpcMessage {
            request_id: 1,
            type_: FACADE_TYPE.to_owned(),
            request: name.to_owned(),
            params: Some(params),
            ..RpcMessage::default()
        }
    }

    #[tokio::test]
    async fn add_check_remove_cycle() {
        let authorizer = authorizer();
        let admin = Tag::user("alice@canonical.com");
        authorizer
            .store()
            .add_relation(&[Tuple::new(
                admin.clone(),
                Relation::Administrator,
                authorizer.jimm_tag().clone(),
            )])
            .await
            .expect("seed admin");

        let grant = request(
            "AddRelation",
            serde_json::json!({"tuples": [{
                "object": "user-bob@canonical.com",
                "relation": "reader",
                "target_object": "model-m-1",
            }]}),
        );
        dispatch(&authorizer, &admin, &grant).await.expect("grant");

        let check = request(
            "CheckRelation",
            serde_json::json!({"tuple": {
                "object": "user-bob@canonical.com",
                "relation": "reader",
                "target_object": "model-m-1",
            }}),
        );
        let verdict = dispatch(&authorizer, &admin, &check).await.expect("check");
        assert_eq!(verdict["allowed"], true);

        let revoke = request(
            "RemoveRelation",
            serde_json::json!({"tuples": [{
                "object": "user-bob@canonical.com",
                "relation": "reader",
                "target_object": "model-m-1",
            }]}),
        );
        dispatch(&authorizer, &admin, &revoke).await.expect("revoke");

        let verdict = dispatch(&authorizer, &admin, &check).await.expect("check");
        assert_eq!(verdict["allowed"], false);
    }

    #[tokio::test]
    async fn non_admins_cannot_mutate_or_probe_others() {
        let authorizer = authorizer();
        let bob = Tag::user("bob@canonical.com");

        let grant = request(
            "AddRelation",
            serde_json::json!({"tuples": [{
                "object": "user-bob@canonical.com",
                "relation": "administrator",
                "target_object": "model-m-1",
            }]}),
        );
        let error = dispatch(&authorizer, &bob, &grant).await.expect_err("denied");
        assert_eq!(error.kind(), crate::error::ErrorKind::Unauthorized);

        // Probing someone else's relation is an admin operation.
        let check = request(
            "CheckRelation",
            serde_json::json!({"tuple": {
                "object": "user-eve@canonical.com",
                "relation": "reader",
                "target_object": "model-m-1",
            }}),
        );
        let error = dispatch(&authorizer, &bob, &check).await.expect_err("denied");
        assert_eq!(error.kind(), crate::error::ErrorKind::Unauthorized);

        // A self-check is always allowed.
        let check = request(
            "CheckRelation",
            serde_json::json!({"tuple": {
                "object": "user-bob@canonical.com",
                "relation": "reader",
                "target_object": "model-m-1",
            }}),
        );
        let verdict = dispatch(&authorizer, &bob, &check).await.expect("self check");
        assert_eq!(verdict["allowed"], false);
    }

    #[tokio::test]
    async fn malformed_tuples_are_invalid_input() {
        let authorizer = authorizer();
        let admin = Tag::user("alice@canonical.com");

        let grant = request(
            "AddRelation",
            serde_json::json!({"tuples": [{
                "object": "bob",
                "relation": "reader",
                "target_object": "model-m-1",
            }]}),
        );
        let error = dispatch(&authorizer, &admin, &grant).await.expect_err("malformed");
        assert_eq!(error.kind(), crate::error::ErrorKind::InvalidInput);
    }
}
