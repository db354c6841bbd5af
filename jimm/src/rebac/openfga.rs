//! OpenFGA relation backend.
//!
//! The authorization model mirroring the relation vocabulary is installed
//! out of band; this client only reads and writes tuples and delegates the
//! graph closure to the engine.

use async_trait::async_trait;
use secrecy::ExposeSecret as _;
use serde::Deserialize;
use url::Url;

use crate::config::dto::OpenFgaConf;
use crate::error::Error;
use crate::rebac::relation::{Relation, Tuple};
use crate::rebac::store::RelationBackend;
use crate::tag::{Kind, Tag};

pub struct OpenFgaBackend {
    client: reqwest::Client,
    store_url: Url,
    auth_model: String,
    token: Option<String>,
}

impl OpenFgaBackend {
    pub fn new(conf: &OpenFgaConf) -> anyhow::Result<Self> {
        use anyhow::Context as _;

        let store_url = format!(
            "{}://{}:{}/stores/{}/",
            conf.scheme, conf.host, conf.port, conf.store
        )
        .parse::<Url>()
        .context("invalid OpenFGA parameters")?;

        Ok(Self {
            client: reqwest::Client::new(),
            store_url,
            auth_model: conf.auth_model.clone(),
            token: conf.token.as_ref().map(|token| token.expose_secret().to_owned()),
        })
    }

    fn endpoint(&self, name: &str) -> Url {
        self.store_url.join(name).expect("endpoint names are valid URL segments")
    }

    async fn post(&self, endpoint: &str, body: serde_json::Value) -> Result<reqwest::Response, Error> {
        let mut request = self.client.post(self.endpoint(endpoint)).json(&body);

        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::unavailable("relation store unreachable").with_source(e))?;

        Ok(response)
    }

    /// OpenFGA speaks `kind:id`, tags speak `kind-id`; the `#member` suffix
    /// passes through untouched.
    fn tag_to_openfga(tag: &Tag) -> String {
        let mut s = format!("{}:{}", tag.kind(), tag.id());
        if tag.is_member_set() {
            s.push_str(crate::tag::MEMBER_SUFFIX);
        }
        s
    }

    fn openfga_to_tag(s: &str) -> Result<Tag, Error> {
        let (kind, rest) = s
            .split_once(':')
            .ok_or_else(|| Error::internal(format!("malformed OpenFGA object: {s}")))?;

        format!("{kind}-{rest}")
            .parse::<Tag>()
            .map_err(|e| Error::internal("malformed OpenFGA object").with_source(e))
    }

    fn tuple_key(tuple: &Tuple) -> serde_json::Value {
        serde_json::json!({
            "user": Self::tag_to_openfga(&tuple.object),
            "relation": tuple.relation.as_str(),
            "object": Self::tag_to_openfga(&tuple.target),
        })
    }
}

#[derive(Deserialize)]
struct CheckResponse {
    #[serde(default)]
    allowed: bool,
}

#[derive(Deserialize)]
struct ListObjectsResponse {
    #[serde(default)]
    objects: Vec<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[async_trait]
impl RelationBackend for OpenFgaBackend {
    async fn add(&self, tuples: &[Tuple]) -> Result<(), Error> {
        if tuples.is_empty() {
            return Ok(());
        }

        let body = serde_json::json!({
            "writes": { "tuple_keys": tuples.iter().map(Self::tuple_key).collect::<Vec<_>>() },
            "authorization_model_id": self.auth_model,
        });

        let response = self.post("write", body).await?;

        if response.status().is_success() {
            return Ok(());
        }

        let error: ErrorResponse = response.json().await.unwrap_or_else(|_| ErrorResponse {
            code: String::new(),
            message: String::new(),
        });

        // Re-adding an existing tuple keeps set semantics.
        if error.message.contains("already exists") {
            return Ok(());
        }

        Err(Error::unavailable(format!("write failed: {} {}", error.code, error.message)))
    }

    async fn remove(&self, tuples: &[Tuple]) -> Result<(), Error> {
        if tuples.is_empty() {
            return Ok(());
        }

        let body = serde_json::json!({
            "deletes": { "tuple_keys": tuples.iter().map(Self::tuple_key).collect::<Vec<_>>() },
            "authorization_model_id": self.auth_model,
        });

        let response = self.post("write", body).await?;

        if response.status().is_success() {
            return Ok(());
        }

        let error: ErrorResponse = response.json().await.unwrap_or_else(|_| ErrorResponse {
            code: String::new(),
            message: String::new(),
        });

        // Deleting an absent tuple is not an error.
        if error.message.contains("did not exist") {
            return Ok(());
        }

        Err(Error::unavailable(format!("delete failed: {} {}", error.code, error.message)))
    }

    async fn check(&self, tuple: &Tuple, trace: bool) -> Result<bool, Error> {
        let body = serde_json::json!({
            "tuple_key": Self::tuple_key(tuple),
            "authorization_model_id": self.auth_model,
            "trace": trace,
        });

        let response = self.post("check", body).await?;

        if !response.status().is_success() {
            return Err(Error::unavailable(format!("check failed with {}", response.status())));
        }

        let check: CheckResponse = response
            .json()
            .await
            .map_err(|e| Error::internal("malformed check response").with_source(e))?;

        if trace {
            debug!(%tuple, allowed = check.allowed, "Relation check");
        }

        Ok(check.allowed)
    }

    async fn list_objects(&self, object: &Tag, relation: Relation, kind: Kind) -> Result<Vec<Tag>, Error> {
        let body = serde_json::json!({
            "user": Self::tag_to_openfga(object),
            "relation": relation.as_str(),
            "type": kind.as_str(),
            "authorization_model_id": self.auth_model,
        });

        let response = self.post("list-objects", body).await?;

        if !response.status().is_success() {
            return Err(Error::unavailable(format!(
                "list-objects failed with {}",
                response.status()
            )));
        }

        let list: ListObjectsResponse = response
            .json()
            .await
            .map_err(|e| Error::internal("malformed list-objects response").with_source(e))?;

        list.objects.iter().map(|object| Self::openfga_to_tag(object)).collect()
    }
}
