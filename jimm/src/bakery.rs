//! Macaroon bakery used by the third-party caveat discharger and the legacy
//! login flow.
//!
//! Macaroons are HMAC-SHA256 chains: the signature starts from the root key
//! over the identifier and is folded over each caveat in order. The root key
//! is distinct from the JWKS material because macaroons serve a different
//! trust chain (backends verifying this gateway as a third party) and their
//! format predates JWT.

use core::fmt;
use std::str::FromStr;
use std::time::Duration;

use hmac::{Hmac, Mac as _};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use zeroize::Zeroizing;

use crate::error::Error;
use crate::rebac::Relation;
use crate::secrets::CredentialStore;
use crate::tag::Tag;

type HmacSha256 = Hmac<Sha256>;

const DECLARED_PREFIX: &str = "declared ";
const TIME_BEFORE_PREFIX: &str = "time-before ";

fn chain(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Macaroon {
    pub location: String,
    pub id: String,
    #[serde(default)]
    pub caveats: Vec<String>,
    #[serde(with = "hex_signature")]
    pub signature: [u8; 32],
}

mod hex_signature {
    use serde::{Deserialize as _, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(signature: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(signature))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 32 bytes"))
    }
}

/// A third-party caveat condition, `is-<relation> <user-tag> <object-tag>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThirdPartyCondition {
    pub relation: Relation,
    pub user: Tag,
    pub object: Tag,
}

/// Any parse failure collapses to this one error so the discharger can
/// answer `caveat not recognized` uniformly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("caveat not recognized")]
pub struct CaveatNotRecognized;

impl FromStr for ThirdPartyCondition {
    type Err = CaveatNotRecognized;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split(' ');

        let head = tokens.next().ok_or(CaveatNotRecognized)?;
        let user = tokens.next().ok_or(CaveatNotRecognized)?;
        let object = tokens.next().ok_or(CaveatNotRecognized)?;

        if tokens.next().is_some() {
            return Err(CaveatNotRecognized);
        }

        let relation = head.strip_prefix("is-").ok_or(CaveatNotRecognized)?;

        Ok(ThirdPartyCondition {
            relation: relation.parse().map_err(|_| CaveatNotRecognized)?,
            user: user.parse().map_err(|_| CaveatNotRecognized)?,
            object: object.parse().map_err(|_| CaveatNotRecognized)?,
        })
    }
}

impl fmt::Display for ThirdPartyCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "is-{} {} {}", self.relation, self.user, self.object)
    }
}

pub struct Bakery {
    root_key: Zeroizing<Vec<u8>>,
    location: String,
    discharge_lifetime: Duration,
}

impl Bakery {
    /// Loads the bakery root key from the credential store, generating and
    /// persisting a fresh one on first start.
    pub async fn load_or_generate(
        store: &dyn CredentialStore,
        location: String,
        discharge_lifetime: Duration,
    ) -> Result<Self, Error> {
        let root_key = match store.bakery_root_key().await? {
            Some(key) => Zeroizing::new(key),
            None => {
                use rand::RngCore as _;

                info!("Generating a new bakery root key");

                let mut key = Zeroizing::new(vec![0u8; 32]);
                rand::rngs::OsRng.fill_bytes(&mut key);
                store.put_bakery_root_key(&key).await?;
                key
            }
        };

        Ok(Self {
            root_key,
            location,
            discharge_lifetime,
        })
    }

    pub fn new_ephemeral(location: String, discharge_lifetime: Duration) -> Self {
        use rand::RngCore as _;

        let mut key = Zeroizing::new(vec![0u8; 32]);
        rand::rngs::OsRng.fill_bytes(&mut key);

        Self {
            root_key: key,
            location,
            discharge_lifetime,
        }
    }

    pub fn mint(&self, id: impl Into<String>, caveats: impl IntoIterator<Item = String>) -> Macaroon {
        let id = id.into();
        let mut signature = chain(&self.root_key, id.as_bytes());

        let caveats: Vec<String> = caveats.into_iter().collect();
        for caveat in &caveats {
            signature = chain(&signature, caveat.as_bytes());
        }

        Macaroon {
            location: self.location.clone(),
            id,
            caveats,
            signature,
        }
    }

    /// Satisfies a third-party caveat: the caller has already consulted the
    /// authorization engine; this only binds the verdict into a discharge.
    pub fn discharge(&self, caveat_id: &str, condition: &ThirdPartyCondition) -> Macaroon {
        let expiry = OffsetDateTime::now_utc() + self.discharge_lifetime;
        let expiry = expiry.format(&Rfc3339).expect("UTC datetimes format as RFC 3339");

        self.mint(
            caveat_id.to_owned(),
            [
                format!("{DECLARED_PREFIX}{} {}", condition.relation, condition.object),
                format!("{TIME_BEFORE_PREFIX}{expiry}"),
            ],
        )
    }

    /// Walks the signature chain and evaluates first-party caveats.
    ///
    /// `declared` caveats carry facts and always hold; `time-before` must be
    /// in the future; anything else fails verification.
    pub fn verify(&self, macaroon: &Macaroon) -> Result<(), Error> {
        let mut signature = chain(&self.root_key, macaroon.id.as_bytes());

        for caveat in &macaroon.caveats {
            signature = chain(&signature, caveat.as_bytes());

            if caveat.starts_with(DECLARED_PREFIX) {
                continue;
            }

            if let Some(deadline) = caveat.strip_prefix(TIME_BEFORE_PREFIX) {
                let deadline = OffsetDateTime::parse(deadline, &Rfc3339)
                    .map_err(|e| Error::invalid("malformed time-before caveat").with_source(e))?;

                if OffsetDateTime::now_utc() >= deadline {
                    return Err(Error::unauthorized("macaroon expired"));
                }

                continue;
            }

            return Err(Error::unauthorized(format!("caveat not satisfied: {caveat}")));
        }

        if macaroon.signature == signature {
            Ok(())
        } else {
            Err(Error::unauthorized("macaroon signature mismatch"))
        }
    }

    /// Extracts a declared fact (`declared <key> <value>`) from a verified macaroon.
    pub fn declared<'a>(macaroon: &'a Macaroon, key: &str) -> Option<&'a str> {
        macaroon.caveats.iter().find_map(|caveat| {
            caveat
                .strip_prefix(DECLARED_PREFIX)?
                .strip_prefix(key)?
                .strip_prefix(' ')
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bakery() -> Bakery {
        Bakery::new_ephemeral("https://jimm.example".to_owned(), Duration::from_secs(900))
    }

    #[test]
    fn parse_third_party_condition() {
        let condition: ThirdPartyCondition = "is-reader user-bob@canonical.com offer-myoffer"
            .parse()
            .expect("well-formed condition");

        assert_eq!(condition.relation, Relation::Reader);
        assert_eq!(condition.user, Tag::user("bob@canonical.com"));
        assert_eq!(condition.object, Tag::offer("myoffer"));
        assert_eq!(condition.to_string(), "is-reader user-bob@canonical.com offer-myoffer");
    }

    #[rstest::rstest]
    #[case("")]
    #[case("is-reader user-bob@canonical.com")]
    #[case("reader user-bob@canonical.com offer-myoffer")]
    #[case("is-squint user-bob@canonical.com offer-myoffer")]
    #[case("is-reader bob offer-myoffer")]
    #[case("is-reader user-bob@canonical.com offer-myoffer extra")]
    fn malformed_conditions_are_not_recognized(#[case] input: &str) {
        assert_eq!(input.parse::<ThirdPartyCondition>(), Err(CaveatNotRecognized));
    }

    #[test]
    fn discharge_carries_declared_and_expiry_caveats() {
        let bakery = bakery();
        let condition: ThirdPartyCondition = "is-reader user-bob@canonical.com offer-myoffer"
            .parse()
            .expect("condition");

        let discharge = bakery.discharge("caveat-1", &condition);

        assert_eq!(discharge.caveats.len(), 2);
        assert_eq!(discharge.caveats[0], "declared reader offer-myoffer");
        assert!(discharge.caveats[1].starts_with("time-before "));

        bakery.verify(&discharge).expect("fresh discharge verifies");
    }

    #[test]
    fn tampered_caveats_fail_verification() {
        let bakery = bakery();
        let mut macaroon = bakery.mint("login".to_owned(), ["declared username alice".to_owned()]);

        macaroon.caveats[0] = "declared username mallory".to_owned();

        assert!(bakery.verify(&macaroon).is_err());
    }

    #[test]
    fn expired_discharge_fails_verification() {
        let bakery = Bakery::new_ephemeral("https://jimm.example".to_owned(), Duration::ZERO);
        let condition: ThirdPartyCondition = "is-reader user-bob@canonical.com offer-myoffer"
            .parse()
            .expect("condition");

        let discharge = bakery.discharge("caveat-1", &condition);

        let error = bakery.verify(&discharge).expect_err("zero lifetime discharge");
        assert_eq!(error.kind(), crate::error::ErrorKind::Unauthorized);
    }

    #[test]
    fn declared_facts_are_extractable() {
        let bakery = bakery();
        let macaroon = bakery.mint("login".to_owned(), ["declared username alice@canonical.com".to_owned()]);

        assert_eq!(Bakery::declared(&macaroon, "username"), Some("alice@canonical.com"));
        assert_eq!(Bakery::declared(&macaroon, "model"), None);
    }

    #[test]
    fn json_round_trip() {
        let bakery = bakery();
        let macaroon = bakery.mint("id".to_owned(), ["declared k v".to_owned()]);

        let encoded = serde_json::to_string(&macaroon).expect("serialize");
        let decoded: Macaroon = serde_json::from_str(&encoded).expect("deserialize");

        assert_eq!(decoded, macaroon);
    }
}
