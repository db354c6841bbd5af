use core::fmt;
use std::str::FromStr;

use smol_str::SmolStr;
use thiserror::Error;
use uuid::Uuid;

/// Suffix marking the member set of a group when the group is used as a
/// principal (`group-<uuid>#member`).
pub const MEMBER_SUFFIX: &str = "#member";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    User,
    Group,
    Controller,
    Model,
    Offer,
    Cloud,
    Credential,
    ServiceAccount,
}

impl Kind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Kind::User => "user",
            Kind::Group => "group",
            Kind::Controller => "controller",
            Kind::Model => "model",
            Kind::Offer => "offer",
            Kind::Cloud => "cloud",
            Kind::Credential => "credential",
            Kind::ServiceAccount => "serviceaccount",
        }
    }
}

impl FromStr for Kind {
    type Err = BadTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Kind::User),
            "group" => Ok(Kind::Group),
            "controller" => Ok(Kind::Controller),
            "model" => Ok(Kind::Model),
            "offer" => Ok(Kind::Offer),
            "cloud" => Ok(Kind::Cloud),
            "credential" => Ok(Kind::Credential),
            "serviceaccount" => Ok(Kind::ServiceAccount),
            unexpected => Err(BadTag::UnknownKind {
                value: SmolStr::new(unexpected),
            }),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BadTag {
    #[error("unknown tag kind: {value}")]
    UnknownKind { value: SmolStr },
    #[error("tag has no kind separator: {value}")]
    MissingSeparator { value: SmolStr },
    #[error("tag id is empty")]
    EmptyId,
    #[error("tag id contains whitespace: {value}")]
    IdWithWhitespace { value: SmolStr },
    #[error("only group tags may carry the #member suffix: {value}")]
    MemberOnNonGroup { value: SmolStr },
}

/// Typed entity identifier of the form `<kind>-<id>`, the sole vocabulary of
/// the authorization engine. Round-trips as a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tag {
    kind: Kind,
    id: SmolStr,
    member: bool,
}

impl Tag {
    pub fn new(kind: Kind, id: impl AsRef<str>) -> Self {
        Self {
            kind,
            id: SmolStr::new(id.as_ref()),
            member: false,
        }
    }

    pub fn user(name: impl AsRef<str>) -> Self {
        Self::new(Kind::User, name)
    }

    pub fn group(id: impl AsRef<str>) -> Self {
        Self::new(Kind::Group, id)
    }

    pub fn controller(id: Uuid) -> Self {
        Self::new(Kind::Controller, id.to_string())
    }

    pub fn model(id: Uuid) -> Self {
        Self::new(Kind::Model, id.to_string())
    }

    pub fn offer(id: impl AsRef<str>) -> Self {
        Self::new(Kind::Offer, id)
    }

    pub fn cloud(name: impl AsRef<str>) -> Self {
        Self::new(Kind::Cloud, name)
    }

    pub fn service_account(client_id: impl AsRef<str>) -> Self {
        Self::new(Kind::ServiceAccount, client_id)
    }

    /// The member set of a group, e.g. `group-42#member`.
    #[must_use]
    pub fn member_set(&self) -> Self {
        debug_assert_eq!(self.kind, Kind::Group);
        Self {
            kind: self.kind,
            id: self.id.clone(),
            member: true,
        }
    }

    /// The same tag without the `#member` suffix.
    #[must_use]
    pub fn base(&self) -> Self {
        Self {
            kind: self.kind,
            id: self.id.clone(),
            member: false,
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_member_set(&self) -> bool {
        self.member
    }

    /// Whether this tag may appear on the object (principal) side of a tuple.
    pub fn is_principal(&self) -> bool {
        matches!(self.kind, Kind::User | Kind::ServiceAccount) || (self.kind == Kind::Group && self.member)
    }

    pub fn uuid(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.id).ok()
    }
}

impl FromStr for Tag {
    type Err = BadTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (raw, member) = match s.strip_suffix(MEMBER_SUFFIX) {
            Some(raw) => (raw, true),
            None => (s, false),
        };

        let (kind, id) = raw.split_once('-').ok_or_else(|| BadTag::MissingSeparator {
            value: SmolStr::new(s),
        })?;

        let kind = Kind::from_str(kind)?;

        if id.is_empty() {
            return Err(BadTag::EmptyId);
        }

        if id.contains(char::is_whitespace) {
            return Err(BadTag::IdWithWhitespace { value: SmolStr::new(s) });
        }

        if member && kind != Kind::Group {
            return Err(BadTag::MemberOnNonGroup { value: SmolStr::new(s) });
        }

        Ok(Tag {
            kind,
            id: SmolStr::new(id),
            member,
        })
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind, self.id)?;
        if self.member {
            f.write_str(MEMBER_SUFFIX)?;
        }
        Ok(())
    }
}

impl TryFrom<String> for Tag {
    type Error = BadTag;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> Self {
        tag.to_string()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("user-alice@canonical.com", Kind::User, "alice@canonical.com", false)]
    #[case("controller-11111111-1111-1111-1111-111111111111", Kind::Controller, "11111111-1111-1111-1111-111111111111", false)]
    #[case("group-42#member", Kind::Group, "42", true)]
    #[case("serviceaccount-fca1f605@serviceaccount", Kind::ServiceAccount, "fca1f605@serviceaccount", false)]
    fn parse_well_formed(#[case] input: &str, #[case] kind: Kind, #[case] id: &str, #[case] member: bool) {
        let tag: Tag = input.parse().expect("well-formed tag");
        assert_eq!(tag.kind(), kind);
        assert_eq!(tag.id(), id);
        assert_eq!(tag.is_member_set(), member);
        assert_eq!(tag.to_string(), input);
    }

    #[rstest]
    #[case("machine-0")]
    #[case("useralice")]
    #[case("user-")]
    #[case("user-alice smith")]
    #[case("model-abc#member")]
    fn parse_rejects_malformed(#[case] input: &str) {
        assert!(input.parse::<Tag>().is_err());
    }

    #[test]
    fn member_set_round_trip() {
        let group = Tag::group("devops");
        let members = group.member_set();
        assert!(members.is_principal());
        assert_eq!(members.base(), group);
        assert_eq!(members.to_string(), "group-devops#member");
    }

    proptest! {
        #[test]
        fn display_parse_round_trip(id in "[a-z0-9@.-]{1,32}") {
            for kind in [Kind::User, Kind::Model, Kind::Offer, Kind::Cloud] {
                let tag = Tag::new(kind, &id);
                let parsed: Tag = tag.to_string().parse().unwrap();
                prop_assert_eq!(parsed, tag);
            }
        }
    }
}
