use core::fmt;
use std::str::FromStr;

use smol_str::SmolStr;
use thiserror::Error;

use crate::tag::{Kind, Tag};

/// Relation carried by a persisted tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Relation {
    Administrator,
    Member,
    Reader,
    Writer,
    Consumer,
    CanAddmodel,
}

impl Relation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Relation::Administrator => "administrator",
            Relation::Member => "member",
            Relation::Reader => "reader",
            Relation::Writer => "writer",
            Relation::Consumer => "consumer",
            Relation::CanAddmodel => "can-addmodel",
        }
    }

    /// Relations on `target_kind` whose presence satisfies a check for `self`.
    ///
    /// This is the subsumption table: administrator ⊇ writer ⊇ reader, and on
    /// offers consumer grants read while administrator grants consume.
    pub fn satisfied_by(self, target_kind: Kind) -> &'static [Relation] {
        match self {
            Relation::Administrator => &[Relation::Administrator],
            Relation::Writer => &[Relation::Writer, Relation::Administrator],
            Relation::Reader => {
                if target_kind == Kind::Offer {
                    &[
                        Relation::Reader,
                        Relation::Writer,
                        Relation::Administrator,
                        Relation::Consumer,
                    ]
                } else {
                    &[Relation::Reader, Relation::Writer, Relation::Administrator]
                }
            }
            Relation::Consumer => &[Relation::Consumer, Relation::Administrator],
            Relation::Member => &[Relation::Member],
            Relation::CanAddmodel => &[Relation::CanAddmodel],
        }
    }

    /// Maps a wire access level (as found in JWT access maps and
    /// `access required` error infos) onto the relation that must hold.
    /// Unknown levels are opaque: they merge into access maps untouched but
    /// can never be verified, so they return `None` here.
    pub fn from_access_level(level: &str) -> Option<Relation> {
        match level {
            "superuser" | "admin" | "administrator" => Some(Relation::Administrator),
            "write" => Some(Relation::Writer),
            "read" => Some(Relation::Reader),
            "consume" => Some(Relation::Consumer),
            _ => None,
        }
    }
}

impl FromStr for Relation {
    type Err = BadRelation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "administrator" => Ok(Relation::Administrator),
            "member" => Ok(Relation::Member),
            "reader" => Ok(Relation::Reader),
            "writer" => Ok(Relation::Writer),
            "consumer" => Ok(Relation::Consumer),
            "can-addmodel" => Ok(Relation::CanAddmodel),
            unexpected => Err(BadRelation {
                value: SmolStr::new(unexpected),
            }),
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown relation: {value}")]
pub struct BadRelation {
    pub value: SmolStr,
}

/// A persisted authorization fact. Tuples are set-semantic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Tuple {
    pub object: Tag,
    pub relation: Relation,
    pub target: Tag,
}

impl Tuple {
    pub fn new(object: Tag, relation: Relation, target: Tag) -> Self {
        Self {
            object,
            relation,
            target,
        }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} {})", self.object, self.relation, self.target)
    }
}
