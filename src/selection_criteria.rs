use std::{collections::HashMap, fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    bson::{doc, Document},
    error::{Error, Result},
};

/// The kind of operation a server is being selected for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum OperationType {
    /// A read, routed according to the read preference.
    Read,

    /// A write, always routed to a primary or mongos.
    Write,

    /// An aggregation with a `$out` or `$merge` stage. It may be routed to a secondary only if
    /// every known server supports writing aggregation results from secondaries.
    AggregateWithWrite,
}

/// Which replica set members a read may be routed to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum ReadMode {
    /// Only the primary.
    #[default]
    Primary,

    /// Only secondaries.
    Secondary,

    /// The primary when there is one, secondaries otherwise.
    PrimaryPreferred,

    /// Secondaries when any are suitable, the primary otherwise.
    SecondaryPreferred,

    /// Any member within the latency window.
    Nearest,
}

impl ReadMode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::PrimaryPreferred => "primaryPreferred",
            Self::SecondaryPreferred => "secondaryPreferred",
            Self::Nearest => "nearest",
        }
    }
}

/// A read preference tag set. See the documentation
/// [here](https://www.mongodb.com/docs/manual/tutorial/configure-replica-set-tag-sets/).
pub type TagSet = HashMap<String, String>;

/// Specifies how a read should be routed to members of a replica set.
///
/// Non-primary modes may narrow the candidates with `tag_sets`, tried in order until one matches
/// some member, and with a max staleness bounding how far a secondary may lag the primary. The
/// max staleness is sent to servers as a whole number of `maxStalenessSeconds`.
///
/// ```
/// # use std::time::Duration;
/// # use mongodb_cluster::{ReadMode, ReadPreference};
/// let read_preference = ReadPreference::new(ReadMode::Nearest)
///     .with_max_staleness(Duration::from_secs(120))
///     .unwrap();
/// assert_eq!(read_preference.mode(), ReadMode::Nearest);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireReadPreference", into = "WireReadPreference")]
pub struct ReadPreference {
    mode: ReadMode,
    tag_sets: Vec<TagSet>,
    max_staleness: Option<Duration>,
}

impl ReadPreference {
    /// Reads only from the primary.
    pub const PRIMARY: Self = Self::new(ReadMode::Primary);

    /// A read preference for `mode` with no tag sets or max staleness.
    pub const fn new(mode: ReadMode) -> Self {
        Self {
            mode,
            tag_sets: Vec::new(),
            max_staleness: None,
        }
    }

    /// The routing mode.
    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    /// The tag sets candidates are filtered by, in order of preference.
    pub fn tag_sets(&self) -> &[TagSet] {
        &self.tag_sets
    }

    /// The maximum replication lag a secondary may have to be selected.
    pub fn max_staleness(&self) -> Option<Duration> {
        self.max_staleness
    }

    pub(crate) fn is_primary(&self) -> bool {
        self.mode == ReadMode::Primary
    }

    /// Whether anything beyond the mode narrows the candidates. A single empty tag set matches
    /// every server and so does not count.
    pub(crate) fn has_constraints(&self) -> bool {
        self.max_staleness.is_some()
            || !(self.tag_sets.is_empty() || self.tag_sets[..] == [TagSet::default()])
    }

    fn require_non_primary(&self, what: &str) -> Result<()> {
        if self.is_primary() {
            return Err(Error::invalid_argument(format!(
                "{what} can only be specified with a non-primary read preference mode"
            )));
        }
        Ok(())
    }

    /// Filters candidates by `tag_sets`. Fails for the primary mode.
    pub fn with_tags(mut self, tag_sets: Vec<TagSet>) -> Result<Self> {
        self.require_non_primary("read preference tags")?;
        self.tag_sets = tag_sets;
        Ok(self)
    }

    /// Excludes secondaries lagging the primary by more than `max_staleness`. Fails for the
    /// primary mode.
    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Result<Self> {
        self.require_non_primary("max staleness")?;
        self.max_staleness = Some(max_staleness);
        Ok(self)
    }

    /// The `$readPreference` document sent alongside a command.
    pub(crate) fn to_document(&self) -> Document {
        let mut document = doc! { "mode": self.mode.as_str() };
        if !self.tag_sets.is_empty() {
            let tag_sets: Vec<Document> = self
                .tag_sets
                .iter()
                .map(|tag_set| {
                    tag_set
                        .iter()
                        .map(|(name, value)| (name.clone(), value.as_str().into()))
                        .collect()
                })
                .collect();
            document.insert("tags", tag_sets);
        }
        if let Some(max_staleness) = self.max_staleness {
            let seconds = i64::try_from(max_staleness.as_secs()).unwrap_or(i64::MAX);
            document.insert("maxStalenessSeconds", seconds);
        }
        document
    }
}

impl From<ReadMode> for ReadPreference {
    fn from(mode: ReadMode) -> Self {
        Self::new(mode)
    }
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ Mode: {}", self.mode.as_str())?;
        if !self.tag_sets.is_empty() {
            write!(f, ", Tag Sets: {:?}", self.tag_sets)?;
        }
        if let Some(max_staleness) = self.max_staleness {
            write!(f, ", Max Staleness: {max_staleness:?}")?;
        }
        write!(f, " }}")
    }
}

/// The serialized form, shaped like the `$readPreference` document.
#[serde_with::serde_as]
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireReadPreference {
    mode: ReadMode,
    #[serde(default, rename = "tags", skip_serializing_if = "Vec::is_empty")]
    tag_sets: Vec<TagSet>,
    #[serde(default, rename = "maxStalenessSeconds")]
    #[serde_as(as = "Option<serde_with::DurationSeconds<u64>>")]
    max_staleness: Option<Duration>,
}

impl TryFrom<WireReadPreference> for ReadPreference {
    type Error = Error;

    fn try_from(wire: WireReadPreference) -> Result<Self> {
        let mut read_preference = Self::new(wire.mode);
        if !wire.tag_sets.is_empty() {
            read_preference = read_preference.with_tags(wire.tag_sets)?;
        }
        if let Some(max_staleness) = wire.max_staleness {
            read_preference = read_preference.with_max_staleness(max_staleness)?;
        }
        Ok(read_preference)
    }
}

impl From<ReadPreference> for WireReadPreference {
    fn from(read_preference: ReadPreference) -> Self {
        Self {
            mode: read_preference.mode,
            tag_sets: read_preference.tag_sets,
            max_staleness: read_preference.max_staleness,
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::{ReadMode, ReadPreference, TagSet};
    use crate::bson::doc;

    fn tag_set(name: &str, value: &str) -> TagSet {
        [(name.to_string(), value.to_string())].into_iter().collect()
    }

    #[test]
    fn read_preference_document() {
        let read_pref = ReadPreference::new(ReadMode::Nearest)
            .with_tags(vec![tag_set("dc", "ny")])
            .unwrap()
            .with_max_staleness(Duration::from_secs(120))
            .unwrap();

        let expected =
            doc! { "mode": "nearest", "tags": [{ "dc": "ny" }], "maxStalenessSeconds": 120_i64 };
        assert_eq!(read_pref.to_document(), expected);
        assert_eq!(crate::bson::to_document(&read_pref).unwrap(), expected);
        assert_eq!(
            crate::bson::from_document::<ReadPreference>(expected).unwrap(),
            read_pref
        );
    }

    #[test]
    fn primary_rejects_options() {
        assert!(ReadPreference::PRIMARY
            .with_max_staleness(Duration::from_secs(90))
            .is_err());
        assert!(ReadPreference::PRIMARY.with_tags(vec![]).is_err());

        let parsed: std::result::Result<ReadPreference, _> =
            crate::bson::from_document(doc! { "mode": "primary", "maxStalenessSeconds": 100 });
        assert!(parsed.is_err());
    }

    #[test]
    fn constraints_ignore_a_lone_empty_tag_set() {
        let secondary_preferred = ReadPreference::new(ReadMode::SecondaryPreferred);
        assert!(!secondary_preferred.has_constraints());
        assert!(!secondary_preferred
            .clone()
            .with_tags(vec![TagSet::new()])
            .unwrap()
            .has_constraints());
        assert!(secondary_preferred
            .with_tags(vec![tag_set("dc", "ny")])
            .unwrap()
            .has_constraints());
    }

    #[test]
    fn display_names_the_mode_and_options() {
        assert_eq!(ReadPreference::PRIMARY.to_string(), "{ Mode: primary }");
        let read_pref = ReadPreference::new(ReadMode::Secondary)
            .with_max_staleness(Duration::from_secs(90))
            .unwrap();
        assert_eq!(
            read_pref.to_string(),
            "{ Mode: secondary, Max Staleness: 90s }"
        );
    }
}
