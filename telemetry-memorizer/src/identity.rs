//! Identity keying.
//!
//! Every cumulative sample is tied to the state of its identity: the metric name, the tag set, and
//! the identity of the emitter that produced it.  Identities are reduced to a fixed-width
//! [`IdentityKey`] by hashing a canonical byte rendering of those three parts:
//!
//! ```text
//! name 0x1F (tag 0x1E)* 0x1F emitter_id
//! ```
//!
//! Each tag is followed by a record separator, so an empty tag set renders to no bytes at all,
//! while a tag set holding a single empty tag renders to a lone `0x1E` and yields a different key.
//! With [`TagOrdering::Unordered`], tags are sorted before rendering and the key does not depend on
//! the order in which an emitter listed them.
//!
//! Keys are stable for the lifetime of a process, and across processes running the same version of
//! this crate.  Collisions are not detected.
use std::{fmt, hash::Hasher as _, str::FromStr};

use rapidhash::fast::RapidHasher;

const FIELD_SEPARATOR: u8 = 0x1F;
const TAG_TERMINATOR: u8 = 0x1E;

/// How tags contribute to an identity key.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum TagOrdering {
    /// Tags are sorted before hashing: `["a", "b"]` and `["b", "a"]` are the same identity.
    #[default]
    Unordered,

    /// Tags are hashed in the order given: `["a", "b"]` and `["b", "a"]` are different identities.
    AsGiven,
}

impl FromStr for TagOrdering {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unordered" => Ok(TagOrdering::Unordered),
            "as-given" => Ok(TagOrdering::AsGiven),
            _ => Err(format!("invalid tag ordering '{}' (expected 'unordered' or 'as-given')", s)),
        }
    }
}

/// A pre-hashed identity of a metric series.
#[derive(Clone, Copy, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct IdentityKey(u64);

impl IdentityKey {
    /// Creates the identity key for the given name, tags and emitter identity.
    pub fn new<S>(name: &str, tags: &[S], emitter_id: &str, ordering: TagOrdering) -> Self
    where
        S: AsRef<str>,
    {
        let buf = render(name, tags, emitter_id, ordering);

        let mut hasher = RapidHasher::default();
        hasher.write(&buf);
        IdentityKey(hasher.finish())
    }

    /// Creates an identity key from a raw hash value.
    pub const fn from_raw(hash: u64) -> Self {
        IdentityKey(hash)
    }

    /// Gets the raw hash value of this key.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey({:016x})", self.0)
    }
}

fn render<S>(name: &str, tags: &[S], emitter_id: &str, ordering: TagOrdering) -> Vec<u8>
where
    S: AsRef<str>,
{
    let mut tags = tags.iter().map(|t| t.as_ref()).collect::<Vec<&str>>();
    if ordering == TagOrdering::Unordered {
        tags.sort_unstable();
    }

    let tags_len = tags.iter().map(|t| t.len() + 1).sum::<usize>();
    let mut buf = Vec::with_capacity(name.len() + tags_len + emitter_id.len() + 2);
    buf.extend_from_slice(name.as_bytes());
    buf.push(FIELD_SEPARATOR);
    for tag in tags {
        buf.extend_from_slice(tag.as_bytes());
        buf.push(TAG_TERMINATOR);
    }
    buf.push(FIELD_SEPARATOR);
    buf.extend_from_slice(emitter_id.as_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use proptest::{collection::vec as arb_vec, prelude::*};

    use super::{render, IdentityKey, TagOrdering};

    const NO_TAGS: &[&str] = &[];

    #[test]
    fn canonical_rendering() {
        // Cases are defined as: tags, tag ordering, expected rendering.
        let cases: [(&[&str], TagOrdering, &[u8]); 5] = [
            (NO_TAGS, TagOrdering::Unordered, b"cpu\x1f\x1fagent"),
            (&[""], TagOrdering::Unordered, b"cpu\x1f\x1e\x1fagent"),
            (&["env:prod"], TagOrdering::Unordered, b"cpu\x1fenv:prod\x1e\x1fagent"),
            (&["z", "a"], TagOrdering::Unordered, b"cpu\x1fa\x1ez\x1e\x1fagent"),
            (&["z", "a"], TagOrdering::AsGiven, b"cpu\x1fz\x1ea\x1e\x1fagent"),
        ];

        for (tags, ordering, expected) in cases {
            assert_eq!(render("cpu", tags, "agent", ordering), expected);
        }
    }

    #[test]
    fn empty_tag_is_not_no_tags() {
        let none = IdentityKey::new("cpu", NO_TAGS, "agent", TagOrdering::Unordered);
        let empty = IdentityKey::new("cpu", &[""], "agent", TagOrdering::Unordered);
        assert_ne!(none, empty);
    }

    #[test]
    fn parts_do_not_bleed_into_each_other() {
        let a = IdentityKey::new("cpu", NO_TAGS, "agent", TagOrdering::Unordered);
        let b = IdentityKey::new("cpua", NO_TAGS, "gent", TagOrdering::Unordered);
        let c = IdentityKey::new("cpu", &["agent"], "", TagOrdering::Unordered);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn tag_ordering_modes() {
        let ab = ["a", "b"];
        let ba = ["b", "a"];

        let unordered = |tags: &[&str]| IdentityKey::new("m", tags, "e", TagOrdering::Unordered);
        let as_given = |tags: &[&str]| IdentityKey::new("m", tags, "e", TagOrdering::AsGiven);

        assert_eq!(unordered(&ab), unordered(&ba));
        assert_ne!(as_given(&ab), as_given(&ba));
        assert_eq!(as_given(&ab), unordered(&ab));
    }

    #[test]
    fn parse_tag_ordering() {
        assert_eq!("unordered".parse::<TagOrdering>(), Ok(TagOrdering::Unordered));
        assert_eq!("as-given".parse::<TagOrdering>(), Ok(TagOrdering::AsGiven));
        assert!("sorted".parse::<TagOrdering>().is_err());
    }

    proptest! {
        #[test]
        fn deterministic(
            name in "[a-z.]{1,16}",
            tags in arb_vec("[a-z0-9:]{0,8}", 0..6),
            emitter in "[a-z0-9-]{1,12}",
        ) {
            let first = IdentityKey::new(&name, &tags, &emitter, TagOrdering::Unordered);
            let second = IdentityKey::new(&name, &tags, &emitter, TagOrdering::Unordered);
            prop_assert_eq!(first, second);

            let mut reversed = tags.clone();
            reversed.reverse();
            let third = IdentityKey::new(&name, &reversed, &emitter, TagOrdering::Unordered);
            prop_assert_eq!(first, third);
        }
    }
}
