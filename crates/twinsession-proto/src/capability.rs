//! Lock capability flags
//!
//! A capability gates whether a command or UI affordance may touch shared
//! state. Read capabilities are shareable between owners, every other
//! capability is exclusive.

use bitflags::bitflags;
use serde::de::{Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ProtocolError;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LockCapability: u32 {
        const ALL = 1 << 0;
        const MODEL_WRITE = 1 << 1;
        const MODEL_READ = 1 << 2;
        const NAVIGATION_ALL = 1 << 3;
        const NAVIGATION_WRITE = 1 << 4;
        const PROPERTIES = 1 << 5;
        const VIEW_READ = 1 << 6;
        const VIEW_WRITE = 1 << 7;
    }
}

/// Wire names, in flag order
const WIRE_NAMES: [(LockCapability, &str); 8] = [
    (LockCapability::ALL, "All"),
    (LockCapability::MODEL_WRITE, "ModelWrite"),
    (LockCapability::MODEL_READ, "ModelRead"),
    (LockCapability::NAVIGATION_ALL, "NavigationAll"),
    (LockCapability::NAVIGATION_WRITE, "NavigationWrite"),
    (LockCapability::PROPERTIES, "Properties"),
    (LockCapability::VIEW_READ, "ViewRead"),
    (LockCapability::VIEW_WRITE, "ViewWrite"),
];

impl LockCapability {
    /// Capabilities that several owners may hold at the same time
    pub const SHAREABLE: Self = Self::MODEL_READ.union(Self::VIEW_READ);

    /// The subset of `self` that only one owner may hold
    pub fn exclusive(self) -> Self {
        self.difference(Self::SHAREABLE)
    }

    /// Iterate over the single flags set in `self`
    pub fn flags(self) -> impl Iterator<Item = LockCapability> {
        WIRE_NAMES
            .iter()
            .map(|(flag, _)| *flag)
            .filter(move |flag| self.contains(*flag))
    }

    /// Wire names of the flags set in `self`
    pub fn names(self) -> Vec<&'static str> {
        WIRE_NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    pub fn from_wire_name(name: &str) -> Result<Self, ProtocolError> {
        WIRE_NAMES
            .iter()
            .find(|(_, wire)| *wire == name)
            .map(|(flag, _)| *flag)
            .ok_or_else(|| ProtocolError::UnknownCapability(name.to_string()))
    }

    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Self, ProtocolError> {
        names
            .into_iter()
            .try_fold(Self::empty(), |acc, name| Ok(acc | Self::from_wire_name(name)?))
    }
}

impl fmt::Display for LockCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        f.write_str(&self.names().join("|"))
    }
}

impl Serialize for LockCapability {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let names = self.names();
        let mut seq = serializer.serialize_seq(Some(names.len()))?;
        for name in names {
            seq.serialize_element(name)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for LockCapability {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct CapabilityListVisitor;

        impl<'de> Visitor<'de> for CapabilityListVisitor {
            type Value = LockCapability;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a list of lock capability names")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut caps = LockCapability::empty();
                while let Some(name) = seq.next_element::<String>()? {
                    caps |= LockCapability::from_wire_name(&name).map_err(serde::de::Error::custom)?;
                }
                Ok(caps)
            }
        }

        deserializer.deserialize_seq(CapabilityListVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_strips_read_flags() {
        let caps = LockCapability::MODEL_READ | LockCapability::MODEL_WRITE;
        assert_eq!(caps.exclusive(), LockCapability::MODEL_WRITE);
        assert!(LockCapability::VIEW_READ.exclusive().is_empty());
        assert_eq!(LockCapability::ALL.exclusive(), LockCapability::ALL);
    }

    #[test]
    fn test_names_parse_back() {
        let caps = LockCapability::from_names(["ViewWrite", "ModelRead"]).unwrap();
        assert_eq!(caps, LockCapability::VIEW_WRITE | LockCapability::MODEL_READ);
        assert_eq!(caps.names(), vec!["ModelRead", "ViewWrite"]);
    }

    #[test]
    fn test_single_wire_name() {
        assert_eq!(
            LockCapability::from_wire_name("NavigationWrite").unwrap(),
            LockCapability::NAVIGATION_WRITE
        );
        // Wire names differ from the flag constant names
        assert!(LockCapability::from_wire_name("NAVIGATION_WRITE").is_err());
    }

    #[test]
    fn test_unknown_name_rejected() {
        let result = LockCapability::from_names(["ModelWrite", "Everything"]);
        assert!(matches!(result, Err(ProtocolError::UnknownCapability(name)) if name == "Everything"));
    }

    #[test]
    fn test_serde_as_name_list() {
        let caps = LockCapability::ALL | LockCapability::PROPERTIES;
        let json = serde_json::to_string(&caps).unwrap();
        assert_eq!(json, r#"["All","Properties"]"#);

        let parsed: LockCapability = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, caps);

        assert!(serde_json::from_str::<LockCapability>(r#"["Nope"]"#).is_err());
    }

    #[test]
    fn test_flags_iterates_single_bits() {
        let caps = LockCapability::NAVIGATION_ALL | LockCapability::VIEW_READ;
        let flags: Vec<_> = caps.flags().collect();
        assert_eq!(
            flags,
            vec![LockCapability::NAVIGATION_ALL, LockCapability::VIEW_READ]
        );
        assert_eq!(caps.to_string(), "NavigationAll|ViewRead");
    }
}
