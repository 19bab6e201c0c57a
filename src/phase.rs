//! Build pipeline phase taxonomy.
//!
//! This module provides:
//! - `Phase` bit-flags partitioning pipeline work into ten primary phases
//!   plus modifier bits
//! - Masking, matching, and ordering over the primary bits
//! - String forms used by pipeline manifests and observer events
//!
//! Exactly one primary bit is set on any well-formed stage phase. Callers
//! select stages with a *mask*, any union of primary bits. Modifier bits
//! annotate stages for tooling and never participate in ordering. The
//! numeric layout is not a stable ABI; always use the symbolic names.

use bitflags::bitflags;
use serde::de::{Deserialize, Deserializer, Error as _};
use serde::ser::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

bitflags! {
    /// A phase of pipeline execution, encoded as one primary bit plus
    /// optional modifier bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Phase: u32 {
        const DOWNLOADS    = 1 << 0;
        const DEPENDENCIES = 1 << 1;
        const PURGE        = 1 << 2;
        const AUTOGEN      = 1 << 3;
        const CONFIGURE    = 1 << 4;
        const BUILD        = 1 << 5;
        const INSTALL      = 1 << 6;
        const COMMIT       = 1 << 7;
        const EXPORT       = 1 << 8;
        const FINAL        = 1 << 9;

        // Modifier bits. FINISHED is the severity counterpart of the FINAL
        // primary phase; the two are distinct bits.
        const BEFORE   = 1 << 10;
        const AFTER    = 1 << 11;
        const FINISHED = 1 << 12;
        const FAILED   = 1 << 13;
    }
}

/// Every primary phase in ascending execution order.
const PRIMARY_ORDER: [Phase; 10] = [
    Phase::DOWNLOADS,
    Phase::DEPENDENCIES,
    Phase::PURGE,
    Phase::AUTOGEN,
    Phase::CONFIGURE,
    Phase::BUILD,
    Phase::INSTALL,
    Phase::COMMIT,
    Phase::EXPORT,
    Phase::FINAL,
];

impl Phase {
    /// Sentinel for "no phase", reported by a progress with no current stage.
    pub const NONE: Phase = Phase::empty();

    /// Union of every primary phase bit.
    pub const PRIMARY: Phase = Phase::DOWNLOADS
        .union(Phase::DEPENDENCIES)
        .union(Phase::PURGE)
        .union(Phase::AUTOGEN)
        .union(Phase::CONFIGURE)
        .union(Phase::BUILD)
        .union(Phase::INSTALL)
        .union(Phase::COMMIT)
        .union(Phase::EXPORT)
        .union(Phase::FINAL);

    /// Union of every modifier bit.
    pub const MODIFIERS: Phase = Phase::BEFORE
        .union(Phase::AFTER)
        .union(Phase::FINISHED)
        .union(Phase::FAILED);

    /// Isolate the primary phase bits.
    pub fn mask(self) -> Phase {
        self.intersection(Self::PRIMARY)
    }

    /// Isolate the modifier bits.
    pub fn modifiers(self) -> Phase {
        self.intersection(Self::MODIFIERS)
    }

    /// Whether this phase is selected by a caller-supplied mask.
    pub fn matches(self, mask: Phase) -> bool {
        !self.mask().intersection(mask.mask()).is_empty()
    }

    /// A well-formed stage phase carries exactly one primary bit.
    pub fn is_well_formed(self) -> bool {
        self.mask().bits().count_ones() == 1
    }

    /// Ordering over the masked value: whether this phase is at or past
    /// `other` in execution order. Modifier bits are ignored.
    pub fn covers(self, other: Phase) -> bool {
        self.mask().bits() >= other.mask().bits()
    }

    /// Iterate the primary phases in ascending execution order.
    pub fn primaries() -> impl Iterator<Item = Phase> {
        PRIMARY_ORDER.into_iter()
    }

    fn flag_name(flag: Phase) -> &'static str {
        match flag {
            Phase::DOWNLOADS => "downloads",
            Phase::DEPENDENCIES => "dependencies",
            Phase::PURGE => "purge",
            Phase::AUTOGEN => "autogen",
            Phase::CONFIGURE => "configure",
            Phase::BUILD => "build",
            Phase::INSTALL => "install",
            Phase::COMMIT => "commit",
            Phase::EXPORT => "export",
            Phase::FINAL => "final",
            Phase::BEFORE => "before",
            Phase::AFTER => "after",
            Phase::FINISHED => "finished",
            Phase::FAILED => "failed",
            _ => unreachable!("single-bit flags only"),
        }
    }

    fn flag_from_name(name: &str) -> Option<Phase> {
        match name {
            "downloads" => Some(Phase::DOWNLOADS),
            "dependencies" => Some(Phase::DEPENDENCIES),
            "purge" => Some(Phase::PURGE),
            "autogen" => Some(Phase::AUTOGEN),
            "configure" => Some(Phase::CONFIGURE),
            "build" => Some(Phase::BUILD),
            "install" => Some(Phase::INSTALL),
            "commit" => Some(Phase::COMMIT),
            "export" => Some(Phase::EXPORT),
            "final" => Some(Phase::FINAL),
            "before" => Some(Phase::BEFORE),
            "after" => Some(Phase::AFTER),
            "finished" => Some(Phase::FINISHED),
            "failed" => Some(Phase::FAILED),
            "none" => Some(Phase::NONE),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        for flag in self.iter() {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(Self::flag_name(flag))?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut phase = Phase::NONE;
        for token in s.split('|').map(str::trim).filter(|t| !t.is_empty()) {
            phase |= Phase::flag_from_name(token)
                .ok_or_else(|| format!("unknown phase `{token}`"))?;
        }
        Ok(phase)
    }
}

impl Serialize for Phase {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Phase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
