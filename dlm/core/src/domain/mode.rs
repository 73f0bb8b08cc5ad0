// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Lock Modes
//!
//! The seven lock modes shared by every resource kind and the fixed
//! compatibility matrix between them.
//!
//! | Held \ Requested | EX | PW | PR | CW | CR | NL | GROUP |
//! |------------------|----|----|----|----|----|----|-------|
//! | EX               |    |    |    |    |    | ✓  |       |
//! | PW               |    |    |    |    | ✓  | ✓  |       |
//! | PR               |    |    | ✓  |    | ✓  | ✓  |       |
//! | CW               |    |    |    | ✓  | ✓  | ✓  |       |
//! | CR               |    | ✓  | ✓  | ✓  | ✓  | ✓  |       |
//! | NL               | ✓  | ✓  | ✓  | ✓  | ✓  | ✓  | ✓     |
//! | GROUP            |    |    |    |    |    | ✓  | ✓     |
//!
//! The matrix is symmetric. NL is the null mode: it is compatible with
//! everything, and EX is compatible with nothing but NL.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LockMode {
    /// Exclusive.
    Ex,
    /// Protected write.
    Pw,
    /// Protected read.
    Pr,
    /// Concurrent write.
    Cw,
    /// Concurrent read.
    Cr,
    /// Null.
    Nl,
    /// Group lock, shared only between holders of the same group id.
    Group,
}

impl LockMode {
    pub const ALL: [LockMode; 7] = [
        LockMode::Ex,
        LockMode::Pw,
        LockMode::Pr,
        LockMode::Cw,
        LockMode::Cr,
        LockMode::Nl,
        LockMode::Group,
    ];

    /// Single-bit encoding used by [`ModeSet`] and on the wire.
    pub const fn bit(self) -> u8 {
        match self {
            LockMode::Ex => 0x01,
            LockMode::Pw => 0x02,
            LockMode::Pr => 0x04,
            LockMode::Cw => 0x08,
            LockMode::Cr => 0x10,
            LockMode::Nl => 0x20,
            LockMode::Group => 0x40,
        }
    }

    /// The set of modes a lock held in `self` tolerates.
    pub const fn compat_set(self) -> ModeSet {
        const EX: u8 = LockMode::Nl.bit();
        const PW: u8 = EX | LockMode::Cr.bit();
        const PR: u8 = PW | LockMode::Pr.bit();
        const CW: u8 = PW | LockMode::Cw.bit();
        const CR: u8 = CW | LockMode::Pr.bit() | LockMode::Pw.bit();
        const NL: u8 = CR | LockMode::Ex.bit() | LockMode::Group.bit();
        const GROUP: u8 = LockMode::Group.bit() | LockMode::Nl.bit();

        ModeSet(match self {
            LockMode::Ex => EX,
            LockMode::Pw => PW,
            LockMode::Pr => PR,
            LockMode::Cw => CW,
            LockMode::Cr => CR,
            LockMode::Nl => NL,
            LockMode::Group => GROUP,
        })
    }

    pub fn is_compatible(self, other: LockMode) -> bool {
        self.compat_set().contains(other)
    }

    /// Write-class modes count against a lock's writer references.
    pub fn is_write(self) -> bool {
        matches!(self, LockMode::Ex | LockMode::Pw | LockMode::Cw | LockMode::Group)
    }

    /// Whether a lock granted in `self` already gives its holder everything
    /// a lock in `requested` would.
    pub fn covers(self, requested: LockMode) -> bool {
        let covered = match self {
            LockMode::Ex => ModeSet::all(),
            LockMode::Pw => ModeSet::from_modes(&[
                LockMode::Pw,
                LockMode::Pr,
                LockMode::Cw,
                LockMode::Cr,
                LockMode::Nl,
            ]),
            LockMode::Pr => ModeSet::from_modes(&[LockMode::Pr, LockMode::Cr, LockMode::Nl]),
            LockMode::Cw => ModeSet::from_modes(&[LockMode::Cw, LockMode::Cr, LockMode::Nl]),
            LockMode::Cr => ModeSet::from_modes(&[LockMode::Cr, LockMode::Nl]),
            LockMode::Nl => ModeSet::from_modes(&[LockMode::Nl]),
            LockMode::Group => ModeSet::from_modes(&[LockMode::Group, LockMode::Nl]),
        };
        covered.contains(requested)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LockMode::Ex => "EX",
            LockMode::Pw => "PW",
            LockMode::Pr => "PR",
            LockMode::Cw => "CW",
            LockMode::Cr => "CR",
            LockMode::Nl => "NL",
            LockMode::Group => "GROUP",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "EX" => Ok(LockMode::Ex),
            "PW" => Ok(LockMode::Pw),
            "PR" => Ok(LockMode::Pr),
            "CW" => Ok(LockMode::Cw),
            "CR" => Ok(LockMode::Cr),
            "NL" => Ok(LockMode::Nl),
            "GROUP" => Ok(LockMode::Group),
            other => Err(format!("unknown lock mode: {}", other)),
        }
    }
}

/// A set of lock modes, used for compatibility lookups and lock matching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModeSet(u8);

impl ModeSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self(0x7f)
    }

    pub fn from_modes(modes: &[LockMode]) -> Self {
        Self(modes.iter().fold(0, |acc, m| acc | m.bit()))
    }

    pub const fn contains(self, mode: LockMode) -> bool {
        self.0 & mode.bit() != 0
    }

    pub fn insert(&mut self, mode: LockMode) {
        self.0 |= mode.bit();
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub fn iter(self) -> impl Iterator<Item = LockMode> {
        LockMode::ALL.into_iter().filter(move |m| self.contains(*m))
    }
}

impl From<LockMode> for ModeSet {
    fn from(mode: LockMode) -> Self {
        Self(mode.bit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LockMode::*;

    /// Row = held mode, column = requested mode, in `LockMode::ALL` order.
    const REFERENCE: [[bool; 7]; 7] = [
        //    EX     PW     PR     CW     CR     NL     GROUP
        [false, false, false, false, false, true, false], // EX
        [false, false, false, false, true, true, false],  // PW
        [false, false, true, false, true, true, false],   // PR
        [false, false, false, true, true, true, false],   // CW
        [false, true, true, true, true, true, false],     // CR
        [true, true, true, true, true, true, true],       // NL
        [false, false, false, false, false, true, true],  // GROUP
    ];

    #[test]
    fn test_compatibility_matrix_all_pairs() {
        for (i, held) in LockMode::ALL.iter().enumerate() {
            for (j, requested) in LockMode::ALL.iter().enumerate() {
                assert_eq!(
                    held.is_compatible(*requested),
                    REFERENCE[i][j],
                    "compatible({}, {})",
                    held,
                    requested
                );
            }
        }
    }

    #[test]
    fn test_compatibility_is_symmetric() {
        for a in LockMode::ALL {
            for b in LockMode::ALL {
                assert_eq!(a.is_compatible(b), b.is_compatible(a), "{} vs {}", a, b);
            }
        }
    }

    #[test]
    fn test_covers() {
        assert!(Ex.covers(Pw));
        assert!(Pw.covers(Pr));
        assert!(!Pr.covers(Pw));
        assert!(!Cw.covers(Pr));
        assert!(Group.covers(Group));
        assert!(!Group.covers(Pr));
        for m in LockMode::ALL {
            assert!(m.covers(m));
            assert!(m.covers(Nl));
        }
    }

    #[test]
    fn test_mode_set() {
        let set = ModeSet::from_modes(&[Pr, Cr]);
        assert!(set.contains(Pr));
        assert!(!set.contains(Pw));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Pr, Cr]);
        assert!(ModeSet::empty().is_empty());
        assert_eq!(ModeSet::all().iter().count(), 7);
    }

    #[test]
    fn test_parse_roundtrip_names() {
        for m in LockMode::ALL {
            assert_eq!(m.as_str().parse::<LockMode>().unwrap(), m);
        }
        assert!("XX".parse::<LockMode>().is_err());
    }
}
