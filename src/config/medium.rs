//! Medium profiles of the monitored network

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Medium profile selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
pub enum MediumProfile {
    /// Twisted pair 1
    #[default]
    #[value(name = "tp1")]
    Tp1,
    /// Power line 110 kHz
    #[value(name = "p110")]
    Pl110,
    /// Power line 132 kHz
    #[value(name = "p132")]
    Pl132,
    /// Radio frequency
    #[value(name = "rf")]
    Rf,
}

impl MediumProfile {
    /// Command line identifier
    pub fn id(&self) -> &'static str {
        match self {
            Self::Tp1 => "tp1",
            Self::Pl110 => "p110",
            Self::Pl132 => "p132",
            Self::Rf => "rf",
        }
    }

    /// Get all profiles
    pub fn all() -> &'static [MediumProfile] {
        &[Self::Tp1, Self::Pl110, Self::Pl132, Self::Rf]
    }

    /// Default settings for this profile
    pub fn settings(&self) -> MediumSettings {
        match self {
            Self::Tp1 => MediumSettings::Tp1,
            Self::Pl110 => MediumSettings::Pl110 {
                domain_address: [0; 2],
            },
            Self::Pl132 => MediumSettings::Pl132 {
                domain_address: [0; 4],
            },
            Self::Rf => MediumSettings::Rf {
                domain_address: [0; 6],
                unidirectional: false,
            },
        }
    }
}

impl std::str::FromStr for MediumProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|p| p.id() == s)
            .ok_or_else(|| format!("unknown medium '{s}'"))
    }
}

impl fmt::Display for MediumProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Medium specific settings handed to the link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediumSettings {
    /// Twisted pair 1
    Tp1,
    /// Power line 110 kHz
    Pl110 {
        /// Domain address
        domain_address: [u8; 2],
    },
    /// Power line 132 kHz
    Pl132 {
        /// Domain address
        domain_address: [u8; 4],
    },
    /// Radio frequency
    Rf {
        /// Domain address (RF serial number of the domain)
        domain_address: [u8; 6],
        /// Unidirectional devices only
        unidirectional: bool,
    },
}

impl MediumSettings {
    /// KNX medium code
    pub fn medium_code(&self) -> u8 {
        match self {
            Self::Tp1 => 0x02,
            Self::Pl110 { .. } => 0x04,
            Self::Pl132 { .. } => 0x08,
            Self::Rf { .. } => 0x10,
        }
    }
}

impl fmt::Display for MediumSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tp1 => write!(f, "TP1"),
            Self::Pl110 { .. } => write!(f, "PL110"),
            Self::Pl132 { .. } => write!(f, "PL132"),
            Self::Rf { .. } => write!(f, "RF"),
        }
    }
}
