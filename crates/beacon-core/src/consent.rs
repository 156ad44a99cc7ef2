use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Feature names consent can be given or withdrawn for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feature {
    Sessions,
    Events,
    Views,
    Location,
    Crashes,
    Attribution,
    Users,
    Push,
    StarRating,
    RemoteConfig,
    Apm,
    Feedback,
    Clicks,
    Scrolls,
}

impl Feature {
    pub const ALL: [Feature; 14] = [
        Self::Sessions,
        Self::Events,
        Self::Views,
        Self::Location,
        Self::Crashes,
        Self::Attribution,
        Self::Users,
        Self::Push,
        Self::StarRating,
        Self::RemoteConfig,
        Self::Apm,
        Self::Feedback,
        Self::Clicks,
        Self::Scrolls,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sessions => "sessions",
            Self::Events => "events",
            Self::Views => "views",
            Self::Location => "location",
            Self::Crashes => "crashes",
            Self::Attribution => "attribution",
            Self::Users => "users",
            Self::Push => "push",
            Self::StarRating => "star-rating",
            Self::RemoteConfig => "remote-config",
            Self::Apm => "apm",
            Self::Feedback => "feedback",
            Self::Clicks => "clicks",
            Self::Scrolls => "scrolls",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown feature: {0}")]
pub struct UnknownFeature(pub String);

impl FromStr for Feature {
    type Err = UnknownFeature;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| UnknownFeature(s.to_owned()))
    }
}
