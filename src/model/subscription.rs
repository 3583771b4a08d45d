//! Subscription tracks and their per-user duration counters.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{ParseError, ParseTarget};

/// One of the three independent subscription categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Track {
    Device,
    Router,
    Combo,
}

impl Track {
    pub const ALL: [Track; 3] = [Track::Device, Track::Router, Track::Combo];

    pub fn as_str(&self) -> &'static str {
        match self {
            Track::Device => "device",
            Track::Router => "router",
            Track::Combo => "combo",
        }
    }
}

impl std::fmt::Display for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts the short names and the `<track>_subscription` payment-type
/// spellings used by the bot and the payment providers' metadata.
impl FromStr for Track {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "device" | "device_subscription" => Ok(Track::Device),
            "router" | "router_subscription" => Ok(Track::Router),
            "combo" | "combo_subscription" => Ok(Track::Combo),
            other => Err(ParseError::new(ParseTarget::Track, other)),
        }
    }
}

/// Duration counter and assigned device slots for one track.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackState {
    pub duration_units: u32,
    pub devices: BTreeSet<String>,
}

impl TrackState {
    /// A track entitles its holder to slots only while duration remains.
    pub fn is_active(&self) -> bool {
        self.duration_units > 0
    }
}

/// All three tracks for one user, plus the combo plan tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionState {
    pub device: TrackState,
    pub router: TrackState,
    pub combo: TrackState,
    pub combo_type: i32,
}

impl SubscriptionState {
    pub fn track(&self, track: Track) -> &TrackState {
        match track {
            Track::Device => &self.device,
            Track::Router => &self.router,
            Track::Combo => &self.combo,
        }
    }

    pub fn track_mut(&mut self, track: Track) -> &mut TrackState {
        match track {
            Track::Device => &mut self.device,
            Track::Router => &mut self.router,
            Track::Combo => &mut self.combo,
        }
    }
}
