use std::fmt;

use alloy::primitives::{Address, aliases::U192};
use serde::{Deserialize, Serialize};

/// Identifies an independent nonce sequence: one `(account, nonceTrack)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackKey {
    pub account: Address,
    pub nonce_track: U192,
}

impl TrackKey {
    pub fn new(account: Address, nonce_track: U192) -> Self {
        Self {
            account,
            nonce_track,
        }
    }
}

impl fmt::Display for TrackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.account, self.nonce_track)
    }
}
