//! Provider whitelist and channel blacklist applied to channel listings.

use serde::{Deserialize, Serialize};

use super::Channel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub name: String,
    /// 0 matches unencrypted channels of the provider.
    pub caid: u32,
}

/// Separate lists are kept for TV and radio.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelFilter {
    pub providers_tv: Vec<ProviderEntry>,
    pub providers_radio: Vec<ProviderEntry>,
    pub blacklist_tv: Vec<u32>,
    pub blacklist_radio: Vec<u32>,
}

impl ChannelFilter {
    pub fn whitelist(&self, radio: bool) -> &[ProviderEntry] {
        if radio {
            &self.providers_radio
        } else {
            &self.providers_tv
        }
    }

    pub fn blacklist(&self, radio: bool) -> &[u32] {
        if radio {
            &self.blacklist_radio
        } else {
            &self.blacklist_tv
        }
    }

    pub fn set_whitelist(&mut self, radio: bool, providers: Vec<ProviderEntry>) {
        if radio {
            self.providers_radio = providers;
        } else {
            self.providers_tv = providers;
        }
    }

    pub fn set_blacklist(&mut self, radio: bool, uids: Vec<u32>) {
        if radio {
            self.blacklist_radio = uids;
        } else {
            self.blacklist_tv = uids;
        }
    }

    pub fn passes(&self, channel: &Channel) -> bool {
        let radio = channel.is_radio();
        if self.blacklist(radio).contains(&channel.uid()) {
            return false;
        }

        let providers = self.whitelist(radio);
        if providers.is_empty() {
            return true;
        }
        providers.iter().any(|p| {
            p.name == channel.provider
                && if p.caid == 0 {
                    !channel.is_encrypted()
                } else {
                    channel.caids.iter().any(|&c| c as u32 == p.caid)
                }
        })
    }
}
