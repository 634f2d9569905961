//! Catalog model definitions.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// 32-bit FNV-1a, used for channel and recording identifiers.
pub fn string_hash(value: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in value.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Broadcast channel from the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub number: u32,
    pub name: String,
    #[serde(default)]
    pub provider: String,
    /// Delivery system: `S19.2E` style satellite positions, `C`, `T` or `A`.
    #[serde(default = "default_delivery")]
    pub delivery: String,
    // Unique key
    pub nid: u16,
    pub tsid: u16,
    pub sid: u16,
    // Elementary streams
    #[serde(default)]
    pub vpid: u16,
    #[serde(default)]
    pub vtype: u8,
    #[serde(default)]
    pub apids: Vec<u16>,
    #[serde(default)]
    pub caids: Vec<u16>,
    /// Configured channel group.
    #[serde(default)]
    pub group: Option<String>,
    /// Transport stream file replayed when the channel is tuned.
    #[serde(default)]
    pub source: Option<PathBuf>,
}

fn default_delivery() -> String {
    "T".to_string()
}

impl Channel {
    /// Stable identifier derived from the channel id string.
    pub fn uid(&self) -> u32 {
        string_hash(&self.channel_id())
    }

    pub fn channel_id(&self) -> String {
        format!("{}-{}-{}-{}", self.delivery, self.nid, self.tsid, self.sid)
    }

    /// Transponder key; channels sharing it can share a tuner.
    pub fn transponder(&self) -> (String, u16, u16) {
        (self.delivery.clone(), self.nid, self.tsid)
    }

    pub fn is_radio(&self) -> bool {
        (self.vpid == 0 || self.vpid == 1) && !self.apids.is_empty()
    }

    pub fn is_encrypted(&self) -> bool {
        self.caids.iter().any(|&c| c != 0)
    }

    pub fn first_caid(&self) -> u32 {
        self.caids.first().copied().unwrap_or(0) as u32
    }

    /// `caids:a;b;` list with decimal values.
    pub fn caid_string(&self) -> String {
        let mut out = String::from("caids:");
        for caid in self.caids.iter().take_while(|&&c| c != 0) {
            out.push_str(&format!("{};", caid));
        }
        out
    }

    fn delivery_hash(&self) -> u32 {
        let mut chars = self.delivery.chars();
        match chars.next() {
            Some('S') => {
                let rest: String = chars.collect();
                let (pos, west) = match rest.strip_suffix('W') {
                    Some(p) => (p, true),
                    None => (rest.strip_suffix('E').unwrap_or(&rest), false),
                };
                let tenths = pos
                    .parse::<f32>()
                    .map(|deg| (deg * 10.0).round() as i32)
                    .unwrap_or(0);
                let signed = if west { 3600 - tenths } else { tenths };
                (signed as u32 & 0xFFFF) << 16
            }
            Some('C') => 0xFFFF_0000,
            Some('T') => 0xEEEE_0000,
            Some('A') => 0xDDDD_0000,
            _ => 0,
        }
    }

    /// Enigma-style service reference used for picon lookups.
    pub fn picon_ref(&self) -> String {
        let service_type = if self.is_radio() {
            2
        } else if self.vtype == 27 {
            19
        } else {
            1
        };
        format!(
            "1_0_{}_{:X}_{:X}_{:X}_{:X}_0_0_0",
            service_type,
            self.sid,
            self.tsid,
            self.nid,
            self.delivery_hash()
        )
    }
}

/// Recording timer. Numbers are 1-based positions in the timer list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timer {
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub recording: bool,
    #[serde(default)]
    pub pending: bool,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_lifetime")]
    pub lifetime: u32,
    pub channel_uid: u32,
    /// Absolute start and stop, unix seconds.
    pub start: u32,
    pub stop: u32,
    /// Local midnight of the first day, unix seconds.
    #[serde(default)]
    pub day: u32,
    #[serde(default)]
    pub weekdays: u32,
    pub file: String,
    #[serde(default)]
    pub aux: String,
}

fn default_true() -> bool {
    true
}

fn default_priority() -> u32 {
    50
}

fn default_lifetime() -> u32 {
    99
}

impl Timer {
    pub fn same_slot(&self, other: &Timer) -> bool {
        self.channel_uid == other.channel_uid
            && self.start == other.start
            && self.stop == other.stop
            && self.day == other.day
    }
}

/// Stored recording. `name` uses `~` as folder separator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    #[serde(skip)]
    pub uid: u32,
    pub name: String,
    /// Directory holding the segments and index.
    pub path: PathBuf,
    #[serde(default)]
    pub channel_name: String,
    pub start: u32,
    #[serde(default)]
    pub duration: u32,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_lifetime")]
    pub lifetime: u32,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_fps")]
    pub frames_per_second: f64,
    /// Cut marks as frame numbers, alternating begin and end.
    #[serde(default)]
    pub marks: Vec<u32>,
    /// Still being written by a timer.
    #[serde(default)]
    pub in_progress: bool,
}

fn default_fps() -> f64 {
    25.0
}

impl Recording {
    pub fn assign_uid(&mut self) {
        self.uid = string_hash(&self.path.to_string_lossy());
    }

    /// Last name component.
    pub fn title(&self) -> &str {
        self.name.rsplit('~').next().unwrap_or(&self.name)
    }

    /// Folder part with `/` separators and spaces for underscores.
    pub fn directory(&self) -> String {
        match self.name.rfind('~') {
            Some(pos) => self.name[..pos]
                .replace('~', "/")
                .replace('_', " ")
                .trim_start_matches('/')
                .to_string(),
            None => String::new(),
        }
    }

    /// Cut list as `(start_ms, end_ms)` pairs.
    pub fn edit_list(&self) -> Vec<(u64, u64)> {
        let fps = if self.frames_per_second > 0.0 {
            self.frames_per_second
        } else {
            default_fps()
        };
        let to_ms = |frame: u32| (frame as f64 * 1000.0 / fps) as u64;
        self.marks
            .chunks(2)
            .map(|pair| {
                let begin = to_ms(pair[0]);
                let end = pair.get(1).map_or(begin, |&f| to_ms(f));
                (begin, end)
            })
            .collect()
    }
}

/// Programme guide entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpgEvent {
    pub id: u32,
    pub start: u32,
    pub duration: u32,
    #[serde(default)]
    pub content: u32,
    #[serde(default)]
    pub rating: u32,
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub description: String,
}

impl EpgEvent {
    pub fn end(&self) -> u32 {
        self.start.saturating_add(self.duration)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskSpace {
    pub total_mb: u32,
    pub free_mb: u32,
    pub percent_used: u32,
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn test_string_hash_known_values() {
        assert_eq!(string_hash(""), 0x811c_9dc5);
        assert_eq!(string_hash("a"), 0xe40c_292c);
    }

    #[test]
    fn test_radio_detection() {
        let mut ch = channel(1, "Radio", 10);
        assert!(!ch.is_radio());
        ch.vpid = 0;
        assert!(ch.is_radio());
        ch.apids.clear();
        assert!(!ch.is_radio());
    }

    #[test]
    fn test_caid_string() {
        let mut ch = channel(1, "One", 10);
        assert_eq!(ch.caid_string(), "caids:");
        assert_eq!(ch.first_caid(), 0);
        ch.caids = vec![0x0500, 0x1702];
        assert_eq!(ch.caid_string(), "caids:1280;5890;");
        assert_eq!(ch.first_caid(), 0x0500);
        assert!(ch.is_encrypted());
    }

    #[test]
    fn test_picon_ref() {
        let mut ch = channel(1, "One", 0x1234);
        ch.nid = 1;
        ch.tsid = 0x44;
        assert_eq!(ch.picon_ref(), "1_0_1_1234_44_1_EEEE0000_0_0_0");

        ch.delivery = "S19.2E".to_string();
        ch.vtype = 27;
        assert_eq!(ch.picon_ref(), "1_0_19_1234_44_1_C00000_0_0_0");

        ch.delivery = "S30W".to_string();
        assert_eq!(ch.picon_ref(), "1_0_19_1234_44_1_CE40000_0_0_0");
    }

    #[test]
    fn test_recording_name_parts() {
        let rec = recording("Films~Big_Night~Episode 1", "/video/a");
        assert_eq!(rec.title(), "Episode 1");
        assert_eq!(rec.directory(), "Films/Big Night");

        let flat = recording("News", "/video/b");
        assert_eq!(flat.title(), "News");
        assert_eq!(flat.directory(), "");
    }

    #[test]
    fn test_edit_list() {
        let mut rec = recording("News", "/video/b");
        rec.marks = vec![250, 500, 1000];
        assert_eq!(rec.edit_list(), vec![(10_000, 20_000), (40_000, 40_000)]);
    }
}
