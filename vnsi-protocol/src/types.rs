//! Protocol constants and message identifiers for the VNSI wire protocol.

/// Protocol version announced by this server.
pub const PROTOCOL_VERSION: u32 = 11;

/// Lowest client protocol version that may authenticate.
pub const MIN_PROTOCOL_VERSION: u32 = 5;

/// First client protocol version that understands RDS side data.
pub const RDS_PROTOCOL_VERSION: u32 = 9;

/// First client protocol version that receives picon references in channel lists.
pub const PICON_PROTOCOL_VERSION: u32 = 6;

/// Server identification string sent in the login reply.
pub const SERVER_NAME: &str = "VDR-Network-Streaming-Interface (VNSI) Server";

/// Channel id every request must carry.
pub const CONTROL_CHANNEL: u32 = 1;

/// Upper bound for a request payload.
pub const MAX_PAYLOAD_SIZE: u32 = 200_000;

/// Request header size: channel, request id, opcode, payload length.
pub const REQUEST_HEADER_SIZE: usize = 16;

/// Response, status and scan header size: kind, request id or event, payload length.
pub const RESPONSE_HEADER_SIZE: usize = 12;

/// Stream frame header size.
pub const STREAM_HEADER_SIZE: usize = 40;

/// Timestamp marker for "no PTS/DTS".
pub const NO_PTS: i64 = 0xFFF0_0000_0000_0000_u64 as i64;

/// Frame kind carried in the first header field of everything the server sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResponseKind {
    /// Reply to a request.
    Response = 1,
    /// Live stream packet.
    Stream = 2,
    /// Keep-alive.
    KeepAlive = 3,
    /// Network log line.
    NetLog = 4,
    /// Asynchronous status notification.
    Status = 5,
    /// Channel scan progress.
    Scan = 6,
    /// On-screen display.
    Osd = 7,
}

impl TryFrom<u32> for ResponseKind {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        match value {
            1 => Ok(ResponseKind::Response),
            2 => Ok(ResponseKind::Stream),
            3 => Ok(ResponseKind::KeepAlive),
            4 => Ok(ResponseKind::NetLog),
            5 => Ok(ResponseKind::Status),
            6 => Ok(ResponseKind::Scan),
            7 => Ok(ResponseKind::Osd),
            _ => Err(value),
        }
    }
}

impl From<ResponseKind> for u32 {
    fn from(value: ResponseKind) -> Self {
        value as u32
    }
}

macro_rules! opcodes {
    ($($(#[$doc:meta])* $name:ident = $value:literal,)+) => {
        /// Request opcode.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u32)]
        pub enum Opcode {
            $($(#[$doc])* $name = $value,)+
        }

        impl Opcode {
            /// Every opcode the server understands.
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name,)+];
        }

        impl TryFrom<u32> for Opcode {
            type Error = u32;

            fn try_from(value: u32) -> Result<Self, u32> {
                match value {
                    $($value => Ok(Opcode::$name),)+
                    _ => Err(value),
                }
            }
        }
    };
}

opcodes! {
    // General (1-9)
    /// Authenticate and negotiate the protocol version.
    Login = 1,
    /// Server wall-clock time.
    GetTime = 2,
    /// Enable or disable asynchronous status pushes.
    EnableStatusInterface = 3,
    /// Liveness check.
    Ping = 7,
    /// Read a setup value.
    GetSetup = 8,
    /// Store a setup value.
    StoreSetup = 9,

    // Live streaming (20-22)
    /// Start streaming a channel.
    ChannelStreamOpen = 20,
    /// Stop the live stream.
    ChannelStreamClose = 21,
    /// Seek the timeshift buffer.
    ChannelStreamSeek = 22,

    // Recording playback (40-46)
    /// Open a recording for playback.
    RecStreamOpen = 40,
    /// Close the open recording.
    RecStreamClose = 41,
    /// Read a byte range of the open recording.
    RecStreamGetBlock = 42,
    /// Byte position of a frame.
    RecStreamPositionFromFrame = 43,
    /// Frame containing a byte position.
    RecStreamFrameFromPosition = 44,
    /// Next independent frame in a direction.
    RecStreamGetIFrame = 45,
    /// Current recording length.
    RecStreamGetLength = 46,

    // Channels (61-72)
    /// Highest channel number.
    ChannelsGetCount = 61,
    /// Channel list.
    ChannelsGetChannels = 63,
    /// Rebuild and count channel groups.
    ChannelGroupGetCount = 65,
    /// List channel groups.
    ChannelGroupList = 66,
    /// Members of a channel group.
    ChannelGroupMembers = 67,
    /// CA system ids of a channel.
    ChannelsGetCaids = 68,
    /// Provider whitelist.
    ChannelsGetWhitelist = 69,
    /// Channel blacklist.
    ChannelsGetBlacklist = 70,
    /// Replace the provider whitelist.
    ChannelsSetWhitelist = 71,
    /// Replace the channel blacklist.
    ChannelsSetBlacklist = 72,

    // Timers (80-85)
    /// Number of timers.
    TimerGetCount = 80,
    /// One timer.
    TimerGet = 81,
    /// All timers.
    TimerGetList = 82,
    /// Create a timer.
    TimerAdd = 83,
    /// Delete a timer.
    TimerDelete = 84,
    /// Modify a timer.
    TimerUpdate = 85,

    // Recordings (100-105)
    /// Video directory disk usage.
    RecordingsDiskSize = 100,
    /// Number of recordings.
    RecordingsGetCount = 101,
    /// All recordings.
    RecordingsGetList = 102,
    /// Rename a recording.
    RecordingsRename = 103,
    /// Delete a recording.
    RecordingsDelete = 104,
    /// Cut marks of a recording.
    RecordingsGetEdl = 105,

    // EPG (120)
    /// Events of a channel in a time window.
    EpgGetForChannel = 120,

    // Channel scan (140-145)
    /// Whether scanning is available.
    ScanSupported = 140,
    /// Countries known to the scanner.
    ScanGetCountries = 141,
    /// Satellites known to the scanner.
    ScanGetSatellites = 142,
    /// Start a scan.
    ScanStart = 143,
    /// Stop the running scan.
    ScanStop = 144,
    /// Bitmask of supported delivery systems.
    ScanSupportedTypes = 145,

    // OSD (160-162)
    /// Attach to the on-screen display.
    OsdConnect = 160,
    /// Detach from the on-screen display.
    OsdDisconnect = 161,
    /// Send a remote-control key.
    OsdHitKey = 162,

    // Deleted recordings (180-185)
    /// Whether deleted recordings are exposed.
    RecordingsDeletedSupported = 180,
    /// Number of deleted recordings.
    RecordingsDeletedGetCount = 181,
    /// All deleted recordings.
    RecordingsDeletedGetList = 182,
    /// Permanently remove a deleted recording.
    RecordingsDeletedDelete = 183,
    /// Restore a deleted recording.
    RecordingsDeletedUndelete = 184,
    /// Permanently remove every deleted recording.
    RecordingsDeletedDeleteAll = 185,
}

impl From<Opcode> for u32 {
    fn from(value: Opcode) -> Self {
        value as u32
    }
}

/// Stream frame opcode (second header field of a stream frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StreamPacketType {
    /// Elementary stream list changed.
    Change = 1,
    /// Human-readable stream status.
    Status = 2,
    /// Queue status.
    QueueStatus = 3,
    /// Demultiplexed media packet.
    MuxPkt = 4,
    /// Signal information.
    SignalInfo = 5,
    /// Content information.
    ContentInfo = 6,
    /// Timeshift buffer statistics.
    BufferStats = 7,
    /// Reference wall-clock time.
    RefTime = 8,
}

impl TryFrom<u32> for StreamPacketType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        match value {
            1 => Ok(StreamPacketType::Change),
            2 => Ok(StreamPacketType::Status),
            3 => Ok(StreamPacketType::QueueStatus),
            4 => Ok(StreamPacketType::MuxPkt),
            5 => Ok(StreamPacketType::SignalInfo),
            6 => Ok(StreamPacketType::ContentInfo),
            7 => Ok(StreamPacketType::BufferStats),
            8 => Ok(StreamPacketType::RefTime),
            _ => Err(value),
        }
    }
}

/// Status notification id (second header field of a status frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StatusEvent {
    TimerChange = 1,
    Recording = 2,
    Message = 3,
    ChannelChange = 4,
    RecordingsChange = 5,
    EpgChange = 6,
}

impl TryFrom<u32> for StatusEvent {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        match value {
            1 => Ok(StatusEvent::TimerChange),
            2 => Ok(StatusEvent::Recording),
            3 => Ok(StatusEvent::Message),
            4 => Ok(StatusEvent::ChannelChange),
            5 => Ok(StatusEvent::RecordingsChange),
            6 => Ok(StatusEvent::EpgChange),
            _ => Err(value),
        }
    }
}

/// Scan progress event id (second header field of a scan frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ScanEventKind {
    Percentage = 1,
    Signal = 2,
    Device = 3,
    Transponder = 4,
    NewChannel = 5,
    Finished = 6,
    Status = 7,
}

impl TryFrom<u32> for ScanEventKind {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        match value {
            1 => Ok(ScanEventKind::Percentage),
            2 => Ok(ScanEventKind::Signal),
            3 => Ok(ScanEventKind::Device),
            4 => Ok(ScanEventKind::Transponder),
            5 => Ok(ScanEventKind::NewChannel),
            6 => Ok(ScanEventKind::Finished),
            7 => Ok(ScanEventKind::Status),
            _ => Err(value),
        }
    }
}

/// Delivery systems reported by `ScanSupportedTypes`.
pub mod scan_support {
    pub const DVB_T: u32 = 0x01;
    pub const DVB_C: u32 = 0x02;
    pub const DVB_S: u32 = 0x04;
    pub const ANALOG_TV: u32 = 0x08;
    pub const ANALOG_RADIO: u32 = 0x10;
    pub const ATSC: u32 = 0x20;
}
