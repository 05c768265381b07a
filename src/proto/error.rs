// HTTP/3 application error codes carried in RESET_STREAM / STOP_SENDING /
// CONNECTION_CLOSE. See RFC 9114 section 8.1.

pub const H3_NO_ERROR: u64 = 0x100;
pub const H3_GENERAL_PROTOCOL_ERROR: u64 = 0x101;
pub const H3_INTERNAL_ERROR: u64 = 0x102;
pub const H3_STREAM_CREATION_ERROR: u64 = 0x103;
pub const H3_CLOSED_CRITICAL_STREAM: u64 = 0x104;
pub const H3_FRAME_UNEXPECTED: u64 = 0x105;
pub const H3_FRAME_ERROR: u64 = 0x106;
pub const H3_ID_ERROR: u64 = 0x108;
pub const H3_MISSING_SETTINGS: u64 = 0x10a;
pub const H3_REQUEST_REJECTED: u64 = 0x10b;
pub const H3_REQUEST_CANCELLED: u64 = 0x10c;
pub const H3_REQUEST_INCOMPLETE: u64 = 0x10d;
pub const H3_QPACK_DECOMPRESSION_FAILED: u64 = 0x200;
pub const H3_QPACK_ENCODER_STREAM_ERROR: u64 = 0x201;
pub const H3_QPACK_DECODER_STREAM_ERROR: u64 = 0x202;
