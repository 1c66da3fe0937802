//! VCS wire protocol: command codes, the byte codec and outbound packet builders.
//!
//! Every packet starts with a big-endian `i32` command word. Strings are sent as a
//! big-endian `i32` length followed by the bytes. Streaming frames use a separate
//! little-endian header, see [`crate::streaming`].

pub mod bytes;

pub use bytes::{
    CommandWriter, read_i32_be, read_i32_le, read_i64_le, read_string, read_u8, read_u16_le,
};

/// Numeric command codes.
pub mod code {
    /// Key-down event (client to server).
    pub const KEY_DOWN: i32 = 900;
    /// Key-up event (client to server).
    pub const KEY_UP: i32 = 1010;
    /// Keep-alive acknowledgement (server to client).
    pub const KEEP_ALIVE_ACK: i32 = 1011;
    /// Start-app: device id plus status payload.
    pub const START_APP: i32 = 2000;
    /// Connect success: result code and max packet count.
    pub const CONNECT_SUCCESS: i32 = 2001;
    /// Connect failure: result code.
    pub const CONNECT_FAILURE: i32 = 2002;
    pub const DISCONNECT: i32 = 2010;
    /// Stream-info request, selector 0 = video, 1 = audio.
    pub const STREAM_INFO_REQUEST: i32 = 2020;
    pub const STREAM_INFO_ACK: i32 = 2021;
    /// The remote app is ready to communicate.
    pub const APP_READY: i32 = 2300;
    /// Inbound XML application command.
    pub const XML_INBOUND: i32 = 3000;
    /// Outbound XML application command.
    pub const XML_OUTBOUND: i32 = 3010;
    /// Error report: body size, result code, reserved.
    pub const ERROR_REPORT: i32 = 7001;
    /// Outbound JSON application command.
    pub const JSON_OUTBOUND: i32 = 12000;
    /// Inbound JSON application command.
    pub const JSON_INBOUND: i32 = 12010;
}

/// A/V packet contents length announced in the start-app command.
pub const AV_PACKET_CONTENTS_LENGTH: i32 = 4416;

/// Device ids travel wrapped in braces.
pub fn braced_device_id(device_id: &str) -> String {
    format!("{{{}}}", device_id)
}

/// `[2000][udp video port = 0][udp audio port = 0][4416][{device}][status]`
pub fn start_app(device_id: &str, status_info: &str) -> Vec<u8> {
    CommandWriter::command(code::START_APP)
        .int(0)
        .int(0)
        .int(AV_PACKET_CONTENTS_LENGTH)
        .string(&braced_device_id(device_id))
        .string(status_info)
        .finish()
}

pub fn key_down(key: i32) -> Vec<u8> {
    CommandWriter::command(code::KEY_DOWN).int(key).finish()
}

pub fn key_up(key: i32) -> Vec<u8> {
    CommandWriter::command(code::KEY_UP).int(key).int(0).finish()
}

pub fn xml_command(body: &str) -> Vec<u8> {
    CommandWriter::command(code::XML_OUTBOUND).string(body).finish()
}

pub fn json_command(body: &str) -> Vec<u8> {
    CommandWriter::command(code::JSON_OUTBOUND).string(body).finish()
}

pub fn disconnect(device_id: &str) -> Vec<u8> {
    CommandWriter::command(code::DISCONNECT).string(&braced_device_id(device_id)).finish()
}

pub fn stream_info_request(selector: i32, device_id: &str) -> Vec<u8> {
    CommandWriter::command(code::STREAM_INFO_REQUEST)
        .int(selector)
        .string(&braced_device_id(device_id))
        .finish()
}
