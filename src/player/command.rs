//! Start-app payloads and inbound command checks.

use serde_json::Value;
use tracing::warn;

use crate::config::{AppDescriptor, InterfaceFormat};

/// Version reported to the server in the generated start-app envelope.
pub const CLOUD_VERSION: &str = env!("CARGO_PKG_VERSION");

const INTERFACE_CLOSE: &str = "</INTERFACE>";

/// Body of the start-app (2000) command for this session.
///
/// XML hosts supply the envelope themselves and only get the session id appended.
/// JSON hosts get a generated XML envelope; their JSON command follows the handshake.
pub fn control_start_command(app: &AppDescriptor, start_command: &str, session_id: &str, resolution: &str) -> String {
    match app.interface_format {
        InterfaceFormat::Xml => insert_session_id(start_command, session_id),
        InterfaceFormat::Json => start_app_envelope(app, session_id, resolution),
    }
}

fn insert_session_id(xml: &str, session_id: &str) -> String {
    match xml.rfind(INTERFACE_CLOSE) {
        Some(end) => format!("{}<sessionId>{}</sessionId>{}", &xml[..end], session_id, INTERFACE_CLOSE),
        None => {
            warn!("Start command has no INTERFACE element, sent unchanged");
            xml.to_string()
        }
    }
}

fn start_app_envelope(app: &AppDescriptor, session_id: &str, resolution: &str) -> String {
    let mut xml = format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<INTERFACE version="3">
    <TYPE>request</TYPE>
    <COMMAND>StartApp</COMMAND>
    <CONTENTS></CONTENTS>
    <DATA>
        <cloudVersion>{version}</cloudVersion>
        <stbId>{stb_id}</stbId>
        <stbModel>{stb_model}</stbModel>
        <mac>{mac}</mac>
        <webAppVersion>{web_app_version}</webAppVersion>
        <starturl>
            <![CDATA[{url}]]>
        </starturl>
        <sessionId>{session_id}</sessionId>
        <videoInfo>
            <codec>{codec}</codec>
            <fps>{fps}</fps>
            <bitrateKb>{bitrate}</bitrateKb>
            <resolution>{resolution}</resolution>
        </videoInfo>
        <alphaInfo>
            <compressionType>{compression}</compressionType>
            <compressionLevel>1</compressionLevel>
        </alphaInfo>
"#,
        version = CLOUD_VERSION,
        stb_id = app.svc_id,
        stb_model = app.stb_model,
        mac = app.mac_address,
        web_app_version = app.web_app_version,
        url = app.web_app_url,
        session_id = session_id,
        codec = app.video_codec,
        fps = app.video_fps,
        bitrate = app.video_bitrate_kb,
        resolution = resolution,
        compression = app.compression_type,
    );
    if let Some(index) = app.debug_session_index {
        xml.push_str(&format!(
            "        <connectInfo>\n            <sessionDbgIdx>{}</sessionDbgIdx>\n        </connectInfo>\n",
            index
        ));
    }
    xml.push_str("    </DATA>\n</INTERFACE>");
    xml
}

/// Sets `DATA.sessionId` in a JSON start command. Unparseable commands are returned as is.
pub fn merge_session_id(json: &str, session_id: &str) -> String {
    let Ok(mut value) = serde_json::from_str::<Value>(json) else {
        warn!("JSON start command is not valid JSON, session id not added");
        return json.to_string();
    };
    match value.get_mut("DATA").and_then(Value::as_object_mut) {
        Some(data) => {
            data.insert("sessionId".to_string(), Value::String(session_id.to_string()));
            value.to_string()
        }
        None => {
            warn!("JSON start command has no DATA object, session id not added");
            json.to_string()
        }
    }
}

/// Whether an inbound XML command reports that the remote session expired.
pub fn is_session_timeout(xml: &str) -> bool {
    xml.contains("<COMMAND>ConnectionInfo</COMMAND>") && xml.contains("<returnApp>-3</returnApp>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AlphaCompressionType, VideoCodec};

    #[test]
    fn xml_start_command_gains_session_id() {
        let app = AppDescriptor::direct("00:11:22:33:44:55", "10.0.0.1", 8100);
        let command = r#"<INTERFACE version="3"><COMMAND>StartApp</COMMAND></INTERFACE>"#;
        assert_eq!(
            control_start_command(&app, command, "s-1", "1920x1080"),
            r#"<INTERFACE version="3"><COMMAND>StartApp</COMMAND><sessionId>s-1</sessionId></INTERFACE>"#
        );
    }

    #[test]
    fn xml_start_command_without_envelope_is_unchanged() {
        let app = AppDescriptor::direct("mac", "10.0.0.1", 8100);
        assert_eq!(control_start_command(&app, "<START/>", "s-1", "1920x1080"), "<START/>");
    }

    #[test]
    fn json_hosts_get_a_generated_envelope() {
        let app = AppDescriptor {
            interface_format: InterfaceFormat::Json,
            svc_id: "svc-9".to_string(),
            stb_model: "BOX-1".to_string(),
            web_app_url: "https://apps.example/launch?x=1&y=2".to_string(),
            video_codec: VideoCodec::H265,
            video_fps: 60,
            video_bitrate_kb: 8000,
            compression_type: AlphaCompressionType::Zip,
            ..AppDescriptor::direct("aa:bb", "10.0.0.1", 8100)
        };
        let xml = control_start_command(&app, r#"{"DATA":{}}"#, "sess", "1280x720");

        assert!(xml.starts_with(r#"<?xml version="1.0" encoding="utf-8"?>"#));
        assert!(xml.contains("<COMMAND>StartApp</COMMAND>"));
        assert!(xml.contains("<stbId>svc-9</stbId>"));
        assert!(xml.contains("<stbModel>BOX-1</stbModel>"));
        assert!(xml.contains("<mac>aa:bb</mac>"));
        assert!(xml.contains("<![CDATA[https://apps.example/launch?x=1&y=2]]>"));
        assert!(xml.contains("<sessionId>sess</sessionId>"));
        assert!(xml.contains("<codec>H265</codec>"));
        assert!(xml.contains("<fps>60</fps>"));
        assert!(xml.contains("<bitrateKb>8000</bitrateKb>"));
        assert!(xml.contains("<resolution>1280x720</resolution>"));
        assert!(xml.contains("<compressionType>zip</compressionType>"));
        assert!(!xml.contains("connectInfo"));
        assert!(xml.ends_with("</DATA>\n</INTERFACE>"));
    }

    #[test]
    fn debug_session_index_adds_connect_info() {
        let app = AppDescriptor {
            interface_format: InterfaceFormat::Json,
            debug_session_index: Some(3),
            ..AppDescriptor::direct("aa:bb", "10.0.0.1", 8100)
        };
        let xml = control_start_command(&app, "{}", "", "1920x1080");
        assert!(xml.contains("<connectInfo>\n            <sessionDbgIdx>3</sessionDbgIdx>\n        </connectInfo>"));
    }

    #[test]
    fn session_id_merges_into_data() {
        let merged = merge_session_id(r#"{"COMMAND":"StartApp","DATA":{"url":"x"}}"#, "abc");
        let value: Value = serde_json::from_str(&merged).unwrap();
        assert_eq!(value["DATA"]["sessionId"], "abc");
        assert_eq!(value["DATA"]["url"], "x");
        assert_eq!(value["COMMAND"], "StartApp");
    }

    #[test]
    fn unmergeable_json_is_kept() {
        assert_eq!(merge_session_id("not json", "abc"), "not json");
        assert_eq!(merge_session_id(r#"{"DATA":1}"#, "abc"), r#"{"DATA":1}"#);
    }

    #[test]
    fn timeout_command_needs_both_markers() {
        assert!(is_session_timeout(
            "<INTERFACE><COMMAND>ConnectionInfo</COMMAND><DATA><returnApp>-3</returnApp></DATA></INTERFACE>"
        ));
        assert!(!is_session_timeout("<COMMAND>ConnectionInfo</COMMAND><returnApp>0</returnApp>"));
        assert!(!is_session_timeout("<COMMAND>Other</COMMAND><returnApp>-3</returnApp>"));
    }
}
