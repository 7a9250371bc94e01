//! One-byte-tag framing shared by the browser channel and the
//! gateway -> backend hop.
//!
//! A frame is a single WebSocket message whose first byte is the tag.
//! Input frames travel user -> gateway and gateway -> backend; output frames
//! travel backend -> gateway and gateway -> browser. DATA payloads headed for
//! the browser are base64-encoded by the adapters; everything else carries
//! raw bytes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Subprotocol advertised on every framed channel.
pub const SUBPROTOCOL: &str = "webtty";

// Input tags (from the user/UI).
pub const INPUT: u8 = b'1';
pub const PING: u8 = b'2';
pub const RESIZE: u8 = b'3';

// Output tags (to the user/UI).
pub const OUTPUT: u8 = b'1';
pub const PONG: u8 = b'2';
pub const SET_TITLE: u8 = b'3';
pub const SET_PREFS: u8 = b'4';
pub const SET_RECONNECT: u8 = b'5';

/// Terminal window size carried in RESIZE frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinSize {
    pub columns: u32,
    pub rows: u32,
}

impl WinSize {
    pub fn new(columns: u32, rows: u32) -> Self {
        Self { columns, rows }
    }
}

/// Frame travelling from the user/UI toward the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputFrame {
    Data(Bytes),
    Ping,
    Resize(WinSize),
}

/// Frame travelling from the container toward the user/UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFrame {
    Data(Bytes),
    Pong,
    SetTitle(Bytes),
    SetPrefs(Bytes),
    SetReconnect(Bytes),
}

fn tagged(tag: u8, payload: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(tag);
    buf.extend_from_slice(payload);
    Bytes::from(buf)
}

impl InputFrame {
    pub fn encode(&self) -> Bytes {
        match self {
            InputFrame::Data(p) => tagged(INPUT, p),
            InputFrame::Ping => Bytes::from_static(&[PING]),
            InputFrame::Resize(win) => {
                // serde_json can't fail on a two-integer struct
                let body = serde_json::to_vec(win).unwrap_or_default();
                tagged(RESIZE, &body)
            }
        }
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let (tag, payload) = split_tag(raw)?;
        match tag {
            INPUT => Ok(InputFrame::Data(Bytes::copy_from_slice(payload))),
            PING => Ok(InputFrame::Ping),
            RESIZE => {
                if payload.is_empty() {
                    return Err(Error::Protocol("empty resize payload".into()));
                }
                let win: WinSize = serde_json::from_slice(payload)
                    .map_err(|e| Error::Protocol(format!("malformed resize: {e}")))?;
                Ok(InputFrame::Resize(win))
            }
            other => Err(Error::Protocol(format!(
                "unknown input tag `{}`",
                other as char
            ))),
        }
    }
}

impl OutputFrame {
    pub fn encode(&self) -> Bytes {
        match self {
            OutputFrame::Data(p) => tagged(OUTPUT, p),
            OutputFrame::Pong => Bytes::from_static(&[PONG]),
            OutputFrame::SetTitle(p) => tagged(SET_TITLE, p),
            OutputFrame::SetPrefs(p) => tagged(SET_PREFS, p),
            OutputFrame::SetReconnect(p) => tagged(SET_RECONNECT, p),
        }
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let (tag, payload) = split_tag(raw)?;
        let payload = Bytes::copy_from_slice(payload);
        match tag {
            OUTPUT => Ok(OutputFrame::Data(payload)),
            PONG => Ok(OutputFrame::Pong),
            SET_TITLE => Ok(OutputFrame::SetTitle(payload)),
            SET_PREFS => Ok(OutputFrame::SetPrefs(payload)),
            SET_RECONNECT => Ok(OutputFrame::SetReconnect(payload)),
            other => Err(Error::Protocol(format!(
                "unknown output tag `{}`",
                other as char
            ))),
        }
    }
}

fn split_tag(raw: &[u8]) -> Result<(u8, &[u8])> {
    match raw.split_first() {
        Some((tag, payload)) => Ok((*tag, payload)),
        None => Err(Error::Protocol("zero-length frame".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_roundtrip() {
        let frames = [
            InputFrame::Data(Bytes::from_static(b"ls -la\n")),
            InputFrame::Ping,
            InputFrame::Resize(WinSize::new(120, 40)),
        ];
        for frame in frames {
            let wire = frame.encode();
            assert_eq!(InputFrame::decode(&wire).unwrap(), frame);
        }
    }

    #[test]
    fn output_roundtrip() {
        let payload = Bytes::from(vec![0x55u8; 64 * 1024]);
        let frames = [
            OutputFrame::Data(payload),
            OutputFrame::Pong,
            OutputFrame::SetTitle(Bytes::from_static(b"gangway")),
            OutputFrame::SetPrefs(Bytes::from_static(b"{}")),
            OutputFrame::SetReconnect(Bytes::from_static(b"1")),
        ];
        for frame in frames {
            let wire = frame.encode();
            assert_eq!(OutputFrame::decode(&wire).unwrap(), frame);
        }
    }

    #[test]
    fn resize_json_shape() {
        let wire = InputFrame::Resize(WinSize::new(80, 24)).encode();
        assert_eq!(wire[0], RESIZE);
        let v: serde_json::Value = serde_json::from_slice(&wire[1..]).unwrap();
        assert_eq!(v["columns"], 80);
        assert_eq!(v["rows"], 24);
    }

    #[test]
    fn rejects_bad_frames() {
        assert!(InputFrame::decode(b"").is_err());
        assert!(InputFrame::decode(b"9").is_err());
        assert!(InputFrame::decode(b"3").is_err());
        assert!(InputFrame::decode(b"3{\"columns\":").is_err());
        assert!(OutputFrame::decode(b"0").is_err());
    }
}
