//! Publish options supplied by the signaling layer.
//!
//! The signaling layer forwards whatever JSON object the client sent with its
//! publish request. Recognized keys are `video`, `audio`, `screen` and `codec`;
//! anything else is ignored.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OptionsError {
    #[error("publish options missing")]
    Missing,

    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("malformed publish options: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Video codec a publisher negotiates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Codec {
    H264,
    #[default]
    VP8,
    VP9,
}

impl Codec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::VP8 => "vp8",
            Codec::VP9 => "vp9",
        }
    }
}

impl FromStr for Codec {
    type Err = OptionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("h264") {
            Ok(Codec::H264)
        } else if s.eq_ignore_ascii_case("vp8") {
            Ok(Codec::VP8)
        } else if s.eq_ignore_ascii_case("vp9") {
            Ok(Codec::VP9)
        } else {
            Err(OptionsError::UnsupportedCodec(s.to_string()))
        }
    }
}

impl TryFrom<String> for Codec {
    type Error = OptionsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Codec> for String {
    fn from(codec: Codec) -> Self {
        codec.as_str().to_string()
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media a publisher intends to send and the video codec to negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishOptions {
    pub video: bool,
    pub audio: bool,
    pub screen: bool,
    pub codec: Codec,
}

impl PublishOptions {
    /// Parse the options object a client attached to its publish request.
    pub fn from_json(value: Option<&serde_json::Value>) -> Result<Self, OptionsError> {
        match value {
            None | Some(serde_json::Value::Null) => Err(OptionsError::Missing),
            Some(value) => Ok(serde_json::from_value(value.clone())?),
        }
    }

    /// Whether the publisher carries a stream that needs periodic keyframes
    pub fn wants_keyframes(&self) -> bool {
        self.video || self.screen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_options() {
        assert!(matches!(
            PublishOptions::from_json(None),
            Err(OptionsError::Missing)
        ));
        assert!(matches!(
            PublishOptions::from_json(Some(&serde_json::Value::Null)),
            Err(OptionsError::Missing)
        ));
    }

    #[test]
    fn test_defaults_to_vp8() {
        let options = PublishOptions::from_json(Some(&json!({ "video": true }))).unwrap();
        assert!(options.video);
        assert!(!options.audio);
        assert_eq!(options.codec, Codec::VP8);
    }

    #[test]
    fn test_codec_is_case_insensitive() {
        let options =
            PublishOptions::from_json(Some(&json!({ "codec": "H264", "screen": true }))).unwrap();
        assert_eq!(options.codec, Codec::H264);
        assert!(options.wants_keyframes());
    }

    #[test]
    fn test_unknown_codec_rejected() {
        let result = PublishOptions::from_json(Some(&json!({ "codec": "av1" })));
        assert!(result.is_err());
    }

    #[test]
    fn test_audio_only_skips_keyframes() {
        let options = PublishOptions::from_json(Some(&json!({ "audio": true }))).unwrap();
        assert!(!options.wants_keyframes());
    }
}
