use crate::types::{NotificationEnvelope, Picture, Plate};
use log::debug;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Envelope(NotificationEnvelope),
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotJson,
    MissingPictureBlock,
    MissingImageContent,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RejectReason::NotJson => "body is not JSON",
            RejectReason::MissingPictureBlock => "no Picture.NormalPic block",
            RejectReason::MissingImageContent => "NormalPic has no Content",
        })
    }
}

/// Validates a notification body without decoding the image itself.
///
/// A declared content type must be JSON; a missing one is judged by the body.
/// Plate and file name are optional.
pub fn parse(
    action: &str,
    remote_address: &str,
    content_type: Option<&str>,
    body: &[u8],
) -> ParseOutcome {
    if let Some(ct) = content_type {
        if !is_json_content_type(ct) {
            debug!("Body from {} declared as {:?}", remote_address, ct);
            return ParseOutcome::Rejected(RejectReason::NotJson);
        }
    }
    let json = match serde_json::from_slice::<Value>(body) {
        Ok(v) => v,
        Err(e) => {
            debug!("Body from {} is not JSON: {}", remote_address, e);
            return ParseOutcome::Rejected(RejectReason::NotJson);
        }
    };

    // Indexing a missing key (or a non-object) yields Null, so absent blocks
    // fall through to the checks below rather than erroring.
    let normal_pic = &json["Picture"]["NormalPic"];
    if !normal_pic.is_object() {
        return ParseOutcome::Rejected(RejectReason::MissingPictureBlock);
    }
    let content = match normal_pic["Content"].as_str() {
        Some(c) if !c.trim().is_empty() => c.to_string(),
        _ => return ParseOutcome::Rejected(RejectReason::MissingImageContent),
    };

    let file_name_hint = non_empty(&normal_pic["PicName"]);
    let plate = non_empty(&json["Picture"]["Plate"]["PlateNumber"])
        .map(|plate_number| Plate { plate_number });

    ParseOutcome::Envelope(NotificationEnvelope {
        action: action.to_string(),
        remote_address: remote_address.to_string(),
        picture: Picture {
            content,
            file_name_hint,
            plate,
        },
    })
}

fn non_empty(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn is_json_content_type(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    mime == "application/json" || (mime.starts_with("application/") && mime.ends_with("+json"))
}
