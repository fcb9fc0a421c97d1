//! Inline tag protocol spoken by the devices.
//!
//! A text frame carries any number of command blocks `(c:id=value,...)` and
//! sensor blocks `(s:key=value,...)`. Anything else in the frame is noise.
//! Decoding is best effort and never fails: a frame without a usable block
//! simply decodes to nothing.

use std::collections::BTreeMap;

const COMMAND_TAG: &str = "(c:";
const SENSOR_TAG: &str = "(s:";
const BLOCK_END: char = ')';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevicePayload {
    Image(Vec<u8>),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandUpdate {
    pub id: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedFrame {
    pub commands: Vec<CommandUpdate>,
    pub sensors: BTreeMap<String, String>,
}

impl DecodedFrame {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.sensors.is_empty()
    }
}

/// Text messages are always text. Binary messages are text only when they
/// are UTF-8 and carry at least one tag; otherwise they are image data.
pub fn classify_payload(bytes: Vec<u8>, is_text_message: bool) -> DevicePayload {
    match String::from_utf8(bytes) {
        Ok(text) if is_text_message || has_tag(&text) => DevicePayload::Text(text),
        Ok(text) => DevicePayload::Image(text.into_bytes()),
        Err(err) => DevicePayload::Image(err.into_bytes()),
    }
}

fn has_tag(text: &str) -> bool {
    text.contains(COMMAND_TAG) || text.contains(SENSOR_TAG)
}

pub fn decode_text(text: &str) -> DecodedFrame {
    let mut frame = DecodedFrame::default();

    for body in scan_blocks(text, COMMAND_TAG) {
        for (id, value) in split_pairs(body) {
            frame.commands.push(CommandUpdate {
                id: id.to_string(),
                value: value.to_string(),
            });
        }
    }

    for body in scan_blocks(text, SENSOR_TAG) {
        for (key, value) in split_pairs(body) {
            frame.sensors.insert(key.to_string(), value.to_string());
        }
    }

    frame
}

/// Outbound form of a single command: a bare `id=value`.
pub fn encode_command(id: &str, value: &str) -> String {
    format!("{id}={value}")
}

/// Non-overlapping, left-to-right scan for `tag ... )` blocks. A body ends at
/// the first `)` and may not cross a line break; an unterminated candidate is
/// skipped and the scan resumes one character after its opening.
fn scan_blocks<'a>(text: &'a str, tag: &str) -> Vec<&'a str> {
    let mut bodies = Vec::new();
    let mut cursor = 0;

    while let Some(found) = text[cursor..].find(tag) {
        let start = cursor + found;
        let body_start = start + tag.len();
        let rest = &text[body_start..];
        let end = rest.find(|ch: char| ch == BLOCK_END || ch == '\n');
        match end {
            Some(idx) if rest[idx..].starts_with(BLOCK_END) => {
                bodies.push(&rest[..idx]);
                cursor = body_start + idx + BLOCK_END.len_utf8();
            }
            _ => {
                // '(' is one byte, so the next char boundary is start + 1.
                cursor = start + 1;
            }
        }
    }

    bodies
}

fn split_pairs(body: &str) -> impl Iterator<Item = (&str, &str)> {
    body.trim().split(',').filter_map(|piece| {
        let (key, value) = piece.trim().split_once('=')?;
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        Some((key, value.trim()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commands(frame: &DecodedFrame) -> Vec<(&str, &str)> {
        frame
            .commands
            .iter()
            .map(|c| (c.id.as_str(), c.value.as_str()))
            .collect()
    }

    #[test]
    fn decodes_command_and_sensor_blocks() {
        let frame = decode_text("(c:1=on)(s:temp=21.5,hum=40)");
        assert_eq!(commands(&frame), vec![("1", "on")]);
        assert_eq!(frame.sensors.len(), 2);
        assert_eq!(frame.sensors["temp"], "21.5");
        assert_eq!(frame.sensors["hum"], "40");
    }

    #[test]
    fn one_update_per_command_block_in_document_order() {
        let frame = decode_text("noise (c:relay=off) more (c: 2 = on ) (c:relay=on)");
        assert_eq!(
            commands(&frame),
            vec![("relay", "off"), ("2", "on"), ("relay", "on")]
        );
        assert!(frame.sensors.is_empty());
    }

    #[test]
    fn sensor_keys_union_across_blocks_and_later_block_wins() {
        let frame = decode_text("(s:temp=20, hum=40)(s:temp=22,co=3)");
        assert_eq!(frame.sensors.len(), 3);
        assert_eq!(frame.sensors["temp"], "22");
        assert_eq!(frame.sensors["hum"], "40");
        assert_eq!(frame.sensors["co"], "3");
    }

    #[test]
    fn value_keeps_everything_after_first_equals() {
        let frame = decode_text("(s:expr=a=b)");
        assert_eq!(frame.sensors["expr"], "a=b");
    }

    #[test]
    fn malformed_frames_decode_to_nothing() {
        for text in [
            "",
            "hello world",
            "(c:1=on",
            "(s:temp=1\n)",
            "(x:temp=1)",
            "(s:)",
            "(s:novalue,=orphan)",
            "c:1=on)",
        ] {
            let frame = decode_text(text);
            assert!(frame.is_empty(), "expected empty decode for {text:?}");
        }
    }

    #[test]
    fn unterminated_block_does_not_hide_later_blocks() {
        let frame = decode_text("(s:temp=1\n(s:hum=2)");
        assert_eq!(frame.sensors.len(), 1);
        assert_eq!(frame.sensors["hum"], "2");
    }

    #[test]
    fn block_body_stops_at_first_close_paren() {
        let frame = decode_text("(s:a=1)b=2)");
        assert_eq!(frame.sensors.len(), 1);
        assert_eq!(frame.sensors["a"], "1");
    }

    #[test]
    fn handles_multibyte_text_around_tags() {
        let frame = decode_text("température→(s:t=19.5)✓");
        assert_eq!(frame.sensors["t"], "19.5");
    }

    #[test]
    fn binary_payloads_are_images_unless_tagged_utf8() {
        assert_eq!(
            classify_payload(vec![0xff, 0xd8, 0xff], false),
            DevicePayload::Image(vec![0xff, 0xd8, 0xff])
        );
        assert_eq!(
            classify_payload(b"plain bytes".to_vec(), false),
            DevicePayload::Image(b"plain bytes".to_vec())
        );
        assert_eq!(
            classify_payload(b"(s:t=1)".to_vec(), false),
            DevicePayload::Text("(s:t=1)".to_string())
        );
        assert_eq!(
            classify_payload(b"ready".to_vec(), true),
            DevicePayload::Text("ready".to_string())
        );
    }

    #[test]
    fn encodes_bare_command() {
        assert_eq!(encode_command("relay", "on"), "relay=on");
    }
}
