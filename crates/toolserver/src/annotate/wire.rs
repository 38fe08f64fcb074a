//! Decoding of the inference service's NDJSON response.
//!
//! Bytes are buffered until a newline arrives, so a line (or a multi-byte
//! UTF-8 sequence) split across reads is decoded only once it is whole.
//! Blank lines and lines that are not a JSON object are skipped.

use serde::{Deserialize, Serialize};

use crate::model::{tally, FrameRecord, Instance};

const DEFAULT_CLASS: &str = "Vehicle";
const DEFAULT_LABEL: &str = "vehicle";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMeta {
    #[serde(default)]
    pub original_total_frames: u64,
    #[serde(default)]
    pub total_frames_to_process: u64,
    #[serde(default)]
    pub frames_per_interval: f64,
    #[serde(default)]
    pub fps: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WireVehicle {
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub w: Option<f64>,
    #[serde(default)]
    pub h: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WireRecord {
    Meta {
        meta: StreamMeta,
    },
    Detection {
        #[serde(default)]
        grouped_vehicles: Vec<WireVehicle>,
        #[serde(default)]
        combined_frame_b64: Option<String>,
    },
}

fn parse_line(line: &[u8]) -> Option<WireRecord> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }
    let value: serde_json::Value = match serde_json::from_slice(line) {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(error = %err, len = line.len(), "skipping undecodable stream line");
            return None;
        }
    };
    if !value.is_object() {
        return None;
    }
    serde_json::from_value(value).ok()
}

#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one read; returns the records of every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<WireRecord> {
        self.buf.extend_from_slice(chunk);
        let Some(last_newline) = self.buf.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let rest = self.buf.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buf, rest);
        complete.split(|b| *b == b'\n').filter_map(parse_line).collect()
    }

    /// Decodes whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<WireRecord> {
        let rest = std::mem::take(&mut self.buf);
        parse_line(&rest)
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Numbers frames in arrival order; any numbering on the wire is ignored.
#[derive(Debug, Default)]
pub struct FrameBuilder {
    next_index: u64,
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn build(&mut self, vehicles: Vec<WireVehicle>, image_base64: Option<String>) -> FrameRecord {
        let index = self.next_index;
        self.next_index += 1;

        let vehicle_counts = tally(
            vehicles
                .iter()
                .map(|v| v.class.as_deref().filter(|c| !c.is_empty()).unwrap_or(DEFAULT_CLASS)),
        );
        let instances = vehicles
            .into_iter()
            .enumerate()
            .map(|(n, v)| Instance {
                id: format!("{index}-{n}"),
                bbox: match (v.x, v.y, v.w, v.h) {
                    (Some(x), Some(y), Some(w), Some(h)) => Some([x, y, w, h]),
                    _ => None,
                },
                label: v.class.filter(|c| !c.is_empty()).unwrap_or_else(|| DEFAULT_LABEL.to_string()),
                confidence: None,
            })
            .collect();

        FrameRecord {
            index,
            image_base64: image_base64.unwrap_or_default(),
            vehicle_counts,
            instances,
        }
    }
}
