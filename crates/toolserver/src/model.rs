//! Detection payloads shared by the annotation stream and the frame store.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleCount {
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub label: String,
    /// `[x, y, w, h]` in frame pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// One decoded unit of the annotation stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameRecord {
    pub index: u64,
    /// Base64-encoded JPEG; empty when the service sent no image.
    #[serde(rename = "base64")]
    pub image_base64: String,
    pub vehicle_counts: Vec<VehicleCount>,
    pub instances: Vec<Instance>,
}

/// Tallies labels in first-seen order.
pub fn tally<'a>(labels: impl IntoIterator<Item = &'a str>) -> Vec<VehicleCount> {
    let mut counts: Vec<VehicleCount> = Vec::new();
    for label in labels {
        match counts.iter_mut().find(|c| c.name == label) {
            Some(existing) => existing.count += 1,
            None => counts.push(VehicleCount {
                name: label.to_string(),
                count: 1,
            }),
        }
    }
    counts
}
