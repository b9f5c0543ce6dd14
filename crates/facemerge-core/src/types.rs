use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Bounding box for a detected face, with optional facial keypoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point keypoints: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// An integer pixel coordinate in image space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Round a floating-point coordinate to the nearest pixel.
    pub fn from_f32(x: f32, y: f32) -> Self {
        Self {
            x: x.round() as i32,
            y: y.round() as i32,
        }
    }
}

/// Named facial regions a landmark detector must report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    Chin,
    LeftEyebrow,
    RightEyebrow,
    NoseBridge,
    NoseTip,
    LeftEye,
    RightEye,
    TopLip,
    BottomLip,
}

impl Region {
    /// Every region, in mask-gathering order.
    pub const ALL: [Region; 9] = [
        Region::Chin,
        Region::LeftEyebrow,
        Region::RightEyebrow,
        Region::NoseBridge,
        Region::NoseTip,
        Region::LeftEye,
        Region::RightEye,
        Region::TopLip,
        Region::BottomLip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Chin => "chin",
            Region::LeftEyebrow => "left_eyebrow",
            Region::RightEyebrow => "right_eyebrow",
            Region::NoseBridge => "nose_bridge",
            Region::NoseTip => "nose_tip",
            Region::LeftEye => "left_eye",
            Region::RightEye => "right_eye",
            Region::TopLip => "top_lip",
            Region::BottomLip => "bottom_lip",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Landmark point-groups for a single detected face.
///
/// Points are in the coordinate space of the image they were detected in.
/// Regions the detector did not report read back as empty slices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LandmarkSet {
    groups: BTreeMap<Region, Vec<Point>>,
}

impl LandmarkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the points of one region.
    pub fn insert(&mut self, region: Region, points: Vec<Point>) {
        self.groups.insert(region, points);
    }

    /// Builder-style variant of [`insert`](Self::insert).
    pub fn with(mut self, region: Region, points: Vec<Point>) -> Self {
        self.insert(region, points);
        self
    }

    /// Points of a region, empty if the region is missing.
    pub fn get(&self, region: Region) -> &[Point] {
        self.groups.get(&region).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All points across `regions`, concatenated in the given order.
    pub fn gather(&self, regions: &[Region]) -> Vec<Point> {
        regions
            .iter()
            .flat_map(|r| self.get(*r).iter().copied())
            .collect()
    }

    /// Total number of points across every region.
    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn regions(&self) -> impl Iterator<Item = (Region, &[Point])> {
        self.groups.iter().map(|(r, pts)| (*r, pts.as_slice()))
    }
}
