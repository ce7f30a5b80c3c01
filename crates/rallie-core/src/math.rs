/// general-purpose geometry helpers
use crate::FloatType;

use serde::{Deserialize, Serialize};

pub fn sq(a: FloatType) -> FloatType {
    a * a
}

/// A position on the court plane, in meters.
#[derive(Clone, Copy, PartialEq, Debug, Serialize, Deserialize, Default)]
pub struct CourtPoint {
    pub x: FloatType,
    pub y: FloatType,
}

impl CourtPoint {
    pub fn new(x: FloatType, y: FloatType) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &CourtPoint) -> FloatType {
        (sq(self.x - other.x) + sq(self.y - other.y)).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    pub fn as_array(&self) -> [FloatType; 2] {
        [self.x, self.y]
    }
}

impl From<[FloatType; 2]> for CourtPoint {
    fn from(p: [FloatType; 2]) -> Self {
        Self::new(p[0], p[1])
    }
}

/// A position in camera image coordinates, in pixels.
#[derive(Clone, Copy, PartialEq, Debug, Serialize, Deserialize, Default)]
pub struct PixelPoint {
    pub x: FloatType,
    pub y: FloatType,
}

impl PixelPoint {
    pub fn new(x: FloatType, y: FloatType) -> Self {
        Self { x, y }
    }

    pub fn as_array(&self) -> [FloatType; 2] {
        [self.x, self.y]
    }
}

impl From<[FloatType; 2]> for PixelPoint {
    fn from(p: [FloatType; 2]) -> Self {
        Self::new(p[0], p[1])
    }
}

/// Twice the signed area of the triangle `a`, `b`, `c`.
pub fn cross2(a: &[FloatType; 2], b: &[FloatType; 2], c: &[FloatType; 2]) -> FloatType {
    (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0])
}

/// Arithmetic mean of a set of points. `None` if empty.
pub fn mean_point<'a, I>(points: I) -> Option<CourtPoint>
where
    I: IntoIterator<Item = &'a CourtPoint>,
{
    let mut n = 0usize;
    let mut acc = CourtPoint::default();
    for p in points {
        acc.x += p.x;
        acc.y += p.y;
        n += 1;
    }
    if n == 0 {
        return None;
    }
    let n = n as FloatType;
    Some(CourtPoint::new(acc.x / n, acc.y / n))
}
