//! Image orientation tags and the rotation needed between them

use std::fmt;

/// Physical orientation of an image source or target.
///
/// The set is closed: every pair of orientations has a defined rotation
/// relating them, so producers can tag frames with the orientation they
/// captured and consumers can normalize without guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Orientation {
    Portrait,
    PortraitUpsideDown,
    LandscapeLeft,
    LandscapeRight,
}

/// Rotation that maps one orientation onto another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    None,
    Clockwise,
    Counterclockwise,
    Rotate180,
}

impl Rotation {
    /// Whether the rotation swaps width and height.
    pub fn swaps_dimensions(&self) -> bool {
        matches!(self, Rotation::Clockwise | Rotation::Counterclockwise)
    }
}

impl Orientation {
    /// Rotation required to present an image captured in `self` on a
    /// target with orientation `target`.
    pub fn rotation_needed(&self, target: Orientation) -> Rotation {
        use Orientation::*;
        match (self, target) {
            (Portrait, Portrait)
            | (PortraitUpsideDown, PortraitUpsideDown)
            | (LandscapeLeft, LandscapeLeft)
            | (LandscapeRight, LandscapeRight) => Rotation::None,

            (Portrait, PortraitUpsideDown)
            | (PortraitUpsideDown, Portrait)
            | (LandscapeLeft, LandscapeRight)
            | (LandscapeRight, LandscapeLeft) => Rotation::Rotate180,

            (Portrait, LandscapeLeft)
            | (LandscapeLeft, PortraitUpsideDown)
            | (PortraitUpsideDown, LandscapeRight)
            | (LandscapeRight, Portrait) => Rotation::Counterclockwise,

            (Portrait, LandscapeRight)
            | (LandscapeRight, PortraitUpsideDown)
            | (PortraitUpsideDown, LandscapeLeft)
            | (LandscapeLeft, Portrait) => Rotation::Clockwise,
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Orientation::Portrait => "portrait",
            Orientation::PortraitUpsideDown => "portraitUpsideDown",
            Orientation::LandscapeLeft => "landscapeLeft",
            Orientation::LandscapeRight => "landscapeRight",
        };
        write!(f, "{}", name)
    }
}
