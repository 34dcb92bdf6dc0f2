use serde::{Deserialize, Serialize};

/// The two output canvases every staged image is normalized to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalCanvas {
    /// 16:9 at 1920x1080.
    Landscape,
    /// 4:5 at 1080x1350.
    Portrait,
}

impl CanonicalCanvas {
    pub fn for_dimensions(width: u32, height: u32, force_landscape: bool) -> Self {
        if force_landscape || width >= height {
            Self::Landscape
        } else {
            Self::Portrait
        }
    }

    pub fn dimensions(self) -> (u32, u32) {
        match self {
            Self::Landscape => (1920, 1080),
            Self::Portrait => (1080, 1350),
        }
    }

    pub fn aspect(self) -> f64 {
        let (width, height) = self.dimensions();
        width as f64 / height as f64
    }
}
