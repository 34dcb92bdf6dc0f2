use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    EmptyRoom,
    Furnish,
    DetailShots,
    Moodboard,
    Upscale,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::EmptyRoom,
        Stage::Furnish,
        Stage::DetailShots,
        Stage::Moodboard,
        Stage::Upscale,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmptyRoom => "empty_room",
            Self::Furnish => "furnish",
            Self::DetailShots => "detail_shots",
            Self::Moodboard => "moodboard",
            Self::Upscale => "upscale",
        }
    }

    /// Prefix used for artifact file names written by this stage.
    pub fn file_prefix(self) -> &'static str {
        match self {
            Self::EmptyRoom => "empty",
            Self::Furnish => "furnished",
            Self::DetailShots => "detail",
            Self::Moodboard => "moodboard",
            Self::Upscale => "upscaled",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
