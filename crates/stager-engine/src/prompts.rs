//! Short prompt templates. Wording is deliberately minimal; stages only
//! depend on which images accompany each prompt.

pub const SYSTEM_INSTRUCTION: &str = "You edit real-estate interior photographs. Keep walls, \
windows, doors, floors, ceiling and camera position exactly as in the source photo.";

/// Close-up subjects cycled through by the detail stage.
pub const DETAIL_FOCI: [&str; 6] = [
    "the main seating arrangement",
    "a styled side table or shelf",
    "textiles and cushions",
    "the lighting fixtures",
    "a decor vignette with plants",
    "material and texture contrasts",
];

pub fn empty_room() -> String {
    "Remove every piece of furniture, rug, decor item and clutter from this room. \
Return the same room completely empty, with identical architecture, lighting and framing."
        .to_string()
}

/// The first image is the empty room, the second the style reference.
pub fn furnish(variant: usize, total: usize) -> String {
    format!(
        "Furnish the empty room from the first image in the style of the second image. \
Keep the room geometry and camera unchanged. Variation {} of {}.",
        variant + 1,
        total.max(1)
    )
}

pub fn detail_shot(index: usize) -> String {
    let focus = DETAIL_FOCI[index % DETAIL_FOCI.len()];
    format!(
        "Create a photorealistic close-up detail shot of {focus} in this furnished room, \
matching its furniture, palette and light."
    )
}

pub fn moodboard(with_furnished: bool) -> String {
    let source = if with_furnished {
        "the style reference and the furnished room"
    } else {
        "the style reference"
    };
    format!(
        "Compose a clean interior-design moodboard from {source}: material swatches, \
colour palette chips and key furniture pieces on a neutral background."
    )
}

#[cfg(test)]
mod tests {
    use super::{detail_shot, furnish, moodboard, DETAIL_FOCI};

    #[test]
    fn furnish_numbers_variants_from_one() {
        assert!(furnish(0, 3).contains("Variation 1 of 3"));
        assert!(furnish(0, 0).contains("of 1"));
    }

    #[test]
    fn detail_focus_cycles() {
        assert_eq!(detail_shot(0), detail_shot(DETAIL_FOCI.len()));
        assert_ne!(detail_shot(0), detail_shot(1));
    }

    #[test]
    fn moodboard_mentions_furnished_source_only_when_present() {
        assert!(moodboard(true).contains("furnished room"));
        assert!(!moodboard(false).contains("furnished room"));
    }
}
