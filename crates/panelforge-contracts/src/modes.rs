use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What the user asked for on a gallery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingMode {
    None,
    Color,
    Translate,
    Full,
}

impl ProcessingMode {
    pub const ALL: [ProcessingMode; 4] = [
        ProcessingMode::None,
        ProcessingMode::Color,
        ProcessingMode::Translate,
        ProcessingMode::Full,
    ];

    /// Ordered stage list; each stage after the first reads the previous stage's output.
    pub fn stages(self) -> &'static [Stage] {
        match self {
            ProcessingMode::None => &[],
            ProcessingMode::Color => &[Stage::ColorOnly],
            ProcessingMode::Translate => &[Stage::TranslateOnly],
            ProcessingMode::Full => &[Stage::ColorOnly, Stage::TranslateFromColor],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ProcessingMode::None => "None",
            ProcessingMode::Color => "Color",
            ProcessingMode::Translate => "Translate",
            ProcessingMode::Full => "Full",
        }
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProcessingMode {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        ProcessingMode::ALL
            .into_iter()
            .find(|mode| mode.name().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| anyhow::anyhow!("unknown processing mode '{trimmed}'"))
    }
}

/// Where a stage reads its pages from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageInput {
    OriginalSource,
    PreviousStage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    ColorOnly,
    TranslateOnly,
    TranslateFromColor,
}

const COLOR_INSTRUCTION: &str = "Colorize this black-and-white manga page. Keep the line art, \
panel layout, text, and speech bubbles exactly as they are. Use natural, consistent colors for \
skin, hair, clothing, and backgrounds. Return only the colorized image.";

const TRANSLATE_INSTRUCTION: &str = "Translate all text in this manga page into English. \
Replace the text inside speech bubbles and captions with the translation, matching the \
original lettering style and keeping it inside the bubbles. Do not change the artwork. \
Return only the edited image.";

const TRANSLATE_COLORED_INSTRUCTION: &str = "Translate all text in this colored manga page \
into English. Replace the text inside speech bubbles and captions with the translation, \
matching the original lettering style and keeping it inside the bubbles. Preserve every color \
and all artwork unchanged. Return only the edited image.";

impl Stage {
    pub fn instruction(self) -> &'static str {
        match self {
            Stage::ColorOnly => COLOR_INSTRUCTION,
            Stage::TranslateOnly => TRANSLATE_INSTRUCTION,
            Stage::TranslateFromColor => TRANSLATE_COLORED_INSTRUCTION,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Stage::ColorOnly => "[AI-Color]",
            Stage::TranslateOnly => "[AI-Translate]",
            Stage::TranslateFromColor => "[AI-Color-Translate]",
        }
    }

    /// Added to `source_id * 10` to form the registered output id.
    pub fn offset(self) -> u64 {
        match self {
            Stage::ColorOnly => 1,
            Stage::TranslateOnly => 2,
            Stage::TranslateFromColor => 3,
        }
    }

    pub fn input(self) -> StageInput {
        match self {
            Stage::ColorOnly | Stage::TranslateOnly => StageInput::OriginalSource,
            Stage::TranslateFromColor => StageInput::PreviousStage,
        }
    }

    pub fn derived_id(self, source_id: u64) -> u64 {
        source_id.saturating_mul(10).saturating_add(self.offset())
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::ColorOnly => "color",
            Stage::TranslateOnly => "translate",
            Stage::TranslateFromColor => "translate-colored",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_expand_to_expected_stage_lists() {
        assert!(ProcessingMode::None.stages().is_empty());
        assert_eq!(ProcessingMode::Color.stages(), &[Stage::ColorOnly]);
        assert_eq!(ProcessingMode::Translate.stages(), &[Stage::TranslateOnly]);
        assert_eq!(
            ProcessingMode::Full.stages(),
            &[Stage::ColorOnly, Stage::TranslateFromColor]
        );
    }

    #[test]
    fn only_translate_from_color_chains() {
        assert_eq!(Stage::ColorOnly.input(), StageInput::OriginalSource);
        assert_eq!(Stage::TranslateOnly.input(), StageInput::OriginalSource);
        assert_eq!(Stage::TranslateFromColor.input(), StageInput::PreviousStage);
    }

    #[test]
    fn derived_ids_are_distinct_per_stage() {
        assert_eq!(Stage::ColorOnly.derived_id(7), 71);
        assert_eq!(Stage::TranslateOnly.derived_id(7), 72);
        assert_eq!(Stage::TranslateFromColor.derived_id(7), 73);
    }

    #[test]
    fn mode_names_parse_case_insensitively() -> anyhow::Result<()> {
        assert_eq!("full".parse::<ProcessingMode>()?, ProcessingMode::Full);
        assert_eq!(" Color ".parse::<ProcessingMode>()?, ProcessingMode::Color);
        assert!("sepia".parse::<ProcessingMode>().is_err());
        Ok(())
    }
}
