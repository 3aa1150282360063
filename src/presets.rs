//! Static content tables: preset watermark phrases and export size presets.

/// Key of the preset whose content is the user's own text.
pub const CUSTOM_PRESET_KEY: &str = "customize";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preset {
    pub key: &'static str,
    pub description: &'static str,
    /// Rendered text. Empty for the custom preset.
    pub content: &'static str,
}

pub const PRESETS: &[Preset] = &[
    Preset {
        key: "confidential",
        description: "Confidential, do not distribute",
        content: "CONFIDENTIAL · DO NOT DISTRIBUTE",
    },
    Preset {
        key: "internal",
        description: "Internal use only",
        content: "INTERNAL USE ONLY",
    },
    Preset {
        key: "draft",
        description: "Draft, not final",
        content: "DRAFT · NOT FINAL",
    },
    Preset {
        key: "no_copy",
        description: "Copying prohibited",
        content: "NO COPYING",
    },
    Preset {
        key: CUSTOM_PRESET_KEY,
        description: "Custom text",
        content: "",
    },
];

pub fn preset(key: &str) -> Option<&'static Preset> {
    PRESETS.iter().find(|p| p.key == key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizePreset {
    pub key: &'static str,
    pub description: &'static str,
    pub width: u32,
    pub height: u32,
    /// Free numeric entry; `width`/`height` are only the initial values.
    pub custom: bool,
}

pub const SIZE_PRESETS: &[SizePreset] = &[
    SizePreset {
        key: "size1",
        description: "800 × 600",
        width: 800,
        height: 600,
        custom: false,
    },
    SizePreset {
        key: "size2",
        description: "1920 × 1080",
        width: 1920,
        height: 1080,
        custom: false,
    },
    SizePreset {
        key: "size3",
        description: "Custom size",
        width: 800,
        height: 600,
        custom: true,
    },
];

pub fn size_preset(key: &str) -> Option<&'static SizePreset> {
    SIZE_PRESETS.iter().find(|p| p.key == key)
}
