//! Color palettes as 256-entry lookup tables.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

pub type Lut = [[u8; 3]; 256];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Palette {
    /// Grayscale passthrough.
    #[default]
    None,
    Autumn,
    Bone,
    Jet,
    Hot,
    Cool,
    Ironbow,
    Inferno,
    Magma,
    Plasma,
    Viridis,
    Turbo,
}

enum Stops {
    /// Colors spaced evenly over [0, 1].
    Even(&'static [[u8; 3]]),
    /// `(position, color)` pairs with increasing positions in [0, 1].
    At(&'static [(f32, [u8; 3])]),
}

const INFERNO: &[[u8; 3]] = &[
    [0, 0, 4],
    [31, 12, 72],
    [85, 15, 109],
    [136, 34, 106],
    [186, 54, 85],
    [227, 89, 51],
    [249, 140, 10],
    [249, 201, 50],
    [252, 255, 164],
];

const MAGMA: &[[u8; 3]] = &[
    [0, 0, 4],
    [28, 16, 68],
    [79, 18, 123],
    [129, 37, 129],
    [181, 54, 122],
    [229, 80, 100],
    [251, 135, 97],
    [254, 194, 135],
    [252, 253, 191],
];

const PLASMA: &[[u8; 3]] = &[
    [13, 8, 135],
    [84, 2, 163],
    [139, 10, 165],
    [185, 50, 137],
    [219, 92, 104],
    [244, 136, 73],
    [254, 188, 43],
    [240, 249, 33],
];

const VIRIDIS: &[[u8; 3]] = &[
    [68, 1, 84],
    [72, 40, 120],
    [62, 74, 137],
    [49, 104, 142],
    [38, 130, 142],
    [31, 158, 137],
    [53, 183, 121],
    [110, 206, 88],
    [181, 222, 43],
    [253, 231, 37],
];

const TURBO: &[[u8; 3]] = &[
    [48, 18, 59],
    [70, 107, 227],
    [40, 187, 236],
    [50, 241, 151],
    [163, 253, 60],
    [237, 208, 58],
    [251, 128, 34],
    [210, 49, 5],
    [122, 4, 3],
];

const JET: &[(f32, [u8; 3])] = &[
    (0.0, [0, 0, 128]),
    (0.125, [0, 0, 255]),
    (0.375, [0, 255, 255]),
    (0.625, [255, 255, 0]),
    (0.875, [255, 0, 0]),
    (1.0, [128, 0, 0]),
];

const HOT: &[(f32, [u8; 3])] = &[
    (0.0, [0, 0, 0]),
    (0.375, [255, 0, 0]),
    (0.75, [255, 255, 0]),
    (1.0, [255, 255, 255]),
];

const BONE: &[(f32, [u8; 3])] = &[
    (0.0, [0, 0, 0]),
    (0.375, [84, 84, 116]),
    (0.75, [166, 198, 198]),
    (1.0, [255, 255, 255]),
];

const IRONBOW: &[(f32, [u8; 3])] = &[
    (0.0, [0, 0, 0]),
    (0.15, [32, 0, 140]),
    (0.35, [145, 0, 160]),
    (0.55, [230, 70, 40]),
    (0.75, [250, 160, 0]),
    (0.9, [255, 230, 60]),
    (1.0, [255, 255, 255]),
];

impl Palette {
    pub const ALL: [Palette; 12] = [
        Palette::None,
        Palette::Autumn,
        Palette::Bone,
        Palette::Jet,
        Palette::Hot,
        Palette::Cool,
        Palette::Ironbow,
        Palette::Inferno,
        Palette::Magma,
        Palette::Plasma,
        Palette::Viridis,
        Palette::Turbo,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Autumn => "autumn",
            Self::Bone => "bone",
            Self::Jet => "jet",
            Self::Hot => "hot",
            Self::Cool => "cool",
            Self::Ironbow => "ironbow",
            Self::Inferno => "inferno",
            Self::Magma => "magma",
            Self::Plasma => "plasma",
            Self::Viridis => "viridis",
            Self::Turbo => "turbo",
        }
    }

    fn stops(self) -> Stops {
        match self {
            Self::None => Stops::Even(&[[0, 0, 0], [255, 255, 255]]),
            Self::Autumn => Stops::Even(&[[255, 0, 0], [255, 255, 0]]),
            Self::Cool => Stops::Even(&[[0, 255, 255], [255, 0, 255]]),
            Self::Bone => Stops::At(BONE),
            Self::Jet => Stops::At(JET),
            Self::Hot => Stops::At(HOT),
            Self::Ironbow => Stops::At(IRONBOW),
            Self::Inferno => Stops::Even(INFERNO),
            Self::Magma => Stops::Even(MAGMA),
            Self::Plasma => Stops::Even(PLASMA),
            Self::Viridis => Stops::Even(VIRIDIS),
            Self::Turbo => Stops::Even(TURBO),
        }
    }

    /// Lookup table for this palette, built on first use.
    pub fn lut(self) -> &'static Lut {
        static LUTS: OnceLock<Vec<Lut>> = OnceLock::new();
        let luts = LUTS.get_or_init(|| Palette::ALL.iter().map(|p| build_lut(p.stops())).collect());
        &luts[self as usize]
    }

    pub fn apply(self, value: u8) -> [u8; 3] {
        self.lut()[value as usize]
    }
}

fn build_lut(stops: Stops) -> Lut {
    let points: Vec<(f32, [u8; 3])> = match stops {
        Stops::Even(colors) => {
            let last = (colors.len() - 1).max(1) as f32;
            colors
                .iter()
                .enumerate()
                .map(|(i, c)| (i as f32 / last, *c))
                .collect()
        }
        Stops::At(points) => points.to_vec(),
    };

    let mut lut = [[0u8; 3]; 256];
    for (i, entry) in lut.iter_mut().enumerate() {
        let t = i as f32 / 255.0;
        let upper = points
            .iter()
            .position(|(pos, _)| *pos >= t)
            .unwrap_or(points.len() - 1)
            .max(1);
        let (p0, c0) = points[upper - 1];
        let (p1, c1) = points[upper];
        let f = if p1 > p0 { ((t - p0) / (p1 - p0)).clamp(0.0, 1.0) } else { 1.0 };
        for ch in 0..3 {
            let v = c0[ch] as f32 + (c1[ch] as f32 - c0[ch] as f32) * f;
            entry[ch] = v.round().clamp(0.0, 255.0) as u8;
        }
    }
    lut
}

impl fmt::Display for Palette {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Palette {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Palette::ALL
            .into_iter()
            .find(|p| p.name() == lower)
            .ok_or_else(|| {
                let names: Vec<&str> = Palette::ALL.iter().map(|p| p.name()).collect();
                format!("unknown palette '{s}' (expected one of: {})", names.join(", "))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_is_grayscale() {
        for v in [0u8, 1, 127, 128, 254, 255] {
            assert_eq!(Palette::None.apply(v), [v, v, v]);
        }
    }

    #[test]
    fn test_luts_hit_endpoints() {
        assert_eq!(Palette::Jet.apply(0), [0, 0, 128]);
        assert_eq!(Palette::Jet.apply(255), [128, 0, 0]);
        assert_eq!(Palette::Hot.apply(255), [255, 255, 255]);
        assert_eq!(Palette::Viridis.apply(0), [68, 1, 84]);
        assert_eq!(Palette::Viridis.apply(255), [253, 231, 37]);
        assert_eq!(Palette::Autumn.apply(128), [255, 128, 0]);
    }

    #[test]
    fn test_ironbow_brightens() {
        let luma = |c: [u8; 3]| c.iter().map(|&v| v as u32).sum::<u32>();
        assert!(luma(Palette::Ironbow.apply(40)) < luma(Palette::Ironbow.apply(200)));
    }

    #[test]
    fn test_parse_names() {
        for palette in Palette::ALL {
            assert_eq!(palette.name().parse::<Palette>().unwrap(), palette);
        }
        assert_eq!("Inferno".parse::<Palette>().unwrap(), Palette::Inferno);
        assert!("sepia".parse::<Palette>().is_err());
    }
}
