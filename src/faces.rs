//! Fragment catalogs and the kinds of service this binary can run as.

use rand::seq::SliceRandom;
use std::fmt;
use std::str::FromStr;

/// Which fragment a process serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Color,
    Smiley,
    Shape,
    Quote,
    /// Composes `smiley` and `color` from their services.
    Face,
}

impl ServiceKind {
    /// Name used in configuration, logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            ServiceKind::Color => "color",
            ServiceKind::Smiley => "smiley",
            ServiceKind::Shape => "shape",
            ServiceKind::Quote => "quote",
            ServiceKind::Face => "face",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "color" => Ok(ServiceKind::Color),
            "smiley" => Ok(ServiceKind::Smiley),
            "shape" => Ok(ServiceKind::Shape),
            "quote" => Ok(ServiceKind::Quote),
            "face" => Ok(ServiceKind::Face),
            other => Err(format!("unknown service kind '{}'", other)),
        }
    }
}

/// Smileys as HTML entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Smiley {
    Smiling,
    Sleeping,
    Cursing,
    Kaboom,
    HeartEyes,
    Neutral,
    RollingEyes,
    Screaming,
}

impl Smiley {
    pub const ALL: [Smiley; 8] = [
        Smiley::Smiling,
        Smiley::Sleeping,
        Smiley::Cursing,
        Smiley::Kaboom,
        Smiley::HeartEyes,
        Smiley::Neutral,
        Smiley::RollingEyes,
        Smiley::Screaming,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Smiley::Smiling => "Smiling",
            Smiley::Sleeping => "Sleeping",
            Smiley::Cursing => "Cursing",
            Smiley::Kaboom => "Kaboom",
            Smiley::HeartEyes => "HeartEyes",
            Smiley::Neutral => "Neutral",
            Smiley::RollingEyes => "RollingEyes",
            Smiley::Screaming => "Screaming",
        }
    }

    pub fn entity(&self) -> &'static str {
        match self {
            Smiley::Smiling => "&#x1F603;",
            Smiley::Sleeping => "&#x1F634;",
            Smiley::Cursing => "&#x1F92C;",
            Smiley::Kaboom => "&#x1F92F;",
            Smiley::HeartEyes => "&#x1F60D;",
            Smiley::Neutral => "&#x1F610;",
            Smiley::RollingEyes => "&#x1F644;",
            Smiley::Screaming => "&#x1F631;",
        }
    }

    /// Looks a smiley up by name; unknown names give `Neutral`.
    pub fn lookup(name: &str) -> Smiley {
        Self::ALL
            .iter()
            .copied()
            .find(|s| s.name().eq_ignore_ascii_case(name.trim()))
            .unwrap_or(Smiley::Neutral)
    }
}

/// Named colors from a colorblind-friendly palette.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Grey,
    Purple,
    Green,
    Blue,
    Yellow,
    Pink,
    HotPink,
    Red,
}

impl Color {
    /// CSS value for the color.
    pub fn value(&self) -> &'static str {
        match self {
            Color::Grey => "grey",
            Color::Purple => "rgb(48 34 130)",
            Color::Green => "rgb(55 117 59)",
            Color::Blue => "rgb(151 202 234)",
            Color::Yellow => "rgb(218 204 130)",
            Color::Pink => "rgb(191 108 120)",
            Color::HotPink => "rgb(158 75 149)",
            Color::Red => "rgb(125 42 83)",
        }
    }

    /// Maps a palette name to its CSS value, passing other strings through.
    pub fn resolve(name: &str) -> String {
        let color = match name.trim().to_ascii_lowercase().as_str() {
            "grey" => Color::Grey,
            "purple" => Color::Purple,
            "green" => Color::Green,
            "blue" => Color::Blue,
            "yellow" => Color::Yellow,
            "pink" => Color::Pink,
            "hotpink" => Color::HotPink,
            "red" => Color::Red,
            _ => return name.to_string(),
        };
        color.value().to_string()
    }
}

/// SVG path drawn when no shape is available.
pub const CROSSED_OUT_SHAPE: &str = "M14,15 m-5,-5 l10,10 m0,-10 l-10,10 \
M36,15 m-5,-5 l10,10 m0,-10 l-10,10 \
M10,34.5 c0,-7.5 30,-7.5 30,0";

/// Quote used when the quote service fails.
pub const FALLBACK_QUOTE: &str = "You fell victim to one of the classic blunders!";

/// SVG paths for the shape service.
pub const SHAPES: [&str; 7] = [
    "M14,15 m-6,0 a6,6.0 -0.0 1,0 12,0 a6,6.0 -0.0 1,0 -12,0 \
     M36,15 m-6,0 a6,6.0 0.0 1,0 12,0 a6,6.0 0.0 1,0 -12,0 \
     M10,27.0 c0,15.0 30,15.0 30,0",
    "M14,15 m-6,0 a6,4.8 10.0 1,0 12,0 a6,4.8 10.0 1,0 -12,0 \
     M36,15 m-6,0 a6,4.8 -10.0 1,0 12,0 a6,4.8 -10.0 1,0 -12,0 \
     M10,28.0 c0,12.0 30,12.0 30,0",
    "M15,15 m-2,0 a2,5.0 -15.0 1,0 4,0 a2,5.0 -15.0 1,0 -4,0 \
     M35,15 m-2,0 a2,5.0 15.0 1,0 4,0 a2,5.0 15.0 1,0 -4,0 \
     M10,31.0 c0,3.0 30,3.0 30,0",
    "M15,15 m-4,0 a4,2.0 -10.0 1,0 8,0 a4,2.0 -10.0 1,0 -8,0 \
     M35,15 m-4,0 a4,2.0 10.0 1,0 8,0 a4,2.0 10.0 1,0 -8,0 \
     M10,27.0 c0,15.0 30,15.0 30,0",
    "M15,15 m-4,0 a4,2.0 -10.0 1,0 8,0 a4,2.0 -10.0 1,0 -8,0 \
     M35,15 m-4,0 a4,2.0 10.0 1,0 8,0 a4,2.0 10.0 1,0 -8,0 \
     M10,33.0 c0,-3.0 30,-3.0 30,0",
    "M14,15 m-4,0 a4,2.8 -0.0 1,0 8,0 a4,2.8 -0.0 1,0 -8,0 \
     M36,15 m-4,0 a4,2.8 0.0 1,0 8,0 a4,2.8 0.0 1,0 -8,0 \
     M10,34.5 c0,-7.5 30,-7.5 30,0",
    "M14,15 m-6,0 a6,6.0 -0.0 1,0 12,0 a6,6.0 -0.0 1,0 -12,0 \
     M36,15 m-6,0 a6,6.0 0.0 1,0 12,0 a6,6.0 0.0 1,0 -12,0 \
     M10,37.0 c0,-15.0 30,-15.0 30,0",
];

pub const QUOTES: [&str; 10] = [
    "Abstraction is ever present.",
    "A late night does not make any sense.",
    "A principal idea is omnipresent, much like candy.",
    "Nihilism gambles with lives, happiness, and even destiny itself!",
    "The light at the end of the tunnel is interdependent on the relatedness of motivation, subcultures, and management.",
    "Utter nonsense is a storyteller without equal.",
    "Non-locality is the driver of truth. By summoning, we vibrate.",
    "A small mercy is nothing at all?",
    "The last sentence you read is often sensible nonsense.",
    "668: The Neighbor of the Beast.",
];

/// Picks one entry at random.
pub fn pick(choices: &[&'static str]) -> &'static str {
    choices
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or_default()
}
