use crossterm::style::Color;

/// Tokens whose probability is strictly above this are considered high-confidence.
pub const PROBABILITY_THRESHOLD: f64 = 0.5;

/// The display bucket for a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    High,
    Low,
}

impl Confidence {
    /// Background color used for the terminal.
    pub fn terminal_color(self) -> Color {
        match self {
            Confidence::High => Color::DarkGreen,
            Confidence::Low => Color::DarkRed,
        }
    }

    /// Background color used for the HTML export.
    pub fn css_color(self) -> &'static str {
        match self {
            Confidence::High => "green",
            Confidence::Low => "red",
        }
    }
}

/// Maps a natural-log probability to its confidence bucket.
///
/// A probability of exactly `PROBABILITY_THRESHOLD` is `Low`, as is NaN.
pub fn color_for(logprob: f64) -> Confidence {
    if logprob.exp() > PROBABILITY_THRESHOLD {
        Confidence::High
    } else {
        Confidence::Low
    }
}
