//! Splits `[emotion]` tags out of a finalized reply.

use proto::{Emotion, Screenplay};

/// Builds a [`Screenplay`] from reply text.
///
/// The first recognized tag decides the emotion; every recognized tag is
/// removed from the text. Bracketed text that is not an emotion is kept.
pub fn parse(reply: &str) -> Screenplay {
    let mut emotion = None;
    let mut text = String::with_capacity(reply.len());
    let mut rest = reply;

    // Pair each `]` with the nearest `[` before it so nested tags still match.
    while let Some(close) = rest.find(']') {
        let Some(open) = rest[..close].rfind('[') else {
            text.push_str(&rest[..=close]);
            rest = &rest[close + 1..];
            continue;
        };
        text.push_str(&rest[..open]);
        match rest[open + 1..close].trim().parse::<Emotion>() {
            Ok(tag) => {
                emotion.get_or_insert(tag);
            }
            Err(_) => text.push_str(&rest[open..=close]),
        }
        rest = &rest[close + 1..];
    }
    text.push_str(rest);

    Screenplay {
        emotion: emotion.unwrap_or_default(),
        text: text.split_whitespace().collect::<Vec<_>>().join(" "),
    }
}
