use shiny::engine::config::FrameWindow;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid frame range '{0}'. Expected 'FIRST:LAST:STEP' (e.g., '0:23:1' or '2:').")]
    InvalidFrameRange(String),

    #[error("Component '{component}' of frame range '{range}' is not a non-negative integer.")]
    InvalidComponent {
        component: &'static str,
        range: String,
    },
}

/// Parses `FIRST[:LAST[:STEP]]`. An empty or negative LAST means the final movie frame and
/// an omitted STEP means every frame.
pub fn parse_frame_range(range: &str) -> Result<FrameWindow, ParseError> {
    let parts: Vec<&str> = range.trim().split(':').map(str::trim).collect();
    if parts.is_empty() || parts.len() > 3 || parts[0].is_empty() {
        return Err(ParseError::InvalidFrameRange(range.to_string()));
    }

    let number = |component: &'static str, text: &str| -> Result<usize, ParseError> {
        text.parse().map_err(|_| ParseError::InvalidComponent {
            component,
            range: range.to_string(),
        })
    };

    let first = number("FIRST", parts[0])?;
    let last = match parts.get(1) {
        None | Some(&"") => None,
        Some(text) if text.starts_with('-') => None,
        Some(text) => Some(number("LAST", text)?),
    };
    let step = match parts.get(2) {
        None | Some(&"") => 1,
        Some(text) => number("STEP", text)?,
    };
    Ok(FrameWindow { first, last, step })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_range_is_parsed() {
        let window = parse_frame_range("1:3:2").unwrap();
        assert_eq!(window, FrameWindow { first: 1, last: Some(3), step: 2 });
    }

    #[test]
    fn open_and_negative_last_mean_final_frame() {
        assert_eq!(parse_frame_range("2:").unwrap().last, None);
        assert_eq!(parse_frame_range("2:-1").unwrap().last, None);
        assert_eq!(parse_frame_range("4").unwrap(), FrameWindow { first: 4, last: None, step: 1 });
    }

    #[test]
    fn malformed_ranges_are_rejected() {
        assert_eq!(
            parse_frame_range("1:2:3:4"),
            Err(ParseError::InvalidFrameRange("1:2:3:4".to_string()))
        );
        assert!(matches!(
            parse_frame_range("a:3"),
            Err(ParseError::InvalidComponent { component: "FIRST", .. })
        ));
        assert!(matches!(
            parse_frame_range("0:3:x"),
            Err(ParseError::InvalidComponent { component: "STEP", .. })
        ));
        assert!(parse_frame_range(":3").is_err());
    }
}
