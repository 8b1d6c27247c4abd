//! Console and error capture helpers.

use crate::value::RpcValue;

/// Position in generated code mapped back to authored source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedPosition {
    pub source: String,
    pub line: u32,
    pub column: u32,
}

/// Source-map lookup. Implementations return `None` for positions they do
/// not cover.
pub trait PositionMapper: Send + Sync {
    fn map(&self, source: &str, line: u32, column: u32) -> Option<MappedPosition>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityMapper;

impl PositionMapper for IdentityMapper {
    fn map(&self, _source: &str, _line: u32, _column: u32) -> Option<MappedPosition> {
        None
    }
}

/// Join console arguments the way devtools prints them.
pub fn format_console_args(args: &[RpcValue]) -> String {
    args.iter()
        .map(RpcValue::display_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split `source:line:column` from the right.
fn split_location(location: &str) -> Option<(&str, u32, u32)> {
    let (rest, column) = location.rsplit_once(':')?;
    let (source, line) = rest.rsplit_once(':')?;
    Some((source, line.parse().ok()?, column.parse().ok()?))
}

fn remap_frame(frame: &str, mapper: &dyn PositionMapper) -> String {
    // `at fn (source:1:2)` or `at source:1:2` or `fn@source:1:2`
    let (prefix, location, suffix) = if let Some(open) = frame.rfind('(') {
        match frame[open..].find(')') {
            Some(close) => (
                &frame[..=open],
                &frame[open + 1..open + close],
                &frame[open + close..],
            ),
            None => return frame.to_string(),
        }
    } else if let Some(at) = frame.rfind(['@', ' ']) {
        (&frame[..=at], &frame[at + 1..], "")
    } else {
        ("", frame, "")
    };

    let Some((source, line, column)) = split_location(location.trim()) else {
        return frame.to_string();
    };
    match mapper.map(source, line, column) {
        Some(mapped) => format!(
            "{prefix}{}:{}:{}{suffix}",
            mapped.source, mapped.line, mapped.column
        ),
        None => frame.to_string(),
    }
}

/// Rewrite every frame of a stack trace through `mapper`.
pub fn remap_stack(stack: &str, mapper: &dyn PositionMapper) -> String {
    stack
        .lines()
        .map(|line| remap_frame(line, mapper))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Message and stack of a rejection reason or thrown value.
pub fn describe_reason(reason: &RpcValue) -> (String, Option<String>) {
    match reason {
        RpcValue::Error {
            name,
            message,
            stack,
        } => (format!("{name}: {message}"), stack.clone()),
        other => (other.display_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ShiftMapper;

    impl PositionMapper for ShiftMapper {
        fn map(&self, source: &str, line: u32, column: u32) -> Option<MappedPosition> {
            (source == "widget.js").then(|| MappedPosition {
                source: "src/App.tsx".into(),
                line: line + 100,
                column: column + 1,
            })
        }
    }

    #[test]
    fn remaps_known_frames_only() {
        let stack = "TypeError: x is undefined\n    at render (widget.js:3:14)\n    at widget.js:9:2\n    at run (https://cdn.example/lib.js:1:5)";
        let remapped = remap_stack(stack, &ShiftMapper);
        assert_eq!(
            remapped,
            "TypeError: x is undefined\n    at render (src/App.tsx:103:15)\n    at src/App.tsx:109:3\n    at run (https://cdn.example/lib.js:1:5)"
        );
    }

    #[test]
    fn formats_arguments() {
        let args = vec![
            RpcValue::from("count"),
            RpcValue::Number(3.0),
            RpcValue::Bool(true),
        ];
        assert_eq!(format_console_args(&args), "count 3 true");
    }

    #[test]
    fn describes_error_reasons() {
        let (message, stack) = describe_reason(&RpcValue::Error {
            name: "RangeError".into(),
            message: "too far".into(),
            stack: Some("at f (widget.js:1:1)".into()),
        });
        assert_eq!(message, "RangeError: too far");
        assert!(stack.is_some());
        assert_eq!(describe_reason(&RpcValue::from("plain")).0, "plain");
    }
}
