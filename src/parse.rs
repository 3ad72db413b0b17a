//! Request-line parsing.
//!
//! ```text
//! Command
//! Command:arg1,arg2,...
//! Command:{"json":"object"}
//! Object.Child.Command:args
//! ```

/// Separates the command from its arguments (first occurrence only).
pub const COMMAND_SEPARATOR: char = ':';
/// Separates arguments.
pub const ARGUMENT_SEPARATOR: char = ',';
/// Separates object-path segments in the command part.
pub const PATH_SEPARATOR: char = '.';

/// A request line split into its command path and argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedInput {
    /// Dot-separated command segments; the last one is the command name.
    pub segments: Vec<String>,
    pub arguments: Vec<String>,
    /// Whether the input carried a `:` argument section at all.
    pub has_arguments: bool,
}

impl ParsedInput {
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        let (command, raw_args) = match input.split_once(COMMAND_SEPARATOR) {
            Some((cmd, args)) => (cmd, Some(args)),
            None => (input, None),
        };

        let segments = command
            .split(PATH_SEPARATOR)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        let arguments = raw_args.map(split_arguments).unwrap_or_default();

        Self {
            segments,
            arguments,
            has_arguments: raw_args.is_some(),
        }
    }

    /// Final command segment (empty for blank input).
    pub fn name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or("")
    }

    /// Segments before the command name.
    pub fn qualifiers(&self) -> &[String] {
        match self.segments.len() {
            0 => &[],
            n => &self.segments[..n - 1],
        }
    }
}

/// Split a raw argument section.
///
/// A section that is one complete JSON document stays a single argument.
/// Otherwise it is split on commas that are not nested in brackets, braces,
/// or quotes, so `[1,2],3` yields two arguments. `Cmd:` yields one empty
/// argument.
pub fn split_arguments(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with(['{', '[', '"'])
        && serde_json::from_str::<serde_json::Value>(trimmed).is_ok()
    {
        return vec![trimmed.to_string()];
    }

    let mut args = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for c in raw.chars() {
        if in_string {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                current.push(c);
            }
            '[' | '{' => {
                depth += 1;
                current.push(c);
            }
            ']' | '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ARGUMENT_SEPARATOR if depth == 0 => {
                args.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    args.push(current.trim().to_string());
    args
}
