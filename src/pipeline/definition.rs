//! Pipeline definition grammar.
//!
//! ```text
//! definition ::= group ('|' group)*
//! group      ::= stage ('+' stage)*
//! stage      ::= name [ '(' param (',' param)* ')' ]
//! param      ::= ('size' | 'time') '=' value
//! ```
//!
//! Parameters tune the window of a batch stage, e.g. `match(size=50,time=2s)`.
//! Whether a name is an item or batch stage is only known once it is
//! resolved against a registry, so kind-dependent checks live in the composer.

use crate::config::WindowOverride;
use crate::error::{PipeError, Result};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const GROUP_SEPARATOR: char = '|';
const FANOUT_SEPARATOR: char = '+';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub name: String,
    pub window: WindowOverride,
}

impl StageSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            window: WindowOverride::default(),
        }
    }

    pub fn has_params(&self) -> bool {
        !self.window.is_empty()
    }
}

/// Stages combined with `+`; each receives its own copy of every item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageGroup {
    pub stages: Vec<StageSpec>,
}

impl StageGroup {
    pub fn is_fanout(&self) -> bool {
        self.stages.len() > 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDefinition {
    pub groups: Vec<StageGroup>,
}

impl PipelineDefinition {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(PipeError::invalid_definition("definition is empty"));
        }

        let groups = split_top_level(trimmed, GROUP_SEPARATOR)?
            .into_iter()
            .map(|group| parse_group(group, input))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { groups })
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.groups
            .iter()
            .flat_map(|g| g.stages.iter().map(|s| s.name.as_str()))
    }
}

impl FromStr for PipelineDefinition {
    type Err = PipeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PipelineDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, group) in self.groups.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", GROUP_SEPARATOR)?;
            }
            for (j, stage) in group.stages.iter().enumerate() {
                if j > 0 {
                    write!(f, "{}", FANOUT_SEPARATOR)?;
                }
                write!(f, "{}", stage)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for StageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if self.has_params() {
            let mut params = Vec::new();
            if let Some(size) = self.window.max_size {
                params.push(format!("size={}", size));
            }
            if let Some(time) = self.window.max_time {
                params.push(format!("time={}", humantime::format_duration(time)));
            }
            write!(f, "({})", params.join(","))?;
        }
        Ok(())
    }
}

/// Split on `sep` outside parentheses, rejecting separators inside them.
fn split_top_level(input: &str, sep: char) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    PipeError::invalid_definition(format!("unbalanced ')' in '{}'", input))
                })?;
            }
            c if (c == GROUP_SEPARATOR || c == FANOUT_SEPARATOR) && depth > 0 => {
                return Err(PipeError::invalid_definition(format!(
                    "'{}' is not allowed inside stage parameters in '{}'",
                    c, input
                )));
            }
            c if c == sep => {
                parts.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }

    if depth != 0 {
        return Err(PipeError::invalid_definition(format!(
            "unbalanced '(' in '{}'",
            input
        )));
    }

    parts.push(&input[start..]);
    Ok(parts)
}

fn parse_group(group: &str, definition: &str) -> Result<StageGroup> {
    if group.trim().is_empty() {
        return Err(PipeError::invalid_definition(format!(
            "empty stage group in '{}'",
            definition
        )));
    }

    let stages = split_top_level(group, FANOUT_SEPARATOR)?
        .into_iter()
        .map(|stage| parse_stage(stage, definition))
        .collect::<Result<Vec<_>>>()?;

    Ok(StageGroup { stages })
}

fn parse_stage(raw: &str, definition: &str) -> Result<StageSpec> {
    let raw = raw.trim();
    let (name, params) = match raw.find('(') {
        Some(open) => {
            if !raw.ends_with(')') {
                return Err(PipeError::invalid_definition(format!(
                    "trailing characters after parameters of '{}'",
                    raw
                )));
            }
            (raw[..open].trim(), Some(&raw[open + 1..raw.len() - 1]))
        }
        None => (raw, None),
    };

    if name.is_empty() {
        return Err(PipeError::invalid_definition(format!(
            "empty stage name in '{}'",
            definition
        )));
    }

    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(PipeError::invalid_definition(format!(
            "invalid character '{}' in stage name '{}'",
            bad, name
        )));
    }

    let window = match params {
        Some(params) => parse_params(name, params)?,
        None => WindowOverride::default(),
    };

    Ok(StageSpec {
        name: name.to_string(),
        window,
    })
}

fn parse_params(stage: &str, params: &str) -> Result<WindowOverride> {
    let mut window = WindowOverride::default();

    if params.trim().is_empty() {
        return Err(PipeError::invalid_definition(format!(
            "empty parameter list for stage '{}'",
            stage
        )));
    }

    for param in params.split(',') {
        let (key, value) = param.split_once('=').ok_or_else(|| {
            PipeError::invalid_definition(format!(
                "parameter '{}' of stage '{}' must be key=value",
                param.trim(),
                stage
            ))
        })?;
        let (key, value) = (key.trim(), value.trim());

        let repeated = match key {
            "size" => window.max_size.is_some(),
            "time" => window.max_time.is_some(),
            _ => false,
        };
        if repeated {
            return Err(PipeError::invalid_definition(format!(
                "parameter '{}' given more than once for stage '{}'",
                key, stage
            )));
        }

        match key {
            "size" => {
                let size = value.parse::<usize>().ok().filter(|s| *s > 0).ok_or_else(|| {
                    PipeError::invalid_definition(format!(
                        "size of stage '{}' must be a positive integer, got '{}'",
                        stage, value
                    ))
                })?;
                window.max_size = Some(size);
            }
            "time" => {
                let time = parse_duration(value).ok_or_else(|| {
                    PipeError::invalid_definition(format!(
                        "time of stage '{}' must be a positive duration like 500ms, got '{}'",
                        stage, value
                    ))
                })?;
                window.max_time = Some(time);
            }
            other => {
                return Err(PipeError::invalid_definition(format!(
                    "unknown parameter '{}' for stage '{}' (expected size or time)",
                    other, stage
                )));
            }
        }
    }

    Ok(window)
}

fn parse_duration(value: &str) -> Option<Duration> {
    humantime::parse_duration(value)
        .ok()
        .filter(|d| !d.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_groups_and_fanout() {
        let def = PipelineDefinition::parse(" validate + enrich | match ").unwrap();
        assert_eq!(def.groups.len(), 2);
        assert!(def.groups[0].is_fanout());
        assert!(!def.groups[1].is_fanout());
        assert_eq!(
            def.stage_names().collect::<Vec<_>>(),
            vec!["validate", "enrich", "match"]
        );
        assert_eq!(def.to_string(), "validate+enrich|match");
    }

    #[test]
    fn test_parse_window_params() {
        let def: PipelineDefinition = "double|batch(size=2, time=500ms)".parse().unwrap();
        let batch = &def.groups[1].stages[0];
        assert_eq!(batch.name, "batch");
        assert_eq!(batch.window.max_size, Some(2));
        assert_eq!(batch.window.max_time, Some(Duration::from_millis(500)));
        assert_eq!(def.to_string(), "double|batch(size=2,time=500ms)");

        let def = PipelineDefinition::parse("m(time=2s)").unwrap();
        assert_eq!(def.groups[0].stages[0].window.max_size, None);
        assert_eq!(def.groups[0].stages[0].window.max_time, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_invalid_definitions() {
        let cases = [
            "",
            "   ",
            "a||b",
            "a|",
            "|a",
            "a++b",
            "a+",
            "a b",
            "a(size=2",
            "a)size=2(",
            "a(size=0)",
            "a(size=two)",
            "a(time=0ms)",
            "a(time=soon)",
            "a(colour=red)",
            "a()",
            "a(size)",
            "a(size=2)x",
            "a(size=2|3)",
            "a(size=2,size=5)",
            "a(time=1s, time=2s)",
            "(size=2)",
        ];

        for case in cases {
            let result = PipelineDefinition::parse(case);
            assert!(
                matches!(result, Err(PipeError::InvalidDefinition(_))),
                "expected '{}' to be rejected, got {:?}",
                case,
                result
            );
        }
    }

    #[test]
    fn test_repeated_parameter_rejected() {
        let err = PipelineDefinition::parse("m(size=2,time=1s,size=5)").unwrap_err();
        assert!(err.to_string().contains("'size' given more than once"));
    }

    #[test]
    fn test_name_characters() {
        let def = PipelineDefinition::parse("geo.lookup|dedupe_v2+score-1").unwrap();
        assert_eq!(
            def.stage_names().collect::<Vec<_>>(),
            vec!["geo.lookup", "dedupe_v2", "score-1"]
        );
    }
}
