//! Pattern-library priority tuning: read the current priority and apply a
//! targeted line edit rather than a parse-mutate-reserialize round trip, so
//! comments and unrelated formatting survive untouched.

use std::path::{Path, PathBuf};

use crate::error::{LearningError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuningStrategy {
    Conservative,
    Moderate,
    Aggressive,
}

impl TuningStrategy {
    pub fn max_adjustment(&self) -> f64 {
        match self {
            Self::Conservative => 5.0,
            Self::Moderate => 15.0,
            Self::Aggressive => 30.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuningConfidence {
    Low,
    Medium,
    High,
}

/// `priority_delta = round((score - 0.5) * max_adjustment * 2)`, halved for
/// low-sample patterns.
pub fn priority_delta(score: f64, strategy: TuningStrategy, usage: u64) -> (i32, TuningConfidence) {
    let raw = ((score - 0.5) * strategy.max_adjustment() * 2.0).round();
    let confidence = if usage < 50 {
        TuningConfidence::Low
    } else if usage < 200 {
        TuningConfidence::Medium
    } else {
        TuningConfidence::High
    };
    let delta = if usage < 50 { (raw / 2.0).round() as i32 } else { raw as i32 };
    (delta, confidence)
}

pub fn clamp_priority(current: i32, delta: i32) -> i32 {
    (current + delta).clamp(0, 100)
}

/// Find the YAML file for `pattern_name` under `library_path`; matches by
/// file stem or by grepping for `name: <pattern_name>`.
pub fn find_pattern_yaml_file(library_path: &Path, pattern_name: &str) -> Result<PathBuf> {
    let entries = std::fs::read_dir(library_path).map_err(LearningError::from)?;
    for entry in entries {
        let entry = entry.map_err(LearningError::from)?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") && path.extension().and_then(|e| e.to_str()) != Some("yml") {
            continue;
        }
        let contents = std::fs::read_to_string(&path).map_err(LearningError::from)?;
        if contents.lines().any(|line| is_name_line(line, pattern_name)) {
            return Ok(path);
        }
    }
    Err(LearningError::NotFound(format!("pattern YAML file for '{pattern_name}'")))
}

/// Default 50 if the entry has no explicit `priority` field.
pub fn get_current_priority(file: &Path, pattern_name: &str) -> Result<i32> {
    let contents = std::fs::read_to_string(file).map_err(LearningError::from)?;
    match entry_span(&contents, pattern_name) {
        Some((start, end)) => {
            for line in contents[start..end].lines() {
                let trimmed = line.trim_start();
                if let Some(rest) = trimmed.strip_prefix("priority:") {
                    return rest.trim().parse::<i32>().map_err(|_| LearningError::Validation(format!("unparseable priority in {}", file.display())));
                }
            }
            Ok(50)
        }
        None => Err(LearningError::NotFound(format!("pattern '{pattern_name}' in {}", file.display()))),
    }
}

/// Rewrite only the matching entry's `priority:` scalar line; every other
/// byte in the file is preserved verbatim.
pub fn update_pattern_priority(file: &Path, pattern_name: &str, new_priority: i32) -> Result<()> {
    let contents = std::fs::read_to_string(file).map_err(LearningError::from)?;
    let (start, end) = entry_span(&contents, pattern_name)
        .ok_or_else(|| LearningError::NotFound(format!("pattern '{pattern_name}' in {}", file.display())))?;

    let mut out = String::with_capacity(contents.len());
    out.push_str(&contents[..start]);

    let mut replaced = false;
    let entry_text = &contents[start..end];
    for line in entry_text.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if !replaced && trimmed.starts_with("priority:") {
            let indent = &line[..line.len() - line.trim_start().len()];
            let newline = if line.ends_with('\n') { "\n" } else { "" };
            out.push_str(indent);
            out.push_str("priority: ");
            out.push_str(&new_priority.to_string());
            out.push_str(newline);
            replaced = true;
        } else {
            out.push_str(line);
        }
    }
    out.push_str(&contents[end..]);

    if !replaced {
        return Err(LearningError::NotFound(format!(
            "entry for '{pattern_name}' has no priority field to rewrite in {}",
            file.display()
        )));
    }

    std::fs::write(file, out).map_err(LearningError::from)
}

/// True if `line`'s trimmed content is exactly a YAML `name:` scalar (bare
/// or list-item form) for `pattern_name`, not merely a substring match —
/// so `join` never matches an entry named `join_hint`.
fn is_name_line(line: &str, pattern_name: &str) -> bool {
    let trimmed = line.trim();
    let trimmed = trimmed.strip_prefix("- ").unwrap_or(trimmed);
    trimmed == format!("name: {pattern_name}") || trimmed == format!("name: \"{pattern_name}\"")
}

/// Indentation width (in spaces) of the first `entries[*]` list item found,
/// i.e. the column at which top-level entry blocks begin.
fn top_level_indent(contents: &str) -> Option<usize> {
    contents
        .lines()
        .find(|line| line.trim_start().starts_with("- "))
        .map(|line| line.len() - line.trim_start().len())
}

/// Byte range of the `entries[*]` block whose `name:` matches
/// `pattern_name`, bounded by the next list item at the same indentation
/// (not a nested sequence inside the entry) or end of file.
fn entry_span(contents: &str, pattern_name: &str) -> Option<(usize, usize)> {
    let indent = top_level_indent(contents)?;

    let mut item_starts: Vec<usize> = Vec::new();
    let mut offset = 0;
    for line in contents.split_inclusive('\n') {
        let leading = line.len() - line.trim_start().len();
        let trimmed = line.trim_start();
        if leading == indent && (trimmed.starts_with("- ") || trimmed == "-\n" || trimmed == "-") {
            item_starts.push(offset);
        }
        offset += line.len();
    }
    item_starts.push(contents.len());

    for window in item_starts.windows(2) {
        let (start, end) = (window[0], window[1]);
        let block = &contents[start..end];
        if block.lines().any(|line| is_name_line(line, pattern_name)) {
            return Some((start, end));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIBRARY: &str = r#"entries:
  # hand-tuned defaults, do not remove comments
  - name: join_hint
    priority: 50
    description: suggests index joins
  - name: subquery_flatten
    priority: 70
"#;

    #[test]
    fn reads_current_priority() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("patterns.yaml");
        std::fs::write(&file, LIBRARY).unwrap();
        assert_eq!(get_current_priority(&file, "join_hint").unwrap(), 50);
        assert_eq!(get_current_priority(&file, "subquery_flatten").unwrap(), 70);
    }

    #[test]
    fn missing_priority_defaults_to_fifty() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("patterns.yaml");
        std::fs::write(&file, "entries:\n  - name: no_priority\n    description: x\n").unwrap();
        assert_eq!(get_current_priority(&file, "no_priority").unwrap(), 50);
    }

    #[test]
    fn update_preserves_comments_and_other_entries() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("patterns.yaml");
        std::fs::write(&file, LIBRARY).unwrap();

        update_pattern_priority(&file, "join_hint", 65).unwrap();
        let updated = std::fs::read_to_string(&file).unwrap();

        assert!(updated.contains("# hand-tuned defaults, do not remove comments"));
        assert!(updated.contains("priority: 65"));
        assert!(updated.contains("priority: 70"));
        assert_eq!(get_current_priority(&file, "join_hint").unwrap(), 65);
        assert_eq!(get_current_priority(&file, "subquery_flatten").unwrap(), 70);
    }

    #[test]
    fn updating_to_current_value_is_byte_stable_under_reparse() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("patterns.yaml");
        std::fs::write(&file, LIBRARY).unwrap();

        update_pattern_priority(&file, "join_hint", 50).unwrap();
        let updated = std::fs::read_to_string(&file).unwrap();
        let before: serde_yaml::Value = serde_yaml::from_str(LIBRARY).unwrap();
        let after: serde_yaml::Value = serde_yaml::from_str(&updated).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn delta_halved_for_low_sample_patterns() {
        let (low, conf) = priority_delta(0.9, TuningStrategy::Moderate, 10);
        let (high, _) = priority_delta(0.9, TuningStrategy::Moderate, 500);
        assert_eq!(conf, TuningConfidence::Low);
        assert!(low.abs() < high.abs());
    }

    #[test]
    fn prefix_name_does_not_match_longer_entry_name() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("patterns.yaml");
        std::fs::write(&file, LIBRARY).unwrap();
        assert!(matches!(get_current_priority(&file, "join").unwrap_err(), LearningError::NotFound(_)));
        assert!(matches!(find_pattern_yaml_file(dir.path(), "join").unwrap_err(), LearningError::NotFound(_)));
    }

    #[test]
    fn nested_sequence_inside_entry_does_not_truncate_its_block() {
        let library = "entries:\n  - name: join_hint\n    tags:\n      - indexing\n      - join\n    priority: 77\n  - name: subquery_flatten\n    priority: 70\n";
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("patterns.yaml");
        std::fs::write(&file, library).unwrap();
        assert_eq!(get_current_priority(&file, "join_hint").unwrap(), 77);
        update_pattern_priority(&file, "join_hint", 80).unwrap();
        assert_eq!(get_current_priority(&file, "join_hint").unwrap(), 80);
        assert_eq!(get_current_priority(&file, "subquery_flatten").unwrap(), 70);
    }

    #[test]
    fn quality_weighted_tuning_orders_by_quality() {
        let (quality_heavy, _) = priority_delta(0.90, TuningStrategy::Moderate, 500);
        let (cost_heavy, _) = priority_delta(0.60, TuningStrategy::Moderate, 500);
        assert!(quality_heavy > cost_heavy);
    }
}
