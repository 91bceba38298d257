//! Append extra python / numpy constraints to existing recipes.
//!
//! Recipes coming from templates and feedstocks are jinja documents, not
//! plain YAML, so they are edited line by line instead of being parsed and
//! re-serialized. Comments, selectors and jinja expressions survive untouched.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

lazy_static::lazy_static! {
    static ref REQUIREMENTS_KEY: regex::Regex =
        regex::Regex::new(r"^requirements:\s*(#.*)?$").expect("valid regex");
}

/// The requirement sections that receive the extra constraints.
const SECTIONS: [&str; 2] = ["build", "run"];

/// The recipe files looked for, in order of preference.
const RECIPE_FILES: [&str; 2] = ["recipe.yaml", "meta.yaml"];

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn is_blank_or_comment(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

fn is_list_item(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed == "-" || trimmed.starts_with("- ")
}

/// First line after `start` that closes a mapping entry indented by `indent`.
fn block_end(lines: &[String], start: usize, indent: usize) -> usize {
    (start + 1..lines.len())
        .find(|&i| !is_blank_or_comment(&lines[i]) && indent_of(&lines[i]) <= indent)
        .unwrap_or(lines.len())
}

/// Like [`block_end`], but list items at the key's own indentation still
/// belong to the key (`build:\n- foo` is valid YAML).
fn list_end(lines: &[String], start: usize, indent: usize) -> usize {
    (start + 1..lines.len())
        .find(|&i| {
            let line = &lines[i];
            !is_blank_or_comment(line)
                && (indent_of(line) < indent || (indent_of(line) == indent && !is_list_item(line)))
        })
        .unwrap_or(lines.len())
}

/// Index just after the last line with content in `start..end`.
fn insertion_point(lines: &[String], start: usize, end: usize) -> usize {
    (start..end)
        .rev()
        .find(|&i| !lines[i].trim().is_empty())
        .map(|i| i + 1)
        .unwrap_or(start + 1)
}

fn strip_comment(value: &str) -> &str {
    match value.find(" #") {
        Some(pos) => value[..pos].trim(),
        None => value.trim(),
    }
}

fn inject_section(lines: &mut Vec<String>, requirements_idx: usize, section: &str, specs: &[String]) {
    let end = block_end(lines, requirements_idx, 0);
    let child_indent = lines[requirements_idx + 1..end]
        .iter()
        .find(|l| !is_blank_or_comment(l))
        .map(|l| indent_of(l))
        .unwrap_or(2);
    let key = format!("{section}:");

    let section_idx = (requirements_idx + 1..end).find(|&i| {
        indent_of(&lines[i]) == child_indent && lines[i].trim_start().starts_with(&key)
    });

    let Some(section_idx) = section_idx else {
        let insert_at = insertion_point(lines, requirements_idx, end);
        let mut new_lines = vec![format!("{}{}", " ".repeat(child_indent), key)];
        new_lines.extend(
            specs
                .iter()
                .map(|spec| format!("{}- {}", " ".repeat(child_indent + 2), spec)),
        );
        lines.splice(insert_at..insert_at, new_lines);
        return;
    };

    // `build: [a, b]` is rewritten as a block list
    let inline = strip_comment(&lines[section_idx].trim_start()[key.len()..]).to_string();
    let mut existing: Vec<String> = Vec::new();
    if let Some(flow) = inline.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
        existing.extend(
            flow.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty()),
        );
        lines[section_idx] = format!("{}{}", " ".repeat(child_indent), key);
        let items: Vec<String> = existing
            .iter()
            .map(|item| format!("{}- {}", " ".repeat(child_indent + 2), item))
            .collect();
        lines.splice(section_idx + 1..section_idx + 1, items);
    } else if !inline.is_empty() {
        tracing::warn!(
            "Not touching requirements.{} which is not a list: {}",
            section,
            inline
        );
        return;
    }

    let end = list_end(lines, section_idx, child_indent);
    let item_indent = lines[section_idx + 1..end]
        .iter()
        .find(|l| is_list_item(l))
        .map(|l| indent_of(l))
        .unwrap_or(child_indent + 2);
    existing.extend(
        lines[section_idx + 1..end]
            .iter()
            .filter(|l| is_list_item(l) && indent_of(l) == item_indent)
            .map(|l| strip_comment(l.trim_start().trim_start_matches('-')).to_string()),
    );

    let insert_at = insertion_point(lines, section_idx, end);
    let new_lines: Vec<String> = specs
        .iter()
        .filter(|spec| !existing.contains(spec))
        .map(|spec| format!("{}- {}", " ".repeat(item_indent), spec))
        .collect();
    lines.splice(insert_at..insert_at, new_lines);
}

/// Append `specs` to `requirements.build` and `requirements.run` of a recipe,
/// creating the sections if needed. Entries already present are kept and not
/// repeated.
pub fn inject_requirements(recipe: &str, specs: &[String]) -> String {
    if specs.is_empty() {
        return recipe.to_string();
    }

    let mut lines: Vec<String> = recipe.lines().map(str::to_string).collect();

    match lines.iter().position(|l| REQUIREMENTS_KEY.is_match(l)) {
        Some(requirements_idx) => {
            for section in SECTIONS {
                inject_section(&mut lines, requirements_idx, section, specs);
            }
        }
        None => {
            while lines.last().is_some_and(|l| l.trim().is_empty()) {
                lines.pop();
            }
            if !lines.is_empty() {
                lines.push(String::new());
            }
            lines.push("requirements:".to_string());
            for section in SECTIONS {
                lines.push(format!("  {section}:"));
                lines.extend(specs.iter().map(|spec| format!("    - {spec}")));
            }
        }
    }

    let mut result = lines.join("\n");
    result.push('\n');
    result
}

/// Inject into whichever recipe file a set of recipe files contains. Returns
/// the file that was changed.
pub fn inject_into_files(files: &mut BTreeMap<PathBuf, String>, specs: &[String]) -> Option<PathBuf> {
    if specs.is_empty() {
        return None;
    }
    let target = RECIPE_FILES
        .iter()
        .map(Path::new)
        .find(|name| files.contains_key(*name))?
        .to_path_buf();
    let contents = files.get_mut(&target)?;
    *contents = inject_requirements(contents, specs);
    Some(target)
}
