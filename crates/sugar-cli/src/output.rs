//! Output formatting for CLI
//!
//! Human-readable by default, JSON with `--json`, bare ids with `--quiet`.

use serde_json::Value;
use sugar_core::ManagedObject;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
    /// Minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print a JSON value on one line
    pub fn json(&self, value: Value) {
        println!("{}", value);
    }

    /// Print a single object
    pub fn print_object(&self, object: &ManagedObject) {
        match self.format {
            OutputFormat::Human => {
                println!("ID:     {}", object.id);
                println!("Entity: {}", object.entity);
                for (key, value) in &object.properties {
                    println!("  {}: {}", key, render_value(value));
                }
            }
            OutputFormat::Json => match serde_json::to_string_pretty(object) {
                Ok(text) => println!("{}", text),
                Err(e) => eprintln!("Failed to render object: {}", e),
            },
            OutputFormat::Quiet => println!("{}", object.id),
        }
    }

    /// Print the objects of one entity
    pub fn print_objects(&self, entity: &str, objects: &[ManagedObject]) {
        match self.format {
            OutputFormat::Human => {
                if objects.is_empty() {
                    println!("No {} objects found.", entity);
                    return;
                }
                for object in objects {
                    let summary: Vec<String> = object
                        .properties
                        .iter()
                        .map(|(key, value)| format!("{}={}", key, render_value(value)))
                        .collect();
                    println!(
                        "{} | {}",
                        object.id,
                        truncate(&summary.join(", "), 60)
                    );
                }
                println!("\n{} object(s)", objects.len());
            }
            OutputFormat::Json => match serde_json::to_string_pretty(objects) {
                Ok(text) => println!("{}", text),
                Err(e) => eprintln!("Failed to render objects: {}", e),
            },
            OutputFormat::Quiet => {
                for object in objects {
                    println!("{}", object.id);
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Check if we should prompt for confirmation
    pub fn should_prompt(&self) -> bool {
        self.format == OutputFormat::Human
    }
}

/// Strings print bare, everything else as JSON
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("ééééééééééé", 5), "éé...");
    }

    #[test]
    fn test_render_value() {
        assert_eq!(render_value(&json!("Ada")), "Ada");
        assert_eq!(render_value(&json!(36)), "36");
        assert_eq!(render_value(&json!(null)), "null");
    }
}
