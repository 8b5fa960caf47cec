//! Terminal output formatting with ANSI colors.

use colored::Colorize;
use serde_json::Value;

use crate::error::BridgeError;
use crate::schema::{ExecutableTool, ParamSpec, ToolSet};

/// Print every tool with its parameters.
pub fn print_tools(tools: &ToolSet) {
    if tools.is_empty() {
        println!("{}", "Tool server declared no capabilities.".yellow());
        return;
    }
    for tool in tools.iter() {
        print_tool(tool);
    }
    println!();
    println!("{}", format!("{} tool(s)", tools.len()).dimmed());
}

fn print_tool(tool: &ExecutableTool) {
    println!("{}", format!("→ {}", tool.name()).cyan().bold());
    if !tool.description().is_empty() {
        for line in tool.description().lines() {
            println!("  {}", line);
        }
    }
    for param in &tool.descriptor().parameters {
        println!("    {}", format_param(param));
    }
}

/// One-line parameter summary, e.g. `query: string (required)`.
pub fn format_param(param: &ParamSpec) -> String {
    let kind = param.kind.as_str().unwrap_or("any");
    let mut line = format!("{}: {}", param.name, kind);
    if param.required {
        line.push_str(" (required)");
    } else if let Some(default) = &param.default {
        line.push_str(&format!(" = {}", truncate(&default.to_string(), 40)));
    }
    if let Some(description) = &param.description {
        line.push_str(&format!("  {}", description.dimmed()));
    }
    line
}

/// Print the dispatched call line.
pub fn print_call(tool: &str, arguments: &Value) {
    println!(
        "{} {}",
        format!("→ {}", tool).cyan(),
        truncate(&arguments.to_string(), 120).dimmed()
    );
}

/// Print a successful tool result.
pub fn print_result(text: &str) {
    println!("{}", text);
    println!("{}", "✓ Done".green());
}

/// Print a failed call. Shows the first lines of the message.
pub fn print_tool_error(tool: &str, err: &BridgeError) {
    println!("{}", format!("✗ {} failed", tool).red());
    for line in err.to_string().lines().take(5) {
        println!("{}", line.red());
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", cut)
    } else {
        text.to_string()
    }
}
