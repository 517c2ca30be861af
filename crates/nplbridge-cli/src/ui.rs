//! Terminal output for the non-JSON commands.

use colored::Colorize;

pub fn error(msg: &str) {
    eprintln!("  {} {}", "\u{2718}".bright_red(), msg.bright_red());
}

pub fn ok(msg: &str) {
    println!("  {} {}", "\u{2714}".bright_green(), msg);
}

/// ">> Title (count)" header.
pub fn heading(title: &str, count: Option<usize>) {
    match count {
        Some(n) => println!("  {} {} {}", ">>".bright_cyan().bold(), title.bold(), format!("({n})").dimmed()),
        None => println!("  {} {}", ">>".bright_cyan().bold(), title.bold()),
    }
}

/// Aligned "label: value" row; `healthy` colors the value.
pub fn field(label: &str, value: &str, healthy: Option<bool>) {
    let label = format!("{label}:");
    match healthy {
        Some(true) => println!("    {label:<12}{}", value.bright_green()),
        Some(false) => println!("    {label:<12}{}", value.bright_yellow()),
        None => println!("    {label:<12}{value}"),
    }
}

/// One tool as `name(param: type, optional?: type)`.
pub fn tool_signature(name: &str, params: &[(String, String, bool)]) {
    let rendered: Vec<String> = params
        .iter()
        .map(|(param, ty, required)| {
            if *required {
                format!("{param}: {ty}")
            } else {
                format!("{}{}", param.dimmed(), format!("?: {ty}").dimmed())
            }
        })
        .collect();
    println!("    {}({})", name.bold(), rendered.join(", "));
}

pub fn hint(msg: &str) {
    println!("  {} {}", "hint:".dimmed(), msg.dimmed());
}
